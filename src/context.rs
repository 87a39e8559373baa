use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::engine;
use crate::core::events::EventBus;
use crate::core::image::ImageCatalog;
use crate::core::inventory::{self, DriveProvider};
use crate::core::scheduler::Scheduler;
use crate::layout::LayoutStore;

/// How often the background watcher polls for drive changes.
const DRIVE_POLL_PERIOD: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub events: EventBus,
    pub inventory: Arc<dyn DriveProvider>,
    pub images: Arc<ImageCatalog>,
    pub layout: Arc<LayoutStore>,
    pub scheduler: Arc<Scheduler>,
}

impl AppContext {
    /// Wire the whole service together. Must run inside the tokio runtime;
    /// spawns the event-bus flusher and the drive watcher.
    pub fn new(config: AppConfig) -> Self {
        let events = EventBus::new();
        let inventory = inventory::create_inventory(config.simulation);
        let images = Arc::new(ImageCatalog::new(&config.images_dir));
        let layout = Arc::new(LayoutStore::new(&config.data_dir));
        let engine = engine::create_engine(config.simulation, inventory.clone());
        let scheduler = Scheduler::new(
            engine,
            images.clone(),
            inventory.clone(),
            layout.clone(),
            events.clone(),
            config.allow_non_removable,
        );

        let _watcher =
            inventory::spawn_drive_watcher(inventory.clone(), events.clone(), DRIVE_POLL_PERIOD);

        Self {
            config: Arc::new(config),
            events,
            inventory,
            images,
            layout,
            scheduler,
        }
    }
}
