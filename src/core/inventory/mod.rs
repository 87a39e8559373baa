//! Device inventory: block devices and the physical USB ports they sit in.
//!
//! The Linux implementation shells out to `lsblk`/`findmnt` and reads
//! `/dev/disk/by-path` and sysfs; the simulated implementation backs tests
//! and `--simulation` mode with an in-memory drive set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::core::events::EventBus;
use crate::core::models::{Drive, UsbSpeed};

mod linux;
mod simulated;

pub use linux::LinuxInventory;
pub use simulated::SimulatedInventory;

/// One `/dev/disk/by-path` entry, flat.
#[derive(Debug, Clone, Serialize)]
pub struct PortLink {
    pub port_path: String,
    pub device: String,
}

/// A deduplicated physical USB port with whatever drive currently sits in it.
#[derive(Debug, Clone, Serialize)]
pub struct PhysicalPort {
    pub port_path: String,
    pub alias: String,
    pub usb_speed: UsbSpeed,
    pub device_path: Option<String>,
    pub device_model: Option<String>,
    pub device_size: Option<String>,
    pub device_serial: Option<String>,
    pub device_vendor: Option<String>,
    pub removable: bool,
    pub is_system: bool,
    pub occupied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub name: String,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
}

/// Read-only view of the host's block devices. Every call returns a fresh
/// snapshot; implementations never cache across calls and never write.
#[async_trait]
pub trait DriveProvider: Send + Sync {
    async fn list_drives(&self, only_removable: bool) -> Result<Vec<Drive>>;
    async fn list_ports(&self) -> Result<Vec<PortLink>>;
    async fn list_physical_ports(&self) -> Result<Vec<PhysicalPort>>;
    async fn partitions(&self, device_path: &str) -> Result<Vec<Partition>>;
}

pub fn create_inventory(simulation: bool) -> Arc<dyn DriveProvider> {
    if simulation {
        Arc::new(SimulatedInventory::demo())
    } else {
        Arc::new(LinuxInventory)
    }
}

/// Poll the inventory and publish a `drive_change` event whenever the
/// snapshot differs from the previous one.
pub fn spawn_drive_watcher(
    inventory: Arc<dyn DriveProvider>,
    events: EventBus,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<Vec<Drive>> = None;
        loop {
            tokio::time::sleep(period).await;
            match inventory.list_drives(false).await {
                Ok(drives) => {
                    if last.as_ref() != Some(&drives) {
                        events.publish_drives(drives.clone());
                        last = Some(drives);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "drive poll failed"),
            }
        }
    })
}
