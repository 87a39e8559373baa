use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the HTTP surface binds to.
    pub listen: SocketAddr,
    /// Directory scanned for flashable images.
    pub images_dir: PathBuf,
    /// Directory holding `layout.json`.
    pub data_dir: PathBuf,
    /// Run against the simulated engine and inventory instead of hardware.
    pub simulation: bool,
    /// Permit writing to devices not flagged removable.
    pub allow_non_removable: bool,
    pub verbose: bool,
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".parse().expect("static socket addr"),
            images_dir: PathBuf::from("images"),
            data_dir: PathBuf::from("data"),
            simulation: false,
            allow_non_removable: false,
            verbose: false,
            log_json: false,
        }
    }
}
