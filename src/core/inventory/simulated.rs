//! In-memory inventory for tests and `--simulation` mode.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{DriveProvider, Partition, PhysicalPort, PortLink};
use crate::core::models::{Drive, UsbSpeed};
use crate::core::progress::human_size;

pub struct SimulatedInventory {
    drives: RwLock<Vec<Drive>>,
}

impl SimulatedInventory {
    pub fn new() -> Self {
        Self {
            drives: RwLock::new(Vec::new()),
        }
    }

    /// Eight empty-looking 16 GB sticks on ports `sim-usb-0:1..8`.
    pub fn demo() -> Self {
        let inv = Self::new();
        for i in 1..=8u8 {
            inv.insert(Self::removable(
                &format!("/dev/sim{}", (b'a' + i - 1) as char),
                &format!("sim-usb-0:{i}"),
                16 << 30,
            ));
        }
        inv
    }

    pub fn insert(&self, drive: Drive) {
        let mut drives = self.drives.write().expect("drive lock");
        drives.retain(|d| d.device_path != drive.device_path);
        drives.push(drive);
    }

    pub fn remove(&self, device_path: &str) {
        self.drives
            .write()
            .expect("drive lock")
            .retain(|d| d.device_path != device_path);
    }

    pub fn removable(device_path: &str, by_path: &str, size_bytes: u64) -> Drive {
        Drive {
            device_path: device_path.to_string(),
            by_path: Some(by_path.to_string()),
            model: Some("Simulated Stick".to_string()),
            serial: Some(format!("SIM-{}", by_path)),
            vendor: Some("flashd".to_string()),
            size_bytes,
            size_human: human_size(size_bytes),
            removable: true,
            mounted: false,
            mountpoints: Vec::new(),
            usb_speed: UsbSpeed::Usb3,
            is_system: false,
        }
    }

    pub fn system(device_path: &str, by_path: &str) -> Drive {
        Drive {
            is_system: true,
            removable: false,
            mounted: true,
            mountpoints: vec!["/".to_string()],
            ..Self::removable(device_path, by_path, 512 << 30)
        }
    }
}

impl Default for SimulatedInventory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriveProvider for SimulatedInventory {
    async fn list_drives(&self, only_removable: bool) -> Result<Vec<Drive>> {
        let drives = self.drives.read().expect("drive lock").clone();
        Ok(drives
            .into_iter()
            .filter(|d| !only_removable || d.removable)
            .collect())
    }

    async fn list_ports(&self) -> Result<Vec<PortLink>> {
        let drives = self.drives.read().expect("drive lock");
        Ok(drives
            .iter()
            .filter_map(|d| {
                d.by_path.as_ref().map(|p| PortLink {
                    port_path: p.clone(),
                    device: d.device_path.clone(),
                })
            })
            .collect())
    }

    async fn list_physical_ports(&self) -> Result<Vec<PhysicalPort>> {
        let drives = self.drives.read().expect("drive lock");
        Ok(drives
            .iter()
            .filter_map(|d| {
                let port_path = d.by_path.clone()?;
                Some(PhysicalPort {
                    alias: port_path.clone(),
                    usb_speed: d.usb_speed,
                    device_path: Some(d.device_path.clone()),
                    device_model: d.model.clone(),
                    device_size: Some(d.size_human.clone()),
                    device_serial: d.serial.clone(),
                    device_vendor: d.vendor.clone(),
                    removable: d.removable,
                    is_system: d.is_system,
                    occupied: true,
                    port_path,
                })
            })
            .collect())
    }

    async fn partitions(&self, _device_path: &str) -> Result<Vec<Partition>> {
        Ok(Vec::new())
    }
}
