//! Safety gate: the last line of defence before a destructive stage.

use std::sync::Arc;

use crate::core::inventory::DriveProvider;
use crate::core::models::Drive;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Missing,
    SystemDevice,
    NotRemovable,
    Mounted(Vec<String>),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Missing => write!(f, "device not found / not connected"),
            Rejection::SystemDevice => write!(f, "device hosts the system/root filesystem"),
            Rejection::NotRemovable => write!(f, "device is not removable"),
            Rejection::Mounted(mps) => write!(f, "device has mounted partitions: {}", mps.join(", ")),
        }
    }
}

/// Checks performed against a drive snapshot. `require_unmounted` is false
/// only at creation-time preflight, where an auto-mounted card is still
/// acceptable because the pipeline unmounts before writing.
pub fn check_drive(
    drive: Option<&Drive>,
    allow_non_removable: bool,
    require_unmounted: bool,
) -> Result<(), Rejection> {
    let Some(drive) = drive else {
        return Err(Rejection::Missing);
    };
    if drive.is_system {
        return Err(Rejection::SystemDevice);
    }
    if !drive.removable && !allow_non_removable {
        return Err(Rejection::NotRemovable);
    }
    if require_unmounted && drive.mounted {
        return Err(Rejection::Mounted(drive.mountpoints.clone()));
    }
    Ok(())
}

/// Re-resolve the device from a fresh inventory snapshot and gate it.
pub async fn verify_writable(
    inventory: &Arc<dyn DriveProvider>,
    device_path: &str,
    allow_non_removable: bool,
    require_unmounted: bool,
) -> Result<(), Rejection> {
    let drives = inventory
        .list_drives(false)
        .await
        .map_err(|_| Rejection::Missing)?;
    let drive = drives.iter().find(|d| d.device_path == device_path);
    check_drive(drive, allow_non_removable, require_unmounted)
}
