//! Unmount and eject: release the media so the operator can pull it.

use std::sync::Arc;

use tokio::process::Command;

use super::{run_tool, send_log, StageSender, ToolRun};
use crate::core::cancel::CancelToken;
use crate::core::inventory::DriveProvider;
use crate::core::models::JobError;

pub(super) async fn unmount(
    inventory: &Arc<dyn DriveProvider>,
    device_path: &str,
    tx: &StageSender,
    cancel: &CancelToken,
) -> Result<Option<String>, JobError> {
    let parts = match inventory.partitions(device_path).await {
        Ok(parts) => parts,
        Err(e) => return Ok(Some(format!("partition listing failed: {e}"))),
    };

    let mut failures = Vec::new();
    for part in parts.iter().filter(|p| p.mountpoint.is_some()) {
        let part_dev = format!("/dev/{}", part.name);
        send_log(tx, format!("$ umount {part_dev}")).await;
        let mut command = Command::new("umount");
        command.arg(&part_dev);
        match run_tool(&mut command, cancel).await? {
            ToolRun::Finished(output) if output.status.success() => {}
            ToolRun::Finished(output) => failures.push(format!(
                "{part_dev}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            ToolRun::Unavailable(e) => failures.push(format!("{part_dev}: {e}")),
        }
    }

    if failures.is_empty() {
        Ok(None)
    } else {
        Ok(Some(failures.join("; ")))
    }
}

/// Power the device off. Falls back from `udisksctl power-off` to `eject`;
/// if both fail the device is left merely unmounted and the caller gets a
/// warning to attach.
pub(super) async fn eject(
    inventory: &Arc<dyn DriveProvider>,
    device_path: &str,
    tx: &StageSender,
    cancel: &CancelToken,
) -> Result<Option<String>, JobError> {
    let unmount_warning = unmount(inventory, device_path, tx, cancel)
        .await?
        .map(|w| format!("unmount: {w}"));

    send_log(
        tx,
        format!("$ udisksctl power-off -b {device_path} --no-user-interaction"),
    )
    .await;
    let mut power_off = Command::new("udisksctl");
    power_off.args(["power-off", "-b", device_path, "--no-user-interaction"]);
    let power_off_error = match run_tool(&mut power_off, cancel).await? {
        ToolRun::Finished(output) if output.status.success() => {
            send_log(tx, "device powered off").await;
            return Ok(unmount_warning);
        }
        ToolRun::Finished(output) => format!(
            "udisksctl: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        ToolRun::Unavailable(e) => format!("udisksctl: {e}"),
    };

    send_log(tx, format!("$ eject {device_path}")).await;
    let mut fallback = Command::new("eject");
    fallback.arg(device_path);
    match run_tool(&mut fallback, cancel).await? {
        ToolRun::Finished(output) if output.status.success() => {
            send_log(tx, "device ejected").await;
            Ok(unmount_warning)
        }
        ToolRun::Finished(output) => Ok(Some(join_warnings(
            unmount_warning,
            format!(
                "eject failed ({power_off_error}; {}), device left unmounted only",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ))),
        ToolRun::Unavailable(e) => Ok(Some(join_warnings(
            unmount_warning,
            format!("eject failed ({power_off_error}; {e}), device left unmounted only"),
        ))),
    }
}

fn join_warnings(first: Option<String>, second: String) -> String {
    match first {
        Some(first) => format!("{first}; {second}"),
        None => second,
    }
}
