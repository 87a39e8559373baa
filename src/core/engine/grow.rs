//! Post-write growth stages: partition expand and filesystem resize.
//!
//! Both stages are best-effort: a tool that is missing, exits non-zero or
//! finds nothing to grow produces a warning or a log line, never a job
//! failure. Only cancellation and stage timeouts are fatal here.

use std::sync::Arc;

use regex::Regex;
use tokio::process::Command;

use super::{run_tool, send_log, StageSender, ToolRun};
use crate::core::cancel::CancelToken;
use crate::core::inventory::{DriveProvider, Partition};
use crate::core::models::JobError;

const RESIZABLE_FILESYSTEMS: [&str; 3] = ["ext2", "ext3", "ext4"];

fn partition_number(name: &str) -> String {
    let re = Regex::new(r"(\d+)$").unwrap();
    re.captures(name)
        .map(|c| c[1].to_string())
        .unwrap_or_else(|| "1".to_string())
}

async fn first_partition(
    inventory: &Arc<dyn DriveProvider>,
    device_path: &str,
) -> Result<Option<Partition>, String> {
    inventory
        .partitions(device_path)
        .await
        .map(|parts| parts.into_iter().next())
        .map_err(|e| format!("partition listing failed: {e}"))
}

async fn log_output(tx: &StageSender, output: &std::process::Output) {
    for stream in [&output.stdout, &output.stderr] {
        let text = String::from_utf8_lossy(stream);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            send_log(tx, line).await;
        }
    }
}

pub(super) async fn expand(
    inventory: &Arc<dyn DriveProvider>,
    device_path: &str,
    tx: &StageSender,
    cancel: &CancelToken,
) -> Result<Option<String>, JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::cancelled());
    }

    let part = match first_partition(inventory, device_path).await {
        Ok(Some(part)) => part,
        Ok(None) => {
            send_log(tx, "no partitions found, nothing to grow").await;
            return Ok(None);
        }
        Err(warn) => return Ok(Some(warn)),
    };

    let part_num = partition_number(&part.name);
    send_log(tx, format!("$ growpart {device_path} {part_num}")).await;

    let mut command = Command::new("growpart");
    command.arg(device_path).arg(&part_num);
    let output = match run_tool(&mut command, cancel).await? {
        ToolRun::Finished(output) => output,
        ToolRun::Unavailable(e) if e.kind() == std::io::ErrorKind::NotFound => {
            send_log(tx, "growpart not found, skipping").await;
            return Ok(Some("growpart not available".to_string()));
        }
        ToolRun::Unavailable(e) => return Ok(Some(format!("growpart failed to start: {e}"))),
    };

    log_output(tx, &output).await;
    match output.status.code() {
        // 1 = NOCHANGE: the partition already fills the card.
        Some(0) | Some(1) => Ok(None),
        Some(code) => Ok(Some(format!("growpart exited with code {code}"))),
        None => Ok(Some("growpart terminated by signal".to_string())),
    }
}

pub(super) async fn resize(
    inventory: &Arc<dyn DriveProvider>,
    device_path: &str,
    tx: &StageSender,
    cancel: &CancelToken,
) -> Result<Option<String>, JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::cancelled());
    }

    let part = match first_partition(inventory, device_path).await {
        Ok(Some(part)) => part,
        Ok(None) => {
            send_log(tx, "no partitions found, nothing to resize").await;
            return Ok(None);
        }
        Err(warn) => return Ok(Some(warn)),
    };

    let fstype = part.fstype.as_deref().unwrap_or("");
    if !RESIZABLE_FILESYSTEMS.contains(&fstype) {
        send_log(
            tx,
            format!("filesystem is '{fstype}', resize2fs only handles ext2/3/4, skipping"),
        )
        .await;
        return Ok(None);
    }

    let part_dev = format!("/dev/{}", part.name);

    // resize2fs refuses to grow an unchecked filesystem.
    send_log(tx, format!("$ e2fsck -f -y {part_dev}")).await;
    let mut fsck = Command::new("e2fsck");
    fsck.args(["-f", "-y", &part_dev]);
    match run_tool(&mut fsck, cancel).await? {
        ToolRun::Finished(output) => log_output(tx, &output).await,
        ToolRun::Unavailable(e) => send_log(tx, format!("e2fsck unavailable: {e}")).await,
    }

    send_log(tx, format!("$ resize2fs {part_dev}")).await;
    let mut command = Command::new("resize2fs");
    command.arg(&part_dev);
    let output = match run_tool(&mut command, cancel).await? {
        ToolRun::Finished(output) => output,
        ToolRun::Unavailable(e) if e.kind() == std::io::ErrorKind::NotFound => {
            send_log(tx, "resize2fs not found, skipping").await;
            return Ok(Some("resize2fs not available".to_string()));
        }
        ToolRun::Unavailable(e) => return Ok(Some(format!("resize2fs failed to start: {e}"))),
    };

    log_output(tx, &output).await;
    match output.status.code() {
        Some(0) => Ok(None),
        Some(code) => Ok(Some(format!("resize2fs exited with code {code}"))),
        None => Ok(Some("resize2fs terminated by signal".to_string())),
    }
}
