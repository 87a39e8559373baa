//! Stage runners: supervised external-process invocations for each step of
//! the write / verify / expand / resize / eject pipeline.
//!
//! Runners emit raw progress counters and log lines over a channel and
//! leave ratio/speed/ETA derivation to the job pipeline. Cancellation is
//! cooperative: a runner observing its token terminates its child with
//! SIGTERM, escalating to SIGKILL after a short grace.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::core::cancel::CancelToken;
use crate::core::image::Image;
use crate::core::inventory::DriveProvider;
use crate::core::models::JobError;

mod dd;
mod eject;
mod grow;
mod simulated;
mod verify;

pub use dd::DdEngine;
pub use simulated::SimulatedEngine;

/// Grace between SIGTERM and SIGKILL when tearing a child down.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum StageEvent {
    Progress {
        bytes_done: u64,
        bytes_total: Option<u64>,
    },
    Log(String),
}

pub type StageSender = mpsc::Sender<StageEvent>;

/// What the write stage learned on the way through: the exact uncompressed
/// length and the image digest, cached for the verify stage.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub bytes_written: u64,
    pub digest: [u8; 32],
}

#[async_trait]
pub trait FlashEngine: Send + Sync {
    /// Stream the image onto the raw device.
    async fn write(
        &self,
        device_path: &str,
        image: &Image,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<WriteOutcome, JobError>;

    /// Read the written prefix back and compare against the cached digest.
    async fn verify(
        &self,
        device_path: &str,
        image: &Image,
        written: &WriteOutcome,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<(), JobError>;

    /// Grow the first partition. `Ok(Some(_))` is a non-fatal warning.
    async fn expand(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError>;

    /// Grow the filesystem on the first partition. `Ok(Some(_))` is a
    /// non-fatal warning.
    async fn resize(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError>;

    /// Power off / eject the device; degrades to unmount-only with a
    /// warning.
    async fn eject(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError>;

    /// Unmount all mounted partitions of the device. `Ok(Some(_))` is a
    /// non-fatal warning.
    async fn unmount(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError>;
}

pub fn create_engine(
    simulation: bool,
    inventory: Arc<dyn DriveProvider>,
) -> Arc<dyn FlashEngine> {
    if simulation {
        Arc::new(SimulatedEngine::default())
    } else {
        Arc::new(DdEngine::new(inventory))
    }
}

pub(crate) async fn send_log(tx: &StageSender, line: impl Into<String>) {
    let _ = tx.send(StageEvent::Log(line.into())).await;
}

/// How a supervised short-lived tool run ended.
pub(crate) enum ToolRun {
    Finished(std::process::Output),
    /// The tool could not be started or reaped.
    Unavailable(std::io::Error),
}

/// Run a short-lived tool to completion, collecting its output, while
/// `select!`ing on the cancel token: a cancel mid-run tears the child down
/// and surfaces as `Cancelled`.
pub(crate) async fn run_tool(
    command: &mut Command,
    cancel: &CancelToken,
) -> Result<ToolRun, JobError> {
    let mut child = match command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return Ok(ToolRun::Unavailable(e)),
    };
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            terminate_child(&mut child).await;
            return Err(JobError::cancelled());
        }
        status = child.wait() => match status {
            Ok(status) => status,
            Err(e) => return Ok(ToolRun::Unavailable(e)),
        },
    };

    let mut out = Vec::new();
    let mut err = Vec::new();
    if let Some(mut pipe) = stdout.take() {
        let _ = pipe.read_to_end(&mut out).await;
    }
    if let Some(mut pipe) = stderr.take() {
        let _ = pipe.read_to_end(&mut err).await;
    }
    Ok(ToolRun::Finished(std::process::Output {
        status,
        stdout: out,
        stderr: err,
    }))
}

/// SIGTERM the child, wait out the grace, then SIGKILL.
pub(crate) async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
