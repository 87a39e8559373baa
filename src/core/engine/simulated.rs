//! Scripted engine: drives the full pipeline without touching hardware.
//!
//! Backs `--simulation` mode and the integration tests, which configure
//! failure injection and read the call counters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{send_log, FlashEngine, StageEvent, StageSender, WriteOutcome};
use crate::core::cancel::CancelToken;
use crate::core::image::Image;
use crate::core::models::{ErrorKind, JobError};

pub struct SimulatedEngine {
    /// Pretend image size when the real length is unknown.
    pub total_bytes: u64,
    pub steps: u32,
    pub step_delay: Duration,
    /// How long the fake eject lingers, for cancellation tests.
    pub eject_delay: Duration,
    /// Each write call fails while this is non-zero (then decrements), so a
    /// retry can succeed.
    pub fail_write_times: AtomicUsize,
    pub verify_mismatch_at: Option<u64>,
    pub expand_fails: bool,
    pub resize_fails: bool,
    pub eject_fails: bool,
    pub write_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub expand_calls: AtomicUsize,
    pub resize_calls: AtomicUsize,
    pub eject_calls: AtomicUsize,
    pub unmount_calls: AtomicUsize,
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self {
            total_bytes: 64 << 20,
            steps: 16,
            step_delay: Duration::from_millis(5),
            eject_delay: Duration::ZERO,
            fail_write_times: AtomicUsize::new(0),
            verify_mismatch_at: None,
            expand_fails: false,
            resize_fails: false,
            eject_fails: false,
            write_calls: AtomicUsize::new(0),
            verify_calls: AtomicUsize::new(0),
            expand_calls: AtomicUsize::new(0),
            resize_calls: AtomicUsize::new(0),
            eject_calls: AtomicUsize::new(0),
            unmount_calls: AtomicUsize::new(0),
        }
    }
}

impl SimulatedEngine {
    async fn sweep(
        &self,
        total: u64,
        tx: &StageSender,
        cancel: &CancelToken,
    ) -> Result<(), JobError> {
        for step in 1..=self.steps {
            tokio::select! {
                _ = cancel.cancelled() => return Err(JobError::cancelled()),
                _ = tokio::time::sleep(self.step_delay) => {}
            }
            let _ = tx
                .send(StageEvent::Progress {
                    bytes_done: total * step as u64 / self.steps as u64,
                    bytes_total: Some(total),
                })
                .await;
        }
        Ok(())
    }
}

#[async_trait]
impl FlashEngine for SimulatedEngine {
    async fn write(
        &self,
        device_path: &str,
        image: &Image,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<WriteOutcome, JobError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let total = image.uncompressed_len().unwrap_or(self.total_bytes);
        send_log(
            &tx,
            format!("simulated write: {} -> {device_path}", image.name),
        )
        .await;

        self.sweep(total, &tx, cancel).await?;

        let remaining = self.fail_write_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_write_times.store(remaining - 1, Ordering::SeqCst);
            send_log(&tx, "simulated dd failure").await;
            return Err(JobError::new(
                ErrorKind::WriteIoError,
                "dd exited with code 1: simulated failure",
            ));
        }

        send_log(&tx, format!("wrote {total} bytes")).await;
        Ok(WriteOutcome {
            bytes_written: total,
            digest: *blake3::hash(image.name.as_bytes()).as_bytes(),
        })
    }

    async fn verify(
        &self,
        _device_path: &str,
        _image: &Image,
        written: &WriteOutcome,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<(), JobError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.sweep(written.bytes_written, &tx, cancel).await?;

        if let Some(offset) = self.verify_mismatch_at {
            send_log(&tx, format!("verify mismatch at byte offset {offset}")).await;
            return Err(JobError::new(
                ErrorKind::VerifyMismatch,
                format!("device content differs from image at offset {offset}"),
            ));
        }
        send_log(&tx, "verify OK").await;
        Ok(())
    }

    async fn expand(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        self.expand_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }
        send_log(&tx, format!("$ growpart {device_path} 1")).await;
        if self.expand_fails {
            Ok(Some("growpart exited with code 2".to_string()))
        } else {
            Ok(None)
        }
    }

    async fn resize(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }
        send_log(&tx, format!("$ resize2fs {device_path}1")).await;
        if self.resize_fails {
            Ok(Some("resize2fs exited with code 1".to_string()))
        } else {
            Ok(None)
        }
    }

    async fn eject(
        &self,
        device_path: &str,
        tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        self.eject_calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::cancelled()),
            _ = tokio::time::sleep(self.eject_delay) => {}
        }
        send_log(&tx, format!("$ udisksctl power-off -b {device_path}")).await;
        if self.eject_fails {
            Ok(Some(
                "eject failed (simulated), device left unmounted only".to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    async fn unmount(
        &self,
        _device_path: &str,
        _tx: StageSender,
        cancel: &CancelToken,
    ) -> Result<Option<String>, JobError> {
        self.unmount_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(JobError::cancelled());
        }
        Ok(None)
    }
}
