//! Per-job pipeline execution: drives one job through
//! write → verify → expand → resize → eject under the state machine,
//! pumping runner events into the job table.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use crate::core::cancel::CancelToken;
use crate::core::engine::{FlashEngine, StageEvent, StageSender};
use crate::core::image::ImageCatalog;
use crate::core::inventory::DriveProvider;
use crate::core::models::{ErrorKind, JobError, JobStage, JobState};
use crate::core::progress::SpeedEstimator;
use crate::core::safety;
use crate::core::scheduler::JobTable;
use crate::logging::LogThrottle;

const SHORT_STAGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Throughput floor used to scale the bulk-stage timeout with image size.
const MIN_EXPECTED_BPS: u64 = 4 * 1024 * 1024;

/// 30 minutes, stretched for images a slow card cannot absorb in that
/// time at 4 MiB/s.
fn bulk_stage_timeout(total_hint: u64) -> Duration {
    Duration::from_secs(1800.max(total_hint / MIN_EXPECTED_BPS))
}

pub(crate) struct PipelineCtx {
    pub table: JobTable,
    pub engine: Arc<dyn FlashEngine>,
    pub images: Arc<ImageCatalog>,
    pub inventory: Arc<dyn DriveProvider>,
    pub allow_non_removable: bool,
}

pub(crate) async fn run(ctx: PipelineCtx, job_id: String, cancel: CancelToken) {
    let span = info_span!("job", job_id = %job_id);
    run_inner(ctx, job_id, cancel).instrument(span).await;
}

/// The scheduler has already moved the job to WRITING when this runs.
async fn run_inner(ctx: PipelineCtx, job_id: String, cancel: CancelToken) {
    let Some(job) = ctx.table.get(&job_id).await else {
        return;
    };
    if cancel.is_cancelled() {
        ctx.table.transition(&job_id, JobState::Cancelled).await;
        return;
    }

    let image = match ctx.images.resolve(&job.image_name) {
        Ok(image) => image,
        Err(e) => {
            ctx.table.fail(&job_id, e).await;
            return;
        }
    };

    let device = job.device_path.clone();
    let device_size = job.device_size_bytes;
    let options = job.options;
    info!(device = %device, image = %image.name, "job started");

    // Fresh cards are usually auto-mounted; release them before the gate
    // re-checks mount state.
    let engine = &ctx.engine;
    let dev = device.as_str();
    let cancel_ref = &cancel;
    let unmount_result = run_stage(
        &ctx.table,
        &job_id,
        device_size,
        SHORT_STAGE_TIMEOUT,
        |tx| async move {
            if let Some(warning) = engine.unmount(dev, tx.clone(), cancel_ref).await? {
                let _ = tx
                    .send(StageEvent::Log(format!("warning: unmount: {warning}")))
                    .await;
            }
            Ok::<(), JobError>(())
        },
    )
    .await;
    if let Err(e) = unmount_result {
        conclude(&ctx.table, &job_id, e).await;
        return;
    }

    if let Err(e) = gate(&ctx, &device).await {
        ctx.table.fail(&job_id, e).await;
        return;
    }

    let write_timeout = bulk_stage_timeout(image.uncompressed_len().unwrap_or(device_size));
    let written = match run_stage(&ctx.table, &job_id, device_size, write_timeout, |tx| {
        ctx.engine.write(&device, &image, tx, &cancel)
    })
    .await
    {
        Ok(written) => written,
        Err(e) => {
            conclude(&ctx.table, &job_id, e).await;
            return;
        }
    };
    if cancelled(&ctx, &job_id, &cancel).await {
        return;
    }

    if options.verify {
        if let Err(e) = gate(&ctx, &device).await {
            ctx.table.fail(&job_id, e).await;
            return;
        }
        if !ctx.table.transition(&job_id, JobState::Verifying).await {
            return;
        }
        let verify_timeout = bulk_stage_timeout(written.bytes_written);
        let result = run_stage(&ctx.table, &job_id, device_size, verify_timeout, |tx| {
            ctx.engine.verify(&device, &image, &written, tx, &cancel)
        })
        .await;
        if let Err(e) = result {
            conclude(&ctx.table, &job_id, e).await;
            return;
        }
        if cancelled(&ctx, &job_id, &cancel).await {
            return;
        }
    }

    if options.expand_partition {
        if let Err(e) = gate(&ctx, &device).await {
            ctx.table.fail(&job_id, e).await;
            return;
        }
        if !ctx.table.transition(&job_id, JobState::Expanding).await {
            return;
        }
        match run_stage(&ctx.table, &job_id, device_size, SHORT_STAGE_TIMEOUT, |tx| {
            ctx.engine.expand(&device, tx, &cancel)
        })
        .await
        {
            Ok(None) => {}
            Ok(Some(warning)) => {
                warn!(%warning, "expand finished with warning");
                ctx.table.warn(&job_id, &warning).await;
            }
            Err(e) => {
                conclude(&ctx.table, &job_id, e).await;
                return;
            }
        }
        if cancelled(&ctx, &job_id, &cancel).await {
            return;
        }
    }

    if options.resize_filesystem {
        if let Err(e) = gate(&ctx, &device).await {
            ctx.table.fail(&job_id, e).await;
            return;
        }
        if !ctx.table.transition(&job_id, JobState::Resizing).await {
            return;
        }
        match run_stage(&ctx.table, &job_id, device_size, SHORT_STAGE_TIMEOUT, |tx| {
            ctx.engine.resize(&device, tx, &cancel)
        })
        .await
        {
            Ok(None) => {}
            Ok(Some(warning)) => {
                warn!(%warning, "resize finished with warning");
                ctx.table.warn(&job_id, &warning).await;
            }
            Err(e) => {
                conclude(&ctx.table, &job_id, e).await;
                return;
            }
        }
        if cancelled(&ctx, &job_id, &cancel).await {
            return;
        }
    }

    if options.eject_after_done {
        if cancelled(&ctx, &job_id, &cancel).await {
            return;
        }
        ctx.table.set_stage(&job_id, JobStage::Eject).await;
        match run_stage(&ctx.table, &job_id, device_size, SHORT_STAGE_TIMEOUT, |tx| {
            ctx.engine.eject(&device, tx, &cancel)
        })
        .await
        {
            Ok(None) => {}
            Ok(Some(warning)) => {
                warn!(%warning, "eject finished with warning");
                ctx.table.warn(&job_id, &warning).await;
            }
            Err(e) => {
                conclude(&ctx.table, &job_id, e).await;
                return;
            }
        }
    }

    ctx.table.transition(&job_id, JobState::Done).await;
    info!("job done");
}

async fn gate(ctx: &PipelineCtx, device: &str) -> Result<(), JobError> {
    safety::verify_writable(&ctx.inventory, device, ctx.allow_non_removable, true)
        .await
        .map_err(|rejection| {
            JobError::new(ErrorKind::DeviceStateChanged, rejection.to_string())
        })
}

async fn cancelled(ctx: &PipelineCtx, job_id: &str, cancel: &CancelToken) -> bool {
    if cancel.is_cancelled() {
        ctx.table.transition(job_id, JobState::Cancelled).await;
        return true;
    }
    false
}

async fn conclude(table: &JobTable, job_id: &str, err: JobError) {
    if err.kind == ErrorKind::Cancelled {
        table.transition(job_id, JobState::Cancelled).await;
    } else {
        table.fail(job_id, err).await;
    }
}

/// Run one stage with its event pump and wall-clock limit. Raw byte
/// counters from the runner become progress ratio, EMA speed and ETA here;
/// when the total is unknown the device capacity serves as a rough scale
/// and no ETA is produced.
async fn run_stage<T, Fut, F>(
    table: &JobTable,
    job_id: &str,
    device_size: u64,
    limit: Duration,
    make: F,
) -> Result<T, JobError>
where
    F: FnOnce(StageSender) -> Fut,
    Fut: Future<Output = Result<T, JobError>>,
{
    let (tx, mut rx) = mpsc::channel::<StageEvent>(64);

    let pump_table = table.clone();
    let pump_job = job_id.to_string();
    let pump = tokio::spawn(async move {
        let mut estimator = SpeedEstimator::new();
        let throttle = LogThrottle::new(Duration::from_millis(500));
        while let Some(event) = rx.recv().await {
            match event {
                StageEvent::Progress {
                    bytes_done,
                    bytes_total,
                } => {
                    let ratio = match bytes_total {
                        Some(total) if total > 0 => (bytes_done as f64 / total as f64).min(1.0),
                        _ if device_size > 0 => {
                            (bytes_done as f64 / device_size as f64).min(0.99)
                        }
                        _ => 0.0,
                    };
                    let speed = estimator.observe(bytes_done);
                    let eta = bytes_total
                        .and_then(|total| estimator.eta_seconds(total.saturating_sub(bytes_done)));
                    if throttle.should_log() {
                        tracing::debug!(job_id = %pump_job, progress = ratio, "stage progress");
                    }
                    pump_table.progress(&pump_job, ratio, speed, eta).await;
                }
                StageEvent::Log(line) => pump_table.append_log(&pump_job, &line).await,
            }
        }
    });

    let result = match tokio::time::timeout(limit, make(tx)).await {
        Ok(result) => result,
        // The dropped stage future tears its child down via kill_on_drop.
        Err(_) => Err(JobError::new(
            ErrorKind::StageTimeout,
            format!("stage exceeded {}s", limit.as_secs()),
        )),
    };
    let _ = pump.await;
    result
}
