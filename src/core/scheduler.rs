//! Batch scheduler: the process-wide owner of the job table.
//!
//! Admission is strictly FIFO across the whole scheduler under a global
//! concurrency cap (the most recent batch's value). A queued job whose
//! target device is already being written is skipped over until the device
//! frees up; a cell with a live job cannot be re-queued at all.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::cancel::CancelToken;
use crate::core::engine::{FlashEngine, StageEvent};
use crate::core::events::EventBus;
use crate::core::image::ImageCatalog;
use crate::core::inventory::DriveProvider;
use crate::core::job::{self, PipelineCtx};
use crate::core::models::{
    Batch, BatchOptions, BatchStartRequest, Drive, ErrorKind, Job, JobError, JobSnapshot,
    JobStage, JobState,
};
use crate::core::safety;
use crate::layout::LayoutStore;

#[derive(Debug)]
pub enum SchedulerError {
    CellBusy(String),
    JobNotFound,
    NotCancellable,
    NotRetryable,
    Internal(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::CellBusy(cell) => {
                write!(f, "cell '{cell}' already has a job in flight")
            }
            SchedulerError::JobNotFound => write!(f, "job not found"),
            SchedulerError::NotCancellable => write!(f, "job not found or already finished"),
            SchedulerError::NotRetryable => write!(f, "job is not in a retryable state"),
            SchedulerError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// All live jobs, mutated only through the methods below so the transition
/// graph and terminal-state immutability hold everywhere. Snapshots are
/// taken inside the lock and published after releasing it.
#[derive(Clone)]
pub struct JobTable {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    events: EventBus,
}

impl JobTable {
    pub fn new(events: EventBus) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    pub async fn insert(&self, job: Job) {
        let snapshot = job.snapshot(false);
        self.jobs.write().await.insert(job.job_id.clone(), job);
        self.events.publish_update(snapshot);
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn snapshot(&self, job_id: &str, with_log: bool) -> Option<JobSnapshot> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .map(|job| job.snapshot(with_log))
    }

    pub async fn snapshots(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<&Job> = jobs.values().collect();
        all.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        all.into_iter().map(|job| job.snapshot(false)).collect()
    }

    /// Apply a state transition if the graph allows it. Sets the stage tag,
    /// resets progress to the stage baseline and stamps timestamps.
    pub async fn transition(&self, job_id: &str, next: JobState) -> bool {
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return false;
            };
            if !job.state.can_transition_to(next) {
                warn!(
                    job_id = %job_id,
                    from = ?job.state,
                    to = ?next,
                    "transition not allowed, ignoring"
                );
                return false;
            }
            job.state = next;
            job.speed_bps = None;
            job.eta_seconds = None;
            match next {
                JobState::Writing => {
                    job.stage = JobStage::Write;
                    job.progress = 0.0;
                    job.started_at = Some(Utc::now());
                }
                JobState::Verifying => {
                    job.stage = JobStage::Verify;
                    job.progress = 0.0;
                }
                JobState::Expanding => {
                    job.stage = JobStage::Expand;
                    job.progress = 0.0;
                }
                JobState::Resizing => {
                    job.stage = JobStage::Resize;
                    job.progress = 0.0;
                }
                JobState::Done => {
                    job.progress = 1.0;
                    job.ended_at = Some(Utc::now());
                }
                // CANCELLED keeps the progress it reached.
                JobState::Cancelled => {
                    job.ended_at = Some(Utc::now());
                }
                JobState::Failed | JobState::Queued => {
                    job.ended_at = Some(Utc::now());
                }
            }
            job.snapshot(false)
        };
        self.events.publish_update(snapshot);
        true
    }

    pub async fn fail(&self, job_id: &str, error: JobError) {
        let line = format!("ERROR: {error}");
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if !job.state.can_transition_to(JobState::Failed) {
                return;
            }
            job.state = JobState::Failed;
            job.error = Some(error);
            job.speed_bps = None;
            job.eta_seconds = None;
            job.ended_at = Some(Utc::now());
            job.push_log(line.clone());
            job.snapshot(false)
        };
        self.events.log(job_id, &line);
        self.events.publish_update(snapshot);
    }

    pub async fn warn(&self, job_id: &str, message: &str) {
        let line = format!("WARN: {message}");
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.state.is_terminal() {
                return;
            }
            job.append_warning(message);
            job.push_log(line.clone());
            job.snapshot(false)
        };
        self.events.log(job_id, &line);
        self.events.publish_update(snapshot);
    }

    /// Progress is monotonic within a stage: a stale or smaller ratio never
    /// rewinds the bar.
    pub async fn progress(&self, job_id: &str, ratio: f64, speed: Option<f64>, eta: Option<f64>) {
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.state.is_terminal() {
                return;
            }
            job.progress = job.progress.max(ratio.clamp(0.0, 1.0));
            job.speed_bps = speed;
            job.eta_seconds = eta;
            job.snapshot(false)
        };
        self.events.publish_update(snapshot);
    }

    pub async fn set_stage(&self, job_id: &str, stage: JobStage) {
        let snapshot = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            if job.state.is_terminal() {
                return;
            }
            job.stage = stage;
            job.snapshot(false)
        };
        self.events.publish_update(snapshot);
    }

    /// The log ring is the one field that may still grow on a terminal job.
    pub async fn append_log(&self, job_id: &str, line: &str) {
        {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(job_id) else {
                return;
            };
            job.push_log(line);
        }
        self.events.log(job_id, line);
    }
}

struct SchedState {
    queue: VecDeque<String>,
    /// job_id -> device_path of admitted jobs.
    running: HashMap<String, String>,
    /// Cancel tokens for every non-terminal job.
    tokens: HashMap<String, CancelToken>,
    /// job_id -> device_path for queued and running jobs.
    device_of: HashMap<String, String>,
    /// cell_id -> job_id of its non-terminal job.
    active_cells: HashMap<String, String>,
    /// Terminal jobs that already spawned a retry. Their records stay for
    /// history but `retry_failed` must not pick them up again.
    retired: HashSet<String>,
    limit: usize,
}

pub struct Scheduler {
    table: JobTable,
    engine: Arc<dyn FlashEngine>,
    images: Arc<ImageCatalog>,
    inventory: Arc<dyn DriveProvider>,
    layout: Arc<LayoutStore>,
    allow_non_removable: bool,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<dyn FlashEngine>,
        images: Arc<ImageCatalog>,
        inventory: Arc<dyn DriveProvider>,
        layout: Arc<LayoutStore>,
        events: EventBus,
        allow_non_removable: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: JobTable::new(events),
            engine,
            images,
            inventory,
            layout,
            allow_non_removable,
            state: Mutex::new(SchedState {
                queue: VecDeque::new(),
                running: HashMap::new(),
                tokens: HashMap::new(),
                device_of: HashMap::new(),
                active_cells: HashMap::new(),
                retired: HashSet::new(),
                limit: 1,
            }),
        })
    }

    pub fn table(&self) -> &JobTable {
        &self.table
    }

    /// Create one job per eligible cell and start admitting. The whole
    /// request is rejected when any named cell still has a live job;
    /// unknown and disabled cells are skipped.
    pub async fn start_batch(
        self: &Arc<Self>,
        req: BatchStartRequest,
    ) -> Result<Vec<JobSnapshot>, SchedulerError> {
        let layout = self
            .layout
            .load()
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let drives = self
            .inventory
            .list_drives(false)
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;

        let mut drive_by_key: HashMap<&str, &Drive> = HashMap::new();
        for drive in &drives {
            drive_by_key.insert(drive.device_path.as_str(), drive);
            if let Some(by_path) = &drive.by_path {
                drive_by_key.insert(by_path.as_str(), drive);
            }
        }

        let mut state = self.state.lock().await;
        for cell_id in &req.cell_ids {
            if state.active_cells.contains_key(cell_id) {
                return Err(SchedulerError::CellBusy(cell_id.clone()));
            }
        }
        state.limit = req.concurrency.max(1);

        let mut job_ids = Vec::new();
        for cell_id in &req.cell_ids {
            let Some(cell) = layout.cells.iter().find(|c| &c.cell_id == cell_id) else {
                continue;
            };
            if !cell.enabled {
                continue;
            }
            if state.active_cells.contains_key(cell_id) {
                continue;
            }
            let drive = if cell.port_path.is_empty() {
                None
            } else {
                drive_by_key.get(cell.port_path.as_str()).copied()
            };
            let job_id = self
                .admit(
                    &mut state,
                    cell_id,
                    drive,
                    &cell.port_path,
                    &req.image_name,
                    req.options,
                )
                .await;
            job_ids.push(job_id);
        }

        let batch = Batch {
            batch_id: Uuid::now_v7().to_string(),
            image_name: req.image_name.clone(),
            job_ids: job_ids.clone(),
            concurrency_limit: state.limit,
        };
        info!(
            batch_id = %batch.batch_id,
            image = %batch.image_name,
            jobs = batch.job_ids.len(),
            limit = batch.concurrency_limit,
            "batch admitted"
        );

        self.pump(&mut state).await;
        drop(state);

        let mut out = Vec::new();
        for job_id in &job_ids {
            if let Some(snap) = self.table.snapshot(job_id, false).await {
                out.push(snap);
            }
        }
        Ok(out)
    }

    /// Create a job for a cell. A preflight rejection inserts the job
    /// directly as FAILED without queueing it.
    async fn admit(
        &self,
        state: &mut SchedState,
        cell_id: &str,
        drive: Option<&Drive>,
        fallback_device: &str,
        image_name: &str,
        options: BatchOptions,
    ) -> String {
        let device_path = drive
            .map(|d| d.device_path.clone())
            .unwrap_or_else(|| fallback_device.to_string());
        let device_size = drive.map(|d| d.size_bytes).unwrap_or(0);
        let job_id = Uuid::now_v7().to_string();
        let mut job = Job::new(
            job_id.clone(),
            cell_id.to_string(),
            device_path.clone(),
            device_size,
            image_name.to_string(),
            options,
        );

        if let Err(rejection) = safety::check_drive(drive, self.allow_non_removable, false) {
            warn!(cell = cell_id, device = %device_path, %rejection, "preflight rejected");
            job.state = JobState::Failed;
            job.error = Some(JobError::new(
                ErrorKind::PreflightRejected,
                rejection.to_string(),
            ));
            job.ended_at = Some(Utc::now());
            job.push_log(format!("ERROR: preflight: {rejection}"));
            self.table.insert(job).await;
            return job_id;
        }

        self.table.insert(job).await;
        state.tokens.insert(job_id.clone(), CancelToken::new());
        state.device_of.insert(job_id.clone(), device_path);
        state
            .active_cells
            .insert(cell_id.to_string(), job_id.clone());
        state.queue.push_back(job_id.clone());
        job_id
    }

    /// Admit queued jobs while slots are free, skipping over jobs whose
    /// device is still being written by an earlier job. The transition to
    /// WRITING happens here, under the lock, so admissions are observed in
    /// strict FIFO order.
    fn pump<'a>(
        self: &'a Arc<Self>,
        state: &'a mut SchedState,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
        loop {
            if state.running.len() >= state.limit {
                break;
            }
            let busy: HashSet<String> = state.running.values().cloned().collect();
            let Some(pos) = state.queue.iter().position(|id| {
                state
                    .device_of
                    .get(id)
                    .map(|device| !busy.contains(device))
                    .unwrap_or(true)
            }) else {
                break;
            };
            let Some(job_id) = state.queue.remove(pos) else {
                break;
            };
            let Some(token) = state.tokens.get(&job_id).cloned() else {
                continue;
            };
            if token.is_cancelled() {
                continue;
            }
            let device = state.device_of.get(&job_id).cloned().unwrap_or_default();
            state.running.insert(job_id.clone(), device);
            self.table.transition(&job_id, JobState::Writing).await;

            let sched = Arc::clone(self);
            tokio::spawn(async move {
                let ctx = PipelineCtx {
                    table: sched.table.clone(),
                    engine: sched.engine.clone(),
                    images: sched.images.clone(),
                    inventory: sched.inventory.clone(),
                    allow_non_removable: sched.allow_non_removable,
                };
                job::run(ctx, job_id.clone(), token).await;
                sched.on_finished(&job_id).await;
            });
        }
        })
    }

    async fn on_finished(self: &Arc<Self>, job_id: &str) {
        // A pipeline always ends terminal; if it somehow did not, the slot
        // must not leak.
        if let Some(job) = self.table.get(job_id).await {
            if !job.state.is_terminal() {
                self.table
                    .fail(
                        job_id,
                        JobError::new(
                            ErrorKind::Internal,
                            "pipeline ended without a terminal state",
                        ),
                    )
                    .await;
            }
        }
        let mut state = self.state.lock().await;
        state.running.remove(job_id);
        state.tokens.remove(job_id);
        state.device_of.remove(job_id);
        state
            .active_cells
            .retain(|_, v| v.as_str() != job_id);
        self.pump(&mut state).await;
    }

    /// Cancel one job. Queued jobs go terminal immediately; running jobs
    /// are signalled and transition as their runner tears down.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job = self
            .table
            .get(job_id)
            .await
            .ok_or(SchedulerError::JobNotFound)?;
        if job.state.is_terminal() {
            return Err(SchedulerError::NotCancellable);
        }

        let was_queued = {
            let mut state = self.state.lock().await;
            if let Some(token) = state.tokens.get(job_id) {
                token.cancel();
            }
            if let Some(pos) = state.queue.iter().position(|id| id == job_id) {
                state.queue.remove(pos);
                state.tokens.remove(job_id);
                state.device_of.remove(job_id);
                state.active_cells.retain(|_, v| v.as_str() != job_id);
                true
            } else {
                false
            }
        };
        if was_queued {
            self.table.transition(job_id, JobState::Cancelled).await;
        }
        Ok(())
    }

    /// Signal every non-terminal job; does not wait for teardown.
    pub async fn cancel_all(&self) {
        let queued: Vec<String> = {
            let mut state = self.state.lock().await;
            for token in state.tokens.values() {
                token.cancel();
            }
            let queued: Vec<String> = state.queue.drain(..).collect();
            for job_id in &queued {
                state.tokens.remove(job_id);
                state.device_of.remove(job_id);
                state
                    .active_cells
                    .retain(|_, v| v.as_str() != job_id.as_str());
            }
            queued
        };
        for job_id in &queued {
            self.table.transition(job_id, JobState::Cancelled).await;
        }
        info!(cancelled_queued = queued.len(), "cancel-all issued");
    }

    /// A retry is a fresh job: new id, same cell, image and options. The
    /// device is re-resolved from the cell binding because cards re-enumerate
    /// between attempts. The old record stays for history.
    pub async fn retry_job(self: &Arc<Self>, job_id: &str) -> Result<JobSnapshot, SchedulerError> {
        let old = self
            .table
            .get(job_id)
            .await
            .ok_or(SchedulerError::JobNotFound)?;
        if !matches!(old.state, JobState::Failed | JobState::Cancelled) {
            return Err(SchedulerError::NotRetryable);
        }

        let layout = self
            .layout
            .load()
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let drives = self
            .inventory
            .list_drives(false)
            .await
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        let cell_port = layout
            .cells
            .iter()
            .find(|c| c.cell_id == old.cell_id)
            .map(|c| c.port_path.clone());

        let mut state = self.state.lock().await;
        if state.active_cells.contains_key(&old.cell_id) {
            return Err(SchedulerError::CellBusy(old.cell_id.clone()));
        }

        let (drive, fallback) = match &cell_port {
            Some(port) if !port.is_empty() => (
                drives.iter().find(|d| {
                    d.by_path.as_deref() == Some(port.as_str()) || d.device_path == *port
                }),
                port.clone(),
            ),
            _ => (
                drives.iter().find(|d| d.device_path == old.device_path),
                old.device_path.clone(),
            ),
        };

        let new_id = self
            .admit(
                &mut state,
                &old.cell_id,
                drive,
                &fallback,
                &old.image_name,
                old.options,
            )
            .await;
        state.retired.insert(old.job_id.clone());
        self.pump(&mut state).await;
        drop(state);

        self.table
            .snapshot(&new_id, false)
            .await
            .ok_or(SchedulerError::JobNotFound)
    }

    /// Retry every FAILED job that has not already spawned a retry;
    /// CANCELLED jobs are left alone.
    pub async fn retry_failed(self: &Arc<Self>) -> Vec<JobSnapshot> {
        let retired: HashSet<String> = self.state.lock().await.retired.clone();
        let failed: Vec<String> = self
            .table
            .snapshots()
            .await
            .into_iter()
            .filter(|snap| snap.state == JobState::Failed && !retired.contains(&snap.job_id))
            .map(|snap| snap.job_id)
            .collect();

        let mut retried = Vec::new();
        for job_id in failed {
            match self.retry_job(&job_id).await {
                Ok(snap) => retried.push(snap),
                Err(e) => debug!(job_id = %job_id, error = %e, "retry skipped"),
            }
        }
        retried
    }

    /// Eject the drive currently bound to a cell, outside any job.
    pub async fn eject_cell(&self, cell_id: &str) -> Result<(), String> {
        let layout = self.layout.load().map_err(|e| e.to_string())?;
        let cell = layout
            .cells
            .iter()
            .find(|c| c.cell_id == cell_id)
            .ok_or_else(|| "cell not found".to_string())?;
        if cell.port_path.is_empty() {
            return Err("no port bound to this cell".to_string());
        }
        let drives = self
            .inventory
            .list_drives(false)
            .await
            .map_err(|e| e.to_string())?;
        let drive = drives
            .iter()
            .find(|d| {
                d.by_path.as_deref() == Some(cell.port_path.as_str())
                    || d.device_path == cell.port_path
            })
            .ok_or_else(|| "device not connected".to_string())?;

        let (tx, mut rx) = mpsc::channel(64);
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let StageEvent::Log(line) = event {
                    debug!(%line, "eject");
                }
            }
        });
        // No job token here; the request runs to completion on its own.
        let result = self
            .engine
            .eject(&drive.device_path, tx, &CancelToken::new())
            .await;
        let _ = drain.await;

        match result {
            Ok(None) => Ok(()),
            Ok(Some(warning)) => Err(warning),
            Err(e) => Err(e.to_string()),
        }
    }
}
