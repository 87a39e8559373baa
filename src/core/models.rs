//! Core data model: jobs, batches, drives and the error taxonomy.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::progress::{human_eta, human_speed};

/// Lines of subprocess output retained per job.
pub const LOG_TAIL_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Writing,
    Verifying,
    Expanding,
    Resizing,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    /// States that count against the concurrency limit.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            JobState::Writing | JobState::Verifying | JobState::Expanding | JobState::Resizing
        )
    }

    /// The allowed transition graph. Terminal states are sinks; FAILED and
    /// CANCELLED are reachable from any non-terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Queued, Writing) => true,
            (Writing, Verifying | Expanding | Resizing | Done) => true,
            (Verifying, Expanding | Resizing | Done) => true,
            (Expanding, Resizing | Done) => true,
            (Resizing, Done) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Write,
    Verify,
    Expand,
    Resize,
    Eject,
}

/// Stable, wire-visible error kinds. Exit codes and offsets travel in the
/// accompanying message, not in the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PreflightRejected,
    DeviceStateChanged,
    ImageNotFound,
    ImageReadError,
    #[serde(rename = "WriteIOError")]
    WriteIoError,
    VerifyMismatch,
    #[serde(rename = "VerifyIOError")]
    VerifyIoError,
    StageTimeout,
    Cancelled,
    SubprocessExit,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PreflightRejected => "PreflightRejected",
            ErrorKind::DeviceStateChanged => "DeviceStateChanged",
            ErrorKind::ImageNotFound => "ImageNotFound",
            ErrorKind::ImageReadError => "ImageReadError",
            ErrorKind::WriteIoError => "WriteIOError",
            ErrorKind::VerifyMismatch => "VerifyMismatch",
            ErrorKind::VerifyIoError => "VerifyIOError",
            ErrorKind::StageTimeout => "StageTimeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::SubprocessExit => "SubprocessExit",
            ErrorKind::Internal => "Internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by operator")
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Per-batch pipeline options. The key set is closed: unknown keys are a
/// request error, not an extension point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchOptions {
    pub verify: bool,
    pub expand_partition: bool,
    pub resize_filesystem: bool,
    pub eject_after_done: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchStartRequest {
    pub image_name: String,
    pub cell_ids: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub options: BatchOptions,
}

fn default_concurrency() -> usize {
    1
}

/// Ephemeral admission record; jobs outlive it.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub batch_id: String,
    pub image_name: String,
    pub job_ids: Vec<String>,
    pub concurrency_limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbSpeed {
    #[serde(rename = "2.0")]
    Usb2,
    #[serde(rename = "3.0")]
    Usb3,
    #[serde(rename = "3.2")]
    Usb32,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Default for UsbSpeed {
    fn default() -> Self {
        UsbSpeed::Unknown
    }
}

/// Point-in-time snapshot of one block device. Recomputed on demand,
/// never cached across calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Drive {
    pub device_path: String,
    pub by_path: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub vendor: Option<String>,
    pub size_bytes: u64,
    pub size_human: String,
    pub removable: bool,
    pub mounted: bool,
    pub mountpoints: Vec<String>,
    pub usb_speed: UsbSpeed,
    pub is_system: bool,
}

/// The central entity: one flash pipeline bound to one cell and one device.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub cell_id: String,
    pub device_path: String,
    pub device_size_bytes: u64,
    pub image_name: String,
    pub options: BatchOptions,
    pub state: JobState,
    pub stage: JobStage,
    pub progress: f64,
    pub speed_bps: Option<f64>,
    pub eta_seconds: Option<f64>,
    pub error: Option<JobError>,
    pub warning: Option<String>,
    pub log_tail: VecDeque<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        job_id: String,
        cell_id: String,
        device_path: String,
        device_size_bytes: u64,
        image_name: String,
        options: BatchOptions,
    ) -> Self {
        Self {
            job_id,
            cell_id,
            device_path,
            device_size_bytes,
            image_name,
            options,
            state: JobState::Queued,
            stage: JobStage::Write,
            progress: 0.0,
            speed_bps: None,
            eta_seconds: None,
            error: None,
            warning: None,
            log_tail: VecDeque::new(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        if self.log_tail.len() >= LOG_TAIL_CAPACITY {
            self.log_tail.pop_front();
        }
        self.log_tail.push_back(line.into());
    }

    pub fn append_warning(&mut self, message: &str) {
        match &mut self.warning {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(message);
            }
            None => self.warning = Some(message.to_string()),
        }
    }

    pub fn snapshot(&self, with_log: bool) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            cell_id: self.cell_id.clone(),
            device_path: self.device_path.clone(),
            image_name: self.image_name.clone(),
            options: self.options,
            state: self.state,
            stage: self.stage,
            progress: (self.progress * 10_000.0).round() / 10_000.0,
            speed_bps: self.speed_bps,
            speed_human: self.speed_bps.map(human_speed),
            eta_seconds: self.eta_seconds,
            eta_human: Some(human_eta(self.eta_seconds)),
            error: self.error.clone(),
            warning: self.warning.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            log_tail: if with_log {
                Some(self.log_tail.iter().cloned().collect())
            } else {
                None
            },
        }
    }
}

/// Wire form of a job, with human-friendly duplicates. `log_tail` is only
/// present on the single-job endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub cell_id: String,
    pub device_path: String,
    pub image_name: String,
    pub options: BatchOptions,
    pub state: JobState,
    pub stage: JobStage,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_human: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_human: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_tail: Option<Vec<String>>,
}
