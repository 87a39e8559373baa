//! Event fan-out to SSE subscribers.
//!
//! Built on a broadcast channel: every subscriber gets its own bounded
//! buffer, the oldest event is dropped when a subscriber lags, and
//! publishing never waits. A lagging subscriber learns how many events it
//! lost and can resync from the REST endpoints.
//!
//! Log lines are noisy, so they are coalesced: lines for the same job that
//! arrive within one flush window travel as a single `job_log` event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::core::models::{Drive, JobSnapshot};

/// Events buffered per subscriber before the oldest is dropped.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Window over which `job_log` lines for one job are merged.
pub const LOG_COALESCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub enum Event {
    JobUpdate(JobSnapshot),
    JobLog { job_id: String, lines: Vec<String> },
    DriveChange(Vec<Drive>),
}

impl Event {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobUpdate(_) => "job_update",
            Event::JobLog { .. } => "job_log",
            Event::DriveChange(_) => "drive_change",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Event::JobUpdate(snap) => serde_json::to_value(snap).unwrap_or(Value::Null),
            Event::JobLog { job_id, lines } => json!({ "job_id": job_id, "lines": lines }),
            Event::DriveChange(drives) => json!({ "drives": drives }),
        }
    }
}

/// What a subscriber pulls next: a live event, or notice that `n` events
/// were dropped while it lagged.
#[derive(Debug)]
pub enum Delivery {
    Event(Event),
    Lagged(u64),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    pending_logs: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl EventBus {
    /// Create the bus and start its log-flush task. Must be called inside a
    /// tokio runtime.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let pending_logs: Arc<Mutex<HashMap<String, Vec<String>>>> = Arc::default();

        let flush_tx = tx.clone();
        let weak: Weak<Mutex<HashMap<String, Vec<String>>>> = Arc::downgrade(&pending_logs);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LOG_COALESCE_WINDOW);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(pending) = weak.upgrade() else {
                    break;
                };
                let drained: Vec<(String, Vec<String>)> = {
                    let mut map = pending.lock().expect("pending log lock");
                    map.drain().collect()
                };
                for (job_id, lines) in drained {
                    let _ = flush_tx.send(Event::JobLog { job_id, lines });
                }
            }
        });

        Self { tx, pending_logs }
    }

    pub fn publish(&self, event: Event) {
        // send() only fails when there are no subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    pub fn publish_update(&self, snapshot: JobSnapshot) {
        self.publish(Event::JobUpdate(snapshot));
    }

    pub fn publish_drives(&self, drives: Vec<Drive>) {
        self.publish(Event::DriveChange(drives));
    }

    /// Queue a log line; it reaches subscribers on the next flush tick,
    /// merged with any other lines for the same job.
    pub fn log(&self, job_id: &str, line: &str) {
        let mut map = self.pending_logs.lock().expect("pending log lock");
        map.entry(job_id.to_string())
            .or_default()
            .push(line.to_string());
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Next delivery, or `None` once the bus is gone.
    pub async fn next(&mut self) -> Option<Delivery> {
        match self.rx.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(n)) => Some(Delivery::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
