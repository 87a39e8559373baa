//! End-to-end scheduler and pipeline behaviour over the simulated engine
//! and inventory.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::time::timeout;

use flashd::core::engine::{FlashEngine, SimulatedEngine};
use flashd::core::events::{Delivery, Event, EventBus, EventStream};
use flashd::core::image::ImageCatalog;
use flashd::core::inventory::{DriveProvider, SimulatedInventory};
use flashd::core::models::{
    BatchOptions, BatchStartRequest, ErrorKind, JobSnapshot, JobStage, JobState,
};
use flashd::core::scheduler::{Scheduler, SchedulerError};
use flashd::layout::{LayoutConfig, LayoutStore, PortCell};
use flashd::core::models::UsbSpeed;

const TEST_IMAGE: &str = "test.img";
const TEST_IMAGE_BYTES: usize = 1 << 20;

struct Harness {
    _dirs: TempDir,
    scheduler: Arc<Scheduler>,
    engine: Arc<SimulatedEngine>,
    inventory: Arc<SimulatedInventory>,
    layout: Arc<LayoutStore>,
    events: EventBus,
}

fn cell(id: &str, port: &str) -> PortCell {
    PortCell {
        cell_id: id.to_string(),
        label: id.to_string(),
        port_path: port.to_string(),
        usb_hint: UsbSpeed::Unknown,
        enabled: true,
    }
}

/// Scheduler over `cells` simulated sticks on ports `sim-usb-0:1..n`,
/// cells named `C1..Cn`.
async fn harness(engine: SimulatedEngine, cells: usize) -> Harness {
    let dirs = TempDir::new().unwrap();
    let images_dir = dirs.path().join("images");
    std::fs::create_dir_all(&images_dir).unwrap();
    std::fs::write(images_dir.join(TEST_IMAGE), vec![0xabu8; TEST_IMAGE_BYTES]).unwrap();

    let layout = Arc::new(LayoutStore::new(dirs.path().join("data")));
    let mut grid = LayoutConfig::default_grid();
    grid.cells = (1..=cells)
        .map(|i| cell(&format!("C{i}"), &format!("sim-usb-0:{i}")))
        .collect();
    layout.save(&grid).unwrap();

    let inventory = Arc::new(SimulatedInventory::new());
    for i in 1..=cells {
        inventory.insert(SimulatedInventory::removable(
            &format!("/dev/sim{}", (b'a' + i as u8 - 1) as char),
            &format!("sim-usb-0:{i}"),
            16 << 30,
        ));
    }

    let engine = Arc::new(engine);
    let events = EventBus::new();
    let dyn_engine: Arc<dyn FlashEngine> = engine.clone();
    let dyn_inventory: Arc<dyn DriveProvider> = inventory.clone();
    let scheduler = Scheduler::new(
        dyn_engine,
        Arc::new(ImageCatalog::new(&images_dir)),
        dyn_inventory,
        layout.clone(),
        events.clone(),
        false,
    );

    Harness {
        _dirs: dirs,
        scheduler,
        engine,
        inventory,
        layout,
        events,
    }
}

fn batch_request(cells: &[&str], concurrency: usize, options: BatchOptions) -> BatchStartRequest {
    BatchStartRequest {
        image_name: TEST_IMAGE.to_string(),
        cell_ids: cells.iter().map(|c| c.to_string()).collect(),
        concurrency,
        options,
    }
}

async fn wait_terminal(harness: &Harness, job_id: &str) -> JobSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snap = harness
            .scheduler
            .table()
            .snapshot(job_id, false)
            .await
            .expect("job exists");
        if snap.state.is_terminal() {
            return snap;
        }
        assert!(Instant::now() < deadline, "job {job_id} never went terminal");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pull `job_update` events until every listed job is terminal; returns the
/// updates in delivery order.
async fn updates_until_terminal(
    stream: &mut EventStream,
    job_ids: &HashSet<String>,
) -> Vec<JobSnapshot> {
    let mut updates = Vec::new();
    let mut terminal: HashSet<String> = HashSet::new();
    while terminal.len() < job_ids.len() {
        let delivery = timeout(Duration::from_secs(10), stream.next())
            .await
            .expect("event stream stalled")
            .expect("event bus closed");
        if let Delivery::Event(Event::JobUpdate(snap)) = delivery {
            if !job_ids.contains(&snap.job_id) {
                continue;
            }
            if snap.state.is_terminal() {
                terminal.insert(snap.job_id.clone());
            }
            updates.push(snap);
        }
    }
    updates
}

fn state_sequence(updates: &[JobSnapshot], job_id: &str) -> Vec<JobState> {
    let mut seq = Vec::new();
    for snap in updates.iter().filter(|s| s.job_id == job_id) {
        if seq.last() != Some(&snap.state) {
            seq.push(snap.state);
        }
    }
    seq
}

// ── Scenarios ───────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_path_single_cell() {
    let h = harness(SimulatedEngine::default(), 1).await;
    let mut stream = h.events.subscribe();

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                verify: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    let job_id = jobs[0].job_id.clone();

    let done = wait_terminal(&h, &job_id).await;
    assert_eq!(done.state, JobState::Done);
    assert_eq!(done.progress, 1.0);
    assert!(done.error.is_none());
    assert!(done.warning.is_none());

    let updates =
        updates_until_terminal(&mut stream, &HashSet::from([job_id.clone()])).await;
    assert_eq!(
        state_sequence(&updates, &job_id),
        vec![
            JobState::Queued,
            JobState::Writing,
            JobState::Verifying,
            JobState::Done
        ]
    );
    assert_eq!(h.engine.write_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.verify_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.expand_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrency_cap_and_fifo_admission() {
    let engine = SimulatedEngine {
        steps: 10,
        step_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(engine, 5).await;
    let mut stream = h.events.subscribe();

    let cells = ["C1", "C2", "C3", "C4", "C5"];
    let jobs = h
        .scheduler
        .start_batch(batch_request(&cells, 2, BatchOptions::default()))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 5);
    let ids: HashSet<String> = jobs.iter().map(|j| j.job_id.clone()).collect();

    let updates = updates_until_terminal(&mut stream, &ids).await;

    // Replay the update stream: never more than 2 jobs in a running state.
    let mut state_of: HashMap<String, JobState> = HashMap::new();
    let mut max_running = 0usize;
    for snap in &updates {
        state_of.insert(snap.job_id.clone(), snap.state);
        let running = state_of.values().filter(|s| s.is_running()).count();
        max_running = max_running.max(running);
    }
    assert!(max_running <= 2, "observed {max_running} concurrent jobs");

    // Admission follows the requested cell order.
    let mut writing_order = Vec::new();
    for snap in &updates {
        if snap.state == JobState::Writing && !writing_order.contains(&snap.cell_id) {
            writing_order.push(snap.cell_id.clone());
        }
    }
    assert_eq!(writing_order, cells);

    for job in &jobs {
        assert_eq!(wait_terminal(&h, &job.job_id).await.state, JobState::Done);
    }
}

#[tokio::test]
async fn preflight_rejects_system_device_without_starting_a_runner() {
    let h = harness(SimulatedEngine::default(), 1).await;
    h.inventory.remove("/dev/sima");
    h.inventory
        .insert(SimulatedInventory::system("/dev/sysdisk", "sim-usb-0:1"));

    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1"], 1, BatchOptions::default()))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);

    let snap = &jobs[0];
    assert_eq!(snap.state, JobState::Failed);
    let error = snap.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::PreflightRejected);
    assert_eq!(h.engine.write_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.engine.unmount_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn mounted_device_that_stays_mounted_fails_the_pre_write_gate() {
    let h = harness(SimulatedEngine::default(), 1).await;

    // An auto-mounted card passes creation preflight; the simulated engine's
    // unmount is a no-op here, so the gate ahead of the write stage trips.
    let mut drive = SimulatedInventory::removable("/dev/sima", "sim-usb-0:1", 16 << 30);
    drive.mounted = true;
    drive.mountpoints = vec!["/media/usb0".to_string()];
    h.inventory.insert(drive);

    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1"], 1, BatchOptions::default()))
        .await
        .unwrap();
    let snap = wait_terminal(&h, &jobs[0].job_id).await;

    assert_eq!(snap.state, JobState::Failed);
    assert_eq!(
        snap.error.as_ref().unwrap().kind,
        ErrorKind::DeviceStateChanged
    );
    assert_eq!(h.engine.write_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn verify_mismatch_fails_with_offset_in_log() {
    let mismatch_offset = 100u64 << 20;
    let engine = SimulatedEngine {
        verify_mismatch_at: Some(mismatch_offset),
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                verify: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let snap = wait_terminal(&h, &jobs[0].job_id).await;

    assert_eq!(snap.state, JobState::Failed);
    let error = snap.error.unwrap();
    assert_eq!(error.kind, ErrorKind::VerifyMismatch);
    assert!(snap.warning.is_none());

    let with_log = h
        .scheduler
        .table()
        .snapshot(&jobs[0].job_id, true)
        .await
        .unwrap();
    let log = with_log.log_tail.unwrap();
    assert!(
        log.iter().any(|l| l.contains(&mismatch_offset.to_string())),
        "log should contain the mismatch offset: {log:?}"
    );
}

#[tokio::test]
async fn expand_warning_does_not_stop_resize() {
    let engine = SimulatedEngine {
        expand_fails: true,
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                verify: true,
                expand_partition: true,
                resize_filesystem: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let snap = wait_terminal(&h, &jobs[0].job_id).await;

    assert_eq!(snap.state, JobState::Done);
    assert!(snap.error.is_none());
    assert!(snap.warning.as_deref().unwrap().contains("growpart"));
    assert_eq!(h.engine.resize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancel_all_tears_everything_down_within_bound() {
    let engine = SimulatedEngine {
        steps: 200,
        step_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let h = harness(engine, 3).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1", "C2", "C3"],
            2,
            BatchOptions::default(),
        ))
        .await
        .unwrap();

    // Wait until both slots are actually writing.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let writing = h
            .scheduler
            .table()
            .snapshots()
            .await
            .iter()
            .filter(|s| s.state == JobState::Writing)
            .count();
        if writing == 2 {
            break;
        }
        assert!(Instant::now() < deadline, "writers never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    h.scheduler.cancel_all().await;
    for job in &jobs {
        let snap = wait_terminal(&h, &job.job_id).await;
        assert_eq!(snap.state, JobState::Cancelled, "job {}", job.cell_id);
    }
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "teardown took {:?}",
        started.elapsed()
    );

    // The queued third job never reached a runner.
    assert_eq!(h.engine.write_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cancelling_a_queued_job_skips_the_runner() {
    let engine = SimulatedEngine {
        steps: 50,
        step_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(engine, 2).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1", "C2"], 1, BatchOptions::default()))
        .await
        .unwrap();
    let queued = jobs[1].job_id.clone();

    h.scheduler.cancel_job(&queued).await.unwrap();
    let snap = wait_terminal(&h, &queued).await;
    assert_eq!(snap.state, JobState::Cancelled);

    // The first job is unaffected and completes.
    assert_eq!(wait_terminal(&h, &jobs[0].job_id).await.state, JobState::Done);
    assert_eq!(h.engine.write_calls.load(Ordering::SeqCst), 1);

    // A terminal job cannot be cancelled again.
    assert!(matches!(
        h.scheduler.cancel_job(&queued).await,
        Err(SchedulerError::NotCancellable)
    ));
}

#[tokio::test]
async fn requeueing_a_busy_cell_is_rejected_whole() {
    let engine = SimulatedEngine {
        steps: 100,
        step_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(engine, 2).await;

    let first = h
        .scheduler
        .start_batch(batch_request(&["C1"], 1, BatchOptions::default()))
        .await
        .unwrap();

    // C1 is still in flight: the whole second batch bounces, C2 included.
    let err = h
        .scheduler
        .start_batch(batch_request(&["C2", "C1"], 1, BatchOptions::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::CellBusy(ref cell) if cell == "C1"));
    assert_eq!(h.scheduler.table().snapshots().await.len(), 1);

    h.scheduler.cancel_all().await;
    wait_terminal(&h, &first[0].job_id).await;
}

#[tokio::test]
async fn two_cells_on_one_device_never_run_concurrently() {
    let engine = SimulatedEngine {
        steps: 20,
        step_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    // A second cell bound directly to the first stick's device node.
    let mut grid = h.layout.load().unwrap();
    grid.cells.push(cell("C2", "/dev/sima"));
    h.layout.save(&grid).unwrap();

    let mut stream = h.events.subscribe();
    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1", "C2"], 2, BatchOptions::default()))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].device_path, jobs[1].device_path);

    let ids: HashSet<String> = jobs.iter().map(|j| j.job_id.clone()).collect();
    let updates = updates_until_terminal(&mut stream, &ids).await;

    let mut state_of: HashMap<String, JobState> = HashMap::new();
    for snap in &updates {
        state_of.insert(snap.job_id.clone(), snap.state);
        let running = state_of.values().filter(|s| s.is_running()).count();
        assert!(running <= 1, "same-device jobs overlapped");
    }
    for job in &jobs {
        assert_eq!(wait_terminal(&h, &job.job_id).await.state, JobState::Done);
    }
}

#[tokio::test]
async fn retry_failed_reruns_only_failed_jobs() {
    let engine = SimulatedEngine {
        fail_write_times: AtomicUsize::new(1),
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1"], 1, BatchOptions::default()))
        .await
        .unwrap();
    let failed = wait_terminal(&h, &jobs[0].job_id).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::WriteIoError);

    let retried = h.scheduler.retry_failed().await;
    assert_eq!(retried.len(), 1);
    assert_ne!(retried[0].job_id, jobs[0].job_id);

    let snap = wait_terminal(&h, &retried[0].job_id).await;
    assert_eq!(snap.state, JobState::Done);

    // The failed record is preserved for history.
    let all = h.scheduler.table().snapshots().await;
    assert_eq!(all.len(), 2);
    assert!(all.iter().any(|s| s.state == JobState::Failed));

    // Nothing left to retry.
    assert!(h.scheduler.retry_failed().await.is_empty());
}

#[tokio::test]
async fn cancelled_jobs_are_not_auto_retried() {
    let engine = SimulatedEngine {
        steps: 100,
        step_delay: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1"], 1, BatchOptions::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.scheduler.cancel_all().await;
    let snap = wait_terminal(&h, &jobs[0].job_id).await;
    assert_eq!(snap.state, JobState::Cancelled);

    assert!(h.scheduler.retry_failed().await.is_empty());
}

#[tokio::test]
async fn double_retry_is_equivalent_to_single_retry_modulo_id() {
    let engine = SimulatedEngine {
        fail_write_times: AtomicUsize::new(3),
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                verify: true,
                eject_after_done: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    wait_terminal(&h, &jobs[0].job_id).await;

    let first = h.scheduler.retry_job(&jobs[0].job_id).await.unwrap();
    let first = wait_terminal(&h, &first.job_id).await;
    assert_eq!(first.state, JobState::Failed);

    let second = h.scheduler.retry_job(&first.job_id).await.unwrap();
    let second = wait_terminal(&h, &second.job_id).await;

    assert_ne!(first.job_id, second.job_id);
    assert_eq!(first.cell_id, second.cell_id);
    assert_eq!(first.image_name, second.image_name);
    assert_eq!(first.options, second.options);
    assert_eq!(first.device_path, second.device_path);
}

#[tokio::test]
async fn batch_with_zero_eligible_cells_changes_nothing() {
    let h = harness(SimulatedEngine::default(), 1).await;

    // Unknown cell plus a disabled one.
    let mut grid = h.layout.load().unwrap();
    grid.cells[0].enabled = false;
    h.layout.save(&grid).unwrap();

    let jobs = h
        .scheduler
        .start_batch(batch_request(&["C1", "NOPE"], 4, BatchOptions::default()))
        .await
        .unwrap();
    assert!(jobs.is_empty());
    assert!(h.scheduler.table().snapshots().await.is_empty());
    assert_eq!(h.engine.write_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn progress_is_monotonic_within_each_stage() {
    let h = harness(SimulatedEngine::default(), 1).await;
    let mut stream = h.events.subscribe();

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                verify: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let ids = HashSet::from([jobs[0].job_id.clone()]);
    let updates = updates_until_terminal(&mut stream, &ids).await;

    let mut last: Option<(JobState, f64)> = None;
    for snap in &updates {
        if let Some((state, progress)) = last {
            if state == snap.state {
                assert!(
                    snap.progress >= progress,
                    "progress went backwards in {:?}: {} -> {}",
                    state,
                    progress,
                    snap.progress
                );
            }
        }
        last = Some((snap.state, snap.progress));
    }
}

#[tokio::test]
async fn cancel_during_eject_is_honoured_within_bound() {
    let engine = SimulatedEngine {
        eject_delay: Duration::from_secs(30),
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                eject_after_done: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let job_id = jobs[0].job_id.clone();

    // Wait until the job is sitting in the eject step.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let snap = h
            .scheduler
            .table()
            .snapshot(&job_id, false)
            .await
            .unwrap();
        if snap.stage == JobStage::Eject {
            break;
        }
        assert!(Instant::now() < deadline, "job never reached eject");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    h.scheduler.cancel_job(&job_id).await.unwrap();
    let snap = wait_terminal(&h, &job_id).await;
    assert_eq!(snap.state, JobState::Cancelled);
    assert!(
        started.elapsed() < Duration::from_millis(2500),
        "eject teardown took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn eject_warning_shows_alongside_done() {
    let engine = SimulatedEngine {
        eject_fails: true,
        ..Default::default()
    };
    let h = harness(engine, 1).await;

    let jobs = h
        .scheduler
        .start_batch(batch_request(
            &["C1"],
            1,
            BatchOptions {
                eject_after_done: true,
                ..Default::default()
            },
        ))
        .await
        .unwrap();
    let snap = wait_terminal(&h, &jobs[0].job_id).await;

    assert_eq!(snap.state, JobState::Done);
    assert!(snap.warning.as_deref().unwrap().contains("unmounted only"));
    assert_eq!(h.engine.eject_calls.load(Ordering::SeqCst), 1);
}
