//! Client mirror reconciliation against a running service.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::TestHarness;

use contractflow::broadcast::{JobSnapshot, StatusFilter};
use contractflow::{EntityRef, JobStatus, JobType, Providers};

#[test]
fn test_callback_fires_once_after_reconnect() {
    let harness = TestHarness::new();
    let doc = harness.upload_text("terms.txt", "Either party may terminate at will.");

    let job = harness
        .service
        .queue()
        .jobs_for_entity(&EntityRef::Document(doc.id.clone()))
        .unwrap()
        .into_iter()
        .find(|j| j.job_type == JobType::TextExtraction)
        .unwrap();

    let mirror = harness.service.client_mirror();
    let fired = Arc::new(AtomicU32::new(0));
    let seen_result = Arc::new(Mutex::new(None));
    {
        let fired = Arc::clone(&fired);
        let seen_result = Arc::clone(&seen_result);
        mirror.track_with_callback(
            harness.service.job_status(&job.id).unwrap(),
            Box::new(move |snapshot: &JobSnapshot| {
                fired.fetch_add(1, Ordering::SeqCst);
                *seen_result.lock().unwrap() = snapshot.result.clone();
            }),
        );
    }

    // Events published while the client is away are buffered here and only
    // replayed after the reconnect poll.
    let mut missed = harness.service.subscribe(StatusFilter::Job(job.id.clone()));
    harness.run();

    let report = mirror.reconnect(harness.service.queue().broadcaster());
    assert_eq!(report.refreshed, vec![job.id.clone()]);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    for event in missed.drain() {
        mirror.apply_event(&event);
    }
    mirror.reconnect(harness.service.queue().broadcaster());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let result = seen_result.lock().unwrap().clone().unwrap();
    assert_eq!(result["pageCount"], 1);
    assert_eq!(
        mirror.job(&job.id).unwrap().snapshot.status,
        JobStatus::Completed
    );
}

#[test]
fn test_finished_jobs_leave_after_grace_period() {
    let harness = TestHarness::new();
    let doc = harness.upload_text("a.txt", "Short.");
    let mirror = harness.service.client_mirror();

    let mut events = harness
        .service
        .subscribe(StatusFilter::Document(doc.id.clone()));
    for job in harness
        .service
        .queue()
        .jobs_for_entity(&EntityRef::Document(doc.id.clone()))
        .unwrap()
    {
        mirror.track((&job).into());
    }

    harness.run();
    for event in events.drain() {
        mirror.apply_event(&event);
    }
    assert!(mirror.jobs().iter().all(|j| j.snapshot.is_terminal()));

    harness.clock.advance(Duration::from_secs(5));
    assert!(mirror.prune().is_empty());
    harness.clock.advance(Duration::from_secs(5));
    assert!(!mirror.prune().is_empty());
    assert!(mirror.jobs().is_empty());
}

#[test]
fn test_mirror_state_persists_between_sessions() {
    let state_dir = tempfile::TempDir::new().unwrap();
    let state_file = state_dir.path().join("mirror.json");
    let harness = TestHarness::with(
        |config| config.mirror.state_file = Some(state_file.to_string_lossy().to_string()),
        Providers::builtin(),
    );
    let doc = harness.upload_text("b.txt", "Another short one.");
    let job = harness
        .service
        .queue()
        .jobs_for_entity(&EntityRef::Document(doc.id.clone()))
        .unwrap()
        .remove(0);

    {
        let mirror = harness.service.client_mirror();
        mirror.track((&job).into());
        mirror.minimize(&job.id);
    }

    let reloaded = harness.service.client_mirror();
    assert!(reloaded.is_minimized(&job.id));
    assert!(reloaded.visible().is_empty());
    assert_eq!(reloaded.jobs().len(), 1);
}
