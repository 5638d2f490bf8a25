//! Leasing and outcome recording through a full service.

mod common;

use std::time::Duration;

use common::TestHarness;

use contractflow::broadcast::StatusFilter;
use contractflow::worker::RunOutcome;
use contractflow::{EntityRef, JobStatus, JobType, NewDocument, NewJob, QueueError, StatusEvent};

#[test]
fn test_gated_merges_do_not_starve_other_work() {
    let harness = TestHarness::new();

    let mut main = NewDocument::new("main.txt", 0, 0);
    main.contract_id = Some("c-9".to_string());
    main.sequence_order = 0;
    harness.register(main, b"Main body still uploading.", 1);

    let mut appendix = NewDocument::new("appendix.txt", 0, 0);
    appendix.contract_id = Some("c-9".to_string());
    appendix.sequence_order = 1;
    let appendix = harness.register(appendix, b"Appendix.", 1);

    let queue = harness.service.queue();
    for _ in 0..80 {
        queue
            .enqueue(
                NewJob::new(JobType::DocumentMerge, EntityRef::Document(appendix.id.clone()))
                    .priority(60),
            )
            .unwrap();
    }
    let rules = queue
        .enqueue(
            NewJob::new(JobType::RuleExtraction, EntityRef::Document(appendix.id.clone()))
                .priority(70),
        )
        .unwrap();

    let leased = queue
        .lease("w1", &[JobType::DocumentMerge, JobType::RuleExtraction])
        .unwrap()
        .expect("the eligible job is leased");
    assert_eq!(leased.id, rules);
    assert_eq!(queue.stats().unwrap().pending, 80);
}

#[test]
fn test_late_worker_cannot_finish_reassigned_job() {
    let harness = TestHarness::new();
    let doc = harness.upload_text("late.txt", "Notice must be given in writing.");
    let queue = harness.service.queue();

    let first = queue.lease("w1", &[JobType::TextExtraction]).unwrap().unwrap();
    harness.clock.advance(Duration::from_secs(301));
    assert_eq!(queue.reap_expired_leases().unwrap(), vec![first.id.clone()]);
    let second = queue.lease("w2", &[JobType::TextExtraction]).unwrap().unwrap();
    assert_eq!(second.id, first.id);

    assert!(matches!(
        queue.complete(&first.id, "w1", serde_json::json!({"pageCount": 9})),
        Err(QueueError::NotLeaseHolder { .. })
    ));
    let job = queue.get(&first.id).unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.lease_owner.as_deref(), Some("w2"));

    let run = harness.service.executor().execute(second, "w2");
    assert_eq!(run.outcome, RunOutcome::Completed);
    let job = queue.get(&first.id).unwrap();
    assert_eq!(job.result.unwrap()["pageCount"], 1);
    assert_eq!(
        harness.service.upload_status(&doc.id).unwrap().page_count,
        1
    );
}

#[test]
fn test_handler_errors_reach_clients_redacted() {
    let harness = TestHarness::new();
    let queue = harness.service.queue();
    let id = queue
        .enqueue(NewJob::new(
            JobType::PageAnalysis,
            EntityRef::page("owner-jane@corp.example", 1),
        ))
        .unwrap();
    let mut events = harness.service.subscribe(StatusFilter::Job(id.clone()));

    let runs = harness.run();
    assert!(matches!(runs[0].outcome, RunOutcome::Failed { .. }));

    let job = harness.service.job_status(&id).unwrap();
    let error = job.error.expect("failed job carries an error");
    assert!(!error.contains("jane@corp.example"), "{}", error);
    assert!(error.contains("[EMAIL]"), "{}", error);

    let pushed = events
        .drain()
        .into_iter()
        .filter_map(|event| match event {
            StatusEvent::Job(snapshot) => snapshot.error,
            _ => None,
        })
        .collect::<Vec<_>>();
    assert!(!pushed.is_empty());
    assert!(pushed.iter().all(|e| !e.contains("jane@corp.example")));
}
