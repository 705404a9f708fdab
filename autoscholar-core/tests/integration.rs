//! Integration tests for the Autoscholar session loop.
//!
//! These tests drive full sessions through the public API: scripted
//! collaborators, the real stores on a temporary data root, the real
//! modification ledger and the scheduler calling back into the orchestrator.

use async_trait::async_trait;
use autoscholar_core::{
    Collaborators, CommandProducer, CommandProposer, Config, Error, Event, EventReceiver,
    FailureDescriptor, FailureKind, FeedbackQueue, Frequency, ImprovementOutcome, Improver,
    KnowledgeStore, ModificationLedger, NewScheduledTask, Orchestrator, OutcomeReason,
    ProductionOutput, Producer, ResearchTask, Result, Review, ScheduledTaskKind, Scheduler,
    StoredEntryVerifier,
};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fails the call with the given 1-indexed number, succeeds otherwise.
struct FlakyProducer {
    calls: AtomicUsize,
    fail_on: usize,
    error: &'static str,
}

impl FlakyProducer {
    fn new(fail_on: usize, error: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_on,
            error,
        })
    }
}

#[async_trait]
impl Producer for FlakyProducer {
    async fn produce(&self, task: &ResearchTask) -> Result<ProductionOutput> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(Error::production(self.error));
        }
        Ok(ProductionOutput {
            summary: format!("findings on {}", task.topic),
            sources: vec!["https://arxiv.org".to_string()],
            tags: vec!["ai".to_string()],
            quality_hint: Some(0.8),
        })
    }
}

#[derive(Default)]
struct RecordingImprover {
    calls: Mutex<Vec<FailureDescriptor>>,
}

#[async_trait]
impl Improver for RecordingImprover {
    async fn improve(&self, failure: &FailureDescriptor) -> Result<ImprovementOutcome> {
        self.calls.lock().unwrap().push(failure.clone());
        Ok(ImprovementOutcome {
            improved: false,
            reason: OutcomeReason::CannotSelfModify,
            kind: FailureKind::Unknown,
            record: None,
        })
    }
}

fn config(data: &Path) -> Config {
    Config::new()
        .data_dir(data)
        .reference_topics(vec![
            "reinforcement learning".to_string(),
            "agent planning".to_string(),
            "tool use".to_string(),
        ])
        .exploration_topics(vec![])
}

fn orchestrator(
    config: Config,
    producer: Arc<dyn Producer>,
    improver: Arc<dyn Improver>,
) -> (Orchestrator, EventReceiver, Arc<KnowledgeStore>, Arc<FeedbackQueue>) {
    let knowledge = Arc::new(KnowledgeStore::open(&config.data_dir).unwrap());
    let feedback = Arc::new(FeedbackQueue::open(&config.data_dir).unwrap());
    let verifier = Arc::new(StoredEntryVerifier::new(knowledge.clone()));
    let (orchestrator, events) = Orchestrator::new(
        config,
        knowledge.clone(),
        feedback.clone(),
        improver,
        Collaborators::new(producer, verifier),
    );
    (orchestrator, events, knowledge, feedback)
}

fn drain(mut events: EventReceiver) -> Vec<Event> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn test_one_failed_task_triggers_one_improvement() {
    let dir = tempfile::tempdir().unwrap();
    let improver = Arc::new(RecordingImprover::default());
    let (orchestrator, events, knowledge, _) = orchestrator(
        config(dir.path()),
        FlakyProducer::new(2, "upstream returned garbage"),
        improver.clone(),
    );

    let report = orchestrator.run_session("morning").await.unwrap();

    assert_eq!(report.metrics.tasks_completed, 2);
    assert_eq!(report.metrics.tasks_failed, 1);
    assert_eq!(report.metrics.verifications_passed, 2);

    let calls = improver.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].error.contains("1 tasks failed"));
    assert!(calls[0].error.contains("agent planning"));

    let sessions = knowledge.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].metrics.tasks_failed, 1);
    assert_eq!(knowledge.get_stats().session_count, 1);

    let events = drain(events);
    assert!(matches!(events.first(), Some(Event::SessionStarted { tasks: 3, .. })));
    assert!(matches!(events.last(), Some(Event::SessionFinished { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, Event::TaskFailed { .. }))
            .count(),
        1
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Synthesized { topic } if topic == "ai")));
}

#[tokio::test]
async fn test_timeout_failure_runs_real_modification_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let src = dir.path().join("src");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("main.rs"), "fn main() {\n    research();\n}\n").unwrap();

    let proposer = CommandProposer::new(
        "sh",
        vec![
            "-c".to_string(),
            r#"echo '[{"targetFile":"main.rs","changeDescription":"research()","reason":"slow upstream","kind":"retry_logic"}]'"#.to_string(),
        ],
        10,
    );
    let ledger = Arc::new(
        ModificationLedger::open(&data)
            .unwrap()
            .source_root(&src)
            .backup_files(vec!["main.rs".into()])
            .entry_point("main.rs")
            .with_proposer(Arc::new(proposer)),
    );

    let (orchestrator, _events, knowledge, _) = orchestrator(
        config(&data),
        FlakyProducer::new(1, "request timed out after 30s"),
        ledger.clone(),
    );
    let report = orchestrator.run_session("timeouts").await.unwrap();

    let outcome = report.improvement.unwrap();
    assert_eq!(outcome.kind, FailureKind::Timeout);
    assert!(outcome.improved);
    assert_eq!(outcome.reason, OutcomeReason::TestPassed);

    let history = ledger.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].proposed_changes.len(), 1);
    assert_eq!(ledger.list_backups().unwrap().len(), 1);
    assert_eq!(history[0].backup_id, ledger.list_backups().unwrap()[0].id);

    // The default patch strategy leaves sources untouched.
    assert_eq!(
        fs::read_to_string(src.join("main.rs")).unwrap(),
        "fn main() {\n    research();\n}\n"
    );
    assert_eq!(knowledge.sessions().len(), 1);
}

#[tokio::test]
async fn test_low_confidence_results_flow_to_review() {
    let dir = tempfile::tempdir().unwrap();
    let producer = CommandProducer::new(
        "sh",
        vec![
            "-c".to_string(),
            r#"echo '{"summary":"tentative notes","sources":["blog"],"tags":["draft"],"qualityHint":0.3}'"#
                .to_string(),
        ],
        10,
    );
    let (orchestrator, _events, knowledge, feedback) = orchestrator(
        config(dir.path()).max_tasks_per_session(2),
        Arc::new(producer),
        Arc::new(RecordingImprover::default()),
    );

    let report = orchestrator.run_session("drafts").await.unwrap();
    assert_eq!(report.metrics.tasks_completed, 2);
    assert_eq!(report.queued_for_review.len(), 2);

    let first = report.queued_for_review[0];
    feedback
        .submit_review(first, Review::approve().rating(4).corrections("cite the paper"))
        .unwrap();
    assert!(matches!(
        feedback.submit_review(first, Review::reject()),
        Err(Error::NotFound { .. })
    ));

    let insights = feedback.learn_from_approved();
    assert_eq!(insights.approved_count, 1);
    assert_eq!(feedback.pending().len(), 1);

    assert_eq!(knowledge.entries_for_topic("agent planning").len(), 1);
    assert_eq!(report.synthesized, vec!["draft".to_string()]);
    let gaps = knowledge.identify_gaps(&["reinforcement learning", "tool use"]);
    assert_eq!(gaps, vec!["tool use".to_string()]);
}

#[tokio::test]
async fn test_scheduler_drives_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _events, knowledge, _) = orchestrator(
        config(dir.path()),
        FlakyProducer::new(1, "rate limit exceeded"),
        Arc::new(RecordingImprover::default()),
    );

    let scheduler = Scheduler::open(
        dir.path(),
        Arc::new(orchestrator),
        Duration::from_secs(60),
        Duration::from_secs(120),
    )
    .unwrap();
    let task = scheduler
        .add_task(NewScheduledTask {
            name: "weekly-digest".to_string(),
            kind: ScheduledTaskKind::Research,
            topic: "retrieval augmented generation".to_string(),
            frequency: Frequency::Weekly { weekday: 4, hour: 7 },
        })
        .await
        .unwrap();
    assert!(task.next_run > task.created_at);

    // First attempt fails and is retried shortly.
    let due = task.next_run;
    let report = scheduler.tick(due).await.unwrap();
    assert_eq!(report.failed, 1);
    let retry_at = scheduler.list().await[0].next_run;
    assert_eq!(retry_at, due + chrono::Duration::minutes(2));

    // Retry succeeds and moves to the next weekly slot.
    let report = scheduler.tick(retry_at).await.unwrap();
    assert_eq!(report.succeeded, 1);
    let updated = &scheduler.list().await[0];
    assert_eq!(updated.last_run, Some(retry_at));
    assert_eq!(updated.next_run, due + chrono::Duration::days(7));

    assert_eq!(
        knowledge
            .entries_for_topic("retrieval augmented generation")
            .len(),
        1
    );
    assert_eq!(knowledge.sessions().len(), 2);
}
