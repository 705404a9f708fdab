//! Session orchestrator for the Autoscholar agent loop.
//!
//! This module provides the `Orchestrator` that runs a session: it plans
//! tasks from knowledge gaps, drives each task through the produce, verify
//! and score pipeline, synthesizes the most frequent tags, reflects on the
//! session and hands failures to the modification ledger. Lifecycle changes
//! are emitted as `Event`s for consumers like the CLI.

use crate::builtin::{DigestSynthesizer, MetricsReflector, QualityHintScorer};
use crate::collaborator::{
    ProductionOutput, Producer, Reflector, ResearchTask, Scorer, Synthesizer, TaskOrigin,
    Verifier,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{channel, Event, EventReceiver, EventSender};
use crate::failure::FailureDescriptor;
use crate::feedback::{FeedbackQueue, NewFeedback};
use crate::knowledge::{KnowledgeEntry, KnowledgeStore, SessionMetrics};
use crate::ledger::{ImprovementOutcome, Improver};
use crate::scheduler::{ScheduledTask, ScheduledTaskKind, TaskExecutor};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source recorded on synthesized entries.
pub const SYNTHESIS_SOURCE: &str = "synthesis";

/// Feedback item type for research results.
const REVIEW_KIND: &str = "research";

/// The collaborators a session drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Produces content for each task.
    pub producer: Arc<dyn Producer>,
    /// Verifies stored entries.
    pub verifier: Arc<dyn Verifier>,
    /// Scores produced results.
    pub scorer: Arc<dyn Scorer>,
    /// Synthesizes across entries sharing a tag.
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Reflects on the finished session.
    pub reflector: Arc<dyn Reflector>,
}

impl Collaborators {
    /// Use `producer` and `verifier` with the built-in scorer, synthesizer
    /// and reflector.
    pub fn new(producer: Arc<dyn Producer>, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            producer,
            verifier,
            scorer: Arc::new(QualityHintScorer),
            synthesizer: Arc::new(DigestSynthesizer),
            reflector: Arc::new(MetricsReflector),
        }
    }

    /// Replace the scorer.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Replace the synthesizer.
    pub fn with_synthesizer(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// Replace the reflector.
    pub fn with_reflector(mut self, reflector: Arc<dyn Reflector>) -> Self {
        self.reflector = reflector;
        self
    }
}

/// What a session did.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// The persisted metrics.
    pub metrics: SessionMetrics,
    /// Entries stored by the task loop.
    pub entry_ids: Vec<Uuid>,
    /// Feedback items queued for review.
    pub queued_for_review: Vec<Uuid>,
    /// Tags that were synthesized.
    pub synthesized: Vec<String>,
    /// Reflector suggestions.
    pub reflections: Vec<String>,
    /// The self-modification cycle, when tasks failed.
    pub improvement: Option<ImprovementOutcome>,
}

impl SessionReport {
    /// Whether every task completed.
    pub fn is_clean(&self) -> bool {
        self.metrics.tasks_failed == 0
    }
}

/// Runs research sessions.
pub struct Orchestrator {
    config: Config,
    knowledge: Arc<KnowledgeStore>,
    feedback: Arc<FeedbackQueue>,
    improver: Arc<dyn Improver>,
    collaborators: Collaborators,
    events: EventSender,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("knowledge", &self.knowledge)
            .field("confidence_threshold", &self.config.confidence_threshold)
            .field("max_tasks_per_session", &self.config.max_tasks_per_session)
            .finish()
    }
}

impl Orchestrator {
    /// Create a new orchestrator.
    ///
    /// Returns the orchestrator and the receiver for its events. Events are
    /// sent with backpressure, so the receiver must be drained or dropped.
    pub fn new(
        config: Config,
        knowledge: Arc<KnowledgeStore>,
        feedback: Arc<FeedbackQueue>,
        improver: Arc<dyn Improver>,
        collaborators: Collaborators,
    ) -> (Self, EventReceiver) {
        let (tx, rx) = channel();
        let orchestrator = Self {
            config,
            knowledge,
            feedback,
            improver,
            collaborators,
            events: tx,
        };
        (orchestrator, rx)
    }

    async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    /// Gap tasks first, then exploration tasks, capped at
    /// `max_tasks_per_session`.
    pub fn plan_tasks(&self) -> Vec<ResearchTask> {
        let gaps = self.knowledge.identify_gaps(&self.config.reference_topics);
        gaps.into_iter()
            .map(|topic| ResearchTask::new(topic, TaskOrigin::Gap))
            .chain(
                self.config
                    .exploration_topics
                    .iter()
                    .map(|topic| ResearchTask::new(topic.clone(), TaskOrigin::Exploration)),
            )
            .take(self.config.max_tasks_per_session)
            .collect()
    }

    /// Run a full session over the planned tasks.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` only when the session metrics could not be
    /// persisted; per-task failures are counted, not returned.
    pub async fn run_session(&self, session_name: &str) -> Result<SessionReport> {
        let tasks = self.plan_tasks();
        self.run(session_name, tasks).await
    }

    /// Run a single-task session for `topic`.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::run_session`].
    pub async fn run_topic(&self, topic: &str, session_name: &str) -> Result<SessionReport> {
        let task = ResearchTask::new(topic, TaskOrigin::Requested);
        self.run(session_name, vec![task]).await
    }

    async fn run(&self, session_name: &str, tasks: Vec<ResearchTask>) -> Result<SessionReport> {
        let mut metrics = SessionMetrics::new(session_name);
        metrics.knowledge_gaps = self.knowledge.identify_gaps(&self.config.reference_topics);

        let mut report = SessionReport {
            metrics: SessionMetrics::default(),
            entry_ids: Vec::new(),
            queued_for_review: Vec::new(),
            synthesized: Vec::new(),
            reflections: Vec::new(),
            improvement: None,
        };

        info!(session = %session_name, tasks = tasks.len(), "session started");
        self.emit(Event::SessionStarted {
            session: session_name.to_string(),
            tasks: tasks.len(),
        })
        .await;

        let started = Instant::now();
        let mut task_errors = Vec::new();
        for (idx, task) in tasks.iter().enumerate() {
            self.emit(Event::TaskStarted {
                index: idx + 1,
                topic: task.topic.clone(),
            })
            .await;

            if let Err(e) = self.run_task(task, &mut metrics, &mut report).await {
                metrics.tasks_failed += 1;
                warn!(session = %session_name, topic = %task.topic, error = %e, "task failed");
                task_errors.push(format!("{}: {e}", task.topic));
                self.emit(Event::TaskFailed {
                    topic: task.topic.clone(),
                    message: e.to_string(),
                })
                .await;
            }
        }
        metrics.research_time_seconds = started.elapsed().as_secs_f64();

        report.synthesized = self.synthesize().await;
        report.reflections = self.reflect(&metrics).await;

        if metrics.tasks_failed > 0 {
            report.improvement = self.improve(session_name, &metrics, task_errors).await;
        }

        self.knowledge.record_session(&metrics)?;
        info!(
            session = %session_name,
            completed = metrics.tasks_completed,
            failed = metrics.tasks_failed,
            verified = metrics.verifications_passed,
            "session finished"
        );
        self.emit(Event::SessionFinished {
            metrics: metrics.clone(),
        })
        .await;

        report.metrics = metrics;
        Ok(report)
    }

    /// Produce, store, verify, score and maybe queue one task. An error
    /// means the task failed; nothing after a failed produce or store runs.
    async fn run_task(
        &self,
        task: &ResearchTask,
        metrics: &mut SessionMetrics,
        report: &mut SessionReport,
    ) -> Result<()> {
        debug!(topic = %task.topic, origin = ?task.origin, "producing");
        let output = self.collaborators.producer.produce(task).await?;

        let entry = self.knowledge.add_entry(
            task.topic.clone(),
            output.summary.clone(),
            output.tags.iter().cloned(),
            output.sources.join(", "),
        )?;
        metrics.tasks_completed += 1;
        report.entry_ids.push(entry.id);

        let verified = self.verify(&entry).await;
        if verified {
            metrics.verifications_passed += 1;
        }

        let score = self.score(task, &output, &entry).await;
        if score < self.config.confidence_threshold {
            self.queue_for_review(task, &output, score, report).await;
        }

        self.emit(Event::TaskCompleted {
            topic: task.topic.clone(),
            entry_id: entry.id,
            score,
            verified,
        })
        .await;
        Ok(())
    }

    async fn verify(&self, entry: &KnowledgeEntry) -> bool {
        match self.collaborators.verifier.verify(entry.id).await {
            Ok(verification) if verification.passed => {
                if let Err(e) = self.knowledge.mark_verified(entry.id) {
                    warn!(id = %entry.id, error = %e, "failed to mark entry verified");
                }
                true
            }
            Ok(verification) => {
                debug!(id = %entry.id, details = %verification.details, "verification did not pass");
                false
            }
            Err(e) => {
                warn!(id = %entry.id, error = %e, "verifier failed");
                false
            }
        }
    }

    async fn score(
        &self,
        task: &ResearchTask,
        output: &ProductionOutput,
        entry: &KnowledgeEntry,
    ) -> f64 {
        let raw = self.collaborators.scorer.score(task, output).await;
        let score = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) };
        if let Err(e) = self.knowledge.record_evaluation(entry, score) {
            warn!(id = %entry.id, error = %e, "failed to record evaluation");
        }
        score
    }

    async fn queue_for_review(
        &self,
        task: &ResearchTask,
        output: &ProductionOutput,
        score: f64,
        report: &mut SessionReport,
    ) {
        let item = NewFeedback::new(
            REVIEW_KIND,
            format!("{}: {}", task.topic, output.summary),
            score,
        );
        match self.feedback.queue_for_review(item) {
            Ok(queued) => {
                report.queued_for_review.push(queued.id);
                self.emit(Event::ReviewQueued {
                    item_id: queued.id,
                    confidence: score,
                })
                .await;
            }
            Err(e) => warn!(topic = %task.topic, error = %e, "failed to queue for review"),
        }
    }

    /// Synthesize each of the top-N tags independently.
    async fn synthesize(&self) -> Vec<String> {
        let mut synthesized = Vec::new();
        let entries = self.knowledge.entries();

        for (tag, _) in self.knowledge.top_tags(self.config.synthesis_top_n) {
            let tagged: Vec<KnowledgeEntry> = entries
                .iter()
                .filter(|e| e.source != SYNTHESIS_SOURCE && e.tags.contains(&tag))
                .cloned()
                .collect();

            match self.collaborators.synthesizer.synthesize(&tag, &tagged).await {
                Ok(Some(content)) => {
                    let stored = self.knowledge.add_entry(
                        format!("synthesis: {tag}"),
                        content,
                        [tag.clone()],
                        SYNTHESIS_SOURCE,
                    );
                    match stored {
                        Ok(_) => {
                            self.emit(Event::Synthesized { topic: tag.clone() }).await;
                            synthesized.push(tag);
                        }
                        Err(e) => warn!(topic = %tag, error = %e, "failed to store synthesis"),
                    }
                }
                Ok(None) => debug!(topic = %tag, "nothing to synthesize"),
                Err(e) => warn!(topic = %tag, error = %e, "synthesis failed"),
            }
        }
        synthesized
    }

    async fn reflect(&self, metrics: &SessionMetrics) -> Vec<String> {
        match self.collaborators.reflector.reflect(metrics).await {
            Ok(suggestions) => {
                for suggestion in &suggestions {
                    info!(session = %metrics.session_name, %suggestion, "reflection");
                }
                suggestions
            }
            Err(e) => {
                warn!(session = %metrics.session_name, error = %e, "reflection failed");
                Vec::new()
            }
        }
    }

    async fn improve(
        &self,
        session_name: &str,
        metrics: &SessionMetrics,
        task_errors: Vec<String>,
    ) -> Option<ImprovementOutcome> {
        let failure = FailureDescriptor::new(
            format!("session '{session_name}'"),
            format!(
                "session '{session_name}': {} tasks failed: {}",
                metrics.tasks_failed,
                task_errors.join("; ")
            ),
        )
        .with_details(task_errors);

        match self.improver.improve(&failure).await {
            Ok(outcome) => {
                info!(
                    session = %session_name,
                    improved = outcome.improved,
                    reason = %outcome.reason,
                    "self-modification cycle finished"
                );
                self.emit(Event::ModificationAttempted {
                    improved: outcome.improved,
                    reason: outcome.reason,
                })
                .await;
                Some(outcome)
            }
            Err(e) => {
                warn!(session = %session_name, error = %e, "self-modification failed");
                self.emit(Event::warning(format!("self-modification failed: {e}")))
                    .await;
                None
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for Orchestrator {
    async fn execute(&self, task: &ScheduledTask) -> Result<()> {
        let session_name = format!("{}-{}", task.name, Utc::now().format("%Y%m%dT%H%M%S"));
        match task.kind {
            ScheduledTaskKind::Session => {
                self.run_session(&session_name).await?;
                Ok(())
            }
            ScheduledTaskKind::Research => {
                let report = self.run_topic(&task.topic, &session_name).await?;
                if report.is_clean() {
                    Ok(())
                } else {
                    Err(Error::production(format!(
                        "research on '{}' failed",
                        task.topic
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::Verification;
    use crate::failure::FailureKind;
    use crate::ledger::OutcomeReason;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies in order; `None` fails the task.
    struct ScriptedProducer {
        replies: Mutex<VecDeque<Option<ProductionOutput>>>,
    }

    impl ScriptedProducer {
        fn new(replies: Vec<Option<ProductionOutput>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
            })
        }
    }

    #[async_trait]
    impl Producer for ScriptedProducer {
        async fn produce(&self, task: &ResearchTask) -> Result<ProductionOutput> {
            match self.replies.lock().unwrap().pop_front().flatten() {
                Some(output) => Ok(output),
                None => Err(Error::production(format!("request timed out for {}", task.topic))),
            }
        }
    }

    struct AlwaysVerifier(bool);

    #[async_trait]
    impl Verifier for AlwaysVerifier {
        async fn verify(&self, _entry_id: Uuid) -> Result<Verification> {
            Ok(Verification {
                passed: self.0,
                details: String::new(),
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

    fn output(summary: &str, tags: &[&str], hint: f64) -> Option<ProductionOutput> {
        Some(ProductionOutput {
            summary: summary.to_string(),
            sources: vec!["arxiv".to_string()],
            tags: tags.iter().map(|t| t.to_string()).collect(),
            quality_hint: Some(hint),
        })
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        knowledge: Arc<KnowledgeStore>,
        feedback: Arc<FeedbackQueue>,
        improver: Arc<RecordingImprover>,
        orchestrator: Orchestrator,
        _events: EventReceiver,
    }

    fn fixture(config: Config, producer: Arc<dyn Producer>, verified: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let knowledge = Arc::new(KnowledgeStore::open(dir.path()).unwrap());
        let feedback = Arc::new(FeedbackQueue::open(dir.path()).unwrap());
        let improver = Arc::new(RecordingImprover::default());
        let collaborators = Collaborators::new(producer, Arc::new(AlwaysVerifier(verified)));
        let (orchestrator, events) = Orchestrator::new(
            config,
            knowledge.clone(),
            feedback.clone(),
            improver.clone(),
            collaborators,
        );
        Fixture {
            _dir: dir,
            knowledge,
            feedback,
            improver,
            orchestrator,
            _events: events,
        }
    }

    fn config(reference: &[&str], exploration: &[&str], max_tasks: usize) -> Config {
        Config::new()
            .reference_topics(reference.iter().map(|t| t.to_string()).collect())
            .exploration_topics(exploration.iter().map(|t| t.to_string()).collect())
            .max_tasks_per_session(max_tasks)
    }

    #[test]
    fn test_plan_tasks_orders_gaps_first_and_caps() {
        let f = fixture(
            config(&["rl", "rag", "planning"], &["open problems"], 3),
            ScriptedProducer::new(vec![]),
            true,
        );
        f.knowledge
            .add_entry("RAG", "retrieval", Vec::new(), "a")
            .unwrap();

        let tasks = f.orchestrator.plan_tasks();
        let topics: Vec<&str> = tasks.iter().map(|t| t.topic.as_str()).collect();
        assert_eq!(topics, vec!["rl", "planning", "open problems"]);
        assert_eq!(tasks[0].origin, TaskOrigin::Gap);
        assert_eq!(tasks[2].origin, TaskOrigin::Exploration);

        let f = fixture(
            config(&["rl", "rag", "planning"], &["open problems"], 2),
            ScriptedProducer::new(vec![]),
            true,
        );
        assert_eq!(f.orchestrator.plan_tasks().len(), 2);
    }

    #[tokio::test]
    async fn test_session_counts_and_review_queue() {
        let producer = ScriptedProducer::new(vec![
            output("policy gradients", &["ml"], 0.9),
            output("dense retrieval", &["ml"], 0.4),
        ]);
        let f = fixture(config(&["rl", "rag"], &[], 5), producer, true);

        let report = f.orchestrator.run_session("s1").await.unwrap();
        assert_eq!(report.metrics.tasks_completed, 2);
        assert_eq!(report.metrics.tasks_failed, 0);
        assert_eq!(report.metrics.verifications_passed, 2);
        assert_eq!(report.metrics.knowledge_gaps, vec!["rl", "rag"]);
        assert!(report.improvement.is_none());
        assert!(f.improver.calls.lock().unwrap().is_empty());

        assert_eq!(report.queued_for_review.len(), 1);
        let pending = f.feedback.pending();
        assert_eq!(pending.len(), 1);
        assert!((pending[0].confidence - 0.4).abs() < 1e-9);

        assert_eq!(report.synthesized, vec!["ml".to_string()]);
        assert_eq!(f.knowledge.entries_for_topic("synthesis: ml").len(), 1);
        assert!(f.knowledge.entries().iter().filter(|e| e.verified).count() >= 2);

        let sessions = f.knowledge.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].metrics.session_name, "s1");
    }

    #[tokio::test]
    async fn test_failed_verification_not_counted() {
        let producer = ScriptedProducer::new(vec![output("notes", &[], 0.95)]);
        let f = fixture(config(&["rl"], &[], 5), producer, false);

        let report = f.orchestrator.run_session("s").await.unwrap();
        assert_eq!(report.metrics.tasks_completed, 1);
        assert_eq!(report.metrics.verifications_passed, 0);
        assert!(report.queued_for_review.is_empty());
    }

    #[tokio::test]
    async fn test_failures_invoke_improve_once() {
        let producer = ScriptedProducer::new(vec![None, None, output("ok", &[], 0.9)]);
        let f = fixture(config(&["a", "b", "c"], &[], 5), producer, true);

        let report = f.orchestrator.run_session("nightly").await.unwrap();
        assert_eq!(report.metrics.tasks_failed, 2);
        assert_eq!(report.metrics.tasks_completed, 1);

        let calls = f.improver.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0]
            .error
            .starts_with("session 'nightly': 2 tasks failed: a: production failed"));
        assert_eq!(calls[0].details.len(), 2);
        assert_eq!(report.improvement.as_ref().unwrap().reason, OutcomeReason::CannotSelfModify);
        assert_eq!(f.knowledge.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_session_record_failure_propagates_after_synthesis_and_improve() {
        let producer = ScriptedProducer::new(vec![
            None,
            output("policy gradients", &["ml"], 0.9),
            output("dense retrieval", &["ml"], 0.9),
        ]);
        let f = fixture(config(&["a", "b", "c"], &[], 5), producer, true);
        // A directory in place of the metrics file makes the session write fail.
        std::fs::create_dir(f._dir.path().join("metrics.json")).unwrap();

        let result = f.orchestrator.run_session("broken").await;

        assert!(matches!(result, Err(Error::Storage { .. })));
        assert_eq!(f.knowledge.entries_for_topic("synthesis: ml").len(), 1);
        assert_eq!(f.improver.calls.lock().unwrap().len(), 1);
        assert!(f.knowledge.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_scores_are_clamped() {
        let producer = ScriptedProducer::new(vec![output("x", &[], 7.5), output("y", &[], -2.0)]);
        let f = fixture(config(&["a", "b"], &[], 5), producer, true);

        f.orchestrator.run_session("s").await.unwrap();
        let pending = f.feedback.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].confidence, 0.0);
        assert!((f.knowledge.get_stats().avg_score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_scheduled_research_fails_when_task_fails() {
        let producer = ScriptedProducer::new(vec![None, output("ok", &[], 0.9)]);
        let f = fixture(config(&[], &[], 5), producer, true);
        let now = Utc::now();
        let mut task = ScheduledTask {
            id: Uuid::now_v7(),
            name: "digest".to_string(),
            kind: ScheduledTaskKind::Research,
            topic: "agents".to_string(),
            frequency: crate::scheduler::Frequency::Daily { hour: 3 },
            enabled: true,
            last_run: None,
            next_run: now,
            created_at: now,
        };

        assert!(f.orchestrator.execute(&task).await.is_err());
        assert!(f.orchestrator.execute(&task).await.is_ok());
        assert_eq!(f.knowledge.entries_for_topic("agents").len(), 1);

        task.kind = ScheduledTaskKind::Session;
        assert!(f.orchestrator.execute(&task).await.is_ok());
        assert_eq!(f.knowledge.sessions().len(), 3);
    }
}
