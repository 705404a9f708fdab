//! Capability contracts for the external collaborators the core drives.
//!
//! Content generation, verification, scoring and change generation live
//! outside the core. The orchestrator and ledger only see these traits and
//! their typed payloads.

use crate::error::Result;
use crate::failure::{FailureDescriptor, FailureKind};
use crate::knowledge::{KnowledgeEntry, SessionMetrics};
use crate::patch::Change;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why a task was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    /// Fills a knowledge gap. Runs before exploration.
    Gap,
    /// Exploratory research.
    Exploration,
    /// Requested by a scheduled task or a caller.
    Requested,
}

/// A unit of work dispatched through the produce → verify → score pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchTask {
    /// Topic to research.
    pub topic: String,
    /// Why the task exists.
    pub origin: TaskOrigin,
}

impl ResearchTask {
    /// Create a new task.
    pub fn new(topic: impl Into<String>, origin: TaskOrigin) -> Self {
        Self {
            topic: topic.into(),
            origin,
        }
    }
}

/// What a producer returns for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionOutput {
    /// The produced summary.
    pub summary: String,
    /// Where the content came from.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Tags for the knowledge entry.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Producer's own quality estimate in [0, 1].
    #[serde(default)]
    pub quality_hint: Option<f64>,
}

/// A verifier's verdict on a stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    /// Whether the entry checks out.
    pub passed: bool,
    /// Free-form explanation.
    pub details: String,
}

/// What the change proposer returned.
#[derive(Debug, Clone, PartialEq)]
pub enum Proposal {
    /// A parsed change list (possibly empty).
    Changes(Vec<Change>),
    /// Output that could not be parsed; treated as no changes.
    Unparsable(String),
}

impl Proposal {
    /// The proposed changes, empty for unparsable output.
    pub fn into_changes(self) -> Vec<Change> {
        match self {
            Proposal::Changes(changes) => changes,
            Proposal::Unparsable(_) => Vec::new(),
        }
    }
}

/// Everything known about a failure once it has been analyzed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureContext {
    /// The original failure.
    pub failure: FailureDescriptor,
    /// Its category.
    pub kind: FailureKind,
    /// Root-cause summary.
    pub root_cause: String,
}

/// Produces content for a task.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Research `task`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Production` when nothing could be produced.
    async fn produce(&self, task: &ResearchTask) -> Result<ProductionOutput>;
}

/// Verifies a stored entry.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Check the entry with id `entry_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Verification` when the check itself failed.
    async fn verify(&self, entry_id: Uuid) -> Result<Verification>;
}

/// Scores a produced result.
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score in [0, 1]; values outside are clamped by the caller.
    async fn score(&self, task: &ResearchTask, result: &ProductionOutput) -> f64;
}

/// Synthesizes a summary across entries sharing a tag.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Return synthesized content, or `None` when there is nothing to add.
    ///
    /// # Errors
    ///
    /// Failures are logged per topic and never stop other topics.
    async fn synthesize(&self, topic: &str, entries: &[KnowledgeEntry]) -> Result<Option<String>>;
}

/// Reflects on a finished session.
#[async_trait]
pub trait Reflector: Send + Sync {
    /// Suggested improvements for future sessions.
    ///
    /// # Errors
    ///
    /// Failures are logged and never abort the session.
    async fn reflect(&self, metrics: &SessionMetrics) -> Result<Vec<String>>;
}

/// Proposes source changes for a failure.
#[async_trait]
pub trait ChangeProposer: Send + Sync {
    /// Propose changes for an analyzed failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::Proposal`; the ledger treats it as no changes.
    async fn propose(&self, context: &FailureContext) -> Result<Proposal>;
}

/// Explains the root cause of a failure.
#[async_trait]
pub trait RootCauseReasoner: Send + Sync {
    /// A short root-cause summary.
    ///
    /// # Errors
    ///
    /// The ledger falls back to a templated summary.
    async fn explain(&self, failure: &FailureDescriptor, kind: FailureKind) -> Result<String>;
}
