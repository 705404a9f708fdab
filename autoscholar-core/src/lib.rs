//! Autoscholar core library
//!
//! This crate provides the core functionality for the Autoscholar autonomous
//! research loop: the knowledge store, the human feedback queue, the
//! self-modification ledger, the recurring task scheduler and the session
//! orchestrator that ties them together, plus error handling, events,
//! configuration and the collaborator contracts.

pub mod builtin;
pub mod collaborator;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod failure;
pub mod feedback;
pub mod knowledge;
pub mod ledger;
pub mod orchestrator;
pub mod patch;
mod persist;
pub mod scheduler;
pub mod tools;

pub use builtin::{DigestSynthesizer, MetricsReflector, QualityHintScorer, StoredEntryVerifier};
pub use collaborator::{
    ChangeProposer, FailureContext, ProductionOutput, Producer, Proposal, Reflector, ResearchTask,
    RootCauseReasoner, Scorer, Synthesizer, TaskOrigin, Verification, Verifier,
};
pub use command::{CommandOutput, CommandProducer, CommandProposer, CommandRunner};
pub use config::{Config, DEFAULT_REFERENCE_TOPICS};
pub use error::{Error, ErrorCode, Result};
pub use event::{channel, Event, EventReceiver, EventSender};
pub use failure::{can_self_modify, categorize_failure, FailureDescriptor, FailureKind};
pub use feedback::{FeedbackItem, FeedbackQueue, FeedbackStatus, Insights, NewFeedback, Review};
pub use knowledge::{
    KnowledgeEntry, KnowledgeStats, KnowledgeStore, SessionMetrics, SessionRecord,
    SimilarityBackend, TokenOverlap,
};
pub use ledger::{
    Backup, ImprovementOutcome, Improver, ModificationLedger, ModificationRecord, OutcomeReason,
};
pub use orchestrator::{Collaborators, Orchestrator, SessionReport};
pub use patch::{
    AnnotationPatch, Change, ChangeKind, ChangeResult, ChangeStatus, DelimiterCheck, ManualPatch,
    PatchStrategy, SyntaxCheck, TestResult,
};
pub use scheduler::{
    next_run_for, Frequency, NewScheduledTask, ScheduledTask, ScheduledTaskKind, Scheduler,
    SchedulerStatus, TaskExecutor, TickReport, MAX_INTERVAL_HOURS,
};
pub use tools::{NewTool, ParamSpec, ToolRegistry, ToolSpec};
