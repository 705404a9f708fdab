//! Self-modification ledger.
//!
//! Drives the modification cycle for a failure:
//!
//! ```text
//! Analyzing -> NotModifiable
//!           -> Proposing -> BackingUp -> Applying -> Testing -> Recorded
//! ```
//!
//! A snapshot of the configured file set, plus every proposed target, is
//! durably written before any change is applied. Changes are only applied
//! to files the snapshot covers, and every attempt past analysis is
//! appended to the modification history. Failed checks never auto-revert; `revert` is an
//! explicit operation.

use crate::collaborator::{ChangeProposer, FailureContext, RootCauseReasoner};
use crate::config::{Config, DEFAULT_ENTRY_POINT, DEFAULT_MAX_BACKUPS};
use crate::error::{Error, Result};
use crate::failure::{categorize_failure, FailureDescriptor, FailureKind, SELF_MODIFIABLE};
use crate::patch::{
    Change, ChangeKind, ChangeResult, ChangeStatus, DelimiterCheck, ManualPatch, PatchStrategy,
    SyntaxCheck, TestResult,
};
use crate::persist::{ensure_dir, load_or_default, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MODIFICATIONS_FILE: &str = "modifications.json";
const BACKUP_DIR: &str = "backups";

/// `path` with `.` segments dropped, or `None` when it is absolute, climbs
/// with `..` or is empty.
fn contained(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Phases of one modification cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationPhase {
    /// Categorizing the failure and finding its root cause.
    Analyzing,
    /// Policy forbids an automatic fix. Terminal.
    NotModifiable,
    /// Asking the proposer for changes.
    Proposing,
    /// Snapshotting the file set.
    BackingUp,
    /// Running changes through the patch strategy.
    Applying,
    /// Checking the entry point.
    Testing,
    /// History appended. Terminal.
    Recorded,
}

/// One file captured in a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Path relative to the source root (or absolute).
    pub path: PathBuf,
    /// File content at snapshot time.
    pub content: String,
}

/// An immutable snapshot of the configured file set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique, time-ordered id.
    pub id: Uuid,
    /// Snapshot time.
    pub timestamp: DateTime<Utc>,
    /// Captured files.
    pub files: Vec<BackupFile>,
}

/// One attempted modification cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationRecord {
    /// The failure that triggered the cycle.
    pub failure_descriptor: FailureDescriptor,
    /// Its category.
    pub kind: FailureKind,
    /// Root-cause summary.
    pub root_cause_summary: String,
    /// Whether policy allowed modification.
    pub can_self_modify: bool,
    /// Changes the proposer suggested.
    pub proposed_changes: Vec<Change>,
    /// Per-change outcomes.
    pub applied_results: Vec<ChangeResult>,
    /// Post-change syntax check.
    pub test_result: TestResult,
    /// Snapshot taken before applying.
    pub backup_id: Uuid,
    /// When the cycle was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A successfully applied (or deferred) change in the modification log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    /// When the change was applied.
    pub timestamp: DateTime<Utc>,
    /// File the change targets.
    pub target_file: PathBuf,
    /// Category of fix.
    pub kind: ChangeKind,
    /// What changed.
    pub description: String,
    /// Why.
    pub reason: String,
    /// How it was applied.
    pub status: ChangeStatus,
    /// Patch strategy that handled it.
    pub strategy: String,
}

/// Why a cycle ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeReason {
    /// The failure category requires human intervention.
    CannotSelfModify,
    /// Nothing was proposed; the entry point still passed.
    NoChangesProposed,
    /// Changes applied and the entry point passed.
    TestPassed,
    /// The entry point failed its check after the changes.
    TestFailed,
}

impl std::fmt::Display for OutcomeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeReason::CannotSelfModify => write!(f, "cannot_self_modify"),
            OutcomeReason::NoChangesProposed => write!(f, "no_changes_proposed"),
            OutcomeReason::TestPassed => write!(f, "test_passed"),
            OutcomeReason::TestFailed => write!(f, "test_failed"),
        }
    }
}

/// Result of `improve`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImprovementOutcome {
    /// Whether the cycle ended with a passing check.
    pub improved: bool,
    /// Why.
    pub reason: OutcomeReason,
    /// The failure's category.
    pub kind: FailureKind,
    /// The recorded cycle, absent when policy stopped it.
    pub record: Option<ModificationRecord>,
}

/// Anything that can run a modification cycle for a failure.
#[async_trait]
pub trait Improver: Send + Sync {
    /// Run one cycle.
    ///
    /// # Errors
    ///
    /// Propagates storage errors from backup and history writes.
    async fn improve(&self, failure: &FailureDescriptor) -> Result<ImprovementOutcome>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDoc {
    history: Vec<ModificationRecord>,
    log: Vec<ChangeLogEntry>,
}

/// The modification ledger.
pub struct ModificationLedger {
    path: PathBuf,
    backup_dir: PathBuf,
    source_root: PathBuf,
    backup_files: Vec<PathBuf>,
    entry_point: PathBuf,
    max_backups: usize,
    proposer: Option<Arc<dyn ChangeProposer>>,
    reasoner: Option<Arc<dyn RootCauseReasoner>>,
    patch: Arc<dyn PatchStrategy>,
    syntax: Arc<dyn SyntaxCheck>,
    /// Guards the history document and the backup directory.
    state: Mutex<LedgerDoc>,
}

impl std::fmt::Debug for ModificationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModificationLedger")
            .field("path", &self.path)
            .field("backup_files", &self.backup_files)
            .field("entry_point", &self.entry_point)
            .field("max_backups", &self.max_backups)
            .field("patch", &self.patch.name())
            .finish()
    }
}

impl ModificationLedger {
    /// Open (or create) a ledger rooted at `root`.
    ///
    /// The backup directory is only created by the first `backup`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` or `Error::Serialization` if the history
    /// cannot be loaded.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        ensure_dir(root)?;
        let path = root.join(MODIFICATIONS_FILE);
        let doc: LedgerDoc = load_or_default(&path)?;

        Ok(Self {
            path,
            backup_dir: root.join(BACKUP_DIR),
            source_root: PathBuf::from("."),
            backup_files: Vec::new(),
            entry_point: PathBuf::from(DEFAULT_ENTRY_POINT),
            max_backups: DEFAULT_MAX_BACKUPS,
            proposer: None,
            reasoner: None,
            patch: Arc::new(ManualPatch),
            syntax: Arc::new(DelimiterCheck),
            state: Mutex::new(doc),
        })
    }

    /// Open a ledger using the data dir, file set and limits from `config`.
    ///
    /// # Errors
    ///
    /// See [`ModificationLedger::open`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::open(&config.data_dir)?
            .source_root(&config.source_root)
            .backup_files(config.backup_files.clone())
            .entry_point(&config.entry_point)
            .max_backups(config.max_backups))
    }

    /// Set the root that relative paths resolve against.
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = root.into();
        self
    }

    /// Set the file set captured by `backup`.
    pub fn backup_files(mut self, files: Vec<PathBuf>) -> Self {
        self.backup_files = files;
        self
    }

    /// Set the file checked by `test`.
    pub fn entry_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.entry_point = path.into();
        self
    }

    /// Set how many backups are retained.
    pub fn max_backups(mut self, max: usize) -> Self {
        self.max_backups = max.max(1);
        self
    }

    /// Attach a change proposer.
    pub fn with_proposer(mut self, proposer: Arc<dyn ChangeProposer>) -> Self {
        self.proposer = Some(proposer);
        self
    }

    /// Attach a root-cause reasoner.
    pub fn with_reasoner(mut self, reasoner: Arc<dyn RootCauseReasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Replace the patch strategy.
    pub fn with_patch_strategy(mut self, patch: Arc<dyn PatchStrategy>) -> Self {
        self.patch = patch;
        self
    }

    /// Replace the syntax check.
    pub fn with_syntax_check(mut self, syntax: Arc<dyn SyntaxCheck>) -> Self {
        self.syntax = syntax;
        self
    }

    /// Close the ledger.
    pub fn close(self) {
        debug!(path = %self.path.display(), "closed modification ledger");
    }

    fn lock(&self) -> MutexGuard<'_, LedgerDoc> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_root.join(path)
        }
    }

    fn backup_path(&self, id: Uuid) -> PathBuf {
        self.backup_dir.join(format!("{id}.json"))
    }

    /// Category of a failure.
    pub fn categorize_failure(&self, failure: &FailureDescriptor) -> FailureKind {
        categorize_failure(failure)
    }

    /// Whether policy allows an automatic fix.
    pub fn can_self_modify(&self, failure: &FailureDescriptor) -> bool {
        SELF_MODIFIABLE.contains(&self.categorize_failure(failure))
    }

    async fn root_cause(&self, failure: &FailureDescriptor, kind: FailureKind) -> String {
        if let Some(reasoner) = &self.reasoner {
            match reasoner.explain(failure, kind).await {
                Ok(summary) if !summary.trim().is_empty() => return summary,
                Ok(_) => debug!("root-cause reasoner returned nothing"),
                Err(e) => warn!(error = %e, "root-cause reasoner failed, using template"),
            }
        }
        format!("{kind} failure in {}: {}", failure.origin, failure.error)
    }

    /// Ask the proposer for changes. Errors and unparsable output yield an
    /// empty list.
    pub async fn propose_changes(&self, context: &FailureContext) -> Vec<Change> {
        let Some(proposer) = &self.proposer else {
            debug!("no change proposer configured");
            return Vec::new();
        };
        match proposer.propose(context).await {
            Ok(proposal) => proposal.into_changes(),
            Err(e) => {
                warn!(error = %e, "change proposal failed, treating as no changes");
                Vec::new()
            }
        }
    }

    /// Snapshot the configured file set and evict old snapshots.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the snapshot could not be written. Files
    /// missing from the source tree are skipped.
    pub fn backup(&self) -> Result<Backup> {
        self.snapshot(&[])
    }

    /// Snapshot the configured file set plus `extra` paths not already in it.
    fn snapshot(&self, extra: &[PathBuf]) -> Result<Backup> {
        let _guard = self.lock();

        let mut paths = self.backup_files.clone();
        for path in extra {
            let known = paths
                .iter()
                .any(|p| contained(p).is_some_and(|p| p == *path));
            if !known {
                paths.push(path.clone());
            }
        }

        let mut files = Vec::with_capacity(paths.len());
        for path in &paths {
            let resolved = self.resolve(path);
            match fs::read_to_string(&resolved) {
                Ok(content) => files.push(BackupFile {
                    path: path.clone(),
                    content,
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(path = %resolved.display(), "backup file missing, skipping");
                }
                Err(source) => {
                    return Err(Error::Storage {
                        path: resolved,
                        source,
                    })
                }
            }
        }

        let backup = Backup {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            files,
        };
        ensure_dir(&self.backup_dir)?;
        write_atomic(&self.backup_path(backup.id), &backup)?;
        info!(id = %backup.id, files = backup.files.len(), "wrote backup");

        self.evict_old_backups()?;
        Ok(backup)
    }

    fn read_backups(&self) -> Result<Vec<Backup>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::Storage {
                    path: self.backup_dir.clone(),
                    source,
                })
            }
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| Error::Storage {
                path: self.backup_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let backup: Option<Backup> = load_or_default(&path)?;
            if let Some(backup) = backup {
                backups.push(backup);
            }
        }
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        Ok(backups)
    }

    fn evict_old_backups(&self) -> Result<()> {
        let backups = self.read_backups()?;
        for stale in backups.iter().skip(self.max_backups) {
            let path = self.backup_path(stale.id);
            match fs::remove_file(&path) {
                Ok(()) => debug!(id = %stale.id, "evicted backup"),
                Err(e) => warn!(id = %stale.id, error = %e, "failed to evict backup"),
            }
        }
        Ok(())
    }

    /// Retained backups, newest first.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the backup directory cannot be read.
    pub fn list_backups(&self) -> Result<Vec<Backup>> {
        let _guard = self.lock();
        self.read_backups()
    }

    /// Run each change through the patch strategy. A failing change never
    /// stops the rest of the batch.
    ///
    /// Only targets in the configured backup file set are touched; anything
    /// else is reported as `NotBackedUp`. `improve` widens the set to the
    /// files of the snapshot it takes.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the modification log could not be written.
    pub fn apply(&self, changes: &[Change]) -> Result<Vec<ChangeResult>> {
        self.apply_covered(changes, &self.backup_files)
    }

    fn apply_covered(
        &self,
        changes: &[Change],
        covered: &[PathBuf],
    ) -> Result<Vec<ChangeResult>> {
        let covered: Vec<PathBuf> = covered.iter().filter_map(|p| contained(p)).collect();
        let mut state = self.lock();
        let mut next = state.clone();
        let mut results = Vec::with_capacity(changes.len());

        for change in changes {
            let status = match contained(&change.target_file) {
                None => {
                    warn!(path = %change.target_file.display(), "change target outside source root");
                    ChangeStatus::Rejected {
                        message: format!(
                            "'{}' is not a relative path inside the source root",
                            change.target_file.display()
                        ),
                    }
                }
                Some(relative) => {
                    let target = self.source_root.join(&relative);
                    if !target.is_file() {
                        warn!(path = %target.display(), "change target missing");
                        ChangeStatus::FileNotFound
                    } else if !covered.contains(&relative) {
                        warn!(path = %target.display(), "change target not backed up");
                        ChangeStatus::NotBackedUp
                    } else {
                        match self.patch.apply(change, &target) {
                            Ok(status) => status,
                            Err(e) => ChangeStatus::Failed {
                                message: e.to_string(),
                            },
                        }
                    }
                }
            };

            if status.is_success() {
                next.log.push(ChangeLogEntry {
                    timestamp: Utc::now(),
                    target_file: change.target_file.clone(),
                    kind: change.kind,
                    description: change.change_description.clone(),
                    reason: change.reason.clone(),
                    status: status.clone(),
                    strategy: self.patch.name().to_string(),
                });
            }
            results.push(ChangeResult {
                change: change.clone(),
                status,
            });
        }

        if next.log.len() != state.log.len() {
            write_atomic(&self.path, &next)?;
            *state = next;
        }
        Ok(results)
    }

    /// Best-effort syntax check of the entry point. Never reverts.
    pub fn test(&self) -> TestResult {
        let path = self.resolve(&self.entry_point);
        let source = match fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => return TestResult::failed(format!("cannot read {}: {e}", path.display())),
        };
        match self.syntax.check(&source) {
            Ok(()) => TestResult::passed(),
            Err(message) => TestResult::failed(message),
        }
    }

    /// Restore every file of a backup over the live files.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown backup id and
    /// `Error::Storage` if a file could not be restored.
    pub fn revert(&self, backup_id: Uuid) -> Result<Backup> {
        let _guard = self.lock();
        let path = self.backup_path(backup_id);
        if !path.is_file() {
            return Err(Error::not_found("backup", backup_id.to_string()));
        }
        let backup: Option<Backup> = load_or_default(&path)?;
        let backup = backup.ok_or_else(|| Error::not_found("backup", backup_id.to_string()))?;

        for file in &backup.files {
            let target = self.resolve(&file.path);
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::write(&target, &file.content).map_err(|source| Error::Storage {
                path: target.clone(),
                source,
            })?;
        }
        info!(id = %backup.id, files = backup.files.len(), "reverted to backup");
        Ok(backup)
    }

    /// All recorded cycles, oldest first.
    pub fn history(&self) -> Vec<ModificationRecord> {
        self.lock().history.clone()
    }

    /// All applied changes, oldest first.
    pub fn modification_log(&self) -> Vec<ChangeLogEntry> {
        self.lock().log.clone()
    }

    fn record(&self, record: &ModificationRecord) -> Result<()> {
        let mut state = self.lock();
        let mut next = state.clone();
        next.history.push(record.clone());
        write_atomic(&self.path, &next)?;
        *state = next;
        Ok(())
    }

    /// Run one full modification cycle for `failure`.
    ///
    /// # Errors
    ///
    /// Propagates storage errors from the backup, the modification log and
    /// the history. No change is applied when the backup fails.
    pub async fn improve(&self, failure: &FailureDescriptor) -> Result<ImprovementOutcome> {
        debug!(phase = ?ModificationPhase::Analyzing, origin = %failure.origin);
        let kind = self.categorize_failure(failure);
        if !SELF_MODIFIABLE.contains(&kind) {
            info!(phase = ?ModificationPhase::NotModifiable, %kind, "failure requires human intervention");
            return Ok(ImprovementOutcome {
                improved: false,
                reason: OutcomeReason::CannotSelfModify,
                kind,
                record: None,
            });
        }

        let context = FailureContext {
            failure: failure.clone(),
            kind,
            root_cause: self.root_cause(failure, kind).await,
        };

        debug!(phase = ?ModificationPhase::Proposing);
        let changes = self.propose_changes(&context).await;

        debug!(phase = ?ModificationPhase::BackingUp);
        let targets: Vec<PathBuf> = changes
            .iter()
            .filter_map(|c| contained(&c.target_file))
            .collect();
        let backup = self.snapshot(&targets)?;
        let covered: Vec<PathBuf> = backup.files.iter().map(|f| f.path.clone()).collect();

        debug!(phase = ?ModificationPhase::Applying, changes = changes.len());
        let applied_results = self.apply_covered(&changes, &covered)?;

        debug!(phase = ?ModificationPhase::Testing);
        let test_result = self.test();

        let record = ModificationRecord {
            failure_descriptor: failure.clone(),
            kind,
            root_cause_summary: context.root_cause,
            can_self_modify: true,
            proposed_changes: changes,
            applied_results,
            test_result,
            backup_id: backup.id,
            timestamp: Utc::now(),
        };
        self.record(&record)?;
        info!(
            phase = ?ModificationPhase::Recorded,
            %kind,
            success = record.test_result.success,
            "recorded modification cycle"
        );

        let reason = if !record.test_result.success {
            OutcomeReason::TestFailed
        } else if record.proposed_changes.is_empty() {
            OutcomeReason::NoChangesProposed
        } else {
            OutcomeReason::TestPassed
        };

        Ok(ImprovementOutcome {
            improved: record.test_result.success,
            reason,
            kind,
            record: Some(record),
        })
    }
}

#[async_trait]
impl Improver for ModificationLedger {
    async fn improve(&self, failure: &FailureDescriptor) -> Result<ImprovementOutcome> {
        ModificationLedger::improve(self, failure).await
    }
}
