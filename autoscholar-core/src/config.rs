//! Configuration for the Autoscholar agent loop.
//!
//! This module provides the `Config` struct with a builder pattern for
//! configuring the data directory, session pipeline thresholds, gap topics,
//! self-modification file set, scheduler timing and the external commands
//! backing the default collaborators.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default data directory for persisted stores.
const DEFAULT_DATA_DIR: &str = ".autoscholar";

/// Default confidence below which results are queued for human review.
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Default number of most frequent tags synthesized after a session.
const DEFAULT_SYNTHESIS_TOP_N: usize = 3;

/// Default cap on tasks dispatched per session.
const DEFAULT_MAX_TASKS_PER_SESSION: usize = 5;

/// Default number of backup snapshots retained.
pub(crate) const DEFAULT_MAX_BACKUPS: usize = 10;

/// Default file checked after self-modification.
pub(crate) const DEFAULT_ENTRY_POINT: &str = "src/main.rs";

/// Default scheduler tick period in seconds.
const DEFAULT_TICK_SECS: u64 = 60;

/// Default delay before retrying a failed scheduled task, in seconds.
const DEFAULT_RETRY_DELAY_SECS: u64 = 300;

/// Default timeout for command-backed collaborators, in seconds.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Reference topics used to detect knowledge gaps.
pub const DEFAULT_REFERENCE_TOPICS: &[&str] = &[
    "transformer architectures",
    "reinforcement learning",
    "retrieval augmented generation",
    "model evaluation",
    "prompt engineering",
    "agent planning",
    "tool use",
    "fine-tuning",
];

/// Exploration topics dispatched after gap-derived tasks.
fn default_exploration_topics() -> Vec<String> {
    vec![
        "emerging research directions".to_string(),
        "open problems in autonomous agents".to_string(),
    ]
}

/// Configuration for the Autoscholar core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory for all persisted stores.
    pub data_dir: PathBuf,

    /// Results scored below this are queued for review.
    pub confidence_threshold: f64,

    /// How many of the most frequent tags to synthesize after a session.
    pub synthesis_top_n: usize,

    /// Maximum number of tasks dispatched in one session.
    pub max_tasks_per_session: usize,

    /// Reference list checked against stored topics to find gaps.
    pub reference_topics: Vec<String>,

    /// Exploratory topics run after gap tasks.
    pub exploration_topics: Vec<String>,

    /// Root that `backup_files` and `entry_point` are relative to.
    pub source_root: PathBuf,

    /// Files snapshotted before any self-modification.
    pub backup_files: Vec<PathBuf>,

    /// File syntax-checked after changes are applied.
    pub entry_point: PathBuf,

    /// Maximum number of backup snapshots retained.
    pub max_backups: usize,

    /// Scheduler tick period.
    pub tick_interval: Duration,

    /// Delay before a failed scheduled task is retried.
    pub retry_delay: Duration,

    /// Command backing the producer (optional).
    pub producer_command: Option<String>,

    /// Arguments passed to the producer command.
    pub producer_args: Vec<String>,

    /// Command backing the change proposer (optional).
    pub proposer_command: Option<String>,

    /// Arguments passed to the proposer command.
    pub proposer_args: Vec<String>,

    /// Timeout for command-backed collaborators, in seconds.
    pub command_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            synthesis_top_n: DEFAULT_SYNTHESIS_TOP_N,
            max_tasks_per_session: DEFAULT_MAX_TASKS_PER_SESSION,
            reference_topics: DEFAULT_REFERENCE_TOPICS
                .iter()
                .map(|t| t.to_string())
                .collect(),
            exploration_topics: default_exploration_topics(),
            source_root: PathBuf::from("."),
            backup_files: Vec::new(),
            entry_point: PathBuf::from(DEFAULT_ENTRY_POINT),
            max_backups: DEFAULT_MAX_BACKUPS,
            tick_interval: Duration::from_secs(DEFAULT_TICK_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            producer_command: None,
            producer_args: Vec::new(),
            proposer_command: None,
            proposer_args: Vec::new(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Create a new Config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the review confidence threshold.
    pub fn confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Set how many top tags are synthesized per session.
    pub fn synthesis_top_n(mut self, n: usize) -> Self {
        self.synthesis_top_n = n;
        self
    }

    /// Set the maximum number of tasks per session.
    pub fn max_tasks_per_session(mut self, max: usize) -> Self {
        self.max_tasks_per_session = max;
        self
    }

    /// Replace the reference topic list.
    pub fn reference_topics(mut self, topics: Vec<String>) -> Self {
        self.reference_topics = topics;
        self
    }

    /// Replace the exploration topic list.
    pub fn exploration_topics(mut self, topics: Vec<String>) -> Self {
        self.exploration_topics = topics;
        self
    }

    /// Set the source root for backups and syntax checks.
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = root.into();
        self
    }

    /// Set the files snapshotted before self-modification.
    pub fn backup_files(mut self, files: Vec<PathBuf>) -> Self {
        self.backup_files = files;
        self
    }

    /// Add one file to the backup set.
    pub fn add_backup_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.backup_files.push(file.into());
        self
    }

    /// Set the entry point checked after changes are applied.
    pub fn entry_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.entry_point = path.into();
        self
    }

    /// Set the number of retained backups.
    pub fn max_backups(mut self, max: usize) -> Self {
        self.max_backups = max;
        self
    }

    /// Set the scheduler tick period.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the scheduler retry delay.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the producer command.
    pub fn producer_command(mut self, command: impl Into<String>) -> Self {
        self.producer_command = Some(command.into());
        self
    }

    /// Set the producer arguments from a string (space-separated).
    pub fn producer_args_str(mut self, args: impl Into<String>) -> Self {
        self.producer_args = args.into().split_whitespace().map(String::from).collect();
        self
    }

    /// Set the proposer command.
    pub fn proposer_command(mut self, command: impl Into<String>) -> Self {
        self.proposer_command = Some(command.into());
        self
    }

    /// Set the proposer arguments from a string (space-separated).
    pub fn proposer_args_str(mut self, args: impl Into<String>) -> Self {
        self.proposer_args = args.into().split_whitespace().map(String::from).collect();
        self
    }

    /// Set the timeout for command-backed collaborators.
    pub fn command_timeout_secs(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    /// Resolve a path from the backup set against the source root.
    pub fn resolve_source(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.source_root.join(path)
        }
    }

    /// Check that all values are in range.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(Error::config_error(format!(
                "confidence threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.max_backups == 0 {
            return Err(Error::config_error("max_backups must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::config_error("tick interval must be non-zero"));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::config_error("command timeout must be non-zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from(".autoscholar"));
        assert!((config.confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.synthesis_top_n, 3);
        assert_eq!(config.max_backups, 10);
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.retry_delay, Duration::from_secs(300));
        assert_eq!(config.reference_topics.len(), DEFAULT_REFERENCE_TOPICS.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = Config::new()
            .data_dir("/tmp/scholar")
            .confidence_threshold(0.5)
            .synthesis_top_n(1)
            .max_tasks_per_session(2)
            .add_backup_file("src/lib.rs")
            .entry_point("src/lib.rs")
            .max_backups(3)
            .producer_command("research-agent")
            .producer_args_str("--json --quiet");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/scholar"));
        assert!((config.confidence_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.synthesis_top_n, 1);
        assert_eq!(config.max_tasks_per_session, 2);
        assert_eq!(config.backup_files, vec![PathBuf::from("src/lib.rs")]);
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.producer_command.as_deref(), Some("research-agent"));
        assert_eq!(config.producer_args, vec!["--json", "--quiet"]);
    }

    #[test]
    fn test_resolve_source() {
        let config = Config::new().source_root("/srv/app");
        assert_eq!(
            config.resolve_source(std::path::Path::new("src/main.rs")),
            PathBuf::from("/srv/app/src/main.rs")
        );
        assert_eq!(
            config.resolve_source(std::path::Path::new("/etc/hosts")),
            PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        assert!(matches!(
            Config::new().confidence_threshold(1.5).validate(),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            Config::new().max_backups(0).validate(),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            Config::new().tick_interval(Duration::ZERO).validate(),
            Err(Error::Config { .. })
        ));
    }
}
