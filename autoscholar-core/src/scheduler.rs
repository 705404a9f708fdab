//! Recurring task scheduler.
//!
//! Holds recurring task definitions with computed next-run times and
//! advances them on a fixed tick. A tick holds the task table for its whole
//! duration, so ticks never overlap and a due task's pipeline finishes
//! before the next tick starts.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::persist::{ensure_dir, load_or_default, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SCHEDULE_FILE: &str = "schedule.json";

/// Longest accepted hourly interval: one leap year.
pub const MAX_INTERVAL_HOURS: u32 = 24 * 366;

/// How often a task recurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "every", rename_all = "snake_case")]
pub enum Frequency {
    /// Every `interval_hours` hours, on the hour.
    Hourly {
        /// Hours between runs, 1 to `MAX_INTERVAL_HOURS`.
        interval_hours: u32,
    },
    /// Once a day at `hour`:00.
    Daily {
        /// Hour of day, 0-23.
        hour: u32,
    },
    /// Once a week on `weekday` at `hour`:00.
    Weekly {
        /// Day of week, Monday = 0.
        weekday: u32,
        /// Hour of day, 0-23.
        hour: u32,
    },
}

impl Frequency {
    /// Check that hours and weekdays are in range.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the invalid field.
    pub fn validate(&self) -> Result<()> {
        let (hour, weekday, interval) = match *self {
            Frequency::Hourly { interval_hours } => (0, 0, interval_hours),
            Frequency::Daily { hour } => (hour, 0, 1),
            Frequency::Weekly { weekday, hour } => (hour, weekday, 1),
        };
        if interval == 0 {
            return Err(Error::config_error("hourly interval must be at least 1"));
        }
        if interval > MAX_INTERVAL_HOURS {
            return Err(Error::config_error(format!(
                "hourly interval must be at most {MAX_INTERVAL_HOURS}, got {interval}"
            )));
        }
        if hour > 23 {
            return Err(Error::config_error(format!("hour must be 0-23, got {hour}")));
        }
        if weekday > 6 {
            return Err(Error::config_error(format!(
                "weekday must be 0-6 (Monday = 0), got {weekday}"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Hourly { interval_hours } => write!(f, "hourly:{interval_hours}"),
            Frequency::Daily { hour } => write!(f, "daily:{hour}"),
            Frequency::Weekly { weekday, hour } => write!(f, "weekly:{weekday}@{hour}"),
        }
    }
}

impl FromStr for Frequency {
    type Err = Error;

    /// Parse `hourly:N`, `daily:H` or `weekly:D@H`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::config_error(format!("invalid frequency '{s}'"));
        let number = |v: &str| v.trim().parse::<u32>().map_err(|_| invalid());

        let (kind, value) = s.split_once(':').ok_or_else(invalid)?;
        let frequency = match kind.trim() {
            "hourly" => Frequency::Hourly {
                interval_hours: number(value)?,
            },
            "daily" => Frequency::Daily {
                hour: number(value)?,
            },
            "weekly" => {
                let (day, hour) = value.split_once('@').ok_or_else(invalid)?;
                Frequency::Weekly {
                    weekday: number(day)?,
                    hour: number(hour)?,
                }
            }
            _ => return Err(invalid()),
        };
        frequency.validate()?;
        Ok(frequency)
    }
}

fn at_hour(date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    Utc.from_utc_datetime(&date.and_time(time))
}

/// Next run strictly after `now`.
///
/// Out-of-range fields (e.g. from a hand-edited schedule) are clamped.
pub fn next_run_for(frequency: Frequency, now: DateTime<Utc>) -> DateTime<Utc> {
    match frequency {
        Frequency::Hourly { interval_hours } => {
            let hours = interval_hours.clamp(1, MAX_INTERVAL_HOURS);
            let later = now
                .checked_add_signed(chrono::Duration::hours(i64::from(hours)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            at_hour(later.date_naive(), later.hour())
        }
        Frequency::Daily { hour } => at_hour(now.date_naive() + chrono::Duration::days(1), hour),
        Frequency::Weekly { weekday, hour } => {
            let today = now.weekday().num_days_from_monday();
            let days_until = match (weekday.min(6) + 7 - today) % 7 {
                0 => 7,
                n => n,
            };
            at_hour(
                now.date_naive() + chrono::Duration::days(i64::from(days_until)),
                hour,
            )
        }
    }
}

/// What a scheduled task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledTaskKind {
    /// Research one topic.
    Research,
    /// Run a full gap-driven session.
    Session,
}

impl FromStr for ScheduledTaskKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "research" => Ok(ScheduledTaskKind::Research),
            "session" => Ok(ScheduledTaskKind::Session),
            other => Err(Error::config_error(format!("unknown task type '{other}'"))),
        }
    }
}

impl std::fmt::Display for ScheduledTaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduledTaskKind::Research => write!(f, "research"),
            ScheduledTaskKind::Session => write!(f, "session"),
        }
    }
}

/// A recurring task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Unique id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// What the task runs.
    #[serde(rename = "type")]
    pub kind: ScheduledTaskKind,
    /// Topic handed to the executor.
    pub topic: String,
    /// Recurrence.
    pub frequency: Frequency,
    /// Disabled tasks are never run.
    pub enabled: bool,
    /// Last successful run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Next time the task is due.
    pub next_run: DateTime<Utc>,
    /// When the task was added.
    pub created_at: DateTime<Utc>,
}

/// Input for `Scheduler::add_task`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledTask {
    /// Display name.
    pub name: String,
    /// What the task runs.
    pub kind: ScheduledTaskKind,
    /// Topic handed to the executor.
    pub topic: String,
    /// Recurrence.
    pub frequency: Frequency,
}

/// Runs a due task. Implemented by the session orchestrator.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task` to completion.
    ///
    /// # Errors
    ///
    /// Any error schedules a short retry instead of the next regular slot.
    async fn execute(&self, task: &ScheduledTask) -> Result<()>;
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tasks that succeeded.
    pub succeeded: usize,
    /// Tasks that failed and were rescheduled for retry.
    pub failed: usize,
}

/// Snapshot of scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    /// Whether the tick loop is running.
    pub running: bool,
    /// Number of tasks.
    pub task_count: usize,
    /// Number of enabled tasks.
    pub enabled_count: usize,
    /// Name and time of the next enabled task due.
    pub next_due: Option<(String, DateTime<Utc>)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ScheduleDoc {
    tasks: Vec<ScheduledTask>,
}

struct Inner {
    path: PathBuf,
    executor: Arc<dyn TaskExecutor>,
    tick_interval: Duration,
    retry_delay: Duration,
    tasks: Mutex<ScheduleDoc>,
    running: AtomicBool,
    stop: Notify,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// The task scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("path", &self.inner.path)
            .field("tick_interval", &self.inner.tick_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    /// Open (or create) a schedule rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` or `Error::Serialization` if the schedule
    /// cannot be loaded.
    pub fn open(
        root: impl AsRef<Path>,
        executor: Arc<dyn TaskExecutor>,
        tick_interval: Duration,
        retry_delay: Duration,
    ) -> Result<Self> {
        let root = root.as_ref();
        ensure_dir(root)?;
        let path = root.join(SCHEDULE_FILE);
        let doc: ScheduleDoc = load_or_default(&path)?;
        debug!(tasks = doc.tasks.len(), "opened schedule");

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                executor,
                tick_interval,
                retry_delay,
                tasks: Mutex::new(doc),
                running: AtomicBool::new(false),
                stop: Notify::new(),
                handle: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Open the schedule in `config.data_dir` with the configured timing.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::open`].
    pub fn from_config(config: &Config, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        Self::open(
            &config.data_dir,
            executor,
            config.tick_interval,
            config.retry_delay,
        )
    }

    /// Whether the tick loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Add a task; its first run is computed from now.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid frequency and `Error::Storage`
    /// if the schedule could not be written.
    pub async fn add_task(&self, task: NewScheduledTask) -> Result<ScheduledTask> {
        task.frequency.validate()?;
        let now = Utc::now();
        let scheduled = ScheduledTask {
            id: Uuid::now_v7(),
            name: task.name,
            kind: task.kind,
            topic: task.topic,
            frequency: task.frequency,
            enabled: true,
            last_run: None,
            next_run: next_run_for(task.frequency, now),
            created_at: now,
        };

        let mut doc = self.inner.tasks.lock().await;
        let mut next = doc.clone();
        next.tasks.push(scheduled.clone());
        write_atomic(&self.inner.path, &next)?;
        *doc = next;

        info!(id = %scheduled.id, name = %scheduled.name, next_run = %scheduled.next_run, "scheduled task");
        Ok(scheduled)
    }

    /// Remove a task.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub async fn remove_task(&self, id: Uuid) -> Result<ScheduledTask> {
        let mut doc = self.inner.tasks.lock().await;
        let mut next = doc.clone();
        let idx = next
            .tasks
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| Error::not_found("scheduled task", id.to_string()))?;
        let removed = next.tasks.remove(idx);
        write_atomic(&self.inner.path, &next)?;
        *doc = next;
        info!(id = %removed.id, name = %removed.name, "removed scheduled task");
        Ok(removed)
    }

    /// Enable or disable a task.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<ScheduledTask> {
        let mut doc = self.inner.tasks.lock().await;
        let mut next = doc.clone();
        let task = next
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::not_found("scheduled task", id.to_string()))?;
        task.enabled = enabled;
        let updated = task.clone();
        write_atomic(&self.inner.path, &next)?;
        *doc = next;
        Ok(updated)
    }

    /// All tasks, in insertion order.
    pub async fn list(&self) -> Vec<ScheduledTask> {
        self.inner.tasks.lock().await.tasks.clone()
    }

    /// Current state.
    pub async fn status(&self) -> SchedulerStatus {
        let doc = self.inner.tasks.lock().await;
        let next_due = doc
            .tasks
            .iter()
            .filter(|t| t.enabled)
            .min_by_key(|t| t.next_run)
            .map(|t| (t.name.clone(), t.next_run));
        SchedulerStatus {
            running: self.is_running(),
            task_count: doc.tasks.len(),
            enabled_count: doc.tasks.iter().filter(|t| t.enabled).count(),
            next_due,
        }
    }

    /// Run every enabled task due at `now`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` if the updated schedule could not be
    /// written. Task failures are not errors; they are rescheduled.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut doc = self.inner.tasks.lock().await;
        let mut report = TickReport::default();
        let retry = chrono::Duration::from_std(self.inner.retry_delay)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));

        let mut next = doc.clone();
        for idx in 0..next.tasks.len() {
            let task = next.tasks[idx].clone();
            if !task.enabled || task.next_run > now {
                continue;
            }

            info!(name = %task.name, kind = %task.kind, topic = %task.topic, "running scheduled task");
            match self.inner.executor.execute(&task).await {
                Ok(()) => {
                    let slot = &mut next.tasks[idx];
                    slot.last_run = Some(now);
                    slot.next_run = next_run_for(task.frequency, now);
                    report.succeeded += 1;
                    debug!(name = %task.name, next_run = %slot.next_run, "scheduled task succeeded");
                }
                Err(e) => {
                    let slot = &mut next.tasks[idx];
                    slot.next_run = now
                        .checked_add_signed(retry)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    report.failed += 1;
                    warn!(name = %task.name, error = %e, retry_at = %slot.next_run, "scheduled task failed");
                }
            }
        }

        if report.succeeded + report.failed > 0 {
            write_atomic(&self.inner.path, &next)?;
            *doc = next;
        }
        Ok(report)
    }

    /// Start the tick loop, ticking once immediately.
    ///
    /// Returns `false` (and logs a warning) when already running.
    pub async fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("scheduler already running");
            return false;
        }

        if let Err(e) = self.tick(Utc::now()).await {
            error!(error = %e, "scheduler tick failed");
        }

        let scheduler = self.clone();
        let period = self.inner.tick_interval;
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = scheduler.tick(Utc::now()).await {
                            error!(error = %e, "scheduler tick failed");
                        }
                    }
                    _ = scheduler.inner.stop.notified() => break,
                }
            }
            debug!("scheduler loop exited");
        });

        *self
            .inner
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
        info!(period_secs = period.as_secs(), "scheduler started");
        true
    }

    /// Stop the tick loop, waiting for an in-flight tick to finish.
    ///
    /// Returns `false` when it was not running.
    pub async fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            warn!("scheduler not running");
            return false;
        }
        self.inner.stop.notify_one();

        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop panicked");
            }
        }
        info!("scheduler stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_hourly_zeroes_minutes() {
        let now = utc(2024, 3, 6, 10, 42);
        let next = next_run_for(Frequency::Hourly { interval_hours: 2 }, now);
        assert_eq!(next, utc(2024, 3, 6, 12, 0));
    }

    #[test]
    fn test_daily_is_next_calendar_day() {
        let now = utc(2024, 3, 6, 6, 0);
        let next = next_run_for(Frequency::Daily { hour: 9 }, now);
        assert_eq!(next, utc(2024, 3, 7, 9, 0));
    }

    #[test]
    fn test_weekly_same_day_advances_a_week() {
        // 2024-03-06 is a Wednesday (weekday 2).
        let now = utc(2024, 3, 6, 8, 0);
        let next = next_run_for(Frequency::Weekly { weekday: 2, hour: 9 }, now);
        assert_eq!(next, utc(2024, 3, 13, 9, 0));

        let next = next_run_for(Frequency::Weekly { weekday: 4, hour: 9 }, now);
        assert_eq!(next, utc(2024, 3, 8, 9, 0));

        let next = next_run_for(Frequency::Weekly { weekday: 0, hour: 0 }, now);
        assert_eq!(next, utc(2024, 3, 11, 0, 0));
    }

    #[test]
    fn test_next_run_always_after_now() {
        let specs = [
            Frequency::Hourly { interval_hours: 1 },
            Frequency::Hourly { interval_hours: 0 },
            Frequency::Hourly { interval_hours: 25 },
            Frequency::Daily { hour: 0 },
            Frequency::Daily { hour: 23 },
            Frequency::Weekly { weekday: 0, hour: 0 },
            Frequency::Weekly { weekday: 6, hour: 23 },
            Frequency::Weekly { weekday: 3, hour: 12 },
        ];
        let start = utc(2024, 12, 28, 0, 0);
        for step in 0..(24 * 9 * 4) {
            let now = start + chrono::Duration::minutes(15 * step) + chrono::Duration::seconds(7);
            for spec in specs {
                assert!(next_run_for(spec, now) > now, "{spec} at {now}");
            }
        }
    }

    #[test]
    fn test_frequency_parse_and_display() {
        assert_eq!(
            "hourly:3".parse::<Frequency>().unwrap(),
            Frequency::Hourly { interval_hours: 3 }
        );
        assert_eq!(
            "weekly:6@21".parse::<Frequency>().unwrap(),
            Frequency::Weekly { weekday: 6, hour: 21 }
        );
        assert_eq!(Frequency::Daily { hour: 9 }.to_string(), "daily:9");
        assert!("daily:24".parse::<Frequency>().is_err());
        assert!("weekly:7@1".parse::<Frequency>().is_err());
        assert!("monthly:1".parse::<Frequency>().is_err());
        assert!("hourly:0".parse::<Frequency>().is_err());
        assert!("hourly:8784".parse::<Frequency>().is_ok());
        assert!(matches!(
            "hourly:4294967295".parse::<Frequency>(),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_huge_hourly_interval_is_clamped() {
        let now = utc(2024, 3, 6, 10, 42);
        let huge = next_run_for(Frequency::Hourly { interval_hours: u32::MAX }, now);
        assert_eq!(
            huge,
            next_run_for(
                Frequency::Hourly {
                    interval_hours: MAX_INTERVAL_HOURS
                },
                now
            )
        );
        assert!(huge > now);
    }

    struct CountingExecutor {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingExecutor {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(fail),
            })
        }
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, _task: &ScheduledTask) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                Err(Error::production("collaborator down"))
            } else {
                Ok(())
            }
        }
    }

    fn new_task(frequency: Frequency) -> NewScheduledTask {
        NewScheduledTask {
            name: "daily digest".to_string(),
            kind: ScheduledTaskKind::Research,
            topic: "agent planning".to_string(),
            frequency,
        }
    }

    fn scheduler(dir: &Path, executor: Arc<CountingExecutor>) -> Scheduler {
        Scheduler::open(
            dir,
            executor,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_tick_runs_due_task_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CountingExecutor::new(false);
        let scheduler = scheduler(dir.path(), executor.clone());
        let task = scheduler
            .add_task(new_task(Frequency::Daily { hour: 9 }))
            .await
            .unwrap();

        let report = scheduler.tick(task.next_run - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(report, TickReport::default());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

        let now = task.next_run + chrono::Duration::minutes(3);
        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let updated = &scheduler.list().await[0];
        assert_eq!(updated.last_run, Some(now));
        assert_eq!(updated.next_run, next_run_for(task.frequency, now));
        assert!(updated.next_run > now);
    }

    #[tokio::test]
    async fn test_failed_task_retries_soon_without_advancing_last_run() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CountingExecutor::new(true);
        let scheduler = scheduler(dir.path(), executor.clone());
        let task = scheduler
            .add_task(new_task(Frequency::Weekly { weekday: 1, hour: 6 }))
            .await
            .unwrap();

        let now = task.next_run;
        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.failed, 1);

        let updated = &scheduler.list().await[0];
        assert_eq!(updated.last_run, None);
        assert_eq!(updated.next_run, now + chrono::Duration::minutes(5));

        executor.fail.store(false, Ordering::SeqCst);
        let later = now + chrono::Duration::minutes(5);
        scheduler.tick(later).await.unwrap();
        let updated = &scheduler.list().await[0];
        assert_eq!(updated.last_run, Some(later));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_add_task_rejects_oversized_interval() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler(dir.path(), CountingExecutor::new(false));
        let result = scheduler
            .add_task(new_task(Frequency::Hourly {
                interval_hours: u32::MAX,
            }))
            .await;
        assert!(matches!(result, Err(Error::Config { .. })));
        assert!(scheduler.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_schedule_write_leaves_tasks_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CountingExecutor::new(false);
        let scheduler = scheduler(dir.path(), executor.clone());
        let task = scheduler
            .add_task(new_task(Frequency::Daily { hour: 4 }))
            .await
            .unwrap();

        // A directory in place of the schedule file makes the rename fail.
        let path = dir.path().join(SCHEDULE_FILE);
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let result = scheduler.tick(task.next_run).await;
        assert!(matches!(result, Err(Error::Storage { .. })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.list().await[0], task);

        std::fs::remove_dir(&path).unwrap();
        let report = scheduler.tick(task.next_run).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(scheduler.list().await[0].last_run, Some(task.next_run));
    }

    #[tokio::test]
    async fn test_disabled_task_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CountingExecutor::new(false);
        let scheduler = scheduler(dir.path(), executor.clone());
        let task = scheduler
            .add_task(new_task(Frequency::Hourly { interval_hours: 1 }))
            .await
            .unwrap();
        scheduler.set_enabled(task.id, false).await.unwrap();

        scheduler
            .tick(task.next_run + chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CountingExecutor::new(false);
        let first = {
            let scheduler = scheduler(dir.path(), executor.clone());
            let first = scheduler
                .add_task(new_task(Frequency::Daily { hour: 1 }))
                .await
                .unwrap();
            scheduler
                .add_task(new_task(Frequency::Daily { hour: 2 }))
                .await
                .unwrap();
            first
        };

        let scheduler = scheduler(dir.path(), executor);
        assert_eq!(scheduler.list().await.len(), 2);
        scheduler.remove_task(first.id).await.unwrap();
        assert!(matches!(
            scheduler.remove_task(first.id).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(scheduler.status().await.task_count, 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_ticks_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let due = ScheduledTask {
            id: Uuid::now_v7(),
            name: "overdue".to_string(),
            kind: ScheduledTaskKind::Session,
            topic: String::new(),
            frequency: Frequency::Hourly { interval_hours: 1 },
            enabled: true,
            last_run: None,
            next_run: now - chrono::Duration::hours(2),
            created_at: now - chrono::Duration::hours(3),
        };
        write_atomic(
            &dir.path().join(SCHEDULE_FILE),
            &ScheduleDoc { tasks: vec![due] },
        )
        .unwrap();

        let executor = CountingExecutor::new(false);
        let scheduler = scheduler(dir.path(), executor.clone());

        assert!(scheduler.start().await);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.start().await);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.status().await.running);

        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running());
        assert!(!scheduler.stop().await);
    }
}
