//! Autoscholar CLI - An autonomous research agent loop.

use anyhow::{Context, Result};
use async_trait::async_trait;
use autoscholar_core::{
    AnnotationPatch, Collaborators, CommandProducer, CommandProposer, Config, Event,
    EventReceiver, FailureDescriptor, FeedbackItem, FeedbackQueue, Frequency, KnowledgeStore,
    ModificationLedger, NewScheduledTask, NewTool, Orchestrator, ParamSpec, Review,
    ScheduledTask, ScheduledTaskKind, Scheduler, SessionReport, StoredEntryVerifier,
    TaskExecutor, TokenOverlap, ToolRegistry,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Autoscholar - Run autonomous research sessions that learn from review.
///
/// Autoscholar researches the gaps in its knowledge store with an external
/// producer command, queues low-confidence results for human review and
/// tries to fix its own failures through a backed-up modification ledger.
#[derive(Parser, Debug)]
#[command(name = "autoscholar")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding all persisted stores.
    #[arg(
        short = 'd',
        long = "data-dir",
        global = true,
        default_value = ".autoscholar",
        env = "AUTOSCHOLAR_DATA_DIR"
    )]
    pub data_dir: PathBuf,

    /// Enable debug logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Print results as JSON.
    #[arg(long = "json", global = true)]
    pub json: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shaping sessions and self-modification.
#[derive(Args, Debug)]
pub struct PipelineArgs {
    /// Command that produces research content.
    ///
    /// The prompt is passed as the final argument; stdout is parsed as JSON
    /// or taken as plain text.
    #[arg(long = "producer", global = true, env = "AUTOSCHOLAR_PRODUCER")]
    pub producer: Option<String>,

    /// Arguments passed to the producer before the prompt (space-separated).
    #[arg(
        long = "producer-args",
        global = true,
        default_value = "",
        allow_hyphen_values = true,
        env = "AUTOSCHOLAR_PRODUCER_ARGS"
    )]
    pub producer_args: String,

    /// Command that proposes source changes for failures.
    #[arg(long = "proposer", global = true, env = "AUTOSCHOLAR_PROPOSER")]
    pub proposer: Option<String>,

    /// Arguments passed to the proposer before the prompt (space-separated).
    #[arg(
        long = "proposer-args",
        global = true,
        default_value = "",
        allow_hyphen_values = true,
        env = "AUTOSCHOLAR_PROPOSER_ARGS"
    )]
    pub proposer_args: String,

    /// Timeout in seconds for producer and proposer commands.
    #[arg(long = "timeout", global = true, default_value = "600")]
    pub timeout: u64,

    /// Results scored below this are queued for review.
    #[arg(long = "threshold", global = true, default_value = "0.7")]
    pub threshold: f64,

    /// Maximum tasks per session.
    #[arg(long = "max-tasks", global = true, default_value = "5")]
    pub max_tasks: usize,

    /// Number of top tags synthesized after a session.
    #[arg(long = "top-n", global = true, default_value = "3")]
    pub top_n: usize,

    /// Root of the source tree the modification ledger works on.
    #[arg(
        long = "source-root",
        global = true,
        default_value = ".",
        env = "AUTOSCHOLAR_SOURCE_ROOT"
    )]
    pub source_root: PathBuf,

    /// File snapshotted before self-modification (repeatable).
    #[arg(long = "backup-file", global = true)]
    pub backup_files: Vec<PathBuf>,

    /// File syntax-checked after changes are applied.
    #[arg(long = "entry-point", global = true, default_value = "src/main.rs")]
    pub entry_point: PathBuf,

    /// Number of backups kept.
    #[arg(long = "max-backups", global = true, default_value = "10")]
    pub max_backups: usize,

    /// How proposed changes are written.
    #[arg(long = "patch", global = true, value_enum, default_value = "manual")]
    pub patch: PatchMode,
}

/// How proposed changes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PatchMode {
    /// Record changes for a human to apply.
    Manual,
    /// Append a comment block describing each change.
    Annotate,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run research sessions.
    #[command(subcommand)]
    Session(SessionCommand),

    /// Show knowledge and review statistics.
    Stats,

    /// Search the knowledge store.
    Search {
        /// Text to look for.
        query: String,
        /// Maximum number of results.
        #[arg(short = 'k', long = "limit", default_value = "10")]
        limit: usize,
        /// Rank results by word overlap instead of plain matching.
        #[arg(long = "similar")]
        similar: bool,
    },

    /// Review queued results.
    #[command(subcommand)]
    Feedback(FeedbackCommand),

    /// Inspect and drive self-modification.
    #[command(subcommand)]
    Modify(ModifyCommand),

    /// Manage recurring tasks.
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Manage registered tools.
    #[command(subcommand)]
    Tools(ToolsCommand),
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// Research the current knowledge gaps.
    Run {
        /// Session name (defaults to a timestamp).
        #[arg(short = 'n', long = "name")]
        name: Option<String>,
    },
    /// Research a single topic.
    Topic {
        /// Topic to research.
        topic: String,
        /// Session name (defaults to a timestamp).
        #[arg(short = 'n', long = "name")]
        name: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    Approved,
    Rejected,
}

/// Reviewer details shared by approve and reject.
#[derive(Args, Debug)]
pub struct ReviewArgs {
    /// Feedback item id.
    pub id: Uuid,
    /// Who is reviewing.
    #[arg(long = "reviewer")]
    pub reviewer: Option<String>,
    /// Free-form comments.
    #[arg(long = "comments")]
    pub comments: Option<String>,
    /// Corrected content.
    #[arg(long = "corrections")]
    pub corrections: Option<String>,
    /// Rating from 1 to 5.
    #[arg(long = "rating")]
    pub rating: Option<u8>,
}

impl ReviewArgs {
    fn into_review(self, approved: bool) -> (Uuid, Review) {
        let mut review = if approved {
            Review::approve()
        } else {
            Review::reject()
        };
        if let Some(reviewer) = self.reviewer {
            review = review.reviewer(reviewer);
        }
        if let Some(comments) = self.comments {
            review = review.comments(comments);
        }
        if let Some(corrections) = self.corrections {
            review = review.corrections(corrections);
        }
        if let Some(rating) = self.rating {
            review = review.rating(rating);
        }
        (self.id, review)
    }
}

#[derive(Subcommand, Debug)]
pub enum FeedbackCommand {
    /// List items.
    List {
        /// Which partition to list.
        #[arg(long = "status", value_enum, default_value = "pending")]
        status: StatusFilter,
    },
    /// Approve a pending item.
    Approve(ReviewArgs),
    /// Reject a pending item.
    Reject(ReviewArgs),
    /// Show what has been learned from reviews.
    Insights,
}

#[derive(Subcommand, Debug)]
pub enum ModifyCommand {
    /// Run a modification cycle for a failure.
    Trigger {
        /// Error text of the failure.
        #[arg(short = 'e', long = "error")]
        error: String,
        /// Where the failure happened.
        #[arg(short = 'o', long = "origin", default_value = "manual")]
        origin: String,
    },
    /// Restore a backup over the live files.
    Revert {
        /// Backup id.
        backup_id: Uuid,
    },
    /// Show the modification history.
    History,
    /// List backups, newest first.
    Backups,
}

#[derive(Subcommand, Debug)]
pub enum ScheduleCommand {
    /// Run the scheduler until interrupted.
    Start {
        /// Tick period in seconds.
        #[arg(long = "tick", default_value = "60")]
        tick: u64,
        /// Retry delay in seconds after a failed task.
        #[arg(long = "retry", default_value = "300")]
        retry: u64,
    },

    #[command(flatten)]
    Edit(ScheduleEdit),
}

#[derive(Subcommand, Debug)]
pub enum ScheduleEdit {
    /// Add a recurring task.
    Add {
        /// Task name.
        #[arg(short = 'n', long = "name")]
        name: String,
        /// What to run: research or session.
        #[arg(short = 't', long = "type", default_value = "research")]
        kind: ScheduledTaskKind,
        /// Topic for research tasks.
        #[arg(long = "topic", default_value = "")]
        topic: String,
        /// hourly:N, daily:H or weekly:D@H (Monday = 0).
        #[arg(short = 'e', long = "every")]
        every: Frequency,
    },
    /// Remove a task.
    Remove {
        /// Task id.
        id: Uuid,
    },
    /// Enable a task.
    Enable {
        /// Task id.
        id: Uuid,
    },
    /// Disable a task.
    Disable {
        /// Task id.
        id: Uuid,
    },
    /// List tasks.
    List,
}

#[derive(Subcommand, Debug)]
pub enum ToolsCommand {
    /// Register a tool.
    Create {
        /// Unique tool name.
        name: String,
        /// Tool category.
        #[arg(short = 't', long = "type", default_value = "custom")]
        kind: String,
        /// What the tool does.
        #[arg(long = "description", default_value = "")]
        description: String,
        /// Parameter as name:type, with a trailing '?' when optional.
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// List tools.
    List,
    /// Record an invocation of a tool.
    Invoke {
        /// Tool name.
        name: String,
    },
    /// Delete a tool.
    Delete {
        /// Tool name.
        name: String,
    },
}

impl Cli {
    /// Convert CLI arguments to a Config.
    pub fn to_config(&self) -> Config {
        let p = &self.pipeline;
        let mut config = Config::new()
            .data_dir(&self.data_dir)
            .confidence_threshold(p.threshold)
            .max_tasks_per_session(p.max_tasks)
            .synthesis_top_n(p.top_n)
            .source_root(&p.source_root)
            .backup_files(p.backup_files.clone())
            .entry_point(&p.entry_point)
            .max_backups(p.max_backups)
            .producer_args_str(&p.producer_args)
            .proposer_args_str(&p.proposer_args)
            .command_timeout_secs(p.timeout);

        if let Some(ref command) = p.producer {
            config = config.producer_command(command);
        }

        if let Some(ref command) = p.proposer {
            config = config.proposer_command(command);
        }

        config
    }
}

fn parse_param(spec: &str) -> Result<ParamSpec> {
    let (name, kind) = spec
        .split_once(':')
        .with_context(|| format!("parameter '{spec}' must look like name:type"))?;
    Ok(match kind.strip_suffix('?') {
        Some(kind) => ParamSpec::optional(name, kind),
        None => ParamSpec::required(name, kind),
    })
}

fn default_session_name() -> String {
    format!("session-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_event(event: &Event) {
    match event {
        Event::SessionStarted { session, tasks } => {
            println!("Session '{session}' started with {tasks} tasks")
        }
        Event::TaskStarted { index, topic } => println!("  [{index}] {topic}"),
        Event::TaskCompleted {
            score, verified, ..
        } => println!(
            "      stored (score {score:.2}{})",
            if *verified { ", verified" } else { "" }
        ),
        Event::TaskFailed { message, .. } => println!("      failed: {message}"),
        Event::ReviewQueued { item_id, .. } => println!("      queued for review: {item_id}"),
        Event::Synthesized { topic } => println!("  synthesized '{topic}'"),
        Event::ModificationAttempted { improved, reason } => {
            println!("  self-modification: improved={improved} ({reason})")
        }
        Event::Warning { message } => eprintln!("  warning: {message}"),
        Event::SessionFinished { metrics } => println!(
            "Session finished: {} completed, {} failed, {} verified in {:.1}s",
            metrics.tasks_completed,
            metrics.tasks_failed,
            metrics.verifications_passed,
            metrics.research_time_seconds
        ),
    }
}

fn spawn_event_printer(mut events: EventReceiver, quiet: bool) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !quiet {
                print_event(&event);
            }
        }
    })
}

fn print_item(item: &FeedbackItem) {
    let first_line = item.content.lines().next().unwrap_or_default();
    println!(
        "{}  {:<8}  {:.2}  {}",
        item.id, item.status, item.confidence, first_line
    );
}

fn open_ledger(config: &Config, patch: PatchMode) -> Result<ModificationLedger> {
    let mut ledger = ModificationLedger::from_config(config)?;
    if let Some(proposer) = CommandProposer::from_config(config) {
        ledger = ledger.with_proposer(Arc::new(proposer));
    }
    if patch == PatchMode::Annotate {
        ledger = ledger.with_patch_strategy(Arc::new(AnnotationPatch::default()));
    }
    Ok(ledger)
}

fn build_orchestrator(
    config: &Config,
    patch: PatchMode,
) -> Result<(Orchestrator, EventReceiver)> {
    let producer = CommandProducer::from_config(config).ok_or_else(|| {
        autoscholar_core::Error::config_error(
            "no producer configured; pass --producer or set AUTOSCHOLAR_PRODUCER",
        )
    })?;
    let knowledge = Arc::new(
        KnowledgeStore::open(&config.data_dir)?
            .with_reference_topics(config.reference_topics.clone()),
    );
    let feedback = Arc::new(FeedbackQueue::open(&config.data_dir)?);
    let ledger = Arc::new(open_ledger(config, patch)?);
    let verifier = Arc::new(StoredEntryVerifier::new(knowledge.clone()));

    Ok(Orchestrator::new(
        config.clone(),
        knowledge,
        feedback,
        ledger,
        Collaborators::new(Arc::new(producer), verifier),
    ))
}

fn print_report(report: &SessionReport) {
    if !report.reflections.is_empty() {
        println!("Reflections:");
        for reflection in &report.reflections {
            println!("  - {reflection}");
        }
    }
    if let Some(ref outcome) = report.improvement {
        if let Some(ref record) = outcome.record {
            println!("Backup {} taken before modification", record.backup_id);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.to_config();
    config.validate()?;
    debug!(?config, "resolved configuration");

    match cli.command {
        Command::Session(command) => {
            let (orchestrator, events) = build_orchestrator(&config, cli.pipeline.patch)?;
            let printer = spawn_event_printer(events, cli.json);
            let report = match command {
                SessionCommand::Run { name } => {
                    let name = name.unwrap_or_else(default_session_name);
                    orchestrator.run_session(&name).await?
                }
                SessionCommand::Topic { topic, name } => {
                    let name = name.unwrap_or_else(default_session_name);
                    orchestrator.run_topic(&topic, &name).await?
                }
            };
            drop(orchestrator);
            let _ = printer.await;

            if cli.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
        }

        Command::Stats => {
            let knowledge = KnowledgeStore::open(&config.data_dir)?
                .with_reference_topics(config.reference_topics.clone());
            let feedback = FeedbackQueue::open(&config.data_dir)?;
            let stats = knowledge.get_stats();
            let insights = feedback.learn_from_approved();

            if cli.json {
                print_json(&serde_json::json!({
                    "knowledge": stats,
                    "pendingReviews": feedback.pending().len(),
                    "feedback": insights,
                    "topTags": knowledge.top_tags(config.synthesis_top_n),
                }))?;
            } else {
                println!("Entries:         {}", stats.count);
                println!("Sessions:        {}", stats.session_count);
                println!("Average score:   {:.2}", stats.avg_score);
                println!("Pending reviews: {}", feedback.pending().len());
                println!("Approval rate:   {:.0}%", insights.approval_rate * 100.0);
                if !stats.gaps.is_empty() {
                    println!("Gaps:            {}", stats.gaps.join(", "));
                }
            }
        }

        Command::Search {
            query,
            limit,
            similar,
        } => {
            let mut knowledge = KnowledgeStore::open(&config.data_dir)?;
            if similar {
                knowledge = knowledge.with_similarity(Arc::new(TokenOverlap));
            }
            let results = knowledge.similarity_search(&query, limit);
            if cli.json {
                let entries: Vec<_> = results
                    .iter()
                    .map(|(entry, score)| serde_json::json!({ "score": score, "entry": entry }))
                    .collect();
                print_json(&entries)?;
            } else if results.is_empty() {
                println!("No entries match '{query}'");
            } else {
                for (entry, score) in results {
                    let first_line = entry.content.lines().next().unwrap_or_default();
                    println!("{score:.2}  {}: {first_line}", entry.topic);
                }
            }
        }

        Command::Feedback(command) => {
            let feedback = FeedbackQueue::open(&config.data_dir)?;
            match command {
                FeedbackCommand::List { status } => {
                    let items = match status {
                        StatusFilter::Pending => feedback.pending(),
                        StatusFilter::Approved => feedback.approved(),
                        StatusFilter::Rejected => feedback.rejected(),
                    };
                    if cli.json {
                        print_json(&items)?;
                    } else {
                        items.iter().for_each(print_item);
                    }
                }
                FeedbackCommand::Approve(args) => {
                    let (id, review) = args.into_review(true);
                    let item = feedback.submit_review(id, review)?;
                    info!(id = %item.id, "approved");
                    print_item(&item);
                }
                FeedbackCommand::Reject(args) => {
                    let (id, review) = args.into_review(false);
                    let item = feedback.submit_review(id, review)?;
                    info!(id = %item.id, "rejected");
                    print_item(&item);
                }
                FeedbackCommand::Insights => {
                    let insights = feedback.learn_from_approved();
                    if cli.json {
                        print_json(&insights)?;
                    } else {
                        println!("Approved:      {}", insights.approved_count);
                        println!("Rejected:      {}", insights.rejected_count);
                        println!("Approval rate: {:.0}%", insights.approval_rate * 100.0);
                        println!("Avg rating:    {:.1}", insights.avg_rating);
                        for correction in &insights.common_corrections {
                            println!("  - {correction}");
                        }
                    }
                }
            }
        }

        Command::Modify(command) => {
            let ledger = open_ledger(&config, cli.pipeline.patch)?;
            match command {
                ModifyCommand::Trigger { error, origin } => {
                    let outcome = ledger
                        .improve(&FailureDescriptor::new(origin, error))
                        .await?;
                    if cli.json {
                        print_json(&outcome)?;
                    } else {
                        println!(
                            "{} failure: improved={} ({})",
                            outcome.kind, outcome.improved, outcome.reason
                        );
                        if let Some(record) = outcome.record {
                            println!("Backup: {}", record.backup_id);
                            for result in &record.applied_results {
                                println!(
                                    "  {}: {:?}",
                                    result.change.target_file.display(),
                                    result.status
                                );
                            }
                            if let Some(error) = record.test_result.error {
                                println!("Check failed: {error}");
                            }
                        }
                    }
                }
                ModifyCommand::Revert { backup_id } => {
                    let backup = ledger.revert(backup_id)?;
                    println!("Restored {} files from {}", backup.files.len(), backup.id);
                }
                ModifyCommand::History => {
                    let history = ledger.history();
                    if cli.json {
                        print_json(&history)?;
                    } else {
                        for record in history {
                            println!(
                                "{}  {:<14}  {}  {}",
                                record.timestamp.format("%Y-%m-%d %H:%M"),
                                record.kind,
                                if record.test_result.success { "ok    " } else { "failed" },
                                record.root_cause_summary
                            );
                        }
                    }
                }
                ModifyCommand::Backups => {
                    let backups = ledger.list_backups()?;
                    for backup in backups {
                        println!(
                            "{}  {}  {} files",
                            backup.id,
                            backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            backup.files.len()
                        );
                    }
                }
            }
        }

        Command::Schedule(ScheduleCommand::Start { tick, retry }) => {
            let config = config
                .tick_interval(Duration::from_secs(tick))
                .retry_delay(Duration::from_secs(retry));
            run_scheduler(config, cli.pipeline.patch, cli.json).await?;
        }

        Command::Schedule(ScheduleCommand::Edit(command)) => {
            edit_schedule(&config, command, cli.json).await?;
        }

        Command::Tools(command) => {
            let registry = ToolRegistry::open(&config.data_dir)?;
            match command {
                ToolsCommand::Create {
                    name,
                    kind,
                    description,
                    params,
                } => {
                    let mut tool = NewTool::new(name, kind, description);
                    for spec in &params {
                        tool = tool.param(parse_param(spec)?);
                    }
                    let tool = registry.create(tool)?;
                    println!("Registered '{}'", tool.name);
                }
                ToolsCommand::List => {
                    let tools = registry.list();
                    if cli.json {
                        print_json(&tools)?;
                    } else {
                        for tool in tools {
                            println!(
                                "{:<24}  {:<10}  {:>5} uses  {}",
                                tool.name, tool.kind, tool.usage_count, tool.description
                            );
                        }
                    }
                }
                ToolsCommand::Invoke { name } => {
                    let tool = registry.invoke(&name)?;
                    println!("'{}' used {} times", tool.name, tool.usage_count);
                }
                ToolsCommand::Delete { name } => {
                    registry.delete(&name)?;
                    println!("Deleted '{name}'");
                }
            }
        }
    }

    Ok(())
}

/// Executor for commands that only edit the schedule.
struct EditOnly;

#[async_trait]
impl TaskExecutor for EditOnly {
    async fn execute(&self, task: &ScheduledTask) -> autoscholar_core::Result<()> {
        Err(autoscholar_core::Error::invalid_state(format!(
            "'{}' can only run under `schedule start`",
            task.name
        )))
    }
}

async fn run_scheduler(config: Config, patch: PatchMode, quiet: bool) -> Result<()> {
    config.validate()?;
    let (orchestrator, events) = build_orchestrator(&config, patch)?;
    let printer = spawn_event_printer(events, quiet);
    let scheduler = Scheduler::from_config(&config, Arc::new(orchestrator))?;

    scheduler.start().await;
    println!("Scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    scheduler.stop().await;

    drop(scheduler);
    let _ = printer.await;
    Ok(())
}

async fn edit_schedule(config: &Config, command: ScheduleEdit, json: bool) -> Result<()> {
    let scheduler = Scheduler::from_config(config, Arc::new(EditOnly))?;
    match command {
        ScheduleEdit::Add {
            name,
            kind,
            topic,
            every,
        } => {
            let task = scheduler
                .add_task(NewScheduledTask {
                    name,
                    kind,
                    topic,
                    frequency: every,
                })
                .await?;
            println!("{}  next run {}", task.id, task.next_run);
        }
        ScheduleEdit::Remove { id } => {
            let task = scheduler.remove_task(id).await?;
            println!("Removed '{}'", task.name);
        }
        ScheduleEdit::Enable { id } => {
            scheduler.set_enabled(id, true).await?;
        }
        ScheduleEdit::Disable { id } => {
            scheduler.set_enabled(id, false).await?;
        }
        ScheduleEdit::List => {
            let tasks = scheduler.list().await;
            if json {
                print_json(&tasks)?;
            } else {
                for task in tasks {
                    println!(
                        "{}  {:<20}  {:<8}  {:<12}  {}  next {}",
                        task.id,
                        task.name,
                        task.kind.to_string(),
                        task.frequency.to_string(),
                        if task.enabled { "on " } else { "off" },
                        task.next_run.format("%Y-%m-%d %H:%M")
                    );
                }
            }
            let status = scheduler.status().await;
            if let Some((name, at)) = status.next_due {
                info!(%name, %at, "next due task");
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_code(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<autoscholar_core::Error>()
        .map_or(1, |e| e.code().exit_code() as u8)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
