//! `ralph`: drive a coding agent through a project backlog.
//!
//! The backlog lives in `.ralph/prd.json`; session records live in the
//! global registry (`~/.config/ralph/loops.json` unless `RALPH_CONFIG_DIR`
//! is set).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ralph::core::backlog::{Backlog, Item};
use ralph::core::session::{SessionRecord, session_name};
use ralph::core::types::{InvocationMode, LoopStop, Sandbox};
use ralph::errors::SetupError;
use ralph::exit_codes;
use ralph::io::agent::ClaudeAgent;
use ralph::io::backlog_store::{load_backlog, save_backlog};
use ralph::io::config::{
    RunOverrides, RunSettings, config_dir, global_config_path, load_global_config,
    load_project_config,
};
use ralph::io::init::{InitOutcome, ProjectPaths, find_project_root, init_project};
use ralph::io::iteration_log::{LogFollower, tail_lines};
use ralph::io::publisher::GhPublisher;
use ralph::io::registry::Registry;
use ralph::io::supervisor::{StopOutcome, status_label, stop};
use ralph::logging;
use ralph::looping::{LoopDeps, LoopEvent, LoopOutcome, Preview, preview, run_loop};
use ralph::signals::spawn_interrupt_listener;

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Autonomous multi-iteration coding loop runner"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `ralph.toml` and `.ralph/` in a project directory.
    Init {
        /// Project directory (defaults to the current directory).
        path: Option<PathBuf>,
    },
    /// Run the agent loop against the backlog.
    Run(RunArgs),
    /// Send SIGTERM to a running session and mark it stopped.
    Stop {
        /// Session name (defaults to the current project).
        name: Option<String>,
    },
    /// Show registered sessions with liveness and progress.
    Status {
        /// Only show this session.
        name: Option<String>,
    },
    /// One line per registered session.
    List,
    /// Print the tail of a session log.
    Logs {
        /// Session name (defaults to the current project).
        name: Option<String>,
        /// Keep printing lines as they are appended.
        #[arg(short, long)]
        follow: bool,
        /// Number of trailing lines to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },
    /// Show the backlog, add an item, or create a new backlog.
    Prd(PrdArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Maximum number of iterations.
    #[arg(short = 'm', long)]
    max_iterations: Option<u32>,
    /// Run a single iteration.
    #[arg(long)]
    once: bool,
    /// Check preconditions and show what would run, without starting.
    #[arg(long)]
    dry_run: bool,
    /// Isolation for the agent process: none, docker, mac.
    #[arg(short, long)]
    sandbox: Option<Sandbox>,
    /// per-item or full-backlog.
    #[arg(long)]
    mode: Option<InvocationMode>,
    /// Model passed through to the agent.
    #[arg(long)]
    model: Option<String>,
}

impl RunArgs {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            max_iterations: self.max_iterations,
            once: self.once,
            mode: self.mode,
            sandbox: self.sandbox,
            model: self.model.clone(),
        }
    }
}

#[derive(Args, Debug, Default)]
struct PrdArgs {
    /// Title of an item to append.
    title: Option<String>,
    /// Acceptance criterion for the new item (repeatable).
    #[arg(short = 'c', long = "criteria")]
    criteria: Vec<String>,
    /// Item description, or the backlog description with `--new`.
    #[arg(short, long)]
    description: Option<String>,
    /// Create a new, empty backlog.
    #[arg(short, long, conflicts_with = "title")]
    new: bool,
    /// Backlog name for `--new`.
    #[arg(long, requires = "new")]
    name: Option<String>,
    /// Replace an existing backlog with `--new`.
    #[arg(short, long, requires = "new")]
    force: bool,
    /// Open the backlog file in `$EDITOR`.
    #[arg(short, long, conflicts_with_all = ["title", "new"])]
    edit: bool,
}

const DEFAULT_LOG_LINES: usize = 50;
const FOLLOW_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_EDITOR: &str = "vim";

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<SetupError>().is_some() {
        exit_codes::SETUP_FAILED
    } else {
        exit_codes::FAILED
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { path } => cmd_init(path),
        Command::Run(args) => cmd_run(&args),
        Command::Stop { name } => cmd_stop(name),
        Command::Status { name } => cmd_status(name.as_deref()),
        Command::List => cmd_list(),
        Command::Logs {
            name,
            follow,
            lines,
        } => cmd_logs(name, follow, lines),
        Command::Prd(args) => cmd_prd(&args),
    }
}

fn current_dir() -> Result<PathBuf> {
    std::env::current_dir().context("read current directory")
}

fn cmd_init(path: Option<PathBuf>) -> Result<()> {
    let root = match path {
        Some(path) => path,
        None => current_dir()?,
    };
    match init_project(&root)? {
        InitOutcome::Initialized { project } => {
            println!("Initialized ralph project {project} in {}", root.display());
            println!("Create a backlog with `ralph prd --new --name <name>`");
        }
        InitOutcome::AlreadyInitialized => {
            println!("{} is already a ralph project", root.display());
        }
    }
    Ok(())
}

fn cmd_run(args: &RunArgs) -> Result<()> {
    let root = find_project_root(&current_dir()?)?;
    let paths = ProjectPaths::new(&root);
    let config_dir = config_dir()?;
    let global = load_global_config(&global_config_path(&config_dir))?;
    let project = load_project_config(&paths.config_path)?;
    let settings = RunSettings::resolve(&global, &project, &args.overrides());
    settings.validate()?;

    let registry = Registry::in_dir(&config_dir);
    let agent = ClaudeAgent::new(
        settings.binary.clone(),
        settings.model.clone(),
        settings.sandbox,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;

    if args.dry_run {
        let preview = runtime.block_on(preview(&root, &registry, &agent, &settings))?;
        print_preview(&preview);
        return Ok(());
    }

    let outcome = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let listener = spawn_interrupt_listener(cancel.clone())?;
        let publisher = GhPublisher::default();
        let result = run_loop(
            &root,
            LoopDeps {
                registry: &registry,
                agent: &agent,
                publisher: &publisher,
            },
            &settings,
            &cancel,
            print_event,
        )
        .await;
        cancel.cancel();
        if let Err(err) = listener.await {
            warn!(err = %err, "interrupt listener did not shut down cleanly");
        }
        result
    })?;
    print_summary(&outcome);
    Ok(())
}

fn print_preview(preview: &Preview) {
    let settings = &preview.settings;
    println!("Dry run for {}", preview.name);
    println!("  Progress:   {}", preview.progress);
    println!("  Mode:       {}", settings.mode);
    println!("  Sandbox:    {}", settings.sandbox);
    println!("  Agent:      {}", settings.binary);
    if let Some(model) = &settings.model {
        println!("  Model:      {model}");
    }
    println!("  Iterations: {}", settings.max_iterations);
    match &preview.target {
        Some(item) => println!("  Next item:  [{}] {}", item.id, item.title),
        None if preview.complete => println!("  Next item:  none, backlog complete"),
        None => println!("  Next item:  none, backlog is empty"),
    }
}

fn print_event(event: &LoopEvent) {
    match event {
        LoopEvent::Started {
            name,
            max_iterations,
        } => println!("Starting {name} (max {max_iterations} iterations)"),
        LoopEvent::IterationStarted {
            iteration,
            max_iterations,
            progress,
            target,
        } => {
            println!("\n=== Iteration {iteration}/{max_iterations} ({progress}) ===");
            if let Some(item) = target {
                println!("Working on [{}] {}", item.id, item.title);
            }
        }
        LoopEvent::IterationFailed { iteration, error } => {
            eprintln!("Iteration {iteration} failed: {error}");
        }
        LoopEvent::ItemCompleted { item, .. } => {
            println!("Completed [{}] {}", item.id, item.title);
        }
        LoopEvent::IterationFinished {
            iteration,
            progress,
        } => println!("Iteration {iteration} finished, progress {progress}"),
        LoopEvent::Pausing { delay } => {
            println!("Next iteration in {}s", delay.as_secs());
        }
        LoopEvent::Interrupted => println!("Interrupted"),
        LoopEvent::Finished { .. } => {}
        LoopEvent::Published(report) => {
            if let Some(branch) = &report.branch {
                println!("Published branch {branch}");
            }
            if report.pr_created {
                println!("Pull request created");
            }
            for warning in &report.warnings {
                eprintln!("Warning: {warning}");
            }
        }
    }
}

fn print_summary(outcome: &LoopOutcome) {
    let verdict = match outcome.stop {
        LoopStop::Completed => "All items complete",
        LoopStop::Interrupted => "Stopped by interrupt",
        LoopStop::IterationLimitReached => "Iteration limit reached",
    };
    println!(
        "\n{verdict}: {} after {} iteration(s), {} failed",
        outcome.progress, outcome.iterations, outcome.failures
    );
}

fn cmd_stop(name: Option<String>) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => session_name(&find_project_root(&current_dir()?)?),
    };
    let registry = Registry::open_default()?;
    let Some(mut record) = registry.get(&name)? else {
        bail!("no session named {name}");
    };
    match stop(&registry, &mut record)? {
        StopOutcome::NotRunning => println!("{name} is not running"),
        StopOutcome::Signalled { pid } => println!("Stopped {name} (pid {pid})"),
        StopOutcome::SignalFailed { pid } => {
            println!("{name} (pid {pid}) was already gone; marked stopped");
        }
    }
    Ok(())
}

fn cmd_status(filter: Option<&str>) -> Result<()> {
    let registry = Registry::open_default()?;
    let records = registry.list_all()?;
    if records.is_empty() {
        println!("No sessions registered. Start one with `ralph init` and `ralph run`.");
        return Ok(());
    }
    let mut shown = 0;
    for record in records
        .iter()
        .filter(|record| filter.is_none_or(|name| record.name == name))
    {
        print_status(record);
        shown += 1;
    }
    if shown == 0
        && let Some(name) = filter
    {
        bail!("no session named {name}");
    }
    Ok(())
}

fn print_status(record: &SessionRecord) {
    let status = status_label(Some(record));
    let backlog = backlog_for(record);
    println!("{}", record.name);
    println!("  Status:   {status}");
    match &backlog {
        Some(backlog) => println!(
            "  Progress: {} ({}%)",
            backlog.progress_label(),
            backlog.progress_percent()
        ),
        None => println!("  Progress: ?/?"),
    }
    println!("  Path:     {}", record.path);
    if status == "running"
        && let Some(backlog) = &backlog
    {
        println!("  Current:  {}", backlog.current_title());
    }
    println!();
}

fn cmd_list() -> Result<()> {
    let registry = Registry::open_default()?;
    let records = registry.list_all()?;
    if records.is_empty() {
        println!("No sessions registered. Start one with `ralph init` and `ralph run`.");
        return Ok(());
    }
    for record in records {
        let progress = backlog_for(&record)
            .map_or_else(|| "?/?".to_string(), |backlog| backlog.progress_label());
        println!(
            "{:<24} {:<8} {:<8} {}",
            record.name,
            status_label(Some(&record)),
            progress,
            record.path
        );
    }
    Ok(())
}

/// Backlog of a registered session; unreadable backlogs show as unknown.
fn backlog_for(record: &SessionRecord) -> Option<Backlog> {
    match load_backlog(Path::new(&record.path)) {
        Ok(backlog) => backlog,
        Err(err) => {
            warn!(name = %record.name, err = %err, "cannot read session backlog");
            None
        }
    }
}

/// Project root for a session name, or the current project.
fn resolve_root(name: Option<String>) -> Result<PathBuf> {
    match name {
        Some(name) => {
            let registry = Registry::open_default()?;
            match registry.get(&name)? {
                Some(record) => Ok(PathBuf::from(record.path)),
                None => bail!("no session named {name}"),
            }
        }
        None => Ok(find_project_root(&current_dir()?)?),
    }
}

fn cmd_logs(name: Option<String>, follow: bool, lines: usize) -> Result<()> {
    let root = resolve_root(name)?;
    let path = ProjectPaths::new(&root).session_log_path;
    if !path.is_file() {
        println!("No logs found at {}", path.display());
        return Ok(());
    }
    // Open before reading the tail so nothing written in between is lost.
    let follower = if follow {
        Some(LogFollower::open_at_end(&path)?)
    } else {
        None
    };
    for line in tail_lines(&path, lines)? {
        println!("{line}");
    }
    let Some(mut follower) = follower else {
        return Ok(());
    };
    loop {
        for line in follower.poll()? {
            println!("{line}");
        }
        std::thread::sleep(FOLLOW_INTERVAL);
    }
}

fn cmd_prd(args: &PrdArgs) -> Result<()> {
    let root = find_project_root(&current_dir()?)?;
    if args.new {
        return create_backlog(&root, args);
    }
    if args.edit {
        return edit_backlog(&root);
    }
    let Some(mut backlog) = load_backlog(&root)? else {
        return Err(SetupError::NoBacklog {
            path: ProjectPaths::new(&root).backlog_path,
        }
        .into());
    };
    match &args.title {
        Some(title) => {
            let id = backlog.append(Item {
                description: args.description.clone().unwrap_or_default(),
                acceptance_criteria: args.criteria.clone(),
                ..Item::new(title.as_str())
            });
            save_backlog(&root, &backlog)?;
            println!("Added item {id}: {title}");
        }
        None => print_backlog(&backlog),
    }
    Ok(())
}

fn create_backlog(root: &Path, args: &PrdArgs) -> Result<()> {
    if !args.force && load_backlog(root)?.is_some() {
        bail!("a backlog already exists; pass --force to replace it");
    }
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| session_name(root));
    let backlog = Backlog::new(name, args.description.clone().unwrap_or_default());
    save_backlog(root, &backlog)?;
    println!(
        "Created backlog at {}",
        ProjectPaths::new(root).backlog_path.display()
    );
    println!("Add items with `ralph prd \"Item title\" -c \"criterion\"`");
    Ok(())
}

/// Open the backlog in `$EDITOR`, then check it still parses.
fn edit_backlog(root: &Path) -> Result<()> {
    let path = ProjectPaths::new(root).backlog_path;
    if !path.is_file() {
        return Err(SetupError::NoBacklog { path }.into());
    }
    let editor = std::env::var("EDITOR")
        .ok()
        .filter(|editor| !editor.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_EDITOR.to_string());
    let mut words = editor.split_whitespace();
    let Some(program) = words.next() else {
        bail!("EDITOR is empty");
    };
    let status = std::process::Command::new(program)
        .args(words)
        .arg(&path)
        .status()
        .with_context(|| format!("launch editor {program}"))?;
    if !status.success() {
        bail!("editor {program} exited with {status}");
    }
    let backlog = load_backlog(root)
        .context("backlog is invalid after editing")?
        .ok_or_else(|| anyhow!("backlog was removed while editing"))?;
    println!(
        "Saved {}: {} ({}%)",
        backlog.name,
        backlog.progress_label(),
        backlog.progress_percent()
    );
    Ok(())
}

fn print_backlog(backlog: &Backlog) {
    println!("{}", backlog.name);
    if !backlog.description.is_empty() {
        println!("{}", backlog.description);
    }
    println!();
    for item in &backlog.items {
        let mark = if item.passes { "x" } else { " " };
        println!("[{mark}] {}. {}", item.id, item.title);
    }
    println!();
    println!(
        "Progress: {} ({}%)",
        backlog.progress_label(),
        backlog.progress_percent()
    );
}
