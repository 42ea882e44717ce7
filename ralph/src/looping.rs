//! The iteration state machine behind `ralph run`.
//!
//! `Idle -> Running -> {Completed | Interrupted | IterationLimitReached}`,
//! then the session record is finalized and, on completion, results are
//! published once.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::backlog::{Backlog, Item, newly_passed};
use crate::core::session::{SessionRecord, now, session_name};
use crate::core::types::{InvocationMode, LoopStop};
use crate::errors::{InvokeError, SetupError};
use crate::io::agent::{Agent, InvokeRequest};
use crate::io::backlog_store::load_backlog;
use crate::io::config::RunSettings;
use crate::io::init::ProjectPaths;
use crate::io::iteration_log::{ConversationHeader, ConversationLog, SessionLog};
use crate::io::prompt::render_prompt;
use crate::io::publisher::{PublishReport, Publisher};
use crate::io::registry::Registry;

/// Progress notifications for the terminal. Product logs are written by the
/// loop itself; these only drive user-facing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    Started {
        name: String,
        max_iterations: u32,
    },
    IterationStarted {
        iteration: u32,
        max_iterations: u32,
        progress: String,
        /// Targeted item in per-item mode.
        target: Option<Item>,
    },
    IterationFailed {
        iteration: u32,
        error: String,
    },
    ItemCompleted {
        iteration: u32,
        item: Item,
    },
    IterationFinished {
        iteration: u32,
        progress: String,
    },
    Pausing {
        delay: Duration,
    },
    Interrupted,
    Finished {
        stop: LoopStop,
        progress: String,
    },
    Published(PublishReport),
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub name: String,
    pub stop: LoopStop,
    /// Agent calls made, including failed and cancelled ones.
    pub iterations: u32,
    pub failures: u32,
    /// Final `done/total`, or `unknown` if the backlog could not be read.
    pub progress: String,
    /// Present iff the publisher ran.
    pub publish: Option<PublishReport>,
}

/// What `ralph run --dry-run` would do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub name: String,
    pub progress: String,
    pub complete: bool,
    /// First incomplete item, the one per-item mode would target.
    pub target: Option<Item>,
    pub settings: RunSettings,
}

/// Collaborators for one run.
pub struct LoopDeps<'a, A: ?Sized, P: ?Sized> {
    pub registry: &'a Registry,
    pub agent: &'a A,
    pub publisher: &'a P,
}

/// Apply the entry guards and report the would-be target without starting.
///
/// Never writes the registry or invokes the agent.
pub async fn preview<A: Agent + ?Sized>(
    root: &Path,
    registry: &Registry,
    agent: &A,
    settings: &RunSettings,
) -> Result<Preview> {
    let (name, _record, backlog) = check_entry(root, registry, agent).await?;
    Ok(Preview {
        name,
        progress: backlog.progress_label(),
        complete: backlog.is_complete(),
        target: backlog.first_incomplete().cloned(),
        settings: settings.clone(),
    })
}

/// Drive the agent against the backlog until it completes, the iteration cap
/// is reached, or `cancel` fires.
///
/// Setup failures ([`SetupError`]) are returned before the registry is
/// touched. Once the session is marked running it is always marked stopped
/// again, even if the loop itself fails.
#[instrument(skip_all, fields(root = %root.display(), max_iterations = settings.iteration_cap(), mode = %settings.mode))]
pub async fn run_loop<A, P, F>(
    root: &Path,
    deps: LoopDeps<'_, A, P>,
    settings: &RunSettings,
    cancel: &CancellationToken,
    mut on_event: F,
) -> Result<LoopOutcome>
where
    A: Agent + ?Sized,
    P: Publisher + ?Sized,
    F: FnMut(&LoopEvent),
{
    let (name, mut record, backlog) = check_entry(root, deps.registry, deps.agent).await?;

    let pid = std::process::id();
    record.path = root.display().to_string();
    record.mark_running(pid, now());
    deps.registry
        .set(&record)
        .context("mark session running")?;
    info!(name = %name, pid, "session running");
    on_event(&LoopEvent::Started {
        name: name.clone(),
        max_iterations: settings.iteration_cap(),
    });

    let paths = ProjectPaths::new(root);
    let driven = match SessionLog::open(&paths.session_log_path) {
        Ok(log) => {
            let driven = drive(
                &paths,
                deps.agent,
                settings,
                cancel,
                &log,
                backlog,
                &mut on_event,
            )
            .await;
            if let Err(err) = log.session_ended() {
                warn!(err = %err, "failed to close session log");
            }
            driven
        }
        Err(err) => Err(err),
    };

    record.mark_stopped(now());
    if let Err(err) = deps.registry.set(&record) {
        warn!(err = %err, "failed to mark session stopped");
    }
    info!(name = %name, "session stopped");

    let (stop, counters) = driven?;

    let final_backlog = match load_backlog(root) {
        Ok(backlog) => backlog,
        Err(err) => {
            warn!(err = %err, "failed to reload backlog after run");
            None
        }
    };
    let progress = final_backlog
        .as_ref()
        .map_or_else(|| "unknown".to_string(), Backlog::progress_label);
    on_event(&LoopEvent::Finished {
        stop,
        progress: progress.clone(),
    });

    let publish = match (&stop, &final_backlog) {
        (LoopStop::Completed, Some(backlog)) if backlog.is_complete() => {
            let report = deps.publisher.publish(root, backlog).await;
            on_event(&LoopEvent::Published(report.clone()));
            Some(report)
        }
        _ => None,
    };

    Ok(LoopOutcome {
        name,
        stop,
        iterations: counters.iterations,
        failures: counters.failures,
        progress,
        publish,
    })
}

/// Entry guards, in order: already running, no backlog, agent unavailable.
async fn check_entry<A: Agent + ?Sized>(
    root: &Path,
    registry: &Registry,
    agent: &A,
) -> Result<(String, SessionRecord, Backlog)> {
    let name = session_name(root);
    let record = registry
        .get(&name)?
        .unwrap_or_else(|| SessionRecord::for_root(root));
    if record.is_marked_running() {
        return Err(SetupError::AlreadyRunning {
            name,
            pid: record.pid,
        }
        .into());
    }
    let Some(backlog) = load_backlog(root)? else {
        return Err(SetupError::NoBacklog {
            path: ProjectPaths::new(root).backlog_path,
        }
        .into());
    };
    agent.preflight().await?;
    Ok((name, record, backlog))
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    iterations: u32,
    failures: u32,
}

async fn drive<A, F>(
    paths: &ProjectPaths,
    agent: &A,
    settings: &RunSettings,
    cancel: &CancellationToken,
    log: &SessionLog,
    mut last_good: Backlog,
    on_event: &mut F,
) -> Result<(LoopStop, Counters)>
where
    A: Agent + ?Sized,
    F: FnMut(&LoopEvent),
{
    let root = paths.root.as_path();
    let mut counters = Counters::default();
    let cap = settings.iteration_cap();
    note(log.session_started(settings.sandbox, settings.mode));

    for iteration in 1..=cap {
        if cancel.is_cancelled() {
            return Ok(interrupted(log, on_event, counters));
        }

        let backlog = match load_backlog(root) {
            Ok(Some(backlog)) => backlog,
            Ok(None) => {
                debug!("backlog removed, treating run as complete");
                return Ok((LoopStop::Completed, counters));
            }
            Err(err) => {
                warn!(err = %err, "backlog unreadable, reusing last good copy");
                note(log.error(&format!("{err:#}")));
                last_good.clone()
            }
        };
        if backlog.is_complete() {
            return Ok((LoopStop::Completed, counters));
        }
        last_good = backlog.clone();

        let progress_before = backlog.progress_label();
        let target = match settings.mode {
            InvocationMode::PerItem => backlog.first_incomplete().cloned(),
            InvocationMode::FullBacklog => None,
        };
        on_event(&LoopEvent::IterationStarted {
            iteration,
            max_iterations: cap,
            progress: progress_before.clone(),
            target: target.clone(),
        });
        note(log.iteration_started(iteration));
        counters.iterations += 1;

        let result = run_iteration(
            paths,
            agent,
            settings,
            cancel,
            iteration,
            &backlog,
            &progress_before,
            target.as_ref(),
        )
        .await;

        match result {
            Ok(IterationResult::Finished { after }) => {
                let progress_after = after
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), Backlog::progress_label);
                note(log.iteration_completed(iteration, &progress_after));
                if let Some(after) = &after {
                    for item in newly_passed(&backlog, after) {
                        note(log.item_completed(&item.id, &item.title));
                        on_event(&LoopEvent::ItemCompleted {
                            iteration,
                            item: item.clone(),
                        });
                    }
                }
                on_event(&LoopEvent::IterationFinished {
                    iteration,
                    progress: progress_after,
                });
            }
            Ok(IterationResult::Cancelled) => {
                return Ok(interrupted(log, on_event, counters));
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return Ok(interrupted(log, on_event, counters));
                }
                counters.failures += 1;
                let message = format!("{err:#}");
                warn!(iteration, err = %message, "iteration failed");
                note(log.error(&message));
                on_event(&LoopEvent::IterationFailed {
                    iteration,
                    error: message,
                });
            }
        }

        if iteration < cap && !settings.pause.is_zero() {
            on_event(&LoopEvent::Pausing {
                delay: settings.pause,
            });
            tokio::select! {
                () = tokio::time::sleep(settings.pause) => {}
                () = cancel.cancelled() => {
                    return Ok(interrupted(log, on_event, counters));
                }
            }
        }
    }

    // The last permitted iteration may have finished the backlog.
    let stop = match load_backlog(root) {
        Ok(Some(backlog)) if !backlog.is_complete() => LoopStop::IterationLimitReached,
        Ok(_) => LoopStop::Completed,
        Err(err) => {
            warn!(err = %err, "backlog unreadable after final iteration");
            LoopStop::IterationLimitReached
        }
    };
    Ok((stop, counters))
}

enum IterationResult {
    /// The agent exited successfully; `after` is the reloaded backlog.
    Finished { after: Option<Backlog> },
    Cancelled,
}

#[allow(clippy::too_many_arguments)]
async fn run_iteration<A: Agent + ?Sized>(
    paths: &ProjectPaths,
    agent: &A,
    settings: &RunSettings,
    cancel: &CancellationToken,
    iteration: u32,
    backlog: &Backlog,
    progress_before: &str,
    target: Option<&Item>,
) -> Result<IterationResult> {
    let prompt = render_prompt(settings.mode, &paths.root, backlog)?;
    let header = ConversationHeader {
        iteration,
        sandbox: settings.sandbox,
        progress_before,
        target: target.map(|item| format!("[{}] {}", item.id, item.title)),
    };
    let conversation = ConversationLog::begin(
        &paths.conversation_path(iteration),
        &header,
        settings.echo,
    )?;
    conversation.write_prompt(&prompt)?;

    let invoked = agent
        .invoke(InvokeRequest {
            workdir: &paths.root,
            prompt: &prompt,
            sink: conversation.sink(),
            cancel,
        })
        .await;

    let after = match load_backlog(&paths.root) {
        Ok(after) => after,
        Err(err) => {
            warn!(err = %err, "backlog unreadable after iteration");
            None
        }
    };
    let progress_after = after
        .as_ref()
        .map_or_else(|| "unknown".to_string(), Backlog::progress_label);
    if let Err(err) = conversation.finish(&progress_after) {
        warn!(err = %err, "failed to finish conversation log");
    }

    match invoked {
        Ok(()) => Ok(IterationResult::Finished { after }),
        Err(InvokeError::Cancelled) => Ok(IterationResult::Cancelled),
        Err(err) => Err(err.into()),
    }
}

fn interrupted<F: FnMut(&LoopEvent)>(
    log: &SessionLog,
    on_event: &mut F,
    counters: Counters,
) -> (LoopStop, Counters) {
    info!("run interrupted");
    note(log.interrupted());
    on_event(&LoopEvent::Interrupted);
    (LoopStop::Interrupted, counters)
}

/// Session log writes are best-effort; a full disk must not abort the run.
fn note(result: Result<()>) {
    if let Err(err) = result {
        warn!(err = %err, "failed to write session log");
    }
}
