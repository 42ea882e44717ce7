//! Liveness checks and termination of recorded session processes.
//!
//! Liveness means signal 0 reaches the recorded pid. A recycled pid that now
//! belongs to an unrelated process reads as alive; that false positive is
//! accepted.

use anyhow::Result;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::core::session::{SessionRecord, now};
use crate::io::registry::Registry;

/// What [`stop`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The record had no pid; nothing was signalled or written.
    NotRunning,
    /// SIGTERM was delivered and the record marked stopped.
    Signalled { pid: u32 },
    /// SIGTERM could not be delivered (usually a dead pid); the record was
    /// marked stopped anyway.
    SignalFailed { pid: u32 },
}

/// True if the record exists, carries a pid, and that pid answers signal 0.
pub fn is_running(record: Option<&SessionRecord>) -> bool {
    match record {
        Some(record) if record.pid != 0 => pid_alive(record.pid),
        _ => false,
    }
}

/// `"running"` or `"stopped"`, from liveness rather than the recorded status.
pub fn status_label(record: Option<&SessionRecord>) -> &'static str {
    if is_running(record) {
        "running"
    } else {
        "stopped"
    }
}

/// Send SIGTERM to the recorded pid and mark the record stopped.
///
/// The registry write happens even when the signal fails, so stale records
/// left by crashed runs get cleared.
#[instrument(skip_all, fields(name = %record.name, pid = record.pid))]
pub fn stop(registry: &Registry, record: &mut SessionRecord) -> Result<StopOutcome> {
    if record.pid == 0 {
        debug!("no pid recorded, nothing to stop");
        return Ok(StopOutcome::NotRunning);
    }
    let pid = record.pid;
    let outcome = match send_signal(pid, Signal::SIGTERM) {
        Ok(()) => {
            info!("sent SIGTERM");
            StopOutcome::Signalled { pid }
        }
        Err(err) => {
            warn!(err = %err, "failed to signal session process");
            StopOutcome::SignalFailed { pid }
        }
    };
    record.mark_stopped(now());
    registry.set(record)?;
    Ok(outcome)
}

fn pid_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => kill(Pid::from_raw(raw), None).is_ok(),
        _ => false,
    }
}

pub(crate) fn send_signal(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    let raw = i32::try_from(pid).map_err(|_| nix::Error::EINVAL)?;
    if raw <= 0 {
        return Err(nix::Error::EINVAL);
    }
    kill(Pid::from_raw(raw), signal)
}

/// Signal every process in the group led by `pgid`.
pub(crate) fn send_group_signal(pgid: u32, signal: Signal) -> Result<(), nix::Error> {
    let raw = i32::try_from(pgid).map_err(|_| nix::Error::EINVAL)?;
    if raw <= 1 {
        return Err(nix::Error::EINVAL);
    }
    killpg(Pid::from_raw(raw), signal)
}
