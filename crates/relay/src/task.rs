//! Per-channel task registry.
//!
//! At most one agent process runs per channel. The registry entry is the only
//! source of truth for "this channel is busy": it is inserted when the
//! channel is reserved, just before the process is spawned, and removed
//! exactly once, either by `cancel` (at once, even though the process may
//! still be shutting down) or by the completion path through `complete` or
//! `on_exit`.
//!
//! The `Child` itself is owned by whoever spawned the task. `cancel` trips the
//! task's token and sends SIGTERM; the owner sees the token, waits out the
//! grace period and escalates to SIGKILL (see [`terminate`]).

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, warn};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BridgeError, BridgeResult};

/// How long a process gets to exit after SIGTERM before it is killed.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Unique id of one task execution.
pub type TaskId = Uuid;

struct TaskEntry {
    id: TaskId,
    label: String,
    pid: Option<u32>,
    started_at: Instant,
    cancel: CancellationToken,
}

/// A freshly registered task. The caller owns the process from here on.
#[derive(Debug)]
pub struct SpawnedTask {
    pub id: TaskId,
    pub child: Child,
    pub cancel: CancellationToken,
    pub started_at: Instant,
}

/// Result of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub cancelled: bool,
    pub label: Option<String>,
    pub elapsed: Duration,
}

impl CancelReport {
    fn nothing_running() -> Self {
        Self {
            cancelled: false,
            label: None,
            elapsed: Duration::ZERO,
        }
    }
}

/// Diagnostic view of a running task.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub channel: String,
    pub id: TaskId,
    pub label: String,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

/// A channel slot claimed before its process exists.
struct Reservation {
    channel: String,
    id: TaskId,
    cancel: CancellationToken,
    started_at: Instant,
}

/// Channel key -> the single in-flight task.
#[derive(Default)]
pub struct TaskManager {
    tasks: DashMap<String, TaskEntry>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command` as the channel's task.
    ///
    /// Fails with `ChannelBusy` if the channel already has one. The channel
    /// is reserved before the process starts, so concurrent spawns for the
    /// same channel cannot both succeed, and the map shard is not locked
    /// while fork/exec runs.
    pub fn spawn(&self, channel: &str, label: &str, command: Command) -> BridgeResult<SpawnedTask> {
        let reservation = self.reserve(channel, label)?;
        self.start(reservation, command)
    }

    fn reserve(&self, channel: &str, label: &str) -> BridgeResult<Reservation> {
        match self.tasks.entry(channel.to_string()) {
            Entry::Occupied(_) => Err(BridgeError::ChannelBusy {
                channel: channel.to_string(),
            }),
            Entry::Vacant(slot) => {
                let reservation = Reservation {
                    channel: channel.to_string(),
                    id: Uuid::new_v4(),
                    cancel: CancellationToken::new(),
                    started_at: Instant::now(),
                };
                slot.insert(TaskEntry {
                    id: reservation.id,
                    label: label.to_string(),
                    pid: None,
                    started_at: reservation.started_at,
                    cancel: reservation.cancel.clone(),
                });
                Ok(reservation)
            }
        }
    }

    fn start(&self, reservation: Reservation, mut command: Command) -> BridgeResult<SpawnedTask> {
        let Reservation {
            channel,
            id,
            cancel,
            started_at,
        } = reservation;

        let program = command
            .as_std()
            .get_program()
            .to_string_lossy()
            .into_owned();
        let child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.on_exit(&channel, id);
                return Err(BridgeError::ProcessSpawn { program, source });
            }
        };

        let pid = child.id();
        let recorded = match self.tasks.get_mut(&channel) {
            Some(mut entry) if entry.id == id => {
                entry.pid = pid;
                true
            }
            _ => false,
        };
        if recorded {
            info!("Started task {} for channel {} (pid {:?})", id, channel, pid);
        } else {
            // Cancelled while starting: the token is tripped and the owner
            // terminates the child on its first poll.
            debug!("Task {} for channel {} was cancelled during spawn", id, channel);
        }

        Ok(SpawnedTask {
            id,
            child,
            cancel,
            started_at,
        })
    }

    /// Cancel the channel's task, if any.
    ///
    /// The entry is gone when this returns; the process itself exits
    /// asynchronously and is reaped by its owner. No signal is sent once the
    /// process has been marked exited.
    pub fn cancel(&self, channel: &str) -> CancelReport {
        let Some((_, entry)) = self.tasks.remove(channel) else {
            debug!("Cancel requested for idle channel {}", channel);
            return CancelReport::nothing_running();
        };

        entry.cancel.cancel();
        if let Some(pid) = entry.pid {
            send_terminate(pid);
        }

        let elapsed = entry.started_at.elapsed();
        info!(
            "Cancelled task {} for channel {} after {:.1}s",
            entry.id,
            channel,
            elapsed.as_secs_f64()
        );
        CancelReport {
            cancelled: true,
            label: Some(entry.label),
            elapsed,
        }
    }

    /// Forget the pid of a process that has been reaped, so a later cancel
    /// never signals a pid the OS may have reused.
    pub fn mark_exited(&self, channel: &str, id: TaskId) {
        if let Some(mut entry) = self.tasks.get_mut(channel)
            && entry.id == id
        {
            entry.pid = None;
        }
    }

    /// Finish the task if it is still registered, running `commit` while the
    /// entry is locked so a concurrent `cancel` either happens entirely
    /// before (and `commit` does not run) or entirely after. Returns whether
    /// the task completed.
    pub fn complete(&self, channel: &str, id: TaskId, commit: impl FnOnce()) -> bool {
        match self.tasks.entry(channel.to_string()) {
            Entry::Occupied(entry) if entry.get().id == id => {
                commit();
                entry.remove();
                debug!("Task {} for channel {} completed", id, channel);
                true
            }
            _ => false,
        }
    }

    /// Completion hook. Removes the entry only if it still belongs to `id`,
    /// so a task registered after a cancel is left alone. Idempotent.
    pub fn on_exit(&self, channel: &str, id: TaskId) -> bool {
        let removed = self.tasks.remove_if(channel, |_, e| e.id == id).is_some();
        if removed {
            debug!("Task {} for channel {} exited", id, channel);
        }
        removed
    }

    pub fn is_active(&self, channel: &str) -> bool {
        self.tasks.contains_key(channel)
    }

    pub fn task_info(&self, channel: &str) -> Option<TaskInfo> {
        self.tasks.get(channel).map(|e| TaskInfo {
            channel: channel.to_string(),
            id: e.id,
            label: e.label.clone(),
            pid: e.pid,
            elapsed: e.started_at.elapsed(),
        })
    }

    pub fn active_tasks(&self) -> Vec<TaskInfo> {
        self.tasks
            .iter()
            .map(|e| TaskInfo {
                channel: e.key().clone(),
                id: e.id,
                label: e.label.clone(),
                pid: e.pid,
                elapsed: e.started_at.elapsed(),
            })
            .collect()
    }

    /// Cancel every running task (shutdown).
    pub fn cancel_all(&self) -> Vec<CancelReport> {
        let channels: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        if !channels.is_empty() {
            info!("Cancelling {} active task(s)", channels.len());
        }
        channels
            .iter()
            .map(|channel| self.cancel(channel))
            .filter(|report| report.cancelled)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Ask a process to exit (SIGTERM).
#[cfg(unix)]
fn send_terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!(
            "SIGTERM to pid {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

/// No graceful signal off unix; the owner escalates to a hard kill after the grace period.
#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

/// Graceful-then-forceful shutdown of an owned child.
///
/// Sends SIGTERM, waits up to `grace`, then kills. Returns the exit status.
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Some(pid) = child.id() {
        send_terminate(pid);
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                "Process {:?} ignored SIGTERM for {:?}, killing",
                child.id(),
                grace
            );
            kill(child).await
        }
    }
}

/// Immediate SIGKILL and reap.
pub async fn kill(child: &mut Child) -> std::io::Result<ExitStatus> {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill process {:?}: {}", child.id(), e);
    }
    child.wait().await
}
