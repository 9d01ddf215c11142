//! Task orchestration.
//!
//! One `run` call drives a single agent execution for a channel:
//!
//! ```text
//! Idle -> Spawning -> Running -> Completing -> Idle
//!                            \-> Cancelling -> Idle
//!                            \-> TimedOut   -> Idle
//! ```
//!
//! The running loop multiplexes the hard deadline, the cancel token, stdout
//! chunks and finally the process exit. The deadline is polled first, so a
//! timeout wins over a cancel that became ready in the same wakeup, and a
//! cancel observed after the deadline has passed still counts as a timeout.
//!
//! The card is created by a background task so a slow sink never holds up
//! the deadline. Terminal card updates after a timeout or cancel are bounded
//! by the kill grace period.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;

use crate::agent::AgentLauncher;
use crate::config::{AppConfig, BridgeConfig};
use crate::dedupe::DedupeCache;
use crate::error::{BridgeError, BridgeResult};
use crate::session::SessionStore;
use crate::sink::{CardStatus, CardTarget, DeliverySink};
use crate::snapshot::{ProducedFile, Snapshot, SnapshotDiffer};
use crate::stream::{ResultAccumulator, StreamParser};
use crate::task::{self, CancelReport, KILL_GRACE, TaskId, TaskInfo, TaskManager};
use crate::throttle::ThrottledSink;

/// Longest task label kept from the prompt.
const LABEL_CHARS: usize = 60;

const READ_CHUNK: usize = 8 * 1024;

/// Runtime knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub throttle: Duration,
    pub timeout: Duration,
    pub grace: Duration,
    pub session_ttl: Duration,
    pub dedupe_ttl: Duration,
    pub sweep_interval: Duration,
    pub max_file_bytes: u64,
    pub ignored_dirs: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for OrchestratorConfig {
    fn from(bridge: &BridgeConfig) -> Self {
        Self {
            throttle: bridge.throttle(),
            timeout: bridge.timeout(),
            grace: KILL_GRACE,
            session_ttl: bridge.session_ttl(),
            dedupe_ttl: bridge.dedupe_ttl(),
            sweep_interval: bridge.sweep_interval(),
            max_file_bytes: bridge.max_file_bytes,
            ignored_dirs: bridge.ignored_dirs.clone(),
        }
    }
}

/// One inbound request.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub channel: String,
    pub prompt: String,
    /// Card title. Defaults to the prompt label.
    pub title: Option<String>,
}

impl TaskRequest {
    pub fn new(channel: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            prompt: prompt.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// What a completed task produced.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Final response text.
    pub text: String,
    /// Session id reported by the agent, if any.
    pub session_id: Option<String>,
    /// Whether the run continued an earlier session.
    pub resumed: bool,
    /// Files the agent added or changed in the workspace.
    pub files: Vec<ProducedFile>,
    pub elapsed: Duration,
    pub exit_code: Option<i32>,
}

impl TaskReport {
    /// Produced files checked against the delivery size limit.
    pub fn deliverable(&self, limit: u64) -> impl Iterator<Item = BridgeResult<&Path>> + '_ {
        self.files.iter().map(move |f| f.ensure_deliverable(limit))
    }
}

/// How a task ended when it did not fail.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Completed(TaskReport),
    /// The user cancelled. Nothing was saved and the card was left as is.
    Cancelled { elapsed: Duration },
}

/// Diagnostics for one channel.
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    pub channel: String,
    pub task: Option<TaskInfo>,
    pub has_session: bool,
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Spawning,
    Running,
    Completing,
    Cancelling,
    TimedOut,
}

impl TaskPhase {
    pub fn can_advance_to(self, next: TaskPhase) -> bool {
        use TaskPhase::*;
        matches!(
            (self, next),
            (Idle, Spawning)
                | (Spawning, Running)
                | (Spawning, Idle)
                | (Running, Completing)
                | (Running, Cancelling)
                | (Running, TimedOut)
                | (Completing, Idle)
                | (Cancelling, Idle)
                | (TimedOut, Idle)
        )
    }

    fn advance(&mut self, next: TaskPhase, channel: &str) {
        if !self.can_advance_to(next) {
            warn!(
                "Unexpected phase change for channel {}: {:?} -> {:?}",
                channel, self, next
            );
        }
        debug!("Channel {}: {:?} -> {:?}", channel, self, next);
        *self = next;
    }
}

/// Why the running loop stopped.
enum RunEnd {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Releases the channel's task entry when a run ends, however it ends.
struct ExitGuard<'a> {
    tasks: &'a TaskManager,
    channel: &'a str,
    id: TaskId,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.tasks.on_exit(self.channel, self.id);
    }
}

/// Label shown in task listings: the first prompt line, shortened.
pub fn prompt_label(prompt: &str) -> String {
    let line = prompt.lines().next().unwrap_or("").trim();
    if line.chars().count() <= LABEL_CHARS {
        return line.to_string();
    }
    let mut label: String = line.chars().take(LABEL_CHARS).collect();
    label.push_str("...");
    label
}

/// Runs agent tasks for chat channels.
pub struct Orchestrator {
    launcher: AgentLauncher,
    sink: Arc<dyn DeliverySink>,
    tasks: TaskManager,
    sessions: Arc<SessionStore>,
    dedupe: Arc<DedupeCache>,
    differ: SnapshotDiffer,
    settings: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        launcher: AgentLauncher,
        sink: Arc<dyn DeliverySink>,
        settings: OrchestratorConfig,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(settings.session_ttl));
        let dedupe = Arc::new(DedupeCache::new(settings.dedupe_ttl));
        Self {
            launcher,
            sink,
            tasks: TaskManager::new(),
            sessions,
            dedupe,
            differ: SnapshotDiffer::new(settings.ignored_dirs.clone()),
            settings,
        }
    }

    /// Build from the loaded application config.
    pub fn from_config(config: &AppConfig, sink: Arc<dyn DeliverySink>) -> anyhow::Result<Self> {
        let work_dir = config.agent.resolved_work_dir()?;
        let launcher = AgentLauncher::new(config.agent.clone(), work_dir);
        Ok(Self::new(
            launcher,
            sink,
            OrchestratorConfig::from(&config.bridge),
        ))
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.settings.max_file_bytes
    }

    /// Run one task to its end.
    ///
    /// Returns `ChannelBusy` without side effects if the channel already has
    /// a task. Cancellation is reported as `TaskOutcome::Cancelled`.
    #[tracing::instrument(skip(self, request), fields(channel = %request.channel))]
    pub async fn run(&self, request: TaskRequest) -> BridgeResult<TaskOutcome> {
        let channel = request.channel.as_str();
        if self.tasks.is_active(channel) {
            return Err(BridgeError::ChannelBusy {
                channel: channel.to_string(),
            });
        }

        let mut phase = TaskPhase::Idle;
        phase.advance(TaskPhase::Spawning, channel);

        let resume = self.sessions.get(channel).map(|s| s.session_id);
        let before = self.capture().await;
        let label = prompt_label(&request.prompt);
        let command = self.launcher.command(resume.as_deref());

        let spawned = match self.tasks.spawn(channel, &label, command) {
            Ok(spawned) => spawned,
            Err(e) => {
                phase.advance(TaskPhase::Idle, channel);
                return Err(e);
            }
        };
        let id = spawned.id;
        let _exit_guard = ExitGuard {
            tasks: &self.tasks,
            channel,
            id,
        };
        let started_at = spawned.started_at;
        let cancel = spawned.cancel;
        let mut child = spawned.child;
        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        phase.advance(TaskPhase::Running, channel);
        if let Some(session_id) = &resume {
            info!("Resuming session {} for channel {}", session_id, channel);
        }

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!("Failed to write prompt to agent stdin: {}", e);
                }
                // Dropping stdin closes it; the agent reads until EOF.
            });
        }
        let stderr_task = child.stderr.take().map(stderr_reader_task);
        let mut stdout = child.stdout.take();

        let base_title = request.title.clone().unwrap_or_else(|| label.clone());
        let card = Arc::new(CardTarget::new(Arc::clone(&self.sink), base_title));
        {
            let card = Arc::clone(&card);
            tokio::spawn(async move {
                card.open().await;
            });
        }
        let throttle = ThrottledSink::spawn(card.clone(), self.settings.throttle);

        let mut parser = StreamParser::new();
        let mut acc = ResultAccumulator::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = stdout.is_some();

        let end = loop {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => break RunEnd::TimedOut,
                _ = cancel.cancelled() => {
                    // The timer may not have fired yet when the loop was starved
                    // past the deadline.
                    break if tokio::time::Instant::now() >= deadline {
                        RunEnd::TimedOut
                    } else {
                        RunEnd::Cancelled
                    };
                }
                read = read_chunk(&mut stdout, &mut buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => {
                        for record in parser.feed(&buf[..n]) {
                            if acc.apply(record) {
                                throttle.push(acc.current());
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read agent stdout for channel {}: {}", channel, e);
                        stdout_open = false;
                    }
                },
                status = child.wait(), if !stdout_open => break RunEnd::Exited(status),
            }
        };

        if parser.pending_bytes() > 0 {
            debug!(
                "Discarding {} byte(s) of unterminated agent output",
                parser.pending_bytes()
            );
        }
        if matches!(end, RunEnd::Exited(Ok(_))) {
            self.tasks.mark_exited(channel, id);
        }

        let outcome = match end {
            RunEnd::TimedOut => {
                phase.advance(TaskPhase::TimedOut, channel);
                warn!(
                    "Task for channel {} timed out after {:?}, killing",
                    channel, self.settings.timeout
                );
                if let Err(e) = task::kill(&mut child).await {
                    warn!("Failed to reap timed out agent: {}", e);
                }
                self.tasks.mark_exited(channel, id);
                let err = BridgeError::Timeout {
                    after: self.settings.timeout,
                };
                let text = failure_text(acc.current(), &err);
                self.bounded("Timeout card update", channel, async {
                    throttle.drain().await;
                    card.finish(&text, CardStatus::TimedOut).await;
                })
                .await;
                Err(err)
            }
            RunEnd::Cancelled => {
                phase.advance(TaskPhase::Cancelling, channel);
                if let Err(e) = task::terminate(&mut child, self.settings.grace).await {
                    warn!("Failed to reap cancelled agent: {}", e);
                }
                self.bounded("Pending card update", channel, throttle.discard())
                    .await;
                let elapsed = started_at.elapsed();
                info!(
                    "Task for channel {} cancelled after {:.1}s",
                    channel,
                    elapsed.as_secs_f64()
                );
                Ok(TaskOutcome::Cancelled { elapsed })
            }
            RunEnd::Exited(exit) => {
                phase.advance(TaskPhase::Completing, channel);
                throttle.drain().await;
                if cancel.is_cancelled() {
                    let elapsed = started_at.elapsed();
                    info!(
                        "Task for channel {} cancelled after its agent exited, discarding the result",
                        channel
                    );
                    Ok(TaskOutcome::Cancelled { elapsed })
                } else {
                    match exit {
                        Err(e) => {
                            warn!("Failed to wait for agent on channel {}: {}", channel, e);
                            let err = BridgeError::Io(e);
                            let text = failure_text(acc.current(), &err);
                            card.finish(&text, CardStatus::Failed).await;
                            Err(err)
                        }
                        Ok(status) => {
                            let resumed = resume.is_some();
                            self.complete(channel, id, &card, acc, status, resumed, &before, started_at)
                                .await
                        }
                    }
                }
            }
        };

        if let Some(stderr_task) = stderr_task {
            stderr_task.abort();
        }
        phase.advance(TaskPhase::Idle, channel);
        outcome
    }

    /// Completion of an agent that exited on its own: final card, session,
    /// produced files.
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        channel: &str,
        id: TaskId,
        card: &CardTarget,
        acc: ResultAccumulator,
        status: ExitStatus,
        resumed: bool,
        before: &Snapshot,
        started_at: Instant,
    ) -> BridgeResult<TaskOutcome> {
        let exit_code = status.code();
        let text = match acc.finish(status.success(), exit_code) {
            Ok(text) => text,
            Err(err) => {
                warn!("Task for channel {} failed: {}", channel, err);
                card.finish(&err.to_string(), CardStatus::Failed).await;
                // A rejected resume token fails the same way every time.
                if resumed && self.sessions.clear(channel) {
                    info!(
                        "Cleared session for channel {} after failed resume",
                        channel
                    );
                }
                return Err(err);
            }
        };

        card.finish(&text, CardStatus::Done).await;
        let after = self.capture().await;
        let session_id = acc.session_id().map(str::to_string);
        let committed = self.tasks.complete(channel, id, || {
            if let Some(session_id) = &session_id {
                self.sessions.save(channel, session_id);
            }
        });
        let elapsed = started_at.elapsed();
        if !committed {
            info!(
                "Task for channel {} was cancelled while completing, session not saved",
                channel
            );
            return Ok(TaskOutcome::Cancelled { elapsed });
        }

        let diff = SnapshotDiffer::diff(before, &after);
        let files = SnapshotDiffer::produced_files(&diff, &after);
        info!(
            "Task for channel {} completed in {:.1}s ({} file(s) produced)",
            channel,
            elapsed.as_secs_f64(),
            files.len()
        );
        Ok(TaskOutcome::Completed(TaskReport {
            text,
            session_id,
            resumed,
            files,
            elapsed,
            exit_code,
        }))
    }

    /// Await a terminal card operation for at most the kill grace period.
    async fn bounded(&self, what: &str, channel: &str, op: impl Future<Output = ()>) {
        if tokio::time::timeout(self.settings.grace, op).await.is_err() {
            warn!(
                "{} for channel {} did not finish within {:?}, giving up",
                what, channel, self.settings.grace
            );
        }
    }

    async fn capture(&self) -> Snapshot {
        let differ = self.differ.clone();
        let root = self.launcher.work_dir().to_path_buf();
        match tokio::task::spawn_blocking(move || differ.capture(&root)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Workspace snapshot failed: {}", e);
                Snapshot::default()
            }
        }
    }

    /// Cancel the channel's running task, if any.
    pub fn cancel(&self, channel: &str) -> CancelReport {
        self.tasks.cancel(channel)
    }

    /// Forget the channel's session so the next task starts fresh.
    pub fn reset_session(&self, channel: &str) -> bool {
        let cleared = self.sessions.clear(channel);
        if cleared {
            info!("Session for channel {} reset", channel);
        }
        cleared
    }

    pub fn status(&self, channel: &str) -> ChannelStatus {
        ChannelStatus {
            channel: channel.to_string(),
            task: self.tasks.task_info(channel),
            has_session: self.sessions.contains(channel),
        }
    }

    pub fn active_tasks(&self) -> Vec<TaskInfo> {
        self.tasks.active_tasks()
    }

    /// `true` the first time an inbound event id is seen.
    pub fn is_new_event(&self, event_id: &str) -> bool {
        self.dedupe.check_and_insert(event_id)
    }

    /// Periodically drop expired sessions and event ids.
    pub fn start_sweeper(&self) -> JoinHandle<()> {
        let sessions = Arc::clone(&self.sessions);
        let dedupe = Arc::clone(&self.dedupe);
        let interval = self.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sessions.sweep();
                let events = dedupe.sweep();
                if events > 0 {
                    debug!("Swept {} expired event id(s)", events);
                }
            }
        })
    }

    /// Cancel every running task. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let reports = self.tasks.cancel_all();
        if !reports.is_empty() {
            info!("Shutdown cancelled {} task(s)", reports.len());
        }
        reports.len()
    }

    pub fn work_dir(&self) -> &Path {
        self.launcher.work_dir()
    }
}

fn failure_text(partial: &str, err: &BridgeError) -> String {
    if partial.is_empty() {
        err.to_string()
    } else {
        format!("{partial}\n\n({err})")
    }
}

async fn read_chunk(stdout: &mut Option<ChildStdout>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdout {
        Some(out) => out.read(buf).await,
        None => Ok(0),
    }
}

fn stderr_reader_task(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let display: String = line.chars().take(200).collect();
            debug!("agent stderr: {}", display);
        }
    })
}

/// Produced file paths relative to `root`, for display.
pub fn relative_paths<'a>(files: &'a [ProducedFile], root: &'a Path) -> Vec<PathBuf> {
    files
        .iter()
        .map(|f| f.path.strip_prefix(root).unwrap_or(&f.path).to_path_buf())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AgentConfig;
    use crate::sink::DeliveryHandle;

    struct NullSink;

    #[async_trait::async_trait]
    impl DeliverySink for NullSink {
        async fn create(&self, _initial_text: &str, _title: &str) -> anyhow::Result<DeliveryHandle> {
            Ok(DeliveryHandle("null".to_string()))
        }

        async fn update(&self, _handle: &DeliveryHandle, _text: &str, _title: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_sessions_and_events() {
        let clock = ManualClock::default();
        let settings = OrchestratorConfig {
            session_ttl: Duration::from_secs(60),
            dedupe_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator {
            launcher: AgentLauncher::new(AgentConfig::default(), std::env::temp_dir()),
            sink: Arc::new(NullSink),
            tasks: TaskManager::new(),
            sessions: Arc::new(SessionStore::with_clock(
                settings.session_ttl,
                Arc::new(clock.clone()),
            )),
            dedupe: Arc::new(DedupeCache::with_clock(
                settings.dedupe_ttl,
                Arc::new(clock.clone()),
            )),
            differ: SnapshotDiffer::new(Vec::new()),
            settings,
        };
        orchestrator.sessions().save("chat-1", "sess-a");
        assert!(orchestrator.is_new_event("evt-1"));

        let sweeper = orchestrator.start_sweeper();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(orchestrator.status("chat-1").has_session);
        assert_eq!(orchestrator.dedupe.len(), 1);

        clock.advance(chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!orchestrator.status("chat-1").has_session);
        assert!(orchestrator.dedupe.is_empty());
        sweeper.abort();
    }

    #[test]
    fn test_prompt_label() {
        assert_eq!(prompt_label("fix the build\nand more"), "fix the build");
        let long = "x".repeat(80);
        let label = prompt_label(&long);
        assert_eq!(label.chars().count(), LABEL_CHARS + 3);
        assert!(label.ends_with("..."));
        assert_eq!(prompt_label(""), "");
    }

    #[test]
    fn test_phase_transitions() {
        use TaskPhase::*;
        assert!(Idle.can_advance_to(Spawning));
        assert!(Running.can_advance_to(TimedOut));
        assert!(Cancelling.can_advance_to(Idle));
        assert!(!Idle.can_advance_to(Running));
        assert!(!Completing.can_advance_to(Cancelling));
        assert!(!TimedOut.can_advance_to(Completing));
    }

    #[test]
    fn test_failure_text() {
        let err = BridgeError::Timeout {
            after: Duration::from_secs(600),
        };
        assert_eq!(failure_text("", &err), "agent timed out after 600s");
        assert_eq!(
            failure_text("half done", &err),
            "half done\n\n(agent timed out after 600s)"
        );
    }

    #[test]
    fn test_settings_from_bridge_config() {
        let settings = OrchestratorConfig::default();
        assert_eq!(settings.throttle, Duration::from_millis(1500));
        assert_eq!(settings.timeout, Duration::from_secs(600));
        assert_eq!(settings.grace, KILL_GRACE);
    }
}
