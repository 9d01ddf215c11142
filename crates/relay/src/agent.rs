//! Launch configuration for the external agent.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::AgentConfig;

/// Builds the command line for one agent run.
#[derive(Debug, Clone)]
pub struct AgentLauncher {
    config: AgentConfig,
    work_dir: PathBuf,
}

impl AgentLauncher {
    pub fn new(config: AgentConfig, work_dir: PathBuf) -> Self {
        Self { config, work_dir }
    }

    /// Directory the agent runs in. Snapshots are taken here too.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Command for one run. `resume` is the session id to continue, if any.
    ///
    /// The prompt is not on the command line: it is written to stdin.
    pub fn command(&self, resume: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args);

        if let Some(session_id) = resume {
            cmd.arg(&self.config.resume_flag).arg(session_id);
        }

        cmd.current_dir(&self.work_dir)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}
