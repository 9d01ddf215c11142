//! Configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file
//! (`$XDG_CONFIG_HOME/relay/config.toml`, written with defaults on first run),
//! then `RELAY__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

use crate::dedupe::DEFAULT_DEDUPE_TTL_SECS;
use crate::session::DEFAULT_SESSION_TTL_HOURS;
use crate::snapshot::{DEFAULT_IGNORED_DIRS, MAX_DELIVERABLE_BYTES};
use crate::throttle::DEFAULT_THROTTLE_MS;

pub const APP_NAME: &str = "relay";

/// Default hard limit for one task (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Default interval of the session/dedupe sweeper.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub agent: AgentConfig,
    pub bridge: BridgeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            agent: AgentConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write log records, without colors, to this file.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Open the log file for appending, creating its directory if needed.
    pub fn open_log_file(&self) -> Result<Option<fs::File>> {
        let Some(file) = self.file.as_deref() else {
            return Ok(None);
        };
        let path = expand_str_path(file)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {parent:?}"))?;
        }
        let handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening log file {}", path.display()))?;
        Ok(Some(handle))
    }
}

/// How to launch the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Executable name or path.
    pub executable: String,
    /// Arguments passed on every run.
    pub args: Vec<String>,
    /// Flag that precedes the session id when resuming.
    pub resume_flag: String,
    /// Working directory (also the snapshot root). Defaults to the current directory.
    pub work_dir: Option<String>,
    /// Extra environment for the agent process.
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            args: ["-p", "--output-format", "stream-json", "--verbose"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            resume_flag: "--resume".to_string(),
            work_dir: None,
            env: HashMap::new(),
        }
    }
}

impl AgentConfig {
    /// Resolved working directory with `~` and `$VARS` expanded.
    pub fn resolved_work_dir(&self) -> Result<PathBuf> {
        match self.work_dir.as_deref() {
            Some(dir) => expand_str_path(dir),
            None => env::current_dir().context("resolving current directory"),
        }
    }
}

/// Orchestration tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Minimum gap between card updates.
    pub throttle_ms: u64,
    /// Hard wall-clock limit per task.
    pub timeout_secs: u64,
    /// Idle time after which a channel's session is forgotten.
    pub session_ttl_hours: u64,
    /// How long inbound event ids are remembered.
    pub dedupe_ttl_secs: u64,
    /// How often expired sessions and event ids are swept.
    pub sweep_interval_secs: u64,
    /// Largest produced file handed back for delivery.
    pub max_file_bytes: u64,
    /// Directory names skipped by workspace snapshots.
    pub ignored_dirs: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            throttle_ms: DEFAULT_THROTTLE_MS,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            session_ttl_hours: DEFAULT_SESSION_TTL_HOURS,
            dedupe_ttl_secs: DEFAULT_DEDUPE_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_file_bytes: MAX_DELIVERABLE_BYTES,
            ignored_dirs: DEFAULT_IGNORED_DIRS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BridgeConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours.saturating_mul(3600))
    }

    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Load the configuration, writing a default file first if none exists.
pub fn load_or_init(config_file: &Path, dry_run: bool) -> Result<AppConfig> {
    if !config_file.exists() {
        if dry_run {
            info!(
                "dry-run: would create default config at {}",
                config_file.display()
            );
        } else {
            write_default_config(config_file)?;
        }
    }
    load(config_file)
}

/// Load without touching the filesystem.
pub fn load(config_file: &Path) -> Result<AppConfig> {
    let defaults = AppConfig::default();
    let built = Config::builder()
        .set_default("logging.level", defaults.logging.level.as_str())?
        .set_default("bridge.throttle_ms", defaults.bridge.throttle_ms)?
        .set_default("bridge.timeout_secs", defaults.bridge.timeout_secs)?
        .add_source(
            File::from(config_file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push_str("\n\n");
    buffer
}

pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

pub fn default_config_file() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.bridge.throttle(), Duration::from_millis(1500));
        assert_eq!(config.bridge.session_ttl(), Duration::from_secs(10 * 3600));
        assert_eq!(config.bridge.max_file_bytes, 30 * 1024 * 1024);
        assert_eq!(config.agent.resume_flag, "--resume");
    }

    #[test]
    fn test_default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_or_init(&path, false).unwrap();
        assert!(path.exists());
        assert_eq!(config.bridge.timeout_secs, DEFAULT_TIMEOUT_SECS);

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for relay"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[agent]
executable = "/opt/agent/bin/agent"
work_dir = "/srv/work"

[bridge]
timeout_secs = 30
ignored_dirs = ["vendor"]
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.agent.executable, "/opt/agent/bin/agent");
        assert_eq!(
            config.agent.resolved_work_dir().unwrap(),
            PathBuf::from("/srv/work")
        );
        assert_eq!(config.bridge.timeout(), Duration::from_secs(30));
        assert_eq!(config.bridge.throttle_ms, DEFAULT_THROTTLE_MS);
        assert_eq!(config.bridge.ignored_dirs, vec!["vendor".to_string()]);
    }

    #[test]
    fn test_log_file_is_created_and_appended() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("relay.log");
        let logging = LoggingConfig {
            file: Some(path.display().to_string()),
            ..LoggingConfig::default()
        };

        writeln!(logging.open_log_file().unwrap().unwrap(), "first").unwrap();
        writeln!(logging.open_log_file().unwrap().unwrap(), "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");

        assert!(LoggingConfig::default().open_log_file().unwrap().is_none());
    }

    #[test]
    fn test_dry_run_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        load_or_init(&path, true).unwrap();
        assert!(!path.exists());
    }
}
