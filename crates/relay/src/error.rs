//! Bridge error types.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the bridge.
///
/// User cancellation is absent: it is reported as
/// `TaskOutcome::Cancelled`.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A task is already running for this channel. Requests are rejected, never queued.
    #[error("a task is already running for channel {channel}")]
    ChannelBusy { channel: String },

    /// The agent process could not be started.
    #[error("failed to start {program}: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The agent exited unsuccessfully without producing usable text.
    #[error("agent exited with {}", describe_exit(*code))]
    ProcessExit { code: Option<i32> },

    /// The hard wall-clock limit was exceeded and the agent was killed.
    #[error("agent timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    /// A produced file is too large to deliver.
    #[error("{} is {size} bytes, over the {limit} byte limit", path.display())]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::ProcessExit { code: Some(2) };
        assert_eq!(err.to_string(), "agent exited with exit code 2");

        let err = BridgeError::ProcessExit { code: None };
        assert!(err.to_string().contains("killed by signal"));

        let err = BridgeError::Timeout {
            after: Duration::from_secs(600),
        };
        assert_eq!(err.to_string(), "agent timed out after 600s");
    }
}
