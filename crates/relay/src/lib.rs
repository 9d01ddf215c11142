//! Relay: runs a coding agent per chat channel and streams its output back.
//!
//! A request for a channel spawns the agent CLI, feeds the prompt on stdin,
//! parses line-delimited JSON from stdout and edits a chat card with the
//! growing response, rate limited. Session ids are remembered per channel so
//! follow-up requests resume the same conversation, and files the agent
//! writes into its workspace are reported back.
//!
//! [`Orchestrator`] is the entry point; chat transports implement
//! [`DeliverySink`].

pub mod agent;
pub mod clock;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod sink;
pub mod snapshot;
pub mod stream;
pub mod task;
pub mod throttle;

pub use agent::AgentLauncher;
pub use config::AppConfig;
pub use error::{BridgeError, BridgeResult};
pub use orchestrator::{
    ChannelStatus, Orchestrator, OrchestratorConfig, TaskOutcome, TaskReport, TaskRequest,
};
pub use sink::{CardStatus, DeliveryHandle, DeliverySink};
pub use snapshot::{FileChange, ProducedFile};
