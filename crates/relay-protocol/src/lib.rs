//! Wire types for the external agent's streaming output.
//!
//! The agent writes one JSON object per line to stdout:
//!
//! ```text
//! {"type":"system","subtype":"init","session_id":"5f0c..."}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"He"}]},"timestamp_ms":1738764000000}
//! {"type":"assistant","message":{"content":[{"type":"text","text":"Hello there"}]}}
//! {"type":"result","result":"Hello there","session_id":"5f0c..."}
//! ```
//!
//! This crate only decodes and classifies lines. Buffering raw bytes into
//! lines and folding records into a response live in the `relay` crate.

pub mod records;

pub use records::{AgentLine, AgentMessage, ContentBlock, MessageContent, StreamRecord};
