//! Agent output records and their classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Raw lines (as written by the agent)
// ============================================================================

/// One decoded stdout line.
///
/// Every field is optional: the agent emits many record shapes and only a few
/// of them matter to the bridge. `message`, `result` and `timestamp_ms` are
/// kept as raw JSON so an unexpected shape in one field does not make the
/// whole line (and its session id) unreadable. The same goes for the two
/// spellings of the session id, which may both appear on one line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentLine {
    /// Record tag: "system", "assistant", "user", "result", ...
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Conversation identifier, usable to resume the session later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Value>,

    /// Camel-case spelling of `session_id`, used when the former is absent.
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id_camel: Option<Value>,

    /// Final answer text on "result" records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Assistant message payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    /// Per-chunk timestamp. Present only on partial (delta) assistant records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<Value>,
}

/// Assistant message body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
}

/// Message content is either a bare string or a list of typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single content block. Non-text blocks (tool calls, images) are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl AgentMessage {
    /// Concatenated text of all text blocks, `None` if there is no text.
    pub fn text(&self) -> Option<String> {
        let text = match self.content.as_ref()? {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text.as_deref())
                .collect::<String>(),
        };
        if text.is_empty() { None } else { Some(text) }
    }
}

impl AgentLine {
    /// Parse a single line. Returns `None` for anything that is not a JSON object.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }

    fn assistant_text(&self) -> Option<String> {
        let message = self.message.clone()?;
        serde_json::from_value::<AgentMessage>(message).ok()?.text()
    }

    /// First non-empty string among the session id spellings.
    pub fn session_id(&self) -> Option<&str> {
        [&self.session_id, &self.session_id_camel]
            .into_iter()
            .filter_map(|v| v.as_ref()?.as_str())
            .find(|id| !id.is_empty())
    }

    fn result_text(&self) -> Option<&str> {
        self.result.as_ref()?.as_str().filter(|s| !s.is_empty())
    }

    /// Classify this line into stream records.
    ///
    /// A single line can carry both a session id and content, so the session
    /// id record (if any) always comes first.
    pub fn into_records(self) -> Vec<StreamRecord> {
        let mut records = Vec::with_capacity(2);

        if let Some(id) = self.session_id() {
            records.push(StreamRecord::SessionId(id.to_string()));
        }

        match self.kind.as_deref() {
            Some("result") => {
                if let Some(text) = self.result_text() {
                    records.push(StreamRecord::Result(text.to_string()));
                }
            }
            Some("assistant") => {
                if let Some(text) = self.assistant_text() {
                    if self.timestamp_ms.is_some() {
                        records.push(StreamRecord::Delta(text));
                    } else {
                        records.push(StreamRecord::FullText(text));
                    }
                }
            }
            _ => {}
        }

        if records.is_empty() {
            records.push(StreamRecord::Unrecognized);
        }
        records
    }
}

// ============================================================================
// Classified records
// ============================================================================

/// A classified stdout line. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRecord {
    /// Conversation id to resume with on the next request.
    SessionId(String),
    /// Final authoritative answer.
    Result(String),
    /// Incremental fragment, appended to what came before.
    Delta(String),
    /// Complete restatement, replaces what came before.
    FullText(String),
    /// Anything else, including undecodable lines.
    Unrecognized,
}

impl StreamRecord {
    /// Decode and classify one line. Never fails: garbage becomes `Unrecognized`.
    pub fn classify(line: &str) -> Vec<StreamRecord> {
        match AgentLine::parse(line) {
            Some(parsed) => parsed.into_records(),
            None => vec![StreamRecord::Unrecognized],
        }
    }
}
