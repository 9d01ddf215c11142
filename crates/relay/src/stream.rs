//! Incremental parsing of the agent's stdout.
//!
//! `StreamParser` turns arbitrarily split byte chunks into classified
//! records; `ResultAccumulator` folds those records into the best-known
//! response text.

use log::trace;
use relay_protocol::StreamRecord;

use crate::error::{BridgeError, BridgeResult};

/// Response used when the agent succeeds without printing anything.
pub const NO_OUTPUT_TEXT: &str = "Task completed, no output.";

/// Splits raw stdout bytes into lines and classifies each complete line.
///
/// Partial lines are buffered until their newline arrives. A trailing
/// fragment without a newline is never decoded.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return the records of every line it completed.
    ///
    /// Only the new bytes are scanned for newlines and the consumed prefix is
    /// dropped once per call, so a long line split into many chunks costs
    /// linear time.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamRecord> {
        let scan_from = self.buf.len();
        self.buf.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut consumed = 0;
        for pos in newline_positions(&self.buf[scan_from..]) {
            let end = scan_from + pos;
            classify_line(&self.buf[consumed..end], &mut records);
            consumed = end + 1;
        }
        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        records
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

fn newline_positions(bytes: &[u8]) -> impl Iterator<Item = usize> + '_ {
    bytes
        .iter()
        .enumerate()
        .filter(|(_, b)| **b == b'\n')
        .map(|(i, _)| i)
}

fn classify_line(line: &[u8], records: &mut Vec<StreamRecord>) {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let display: String = line.chars().take(200).collect();
    trace!("agent stdout: {}", display);
    records.extend(StreamRecord::classify(line));
}

/// Folds stream records into the current response.
#[derive(Debug, Default, Clone)]
pub struct ResultAccumulator {
    text: String,
    result: Option<String>,
    session_id: Option<String>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one record. Returns `true` if the visible response changed.
    pub fn apply(&mut self, record: StreamRecord) -> bool {
        match record {
            StreamRecord::SessionId(id) => {
                self.session_id = Some(id);
                false
            }
            StreamRecord::Result(text) => {
                let changed = self.current() != text;
                self.text.clone_from(&text);
                self.result = Some(text);
                changed
            }
            StreamRecord::Delta(fragment) => {
                self.text.push_str(&fragment);
                self.result.is_none() && !fragment.is_empty()
            }
            StreamRecord::FullText(text) => {
                let changed = self.text != text;
                self.text = text;
                self.result.is_none() && changed
            }
            StreamRecord::Unrecognized => false,
        }
    }

    /// Best-known response so far.
    pub fn current(&self) -> &str {
        self.result.as_deref().unwrap_or(&self.text)
    }

    /// Last session id the agent reported.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Final response once the process has exited.
    ///
    /// `code` is the exit code (`None` when killed by a signal).
    pub fn finish(&self, success: bool, code: Option<i32>) -> BridgeResult<String> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        if !self.text.is_empty() {
            return Ok(self.text.clone());
        }
        if success {
            return Ok(NO_OUTPUT_TEXT.to_string());
        }
        Err(BridgeError::ProcessExit { code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!(
            "{{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"{text}\"}}]}},\"timestamp_ms\":1}}\n"
        )
    }

    fn full(text: &str) -> String {
        format!(
            "{{\"type\":\"assistant\",\"message\":{{\"content\":[{{\"type\":\"text\",\"text\":\"{text}\"}}]}}}}\n"
        )
    }

    fn run(lines: &[String]) -> ResultAccumulator {
        let mut parser = StreamParser::new();
        let mut acc = ResultAccumulator::new();
        for line in lines {
            for record in parser.feed(line.as_bytes()) {
                acc.apply(record);
            }
        }
        acc
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut parser = StreamParser::new();
        let line = delta("Hello");
        let (a, b) = line.as_bytes().split_at(10);

        assert!(parser.feed(a).is_empty());
        assert_eq!(parser.pending_bytes(), 10);
        assert_eq!(
            parser.feed(b),
            vec![StreamRecord::Delta("Hello".to_string())]
        );
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut parser = StreamParser::new();
        let chunk = format!(
            "{}\n\r\n{}{}",
            r#"{"type":"system","session_id":"s1"}"#,
            delta("a"),
            delta("b")
        );
        assert_eq!(
            parser.feed(chunk.as_bytes()),
            vec![
                StreamRecord::SessionId("s1".to_string()),
                StreamRecord::Delta("a".to_string()),
                StreamRecord::Delta("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_unterminated_tail_is_not_decoded() {
        let mut parser = StreamParser::new();
        let records = parser.feed(br#"{"type":"result","result":"x"}"#);
        assert!(records.is_empty());
        assert!(parser.pending_bytes() > 0);
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        let acc = run(&[
            "garbage {{{\n".to_string(),
            delta("ok"),
            "\u{0}\u{1}\n".to_string(),
        ]);
        assert_eq!(acc.current(), "ok");
    }

    #[test]
    fn test_deltas_append() {
        let acc = run(&[delta("He"), delta("llo")]);
        assert_eq!(acc.current(), "Hello");
    }

    #[test]
    fn test_full_text_replaces() {
        let acc = run(&[full("Hi"), full("Hi there")]);
        assert_eq!(acc.current(), "Hi there");
    }

    #[test]
    fn test_result_overrides_deltas() {
        let acc = run(&[
            delta("He"),
            delta("llo"),
            "{\"type\":\"result\",\"result\":\"DONE\",\"session_id\":\"s9\"}\n".to_string(),
        ]);
        assert_eq!(acc.current(), "DONE");
        assert_eq!(acc.session_id(), Some("s9"));
        assert_eq!(acc.finish(true, Some(0)).unwrap(), "DONE");
    }

    #[test]
    fn test_last_session_id_wins() {
        let acc = run(&[
            "{\"type\":\"system\",\"session_id\":\"first\"}\n".to_string(),
            "{\"type\":\"system\",\"session_id\":\"second\"}\n".to_string(),
        ]);
        assert_eq!(acc.session_id(), Some("second"));
    }

    #[test]
    fn test_apply_reports_visible_changes() {
        let mut acc = ResultAccumulator::new();
        assert!(!acc.apply(StreamRecord::SessionId("s".into())));
        assert!(acc.apply(StreamRecord::Delta("a".into())));
        assert!(!acc.apply(StreamRecord::FullText("a".into())));
        assert!(acc.apply(StreamRecord::Result("b".into())));
        // Text after the result does not change what the user sees.
        assert!(!acc.apply(StreamRecord::Delta("c".into())));
        assert_eq!(acc.current(), "b");
        assert!(!acc.apply(StreamRecord::Unrecognized));
    }

    #[test]
    fn test_finish_fallbacks() {
        let acc = ResultAccumulator::new();
        assert_eq!(acc.finish(true, Some(0)).unwrap(), NO_OUTPUT_TEXT);
        assert!(matches!(
            acc.finish(false, Some(3)),
            Err(BridgeError::ProcessExit { code: Some(3) })
        ));

        let acc = run(&[delta("partial")]);
        assert_eq!(acc.finish(false, Some(1)).unwrap(), "partial");
    }

    #[test]
    fn test_long_line_in_small_chunks() {
        let text = "x".repeat(4 * 1024 * 1024);
        let line = format!("{{\"type\":\"result\",\"result\":\"{text}\"}}\n");
        let mut parser = StreamParser::new();
        let mut records = Vec::new();

        let started = std::time::Instant::now();
        for chunk in line.as_bytes().chunks(4096) {
            records.extend(parser.feed(chunk));
        }

        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(records, vec![StreamRecord::Result(text)]);
        assert_eq!(parser.pending_bytes(), 0);
    }
}
