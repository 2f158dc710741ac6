//! Decoder for the upstream event stream: `data: {json}` lines, one record per line.
//!
//! Bytes arrive in arbitrary chunks; the decoder keeps the trailing partial line
//! until its newline shows up. A record that fails to parse is logged and skipped.

use serde::Deserialize;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// Which part of a workflow a lifecycle event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Workflow,
    Node,
}

/// Typed upstream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Full answer so far; replaces the accumulator.
    ContentDelta(String),
    /// Incremental fragment; appended to the accumulator.
    ContentChunk(String),
    /// Workflow or node started/finished. Informational only.
    Lifecycle {
        stage: Stage,
        status: String,
        error: Option<String>,
    },
    /// Upstream reported a failure; the request must fail.
    Error(String),
    /// End of the answer.
    Done,
    /// Event kind this decoder does not know.
    Unknown(String),
}

/// Raw record: discriminator plus the fields any known kind may carry.
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    data: Option<RawEventData>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEventData {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// A partial line longer than this is dropped up to its newline.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Line-buffered decoder. One instance per response body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Inside an oversized line; skip until the next newline.
    discarding: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one body chunk; returns the events of every line it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;
        while let Some(i) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + i;
            if self.discarding {
                self.discarding = false;
            } else if let Some(event) = decode_line(&String::from_utf8_lossy(&self.buffer[start..end])) {
                events.push(event);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        if self.buffer.len() > MAX_LINE_BYTES {
            log::warn!(
                "dify: dropping event line longer than {} bytes",
                MAX_LINE_BYTES
            );
            self.buffer.clear();
            self.discarding = true;
        }
        events
    }

    /// Flush a final line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.is_empty() || std::mem::take(&mut self.discarding) {
            return None;
        }
        decode_line(&String::from_utf8_lossy(&rest))
    }
}

/// Decode one complete line. Blank, non-data, done-marker and malformed lines yield nothing.
pub fn decode_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return None;
    }
    let payload = line.strip_prefix(DATA_PREFIX)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload).trim();
    if payload == DONE_MARKER {
        return None;
    }
    let raw: RawEvent = match serde_json::from_str(payload) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("dify: skipping malformed event line ({}): {}", e, payload);
            return None;
        }
    };
    Some(classify(raw))
}

fn classify(raw: RawEvent) -> StreamEvent {
    let data = raw.data.unwrap_or_default();
    match raw.event.as_str() {
        "message" | "agent_message" => match raw.answer {
            Some(answer) => StreamEvent::ContentDelta(answer),
            // A delta replaces the answer; one without a body must not erase it.
            None => {
                log::debug!("dify: {} without answer field", raw.event);
                StreamEvent::Unknown(raw.event.clone())
            }
        },
        "text_chunk" => StreamEvent::ContentChunk(data.text.unwrap_or_default()),
        "workflow_started" | "workflow_finished" | "node_started" | "node_finished" => {
            let stage = if raw.event.starts_with("workflow") {
                Stage::Workflow
            } else {
                Stage::Node
            };
            let status = data.status.unwrap_or_else(|| {
                if raw.event.ends_with("started") {
                    "running".to_string()
                } else {
                    "finished".to_string()
                }
            });
            let error = data.error.filter(|e| !e.trim().is_empty());
            if let Some(ref e) = error {
                log::warn!(
                    "dify: {} {} reported error: {}",
                    raw.event,
                    data.title.as_deref().unwrap_or(""),
                    e
                );
            } else {
                log::debug!("dify: {} ({})", raw.event, status);
            }
            StreamEvent::Lifecycle { stage, status, error }
        }
        "error" => {
            let message = raw.message.unwrap_or_else(|| "unknown upstream error".to_string());
            let message = match raw.code {
                Some(serde_json::Value::String(code)) => format!("{} ({})", message, code),
                Some(serde_json::Value::Null) | None => message,
                Some(code) => format!("{} ({})", message, code),
            };
            StreamEvent::Error(message)
        }
        "message_end" => StreamEvent::Done,
        other => {
            log::debug!("dify: ignoring event kind {:?}", other);
            StreamEvent::Unknown(other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: {\"event\":\"text_ch").is_empty());
        let events = d.feed(b"unk\",\"data\":{\"text\":\"hi\"}}\n\ndata: {\"event\":\"message_end\"}\n");
        assert_eq!(
            events,
            vec![StreamEvent::ContentChunk("hi".into()), StreamEvent::Done]
        );
    }

    #[test]
    fn multibyte_char_split_between_chunks() {
        let line = "data: {\"event\":\"message\",\"answer\":\"你好\"}\n".as_bytes();
        let mut d = SseDecoder::new();
        let (a, b) = line.split_at(40);
        let mut events = d.feed(a);
        events.extend(d.feed(b));
        assert_eq!(events, vec![StreamEvent::ContentDelta("你好".into())]);
    }

    #[test]
    fn malformed_and_foreign_lines_are_skipped() {
        let mut d = SseDecoder::new();
        let events = d.feed(
            b"event: ping\n: comment\ndata: {not json\n\ndata: [DONE]\ndata: {\"event\":\"message\",\"answer\":\"ok\"}\n",
        );
        assert_eq!(events, vec![StreamEvent::ContentDelta("ok".into())]);
    }

    #[test]
    fn node_error_is_lifecycle_not_failure() {
        let event = decode_line(
            r#"data: {"event":"node_finished","data":{"status":"failed","error":"boom","title":"LLM"}}"#,
        );
        assert_eq!(
            event,
            Some(StreamEvent::Lifecycle {
                stage: Stage::Node,
                status: "failed".into(),
                error: Some("boom".into()),
            })
        );
    }

    #[test]
    fn error_event_carries_message_and_code() {
        let event = decode_line(r#"data: {"event":"error","message":"quota exceeded","code":"429"}"#);
        assert_eq!(event, Some(StreamEvent::Error("quota exceeded (429)".into())));
    }

    #[test]
    fn message_without_answer_is_not_a_delta() {
        let event = decode_line(r#"data: {"event":"message","conversation_id":"c"}"#);
        assert_eq!(event, Some(StreamEvent::Unknown("message".into())));
        let event = decode_line(r#"data: {"event":"agent_message","answer":""}"#);
        assert_eq!(event, Some(StreamEvent::ContentDelta(String::new())));
    }

    #[test]
    fn unknown_kind_is_tagged() {
        let event = decode_line(r#"data: {"event":"tts_message"}"#);
        assert_eq!(event, Some(StreamEvent::Unknown("tts_message".into())));
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: {\"event\":\"message_end\"}").is_empty());
        assert_eq!(d.finish(), Some(StreamEvent::Done));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn many_lines_in_one_chunk() {
        let mut body = String::new();
        for i in 0..500 {
            body.push_str(&format!("data: {{\"event\":\"text_chunk\",\"data\":{{\"text\":\"{}\"}}}}\n\n", i));
        }
        let mut d = SseDecoder::new();
        let events = d.feed(body.as_bytes());
        assert_eq!(events.len(), 500);
        assert_eq!(events[499], StreamEvent::ContentChunk("499".into()));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn oversized_line_is_dropped_up_to_newline() {
        let mut d = SseDecoder::new();
        let mut big = b"data: {\"event\":\"message\",\"answer\":\"".to_vec();
        big.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 1));
        assert!(d.feed(&big).is_empty());
        assert!(d.feed(b"xxxx\"}").is_empty());
        let events = d.feed(b"\ndata: {\"event\":\"message\",\"answer\":\"ok\"}\n");
        assert_eq!(events, vec![StreamEvent::ContentDelta("ok".into())]);
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn crlf_line_endings() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"data: {\"event\":\"workflow_started\"}\r\n\r\n");
        assert_eq!(
            events,
            vec![StreamEvent::Lifecycle {
                stage: Stage::Workflow,
                status: "running".into(),
                error: None,
            }]
        );
    }
}
