//! Native SSE protocol of the message-part backend.
//!
//! The server publishes one global event stream; every event carries the
//! session it belongs to, and consumers filter client-side. Payload casing
//! is the server's own (`sessionID`, `callID`), renamed field by field.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum OpenCodeEvent {
    #[serde(rename = "message.part.updated")]
    PartUpdated { part: MessagePart },
    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },
    #[serde(rename = "session.status")]
    SessionStatus {
        #[serde(rename = "sessionID")]
        session_id: String,
        status: SessionStatusPayload,
    },
    #[serde(rename = "session.diff")]
    SessionDiff {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(default)]
        diff: Vec<SessionDiffEntry>,
    },
    #[serde(rename = "session.error")]
    SessionError {
        #[serde(rename = "sessionID", default)]
        session_id: Option<String>,
        #[serde(default)]
        error: SessionErrorPayload,
    },
    #[serde(rename = "question.asked")]
    QuestionAsked {
        id: String,
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(default)]
        questions: Vec<QuestionPayload>,
    },
    #[serde(rename = "question.replied")]
    QuestionReplied {
        #[serde(rename = "requestID")]
        request_id: String,
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(default)]
        answers: Vec<Vec<String>>,
    },
    #[serde(rename = "question.rejected")]
    QuestionRejected {
        #[serde(rename = "requestID")]
        request_id: String,
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    #[serde(rename = "todo.updated")]
    TodoUpdated {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(default)]
        todos: Vec<TodoPayload>,
    },
}

/// Parse one SSE `data:` payload. Unknown event families (`session.idle`,
/// `session.compacted`, `permission.updated`, `message.removed`, file-watcher
/// noise) and malformed payloads are no-ops, never stream errors.
pub fn parse_sse_data(data: &str) -> Option<OpenCodeEvent> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

impl OpenCodeEvent {
    /// Session the event belongs to. `None` means not scoped (applies to
    /// whichever turn is listening).
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::PartUpdated { part } => Some(part.session_id.as_str()),
            Self::MessageUpdated { info } => Some(info.session_id.as_str()),
            Self::SessionStatus { session_id, .. }
            | Self::SessionDiff { session_id, .. }
            | Self::QuestionAsked { session_id, .. }
            | Self::QuestionReplied { session_id, .. }
            | Self::QuestionRejected { session_id, .. }
            | Self::TodoUpdated { session_id, .. } => Some(session_id.as_str()),
            Self::SessionError { session_id, .. } => session_id.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "type", default)]
    pub part_type: String,
    #[serde(default)]
    pub text: Option<String>,
    /// Provider tool name for tool parts.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(rename = "callID", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub state: Option<ToolCallState>,
}

impl MessagePart {
    /// Priority: the explicit `callID`, then the part id.
    pub fn tool_call_id(&self) -> &str {
        self.call_id.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(default)]
    pub tokens: Option<TokenUsage>,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: Option<u64>,
    #[serde(default)]
    pub output: Option<u64>,
    #[serde(default)]
    pub cache: Option<CacheUsage>,
}

impl TokenUsage {
    pub fn cached(&self) -> Option<u64> {
        self.cache.as_ref().and_then(|cache| cache.read)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheUsage {
    #[serde(default)]
    pub read: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionStatusPayload {
    #[serde(rename = "type", default)]
    pub status_type: String,
}

impl SessionStatusPayload {
    pub fn is_idle(&self) -> bool {
        self.status_type == "idle"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionDiffEntry {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub additions: Option<u64>,
    #[serde(default)]
    pub deletions: Option<u64>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
}

impl SessionDiffEntry {
    /// Priority: `path`, then the older `file`.
    pub fn target(&self) -> Option<&str> {
        self.path.as_deref().or(self.file.as_deref())
    }
}

/// Typed error discriminator. The `name` field is authoritative; message
/// text is diagnostics only.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionErrorPayload {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub data: SessionErrorData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionErrorData {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "statusCode", default)]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionPayload {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOptionPayload>,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionOptionPayload {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TodoPayload {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_part_update() {
        let event = parse_sse_data(
            r#"{"type":"message.part.updated","properties":{"part":{"id":"prt-1","sessionID":"ses-1","type":"text","text":"Hi"}}}"#,
        )
        .expect("parse part update");
        match event {
            OpenCodeEvent::PartUpdated { part } => {
                assert_eq!(part.part_type, "text");
                assert_eq!(part.text.as_deref(), Some("Hi"));
                assert_eq!(part.tool_call_id(), "prt-1");
            }
            other => panic!("expected part update, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_id_prefers_call_id_over_part_id() {
        let event = parse_sse_data(
            r#"{"type":"message.part.updated","properties":{"part":{"id":"prt-1","sessionID":"ses-1","type":"tool","tool":"bash","callID":"call-9","state":{"status":"pending"}}}}"#,
        )
        .expect("parse tool part");
        match event {
            OpenCodeEvent::PartUpdated { part } => assert_eq!(part.tool_call_id(), "call-9"),
            other => panic!("expected part update, got {other:?}"),
        }
    }

    #[test]
    fn noise_event_families_are_ignored() {
        assert!(parse_sse_data("").is_none());
        assert!(parse_sse_data("not json").is_none());
        assert!(parse_sse_data(r#"{"type":"session.idle","properties":{}}"#).is_none());
        assert!(parse_sse_data(r#"{"type":"session.compacted","properties":{}}"#).is_none());
        assert!(parse_sse_data(
            r#"{"type":"permission.updated","properties":{"sessionID":"ses-1"}}"#
        )
        .is_none());
        assert!(parse_sse_data(r#"{"type":"file.watcher.updated","properties":{}}"#).is_none());
    }

    #[test]
    fn session_error_carries_typed_discriminator() {
        let event = parse_sse_data(
            r#"{"type":"session.error","properties":{"sessionID":"ses-1","error":{"name":"APIError","data":{"message":"no","statusCode":401}}}}"#,
        )
        .expect("parse session error");
        match event {
            OpenCodeEvent::SessionError { error, .. } => {
                assert_eq!(error.name, "APIError");
                assert_eq!(error.data.status_code, Some(401));
            }
            other => panic!("expected session error, got {other:?}"),
        }
    }

    #[test]
    fn diff_entry_target_prefers_path_over_file() {
        let entry = SessionDiffEntry {
            path: Some("src/a.rs".to_owned()),
            file: Some("b.rs".to_owned()),
            ..SessionDiffEntry::default()
        };
        assert_eq!(entry.target(), Some("src/a.rs"));
    }

    #[test]
    fn idle_status_is_detected() {
        let event = parse_sse_data(
            r#"{"type":"session.status","properties":{"sessionID":"ses-1","status":{"type":"idle"}}}"#,
        )
        .expect("parse status");
        match event {
            OpenCodeEvent::SessionStatus { status, .. } => assert!(status.is_idle()),
            other => panic!("expected status, got {other:?}"),
        }
    }
}
