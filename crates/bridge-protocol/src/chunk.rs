use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical chunk vocabulary. One tagged variant per protocol event; the
/// set is closed and versioned through serde names, which are persisted as
/// part of message metadata for session resumption.
///
/// Stream invariants every producer guarantees:
/// - `Start` then `StartStep` exactly once, before anything else;
/// - at most one text block open at a time, each `TextStart` closed by one
///   `TextEnd` before the next block or the end of the stream;
/// - a tool call id passes through its input/output sequence at most once;
/// - `Finish` terminates every stream, success or failure, and nothing
///   follows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChatChunk {
    Start,
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolInputError {
        tool_call_id: String,
        tool_name: String,
        error_text: String,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
    },
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    MessageMetadata {
        metadata: ChatMetadata,
    },
    SessionDiff {
        diffs: Vec<FileDiffSummary>,
    },
    TodoUpdate {
        todos: Vec<TodoItem>,
    },
    AskUserQuestion {
        tool_use_id: String,
        questions: Vec<UserQuestion>,
    },
    AskUserQuestionResult {
        tool_use_id: String,
        result: QuestionResult,
    },
    AskUserQuestionTimeout {
        tool_use_id: String,
    },
    Error {
        message: String,
    },
    AuthError {
        message: String,
    },
    FinishStep,
    Finish,
}

impl ChatChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish)
    }
}

/// Turn-level accounting. May be emitted several times per turn; consumers
/// apply last-write-wins per field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// One file-level diff entry for the session side-channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDiffSummary {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<UserQuestionOption>,
    #[serde(default)]
    pub multiple: bool,
}

/// Answers reshaped into labeled records: question text to the joined
/// answer selection for that question.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuestionResult {
    pub answers: std::collections::BTreeMap<String, String>,
}
