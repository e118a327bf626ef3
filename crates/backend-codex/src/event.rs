//! Native wire protocol of the item/turn backend.
//!
//! The CLI emits one JSON object per stdout line: lifecycle events framing a
//! turn (`thread.started` … `turn.completed`/`turn.failed`) with `item`
//! payloads that are started, updated and completed independently. Field
//! names drifted across CLI releases, so every fallback lives in an explicit
//! accessor with a documented priority order.

use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: CodexItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: CodexUsage,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: CodexErrorPayload },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Parse one stdout line. Unknown event types and malformed lines are
/// no-ops for the caller, never stream errors.
pub fn parse_event_line(line: &str) -> Option<CodexEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexErrorPayload {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub cached_tokens: Option<u64>,
    #[serde(default)]
    pub cached_input_tokens: Option<u64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}

impl CodexUsage {
    /// Priority: `cached_tokens`, then the older `cached_input_tokens`.
    pub fn cached(&self) -> Option<u64> {
        self.cached_tokens.or(self.cached_input_tokens)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodexItem {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub aggregated_output: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub old_string: Option<String>,
    #[serde(default)]
    pub new_string: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub changes: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Success(Value),
    Failure(String),
}

impl CodexItem {
    pub fn is_message(&self) -> bool {
        matches!(self.item_type.as_str(), "message" | "agent_message")
    }

    pub fn is_reasoning(&self) -> bool {
        self.item_type == "reasoning"
    }

    /// Command items stream their `command` field incrementally.
    pub fn is_command(&self) -> bool {
        matches!(self.item_type.as_str(), "command_execution" | "local_shell_call")
    }

    /// Priority: `path`, then the older `file_path`.
    pub fn file_target(&self) -> Option<&str> {
        self.path.as_deref().or(self.file_path.as_deref())
    }

    /// Canonical tool name for non-message items.
    pub fn tool_name(&self) -> String {
        match self.item_type.as_str() {
            "command_execution" | "local_shell_call" => "Bash".to_owned(),
            "file_edit" => "Edit".to_owned(),
            "file_read" => "Read".to_owned(),
            "file_write" => "Write".to_owned(),
            "apply_patch" => "ApplyPatch".to_owned(),
            "web_search" => "WebSearch".to_owned(),
            "file_tree" => "FileTree".to_owned(),
            "browser_action" => "Browser".to_owned(),
            "reasoning" => "Reasoning".to_owned(),
            other => capitalize_snake(other),
        }
    }

    /// Full tool input reconstructed from the completed item's fields.
    pub fn tool_input(&self) -> Value {
        match self.tool_name().as_str() {
            "Bash" => json!({ "command": self.command.clone().unwrap_or_default() }),
            "Edit" => json!({
                "file_path": self.file_target().unwrap_or_default(),
                "old_string": self.old_string.clone().unwrap_or_default(),
                "new_string": self.new_string.clone().unwrap_or_default(),
            }),
            "Write" => json!({
                "file_path": self.file_target().unwrap_or_default(),
                "content": self.content.clone().unwrap_or_default(),
            }),
            "Read" => json!({ "file_path": self.file_target().unwrap_or_default() }),
            "ApplyPatch" => {
                if let Some(changes) = self.changes.clone() {
                    json!({ "changes": changes })
                } else {
                    json!({ "patch": self.content.clone().unwrap_or_default() })
                }
            }
            "WebSearch" => json!({ "query": self.query.clone().unwrap_or_default() }),
            "Browser" => json!({ "url": self.url.clone().unwrap_or_default() }),
            "Reasoning" => json!({ "text": self.text.clone().unwrap_or_default() }),
            _ => {
                let mut input = serde_json::Map::new();
                if let Some(text) = &self.text {
                    input.insert("text".to_owned(), Value::String(text.clone()));
                }
                if let Some(command) = &self.command {
                    input.insert("command".to_owned(), Value::String(command.clone()));
                }
                if let Some(path) = self.file_target() {
                    input.insert("path".to_owned(), Value::String(path.to_owned()));
                }
                Value::Object(input)
            }
        }
    }

    /// Success markers, checked in priority order: an `error` string always
    /// loses, then `success: false`, then a failed `status`, then a nonzero
    /// `exit_code`. Anything else is a success.
    pub fn outcome(&self) -> ItemOutcome {
        if let Some(error) = self.error.as_deref() {
            if !error.trim().is_empty() {
                return ItemOutcome::Failure(error.to_owned());
            }
        }
        if self.success == Some(false) {
            return ItemOutcome::Failure("tool reported failure".to_owned());
        }
        if let Some(status) = self.status.as_deref() {
            if matches!(status, "failed" | "error") {
                return ItemOutcome::Failure(format!("tool status: {status}"));
            }
        }
        if let Some(code) = self.exit_code {
            if code != 0 {
                return ItemOutcome::Failure(format!("exit code {code}"));
            }
        }

        let mut output = serde_json::Map::new();
        if let Some(text) = self
            .aggregated_output
            .as_deref()
            .or(self.text.as_deref())
        {
            output.insert("output".to_owned(), Value::String(text.to_owned()));
        }
        if let Some(code) = self.exit_code {
            output.insert("exit_code".to_owned(), json!(code));
        }
        ItemOutcome::Success(Value::Object(output))
    }
}

fn capitalize_snake(raw: &str) -> String {
    raw.split('_')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
