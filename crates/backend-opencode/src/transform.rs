//! Stateful translation from native SSE events to canonical chunks.
//!
//! Same shape as the item/turn transformer: one explicit state struct, a
//! pure step function, no failures. The extra responsibilities here are
//! tool-name and file-path normalization, structured-diff synthesis for
//! file-writing tools, cross-turn diff-key deduplication, and the
//! question sub-protocol.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use bridge_protocol::{
    ChatChunk, ChatMetadata, FileDiffSummary, QuestionResult, TodoItem, TodoStatus, TurnSeed,
    UserQuestion, UserQuestionOption,
};
use serde_json::{json, Value};

use crate::diff::{diff_key, synthesize_diff};
use crate::event::{
    OpenCodeEvent, QuestionPayload, SessionDiffEntry, SessionErrorPayload, TodoPayload,
};
use crate::paths::normalize_project_path;

const REASONING_TOOL_NAME: &str = "Reasoning";
const QUESTION_TOOL_NAME: &str = "AskUserQuestion";

#[derive(Debug)]
pub struct OpenCodeTurnState {
    session_id: String,
    started: bool,
    finished: bool,
    started_at_epoch_ms: Option<u64>,
    current_text: Option<OpenTextBlock>,
    part_text: HashMap<String, String>,
    open_tools: HashMap<String, String>,
    open_reasoning: BTreeSet<String>,
    finalized_tools: HashSet<String>,
    /// Survives across turns via [`TurnSeed`]; without it, session-level
    /// diff summaries re-announce files already shown via their tool calls
    /// on every later turn of the chat.
    emitted_diff_keys: BTreeSet<String>,
    /// Ordered sub-question texts per request id; replies carry positional
    /// answer arrays only.
    pending_questions: BTreeMap<String, Vec<String>>,
    usage: ChatMetadata,
    next_text_block: u64,
}

#[derive(Debug, Clone)]
struct OpenTextBlock {
    chunk_id: String,
    part_id: String,
}

impl OpenCodeTurnState {
    pub fn new(session_id: impl Into<String>, seed: TurnSeed) -> Self {
        Self {
            session_id: session_id.into(),
            started: false,
            finished: false,
            started_at_epoch_ms: None,
            current_text: None,
            part_text: HashMap::new(),
            open_tools: HashMap::new(),
            open_reasoning: BTreeSet::new(),
            finalized_tools: HashSet::new(),
            emitted_diff_keys: seed.emitted_diff_keys,
            pending_questions: BTreeMap::new(),
            usage: ChatMetadata::default(),
            next_text_block: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Cross-turn state for the orchestrator to persist and re-supply.
    pub fn export_seed(&self) -> TurnSeed {
        TurnSeed {
            emitted_diff_keys: self.emitted_diff_keys.clone(),
        }
    }

    pub fn step(&mut self, event: &OpenCodeEvent) -> Vec<ChatChunk> {
        if self.finished {
            return Vec::new();
        }

        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match event {
            OpenCodeEvent::PartUpdated { part } => self.on_part(part, &mut out),
            OpenCodeEvent::MessageUpdated { info } => {
                if let Some(tokens) = info.tokens.as_ref() {
                    self.usage.input_tokens = tokens.input.or(self.usage.input_tokens);
                    self.usage.output_tokens = tokens.output.or(self.usage.output_tokens);
                    self.usage.cached_tokens = tokens.cached().or(self.usage.cached_tokens);
                }
                if let Some(cost) = info.cost {
                    self.usage.cost_usd = Some(cost);
                }
            }
            OpenCodeEvent::SessionStatus { status, .. } => {
                if status.is_idle() {
                    self.complete(&mut out);
                }
            }
            OpenCodeEvent::SessionDiff { diff, .. } => self.on_session_diff(diff, &mut out),
            OpenCodeEvent::SessionError { error, .. } => self.on_session_error(error, &mut out),
            OpenCodeEvent::QuestionAsked { id, questions, .. } => {
                self.on_question_asked(id, questions, &mut out)
            }
            OpenCodeEvent::QuestionReplied {
                request_id,
                answers,
                ..
            } => self.on_question_replied(request_id, answers, &mut out),
            OpenCodeEvent::QuestionRejected { request_id, .. } => {
                self.pending_questions.remove(request_id);
                out.push(ChatChunk::ToolOutputError {
                    tool_call_id: request_id.clone(),
                    error_text: "question rejected".to_owned(),
                });
            }
            OpenCodeEvent::TodoUpdated { todos, .. } => {
                out.push(ChatChunk::TodoUpdate {
                    todos: todos.iter().map(map_todo).collect(),
                });
            }
        }
        out
    }

    /// Terminal chunks for a turn cut short from outside.
    pub fn interrupt(&mut self, error_message: Option<&str>) -> Vec<ChatChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_stream_blocks(&mut out);
        if let Some(message) = error_message {
            out.push(ChatChunk::Error {
                message: message.to_owned(),
            });
        }
        out.push(ChatChunk::FinishStep);
        out.push(ChatChunk::Finish);
        self.finished = true;
        out
    }

    fn ensure_started(&mut self, out: &mut Vec<ChatChunk>) {
        if self.started {
            return;
        }
        self.started = true;
        self.started_at_epoch_ms = epoch_ms();
        out.push(ChatChunk::Start);
        out.push(ChatChunk::StartStep);
    }

    fn close_text(&mut self, out: &mut Vec<ChatChunk>) {
        if let Some(block) = self.current_text.take() {
            out.push(ChatChunk::TextEnd { id: block.chunk_id });
        }
    }

    /// Close the open text block, finalize streaming reasoning, and orphan
    /// pending questions. Shared by every terminal path.
    fn close_stream_blocks(&mut self, out: &mut Vec<ChatChunk>) {
        self.close_text(out);
        for part_id in std::mem::take(&mut self.open_reasoning) {
            self.open_tools.remove(&part_id);
            self.finalized_tools.insert(part_id.clone());
            out.push(ChatChunk::ToolInputAvailable {
                tool_call_id: part_id.clone(),
                tool_name: REASONING_TOOL_NAME.to_owned(),
                input: json!({
                    "text": self.part_text.get(&part_id).cloned().unwrap_or_default()
                }),
            });
            out.push(ChatChunk::ToolOutputAvailable {
                tool_call_id: part_id,
                output: json!({ "status": "completed" }),
            });
        }
        for request_id in std::mem::take(&mut self.pending_questions).into_keys() {
            out.push(ChatChunk::AskUserQuestionTimeout {
                tool_use_id: request_id,
            });
        }
    }

    fn on_part(&mut self, part: &crate::event::MessagePart, out: &mut Vec<ChatChunk>) {
        match part.part_type.as_str() {
            "text" => self.on_text_part(part, out),
            "reasoning" => self.on_reasoning_part(part, out),
            "tool" => self.on_tool_part(part, out),
            // Step framing is synthesized at turn boundaries; structural
            // part kinds carry nothing the chunk protocol surfaces.
            "step-start" | "step-finish" | "subtask" | "snapshot" | "patch" | "agent"
            | "retry" | "compaction" => {}
            other => {
                tracing::debug!(part_type = other, "ignoring unknown message part type");
            }
        }
    }

    fn on_text_part(&mut self, part: &crate::event::MessagePart, out: &mut Vec<ChatChunk>) {
        let open_for_part = self
            .current_text
            .as_ref()
            .map(|block| block.part_id == part.id)
            .unwrap_or(false);
        if !open_for_part {
            self.close_text(out);
            self.next_text_block += 1;
            let chunk_id = format!("text-{}", self.next_text_block);
            out.push(ChatChunk::TextStart {
                id: chunk_id.clone(),
            });
            self.current_text = Some(OpenTextBlock {
                chunk_id,
                part_id: part.id.clone(),
            });
            self.part_text.entry(part.id.clone()).or_default();
        }
        if let Some(new_text) = part.text.as_deref() {
            let delta = self.take_part_delta(&part.id, new_text);
            if !delta.is_empty() {
                if let Some(block) = self.current_text.as_ref() {
                    out.push(ChatChunk::TextDelta {
                        id: block.chunk_id.clone(),
                        delta,
                    });
                }
            }
        }
    }

    fn on_reasoning_part(&mut self, part: &crate::event::MessagePart, out: &mut Vec<ChatChunk>) {
        if self.finalized_tools.contains(&part.id) {
            return;
        }
        if !self.open_reasoning.contains(&part.id) {
            self.close_text(out);
            out.push(ChatChunk::ToolInputStart {
                tool_call_id: part.id.clone(),
                tool_name: REASONING_TOOL_NAME.to_owned(),
            });
            self.open_reasoning.insert(part.id.clone());
        }
        if let Some(new_text) = part.text.as_deref() {
            let delta = self.take_part_delta(&part.id, new_text);
            if !delta.is_empty() {
                out.push(ChatChunk::ToolInputDelta {
                    tool_call_id: part.id.clone(),
                    input_text_delta: delta,
                });
            }
        }
    }

    fn on_tool_part(&mut self, part: &crate::event::MessagePart, out: &mut Vec<ChatChunk>) {
        let call_id = part.tool_call_id().to_owned();
        if self.finalized_tools.contains(&call_id) {
            return;
        }
        let tool_name = normalize_tool_name(part.tool.as_deref().unwrap_or_default());
        if !self.open_tools.contains_key(&call_id) {
            self.close_text(out);
            out.push(ChatChunk::ToolInputStart {
                tool_call_id: call_id.clone(),
                tool_name: tool_name.clone(),
            });
            self.open_tools.insert(call_id.clone(), tool_name.clone());
        }

        let Some(state) = part.state.as_ref() else {
            return;
        };
        match state.status.as_str() {
            "pending" | "running" => {}
            "completed" => {
                self.open_tools.remove(&call_id);
                self.finalized_tools.insert(call_id.clone());
                out.push(ChatChunk::ToolInputAvailable {
                    tool_call_id: call_id.clone(),
                    tool_name: tool_name.clone(),
                    input: state.input.clone(),
                });
                let output = self.tool_output_payload(&tool_name, &state.input, &state.output);
                out.push(ChatChunk::ToolOutputAvailable {
                    tool_call_id: call_id,
                    output,
                });
            }
            "error" => {
                self.open_tools.remove(&call_id);
                self.finalized_tools.insert(call_id.clone());
                out.push(ChatChunk::ToolInputAvailable {
                    tool_call_id: call_id.clone(),
                    tool_name,
                    input: state.input.clone(),
                });
                out.push(ChatChunk::ToolOutputError {
                    tool_call_id: call_id,
                    error_text: state
                        .error
                        .clone()
                        .unwrap_or_else(|| "tool failed".to_owned()),
                });
            }
            other => {
                tracing::debug!(status = other, "ignoring unknown tool state");
            }
        }
    }

    /// Output payload for a completed tool. Write and Edit additionally get
    /// a synthesized unified diff, and their content transition is recorded
    /// so the later session-level summary does not re-announce it.
    fn tool_output_payload(
        &mut self,
        tool_name: &str,
        input: &Value,
        output: &Option<String>,
    ) -> Value {
        let mut payload = serde_json::Map::new();
        if let Some(output) = output {
            payload.insert("output".to_owned(), Value::String(output.clone()));
        }

        let transition = match tool_name {
            "Write" => input_str(input, "filePath").map(|path| {
                (
                    path,
                    String::new(),
                    input_str(input, "content").unwrap_or_default(),
                )
            }),
            "Edit" => input_str(input, "filePath").map(|path| {
                (
                    path,
                    input_str(input, "oldString").unwrap_or_default(),
                    input_str(input, "newString").unwrap_or_default(),
                )
            }),
            _ => None,
        };
        if let Some((path, before, after)) = transition {
            let normalized = normalize_project_path(&path);
            let diff = synthesize_diff(&before, &after);
            self.emitted_diff_keys
                .insert(diff_key(&self.session_id, &normalized, &before, &after));
            payload.insert(
                "diff".to_owned(),
                json!({
                    "path": normalized,
                    "unified": diff.unified,
                    "additions": diff.additions,
                    "deletions": diff.deletions,
                }),
            );
        }
        Value::Object(payload)
    }

    fn on_session_diff(&mut self, entries: &[SessionDiffEntry], out: &mut Vec<ChatChunk>) {
        let mut fresh = Vec::new();
        for entry in entries {
            let Some(target) = entry.target() else {
                continue;
            };
            let normalized = normalize_project_path(target);
            let before = entry.before.clone().unwrap_or_default();
            let after = entry.after.clone().unwrap_or_default();
            let key = diff_key(&self.session_id, &normalized, &before, &after);
            if !self.emitted_diff_keys.insert(key) {
                continue;
            }
            let synthesized = synthesize_diff(&before, &after);
            fresh.push(FileDiffSummary {
                path: normalized,
                additions: entry.additions.unwrap_or(synthesized.additions),
                deletions: entry.deletions.unwrap_or(synthesized.deletions),
                before: entry.before.clone(),
                after: entry.after.clone(),
            });
        }
        if !fresh.is_empty() {
            out.push(ChatChunk::SessionDiff { diffs: fresh });
        }
    }

    fn on_question_asked(
        &mut self,
        request_id: &str,
        questions: &[QuestionPayload],
        out: &mut Vec<ChatChunk>,
    ) {
        self.pending_questions.insert(
            request_id.to_owned(),
            questions
                .iter()
                .map(|question| question.question.clone())
                .collect(),
        );

        self.close_text(out);
        // Synthetic tool card so the UI renders the question inline; the
        // matching output arrives with the reply or rejection.
        out.push(ChatChunk::ToolInputStart {
            tool_call_id: request_id.to_owned(),
            tool_name: QUESTION_TOOL_NAME.to_owned(),
        });
        let mapped: Vec<UserQuestion> = questions.iter().map(map_question).collect();
        out.push(ChatChunk::ToolInputAvailable {
            tool_call_id: request_id.to_owned(),
            tool_name: QUESTION_TOOL_NAME.to_owned(),
            input: serde_json::to_value(&mapped).unwrap_or(Value::Null),
        });
        out.push(ChatChunk::AskUserQuestion {
            tool_use_id: request_id.to_owned(),
            questions: mapped,
        });
    }

    fn on_question_replied(
        &mut self,
        request_id: &str,
        answers: &[Vec<String>],
        out: &mut Vec<ChatChunk>,
    ) {
        // Question texts may be gone after a process restart; positional
        // fallback labels keep the reply renderable.
        let texts = self.pending_questions.remove(request_id).unwrap_or_default();
        let mut labeled = BTreeMap::new();
        for (index, answer) in answers.iter().enumerate() {
            let label = texts
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("Question {}", index + 1));
            labeled.insert(label, answer.join(", "));
        }
        let result = QuestionResult { answers: labeled };
        out.push(ChatChunk::ToolOutputAvailable {
            tool_call_id: request_id.to_owned(),
            output: serde_json::to_value(&result).unwrap_or(Value::Null),
        });
        out.push(ChatChunk::AskUserQuestionResult {
            tool_use_id: request_id.to_owned(),
            result,
        });
    }

    fn on_session_error(&mut self, error: &SessionErrorPayload, out: &mut Vec<ChatChunk>) {
        self.close_stream_blocks(out);
        out.push(classify_session_error(error));
        out.push(ChatChunk::FinishStep);
        out.push(ChatChunk::Finish);
        self.finished = true;
    }

    fn complete(&mut self, out: &mut Vec<ChatChunk>) {
        self.close_stream_blocks(out);
        out.push(ChatChunk::MessageMetadata {
            metadata: ChatMetadata {
                session_id: Some(self.session_id.clone()),
                duration_ms: self.turn_duration_ms(),
                ..self.usage.clone()
            },
        });
        out.push(ChatChunk::FinishStep);
        out.push(ChatChunk::Finish);
        self.finished = true;
    }

    fn take_part_delta(&mut self, part_id: &str, new_text: &str) -> String {
        let seen = self.part_text.entry(part_id.to_owned()).or_default();
        let delta = slice_past(seen, new_text).to_owned();
        if new_text.len() > seen.len() {
            *seen = new_text.to_owned();
        }
        delta
    }

    fn turn_duration_ms(&self) -> Option<u64> {
        let started = self.started_at_epoch_ms?;
        let now = epoch_ms()?;
        Some(now.saturating_sub(started))
    }
}

/// Provider tool names to canonical names; unknown names degrade to a
/// readable capitalization instead of an error.
pub fn normalize_tool_name(provider_name: &str) -> String {
    match provider_name {
        "shell" | "bash" => "Bash".to_owned(),
        "edit" | "file_edit" => "Edit".to_owned(),
        "write" | "file_write" => "Write".to_owned(),
        "read" | "file_read" => "Read".to_owned(),
        "grep" | "search" => "Grep".to_owned(),
        "glob" => "Glob".to_owned(),
        "list" | "ls" => "List".to_owned(),
        "webfetch" | "web_fetch" => "WebFetch".to_owned(),
        "websearch" | "web_search" => "WebSearch".to_owned(),
        "todowrite" | "todo_write" => "TodoWrite".to_owned(),
        "todoread" | "todo_read" => "TodoRead".to_owned(),
        "patch" | "apply_patch" => "ApplyPatch".to_owned(),
        "task" | "subtask" => "Task".to_owned(),
        "" => "Tool".to_owned(),
        other => capitalize_snake(other),
    }
}

/// Typed discriminator classification; substring matching is deliberately
/// absent here because this backend names its errors.
fn classify_session_error(error: &SessionErrorPayload) -> ChatChunk {
    let message = if error.data.message.is_empty() {
        error.name.clone()
    } else {
        error.data.message.clone()
    };
    match error.name.as_str() {
        "ProviderAuthError" => ChatChunk::AuthError { message },
        "APIError" => match error.data.status_code {
            Some(401) | Some(403) => ChatChunk::AuthError { message },
            _ => ChatChunk::Error { message },
        },
        "MessageAbortedError" => ChatChunk::Error {
            message: "turn aborted".to_owned(),
        },
        _ => ChatChunk::Error { message },
    }
}

fn map_question(payload: &QuestionPayload) -> UserQuestion {
    UserQuestion {
        question: payload.question.clone(),
        options: payload
            .options
            .iter()
            .map(|option| UserQuestionOption {
                label: option.label.clone(),
                description: option.description.clone(),
            })
            .collect(),
        multiple: payload.multiple,
    }
}

fn map_todo(payload: &TodoPayload) -> TodoItem {
    let status = match payload.status.as_str() {
        "in_progress" | "in-progress" => TodoStatus::InProgress,
        "completed" | "done" => TodoStatus::Completed,
        "cancelled" | "canceled" => TodoStatus::Cancelled,
        _ => TodoStatus::Pending,
    };
    TodoItem {
        content: payload.content.clone(),
        status,
    }
}

fn input_str(input: &Value, key: &str) -> Option<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn slice_past<'a>(seen: &str, new_text: &'a str) -> &'a str {
    if new_text.len() <= seen.len() {
        return "";
    }
    let mut boundary = seen.len();
    while boundary < new_text.len() && !new_text.is_char_boundary(boundary) {
        boundary += 1;
    }
    &new_text[boundary..]
}

fn epoch_ms() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_millis() as u64)
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
