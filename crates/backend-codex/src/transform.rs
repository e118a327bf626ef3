//! Stateful translation from native item/turn events to canonical chunks.
//!
//! The transformer is a pure step function over one explicit state struct so
//! a turn can be unit-tested, snapshotted, and resumed without closures.
//! It never fails: malformed or out-of-order native events degrade to
//! no-ops, because one bad event must not abort a healthy stream.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use bridge_protocol::{ChatChunk, ChatMetadata};
use serde::{Deserialize, Serialize};

use crate::event::{CodexEvent, CodexItem, CodexUsage, ItemOutcome};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodexTurnState {
    started: bool,
    finished: bool,
    started_at_epoch_ms: Option<u64>,
    session_id: Option<String>,
    current_text: Option<OpenTextBlock>,
    /// Accumulated text per item id, for cumulative-resend defense.
    item_text: HashMap<String, String>,
    /// Open (started but not finalized) tool items: item id to tool name.
    open_tools: HashMap<String, String>,
    /// Tool item ids whose input/output already went out. Duplicate
    /// `item.completed` events for these ids are dropped.
    finalized_tools: HashSet<String>,
    next_text_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenTextBlock {
    chunk_id: String,
    item_id: String,
}

impl CodexTurnState {
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translate one native event into zero or more canonical chunks.
    pub fn step(&mut self, event: &CodexEvent) -> Vec<ChatChunk> {
        if self.finished {
            return Vec::new();
        }

        let mut out = Vec::new();
        self.ensure_started(&mut out);

        match event {
            CodexEvent::ThreadStarted { thread_id } => {
                self.session_id = Some(thread_id.clone());
            }
            CodexEvent::ItemStarted { item } => self.on_item_started(item, &mut out),
            CodexEvent::ItemUpdated { item } => self.on_item_updated(item, &mut out),
            CodexEvent::ItemCompleted { item } => self.on_item_completed(item, &mut out),
            CodexEvent::TurnCompleted { usage } => self.on_turn_completed(usage, &mut out),
            CodexEvent::TurnFailed { error } => self.fail(&error.message, &mut out),
            CodexEvent::Error { message } => self.fail(message, &mut out),
        }
        out
    }

    /// Terminal chunks for a turn cut short from outside (cancellation,
    /// stream I/O failure, child exit without turn framing).
    pub fn interrupt(&mut self, error_message: Option<&str>) -> Vec<ChatChunk> {
        if self.finished {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_text(&mut out);
        if let Some(message) = error_message {
            out.push(classify_error_message(message));
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

    fn open_text(&mut self, item_id: &str, out: &mut Vec<ChatChunk>) {
        self.close_text(out);
        self.next_text_block += 1;
        let chunk_id = format!("text-{}", self.next_text_block);
        out.push(ChatChunk::TextStart {
            id: chunk_id.clone(),
        });
        self.current_text = Some(OpenTextBlock {
            chunk_id,
            item_id: item_id.to_owned(),
        });
        self.item_text.entry(item_id.to_owned()).or_default();
    }

    fn open_tool(&mut self, item: &CodexItem, out: &mut Vec<ChatChunk>) {
        if self.open_tools.contains_key(&item.id) || self.finalized_tools.contains(&item.id) {
            return;
        }
        self.close_text(out);
        let tool_name = item.tool_name();
        out.push(ChatChunk::ToolInputStart {
            tool_call_id: item.id.clone(),
            tool_name: tool_name.clone(),
        });
        self.open_tools.insert(item.id.clone(), tool_name);
    }

    fn on_item_started(&mut self, item: &CodexItem, out: &mut Vec<ChatChunk>) {
        if item.is_message() {
            self.open_text(&item.id, out);
        } else {
            self.open_tool(item, out);
        }
    }

    fn on_item_updated(&mut self, item: &CodexItem, out: &mut Vec<ChatChunk>) {
        if item.is_message() {
            let open_for_item = self
                .current_text
                .as_ref()
                .map(|block| block.item_id == item.id)
                .unwrap_or(false);
            if !open_for_item {
                self.open_text(&item.id, out);
            }
            if let Some(new_text) = item.text.as_deref() {
                let delta = self.take_text_delta(&item.id, new_text);
                if !delta.is_empty() {
                    if let Some(block) = self.current_text.as_ref() {
                        out.push(ChatChunk::TextDelta {
                            id: block.chunk_id.clone(),
                            delta,
                        });
                    }
                }
            }
        } else if item.is_reasoning() {
            self.open_tool(item, out);
            if self.finalized_tools.contains(&item.id) {
                return;
            }
            if let Some(new_text) = item.text.as_deref() {
                let delta = self.take_text_delta(&item.id, new_text);
                if !delta.is_empty() {
                    out.push(ChatChunk::ToolInputDelta {
                        tool_call_id: item.id.clone(),
                        input_text_delta: delta,
                    });
                }
            }
        } else if item.is_command() {
            self.open_tool(item, out);
            if self.finalized_tools.contains(&item.id) {
                return;
            }
            // The command field is already incremental, forward verbatim.
            if let Some(command) = item.command.as_deref() {
                if !command.is_empty() {
                    out.push(ChatChunk::ToolInputDelta {
                        tool_call_id: item.id.clone(),
                        input_text_delta: command.to_owned(),
                    });
                }
            }
        }
        // Other tool kinds deliver their input only at completion.
    }

    fn on_item_completed(&mut self, item: &CodexItem, out: &mut Vec<ChatChunk>) {
        if item.is_message() {
            let full_text = item.text.clone().unwrap_or_default();
            if !self.item_text.contains_key(&item.id) {
                // Completed without a preceding started: synthesize the
                // whole block from the final text.
                self.open_text(&item.id, out);
                if !full_text.is_empty() {
                    if let Some(block) = self.current_text.as_ref() {
                        out.push(ChatChunk::TextDelta {
                            id: block.chunk_id.clone(),
                            delta: full_text.clone(),
                        });
                    }
                }
                self.item_text.insert(item.id.clone(), full_text);
                self.close_text(out);
                return;
            }

            let delta = self.take_text_delta(&item.id, &full_text);
            let open_for_item = self
                .current_text
                .as_ref()
                .map(|block| block.item_id == item.id)
                .unwrap_or(false);
            if open_for_item {
                if !delta.is_empty() {
                    if let Some(block) = self.current_text.as_ref() {
                        out.push(ChatChunk::TextDelta {
                            id: block.chunk_id.clone(),
                            delta,
                        });
                    }
                }
                self.close_text(out);
            }
            return;
        }

        if self.finalized_tools.contains(&item.id) {
            return;
        }
        self.open_tool(item, out);
        self.open_tools.remove(&item.id);
        self.finalized_tools.insert(item.id.clone());

        if item.is_reasoning() {
            if let Some(new_text) = item.text.as_deref() {
                let delta = self.take_text_delta(&item.id, new_text);
                if !delta.is_empty() {
                    out.push(ChatChunk::ToolInputDelta {
                        tool_call_id: item.id.clone(),
                        input_text_delta: delta,
                    });
                }
            }
            out.push(ChatChunk::ToolInputAvailable {
                tool_call_id: item.id.clone(),
                tool_name: item.tool_name(),
                input: item.tool_input(),
            });
            out.push(ChatChunk::ToolOutputAvailable {
                tool_call_id: item.id.clone(),
                output: serde_json::json!({ "status": "completed" }),
            });
            return;
        }

        out.push(ChatChunk::ToolInputAvailable {
            tool_call_id: item.id.clone(),
            tool_name: item.tool_name(),
            input: item.tool_input(),
        });
        match item.outcome() {
            ItemOutcome::Success(output) => out.push(ChatChunk::ToolOutputAvailable {
                tool_call_id: item.id.clone(),
                output,
            }),
            ItemOutcome::Failure(error_text) => out.push(ChatChunk::ToolOutputError {
                tool_call_id: item.id.clone(),
                error_text,
            }),
        }
    }

    fn on_turn_completed(&mut self, usage: &CodexUsage, out: &mut Vec<ChatChunk>) {
        self.close_text(out);
        out.push(ChatChunk::MessageMetadata {
            metadata: ChatMetadata {
                session_id: self.session_id.clone(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cached_tokens: usage.cached(),
                cost_usd: usage.total_cost_usd,
                duration_ms: self.turn_duration_ms(),
            },
        });
        out.push(ChatChunk::FinishStep);
        out.push(ChatChunk::Finish);
        self.finished = true;
    }

    fn fail(&mut self, message: &str, out: &mut Vec<ChatChunk>) {
        self.close_text(out);
        out.push(classify_error_message(message));
        out.push(ChatChunk::FinishStep);
        out.push(ChatChunk::Finish);
        self.finished = true;
    }

    /// Cumulative-resend defense: the backend may resend the whole text so
    /// far instead of a true delta. Emit only the part past what was
    /// already seen; a shorter resend yields nothing.
    fn take_text_delta(&mut self, item_id: &str, new_text: &str) -> String {
        let seen = self.item_text.entry(item_id.to_owned()).or_default();
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

/// Legacy substring classification, kept only for this backend because its
/// native protocol carries bare message strings. Typed discriminators are
/// preferred wherever the backend provides them; do not extend this list.
fn classify_error_message(message: &str) -> ChatChunk {
    let normalized = message.to_ascii_lowercase();
    let auth = ["authentication", "unauthorized", "api_key", "api key", "401"]
        .iter()
        .any(|marker| normalized.contains(marker));
    if auth {
        ChatChunk::AuthError {
            message: message.to_owned(),
        }
    } else {
        ChatChunk::Error {
            message: message.to_owned(),
        }
    }
}
