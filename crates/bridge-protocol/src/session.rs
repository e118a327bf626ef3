use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ids::{BackendSessionId, SubChatId};

/// Cross-turn state a transformer exports at the end of a turn and must be
/// re-supplied on the next turn of the same chat. Without the diff-key
/// carry-over, session-level diff summaries re-announce files the UI has
/// already rendered from their tool calls.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TurnSeed {
    #[serde(default)]
    pub emitted_diff_keys: BTreeSet<String>,
}

/// One chat turn as requested by the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurnRequest {
    pub sub_chat_id: SubChatId,
    pub prompt: String,
    pub workdir: PathBuf,
    #[serde(default)]
    pub model: Option<String>,
    /// Backend session to resume; `None` starts a new backend session.
    #[serde(default)]
    pub session_id: Option<BackendSessionId>,
    #[serde(default)]
    pub env_overrides: Vec<(String, String)>,
    #[serde(default)]
    pub seed: TurnSeed,
}

impl ChatTurnRequest {
    pub fn new(sub_chat_id: SubChatId, prompt: impl Into<String>, workdir: PathBuf) -> Self {
        Self {
            sub_chat_id,
            prompt: prompt.into(),
            workdir,
            model: None,
            session_id: None,
            env_overrides: Vec::new(),
            seed: TurnSeed::default(),
        }
    }
}
