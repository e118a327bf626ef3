use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::ChatChunk;
use crate::error::{BridgeError, BridgeResult};
use crate::ids::SubChatId;
use crate::session::{ChatTurnRequest, TurnSeed};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    Codex,
    OpenCode,
    Other(String),
}

impl ProviderKind {
    /// Namespaced registry key, stable across persistence.
    pub fn as_key(&self) -> String {
        match self {
            Self::Codex => "backend.codex".to_owned(),
            Self::OpenCode => "backend.opencode".to_owned(),
            Self::Other(name) => format!("backend.{name}"),
        }
    }

    pub fn from_key(provider_key: &str) -> Option<Self> {
        match provider_key {
            "backend.codex" => Some(Self::Codex),
            "backend.opencode" => Some(Self::OpenCode),
            _ => provider_key
                .strip_prefix("backend.")
                .map(|name| Self::Other(name.to_owned())),
        }
    }
}

/// Pull side of one canonical chunk stream. `next_chunk` returning
/// `Ok(None)` means the stream is closed; the last chunk before that is
/// always `ChatChunk::Finish`.
#[async_trait]
pub trait ChunkSubscription: Send {
    async fn next_chunk(&mut self) -> BridgeResult<Option<ChatChunk>>;

    /// Cross-turn state exported by the finished turn. Meaningful once the
    /// stream has terminated; backends without cross-turn state keep the
    /// default.
    fn seed_export(&self) -> TurnSeed {
        TurnSeed::default()
    }
}

pub type ChunkStream = Box<dyn ChunkSubscription>;

#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Run one chat turn. The returned stream yields canonical chunks in
    /// transformer order and terminates with `Finish` on every path.
    async fn chat(&self, request: ChatTurnRequest) -> BridgeResult<ChunkStream>;

    /// Best-effort server-side abort for an in-flight sub-chat. The chunk
    /// stream still terminates with `Finish` on its own.
    async fn abort(&self, sub_chat_id: &SubChatId) -> BridgeResult<()>;

    /// Route a user's answers back to a pending question, keyed by the
    /// backend's request id. Positional answer arrays, one per sub-question.
    async fn reply_to_question(
        &self,
        sub_chat_id: &SubChatId,
        request_id: &str,
        answers: &[Vec<String>],
    ) -> BridgeResult<()> {
        let _ = (sub_chat_id, request_id, answers);
        Err(BridgeError::Protocol(
            "question replies are not supported by this backend".to_owned(),
        ))
    }
}
