//! Shared protocol contract between agent backends and the UI-facing bridge.
//!
//! Backends translate their native event streams into the canonical chunk
//! vocabulary defined here. Consumers never see which backend produced a
//! chunk; the contract is also persisted with chat records, so variant names
//! and field shapes are stable.

pub mod chunk;
pub mod error;
pub mod ids;
pub mod provider;
pub mod session;

pub use chunk::{
    ChatChunk, ChatMetadata, FileDiffSummary, QuestionResult, TodoItem, TodoStatus, UserQuestion,
    UserQuestionOption,
};
pub use error::{BridgeError, BridgeResult};
pub use ids::{BackendSessionId, SubChatId};
pub use provider::{AgentProvider, ChunkStream, ChunkSubscription, ProviderKind};
pub use session::{ChatTurnRequest, TurnSeed};

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::chunk::ChatChunk;
    use crate::error::BridgeResult;
    use crate::ids::SubChatId;
    use crate::provider::{ChunkStream, ChunkSubscription};

    struct EmptyChunkSubscription;

    #[async_trait]
    impl ChunkSubscription for EmptyChunkSubscription {
        async fn next_chunk(&mut self) -> BridgeResult<Option<ChatChunk>> {
            Ok(None)
        }
    }

    #[test]
    fn sub_chat_id_round_trips_as_json_string() {
        let sub_chat_id = SubChatId::new("sub-1");
        let serialized = serde_json::to_string(&sub_chat_id).expect("serialize sub-chat id");
        let deserialized: SubChatId =
            serde_json::from_str(&serialized).expect("deserialize sub-chat id");

        assert_eq!(serialized, "\"sub-1\"");
        assert_eq!(deserialized, sub_chat_id);
    }

    #[test]
    fn chunk_stream_alias_accepts_trait_objects() {
        let _stream: ChunkStream = Box::new(EmptyChunkSubscription);
    }
}
