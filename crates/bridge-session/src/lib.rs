//! Turn orchestration over agent providers.
//!
//! Holds the provider registry, the active-turn map keyed by sub-chat,
//! persisted cross-turn state (diff-key seeds, backend session ids), and
//! question routing. The orchestrator also hardens the chunk contract: the
//! stream handed to the UI layer ends with `finish` on every path,
//! including provider failures and streams that die mid-turn.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_protocol::{
    AgentProvider, BackendSessionId, BridgeError, BridgeResult, ChatChunk, ChatTurnRequest,
    ChunkStream, ChunkSubscription, SubChatId, TurnSeed,
};
use tokio::sync::Mutex as AsyncMutex;

pub struct SessionOrchestrator {
    providers: HashMap<String, Arc<dyn AgentProvider>>,
    active: Arc<AsyncMutex<HashMap<SubChatId, ActiveCall>>>,
    /// Cross-turn transformer state per sub-chat, persisted between turns.
    seeds: Arc<AsyncMutex<HashMap<SubChatId, TurnSeed>>>,
    /// Backend session per sub-chat, scraped from metadata chunks.
    sessions: Arc<AsyncMutex<HashMap<SubChatId, BackendSessionId>>>,
}

struct ActiveCall {
    provider: Arc<dyn AgentProvider>,
}

impl Default for SessionOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionOrchestrator {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            active: Arc::new(AsyncMutex::new(HashMap::new())),
            seeds: Arc::new(AsyncMutex::new(HashMap::new())),
            sessions: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn AgentProvider>) {
        self.providers.insert(provider.kind().as_key(), provider);
    }

    pub fn provider_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.providers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn active_turns(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Persisted backend session for a sub-chat, if any turn has reported
    /// one.
    pub async fn backend_session(&self, sub_chat_id: &SubChatId) -> Option<BackendSessionId> {
        self.sessions.lock().await.get(sub_chat_id).cloned()
    }

    /// Run one chat turn. Unknown provider keys are a caller error; every
    /// backend-side failure instead comes back as a chunk stream carrying
    /// one terminal `error`/`auth-error` before `finish`.
    pub async fn chat(
        &self,
        provider_key: &str,
        mut request: ChatTurnRequest,
    ) -> BridgeResult<ChunkStream> {
        let provider = self
            .providers
            .get(provider_key)
            .cloned()
            .ok_or_else(|| {
                BridgeError::Protocol(format!("unknown provider key '{provider_key}'"))
            })?;

        // Merge persisted cross-turn state into the request.
        {
            let seeds = self.seeds.lock().await;
            if let Some(stored) = seeds.get(&request.sub_chat_id) {
                request
                    .seed
                    .emitted_diff_keys
                    .extend(stored.emitted_diff_keys.iter().cloned());
            }
        }
        if request.session_id.is_none() {
            request.session_id = self
                .sessions
                .lock()
                .await
                .get(&request.sub_chat_id)
                .cloned();
        }

        let sub_chat_id = request.sub_chat_id.clone();
        self.active.lock().await.insert(
            sub_chat_id.clone(),
            ActiveCall {
                provider: Arc::clone(&provider),
            },
        );

        let inner = match provider.chat(request).await {
            Ok(stream) => stream,
            Err(error) => {
                self.active.lock().await.remove(&sub_chat_id);
                tracing::warn!(
                    sub_chat_id = sub_chat_id.as_str(),
                    error = %error,
                    "turn failed before streaming; surfacing as chunks"
                );
                return Ok(Box::new(FailedTurnStream::new(&error)));
            }
        };

        Ok(Box::new(OrchestratedStream {
            inner,
            sub_chat_id,
            active: Arc::clone(&self.active),
            seeds: Arc::clone(&self.seeds),
            sessions: Arc::clone(&self.sessions),
            queue: VecDeque::new(),
            scraped_session: None,
            done: false,
            cleaned: false,
        }))
    }

    /// Abort an in-flight turn. Unknown ids are a no-op; the chunk stream
    /// of a live turn still terminates with `finish` on its own.
    pub async fn cancel(&self, sub_chat_id: &SubChatId) -> BridgeResult<()> {
        let provider = {
            let active = self.active.lock().await;
            active
                .get(sub_chat_id)
                .map(|call| Arc::clone(&call.provider))
        };
        match provider {
            Some(provider) => provider.abort(sub_chat_id).await,
            None => Ok(()),
        }
    }

    /// Route a user's answers to a pending question on the turn's provider.
    pub async fn reply_to_question(
        &self,
        sub_chat_id: &SubChatId,
        request_id: &str,
        answers: &[Vec<String>],
    ) -> BridgeResult<()> {
        let provider = {
            let active = self.active.lock().await;
            active
                .get(sub_chat_id)
                .map(|call| Arc::clone(&call.provider))
        };
        match provider {
            Some(provider) => {
                provider
                    .reply_to_question(sub_chat_id, request_id, answers)
                    .await
            }
            None => Err(BridgeError::Session(format!(
                "no in-flight turn for sub-chat '{}'",
                sub_chat_id.as_str()
            ))),
        }
    }
}

/// Wrapper enforcing the terminal-finish contract and running registry
/// cleanup on every exit path.
struct OrchestratedStream {
    inner: ChunkStream,
    sub_chat_id: SubChatId,
    active: Arc<AsyncMutex<HashMap<SubChatId, ActiveCall>>>,
    seeds: Arc<AsyncMutex<HashMap<SubChatId, TurnSeed>>>,
    sessions: Arc<AsyncMutex<HashMap<SubChatId, BackendSessionId>>>,
    queue: VecDeque<ChatChunk>,
    scraped_session: Option<String>,
    done: bool,
    cleaned: bool,
}

impl OrchestratedStream {
    async fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.seeds
            .lock()
            .await
            .insert(self.sub_chat_id.clone(), self.inner.seed_export());
        if let Some(session) = self.scraped_session.take() {
            self.sessions
                .lock()
                .await
                .insert(self.sub_chat_id.clone(), BackendSessionId::new(session));
        }
        self.active.lock().await.remove(&self.sub_chat_id);
    }

    fn queue_failure(&mut self, error: &BridgeError) {
        self.queue.push_back(error_chunk(error));
        self.queue.push_back(ChatChunk::FinishStep);
        self.queue.push_back(ChatChunk::Finish);
    }
}

#[async_trait]
impl ChunkSubscription for OrchestratedStream {
    async fn next_chunk(&mut self) -> BridgeResult<Option<ChatChunk>> {
        loop {
            if let Some(chunk) = self.queue.pop_front() {
                if chunk.is_terminal() {
                    self.done = true;
                    self.cleanup().await;
                }
                return Ok(Some(chunk));
            }
            if self.done {
                self.cleanup().await;
                return Ok(None);
            }

            match self.inner.next_chunk().await {
                Ok(Some(chunk)) => {
                    if let ChatChunk::MessageMetadata { metadata } = &chunk {
                        if let Some(session) = metadata.session_id.clone() {
                            self.scraped_session = Some(session);
                        }
                    }
                    if chunk.is_terminal() {
                        self.done = true;
                        self.cleanup().await;
                    }
                    return Ok(Some(chunk));
                }
                Ok(None) => {
                    // Stream closed without finish framing.
                    self.done = true;
                    self.queue_failure(&BridgeError::ProcessCrash(
                        "chunk stream ended before finish".to_owned(),
                    ));
                }
                Err(error) => {
                    self.done = true;
                    self.queue_failure(&error);
                }
            }
        }
    }

    fn seed_export(&self) -> TurnSeed {
        self.inner.seed_export()
    }
}

impl Drop for OrchestratedStream {
    fn drop(&mut self) {
        if self.cleaned {
            return;
        }
        // Consumer dropped the stream mid-turn; the registry entry must
        // still go away.
        let active = Arc::clone(&self.active);
        let sub_chat_id = self.sub_chat_id.clone();
        tokio::spawn(async move {
            active.lock().await.remove(&sub_chat_id);
        });
    }
}

/// Minimal well-formed stream for a turn that failed before producing any
/// native events.
struct FailedTurnStream {
    queue: VecDeque<ChatChunk>,
}

impl FailedTurnStream {
    fn new(error: &BridgeError) -> Self {
        Self {
            queue: VecDeque::from(vec![
                ChatChunk::Start,
                ChatChunk::StartStep,
                error_chunk(error),
                ChatChunk::FinishStep,
                ChatChunk::Finish,
            ]),
        }
    }
}

#[async_trait]
impl ChunkSubscription for FailedTurnStream {
    async fn next_chunk(&mut self) -> BridgeResult<Option<ChatChunk>> {
        Ok(self.queue.pop_front())
    }
}

fn error_chunk(error: &BridgeError) -> ChatChunk {
    if error.is_auth() {
        ChatChunk::AuthError {
            message: error.to_string(),
        }
    } else {
        ChatChunk::Error {
            message: error.to_string(),
        }
    }
}
