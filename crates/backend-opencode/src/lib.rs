//! SSE message-part-style agent backend.
//!
//! Talks to a locally-supervised HTTP agent server: sessions are created
//! over REST, prompts are sent non-blocking, and the turn is consumed from
//! the server's global SSE event stream filtered down to one session.
//! After the stream is up, every failure surfaces as chunks so the consumer
//! always sees a terminal `finish`.

pub mod diff;
pub mod event;
pub mod paths;
pub mod supervisor;
pub mod transform;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bridge_protocol::{
    AgentProvider, BridgeError, BridgeResult, ChatChunk, ChatTurnRequest, ChunkStream,
    ChunkSubscription, ProviderKind, SubChatId, TurnSeed,
};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::supervisor::ServerSupervisor;
use crate::transform::OpenCodeTurnState;

const PROVIDER_NAME: &str = "opencode";
const CHUNK_BUFFER: usize = 256;
const ENV_LOG_RAW_EVENTS: &str = "BRIDGE_LOG_RAW_EVENTS";
const ENV_LOG_NORMALIZED_EVENTS: &str = "BRIDGE_LOG_NORMALIZED_EVENTS";
const ERROR_BODY_MAX_LEN: usize = 240;

pub struct OpenCodeProvider {
    supervisor: Arc<ServerSupervisor>,
    client: reqwest::Client,
    active: Arc<AsyncMutex<HashMap<SubChatId, ActiveTurn>>>,
}

struct ActiveTurn {
    cancel: CancellationToken,
    backend_session_id: String,
}

impl OpenCodeProvider {
    pub fn new(supervisor: Arc<ServerSupervisor>) -> Self {
        Self {
            supervisor,
            client: reqwest::Client::new(),
            active: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    pub fn supervisor(&self) -> Arc<ServerSupervisor> {
        Arc::clone(&self.supervisor)
    }

    async fn create_session(&self, base_url: &str) -> BridgeResult<String> {
        let response = self
            .client
            .post(format!("{base_url}/session"))
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|error| {
                BridgeError::Network(format!("{PROVIDER_NAME} session create failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = sanitize_error_body(&response.text().await.unwrap_or_default());
            return Err(BridgeError::Session(format!(
                "{PROVIDER_NAME} session create failed with status {status}: {body}"
            )));
        }
        let body: serde_json::Value = response.json().await.map_err(|error| {
            BridgeError::Protocol(format!(
                "{PROVIDER_NAME} session create response parse failed: {error}"
            ))
        })?;
        body.get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                BridgeError::Protocol(format!(
                    "{PROVIDER_NAME} session create response has no id"
                ))
            })
    }

    async fn send_prompt(
        &self,
        base_url: &str,
        session_id: &str,
        request: &ChatTurnRequest,
    ) -> BridgeResult<()> {
        let mut body = serde_json::json!({
            "parts": [{ "type": "text", "text": request.prompt }],
            "directory": request.workdir.to_string_lossy(),
        });
        if let Some(model) = request.model.as_deref() {
            body["model"] = serde_json::Value::String(model.to_owned());
        }
        let response = self
            .client
            .post(format!("{base_url}/session/{session_id}/prompt"))
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                BridgeError::Network(format!("{PROVIDER_NAME} prompt send failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = sanitize_error_body(&response.text().await.unwrap_or_default());
            return Err(BridgeError::Session(format!(
                "{PROVIDER_NAME} prompt send failed with status {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl AgentProvider for OpenCodeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenCode
    }

    async fn chat(&self, request: ChatTurnRequest) -> BridgeResult<ChunkStream> {
        self.supervisor.ensure_running().await?;
        let base_url = self.supervisor.base_url();

        let session_id = match request.session_id.as_ref() {
            Some(existing) => existing.as_str().to_owned(),
            None => self.create_session(&base_url).await?,
        };

        // Subscribe before sending the prompt so no event is missed
        // between send and stream-open.
        let response = self
            .client
            .get(format!("{base_url}/event"))
            .send()
            .await
            .map_err(|error| {
                BridgeError::Network(format!(
                    "{PROVIDER_NAME} event stream connect failed: {error}"
                ))
            })?;
        if !response.status().is_success() {
            return Err(BridgeError::Network(format!(
                "{PROVIDER_NAME} event stream rejected with status {}",
                response.status()
            )));
        }
        let events = Box::pin(response.bytes_stream().eventsource());

        self.send_prompt(&base_url, &session_id, &request).await?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.insert(
                request.sub_chat_id.clone(),
                ActiveTurn {
                    cancel: cancel.clone(),
                    backend_session_id: session_id.clone(),
                },
            ) {
                previous.cancel.cancel();
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
        let seed_slot = Arc::new(StdMutex::new(TurnSeed::default()));
        let pump = TurnPump {
            client: self.client.clone(),
            base_url,
            session_id: session_id.clone(),
            state: OpenCodeTurnState::new(session_id, request.seed.clone()),
            cancel,
            chunk_tx,
            seed_slot: Arc::clone(&seed_slot),
        };
        let active = Arc::clone(&self.active);
        let sub_chat_id = request.sub_chat_id.clone();
        tokio::spawn(async move {
            pump.run(events).await;
            active.lock().await.remove(&sub_chat_id);
        });

        Ok(Box::new(OpenCodeChunkSubscription {
            receiver: chunk_rx,
            seed_slot,
        }))
    }

    async fn abort(&self, sub_chat_id: &SubChatId) -> BridgeResult<()> {
        let active = self.active.lock().await;
        let Some(turn) = active.get(sub_chat_id) else {
            tracing::debug!(
                sub_chat_id = sub_chat_id.as_str(),
                "abort requested for sub-chat with no in-flight turn"
            );
            return Ok(());
        };
        // Server-side abort is best-effort; cancelling the pump is what
        // guarantees the terminal finish.
        let abort_url = format!(
            "{}/session/{}/abort",
            self.supervisor.base_url(),
            turn.backend_session_id
        );
        let _ = self.client.post(abort_url).send().await;
        turn.cancel.cancel();
        Ok(())
    }

    async fn reply_to_question(
        &self,
        sub_chat_id: &SubChatId,
        request_id: &str,
        answers: &[Vec<String>],
    ) -> BridgeResult<()> {
        {
            let active = self.active.lock().await;
            if !active.contains_key(sub_chat_id) {
                return Err(BridgeError::Session(format!(
                    "no in-flight turn for sub-chat '{}'",
                    sub_chat_id.as_str()
                )));
            }
        }
        let response = self
            .client
            .post(format!(
                "{}/question/{request_id}/reply",
                self.supervisor.base_url()
            ))
            .json(&serde_json::json!({ "answers": answers }))
            .send()
            .await
            .map_err(|error| {
                BridgeError::Network(format!("{PROVIDER_NAME} question reply failed: {error}"))
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = sanitize_error_body(&response.text().await.unwrap_or_default());
            return Err(BridgeError::Session(format!(
                "{PROVIDER_NAME} question reply failed with status {status}: {body}"
            )));
        }
        Ok(())
    }
}

struct OpenCodeChunkSubscription {
    receiver: mpsc::Receiver<ChatChunk>,
    seed_slot: Arc<StdMutex<TurnSeed>>,
}

#[async_trait]
impl ChunkSubscription for OpenCodeChunkSubscription {
    async fn next_chunk(&mut self) -> BridgeResult<Option<ChatChunk>> {
        Ok(self.receiver.recv().await)
    }

    fn seed_export(&self) -> TurnSeed {
        self.seed_slot
            .lock()
            .map(|seed| seed.clone())
            .unwrap_or_default()
    }
}

struct TurnPump {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
    state: OpenCodeTurnState,
    cancel: CancellationToken,
    chunk_tx: mpsc::Sender<ChatChunk>,
    seed_slot: Arc<StdMutex<TurnSeed>>,
}

impl TurnPump {
    async fn run<S>(mut self, mut events: S)
    where
        S: futures_util::Stream<
                Item = Result<
                    eventsource_stream::Event,
                    eventsource_stream::EventStreamError<reqwest::Error>,
                >,
            > + Unpin,
    {
        let log_raw = env_flag_enabled(ENV_LOG_RAW_EVENTS);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let abort_url =
                        format!("{}/session/{}/abort", self.base_url, self.session_id);
                    let _ = self.client.post(abort_url).send().await;
                    let chunks = self.state.interrupt(None);
                    self.emit(chunks).await;
                    break;
                }
                next = events.next() => match next {
                    Some(Ok(event)) => {
                        if log_raw {
                            tracing::debug!(
                                target: "bridge_backend_events",
                                backend = PROVIDER_NAME,
                                session_id = self.session_id.as_str(),
                                raw = event.data.as_str(),
                                "raw backend event"
                            );
                        }
                        let Some(native) = event::parse_sse_data(&event.data) else {
                            continue;
                        };
                        if let Some(event_session) = native.session_id() {
                            if event_session != self.session_id {
                                continue;
                            }
                        }
                        let chunks = self.state.step(&native);
                        if !self.emit(chunks).await {
                            break;
                        }
                        if self.state.is_finished() {
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        let message = format!("{PROVIDER_NAME} event stream failed: {error}");
                        let chunks = self.state.interrupt(Some(&message));
                        self.emit(chunks).await;
                        break;
                    }
                    None => {
                        let chunks = self
                            .state
                            .interrupt(Some("event stream closed before turn completion"));
                        self.emit(chunks).await;
                        break;
                    }
                },
            }
        }
    }

    /// Returns false when the subscriber went away.
    async fn emit(&mut self, chunks: Vec<ChatChunk>) -> bool {
        // The seed must already be in the slot when the consumer receives
        // `finish`; a consumer that exports it on the terminal chunk would
        // otherwise race the pump and read an empty seed.
        if let Ok(mut seed) = self.seed_slot.lock() {
            *seed = self.state.export_seed();
        }
        let log_normalized = env_flag_enabled(ENV_LOG_NORMALIZED_EVENTS);
        for chunk in chunks {
            if log_normalized {
                tracing::debug!(
                    target: "bridge_backend_events",
                    backend = PROVIDER_NAME,
                    session_id = self.session_id.as_str(),
                    chunk = ?chunk,
                    "normalized chunk"
                );
            }
            if self.chunk_tx.send(chunk).await.is_err() {
                return false;
            }
        }
        true
    }
}

fn sanitize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= ERROR_BODY_MAX_LEN {
        return trimmed.to_owned();
    }
    let mut boundary = ERROR_BODY_MAX_LEN;
    while boundary > 0 && !trimmed.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}…", &trimmed[..boundary])
}

fn env_flag_enabled(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}
