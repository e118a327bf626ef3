//! Item/turn-style agent backend.
//!
//! Each chat turn spawns the agent CLI in JSON mode and reads one native
//! event per stdout line. Events feed [`transform::CodexTurnState`], and the
//! resulting canonical chunks are pushed to the subscriber over a channel.
//! Everything after a successful spawn surfaces as chunks, never as stream
//! errors, so the consumer always sees a terminal `finish`.

pub mod event;
pub mod transform;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_protocol::{
    AgentProvider, BridgeError, BridgeResult, ChatChunk, ChatTurnRequest, ChunkStream,
    ChunkSubscription, ProviderKind, SubChatId,
};
use bridge_resolver::BinaryResolver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::transform::CodexTurnState;

const PROVIDER_NAME: &str = "codex";
const CHUNK_BUFFER: usize = 256;
const ENV_LOG_RAW_EVENTS: &str = "BRIDGE_LOG_RAW_EVENTS";
const ENV_LOG_NORMALIZED_EVENTS: &str = "BRIDGE_LOG_NORMALIZED_EVENTS";

#[derive(Debug, Clone, Default)]
pub struct CodexBackendConfig {
    /// Arguments placed before the `exec` subcommand.
    pub base_args: Vec<String>,
}

pub struct CodexProvider {
    config: CodexBackendConfig,
    resolver: Arc<dyn BinaryResolver>,
    active: Arc<AsyncMutex<HashMap<SubChatId, CancellationToken>>>,
}

impl CodexProvider {
    pub fn new(config: CodexBackendConfig, resolver: Arc<dyn BinaryResolver>) -> Self {
        Self {
            config,
            resolver,
            active: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    fn turn_args(&self, request: &ChatTurnRequest) -> Vec<String> {
        let mut args = self.config.base_args.clone();
        args.push("exec".to_owned());
        args.push("--json".to_owned());
        if let Some(model) = request.model.as_deref() {
            args.push("--model".to_owned());
            args.push(model.to_owned());
        }
        if let Some(session_id) = request.session_id.as_ref() {
            args.push("resume".to_owned());
            args.push(session_id.as_str().to_owned());
        }
        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl AgentProvider for CodexProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    async fn chat(&self, request: ChatTurnRequest) -> BridgeResult<ChunkStream> {
        let resolved = self.resolver.resolve(PROVIDER_NAME)?;
        let env = self
            .resolver
            .build_env(PROVIDER_NAME, &request.env_overrides);

        let mut command = Command::new(&resolved.path);
        command.args(self.turn_args(&request));
        command.current_dir(&request.workdir);
        command.env_clear();
        command.envs(env);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                BridgeError::ExecutableNotFound(format!(
                    "{PROVIDER_NAME}: '{}'",
                    resolved.path.display()
                ))
            } else {
                BridgeError::ProcessCrash(format!(
                    "failed to launch {PROVIDER_NAME} '{}': {error}",
                    resolved.path.display()
                ))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::ProcessCrash(format!("{PROVIDER_NAME} stdout unavailable")))?;

        let cancel = CancellationToken::new();
        {
            let mut active = self.active.lock().await;
            if let Some(previous) = active.insert(request.sub_chat_id.clone(), cancel.clone()) {
                previous.cancel();
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
        let active = Arc::clone(&self.active);
        let sub_chat_id = request.sub_chat_id.clone();
        tokio::spawn(async move {
            run_turn_pump(child, stdout, cancel, chunk_tx, sub_chat_id.clone()).await;
            active.lock().await.remove(&sub_chat_id);
        });

        Ok(Box::new(CodexChunkSubscription { receiver: chunk_rx }))
    }

    async fn abort(&self, sub_chat_id: &SubChatId) -> BridgeResult<()> {
        let active = self.active.lock().await;
        match active.get(sub_chat_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => {
                tracing::debug!(
                    sub_chat_id = sub_chat_id.as_str(),
                    "abort requested for sub-chat with no in-flight turn"
                );
                Ok(())
            }
        }
    }
}

struct CodexChunkSubscription {
    receiver: mpsc::Receiver<ChatChunk>,
}

#[async_trait]
impl ChunkSubscription for CodexChunkSubscription {
    async fn next_chunk(&mut self) -> BridgeResult<Option<ChatChunk>> {
        Ok(self.receiver.recv().await)
    }
}

async fn run_turn_pump(
    mut child: tokio::process::Child,
    stdout: tokio::process::ChildStdout,
    cancel: CancellationToken,
    chunk_tx: mpsc::Sender<ChatChunk>,
    sub_chat_id: SubChatId,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut state = CodexTurnState::default();
    let log_raw = env_flag_enabled(ENV_LOG_RAW_EVENTS);

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                forward_chunks(&chunk_tx, state.interrupt(None), &sub_chat_id).await;
                break;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if log_raw {
                    tracing::debug!(
                        target: "bridge_backend_events",
                        backend = PROVIDER_NAME,
                        sub_chat_id = sub_chat_id.as_str(),
                        raw = line.as_str(),
                        "raw backend event"
                    );
                }
                let Some(event) = event::parse_event_line(&line) else {
                    continue;
                };
                if !forward_chunks(&chunk_tx, state.step(&event), &sub_chat_id).await {
                    let _ = child.start_kill();
                    break;
                }
                if state.is_finished() {
                    break;
                }
            }
            Ok(None) => {
                // Child closed stdout without turn framing.
                let status = child.wait().await;
                if !state.is_finished() {
                    let message = match status {
                        Ok(status) if status.success() => {
                            format!("{PROVIDER_NAME} exited before completing the turn")
                        }
                        Ok(status) => format!("{PROVIDER_NAME} exited with {status}"),
                        Err(error) => format!("{PROVIDER_NAME} exit status unavailable: {error}"),
                    };
                    forward_chunks(&chunk_tx, state.interrupt(Some(&message)), &sub_chat_id)
                        .await;
                }
                return;
            }
            Err(error) => {
                let _ = child.start_kill();
                let message = format!("{PROVIDER_NAME} stdout read failed: {error}");
                forward_chunks(&chunk_tx, state.interrupt(Some(&message)), &sub_chat_id).await;
                break;
            }
        }
    }

    let _ = child.wait().await;
}

/// Returns false when the subscriber went away.
async fn forward_chunks(
    chunk_tx: &mpsc::Sender<ChatChunk>,
    chunks: Vec<ChatChunk>,
    sub_chat_id: &SubChatId,
) -> bool {
    let log_normalized = env_flag_enabled(ENV_LOG_NORMALIZED_EVENTS);
    for chunk in chunks {
        if log_normalized {
            tracing::debug!(
                target: "bridge_backend_events",
                backend = PROVIDER_NAME,
                sub_chat_id = sub_chat_id.as_str(),
                chunk = ?chunk,
                "normalized chunk"
            );
        }
        if chunk_tx.send(chunk).await.is_err() {
            return false;
        }
    }
    true
}

fn env_flag_enabled(name: &str) -> bool {
    std::env::var(name)
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
        })
        .unwrap_or(false)
}
