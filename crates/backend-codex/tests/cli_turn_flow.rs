#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use backend_codex::{CodexBackendConfig, CodexProvider};
use bridge_protocol::{
    AgentProvider, BridgeResult, ChatChunk, ChatTurnRequest, ChunkStream, SubChatId,
};
use bridge_resolver::DefaultResolver;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn write_stub_cli(dir: &Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("codex");
    let script = format!("#!/bin/sh\n{body}\n");
    std::fs::write(&path, script).expect("write stub cli");
    let mut permissions = path.metadata().expect("stub metadata").permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions).expect("chmod stub cli");
    path
}

fn provider_for(dir: &Path) -> CodexProvider {
    CodexProvider::new(
        CodexBackendConfig::default(),
        Arc::new(DefaultResolver::new(vec![dir.to_path_buf()])),
    )
}

async fn collect_chunks(mut stream: ChunkStream) -> BridgeResult<Vec<ChatChunk>> {
    timeout(TEST_TIMEOUT, async {
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    })
    .await
    .expect("collect chunks timeout")
}

#[tokio::test]
async fn full_turn_streams_canonical_chunk_sequence() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_stub_cli(
        dir.path(),
        r#"cat <<'EOF'
{"type":"thread.started","thread_id":"thread-7"}
{"type":"item.started","item":{"id":"m1","type":"message","text":""}}
{"type":"item.updated","item":{"id":"m1","type":"message","text":"Hel"}}
{"type":"item.updated","item":{"id":"m1","type":"message","text":"Hello"}}
{"type":"item.completed","item":{"id":"m1","type":"message","text":"Hello"}}
{"type":"item.started","item":{"id":"c1","type":"command_execution"}}
{"type":"item.completed","item":{"id":"c1","type":"command_execution","command":"ls","aggregated_output":"Cargo.toml","exit_code":0}}
{"type":"turn.completed","usage":{"input_tokens":12,"output_tokens":4,"cached_tokens":2}}
EOF"#,
    );
    let provider = provider_for(dir.path());

    let request = ChatTurnRequest::new(
        SubChatId::new("sub-1"),
        "list files",
        dir.path().to_path_buf(),
    );
    let stream = provider.chat(request).await.expect("start turn");
    let chunks = collect_chunks(stream).await.expect("stream chunks");

    assert!(matches!(chunks.first(), Some(ChatChunk::Start)));
    assert!(matches!(chunks.get(1), Some(ChatChunk::StartStep)));
    assert!(matches!(chunks.last(), Some(ChatChunk::Finish)));

    let text: String = chunks
        .iter()
        .filter_map(|chunk| match chunk {
            ChatChunk::TextDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello");

    assert!(chunks.iter().any(|chunk| matches!(
        chunk,
        ChatChunk::ToolInputStart { tool_name, .. } if tool_name == "Bash"
    )));
    assert!(chunks
        .iter()
        .any(|chunk| matches!(chunk, ChatChunk::ToolOutputAvailable { .. })));

    let metadata = chunks
        .iter()
        .find_map(|chunk| match chunk {
            ChatChunk::MessageMetadata { metadata } => Some(metadata.clone()),
            _ => None,
        })
        .expect("metadata chunk");
    assert_eq!(metadata.session_id.as_deref(), Some("thread-7"));
    assert_eq!(metadata.input_tokens, Some(12));
    assert_eq!(metadata.cached_tokens, Some(2));
}

#[tokio::test]
async fn premature_exit_surfaces_error_chunk_and_still_finishes() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_stub_cli(
        dir.path(),
        r#"echo '{"type":"item.started","item":{"id":"m1","type":"message"}}'
echo '{"type":"item.updated","item":{"id":"m1","type":"message","text":"partial"}}'
exit 3"#,
    );
    let provider = provider_for(dir.path());

    let request = ChatTurnRequest::new(SubChatId::new("sub-2"), "go", dir.path().to_path_buf());
    let stream = provider.chat(request).await.expect("start turn");
    let chunks = collect_chunks(stream).await.expect("stream chunks");

    assert!(chunks
        .iter()
        .any(|chunk| matches!(chunk, ChatChunk::Error { .. })));
    assert!(chunks
        .iter()
        .any(|chunk| matches!(chunk, ChatChunk::TextEnd { .. })));
    assert!(matches!(chunks.last(), Some(ChatChunk::Finish)));
}

#[tokio::test]
async fn auth_failure_from_backend_maps_to_auth_error_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_stub_cli(
        dir.path(),
        r#"echo '{"type":"turn.failed","error":{"message":"401 unauthorized: api key missing"}}'"#,
    );
    let provider = provider_for(dir.path());

    let request = ChatTurnRequest::new(SubChatId::new("sub-3"), "go", dir.path().to_path_buf());
    let stream = provider.chat(request).await.expect("start turn");
    let chunks = collect_chunks(stream).await.expect("stream chunks");

    assert!(chunks
        .iter()
        .any(|chunk| matches!(chunk, ChatChunk::AuthError { .. })));
    assert!(!chunks
        .iter()
        .any(|chunk| matches!(chunk, ChatChunk::Error { .. })));
    assert!(matches!(chunks.last(), Some(ChatChunk::Finish)));
}

#[tokio::test]
async fn abort_interrupts_a_hanging_turn_with_clean_finish() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_stub_cli(
        dir.path(),
        r#"echo '{"type":"item.started","item":{"id":"m1","type":"message"}}'
echo '{"type":"item.updated","item":{"id":"m1","type":"message","text":"working"}}'
sleep 30"#,
    );
    let provider = provider_for(dir.path());

    let sub_chat_id = SubChatId::new("sub-4");
    let request = ChatTurnRequest::new(sub_chat_id.clone(), "go", dir.path().to_path_buf());
    let mut stream = provider.chat(request).await.expect("start turn");

    // Drain until the first delta so the turn is known in flight.
    loop {
        let chunk = timeout(TEST_TIMEOUT, stream.next_chunk())
            .await
            .expect("chunk timeout")
            .expect("chunk")
            .expect("stream open");
        if matches!(chunk, ChatChunk::TextDelta { .. }) {
            break;
        }
    }

    provider.abort(&sub_chat_id).await.expect("abort turn");

    let mut rest = Vec::new();
    while let Some(chunk) = timeout(TEST_TIMEOUT, stream.next_chunk())
        .await
        .expect("chunk timeout")
        .expect("chunk")
    {
        rest.push(chunk);
    }
    assert!(rest
        .iter()
        .any(|chunk| matches!(chunk, ChatChunk::TextEnd { .. })));
    assert!(matches!(rest.last(), Some(ChatChunk::Finish)));
}

#[tokio::test]
async fn missing_binary_is_a_typed_error_before_any_chunk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let provider = provider_for(dir.path());

    let request = ChatTurnRequest::new(SubChatId::new("sub-5"), "go", dir.path().to_path_buf());
    let error = match provider.chat(request).await {
        Ok(_) => panic!("no binary"),
        Err(error) => error,
    };
    assert!(matches!(
        error,
        bridge_protocol::BridgeError::ExecutableNotFound(_)
    ));
}
