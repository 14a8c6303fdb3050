use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use agentgraph_core::ipc::{AgentGraphRequest, AgentGraphResponse};

use crate::router;
use crate::state::AppState;

fn le_codec() -> LengthDelimitedCodec {
    // 4-byte little endian length prefix + MessagePack payload
    LengthDelimitedCodec::builder().little_endian().new_codec()
}

pub async fn run_unix_server(
    socket_path: &str,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    tracing::info!("IPC Server listening on {}", socket_path);

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, _) = res?;
                tokio::spawn(serve_connection(stream, state.clone()));
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down IPC server...");
                break;
            }
        }
    }

    if Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }

    Ok(())
}

/// Answer framed requests on one connection until the peer hangs up.
pub async fn serve_connection(stream: UnixStream, state: Arc<AppState>) {
    let (read, write) = stream.into_split();
    let mut framed_read = FramedRead::new(read, le_codec());
    let mut framed_write = FramedWrite::new(write, le_codec());

    while let Some(frame) = framed_read.next().await {
        let bytes_mut = match frame {
            Ok(bytes_mut) => bytes_mut,
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        };

        let response = match rmp_serde::from_slice::<AgentGraphRequest>(&bytes_mut) {
            Ok(request) => router::handle_request(request, &state).await,
            Err(e) => AgentGraphResponse::err(format!("Deserialization error: {}", e)),
        };

        match rmp_serde::to_vec_named(&response) {
            Ok(resp_bytes) => {
                if let Err(e) = framed_write.send(Bytes::from(resp_bytes)).await {
                    tracing::error!("Failed to send response: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize response: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgraph_core::{AgentGraphConfig, MemoryKvStore, SessionDirectoryAllocator};

    async fn roundtrip(
        framed_read: &mut FramedRead<tokio::net::unix::OwnedReadHalf, LengthDelimitedCodec>,
        framed_write: &mut FramedWrite<tokio::net::unix::OwnedWriteHalf, LengthDelimitedCodec>,
        request: &AgentGraphRequest,
    ) -> AgentGraphResponse {
        let payload = rmp_serde::to_vec_named(request).unwrap();
        framed_write.send(Bytes::from(payload)).await.unwrap();
        let frame = framed_read.next().await.unwrap().unwrap();
        rmp_serde::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_framed_requests_over_socket_pair() {
        let tmp = tempfile::tempdir().unwrap();
        let state = Arc::new(AppState::with_directories(
            AgentGraphConfig::default(),
            Arc::new(MemoryKvStore::new()),
            SessionDirectoryAllocator::new(tmp.path()),
        ));

        let (server, client) = UnixStream::pair().unwrap();
        tokio::spawn(serve_connection(server, state));

        let (read, write) = client.into_split();
        let mut framed_read = FramedRead::new(read, le_codec());
        let mut framed_write = FramedWrite::new(write, le_codec());

        let pong = roundtrip(&mut framed_read, &mut framed_write, &AgentGraphRequest::Ping).await;
        assert!(pong.is_ok());

        let created = roundtrip(
            &mut framed_read,
            &mut framed_write,
            &AgentGraphRequest::CreateSession {
                client_id: "10.0.0.1".to_string(),
            },
        )
        .await;
        assert!(created.is_ok(), "{:?}", created.error);

        // garbage frame yields an error response, the connection stays up
        framed_write.send(Bytes::from_static(b"\xc1")).await.unwrap();
        let frame = framed_read.next().await.unwrap().unwrap();
        let garbled: AgentGraphResponse = rmp_serde::from_slice(&frame).unwrap();
        assert!(!garbled.is_ok());

        let stats = roundtrip(&mut framed_read, &mut framed_write, &AgentGraphRequest::Stats).await;
        assert_eq!(stats.data.unwrap()["sessions"]["active_sessions"], 1);
    }
}
