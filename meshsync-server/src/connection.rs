//! Per-connection lifecycle: WebSocket upgrade, a decoupled send task fed
//! by a [`ChannelSocket`], and a receive loop that decodes frames and
//! dispatches them by topic.

use crate::metrics::ServerMetrics;
use crate::record::RecordHandler;
use crate::rpc::RpcHandler;
use crate::socket::{ChannelSocket, Socket};
use futures::{SinkExt, StreamExt};
use meshsync_core::{codec, Topic};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[tracing::instrument(skip(stream, record_handler, rpc_handler, metrics), fields(conn_id = conn_id))]
pub async fn handle_connection(
    stream: TcpStream,
    conn_id: u64,
    record_handler: Arc<RecordHandler>,
    rpc_handler: Arc<RpcHandler>,
    metrics: Option<Arc<ServerMetrics>>,
) -> meshsync_core::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| meshsync_core::Error::Io(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();
    let socket: Arc<dyn Socket> = ChannelSocket::new(conn_id, tx);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.to_string())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "connection read error");
                break;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            Message::Binary(b) => match String::from_utf8(b) {
                Ok(t) => t,
                Err(_) => continue,
            },
            _ => continue,
        };

        let frames = match codec::decode_all(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "dropping malformed frame buffer");
                continue;
            }
        };

        for frame in frames {
            if let Some(m) = &metrics {
                m.record_request(frame.action.as_str(), "dispatched", 0.0);
            }
            match frame.topic {
                Topic::Record => record_handler.dispatch(socket.clone(), &frame).await,
                Topic::Rpc => rpc_handler.dispatch(socket.clone(), &frame).await,
                Topic::ListenPatterns => {
                    // Listener registration shares the record topic's
                    // LISTEN/UNLISTEN/ACCEPT/REJECT actions; a frame
                    // addressed to this topic directly is not expected
                    // from well-behaved clients.
                    tracing::debug!(conn_id, "unexpected frame on listen-patterns topic");
                }
            }
        }
    }

    record_handler.remove_socket(conn_id);
    rpc_handler.remove_socket(conn_id);
    send_task.abort();
    Ok(())
}
