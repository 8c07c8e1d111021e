use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Extension, Json,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;

use crate::control::ConnectionContext;
use crate::protocol::{EventSink, ServerEvent};
use crate::registry::ConnectionId;

use super::auth::PeerAddr;
use super::AppState;

/// Outbound events buffered per connection before emitters start waiting.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(super) async fn ws_control(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(peer): Extension<PeerAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_control_socket(socket, state, peer))
}

async fn handle_control_socket(socket: WebSocket, state: AppState, peer: PeerAddr) {
    // Register this connection for graceful shutdown tracking
    let (_guard, mut shutdown_rx) = state.shutdown.register();

    let id = ConnectionId::new();
    let (sink, mut events) = EventSink::channel(OUTBOUND_CAPACITY);
    let ctx = ConnectionContext::new(id, sink, state.registry.clone(), state.settings.clone());
    let (mut ws_tx, mut ws_rx) = socket.split();

    tracing::info!(conn = %id, %peer, "control connection opened");

    // Sole owner of the sending half; drains the per-connection queue.
    let mut writer = tokio::spawn(async move {
        if *shutdown_rx.borrow_and_update() {
            let _ = ws_tx.send(close_message()).await;
            return;
        }
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(conn = %id, event = event.name(), error = %e, "failed to encode event");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!(conn = %id, "control socket received shutdown signal, closing");
                        let _ = ws_tx.send(close_message()).await;
                        let _ = ws_tx.flush().await;
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => ctx.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        ctx.sink()
                            .emit(ServerEvent::Error {
                                message: "binary frames are not supported".to_string(),
                            })
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(conn = %id, error = %e, "control socket read failed");
                        break;
                    }
                }
            }

            _ = &mut writer => break,
        }
    }

    let report = ctx.cleanup();
    writer.abort();

    tracing::info!(
        conn = %id,
        %peer,
        terminated = report.terminated,
        failed = report.failed,
        "control connection closed"
    );
    // _guard is dropped here, decrementing active connection count
}

fn close_message() -> Message {
    Message::Close(Some(CloseFrame {
        code: axum::extract::ws::close_code::NORMAL,
        reason: "server shutting down".into(),
    }))
}
