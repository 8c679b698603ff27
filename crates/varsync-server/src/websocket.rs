use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use varsync_core::message::Batch;
use varsync_core::ConnectionId;
use varsync_engine::{Origin, Role};

use crate::handler;
use crate::server::AppState;
use crate::sessions::SessionEntry;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Client-chosen connection id; reusing it within the grace window
    /// resumes the previous connection.
    pub conn: Option<String>,
}

/// WebSocket upgrade for display clients at `/ws/{session}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session): Path<String>,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(entry) = state.manager.get(&session) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    let id = params
        .conn
        .filter(|c| !c.is_empty())
        .map(ConnectionId::from_raw)
        .unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(socket, state, entry, id))
}

/// Run one display connection until either side goes away, then park it.
async fn handle_socket(socket: WebSocket, state: AppState, entry: Arc<SessionEntry>, id: ConnectionId) {
    let hub = Arc::clone(state.manager.hub());
    let attached = hub.attach_duplex(&entry.wire_id, &id, Role::Display);
    info!(
        session_id = %entry.id,
        connection_id = %id,
        resumed = attached.resumed,
        "display client attached"
    );
    let epoch = attached.epoch;
    let mut rx: mpsc::Receiver<String> = attached.rx;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let heartbeat = state.config.heartbeat_interval();
    let writer_id = id.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    trace!(connection_id = %writer_id, "sent ping");
                }
            }
        }
    });

    let reader_entry = Arc::clone(&entry);
    let reader_hub = Arc::clone(&hub);
    let reader_id = id.clone();
    let max_wait = state.config.max_poll_wait();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    reader_hub.record_pong(&reader_entry.wire_id, &reader_id);
                    handle_text(&reader_entry, &reader_id, text.as_bytes(), max_wait).await;
                }
                WsMessage::Pong(_) => reader_hub.record_pong(&reader_entry.wire_id, &reader_id),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    if hub.park(&entry.wire_id, &id, epoch) {
        info!(session_id = %entry.id, connection_id = %id, "display client parked");
    }
}

async fn handle_text(entry: &SessionEntry, id: &ConnectionId, payload: &[u8], max_wait: std::time::Duration) {
    let origin = Origin::new(id.clone(), Role::Display);
    let batch = match Batch::parse(payload) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(connection_id = %id, error = %err, "unparseable display batch");
            let reported = entry
                .execute(move |state| {
                    state.push_error(&origin, None, &err);
                    state.flush_outbound();
                })
                .await;
            if let Err(e) = reported {
                debug!(connection_id = %id, error = %e, "could not report parse error");
            }
            return;
        }
    };
    let origin = origin.with_user_event(batch.user_event);
    if let Err(e) = handler::handle_batch(entry, origin, batch.messages, max_wait).await {
        warn!(session_id = %entry.id, connection_id = %id, error = %e, "display batch failed");
    }
}
