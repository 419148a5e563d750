//! WebSocket endpoint: handshake, per-connection pump, and dispatch into the
//! broker.
//!
//! A connection declares its role and context entirely through query
//! parameters on the `/ws` upgrade. Each accepted socket gets an unbounded
//! outbox drained by a writer task; the read half feeds parsed frames to the
//! broker until the peer goes away.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, Stream, StreamExt};
use porthole_proto::{ClientFrame, ConnectQuery, RelayFrame, Role};
use porthole_sealing::derive_user_id;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::{Outbound, Outbox};
use crate::AppState;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, state))
}

async fn handle_socket(socket: WebSocket, query: ConnectQuery, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (outbox, mut rx) = Outbox::channel();

    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(conn = %writer_conn, %err, "frame serialization failed");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        debug!(conn = %writer_conn, "writer task ended");
    });

    let user_id = query.user_secret.as_deref().map(derive_user_id);

    // Producers and viewers must name a session; the handshake cannot be
    // refused pre-upgrade, so a bad one is closed right here.
    let session_id = match (query.role, query.session_id.clone()) {
        (Role::Daemon, _) => None,
        (_, Some(session_id)) => Some(session_id),
        (_, None) => {
            warn!(conn = %conn_id, role = ?query.role, "handshake without sessionId");
            outbox.close();
            let _ = writer.await;
            return;
        }
    };

    match query.role {
        Role::Producer => {
            let session_id = session_id.expect("checked above");
            let encrypted = query.public_key.is_some();
            state
                .broker
                .bind_producer(
                    &session_id,
                    &conn_id,
                    outbox.clone(),
                    query.public_key.clone(),
                    encrypted,
                    user_id,
                    false,
                )
                .await;
            debug!(conn = %conn_id, session = %session_id, encrypted, "producer connected");

            while let Some(frame) = next_frame(&mut stream, &outbox).await {
                state.broker.producer_frame(&session_id, &conn_id, frame).await;
            }
            state.broker.unbind_producer(&session_id, &conn_id).await;
        }
        Role::Viewer => {
            let session_id = session_id.expect("checked above");
            let viewer_id = match state
                .broker
                .add_viewer(
                    &session_id,
                    outbox.clone(),
                    query.public_key.clone(),
                    query.nickname.clone(),
                )
                .await
            {
                Ok(viewer_id) => viewer_id,
                Err(reason) => {
                    warn!(conn = %conn_id, session = %session_id, ?reason, "viewer refused");
                    outbox.close();
                    let _ = writer.await;
                    return;
                }
            };

            while let Some(frame) = next_frame(&mut stream, &outbox).await {
                state
                    .broker
                    .viewer_frame(&session_id, &viewer_id, frame)
                    .await;
            }
            state.broker.remove_viewer(&session_id, &viewer_id).await;
        }
        Role::Daemon => {
            state
                .broker
                .register_daemon(&conn_id, user_id, outbox.clone())
                .await;
            while let Some(frame) = next_frame(&mut stream, &outbox).await {
                state.broker.daemon_frame(&conn_id, frame).await;
            }
            state.broker.remove_daemon(&conn_id).await;
        }
    }

    outbox.close();
    let _ = writer.await;
    debug!(conn = %conn_id, "connection closed");
}

/// Pull the next parseable frame off the socket. Malformed text earns the
/// sender a typed error; close and transport errors end the stream.
async fn next_frame(
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
    outbox: &Outbox,
) -> Option<ClientFrame> {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(%err, "websocket receive error");
                return None;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => return Some(frame),
                Err(err) => {
                    warn!(%err, "unparseable frame");
                    outbox.send(RelayFrame::Error {
                        message: format!("Invalid message format: {err}"),
                    });
                }
            },
            Message::Close(_) => return None,
            // Ping/pong are handled by the transport; binary is not part of
            // the protocol.
            _ => {}
        }
    }
    None
}
