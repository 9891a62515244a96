//! `GET /ws/{documentId}?token={bearer}`: the WebSocket endpoint from
//! spec.md \S6, implementing the \S4.3 admission sequence and then
//! pumping frames between the socket and the connection's `DocumentRoom`.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{info, instrument, warn};

use crate::codec::{self, ClientMessage, ServerMessage};
use crate::connection::Connection;
use crate::coordinator::{AdmissionError, Admitted, SessionCoordinator};

pub type SharedCoordinator = Arc<SessionCoordinator>;

#[derive(serde::Deserialize)]
pub struct ConnectQuery {
    token: Option<String>,
}

pub async fn upgrade(
    State(coordinator): State<SharedCoordinator>,
    Path(document_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let admission = coordinator.admit(&document_id, query.token.as_deref()).await;

    match admission {
        Ok(admitted) => ws
            .on_upgrade(move |socket| serve(socket, coordinator, document_id, admitted))
            .into_response(),
        Err(err) => {
            let code = err.close_code();
            let reason = err.reason();
            warn!(document_id, code, %reason, "websocket admission refused");
            ws.on_upgrade(move |socket| refuse(socket, code, reason))
                .into_response()
        }
    }
}

/// Closes the socket with the admission failure's close code before any
/// frame is exchanged, per spec.md \S4.3 step 3-4.
async fn refuse(mut socket: WebSocket, code: u16, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

#[instrument(level = "info", skip(socket, coordinator, admitted), fields(document_id = %document_id))]
async fn serve(socket: WebSocket, coordinator: SharedCoordinator, document_id: String, admitted: Admitted) {
    let Admitted { room, identity, site_id } = admitted;
    let (connection, outbound_rx) = Connection::new(document_id.clone(), identity, site_id);
    let connection_id = connection.id;

    let initial = match room.subscribe(connection).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(document_id, error = %e, "subscribe failed after admission");
            coordinator.release_connection_slot();
            let mut socket = socket;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4000,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let _ = sink.send(Message::Text(codec::encode_server_message(&initial))).await;

    let max_message_bytes = coordinator.config().max_message_bytes;
    let mut outbound_rx = outbound_rx;

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv_async() => {
                match outgoing {
                    Ok(message) => {
                        if sink.send(Message::Text(codec::encode_server_message(&message))).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !handle_client_frame(&room, connection_id, text.as_bytes(), max_message_bytes, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if !handle_client_frame(&room, connection_id, &bytes, max_message_bytes, &mut sink).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(document_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    room.unsubscribe(connection_id).await;
    coordinator.release_connection_slot();
    info!(document_id, "connection closed");
}

/// Decodes and dispatches one client frame. Returns `false` when the
/// connection should be torn down.
async fn handle_client_frame(
    room: &crate::room::RoomHandle,
    connection_id: crate::connection::ConnectionId,
    bytes: &[u8],
    max_message_bytes: usize,
    sink: &mut SplitSink<WebSocket, Message>,
) -> bool {
    let message = match codec::decode_client_message(bytes, max_message_bytes) {
        Ok(message) => message,
        Err(e) => {
            let err_msg = codec::encode_server_message(&ServerMessage::Error { message: e.to_string() });
            let _ = sink.send(Message::Text(err_msg)).await;
            return true;
        }
    };

    match message {
        ClientMessage::Operation { operation } => {
            if let crate::room::SubmitOutcome::Reject(reason) = room.submit(connection_id, operation).await {
                let err_msg = codec::encode_server_message(&ServerMessage::Error { message: reason });
                let _ = sink.send(Message::Text(err_msg)).await;
            }
            true
        }
        ClientMessage::Cursor { cursor } => {
            room.cursor(connection_id, cursor).await;
            true
        }
        ClientMessage::Presence { presence } => {
            room.presence(connection_id, presence).await;
            true
        }
        ClientMessage::Ping {} => {
            let pong = codec::encode_server_message(&ServerMessage::Pong {});
            let _ = sink.send(Message::Text(pong)).await;
            true
        }
        ClientMessage::RequestState {} => {
            if let Some(frame) = room.request_state(connection_id).await {
                let _ = sink.send(Message::Text(codec::encode_server_message(&frame))).await;
            }
            true
        }
    }
}
