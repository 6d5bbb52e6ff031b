use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use flare_proto::{CallRejection, GatewayCall, ParticipantId, RejectionCode, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::registry::{ConnectionHandle, Outbound};
use crate::AppState;

const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Envelope of a client frame. The call body is decoded separately so a bad
/// call can still be answered against its invocation id.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Invoke {
        invocation_id: u64,
        call: serde_json::Value,
    },
    Ping,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    token: String,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match state.gateway.access().identity.resolve(&query.token).await {
        Some(participant) => ws
            .on_upgrade(move |socket| handle_socket(socket, state, participant))
            .into_response(),
        None => {
            counter!("flare_gateway_handshakes_rejected_total", 1);
            warn!("rejected websocket upgrade with unknown token");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, participant: ParticipantId) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut rx) = ConnectionHandle::channel();
    let connection_id = handle.id();
    let mut connection = state.gateway.connect(participant, handle.clone());

    increment_gauge!("flare_gateway_active_connections", 1.0);
    info!(
        participant_id = %participant,
        connection_id = %connection_id,
        "gateway connection established"
    );

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Message(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, kind = message.kind(), "failed to encode message");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::POLICY,
                            reason: Cow::Borrowed(reason),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!(connection_id = %connection_id, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    participant_id = %participant,
                    connection_id = %connection_id,
                    error = %err,
                    "error receiving message"
                );
                break;
            }
        };

        match frame {
            Message::Text(text) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(InboundFrame::Invoke {
                    invocation_id,
                    call,
                }) => {
                    let call = match serde_json::from_value::<GatewayCall>(call) {
                        Ok(call) => call,
                        Err(err) => {
                            counter!("flare_gateway_invalid_frames_total", 1, "kind" => "call");
                            debug!(invocation_id, error = %err, "undecodable call");
                            handle.deliver(ServerMessage::Completion {
                                invocation_id,
                                result: Err(CallRejection::new(
                                    RejectionCode::BadRequest,
                                    format!("invalid call: {err}"),
                                )),
                            });
                            continue;
                        }
                    };
                    match connection.dispatch(call).await {
                        Ok(reply) => {
                            handle.deliver(ServerMessage::Completion {
                                invocation_id,
                                result: Ok(reply),
                            });
                        }
                        Err(err) => match err.rejection() {
                            Some(rejection) => {
                                debug!(invocation_id, error = %err, "call rejected");
                                handle.deliver(ServerMessage::Completion {
                                    invocation_id,
                                    result: Err(rejection),
                                });
                            }
                            None => {
                                warn!(
                                    participant_id = %participant,
                                    connection_id = %connection_id,
                                    error = %err,
                                    "aborting superseded connection"
                                );
                                handle.close("superseded");
                                break;
                            }
                        },
                    }
                }
                Ok(InboundFrame::Ping) => {
                    handle.deliver(ServerMessage::Pong);
                }
                Err(err) => {
                    counter!("flare_gateway_invalid_frames_total", 1, "kind" => "envelope");
                    handle.deliver(ServerMessage::Error {
                        message: format!("invalid message: {err}"),
                    });
                }
            },
            Message::Binary(_) => {
                counter!("flare_gateway_invalid_frames_total", 1, "kind" => "binary");
                handle.deliver(ServerMessage::Error {
                    message: "binary frames are not supported".into(),
                });
            }
            Message::Close(frame) => {
                info!(
                    participant_id = %participant,
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            _ => continue,
        }
    }

    connection.disconnected();
    drop(connection);
    drop(handle);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }

    decrement_gauge!("flare_gateway_active_connections", 1.0);
    info!(
        participant_id = %participant,
        connection_id = %connection_id,
        "gateway connection closed"
    );
}
