//! WebSocket endpoints of the terminal protocol.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::{AttachError, Endpoint, MASTER_ACTIVE_REASON, SocketRoute, Terminals};
use crate::server::AppState;
use crate::sink::Outbound;
use crate::status::{ResponseMode, StatusEnvelope};

/// Fallback handler: serves every path shaped like a terminal socket.
pub async fn socket_handler(State(state): State<AppState>, request: Request) -> Response {
    let Some(route) = SocketRoute::parse(&state.base_path, request.uri().path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let (mut parts, _body) = request.into_parts();
    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let terminals = state.terminals.clone();
    let SocketRoute {
        context,
        endpoint,
        read_only,
    } = route;
    match endpoint {
        Endpoint::StatusUpdates => {
            ws.on_upgrade(move |socket| serve_status(socket, terminals, context))
        }
        Endpoint::Output(mode) => ws.on_upgrade(move |socket| {
            serve_terminal(socket, terminals, context, mode, read_only)
        }),
    }
}

async fn serve_terminal(
    socket: WebSocket,
    terminals: Terminals,
    context: String,
    mode: ResponseMode,
    read_only: bool,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let id = terminals.next_connection_id();

    let session = match terminals.attach(&context, id, mode, read_only, &tx) {
        Ok(session) => session,
        Err(e) => {
            let reason = match e {
                AttachError::MasterActive => MASTER_ACTIVE_REASON.to_string(),
                other => other.to_string(),
            };
            warn!(context = %context, connection = id, reason = %reason, "Connection rejected");
            let _ = ws_tx.send(to_message(Outbound::Close(reason))).await;
            return;
        }
    };

    // Sinks hold their own senders, so the stream ends when the session drops
    // them. Silent connections have no sink and keep theirs.
    let _silent_tx = (mode == ResponseMode::Silent).then_some(tx);
    let mut outbound = UnboundedReceiverStream::new(rx);

    loop {
        tokio::select! {
            frame = outbound.next() => {
                let Some(frame) = frame else {
                    debug!(context = %context, connection = id, "Session closed");
                    let _ = ws_tx.send(to_message(Outbound::Close("session closed".to_string()))).await;
                    break;
                };
                let closing = matches!(frame, Outbound::Close(_));
                if ws_tx.send(to_message(frame)).await.is_err() || closing {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) if !read_only => {
                        session.master_input(id, &data);
                    }
                    Some(Ok(Message::Text(text))) if !read_only => {
                        session.master_text(id, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(context = %context, connection = id, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    session.detach(id);
}

async fn serve_status(socket: WebSocket, terminals: Terminals, context: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let id = terminals.listen(&context, tx);
    let mut events = UnboundedReceiverStream::new(rx);

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&StatusEnvelope::from(event)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(context = %context, error = %e, "Failed to encode status event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    terminals.unlisten(&context, id);
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Binary(data) => Message::Binary(data),
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close(reason) => Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        })),
    }
}
