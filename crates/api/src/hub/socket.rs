//! WebSocket transport for the hub: negotiation endpoint plus the
//! long-lived connection handler. Each connection is served by an
//! independent task pair (reader and writer); clients join and leave groups
//! with small JSON control frames:
//!
//! ```json
//! {"action": "join", "group": "dashboard"}
//! {"action": "leave", "group": "events:high"}
//! ```

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ControlFrame {
    action: String,
    group: String,
}

/// `POST /hubs/scan-progress/negotiate`: handshake before the socket is
/// opened. Authentication happened upstream; the principal (when present)
/// rides a header.
pub async fn negotiate(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "connectionId": Uuid::new_v4().to_string(),
        "availableTransports": ["WebSockets"],
        "connectedClients": state.hub.connection_count(),
    }))
}

/// `GET /hubs/scan-progress`: the long-lived connection.
pub async fn hub_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let principal = headers
        .get("x-principal")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    ws.on_upgrade(move |socket| serve_connection(socket, state, principal))
}

async fn serve_connection(socket: WebSocket, state: AppState, principal: Option<String>) {
    let (id, mut outbound) = state.hub.register(principal);
    let (mut sink, mut stream) = socket.split();

    // Writer: drains the hub's bounded per-connection queue.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if sink.send(Message::Text(message)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Reader: control frames until the client disconnects.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(frame) => match frame.action.as_str() {
                    "join" => state.hub.join(id, &frame.group),
                    "leave" => state.hub.leave(id, &frame.group),
                    other => debug!(connection_id = %id, action = other, "unknown hub action"),
                },
                Err(e) => debug!(connection_id = %id, error = %e, "bad control frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.unregister(id);
    writer.abort();
}
