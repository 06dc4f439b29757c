use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{Query, State, WebSocketUpgrade, ws::{Message as WsMessage, WebSocket}},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::gateway::GatewayError;
use crate::gateway::dispatch::Dispatcher;
use crate::gateway::event::ClientEvent;
use crate::identity::{Identity, IdentityVerifier};

#[derive(Deserialize)]
pub(crate) struct HandshakeQuery {
    token: Option<String>,
}

/// The connection handshake. The credential is verified before the
/// upgrade is accepted, so a refused connection never touches the
/// registry and never processes an application event.
#[debug_handler(state = crate::AppState)]
pub(crate) async fn gateway_ws(
    Query(HandshakeQuery { token }): Query<HandshakeQuery>,
    State(verifier): State<Arc<dyn IdentityVerifier>>,
    State(dispatcher): State<Arc<Dispatcher>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        warn!("connection rejected: no token provided");
        return unauthorized();
    };

    let identity = match verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!("connection rejected: {err}");
            return unauthorized();
        }
    };

    info!("socket authenticated: {}", identity.username);
    ws.on_upgrade(move |socket| client_session(socket, identity, dispatcher))
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, GatewayError::Unauthorized.to_string()).into_response()
}

async fn client_session(socket: WebSocket, identity: Identity, dispatcher: Arc<Dispatcher>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let conn = dispatcher.registry().register(identity.clone(), tx).await;
    info!("user connected: {} ({conn})", identity.username);

    // The registry owns the only sender; once unregister drops it the
    // writer drains whatever is queued and exits on its own.
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(frame)) = stream.next().await {
        let Ok(event) = serde_json::from_slice::<ClientEvent>(&frame.into_data()) else {
            continue;
        };
        dispatcher.dispatch(conn, event).await;
    }

    dispatcher.handle_disconnect(conn).await;
}
