pub mod dispatch;
pub mod event;
pub mod multiplex;
pub mod registry;
mod ws;

use axum::{Router, routing::get};

use crate::AppState;

/// Gateway error taxonomy. Everything here is reported to the
/// originating connection only, never broadcast.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid or expired token")]
    Unauthorized,
    #[error("message content is required")]
    InvalidContent,
    #[error("failed to persist message: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("unknown connection")]
    UnknownConnection,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws::gateway_ws))
}
