//! The HTTP surface: vault registration, notification acknowledgement
//! and a liveness probe. A thin validation layer over the store; the
//! monitors never go through here.

pub mod handlers;

use crate::config::Config;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

/// State shared by all handlers.
pub struct ApiState {
    pub config: Config,
}

/// Routes with an explicit network prefix, plus the unprefixed variants
/// defaulting to the bitcoin network.
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/generate_204", get(handlers::liveness))
        .route("/watchtower/register", post(handlers::register_default))
        .route("/watchtower/ack", post(handlers::ack_default))
        .route(
            "/watchtower/notifications",
            post(handlers::notifications_default),
        )
        .route("/:network/watchtower/register", post(handlers::register))
        .route("/:network/watchtower/ack", post(handlers::ack))
        .route(
            "/:network/watchtower/notifications",
            post(handlers::notifications),
        )
        .with_state(state)
}
