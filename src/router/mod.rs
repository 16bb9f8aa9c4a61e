//! HTTP surface of the daemon

pub mod create;
pub mod public;
pub mod servers;

use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::ephemeral::ServerRegistry;

pub fn app(registry: Arc<ServerRegistry>) -> Router {
    public::public_router(registry.clone())
        .merge(create::create_router(registry.clone()))
        .merge(servers::servers_router(registry))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
