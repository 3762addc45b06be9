//! HTTP/WebSocket surface: the `/ws` upgrade route
//! and the admin HTTP surface.

pub mod admin;
pub mod ws_route;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::config_cache::ClientConfigCache;
use crate::hub::Hub;
use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Shared application state for the axum router: cloneable, `Arc`-backed
/// fields.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: Arc<Hub>,
    pub config_cache: Arc<ClientConfigCache>,
    pub store: Arc<dyn Store>,
    pub config: Arc<ServerConfig>,
}

/// Build the axum router: the WebSocket upgrade plus the admin surface.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_route::ws_handler))
        .route("/admin/connections/{id}/usage", get(admin::get_usage))
        .route("/admin/connections/{id}/usage/limit", post(admin::set_usage_limit))
        .route("/admin/connections/{id}/usage/reset", post(admin::reset_usage))
        .route("/admin/tenants/{id}/invalidate", post(admin::invalidate_tenant))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::streaming::StreamingEngine;
    use crate::tools::ToolRegistry;
    use std::time::Duration;

    pub fn build_test_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let hub = Hub::new();
        let streaming = StreamingEngine::new(Duration::from_secs(30), 2 * 1024 * 1024);
        let tools = Arc::new(ToolRegistry::with_default_tools());
        let config_cache = Arc::new(ClientConfigCache::new(
            store.clone(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));
        let orchestrator = Orchestrator::new(
            store.clone(),
            hub.clone(),
            streaming,
            tools,
            config_cache.clone(),
            Duration::from_secs(30),
        );
        AppState {
            orchestrator,
            hub,
            config_cache,
            store,
            config: Arc::new(ServerConfig::default()),
        }
    }
}
