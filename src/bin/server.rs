//! chatrelay server binary.
//!
//! Starts the axum HTTP/WebSocket server exposing the `/ws` handshake route
//! and the admin HTTP surface.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `CHATRELAY_STORE` — storage backend: "memory" (default) or "postgres"
//! - `DATABASE_URL` — PostgreSQL connection string (required if `CHATRELAY_STORE=postgres`)
//! - `RUST_LOG` — tracing filter (default: "info")
//! - see [`chatrelay::config::ServerConfig`] and [`chatrelay::config::DefaultLlmConfig`]
//!   for the remaining tunables.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! # or with postgres:
//! cargo run --bin server --features postgres
//! ```

use std::sync::Arc;

use chatrelay::config::ServerConfig;
use chatrelay::config_cache::ClientConfigCache;
use chatrelay::hub::Hub;
use chatrelay::orchestrator::Orchestrator;
use chatrelay::server::{app_router, AppState};
use chatrelay::store::memory::MemoryStore;
use chatrelay::store::Store;
use chatrelay::streaming::StreamingEngine;
use chatrelay::tools::ToolRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chatrelay=debug".into()),
        )
        .init();

    let config = Arc::new(ServerConfig::from_env());
    let bind_addr = format!("0.0.0.0:{}", config.port);

    let store: Arc<dyn Store> = build_store().await;

    let hub = Hub::new();
    let streaming = StreamingEngine::new(config.stream_grace_window, config.stream_max_bytes);
    let tools = Arc::new(ToolRegistry::with_default_tools());
    let config_cache = Arc::new(ClientConfigCache::new(
        store.clone(),
        config.client_config_ttl,
        config.client_config_idle_horizon,
    ));
    config_cache.spawn_sweeper(config.client_config_idle_horizon / 2);

    let orchestrator = Orchestrator::new(
        store.clone(),
        hub.clone(),
        streaming,
        tools,
        config_cache.clone(),
        config.tool_call_timeout,
    );

    let state = AppState {
        orchestrator,
        hub,
        config_cache,
        store,
        config: config.clone(),
    };

    let app = app_router(state);

    tracing::info!("chatrelay server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /ws                                   — WebSocket handshake");
    tracing::info!("  GET  /admin/connections/{{id}}/usage          — token usage");
    tracing::info!("  POST /admin/connections/{{id}}/usage/limit    — set usage ceiling");
    tracing::info!("  POST /admin/connections/{{id}}/usage/reset    — reset usage");
    tracing::info!("  POST /admin/tenants/{{id}}/invalidate          — invalidate tenant LLM config");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("failed to bind");

    axum::serve(listener, app).await.expect("server failed");
}

async fn build_store() -> Arc<dyn Store> {
    #[cfg(feature = "postgres")]
    {
        if std::env::var("CHATRELAY_STORE").as_deref() == Ok("postgres") {
            let database_url = std::env::var("DATABASE_URL")
                .expect("DATABASE_URL must be set when CHATRELAY_STORE=postgres");
            tracing::info!("connecting to PostgreSQL...");
            let pool = sqlx::PgPool::connect(&database_url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = chatrelay::store::postgres::PostgresStore::new(pool);
            store.migrate().await.expect("failed to run migrations");
            tracing::info!("PostgreSQL migrations complete");
            return Arc::new(store);
        }
    }

    tracing::info!("using in-memory store");
    Arc::new(MemoryStore::new())
}
