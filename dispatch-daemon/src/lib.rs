//! HTTP + Socket Facade (C8, `spec.md` §6): thin translation layer from
//! wire requests to `Orchestrator` calls, plus the ambient daemon stack
//! (config, logging) described in `SPEC_FULL.md` §3.1/§6.

pub mod auth;
pub mod config;
mod http;
pub mod logging;
mod socket;
mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use dispatch_adapters::AdapterRegistry;
use dispatch_hub::SubscriptionHub;
use dispatch_orchestrator::Orchestrator;
use dispatch_orchestrator::OrchestratorConfig;
use tower_http::trace::TraceLayer;

pub use auth::AuthValidator;
pub use auth::StaticTokenValidator;
pub use config::Config;
pub use state::AppState;

/// Builds every process-wide singleton (`spec.md` §9: "The Event Store,
/// Session Repository, Workspace Repository, and Adapter Registry are
/// process-wide singletons initialized at startup") and returns the
/// `Orchestrator` that owns them.
pub fn build_orchestrator(config: &Config) -> anyhow::Result<Orchestrator> {
    let (store, sessions, workspaces) = dispatch_store::open(&config.store_path)?;
    let hub = Arc::new(SubscriptionHub::with_window_bytes(store.clone(), config.subscriber_window_bytes));
    let registry = AdapterRegistry::with_builtin_adapters();
    let orchestrator_config = OrchestratorConfig {
        adapter_start_timeout: std::time::Duration::from_millis(config.adapter_start_timeout_ms),
        pre_start_buffer_bytes: config.pre_start_buffer_bytes,
    };
    Ok(Orchestrator::new(registry, store, sessions, workspaces, hub, orchestrator_config))
}

pub fn build_state(orchestrator: Orchestrator, auth: Arc<dyn AuthValidator>, config: Arc<Config>) -> AppState {
    AppState { orchestrator, auth, config }
}

/// Assembles the full axum `Router`: the REST facade (`http.rs`) plus the
/// WebSocket upgrade route (`socket.rs`), wrapped in a request trace layer.
pub fn app(state: AppState) -> Router {
    http::router(state.clone())
        .route("/ws", get(socket::upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
