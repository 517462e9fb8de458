use std::sync::Arc;

use dispatch_orchestrator::Orchestrator;

use crate::auth::AuthValidator;
use crate::config::Config;

/// Shared state handed to every axum handler. Every field is itself a cheap
/// handle (`Orchestrator` is `Clone`, the rest are `Arc`s), so `AppState` is
/// cloned per-request the way the teacher's own app-server state is.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub auth: Arc<dyn AuthValidator>,
    pub config: Arc<Config>,
}
