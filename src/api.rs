//! Protocol façade (C7): JSON-RPC over HTTP, the agent-card document, and
//! per-task SSE streams, all over a single shared `AppState`.

mod agent_card;
mod jsonrpc;
mod sse;
mod types;

pub use types::*;

use crate::browser::BrowserPool;
use crate::config::Config;
use crate::db::Database;
use crate::executor::TaskExecutor;
use crate::interpreter::Interpreter;
use crate::llm::{LlmGateway, ModelRegistry};
use crate::tools::ToolRegistry;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;

/// Shared across every handler. Read-only after startup except for the
/// database and executor, which manage their own interior synchronization.
///
/// `browser`/`gateway`/`interpreter` are the same instances the executor
/// holds — the façade needs them directly to invoke synchronous tools
/// without going through the task queue.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub llm_registry: Arc<ModelRegistry>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Arc<TaskExecutor>,
    pub browser: Arc<BrowserPool>,
    pub gateway: Arc<LlmGateway>,
    pub interpreter: Arc<Interpreter>,
    pub config: Arc<Config>,
}

/// Assembles the façade's router. Auth is intentionally absent here — callers
/// apply their own `tower::Layer` with `Router::layer` before serving.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1", post(jsonrpc::handle_rpc))
        .route("/v1/models", get(list_models))
        .route("/.well-known/agent.json", get(agent_card::get_agent_card))
        .route("/events/tasks/:task_id", get(sse::stream_task_events))
        .with_state(state)
}

async fn list_models(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.llm_registry.available_model_info(),
        default: state.llm_registry.default_model_id().to_string(),
    })
}
