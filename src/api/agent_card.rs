//! `GET /.well-known/agent.json` — static self-description of this agent.

use super::types::{AgentCapabilities, AgentCard};
use super::AppState;
use axum::extract::State;
use axum::Json;

pub async fn get_agent_card(State(state): State<AppState>) -> Json<AgentCard> {
    Json(AgentCard {
        name: "browser-agent".to_string(),
        description: "Agent server exposing browser-automation tools over JSON-RPC and SSE.".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: AgentCapabilities { streaming: true },
        url: format!("http://0.0.0.0:{}", state.config.port),
    })
}
