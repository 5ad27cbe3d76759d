//! Agent server: a JSON-RPC/SSE façade over a catalog of tools, most of
//! them driving a headless browser through a bounded async task executor.

mod api;
mod browser;
mod config;
mod db;
mod error;
mod executor;
mod interpreter;
mod llm;
mod tools;

use api::{create_router, AppState};
use browser::BrowserPool;
use config::Config;
use db::Database;
use executor::TaskExecutor;
use interpreter::Interpreter;
use llm::{LlmConfig, LlmGateway, ModelRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tools::{Tool, ToolRegistry, WebActionTool};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_server=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.screenshots_dir)?;

    tracing::info!(path = ?config.db_path, "opening database");
    let db = Database::open(&config.db_path)?;

    let llm_config = LlmConfig::from_env();
    let llm_registry = Arc::new(ModelRegistry::new(&llm_config));

    if llm_registry.has_models() {
        tracing::info!(
            models = ?llm_registry.available_models(),
            default = %llm_registry.default_model_id(),
            "language-model registry initialized"
        );
    } else {
        tracing::warn!("no LM API keys configured; tool schema generation will fall back to defaults");
    }

    let model_id = config
        .default_model
        .clone()
        .unwrap_or_else(|| llm_registry.default_model_id().to_string());

    let gateway = Arc::new(LlmGateway::new(
        llm_registry.clone(),
        db.clone(),
        config.gateway_cache_ttl,
        config.llm_timeout,
    ));

    let browser = BrowserPool::new(config.browser_pool_capacity);

    let interpreter = Arc::new(Interpreter::new(
        browser.clone(),
        gateway.clone(),
        config.screenshots_dir.clone(),
        config.browser_acquire_timeout,
    ));

    let declared_tools: Vec<Arc<dyn Tool>> = vec![Arc::new(WebActionTool)];
    let registry = Arc::new(
        ToolRegistry::build(
            declared_tools,
            &db,
            &gateway,
            &model_id,
            config.description_generation_concurrency,
        )
        .await?,
    );

    let executor = TaskExecutor::spawn(
        db.clone(),
        registry.clone(),
        browser.clone(),
        gateway.clone(),
        interpreter.clone(),
        config.clone(),
    );

    let state = AppState {
        db,
        llm_registry,
        registry,
        executor,
        browser,
        gateway,
        interpreter,
        config: config.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("agent server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app).await;

    browser.shutdown().await;
    result?;
    Ok(())
}
