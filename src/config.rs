//! Typed, environment-populated server configuration.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Worker pool size (W) for the task executor.
    pub worker_count: usize,
    /// Bounded queue depth (Q) for the task executor.
    pub queue_depth: usize,
    /// Maximum concurrent browser leases.
    pub browser_pool_capacity: usize,
    /// Directory screenshots are written to.
    pub screenshots_dir: PathBuf,
    /// Active language-model identifier used by the tool registry and interpreter.
    pub default_model: Option<String>,
    /// Per-call LM gateway timeout.
    pub llm_timeout: Duration,
    /// Per-task default timeout, when the caller does not specify one.
    pub task_timeout: Duration,
    /// Maximum time a task may sit queued before being failed with `queueTimeout`.
    pub queue_timeout: Duration,
    /// Deadline for acquiring a browser lease before `browserUnavailable`.
    pub browser_acquire_timeout: Duration,
    /// Sqlite database path.
    pub db_path: PathBuf,
    /// Concurrency bound for startup tool-description generation.
    pub description_generation_concurrency: usize,
    /// TTL for the gateway's in-process fingerprint cache.
    pub gateway_cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", 7860),
            worker_count: env_parse("WORKER_COUNT", 4),
            queue_depth: env_parse("QUEUE_DEPTH", 100),
            browser_pool_capacity: env_parse("BROWSER_POOL_CAPACITY", 4),
            screenshots_dir: std::env::var("SCREENSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./screenshots")),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
            llm_timeout: Duration::from_secs(env_parse("LLM_TIMEOUT_SECONDS", 30)),
            task_timeout: Duration::from_secs(env_parse("TASK_TIMEOUT_SECONDS", 300)),
            queue_timeout: Duration::from_secs(env_parse("QUEUE_TIMEOUT_SECONDS", 600)),
            browser_acquire_timeout: Duration::from_secs(env_parse("BROWSER_ACQUIRE_TIMEOUT_SECONDS", 30)),
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./agent.db")),
            description_generation_concurrency: env_parse("DESCRIPTION_GENERATION_CONCURRENCY", 4),
            gateway_cache_ttl: Duration::from_secs(env_parse("GATEWAY_CACHE_TTL_SECONDS", 60)),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
