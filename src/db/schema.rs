//! Database schema and row types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tool_description (
    provider_model TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    schema_text TEXT NOT NULL,
    annotations TEXT,
    generation_millis INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (provider_model, tool_name)
);

CREATE TABLE IF NOT EXISTS task_execution (
    task_id TEXT PRIMARY KEY,
    tool_name TEXT NOT NULL,
    arguments TEXT NOT NULL,
    status TEXT NOT NULL,
    progress_percent INTEGER NOT NULL DEFAULT 0,
    progress_message TEXT,
    requester_id TEXT,
    idempotency_key TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    timeout_seconds INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    retries_so_far INTEGER NOT NULL DEFAULT 0,
    result_payload TEXT,
    error_kind TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_execution_status ON task_execution(status);
CREATE UNIQUE INDEX IF NOT EXISTS idx_task_execution_idempotency
    ON task_execution(requester_id, idempotency_key)
    WHERE idempotency_key IS NOT NULL;

CREATE TABLE IF NOT EXISTS task_screenshot (
    task_id TEXT NOT NULL,
    step_number INTEGER NOT NULL,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (task_id, step_number),
    FOREIGN KEY (task_id) REFERENCES task_execution(task_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS llm_call_log (
    call_id TEXT PRIMARY KEY,
    cache_key TEXT NOT NULL,
    cache_hit BOOLEAN NOT NULL,
    provider TEXT NOT NULL,
    model_id TEXT NOT NULL,
    request_bytes INTEGER NOT NULL,
    response_bytes INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    latency_millis INTEGER NOT NULL,
    estimated_cost_micros INTEGER NOT NULL DEFAULT 0,
    tool_name TEXT,
    task_id TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_llm_call_log_model ON llm_call_log(model_id);
"#;

/// Status of one task execution. See the task executor's lifecycle contract
/// for the transitions this enum is allowed to take.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "timed_out" => TaskStatus::TimedOut,
            _ => TaskStatus::Queued,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The stable error-kind vocabulary surfaced to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    ConfigInvalid,
    ToolNotFound,
    ArgumentInvalid,
    QueueFull,
    QueueTimeout,
    Timeout,
    Cancelled,
    BrowserUnavailable,
    StepFailed,
    LmTransport,
    LmRejection,
    LmUnparseable,
    PersistenceFailed,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::LmTransport | ErrorKind::BrowserUnavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "configInvalid",
            ErrorKind::ToolNotFound => "toolNotFound",
            ErrorKind::ArgumentInvalid => "argumentInvalid",
            ErrorKind::QueueFull => "queueFull",
            ErrorKind::QueueTimeout => "queueTimeout",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BrowserUnavailable => "browserUnavailable",
            ErrorKind::StepFailed => "stepFailed",
            ErrorKind::LmTransport => "lmTransport",
            ErrorKind::LmRejection => "lmRejection",
            ErrorKind::LmUnparseable => "lmUnparseable",
            ErrorKind::PersistenceFailed => "persistenceFailed",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "toolNotFound" => ErrorKind::ToolNotFound,
            "argumentInvalid" => ErrorKind::ArgumentInvalid,
            "queueFull" => ErrorKind::QueueFull,
            "queueTimeout" => ErrorKind::QueueTimeout,
            "timeout" => ErrorKind::Timeout,
            "cancelled" => ErrorKind::Cancelled,
            "browserUnavailable" => ErrorKind::BrowserUnavailable,
            "stepFailed" => ErrorKind::StepFailed,
            "lmTransport" => ErrorKind::LmTransport,
            "lmRejection" => ErrorKind::LmRejection,
            "lmUnparseable" => ErrorKind::LmUnparseable,
            "persistenceFailed" => ErrorKind::PersistenceFailed,
            "configInvalid" => ErrorKind::ConfigInvalid,
            _ => ErrorKind::Internal,
        }
    }
}

/// A cached (provider+model, tool) description row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedDescription {
    pub provider_model: String,
    pub tool_name: String,
    pub schema_text: String,
    pub annotations: Option<serde_json::Value>,
    pub generation_millis: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub usage_count: i64,
}

/// One asynchronous task's durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: TaskStatus,
    pub progress_percent: u8,
    pub progress_message: Option<String>,
    pub requester_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: i64,
    pub max_retries: i32,
    pub retries_so_far: i32,
    pub result_payload: Option<serde_json::Value>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub screenshots: Vec<String>,
}

/// One persisted language-model call-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCallLog {
    pub call_id: String,
    pub cache_key: String,
    pub cache_hit: bool,
    pub provider: String,
    pub model_id: String,
    pub request_bytes: i64,
    pub response_bytes: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub latency_millis: i64,
    pub estimated_cost_micros: i64,
    pub tool_name: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
