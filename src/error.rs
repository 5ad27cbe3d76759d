//! Top-level error type. Every component error converges here at the façade
//! edge, where it is mapped to a JSON-RPC error code and a stable `errorKind`.

use crate::db::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{message}")]
    Kind { kind: ErrorKind, message: String },
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Kind {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        let Self::Kind { kind, .. } = self;
        *kind
    }

    pub fn jsonrpc_code(&self) -> i64 {
        match self.kind() {
            ErrorKind::ToolNotFound | ErrorKind::ArgumentInvalid => -32602,
            _ => -32000,
        }
    }
}

impl From<crate::db::DbError> for AppError {
    fn from(e: crate::db::DbError) -> Self {
        AppError::new(ErrorKind::PersistenceFailed, e.to_string())
    }
}

impl From<crate::llm::LlmError> for AppError {
    fn from(e: crate::llm::LlmError) -> Self {
        use crate::llm::LlmErrorKind::*;
        let kind = match e.kind {
            Network => ErrorKind::LmTransport,
            RateLimit | ServerError => ErrorKind::LmTransport,
            Auth | InvalidRequest => ErrorKind::LmRejection,
            Unknown => ErrorKind::LmUnparseable,
        };
        AppError::new(kind, e.message)
    }
}

impl From<crate::browser::BrowserError> for AppError {
    fn from(e: crate::browser::BrowserError) -> Self {
        AppError::new(ErrorKind::BrowserUnavailable, e.to_string())
    }
}

impl From<crate::executor::TaskError> for AppError {
    fn from(e: crate::executor::TaskError) -> Self {
        use crate::executor::TaskError::*;
        let kind = match &e {
            UnknownTool(_) => ErrorKind::ToolNotFound,
            QueueFull => ErrorKind::QueueFull,
            NotFound(_) | NotTerminal(_) => ErrorKind::Internal,
        };
        AppError::new(kind, e.to_string())
    }
}
