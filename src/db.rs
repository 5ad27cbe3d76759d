//! Persistence for tool descriptions, task executions and language-model call logs.

mod schema;

pub use schema::*;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle. One `rusqlite::Connection` behind a mutex,
/// matched to the single-writer-at-a-time access pattern every caller uses.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Description cache (C1) ====================

    pub fn lookup_description(
        &self,
        provider_model: &str,
        tool_name: &str,
    ) -> DbResult<Option<CachedDescription>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let updated = conn.execute(
            "UPDATE tool_description SET usage_count = usage_count + 1, last_used_at = ?1
             WHERE provider_model = ?2 AND tool_name = ?3",
            params![now, provider_model, tool_name],
        )?;
        if updated == 0 {
            return Ok(None);
        }

        let row = conn
            .query_row(
                "SELECT provider_model, tool_name, schema_text, annotations, generation_millis,
                        created_at, last_used_at, usage_count
                 FROM tool_description WHERE provider_model = ?1 AND tool_name = ?2",
                params![provider_model, tool_name],
                parse_description_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn store_description(
        &self,
        provider_model: &str,
        tool_name: &str,
        schema_text: &str,
        annotations: Option<&serde_json::Value>,
        generation_millis: i64,
    ) -> DbResult<CachedDescription> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let annotations_str = annotations.map(|v| serde_json::to_string(v).unwrap());

        conn.execute(
            "INSERT INTO tool_description
                (provider_model, tool_name, schema_text, annotations, generation_millis, created_at, last_used_at, usage_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)
             ON CONFLICT(provider_model, tool_name) DO UPDATE SET
                schema_text = excluded.schema_text,
                annotations = excluded.annotations,
                generation_millis = excluded.generation_millis",
            params![
                provider_model,
                tool_name,
                schema_text,
                annotations_str,
                generation_millis,
                now.to_rfc3339(),
            ],
        )?;

        conn.query_row(
            "SELECT provider_model, tool_name, schema_text, annotations, generation_millis,
                    created_at, last_used_at, usage_count
             FROM tool_description WHERE provider_model = ?1 AND tool_name = ?2",
            params![provider_model, tool_name],
            parse_description_row,
        )
        .map_err(DbError::from)
    }

    pub fn evict_descriptions_older_than(&self, seconds: i64) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(seconds);
        let deleted = conn.execute(
            "DELETE FROM tool_description WHERE last_used_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    /// Cached-description counts and average generation cost, grouped by
    /// provider+model.
    pub fn stats_by_provider(&self) -> DbResult<Vec<(String, i64, f64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT provider_model, COUNT(*), AVG(generation_millis)
             FROM tool_description
             GROUP BY provider_model",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let model_id: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let avg_gen_millis: f64 = row.get(2)?;
                Ok((model_id, count, avg_gen_millis))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==================== Task executions (C6) ====================

    #[allow(clippy::too_many_arguments)]
    pub fn create_task(
        &self,
        task_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
        requester_id: Option<&str>,
        idempotency_key: Option<&str>,
        timeout_seconds: i64,
        max_retries: i32,
    ) -> DbResult<TaskExecution> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        if let (Some(requester), Some(key)) = (requester_id, idempotency_key) {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT task_id FROM task_execution WHERE requester_id = ?1 AND idempotency_key = ?2",
                    params![requester, key],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing_id) = existing {
                return Err(DbError::DuplicateIdempotencyKey(existing_id));
            }
        }

        let arguments_str = serde_json::to_string(arguments).unwrap();
        conn.execute(
            "INSERT INTO task_execution
                (task_id, tool_name, arguments, status, progress_percent, requester_id,
                 idempotency_key, created_at, timeout_seconds, max_retries, retries_so_far)
             VALUES (?1, ?2, ?3, 'queued', 0, ?4, ?5, ?6, ?7, ?8, 0)",
            params![
                task_id,
                tool_name,
                arguments_str,
                requester_id,
                idempotency_key,
                now.to_rfc3339(),
                timeout_seconds,
                max_retries,
            ],
        )?;

        Ok(TaskExecution {
            task_id: task_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
            status: TaskStatus::Queued,
            progress_percent: 0,
            progress_message: None,
            requester_id: requester_id.map(String::from),
            idempotency_key: idempotency_key.map(String::from),
            created_at: now,
            started_at: None,
            completed_at: None,
            timeout_seconds,
            max_retries,
            retries_so_far: 0,
            result_payload: None,
            error_kind: None,
            error_message: None,
            screenshots: Vec::new(),
        })
    }

    pub fn get_task(&self, task_id: &str) -> DbResult<TaskExecution> {
        let conn = self.conn.lock().unwrap();
        let mut task = conn
            .query_row(
                "SELECT task_id, tool_name, arguments, status, progress_percent, progress_message,
                        requester_id, idempotency_key, created_at, started_at, completed_at,
                        timeout_seconds, max_retries, retries_so_far, result_payload,
                        error_kind, error_message
                 FROM task_execution WHERE task_id = ?1",
                params![task_id],
                parse_task_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::TaskNotFound(task_id.to_string()),
                other => DbError::Sqlite(other),
            })?;

        let mut stmt = conn.prepare(
            "SELECT path FROM task_screenshot WHERE task_id = ?1 ORDER BY step_number ASC",
        )?;
        let screenshots = stmt
            .query_map(params![task_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        task.screenshots = screenshots;
        Ok(task)
    }

    pub fn set_running(&self, task_id: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE task_execution SET status = 'running', started_at = ?1 WHERE task_id = ?2",
            params![now, task_id],
        )?;
        if updated == 0 {
            return Err(DbError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    pub fn update_progress(&self, task_id: &str, percent: u8, message: Option<&str>) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE task_execution SET progress_percent = ?1, progress_message = ?2
             WHERE task_id = ?3 AND progress_percent <= ?1",
            params![percent, message, task_id],
        )?;
        if updated == 0 {
            return Err(DbError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    pub fn complete_task(&self, task_id: &str, result_payload: &serde_json::Value) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let payload_str = serde_json::to_string(result_payload).unwrap();
        let updated = conn.execute(
            "UPDATE task_execution SET status = 'completed', progress_percent = 100,
                completed_at = ?1, result_payload = ?2 WHERE task_id = ?3",
            params![now, payload_str, task_id],
        )?;
        if updated == 0 {
            return Err(DbError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    pub fn fail_task(&self, task_id: &str, status: TaskStatus, kind: ErrorKind, message: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let updated = conn.execute(
            "UPDATE task_execution SET status = ?1, completed_at = ?2, error_kind = ?3, error_message = ?4
             WHERE task_id = ?5",
            params![status.as_str(), now, kind.as_str(), message, task_id],
        )?;
        if updated == 0 {
            return Err(DbError::TaskNotFound(task_id.to_string()));
        }
        Ok(())
    }

    pub fn increment_retry(&self, task_id: &str) -> DbResult<i32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE task_execution SET status = 'queued', retries_so_far = retries_so_far + 1,
                started_at = NULL WHERE task_id = ?1",
            params![task_id],
        )?;
        conn.query_row(
            "SELECT retries_so_far FROM task_execution WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    pub fn add_screenshot(&self, task_id: &str, step_number: i64, path: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO task_screenshot (task_id, step_number, path, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, step_number, path, now],
        )?;
        Ok(())
    }

    /// Sweep running/queued tasks past their deadlines. Returns the number of rows changed.
    pub fn sweep_expired(&self, queue_timeout_seconds: i64) -> DbResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let mut changed = 0;

        changed += conn.execute(
            "UPDATE task_execution SET status = 'timed_out', completed_at = ?1, error_kind = 'timeout',
                error_message = 'task exceeded its timeout'
             WHERE status = 'running'
               AND started_at IS NOT NULL
               AND (strftime('%s', ?1) - strftime('%s', started_at)) > timeout_seconds",
            params![now.to_rfc3339()],
        )?;

        changed += conn.execute(
            "UPDATE task_execution SET status = 'failed', completed_at = ?1, error_kind = 'queueTimeout',
                error_message = 'task exceeded queue dwell time'
             WHERE status = 'queued'
               AND (strftime('%s', ?1) - strftime('%s', created_at)) > ?2",
            params![now.to_rfc3339(), queue_timeout_seconds],
        )?;

        Ok(changed)
    }

    /// Task counts by status for tasks created in the last 24 hours.
    pub fn daily_task_stats(&self) -> DbResult<Vec<(TaskStatus, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM task_execution
             WHERE created_at > datetime('now', '-1 day')
             GROUP BY status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((TaskStatus::parse(&status), count))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ==================== LM call log (C3) ====================

    #[allow(clippy::too_many_arguments)]
    pub fn log_llm_call(&self, log: &LlmCallLog) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO llm_call_log
                (call_id, cache_key, cache_hit, provider, model_id, request_bytes, response_bytes,
                 input_tokens, output_tokens, latency_millis, estimated_cost_micros, tool_name,
                 task_id, created_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                log.call_id,
                log.cache_key,
                log.cache_hit,
                log.provider,
                log.model_id,
                log.request_bytes,
                log.response_bytes,
                log.input_tokens,
                log.output_tokens,
                log.latency_millis,
                log.estimated_cost_micros,
                log.tool_name,
                log.task_id,
                log.created_at.to_rfc3339(),
                log.completed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn parse_description_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedDescription> {
    let annotations: Option<String> = row.get(3)?;
    Ok(CachedDescription {
        provider_model: row.get(0)?,
        tool_name: row.get(1)?,
        schema_text: row.get(2)?,
        annotations: annotations.and_then(|s| serde_json::from_str(&s).ok()),
        generation_millis: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
        last_used_at: parse_datetime(&row.get::<_, String>(6)?),
        usage_count: row.get(7)?,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskExecution> {
    let arguments_str: String = row.get(2)?;
    let result_str: Option<String> = row.get(14)?;
    let error_kind_str: Option<String> = row.get(15)?;
    let started_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;

    Ok(TaskExecution {
        task_id: row.get(0)?,
        tool_name: row.get(1)?,
        arguments: serde_json::from_str(&arguments_str).unwrap_or(serde_json::Value::Null),
        status: TaskStatus::parse(&row.get::<_, String>(3)?),
        progress_percent: row.get::<_, i64>(4)? as u8,
        progress_message: row.get(5)?,
        requester_id: row.get(6)?,
        idempotency_key: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        started_at: started_at.as_deref().map(parse_datetime),
        completed_at: completed_at.as_deref().map(parse_datetime),
        timeout_seconds: row.get(11)?,
        max_retries: row.get(12)?,
        retries_so_far: row.get(13)?,
        result_payload: result_str.and_then(|s| serde_json::from_str(&s).ok()),
        error_kind: error_kind_str.as_deref().map(ErrorKind::parse),
        error_message: row.get(16)?,
        screenshots: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_cache_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.lookup_description("claude-4.5-sonnet", "echo").unwrap().is_none());

        let stored = db
            .store_description("claude-4.5-sonnet", "echo", "{\"type\":\"object\"}", None, 120)
            .unwrap();
        assert_eq!(stored.usage_count, 0);

        let hit = db.lookup_description("claude-4.5-sonnet", "echo").unwrap().unwrap();
        assert_eq!(hit.usage_count, 1);
        assert_eq!(hit.created_at, stored.created_at);

        let hit2 = db.lookup_description("claude-4.5-sonnet", "echo").unwrap().unwrap();
        assert_eq!(hit2.usage_count, 2);
    }

    #[test]
    fn task_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let task = db
            .create_task("t1", "echo", &json!({"text": "hi"}), None, None, 30, 2)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Queued);

        db.set_running("t1").unwrap();
        let running = db.get_task("t1").unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        db.update_progress("t1", 50, Some("halfway")).unwrap();
        db.complete_task("t1", &json!({"text": "hi"})).unwrap();
        let done = db.get_task("t1").unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress_percent, 100);
    }

    #[test]
    fn stats_by_provider_groups_and_averages() {
        let db = Database::open_in_memory().unwrap();
        db.store_description("claude-4.5-sonnet", "echo", "{}", None, 100).unwrap();
        db.store_description("claude-4.5-sonnet", "browser_action", "{}", None, 300).unwrap();
        db.store_description("gpt-5.2-codex", "echo", "{}", None, 50).unwrap();

        let mut stats = db.stats_by_provider().unwrap();
        stats.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(stats.len(), 2);
        let (model, count, avg) = &stats[0];
        assert_eq!(model, "claude-4.5-sonnet");
        assert_eq!(*count, 2);
        assert!((*avg - 200.0).abs() < f64::EPSILON);
        assert_eq!(stats[1].0, "gpt-5.2-codex");
        assert_eq!(stats[1].1, 1);
    }

    #[test]
    fn duplicate_idempotency_key_rejected() {
        let db = Database::open_in_memory().unwrap();
        db.create_task("t1", "echo", &json!({}), Some("user-1"), Some("key-1"), 30, 2)
            .unwrap();
        let err = db
            .create_task("t2", "echo", &json!({}), Some("user-1"), Some("key-1"), 30, 2)
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateIdempotencyKey(id) if id == "t1"));
    }
}
