//! Uniform `query(prompt, purpose) -> text` entry point over the richer
//! multi-turn [`LlmService`] trait, with a fingerprint-keyed secondary cache,
//! cost accounting and call-log persistence.

use super::{LlmError, LlmMessage, LlmRequest, LlmService, MessageRole, ModelRegistry};
use crate::db::{Database, LlmCallLog};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// What a single-turn completion is being used for. Purely descriptive;
/// included in the call log so usage can be broken down later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    ToolSchemaGeneration,
    StepSplitting,
    StepClassification,
    StepRepair,
}

impl Purpose {
    fn as_str(self) -> &'static str {
        match self {
            Purpose::ToolSchemaGeneration => "tool_schema_generation",
            Purpose::StepSplitting => "step_splitting",
            Purpose::StepClassification => "step_classification",
            Purpose::StepRepair => "step_repair",
        }
    }
}

/// (input_per_1k_usd, output_per_1k_usd) in micros-of-a-dollar, so the table
/// stays integer. 1 micro = 1/1_000_000 USD.
fn pricing_micros_per_1k(model_id: &str) -> (i64, i64) {
    match model_id {
        m if m.contains("opus") => (15_000_000, 75_000_000),
        m if m.contains("sonnet") => (3_000_000, 15_000_000),
        m if m.contains("haiku") => (800_000, 4_000_000),
        m if m.contains("gpt") => (2_500_000, 10_000_000),
        m if m.contains("gemini") && m.contains("pro") => (1_250_000, 5_000_000),
        m if m.contains("gemini") => (75_000, 300_000),
        _ => (1_000_000, 3_000_000),
    }
}

struct CacheEntry {
    text: String,
    expires_at: Instant,
}

pub struct LlmGateway {
    registry: Arc<ModelRegistry>,
    db: Database,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    timeout: Duration,
}

impl LlmGateway {
    pub fn new(registry: Arc<ModelRegistry>, db: Database, cache_ttl: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            db,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            timeout,
        }
    }

    fn fingerprint(model_id: &str, prompt: &str, purpose: Purpose) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model_id.as_bytes());
        hasher.update(b"\0");
        hasher.update(purpose.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(prompt.trim().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Single-turn completion. Never retries; the caller decides retry policy.
    pub async fn query(&self, prompt: &str, purpose: Purpose) -> Result<String, LlmError> {
        self.query_with_model(None, prompt, purpose).await
    }

    pub async fn query_with_model(
        &self,
        model_id: Option<&str>,
        prompt: &str,
        purpose: Purpose,
    ) -> Result<String, LlmError> {
        let service = match model_id {
            Some(id) => self
                .registry
                .get(id)
                .ok_or_else(|| LlmError::unknown(format!("unknown model '{id}'")))?,
            None => self
                .registry
                .default()
                .ok_or_else(|| LlmError::unknown("no language model configured"))?,
        };

        let key = Self::fingerprint(service.model_id(), prompt, purpose);
        if let Some(text) = self.cache_get(&key).await {
            self.log_call(&key, true, service.as_ref(), prompt, &text, purpose, 0, None)
                .await;
            return Ok(text);
        }

        let start = Instant::now();
        let request = LlmRequest {
            system: vec![],
            messages: vec![LlmMessage {
                role: MessageRole::User,
                content: vec![super::ContentBlock::text(prompt)],
            }],
            tools: vec![],
            max_tokens: Some(4096),
        };

        let response = tokio::time::timeout(self.timeout, service.complete(&request))
            .await
            .map_err(|_| LlmError::network("language model request timed out"))??;

        let text = response.text();
        let latency = start.elapsed();
        self.cache_put(&key, text.clone()).await;

        self.log_call(
            &key,
            false,
            service.as_ref(),
            prompt,
            &text,
            purpose,
            latency.as_millis() as i64,
            Some(&response.usage),
        )
        .await;

        Ok(text)
    }

    async fn cache_get(&self, key: &str) -> Option<String> {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.text.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn cache_put(&self, key: &str, text: String) {
        let mut cache = self.cache.lock().await;
        cache.insert(
            key.to_string(),
            CacheEntry {
                text,
                expires_at: Instant::now() + self.cache_ttl,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_call(
        &self,
        cache_key: &str,
        cache_hit: bool,
        service: &dyn LlmService,
        prompt: &str,
        response_text: &str,
        purpose: Purpose,
        latency_millis: i64,
        usage: Option<&super::Usage>,
    ) {
        let (input_tokens, output_tokens) = match usage {
            Some(u) => (u.input_tokens as i64, u.output_tokens as i64),
            None => (0, 0),
        };

        let estimated_cost_micros = if cache_hit {
            0
        } else {
            let (in_price, out_price) = pricing_micros_per_1k(service.model_id());
            (input_tokens * in_price + output_tokens * out_price) / 1000
        };

        let now = Utc::now();
        let log = LlmCallLog {
            call_id: uuid::Uuid::new_v4().to_string(),
            cache_key: cache_key.to_string(),
            cache_hit,
            provider: service.provider_name().to_string(),
            model_id: service.model_id().to_string(),
            request_bytes: prompt.len() as i64,
            response_bytes: response_text.len() as i64,
            input_tokens,
            output_tokens,
            latency_millis,
            estimated_cost_micros,
            tool_name: None,
            task_id: None,
            created_at: now,
            completed_at: now,
        };

        tracing::debug!(
            purpose = purpose.as_str(),
            provider = log.provider,
            cache_hit,
            "language-model call"
        );

        if let Err(e) = self.db.log_llm_call(&log) {
            tracing::warn!(error = %e, "failed to persist language-model call log");
        }
    }
}

/// Pulls a balanced `{...}` JSON span out of text that may contain
/// surrounding prose, tolerant of language models that narrate before
/// returning structured output.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..=i];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_surrounding_prose() {
        let text = "Sure, here is the schema:\n{\"type\":\"object\",\"properties\":{}}\nLet me know if that helps.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["type"], "object");
    }

    #[test]
    fn returns_none_without_braces() {
        assert!(extract_json_object("no json here").is_none());
    }

    #[test]
    fn fingerprint_is_stable_for_same_inputs() {
        let a = LlmGateway::fingerprint("claude-4.5-sonnet", "hello", Purpose::StepSplitting);
        let b = LlmGateway::fingerprint("claude-4.5-sonnet", "hello", Purpose::StepSplitting);
        assert_eq!(a, b);
        let c = LlmGateway::fingerprint("claude-4.5-sonnet", "hello", Purpose::StepRepair);
        assert_ne!(a, c);
    }
}
