//! Tool registry (C2): discovery of declared tools, composed with cached or
//! freshly generated descriptions.
//!
//! Tools are registered explicitly — a `Vec` handed to [`ToolRegistry::build`]
//! — there is no reflection or annotation scanning over the binary.

pub mod browser_action;

pub use browser_action::WebActionTool;

use crate::browser::BrowserPool;
use crate::db::{Database, ErrorKind};
use crate::interpreter::Interpreter;
use crate::llm::gateway::{extract_json_object, Purpose};
use crate::llm::LlmGateway;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate tool name '{0}' declared at startup")]
    DuplicateTool(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Low,
    Medium,
    High,
}

/// Final, immutable description of one callable tool. Built once at startup;
/// never mutated afterward (new generations replace the registry snapshot,
/// not individual descriptors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub human_description: String,
    pub parameter_schema: Value,
    pub risk_class: RiskClass,
    pub implementation_ref: String,
    pub is_async: bool,
}

/// Result from tool execution. `error_kind` lets the task executor classify
/// a failure as retryable without parsing the message text; tools that
/// cannot name a more specific kind leave it `None` and the executor treats
/// the failure as terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
            error_kind: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
            error_kind: None,
        }
    }

    pub fn error_with_kind(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
            error_kind: Some(kind),
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }
}

/// Lets a running tool report intermediate progress back to the executor
/// without knowing whether anyone is listening. Direct synchronous
/// invocations (no task row) get [`ProgressReporter::noop`], whose updates
/// are simply dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    sender: tokio::sync::mpsc::UnboundedSender<(u8, Option<String>)>,
}

impl ProgressReporter {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<(u8, Option<String>)>) -> Self {
        Self { sender }
    }

    /// No-op reporter for contexts with no task to update.
    pub fn noop() -> Self {
        let (sender, _) = tokio::sync::mpsc::unbounded_channel();
        Self { sender }
    }

    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let _ = self.sender.send((percent, Some(message.into())));
    }

    pub fn report_percent(&self, percent: u8) {
        let _ = self.sender.send((percent, None));
    }
}

/// All context needed for a tool invocation. Created fresh per call.
#[derive(Clone)]
pub struct ToolContext {
    pub cancel: CancellationToken,
    pub requester_id: Option<String>,
    pub browser: Arc<BrowserPool>,
    pub gateway: Arc<LlmGateway>,
    pub interpreter: Arc<Interpreter>,
    pub progress: ProgressReporter,
}

/// A tool implementation. `human_description` and `parameter_skeleton` feed
/// the startup description-generation prompt; the generated schema replaces
/// neither — it is stored alongside and surfaced in `tools/list`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn human_description(&self) -> &'static str;
    fn parameter_skeleton(&self) -> Value;
    fn risk_class(&self) -> RiskClass;
    fn is_async(&self) -> bool;
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Immutable, swap-once snapshot published after startup generation completes.
struct RegistrySnapshot {
    descriptors: Vec<ToolDescriptor>,
    handlers: Vec<Arc<dyn Tool>>,
}

pub struct ToolRegistry {
    snapshot: Arc<RegistrySnapshot>,
}

impl ToolRegistry {
    /// Runs the startup generation algorithm: for each declared tool, look up
    /// a cached description for `model_id`; on miss, ask the gateway and
    /// write through the cache; on any failure, fall back to a default
    /// single-field `instructions` schema rather than aborting.
    pub async fn build(
        tools: Vec<Arc<dyn Tool>>,
        db: &Database,
        gateway: &LlmGateway,
        model_id: &str,
        concurrency: usize,
    ) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for tool in &tools {
            if !seen.insert(tool.name()) {
                return Err(RegistryError::DuplicateTool(tool.name().to_string()));
            }
        }

        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut generations = Vec::with_capacity(tools.len());

        for tool in &tools {
            let permit = semaphore.clone().acquire_owned().await;
            let tool = tool.clone();
            let model_id = model_id.to_string();
            generations.push(async move {
                let _permit = permit;
                generate_descriptor(tool.as_ref(), db, gateway, &model_id).await
            });
        }

        let descriptors = futures::future::join_all(generations).await;

        Ok(Self {
            snapshot: Arc::new(RegistrySnapshot {
                descriptors,
                handlers: tools,
            }),
        })
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.snapshot.descriptors.clone()
    }

    pub fn resolve(&self, name: &str) -> Option<ToolDescriptor> {
        self.snapshot
            .descriptors
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.snapshot
            .handlers
            .iter()
            .find(|t| t.name() == name)
            .cloned()
    }
}

async fn generate_descriptor(
    tool: &dyn Tool,
    db: &Database,
    gateway: &LlmGateway,
    model_id: &str,
) -> ToolDescriptor {
    if let Ok(Some(cached)) = db.lookup_description(model_id, tool.name()) {
        if let Some(schema) = parse_cached_schema(&cached.schema_text) {
            return ToolDescriptor {
                name: tool.name().to_string(),
                human_description: tool.human_description().to_string(),
                parameter_schema: schema,
                risk_class: tool.risk_class(),
                implementation_ref: tool.name().to_string(),
                is_async: tool.is_async(),
            };
        }
    }

    match generate_via_gateway(tool, db, gateway, model_id).await {
        Some(descriptor) => descriptor,
        None => default_descriptor(tool),
    }
}

fn parse_cached_schema(schema_text: &str) -> Option<Value> {
    serde_json::from_str(schema_text).ok()
}

async fn generate_via_gateway(
    tool: &dyn Tool,
    db: &Database,
    gateway: &LlmGateway,
    model_id: &str,
) -> Option<ToolDescriptor> {
    let start = std::time::Instant::now();
    let skeleton = tool.parameter_skeleton();
    let prompt = format!(
        "Generate a JSON Schema for the parameters of a tool named \"{}\".\n\
         Human description: {}\n\
         Declared parameter skeleton: {}\n\
         Reply with a JSON object: {{\"schema\": <json schema>, \"annotations\": <object>}}.",
        tool.name(),
        tool.human_description(),
        skeleton,
    );

    let response = gateway
        .query(&prompt, Purpose::ToolSchemaGeneration)
        .await
        .ok()?;
    let parsed = extract_json_object(&response)?;
    let schema = parsed.get("schema")?.clone();
    let annotations = parsed.get("annotations").cloned();
    let generation_millis = start.elapsed().as_millis() as i64;

    if let Err(e) = db.store_description(
        model_id,
        tool.name(),
        &serde_json::to_string(&schema).ok()?,
        annotations.as_ref(),
        generation_millis,
    ) {
        tracing::warn!(error = %e, tool = tool.name(), "failed to persist generated tool description");
    }

    Some(ToolDescriptor {
        name: tool.name().to_string(),
        human_description: tool.human_description().to_string(),
        parameter_schema: schema,
        risk_class: tool.risk_class(),
        implementation_ref: tool.name().to_string(),
        is_async: tool.is_async(),
    })
}

fn default_descriptor(tool: &dyn Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name().to_string(),
        human_description: tool.human_description().to_string(),
        parameter_schema: json!({
            "type": "object",
            "properties": {
                "instructions": { "type": "string" }
            },
            "required": ["instructions"]
        }),
        risk_class: tool.risk_class(),
        implementation_ref: tool.name().to_string(),
        is_async: tool.is_async(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelRegistry;
    use std::time::Duration;

    fn test_gateway() -> LlmGateway {
        let db = Database::open_in_memory().unwrap();
        let registry = Arc::new(ModelRegistry::new_empty());
        LlmGateway::new(registry, db, Duration::from_secs(60), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn falls_back_to_default_schema_without_models() {
        let db = Database::open_in_memory().unwrap();
        let gateway = test_gateway();
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(WebActionTool)];
        let registry = ToolRegistry::build(tools, &db, &gateway, "test-model", 4)
            .await
            .unwrap();

        let descriptors = registry.list();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "browser_action");
        assert_eq!(
            descriptors[0].parameter_schema["required"][0],
            "instructions"
        );
    }

    #[tokio::test]
    async fn duplicate_tool_names_rejected() {
        let db = Database::open_in_memory().unwrap();
        let gateway = test_gateway();
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(WebActionTool), Arc::new(WebActionTool)];
        let err = ToolRegistry::build(tools, &db, &gateway, "test-model", 4)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool(name) if name == "browser_action"));
    }

    #[tokio::test]
    async fn resolve_and_handler_agree_on_known_tool() {
        let db = Database::open_in_memory().unwrap();
        let gateway = test_gateway();
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(WebActionTool)];
        let registry = ToolRegistry::build(tools, &db, &gateway, "test-model", 4)
            .await
            .unwrap();

        assert!(registry.resolve("browser_action").is_some());
        assert!(registry.handler("browser_action").is_some());
        assert!(registry.resolve("nonexistent").is_none());
    }
}
