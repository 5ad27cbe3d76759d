//! JSON-RPC dialect: `POST /v1`.
//!
//! `tools/list`, `tools/call`, `tasks/status`, `resources/list`, `prompts/list`.

use super::types::{JsonRpcRequest, JsonRpcResponse, INVALID_PARAMS, METHOD_NOT_FOUND};
use super::AppState;
use crate::error::AppError;
use crate::executor::SubmitOpts;
use crate::tools::{ProgressReporter, ToolContext, ToolOutput};
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

pub async fn handle_rpc(
    State(state): State<AppState>,
    Json(req): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    let id = req.id.clone();
    let response = match req.method.as_str() {
        "tools/list" => tools_list(&state),
        "tools/call" => tools_call(&state, req.params).await,
        "tasks/status" => tasks_status(&state, req.params).await,
        "resources/list" => JsonRpcResponse::ok(id.clone(), json!({ "resources": [] })),
        "prompts/list" => JsonRpcResponse::ok(id.clone(), json!({ "prompts": [] })),
        other => JsonRpcResponse::err(
            id.clone(),
            METHOD_NOT_FOUND,
            format!("unknown method '{other}'"),
        ),
    };
    Json(with_id(response, id))
}

fn with_id(mut response: JsonRpcResponse, id: Value) -> JsonRpcResponse {
    response.id = id;
    response
}

fn tools_list(state: &AppState) -> JsonRpcResponse {
    let tools: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .map(|d| {
            json!({
                "name": d.name,
                "description": d.human_description,
                "inputSchema": d.parameter_schema,
                "async": d.is_async,
            })
        })
        .collect();
    JsonRpcResponse::ok(Value::Null, json!({ "tools": tools }))
}

async fn tools_call(state: &AppState, params: Value) -> JsonRpcResponse {
    let Some(name) = params.get("name").and_then(Value::as_str) else {
        return JsonRpcResponse::err(Value::Null, INVALID_PARAMS, "missing 'name'");
    };
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let Some(descriptor) = state.registry.resolve(name) else {
        return JsonRpcResponse::err_with_kind(
            Value::Null,
            INVALID_PARAMS,
            format!("unknown tool '{name}'"),
            "toolNotFound",
        );
    };

    let wants_async = descriptor.is_async || params.get("async").and_then(Value::as_bool).unwrap_or(false);

    if wants_async {
        return match state.executor.submit(name, arguments, SubmitOpts::default()).await {
            Ok(task_id) => JsonRpcResponse::ok(Value::Null, json!({ "taskId": task_id })),
            Err(e) => app_error_response(e.into()),
        };
    }

    // Synchronous short tools bypass the task executor entirely: no task
    // row, no polling, just a direct call to the handler.
    let Some(handler) = state.registry.handler(name) else {
        return JsonRpcResponse::err_with_kind(
            Value::Null,
            INVALID_PARAMS,
            format!("unknown tool '{name}'"),
            "toolNotFound",
        );
    };

    let ctx = ToolContext {
        cancel: CancellationToken::new(),
        requester_id: None,
        browser: state.browser.clone(),
        gateway: state.gateway.clone(),
        interpreter: state.interpreter.clone(),
        progress: ProgressReporter::noop(),
    };

    tool_output_to_response(handler.run(arguments, ctx).await)
}

fn tool_output_to_response(output: ToolOutput) -> JsonRpcResponse {
    if output.success {
        let content = if let Some(display) = output.display_data.filter(|d| !d.is_null()) {
            json!([{ "type": "image", "mimeType": display.get("media_type"), "data": display.get("data") }])
        } else {
            json!([{ "type": "text", "text": output.output }])
        };
        JsonRpcResponse::ok(Value::Null, json!({ "content": content }))
    } else {
        let kind = output.error_kind.unwrap_or(crate::db::ErrorKind::Internal);
        app_error_response(AppError::new(kind, output.output))
    }
}

fn app_error_response(error: AppError) -> JsonRpcResponse {
    JsonRpcResponse::err_with_kind(Value::Null, error.jsonrpc_code(), error.to_string(), error.kind().as_str())
}

async fn tasks_status(state: &AppState, params: Value) -> JsonRpcResponse {
    let Some(task_id) = params.get("taskId").and_then(Value::as_str) else {
        return JsonRpcResponse::err(Value::Null, INVALID_PARAMS, "missing 'taskId'");
    };
    match state.executor.status(task_id).await {
        Some(task) => JsonRpcResponse::ok(Value::Null, serde_json::to_value(task).unwrap_or(Value::Null)),
        None => app_error_response(AppError::new(
            crate::db::ErrorKind::Internal,
            format!("unknown task '{task_id}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserPool;
    use crate::config::Config;
    use crate::db::Database;
    use crate::executor::TaskExecutor;
    use crate::interpreter::Interpreter;
    use crate::llm::{LlmGateway, ModelRegistry};
    use crate::tools::{RiskClass, Tool};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }
        fn human_description(&self) -> &'static str {
            "echoes its input back"
        }
        fn parameter_skeleton(&self) -> Value {
            json!({"text": "string"})
        }
        fn risk_class(&self) -> RiskClass {
            RiskClass::Low
        }
        fn is_async(&self) -> bool {
            false
        }
        async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
            ToolOutput::success(input.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string())
        }
    }

    async fn test_state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        let llm_registry = Arc::new(ModelRegistry::new_empty());
        let gateway = Arc::new(LlmGateway::new(
            llm_registry.clone(),
            db.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let browser = BrowserPool::new(2);
        let interpreter = Arc::new(Interpreter::new(
            browser.clone(),
            gateway.clone(),
            PathBuf::from("/tmp/jsonrpc-test-screenshots"),
            Duration::from_secs(5),
        ));
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let registry = Arc::new(
            crate::tools::ToolRegistry::build(tools, &db, &gateway, "test-model", 4)
                .await
                .unwrap(),
        );
        let mut config = Config::from_env();
        config.worker_count = 1;
        config.queue_depth = 2;
        let config = Arc::new(config);
        let executor = TaskExecutor::spawn(
            db.clone(),
            registry.clone(),
            browser.clone(),
            gateway.clone(),
            interpreter.clone(),
            config.clone(),
        );
        AppState {
            db,
            llm_registry,
            registry,
            executor,
            browser,
            gateway,
            interpreter,
            config,
        }
    }

    #[test]
    fn unknown_method_maps_to_method_not_found() {
        let response = JsonRpcResponse::err(json!(1), METHOD_NOT_FOUND, "unknown method 'bogus'");
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn sync_tool_call_bypasses_the_executor() {
        let state = test_state().await;
        let response = tools_call(&state, json!({"name": "echo", "arguments": {"text": "hi"}})).await;
        let result = response.result.expect("echo should succeed synchronously");
        assert_eq!(result["content"][0]["text"], "hi");
        assert_eq!(state.executor.queue_depth().await, 0);
        assert_eq!(state.executor.active_count().await, 0);
    }
}
