//! The one browser-driving tool exposed to clients. Free-form instructions
//! go through the web action interpreter (C5), which splits, executes and
//! screenshots a sequence of browser primitives over a single leased page.

use super::{RiskClass, Tool, ToolContext, ToolOutput};
use crate::browser::BrowserError;
use crate::db::ErrorKind;
use crate::interpreter::{InterpreterError, RepairingHooks};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

fn classify(error: &InterpreterError) -> ErrorKind {
    match error {
        InterpreterError::Browser(BrowserError::PoolExhausted) => ErrorKind::BrowserUnavailable,
        InterpreterError::Browser(BrowserError::Cancelled) => ErrorKind::Cancelled,
        InterpreterError::Browser(_) => ErrorKind::BrowserUnavailable,
        InterpreterError::PlanUnparseable(_) => ErrorKind::LmUnparseable,
        InterpreterError::StepFailed { .. } => ErrorKind::StepFailed,
    }
}

#[derive(Debug, Deserialize)]
struct WebActionInput {
    instructions: String,
    #[serde(default)]
    r#return: ReturnMode,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ReturnMode {
    #[default]
    Text,
    Image,
}

pub struct WebActionTool;

#[async_trait]
impl Tool for WebActionTool {
    fn name(&self) -> &'static str {
        "browser_action"
    }

    fn human_description(&self) -> &'static str {
        "Drive a headless browser to carry out one or more steps described in natural language \
         (navigate, click, type, wait, extract text, scroll, screenshot). Each step is screenshotted \
         automatically; failed steps are retried with an AI-proposed correction up to three times."
    }

    fn parameter_skeleton(&self) -> Value {
        json!({
            "instructions": "string describing the steps to perform",
            "return": "text | image"
        })
    }

    fn risk_class(&self) -> RiskClass {
        RiskClass::Medium
    }

    fn is_async(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: WebActionInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("invalid input: {e}")),
        };

        let hooks = RepairingHooks::new(ctx.gateway.clone());

        match input.r#return {
            ReturnMode::Text => {
                match ctx
                    .interpreter
                    .run_and_return_text(&input.instructions, &ctx.cancel, &hooks, &ctx.progress)
                    .await
                {
                    Ok(text) => ToolOutput::success(text),
                    Err(e) => ToolOutput::error_with_kind(e.to_string(), classify(&e)),
                }
            }
            ReturnMode::Image => {
                match ctx
                    .interpreter
                    .run_and_return_image(&input.instructions, &ctx.cancel, &hooks, &ctx.progress)
                    .await
                {
                    Ok(Some((mime_type, data))) => {
                        ToolOutput::success("screenshot captured").with_display(json!({
                            "type": "image",
                            "media_type": mime_type,
                            "data": data,
                        }))
                    }
                    Ok(None) => ToolOutput::error("no screenshot was captured"),
                    Err(e) => ToolOutput::error_with_kind(e.to_string(), classify(&e)),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_instructions_and_return() {
        let skeleton = WebActionTool.parameter_skeleton();
        assert!(skeleton.get("instructions").is_some());
        assert!(skeleton.get("return").is_some());
    }

    #[test]
    fn defaults_to_text_return_mode() {
        let input: WebActionInput =
            serde_json::from_value(json!({"instructions": "go to example.com"})).unwrap();
        assert_eq!(input.r#return, ReturnMode::Text);
    }
}
