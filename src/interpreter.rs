//! Converts one free-form instruction (or a pre-split step list) into a
//! sequence of browser primitives executed against a single leased page.
//!
//! Grounded in the primitive implementations that used to live as individual
//! tools (navigate/click/type/wait/screenshot) — here they are steps in one
//! script instead of independently callable tools, run over a single
//! [`crate::browser::Lease`] for the lifetime of the instruction.

use crate::browser::{BrowserError, BrowserPool, Lease};
use crate::llm::gateway::{extract_json_object, Purpose};
use crate::llm::LlmGateway;
use crate::tools::ProgressReporter;
use async_trait::async_trait;
use chromiumoxide::page::ScreenshotParams;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const MAX_CORRECTION_RETRIES: u32 = 3;
const STABILITY_WAIT: Duration = Duration::from_secs(5);
const STEP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("language model failed to produce a usable step plan: {0}")]
    PlanUnparseable(String),
    #[error("step failed after {retries} correction attempts: {message}")]
    StepFailed { retries: u32, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Navigate(String),
    Click(String),
    Type(String, String),
    Wait(String, bool),
    ExtractText(String),
    Screenshot,
    ScrollTo(String),
    Close,
}

/// Outcome of a single executed step, folded into the interpreter's result.
#[derive(Debug, Clone, Default)]
struct StepOutcome {
    text: Option<String>,
    screenshot_path: Option<String>,
}

/// Hook surface invoked around every step. The default implementation does
/// nothing before/after and gives up immediately on error (no corrections).
#[async_trait]
pub trait InterpreterHooks: Send + Sync {
    async fn before(&self, _step: &Step) {}
    async fn after(&self, _step: &Step, _ok: bool) {}
    /// Called when a step fails. Returning `Some(step)` retries with the
    /// corrected step; `None` aborts the instruction.
    async fn on_error(&self, _step: &Step, _error: &str, _retries_so_far: u32) -> Option<Step> {
        None
    }
}

/// Hooks that ask the gateway for a corrected step on failure, up to
/// [`MAX_CORRECTION_RETRIES`] times.
pub struct RepairingHooks {
    gateway: Arc<LlmGateway>,
}

impl RepairingHooks {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl InterpreterHooks for RepairingHooks {
    async fn on_error(&self, step: &Step, error: &str, retries_so_far: u32) -> Option<Step> {
        if retries_so_far >= MAX_CORRECTION_RETRIES {
            return None;
        }
        let prompt = format!(
            "A browser automation step failed and needs correction.\n\
             Step: {step:?}\n\
             Error: {error}\n\
             Reply with a JSON object describing the corrected step, one of:\n\
             {{\"op\":\"navigate\",\"url\":\"...\"}}\n\
             {{\"op\":\"click\",\"selector\":\"...\"}}\n\
             {{\"op\":\"type\",\"selector\":\"...\",\"text\":\"...\"}}\n\
             {{\"op\":\"wait\",\"selector\":\"...\",\"visible\":true}}\n\
             {{\"op\":\"extract_text\",\"selector\":\"...\"}}\n\
             {{\"op\":\"screenshot\"}}\n\
             {{\"op\":\"scroll_to\",\"selector\":\"...\"}}\n\
             {{\"op\":\"close\"}}"
        );
        let response = self.gateway.query(&prompt, Purpose::StepRepair).await.ok()?;
        let value = extract_json_object(&response)?;
        parse_step(&value)
    }
}

fn parse_step(value: &serde_json::Value) -> Option<Step> {
    let op = value.get("op")?.as_str()?;
    match op {
        "navigate" => Some(Step::Navigate(value.get("url")?.as_str()?.to_string())),
        "click" => Some(Step::Click(value.get("selector")?.as_str()?.to_string())),
        "type" => Some(Step::Type(
            value.get("selector")?.as_str()?.to_string(),
            value.get("text")?.as_str()?.to_string(),
        )),
        "wait" => Some(Step::Wait(
            value.get("selector")?.as_str()?.to_string(),
            value.get("visible").and_then(serde_json::Value::as_bool).unwrap_or(false),
        )),
        "extract_text" => Some(Step::ExtractText(value.get("selector")?.as_str()?.to_string())),
        "screenshot" => Some(Step::Screenshot),
        "scroll_to" => Some(Step::ScrollTo(value.get("selector")?.as_str()?.to_string())),
        "close" => Some(Step::Close),
        _ => None,
    }
}

/// Splits a free-form instruction into a step list via the language model.
/// The reformulation prompt forbids "open browser" steps (navigation is
/// implicit in `Navigate`) and requires `http`/`https` URLs.
async fn split_instructions(gateway: &LlmGateway, instructions: &str) -> Result<Vec<Step>, InterpreterError> {
    let prompt = format!(
        "Split the following browser automation instructions into a JSON array of steps.\n\
         Do not include a separate \"open browser\" step; navigation is implicit.\n\
         URLs must start with http:// or https://.\n\
         Each array element is one of:\n\
         {{\"op\":\"navigate\",\"url\":\"...\"}}\n\
         {{\"op\":\"click\",\"selector\":\"...\"}}\n\
         {{\"op\":\"type\",\"selector\":\"...\",\"text\":\"...\"}}\n\
         {{\"op\":\"wait\",\"selector\":\"...\",\"visible\":true}}\n\
         {{\"op\":\"extract_text\",\"selector\":\"...\"}}\n\
         {{\"op\":\"screenshot\"}}\n\
         {{\"op\":\"scroll_to\",\"selector\":\"...\"}}\n\
         {{\"op\":\"close\"}}\n\
         Instructions:\n{instructions}"
    );
    let response = gateway
        .query(&prompt, Purpose::StepSplitting)
        .await
        .map_err(|e| InterpreterError::PlanUnparseable(e.to_string()))?;

    let array_start = response.find('[').ok_or_else(|| {
        InterpreterError::PlanUnparseable("no JSON array in step-splitting response".into())
    })?;
    let array_end = response.rfind(']').ok_or_else(|| {
        InterpreterError::PlanUnparseable("unterminated JSON array in step-splitting response".into())
    })?;
    let candidate = &response[array_start..=array_end];
    let values: Vec<serde_json::Value> = serde_json::from_str(candidate)
        .map_err(|e| InterpreterError::PlanUnparseable(e.to_string()))?;

    Ok(values.iter().filter_map(parse_step).collect())
}

pub struct Interpreter {
    browser: Arc<BrowserPool>,
    gateway: Arc<LlmGateway>,
    screenshots_dir: PathBuf,
    acquire_timeout: Duration,
}

impl Interpreter {
    pub fn new(
        browser: Arc<BrowserPool>,
        gateway: Arc<LlmGateway>,
        screenshots_dir: PathBuf,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            browser,
            gateway,
            screenshots_dir,
            acquire_timeout,
        }
    }

    /// Runs the instructions and returns concatenated extracted text.
    pub async fn run_and_return_text(
        &self,
        instructions: &str,
        cancel: &CancellationToken,
        hooks: &dyn InterpreterHooks,
        progress: &ProgressReporter,
    ) -> Result<String, InterpreterError> {
        let outcomes = self.run(instructions, cancel, hooks, progress).await?;
        let text = outcomes
            .iter()
            .filter_map(|o| o.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text)
    }

    /// Runs the instructions and returns the last successful screenshot.
    pub async fn run_and_return_image(
        &self,
        instructions: &str,
        cancel: &CancellationToken,
        hooks: &dyn InterpreterHooks,
        progress: &ProgressReporter,
    ) -> Result<Option<(String, String)>, InterpreterError> {
        let outcomes = self.run(instructions, cancel, hooks, progress).await?;
        let Some(path) = outcomes.iter().rev().find_map(|o| o.screenshot_path.clone()) else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| InterpreterError::StepFailed { retries: 0, message: e.to_string() })?;
        let base64_data = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes);
        Ok(Some(("image/png".to_string(), base64_data)))
    }

    async fn run(
        &self,
        instructions: &str,
        cancel: &CancellationToken,
        hooks: &dyn InterpreterHooks,
        progress: &ProgressReporter,
    ) -> Result<Vec<StepOutcome>, InterpreterError> {
        if instructions.trim().is_empty() {
            return Ok(Vec::new());
        }

        let steps = split_instructions(&self.gateway, instructions).await?;
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        let mut lease = self.browser.acquire(cancel, self.acquire_timeout).await?;
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut ok_overall = true;
        let total = steps.len();

        for (index, step) in steps.into_iter().enumerate() {
            match self.run_step_with_retries(&mut lease, step, hooks).await {
                Ok(outcome) => {
                    outcomes.push(outcome);
                    let percent = (((index + 1) * 100) / total).min(100) as u8;
                    progress.report_percent(percent);
                }
                Err(e) => {
                    ok_overall = false;
                    lease.release(ok_overall).await;
                    return Err(e);
                }
            }
        }

        lease.release(ok_overall).await;
        Ok(outcomes)
    }

    async fn run_step_with_retries(
        &self,
        lease: &mut Lease,
        mut step: Step,
        hooks: &dyn InterpreterHooks,
    ) -> Result<StepOutcome, InterpreterError> {
        let mut retries = 0;
        loop {
            hooks.before(&step).await;
            let result = self.execute_step(lease, &step).await;

            match result {
                Ok(outcome) => {
                    hooks.after(&step, true).await;
                    return Ok(outcome);
                }
                Err(e) => {
                    hooks.after(&step, false).await;
                    match hooks.on_error(&step, &e.to_string(), retries).await {
                        Some(corrected) if retries < MAX_CORRECTION_RETRIES => {
                            retries += 1;
                            step = corrected;
                        }
                        _ => {
                            return Err(InterpreterError::StepFailed {
                                retries,
                                message: e.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn execute_step(&self, lease: &mut Lease, step: &Step) -> Result<StepOutcome, InterpreterError> {
        let page = lease.page();

        let mut outcome = match step {
            Step::Navigate(url) => {
                tokio::time::timeout(STEP_TIMEOUT, page.goto(url))
                    .await
                    .map_err(|_| BrowserError::OperationFailed("navigate timed out".into()))??;
                tokio::time::timeout(STEP_TIMEOUT, page.wait_for_navigation())
                    .await
                    .ok();
                StepOutcome::default()
            }
            Step::Click(selector) => {
                let element = page
                    .find_element(selector)
                    .await
                    .map_err(|e| BrowserError::OperationFailed(format!("element not found: {e}")))?;
                element
                    .click()
                    .await
                    .map_err(|e| BrowserError::OperationFailed(e.to_string()))?;
                tokio::time::timeout(STEP_TIMEOUT, page.wait_for_navigation())
                    .await
                    .ok();
                StepOutcome::default()
            }
            Step::Type(selector, text) => {
                let element = page
                    .find_element(selector)
                    .await
                    .map_err(|e| BrowserError::OperationFailed(format!("element not found: {e}")))?;
                element
                    .click()
                    .await
                    .map_err(|e| BrowserError::OperationFailed(e.to_string()))?;
                element
                    .type_str(text)
                    .await
                    .map_err(|e| BrowserError::OperationFailed(e.to_string()))?;
                StepOutcome::default()
            }
            Step::Wait(selector, visible) => {
                self.wait_for_selector(lease, selector, *visible).await?;
                StepOutcome::default()
            }
            Step::ExtractText(selector) => {
                let element = page
                    .find_element(selector)
                    .await
                    .map_err(|e| BrowserError::OperationFailed(format!("element not found: {e}")))?;
                let text = element
                    .inner_text()
                    .await
                    .map_err(|e| BrowserError::OperationFailed(e.to_string()))?
                    .unwrap_or_default();
                StepOutcome { text: Some(text), screenshot_path: None }
            }
            Step::ScrollTo(selector) => {
                let script = format!(
                    "document.querySelector({}).scrollIntoView({{block: 'center'}})",
                    serde_json::to_string(selector).unwrap_or_default()
                );
                page.evaluate(script)
                    .await
                    .map_err(|e| BrowserError::OperationFailed(e.to_string()))?;
                StepOutcome::default()
            }
            Step::Screenshot | Step::Close => StepOutcome::default(),
        };

        if !matches!(step, Step::Close) {
            if let Some(path) = self.capture_screenshot(lease).await {
                outcome.screenshot_path = Some(path);
            }
        }

        Ok(outcome)
    }

    async fn wait_for_selector(&self, lease: &Lease, selector: &str, visible: bool) -> Result<(), InterpreterError> {
        let page = lease.page();
        let check_script = if visible {
            format!(
                r"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return false;
                    const style = window.getComputedStyle(el);
                    return style.display !== 'none' && style.visibility !== 'hidden' &&
                           style.opacity !== '0' && el.offsetParent !== null;
                }})()",
                sel = serde_json::to_string(selector).unwrap_or_default()
            )
        } else {
            format!(
                "document.querySelector({}) !== null",
                serde_json::to_string(selector).unwrap_or_default()
            )
        };

        let start = std::time::Instant::now();
        loop {
            if let Ok(result) = page.evaluate(check_script.clone()).await {
                if let Ok(true) = result.into_value::<bool>() {
                    return Ok(());
                }
            }
            if start.elapsed() >= STEP_TIMEOUT {
                return Err(InterpreterError::Browser(BrowserError::OperationFailed(format!(
                    "timeout waiting for selector '{selector}'"
                ))));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Full-page screenshot, falling back to viewport-only, then one more
    /// attempt after a stability wait. Returns `None` (recording a failure
    /// on the step, not the whole instruction) if all three fail.
    async fn capture_screenshot(&self, lease: &Lease) -> Option<String> {
        let page = lease.page();
        let params = ScreenshotParams::builder().full_page(true).build();
        if let Ok(Ok(bytes)) = tokio::time::timeout(STEP_TIMEOUT, page.screenshot(params)).await {
            return self.write_screenshot(bytes).await;
        }

        let params = ScreenshotParams::builder().build();
        if let Ok(Ok(bytes)) = tokio::time::timeout(STEP_TIMEOUT, page.screenshot(params)).await {
            return self.write_screenshot(bytes).await;
        }

        tokio::time::sleep(STABILITY_WAIT).await;
        let params = ScreenshotParams::builder().build();
        if let Ok(Ok(bytes)) = tokio::time::timeout(STEP_TIMEOUT, page.screenshot(params)).await {
            return self.write_screenshot(bytes).await;
        }

        tracing::warn!("screenshot capture failed after all fallbacks");
        None
    }

    async fn write_screenshot(&self, bytes: Vec<u8>) -> Option<String> {
        if tokio::fs::create_dir_all(&self.screenshots_dir).await.is_err() {
            return None;
        }
        let now = Utc::now();
        let filename = format!(
            "playwright_{}_{:03}.png",
            now.format("%Y%m%d_%H%M%S"),
            now.timestamp_subsec_millis()
        );
        let path = self.screenshots_dir.join(filename);
        tokio::fs::write(&path, &bytes).await.ok()?;
        Some(path.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_primitive_op() {
        let ops = [
            (r#"{"op":"navigate","url":"https://example.com"}"#, Step::Navigate("https://example.com".into())),
            (r#"{"op":"click","selector":"#go"}"#, Step::Click("#go".into())),
            (r#"{"op":"type","selector":"#q","text":"hi"}"#, Step::Type("#q".into(), "hi".into())),
            (r#"{"op":"wait","selector":"#x","visible":true}"#, Step::Wait("#x".into(), true)),
            (r#"{"op":"extract_text","selector":"h1"}"#, Step::ExtractText("h1".into())),
            (r#"{"op":"screenshot"}"#, Step::Screenshot),
            (r#"{"op":"scroll_to","selector":"#footer"}"#, Step::ScrollTo("#footer".into())),
            (r#"{"op":"close"}"#, Step::Close),
        ];
        for (json, expected) in ops {
            let value: serde_json::Value = serde_json::from_str(json).unwrap();
            assert_eq!(parse_step(&value), Some(expected));
        }
    }

    #[test]
    fn unknown_op_returns_none() {
        let value: serde_json::Value = serde_json::from_str(r#"{"op":"teleport"}"#).unwrap();
        assert_eq!(parse_step(&value), None);
    }

    #[tokio::test]
    async fn default_hooks_abort_immediately_on_error() {
        struct NoopHooks;
        #[async_trait]
        impl InterpreterHooks for NoopHooks {}
        let hooks = NoopHooks;
        let retry = hooks.on_error(&Step::Screenshot, "boom", 0).await;
        assert!(retry.is_none());
    }
}
