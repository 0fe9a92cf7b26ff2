use chromiumoxide::Page;
use retrace_engine::backend::DriverError;
use retrace_engine::protocol::{StepAction, StepDraft};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

pub(crate) const LOCATOR_JS: &str = include_str!("js/locator.js");
pub(crate) const RECORDER_JS: &str = include_str!("js/recorder.js");

/// Name of the CDP binding the recorder script calls.
pub(crate) const CAPTURE_BINDING: &str = "__retraceCapture";

/// Default timeout for JavaScript evaluation (10 seconds).
/// This prevents hanging when dialogs (alert/confirm/prompt) block the JS thread.
const EVAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum retries for context errors during page navigation.
const MAX_CONTEXT_RETRIES: u32 = 10;

/// Delay between retries when context is not found (page navigating).
const CONTEXT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Check if an error indicates the page context is unavailable (e.g., during navigation).
fn is_context_error(err: &str) -> bool {
    err.contains("Cannot find context")
        || err.contains("Execution context was destroyed")
        || err.contains("-32000")
}

/// Retry an async operation that may fail due to context errors during page navigation.
/// Returns immediately on success or non-context errors; retries only on context errors.
pub(crate) async fn retry_on_context_error<T, E, F, Fut>(
    operation_name: &str,
    mut operation: F,
) -> Result<T, DriverError>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_error = None;

    for attempt in 0..MAX_CONTEXT_RETRIES {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let err_str = e.to_string();
                if is_context_error(&err_str) {
                    tracing::debug!(
                        "{} context error (attempt {}/{}), retrying...",
                        operation_name,
                        attempt + 1,
                        MAX_CONTEXT_RETRIES
                    );
                    last_error = Some(err_str);
                    tokio::time::sleep(CONTEXT_RETRY_DELAY).await;
                    continue;
                }
                return Err(DriverError::Other(err_str));
            }
        }
    }

    Err(DriverError::Other(last_error.unwrap_or_else(|| {
        format!("{} failed after retries", operation_name)
    })))
}

enum EvalError {
    Timeout,
    Context(String),
    Other(String),
}

async fn evaluate_with_timeout(page: &Page, expression: &str) -> Result<Value, EvalError> {
    let eval_result = tokio::time::timeout(EVAL_TIMEOUT, page.evaluate(expression)).await;

    match eval_result {
        Err(_) => Err(EvalError::Timeout),
        Ok(Err(e)) => {
            let err_str = e.to_string();
            if is_context_error(&err_str) {
                Err(EvalError::Context(err_str))
            } else {
                Err(EvalError::Other(err_str))
            }
        }
        Ok(Ok(result)) => Ok(result.value().cloned().unwrap_or(Value::Null)),
    }
}

/// Make sure `window.__retrace` exists in the current document.
pub(crate) async fn ensure_helpers(page: &Page) -> Result<(), DriverError> {
    retry_on_context_error("Locator helper injection", || async {
        let loaded = page
            .evaluate("typeof window.__retrace !== 'undefined'")
            .await?
            .into_value::<bool>()
            .unwrap_or(false);
        if !loaded {
            page.evaluate(LOCATOR_JS).await?;
        }
        Ok::<_, chromiumoxide::error::CdpError>(())
    })
    .await
}

/// Evaluate an expression that uses the locator helpers, re-injecting them
/// whenever a navigation replaced the document.
pub(crate) async fn evaluate_helper(page: &Page, expression: &str) -> Result<Value, DriverError> {
    let mut last_error = None;

    for attempt in 0..MAX_CONTEXT_RETRIES {
        ensure_helpers(page).await?;

        match evaluate_with_timeout(page, expression).await {
            Ok(value) => return Ok(value),
            Err(EvalError::Timeout) => return Err(DriverError::Timeout(EVAL_TIMEOUT)),
            Err(EvalError::Context(err_str)) => {
                tracing::debug!(
                    "Context error during evaluation (attempt {}/{}), retrying...",
                    attempt + 1,
                    MAX_CONTEXT_RETRIES
                );
                last_error = Some(err_str);
                tokio::time::sleep(CONTEXT_RETRY_DELAY).await;
            }
            Err(EvalError::Other(err_str)) => {
                return Err(DriverError::Action(format!("Evaluation failed: {}", err_str)));
            }
        }
    }

    Err(DriverError::Other(last_error.unwrap_or_else(|| {
        "Evaluation failed after retries".to_string()
    })))
}

/// A JSON string literal, safe to splice into an expression.
pub(crate) fn js_string(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

#[derive(Debug, Deserialize)]
struct CapturedInteraction {
    #[serde(rename = "type")]
    kind: String,
    locator: String,
    #[serde(default)]
    value: Option<String>,
}

/// Turn a payload sent by the recorder script into a candidate step.
pub(crate) fn parse_capture(payload: &str) -> Option<StepDraft> {
    let captured: CapturedInteraction = serde_json::from_str(payload).ok()?;
    if captured.locator.trim().is_empty() {
        return None;
    }
    let action = match captured.kind.as_str() {
        "click" => StepAction::Click { double: false },
        "dblclick" => StepAction::Click { double: true },
        "fill" => StepAction::Fill {
            value: captured.value.unwrap_or_default(),
        },
        "select" => StepAction::Select {
            value: captured.value?,
        },
        _ => return None,
    };
    Some(StepDraft::new(action).with_locator(captured.locator))
}
