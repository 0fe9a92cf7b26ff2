//! Replays a recorded session against a live binding, healing locators as it goes.

use crate::backend::{DriverBinding, DriverError};
use crate::codegen::slug;
use crate::healing::{BindingProbe, HealingPolicy, heal_with_retries};
use retrace_common::error::{ErrorCategory, ErrorReport, RecorderError};
use retrace_common::protocol::{
    ActionKind, AssertionStrictness, ScreenshotPolicy, Session, Step, StepAction, WaitCondition,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Where screenshots are written. Screenshots are skipped when unset.
    pub screenshot_dir: Option<PathBuf>,
    pub stop_on_failure: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            screenshot_dir: None,
            stop_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub step_id: String,
    pub action: String,
    pub resolved_locator: Option<String>,
    pub healed: bool,
    pub confidence: f64,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl StepOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none() && !self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub session_id: String,
    pub steps: Vec<StepOutcome>,
}

impl ReplayReport {
    pub fn passed(&self) -> usize {
        self.steps.iter().filter(|s| s.passed()).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.iter().filter(|s| s.error.is_some()).count()
    }

    pub fn healed(&self) -> usize {
        self.steps.iter().filter(|s| s.healed).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

fn driver_failure(e: DriverError) -> ErrorReport {
    RecorderError::DriverUnavailable(e.to_string()).report()
}

fn needs_element(step: &Step) -> bool {
    match &step.action {
        StepAction::Wait { condition } => {
            matches!(condition, WaitCondition::Visible | WaitCondition::Hidden)
        }
        action => action.kind().is_some_and(ActionKind::targets_element),
    }
}

fn text_matches(strictness: AssertionStrictness, expected: &str, actual: &str) -> bool {
    match strictness {
        AssertionStrictness::Strict => actual.trim() == expected.trim(),
        AssertionStrictness::Lenient => actual.contains(expected.trim()),
    }
}

async fn run_step(
    session: &Session,
    step: &Step,
    binding: &dyn DriverBinding,
    policy: &HealingPolicy,
    outcome: &mut StepOutcome,
) -> Result<(), ErrorReport> {
    if step.action.kind().is_none() {
        outcome.skipped = true;
        return Ok(());
    }

    let mut resolved = step.locator.clone();
    // Hidden elements are expected to be absent, so there is nothing to heal.
    let hidden_wait = matches!(
        step.action,
        StepAction::Wait {
            condition: WaitCondition::Hidden
        }
    );
    if needs_element(step) && !hidden_wait {
        let primary = step.locator.as_deref().ok_or_else(|| {
            RecorderError::invalid_field("locator", "required for this action").report()
        })?;
        let probe = BindingProbe::new(binding);
        let result = heal_with_retries(primary, &step.fallbacks, &probe, policy)
            .await
            .map_err(|e| e.report())?;
        if result.healed {
            info!(
                step_id = %step.id,
                primary,
                resolved = ?result.resolved_locator,
                "locator healed"
            );
        }
        outcome.healed = result.healed;
        outcome.confidence = result.confidence;
        resolved = result.resolved_locator;
    }
    outcome.resolved_locator = resolved.clone();

    let timeout = match &step.action {
        StepAction::Wait { condition } => match condition {
            WaitCondition::Timeout { ms } => Duration::from_millis(*ms),
            _ => Duration::from_millis(session.config.wait_timeout_ms),
        },
        _ => Duration::from_millis(session.config.fallback_timeout_ms),
    };

    if let StepAction::Assertion { expected } = &step.action {
        let locator = resolved.as_deref().unwrap_or_default();
        let actual = binding.read_text(locator).await.map_err(driver_failure)?;
        if !text_matches(session.config.assertion_strictness, expected, &actual) {
            return Err(ErrorReport {
                category: ErrorCategory::ValidationFailure,
                detail: format!("expected text '{expected}' but found '{}'", actual.trim()),
                fields: Vec::new(),
            });
        }
        return Ok(());
    }

    binding
        .perform(&step.action, resolved.as_deref(), timeout)
        .await
        .map_err(driver_failure)
}

async fn capture_screenshot(
    binding: &dyn DriverBinding,
    options: &ReplayOptions,
    session: &Session,
    index: usize,
) -> Option<String> {
    let dir = options.screenshot_dir.as_ref()?;
    let bytes = match binding.screenshot().await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "screenshot failed");
            return None;
        }
    };
    let path = dir.join(format!("{}-step-{:03}.png", slug(&session.name), index + 1));
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!(error = %e, "could not create screenshot directory");
        return None;
    }
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => Some(path.display().to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not write screenshot");
            None
        }
    }
}

/// Navigate to the session URL and execute each step in order.
///
/// Locator failures are recorded per step as `healing_exhausted`; a failed
/// initial navigation aborts the whole run.
pub async fn replay(
    session: &Session,
    binding: &dyn DriverBinding,
    options: &ReplayOptions,
) -> Result<ReplayReport, RecorderError> {
    binding
        .navigate(&session.url)
        .await
        .map_err(|e| RecorderError::DriverUnavailable(e.to_string()))?;

    let policy = HealingPolicy::from_config(&session.config);
    let mut report = ReplayReport {
        session_id: session.id.clone(),
        steps: Vec::with_capacity(session.steps.len()),
    };

    for (index, step) in session.steps.iter().enumerate() {
        let mut outcome = StepOutcome {
            index: index + 1,
            step_id: step.id.clone(),
            action: step.action.kind_name().to_string(),
            resolved_locator: None,
            healed: false,
            confidence: 0.0,
            skipped: false,
            error: None,
            screenshot: None,
        };
        let result = run_step(session, step, binding, &policy, &mut outcome).await;
        let failed = result.is_err();
        outcome.error = result.err();

        let wants_screenshot = match session.config.screenshot_policy {
            ScreenshotPolicy::EveryStep => true,
            ScreenshotPolicy::OnFailure => failed,
            ScreenshotPolicy::Never => false,
        };
        if wants_screenshot {
            outcome.screenshot = capture_screenshot(binding, options, session, index).await;
        }

        debug!(index = outcome.index, step_id = %step.id, failed, "replayed step");
        report.steps.push(outcome);
        if failed && options.stop_on_failure {
            break;
        }
    }

    info!(
        session_id = %session.id,
        passed = report.passed(),
        failed = report.failed(),
        healed = report.healed(),
        "replay finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NavigationResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use retrace_common::protocol::{Persistence, SessionConfig, SessionMetadata, SessionStatus};
    use serde_json::Map;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    struct PageDouble {
        present: HashSet<String>,
        text: HashMap<String, String>,
        performed: Mutex<Vec<(String, Option<String>)>>,
    }

    impl PageDouble {
        fn new(present: &[&str]) -> Self {
            Self {
                present: present.iter().map(|s| s.to_string()).collect(),
                text: HashMap::new(),
                performed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DriverBinding for PageDouble {
        async fn navigate(&self, url: &str) -> Result<NavigationResult, DriverError> {
            Ok(NavigationResult {
                url: url.into(),
                title: String::new(),
                status: 200,
            })
        }
        async fn start_capture(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn locate(&self, locator: &str, _timeout: Duration) -> Result<bool, DriverError> {
            Ok(self.present.contains(locator))
        }
        async fn perform(
            &self,
            action: &StepAction,
            locator: Option<&str>,
            _timeout: Duration,
        ) -> Result<(), DriverError> {
            self.performed
                .lock()
                .unwrap()
                .push((action.kind_name().to_string(), locator.map(String::from)));
            Ok(())
        }
        async fn read_text(&self, locator: &str) -> Result<String, DriverError> {
            self.text
                .get(locator)
                .cloned()
                .ok_or_else(|| DriverError::NoMatch(locator.into()))
        }
        async fn close(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    fn step(order: u64, action: StepAction, locator: Option<&str>, fallbacks: &[&str]) -> Step {
        Step {
            id: format!("step-{order}"),
            session_id: "s1".into(),
            description: String::new(),
            action,
            locator: locator.map(String::from),
            created_at: Utc::now(),
            fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
            screenshot: None,
            metadata: Map::new(),
            order,
            persistence: Persistence::Stored,
        }
    }

    fn session(steps: Vec<Step>) -> Session {
        Session {
            id: "s1".into(),
            name: "Login Flow".into(),
            url: "https://example.com".into(),
            status: SessionStatus::Stopped,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            steps,
            config: SessionConfig {
                max_retries: 1,
                fallback_timeout_ms: 50,
                ..SessionConfig::default()
            },
            metadata: SessionMetadata::default(),
            persistence: Persistence::Stored,
        }
    }

    #[tokio::test]
    async fn broken_primary_heals_to_fallback() {
        let page = PageDouble::new(&["[data-testid=\"submit-button\"]"]);
        let s = session(vec![step(
            0,
            StepAction::Click { double: false },
            Some("#submit-button"),
            &["[data-testid=\"submit-button\"]"],
        )]);

        let report = replay(&s, &page, &ReplayOptions::default()).await.unwrap();
        let outcome = &report.steps[0];
        assert!(outcome.healed);
        assert_eq!(outcome.confidence, 0.8);
        assert_eq!(
            outcome.resolved_locator.as_deref(),
            Some("[data-testid=\"submit-button\"]")
        );
        assert_eq!(
            page.performed.lock().unwrap()[0].1.as_deref(),
            Some("[data-testid=\"submit-button\"]")
        );
    }

    #[tokio::test]
    async fn exhausted_locator_stops_the_run() {
        let page = PageDouble::new(&[]);
        let s = session(vec![
            step(0, StepAction::Click { double: false }, Some("#gone"), &[]),
            step(1, StepAction::Click { double: false }, Some("#next"), &[]),
        ]);

        let report = replay(&s, &page, &ReplayOptions::default()).await.unwrap();
        assert_eq!(report.steps.len(), 1);
        assert_eq!(
            report.steps[0].error.as_ref().unwrap().category,
            ErrorCategory::HealingExhausted
        );
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn assertions_honour_strictness() {
        let mut page = PageDouble::new(&["h1"]);
        page.text.insert("h1".into(), "Welcome back, Alice".into());
        let assertion = || {
            step(
                0,
                StepAction::Assertion {
                    expected: "Welcome".into(),
                },
                Some("h1"),
                &[],
            )
        };

        let strict = session(vec![assertion()]);
        let report = replay(&strict, &page, &ReplayOptions::default()).await.unwrap();
        assert_eq!(report.failed(), 1);

        let mut lenient = session(vec![assertion()]);
        lenient.config.assertion_strictness = AssertionStrictness::Lenient;
        let report = replay(&lenient, &page, &ReplayOptions::default()).await.unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn unsupported_steps_are_skipped() {
        let page = PageDouble::new(&[]);
        let s = session(vec![step(
            0,
            StepAction::Unsupported {
                kind: "drag".into(),
                params: Map::new(),
            },
            None,
            &[],
        )]);
        let report = replay(&s, &page, &ReplayOptions::default()).await.unwrap();
        assert!(report.steps[0].skipped);
        assert!(report.is_success());
        assert!(page.performed.lock().unwrap().is_empty());
    }
}
