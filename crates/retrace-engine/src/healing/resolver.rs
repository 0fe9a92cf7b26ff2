//! Runtime locator resolution against a live document.

use crate::backend::{DriverBinding, DriverError};
use async_trait::async_trait;
use retrace_common::error::RecorderError;
use retrace_common::protocol::SessionConfig;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const PRIMARY_CONFIDENCE: f64 = 1.0;
pub const FALLBACK_CONFIDENCE: f64 = 0.8;
pub const UNRESOLVED_CONFIDENCE: f64 = 0.0;

/// Answer whether a locator matches something in the live document.
///
/// This is the only I/O the healing engine performs. Native bindings probe
/// through the driver; tests use in-memory documents.
#[async_trait]
pub trait LocatorProbe: Send + Sync {
    /// Returns `Ok(true)` if matched, `Ok(false)` if not found, or `Err` on failure.
    async fn probe(&self, locator: &str, timeout: Duration) -> Result<bool, ProbeError>;
}

#[derive(Debug, Clone, Error)]
pub enum ProbeError {
    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Invalid locator: {0}")]
    InvalidLocator(String),
}

impl From<DriverError> for ProbeError {
    fn from(e: DriverError) -> Self {
        ProbeError::Driver(e.to_string())
    }
}

/// Adapter that probes through a session's driver binding.
pub struct BindingProbe<'a> {
    binding: &'a dyn DriverBinding,
}

impl<'a> BindingProbe<'a> {
    pub fn new(binding: &'a dyn DriverBinding) -> Self {
        Self { binding }
    }
}

#[async_trait]
impl LocatorProbe for BindingProbe<'_> {
    async fn probe(&self, locator: &str, timeout: Duration) -> Result<bool, ProbeError> {
        Ok(self.binding.locate(locator, timeout).await?)
    }
}

/// Outcome of one resolution attempt. Runtime only, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealingResult {
    pub primary_resolved: bool,
    pub healed: bool,
    pub resolved_locator: Option<String>,
    pub confidence: f64,
    pub attempted: Vec<String>,
}

impl HealingResult {
    pub fn is_resolved(&self) -> bool {
        self.resolved_locator.is_some()
    }
}

async fn attempt<P: LocatorProbe + ?Sized>(probe: &P, locator: &str, per_attempt: Duration) -> bool {
    match tokio::time::timeout(per_attempt, probe.probe(locator, per_attempt)).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => {
            debug!(locator, error = %e, "locator probe failed");
            false
        }
        Err(_) => {
            debug!(locator, ?per_attempt, "locator probe timed out");
            false
        }
    }
}

/// Try the primary, then each fallback in order; the first match wins.
///
/// Performs a single pass. Retrying is the caller's job, see [`heal_with_retries`].
pub async fn resolve<P: LocatorProbe + ?Sized>(
    primary: &str,
    fallbacks: &[String],
    probe: &P,
    per_attempt: Duration,
) -> HealingResult {
    let mut attempted = vec![primary.to_string()];
    if attempt(probe, primary, per_attempt).await {
        return HealingResult {
            primary_resolved: true,
            healed: false,
            resolved_locator: Some(primary.to_string()),
            confidence: PRIMARY_CONFIDENCE,
            attempted,
        };
    }

    for fallback in fallbacks {
        attempted.push(fallback.clone());
        if attempt(probe, fallback, per_attempt).await {
            debug!(primary, fallback = %fallback, "healed locator");
            return HealingResult {
                primary_resolved: false,
                healed: true,
                resolved_locator: Some(fallback.clone()),
                confidence: FALLBACK_CONFIDENCE,
                attempted,
            };
        }
    }

    HealingResult {
        primary_resolved: false,
        healed: false,
        resolved_locator: None,
        confidence: UNRESOLVED_CONFIDENCE,
        attempted,
    }
}

/// Retry ceiling, per-attempt timeout and acceptance threshold for one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealingPolicy {
    pub per_attempt: Duration,
    pub max_attempts: u32,
    pub confidence_threshold: f64,
    pub retry_delay: Duration,
}

impl HealingPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            per_attempt: Duration::from_millis(config.fallback_timeout_ms),
            max_attempts: config.max_retries.max(1),
            confidence_threshold: config.confidence_threshold,
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Resolve with retries; anything short of an accepted match is terminal.
pub async fn heal_with_retries<P: LocatorProbe + ?Sized>(
    primary: &str,
    fallbacks: &[String],
    probe: &P,
    policy: &HealingPolicy,
) -> Result<HealingResult, RecorderError> {
    let mut tried = Vec::new();
    for attempt_no in 1..=policy.max_attempts {
        let result = resolve(primary, fallbacks, probe, policy.per_attempt).await;
        if result.is_resolved() && result.confidence >= policy.confidence_threshold {
            return Ok(result);
        }
        debug!(
            primary,
            attempt = attempt_no,
            confidence = result.confidence,
            "resolution not accepted"
        );
        for locator in result.attempted {
            if !tried.contains(&locator) {
                tried.push(locator);
            }
        }
        if attempt_no < policy.max_attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }
    Err(RecorderError::HealingExhausted {
        locator: primary.to_string(),
        attempts: policy.max_attempts,
        tried,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct StaticDocument {
        present: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl StaticDocument {
        fn with(present: &[&str]) -> Self {
            Self {
                present: present.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LocatorProbe for StaticDocument {
        async fn probe(&self, locator: &str, _timeout: Duration) -> Result<bool, ProbeError> {
            self.calls.lock().unwrap().push(locator.to_string());
            if locator == "!!" {
                return Err(ProbeError::InvalidLocator(locator.into()));
            }
            Ok(self.present.contains(locator))
        }
    }

    struct Hanging;

    #[async_trait]
    impl LocatorProbe for Hanging {
        async fn probe(&self, locator: &str, _timeout: Duration) -> Result<bool, ProbeError> {
            if locator == "#slow" {
                std::future::pending::<()>().await;
            }
            Ok(locator == "#fast")
        }
    }

    fn fallbacks(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn primary_hit_is_full_confidence() {
        let doc = StaticDocument::with(&["#a"]);
        let r = resolve("#a", &fallbacks(&["#b"]), &doc, Duration::from_millis(10)).await;
        assert!(r.primary_resolved);
        assert!(!r.healed);
        assert_eq!(r.confidence, PRIMARY_CONFIDENCE);
        assert_eq!(doc.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fallbacks_tried_in_order_until_first_hit() {
        let doc = StaticDocument::with(&["#c", "#d"]);
        let r = resolve(
            "#a",
            &fallbacks(&["!!", "#b", "#c", "#d"]),
            &doc,
            Duration::from_millis(10),
        )
        .await;
        assert!(r.healed);
        assert!(!r.primary_resolved);
        assert_eq!(r.resolved_locator.as_deref(), Some("#c"));
        assert_eq!(r.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(*doc.calls.lock().unwrap(), vec!["#a", "!!", "#b", "#c"]);
    }

    #[tokio::test]
    async fn nothing_resolved_is_zero_confidence() {
        let doc = StaticDocument::with(&[]);
        let r = resolve("#a", &fallbacks(&["#b"]), &doc, Duration::from_millis(10)).await;
        assert!(!r.healed);
        assert!(!r.primary_resolved);
        assert_eq!(r.confidence, UNRESOLVED_CONFIDENCE);
        assert_eq!(r.attempted, vec!["#a", "#b"]);
    }

    #[tokio::test]
    async fn hung_probe_counts_as_a_miss() {
        let r = resolve("#slow", &fallbacks(&["#fast"]), &Hanging, Duration::from_millis(20)).await;
        assert_eq!(r.resolved_locator.as_deref(), Some("#fast"));
        assert!(r.healed);
    }

    #[tokio::test]
    async fn retries_stop_at_ceiling_with_exhausted_error() {
        let doc = StaticDocument::with(&[]);
        let policy = HealingPolicy {
            per_attempt: Duration::from_millis(5),
            max_attempts: 3,
            confidence_threshold: 0.5,
            retry_delay: Duration::from_millis(1),
        };
        let err = heal_with_retries("#a", &fallbacks(&["#b"]), &doc, &policy)
            .await
            .unwrap_err();
        match err {
            RecorderError::HealingExhausted { attempts, tried, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(tried, vec!["#a", "#b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(doc.calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn fallback_below_threshold_is_rejected() {
        let doc = StaticDocument::with(&["#b"]);
        let policy = HealingPolicy {
            per_attempt: Duration::from_millis(5),
            max_attempts: 1,
            confidence_threshold: 0.9,
            retry_delay: Duration::from_millis(1),
        };
        let err = heal_with_retries("#a", &fallbacks(&["#b"]), &doc, &policy).await;
        assert!(matches!(err, Err(RecorderError::HealingExhausted { .. })));
    }
}
