use async_trait::async_trait;
use retrace_common::protocol::{SessionId, SessionMetadata, StepAction, StepDraft};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct NavigationResult {
    pub url: String,
    pub title: String,
    pub status: u16,
}

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("Driver not ready")]
    NotReady,

    #[error("Launch failed: {0}")]
    Launch(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Locator '{0}' matched no element")]
    NoMatch(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Driver error: {0}")]
    Other(String),
}

/// Signals a live binding pushes to the store while capture is active.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A user interaction that should become a step.
    Step(StepDraft),
    /// The main frame committed a navigation to `url`.
    Navigated { url: String },
    /// A console message from the page.
    Console { level: String, text: String },
    /// A page or driver failure observed outside any request.
    Error { message: String },
}

pub type CaptureSender = mpsc::Sender<CaptureEvent>;

/// Everything a launcher needs to bind a session to a browsing context.
#[derive(Debug, Clone)]
pub struct BindingRequest {
    pub session_id: SessionId,
    pub metadata: SessionMetadata,
    pub capture: CaptureSender,
}

/// One session's isolated browsing context.
///
/// Implementations must be safe to call from several tasks at once; the store
/// never holds a session lock across any of these calls.
#[async_trait]
pub trait DriverBinding: Send + Sync {
    /// Navigate the session's page to a URL.
    async fn navigate(&self, url: &str) -> Result<NavigationResult, DriverError>;

    /// Begin forwarding interaction events to the capture channel.
    async fn start_capture(&self) -> Result<(), DriverError>;

    /// Check whether a locator matches an element within `timeout`.
    async fn locate(&self, locator: &str, timeout: Duration) -> Result<bool, DriverError>;

    /// Perform a step action against a resolved locator.
    async fn perform(
        &self,
        action: &StepAction,
        locator: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    /// Read the visible text of the element matched by `locator`.
    async fn read_text(&self, _locator: &str) -> Result<String, DriverError> {
        Err(DriverError::NotSupported("read_text".into()))
    }

    /// Capture a screenshot of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Err(DriverError::NotSupported("screenshot".into()))
    }

    /// Tear down the browsing context. Must be idempotent.
    async fn close(&self) -> Result<(), DriverError>;
}

/// Owns browser engines and hands out per-session bindings.
#[async_trait]
pub trait DriverLauncher: Send + Sync {
    async fn bind(&self, request: BindingRequest) -> Result<Arc<dyn DriverBinding>, DriverError>;

    /// Close every engine. Called after all bindings have been released.
    async fn shutdown(&self) -> Result<(), DriverError>;
}
