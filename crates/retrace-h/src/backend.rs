use crate::cdp::{BrowserPool, ContextLease, EngineKey};
use crate::inject::{
    CAPTURE_BINDING, RECORDER_JS, evaluate_helper, js_string, parse_capture,
    retry_on_context_error,
};
use async_trait::async_trait;
use chromiumoxide::Page;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat, EventFrameNavigated,
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, EventBindingCalled, EventConsoleApiCalled, EventExceptionThrown,
};
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use retrace_engine::backend::{
    BindingRequest, CaptureEvent, CaptureSender, DriverBinding, DriverError, DriverLauncher,
    NavigationResult,
};
use retrace_engine::config::schema::DriverConfig;
use retrace_engine::protocol::{LoadState, SessionId, SessionMetadata, StepAction, WaitCondition};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Hands out one isolated Chromium context per session from a shared pool.
pub struct ChromiumLauncher {
    pool: Arc<BrowserPool>,
}

impl ChromiumLauncher {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            pool: Arc::new(BrowserPool::new(config)),
        }
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }
}

#[async_trait]
impl DriverLauncher for ChromiumLauncher {
    async fn bind(&self, request: BindingRequest) -> Result<Arc<dyn DriverBinding>, DriverError> {
        let key = EngineKey {
            kind: request.metadata.browser,
            headless: request.metadata.headless,
        };
        let lease = self.pool.lease(key).await?;
        let binding = ChromiumBinding {
            session_id: request.session_id,
            pool: self.pool.clone(),
            page: lease.page.clone(),
            lease: Mutex::new(Some(lease)),
            capture: request.capture,
            listeners: Mutex::new(Vec::new()),
            capturing: AtomicBool::new(false),
        };
        if let Err(e) = binding.prepare(&request.metadata).await {
            binding.release().await;
            return Err(e);
        }
        info!(session_id = %binding.session_id, "browser context bound");
        Ok(Arc::new(binding))
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.pool.close_all().await;
        Ok(())
    }
}

/// A session's page inside its own browser context.
pub struct ChromiumBinding {
    session_id: SessionId,
    pool: Arc<BrowserPool>,
    page: Page,
    lease: Mutex<Option<ContextLease>>,
    capture: CaptureSender,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    capturing: AtomicBool,
}

impl ChromiumBinding {
    fn track(&self, task: JoinHandle<()>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }

    /// Viewport, user agent, dialog handling and console forwarding.
    async fn prepare(&self, metadata: &SessionMetadata) -> Result<(), DriverError> {
        let viewport = SetDeviceMetricsOverrideParams::new(
            i64::from(metadata.viewport.width),
            i64::from(metadata.viewport.height),
            1.0,
            false,
        );
        self.page
            .execute(viewport)
            .await
            .map_err(|e| DriverError::Launch(format!("Failed to set viewport: {}", e)))?;
        if let Some(user_agent) = &metadata.user_agent {
            self.page
                .execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await
                .map_err(|e| DriverError::Launch(format!("Failed to set user agent: {}", e)))?;
        }

        // Handle JavaScript Dialogs (Alert, Confirm, Prompt) - Auto-accept
        let mut dialog_events = self
            .page
            .event_listener::<EventJavascriptDialogOpening>()
            .await
            .map_err(|e| DriverError::Launch(format!("Failed to subscribe to dialog events: {}", e)))?;
        let page = self.page.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = dialog_events.next().await {
                info!(
                    "Handling JavaScript Dialog: {} ({:?})",
                    event.message, event.r#type
                );
                if let Err(e) = page.execute(HandleJavaScriptDialogParams::new(true)).await {
                    warn!("Failed to handle/accept dialog: {}", e);
                }
            }
        }));

        let mut console_events = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(|e| DriverError::Launch(format!("Failed to subscribe to console events: {}", e)))?;
        let capture = self.capture.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let text: Vec<String> = event
                    .args
                    .iter()
                    .map(|arg| {
                        arg.value
                            .as_ref()
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .or_else(|| arg.description.clone())
                            .unwrap_or_else(|| "unknown".to_string())
                    })
                    .collect();
                let level = format!("{:?}", event.r#type).to_ascii_lowercase();
                forward(&capture, CaptureEvent::Console {
                    level,
                    text: text.join(" "),
                })
                .await;
            }
        }));

        let mut exceptions = self
            .page
            .event_listener::<EventExceptionThrown>()
            .await
            .map_err(|e| DriverError::Launch(format!("Failed to subscribe to exceptions: {}", e)))?;
        let capture = self.capture.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = exceptions.next().await {
                let details = &event.exception_details;
                let message = details
                    .exception
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_else(|| details.text.clone());
                forward(&capture, CaptureEvent::Error { message }).await;
            }
        }));

        Ok(())
    }

    async fn release(&self) {
        for task in self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        let lease = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(lease) = lease {
            self.pool.release(lease).await;
            debug!(session_id = %self.session_id, "browser context released");
        }
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        let open = self
            .lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if open { Ok(()) } else { Err(DriverError::NotReady) }
    }

    async fn navigation_result(&self) -> Result<NavigationResult, DriverError> {
        let title = self
            .page
            .get_title()
            .await
            .unwrap_or_default()
            .unwrap_or_default();
        let url = self
            .page
            .url()
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?
            .unwrap_or_default();
        Ok(NavigationResult {
            url,
            title,
            status: 200,
        })
    }

    async fn helper_count(&self, locator: &str) -> Result<u64, DriverError> {
        let value = evaluate_helper(
            &self.page,
            &format!("window.__retrace.count({})", js_string(locator)),
        )
        .await?;
        Ok(value.as_u64().unwrap_or(0))
    }

    async fn helper_visible(&self, locator: &str) -> Result<bool, DriverError> {
        let value = evaluate_helper(
            &self.page,
            &format!("window.__retrace.visible({})", js_string(locator)),
        )
        .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn act(
        &self,
        locator: &str,
        kind: &str,
        value: &str,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        if !self.locate(locator, timeout).await? {
            return Err(DriverError::NoMatch(locator.to_string()));
        }
        let outcome = evaluate_helper(
            &self.page,
            &format!(
                "window.__retrace.act({}, {}, {})",
                js_string(locator),
                js_string(kind),
                js_string(value)
            ),
        )
        .await?;
        if outcome.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let reason = outcome
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown failure");
        Err(DriverError::Action(format!("{kind} on '{locator}': {reason}")))
    }

    async fn wait_for(&self, condition: &WaitCondition, locator: Option<&str>, timeout: Duration) -> Result<(), DriverError> {
        let reached = match condition {
            WaitCondition::Timeout { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                true
            }
            WaitCondition::Visible | WaitCondition::Hidden => {
                let locator = locator.ok_or_else(|| {
                    DriverError::Action("wait for element requires a locator".into())
                })?;
                let want = matches!(condition, WaitCondition::Visible);
                poll_until(timeout, || async move {
                    Ok(self.helper_visible(locator).await? == want)
                })
                .await?
            }
            WaitCondition::LoadState { state } => {
                let ready: &[&str] = match state {
                    LoadState::DomContentLoaded => &["interactive", "complete"],
                    LoadState::Load | LoadState::NetworkIdle => &["complete"],
                };
                let loaded = poll_until(timeout, || async move {
                    let value = evaluate_helper(&self.page, "document.readyState").await?;
                    Ok(value.as_str().is_some_and(|s| ready.contains(&s)))
                })
                .await?;
                if loaded && *state == LoadState::NetworkIdle {
                    // No request tracking; settle briefly after load.
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                loaded
            }
            WaitCondition::Url { pattern } => {
                poll_until(timeout, || async move {
                    let url = self
                        .page
                        .url()
                        .await
                        .map_err(|e| DriverError::Navigation(e.to_string()))?
                        .unwrap_or_default();
                    Ok(url == *pattern || url.contains(pattern.as_str()))
                })
                .await?
            }
        };
        if reached {
            Ok(())
        } else {
            Err(DriverError::Timeout(timeout))
        }
    }

    /// CDP binding, recorder script and navigation listener.
    async fn install_capture(&self) -> Result<(), DriverError> {
        let mut calls = self
            .page
            .event_listener::<EventBindingCalled>()
            .await
            .map_err(|e| DriverError::Other(format!("Failed to subscribe to bindings: {}", e)))?;
        self.page
            .execute(AddBindingParams::new(CAPTURE_BINDING))
            .await
            .map_err(|e| DriverError::Other(format!("Failed to add capture binding: {}", e)))?;
        // Survives navigations; the immediate evaluation covers the current document.
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(RECORDER_JS))
            .await
            .map_err(|e| DriverError::Other(format!("Failed to register recorder: {}", e)))?;
        retry_on_context_error("Recorder injection", || self.page.evaluate(RECORDER_JS)).await?;

        let capture = self.capture.clone();
        let session_id = self.session_id.clone();
        self.track(tokio::spawn(async move {
            while let Some(call) = calls.next().await {
                if call.name != CAPTURE_BINDING {
                    continue;
                }
                match parse_capture(&call.payload) {
                    Some(draft) => forward(&capture, CaptureEvent::Step(draft)).await,
                    None => debug!(%session_id, payload = %call.payload, "ignoring capture payload"),
                }
            }
        }));

        let mut navigations = self
            .page
            .event_listener::<EventFrameNavigated>()
            .await
            .map_err(|e| DriverError::Other(format!("Failed to subscribe to navigations: {}", e)))?;
        let capture = self.capture.clone();
        self.track(tokio::spawn(async move {
            while let Some(event) = navigations.next().await {
                if event.frame.parent_id.is_some() {
                    continue;
                }
                forward(&capture, CaptureEvent::Navigated {
                    url: event.frame.url.clone(),
                })
                .await;
            }
        }));

        info!(session_id = %self.session_id, "capture started");
        Ok(())
    }

    async fn screenshot_with(&self, full_page: bool) -> Result<Vec<u8>, DriverError> {
        self.ensure_open()?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| DriverError::Other(format!("Screenshot failed: {}", e)))
    }
}

/// Poll `check` until it holds or `timeout` elapses. Always checks at least once.
async fn poll_until<F, Fut>(timeout: Duration, mut check: F) -> Result<bool, DriverError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, DriverError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(true);
        }
        if Instant::now() + POLL_INTERVAL > deadline {
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn forward(capture: &CaptureSender, event: CaptureEvent) {
    if capture.send(event).await.is_err() {
        debug!("capture receiver gone, dropping page event");
    }
}

#[async_trait]
impl DriverBinding for ChromiumBinding {
    async fn navigate(&self, url: &str) -> Result<NavigationResult, DriverError> {
        self.ensure_open()?;
        info!(session_id = %self.session_id, "Navigating to: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        self.navigation_result().await
    }

    async fn start_capture(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        if self.capturing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let installed = self.install_capture().await;
        if installed.is_err() {
            self.capturing.store(false, Ordering::SeqCst);
        }
        installed
    }

    async fn locate(&self, locator: &str, timeout: Duration) -> Result<bool, DriverError> {
        self.ensure_open()?;
        poll_until(timeout, || async move { Ok(self.helper_count(locator).await? > 0) }).await
    }

    async fn perform(
        &self,
        action: &StepAction,
        locator: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.ensure_open()?;
        let target = || {
            locator.ok_or_else(|| {
                DriverError::Action(format!("{} requires a locator", action.kind_name()))
            })
        };
        match action {
            StepAction::Navigate { url } => self.navigate(url).await.map(|_| ()),
            StepAction::Click { double } => {
                let kind = if *double { "dblclick" } else { "click" };
                self.act(target()?, kind, "", timeout).await
            }
            StepAction::Fill { value } => self.act(target()?, "fill", value, timeout).await,
            StepAction::Select { value } => self.act(target()?, "select", value, timeout).await,
            StepAction::Wait { condition } => self.wait_for(condition, locator, timeout).await,
            StepAction::Assertion { .. } => {
                let locator = target()?;
                if self.locate(locator, timeout).await? {
                    Ok(())
                } else {
                    Err(DriverError::NoMatch(locator.to_string()))
                }
            }
            StepAction::Screenshot { full_page, .. } => {
                self.screenshot_with(*full_page).await.map(|_| ())
            }
            StepAction::Unsupported { kind, .. } => Err(DriverError::NotSupported(kind.clone())),
        }
    }

    async fn read_text(&self, locator: &str) -> Result<String, DriverError> {
        self.ensure_open()?;
        let value = evaluate_helper(
            &self.page,
            &format!("window.__retrace.text({})", js_string(locator)),
        )
        .await?;
        match value {
            Value::String(text) => Ok(text),
            _ => Err(DriverError::NoMatch(locator.to_string())),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.screenshot_with(false).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.release().await;
        Ok(())
    }
}
