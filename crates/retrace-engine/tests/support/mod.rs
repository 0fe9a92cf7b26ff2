#![allow(dead_code)]

use async_trait::async_trait;
use retrace_engine::backend::{
    BindingRequest, CaptureEvent, CaptureSender, DriverBinding, DriverError, DriverLauncher,
    NavigationResult,
};
use retrace_engine::protocol::{Session, SessionSummary, Step, StepAction};
use retrace_engine::store::{
    DurableError, DurableStore, MemoryDurableStore, SessionStore, StoreOptions,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub struct MockBinding {
    pub session_id: String,
    pub capture: CaptureSender,
    pub navigations: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    pub capturing: AtomicBool,
    fail_navigation: bool,
}

impl MockBinding {
    pub async fn emit(&self, event: CaptureEvent) {
        self.capture.send(event).await.unwrap();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DriverBinding for MockBinding {
    async fn navigate(&self, url: &str) -> Result<NavigationResult, DriverError> {
        if self.fail_navigation {
            return Err(DriverError::Navigation(format!("net::ERR_NAME_NOT_RESOLVED {url}")));
        }
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(NavigationResult {
            url: url.to_string(),
            title: "Example".into(),
            status: 200,
        })
    }

    async fn start_capture(&self) -> Result<(), DriverError> {
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn locate(&self, _locator: &str, _timeout: Duration) -> Result<bool, DriverError> {
        Ok(true)
    }

    async fn perform(
        &self,
        _action: &StepAction,
        _locator: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockLauncher {
    pub bindings: Mutex<Vec<Arc<MockBinding>>>,
    pub fail_bind: AtomicBool,
    pub fail_navigation: AtomicBool,
    pub shutdowns: AtomicUsize,
}

impl MockLauncher {
    pub fn binding(&self, index: usize) -> Arc<MockBinding> {
        self.bindings.lock().unwrap()[index].clone()
    }

    pub fn last_binding(&self) -> Arc<MockBinding> {
        self.bindings.lock().unwrap().last().cloned().unwrap()
    }

    pub fn bound(&self) -> usize {
        self.bindings.lock().unwrap().len()
    }
}

#[async_trait]
impl DriverLauncher for MockLauncher {
    async fn bind(&self, request: BindingRequest) -> Result<Arc<dyn DriverBinding>, DriverError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(DriverError::Launch("chromium not found".into()));
        }
        let binding = Arc::new(MockBinding {
            session_id: request.session_id,
            capture: request.capture,
            navigations: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            fail_navigation: self.fail_navigation.load(Ordering::SeqCst),
        });
        self.bindings.lock().unwrap().push(binding.clone());
        Ok(binding)
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Memory mirror whose writes can be switched to fail.
#[derive(Default)]
pub struct FlakyDurable {
    pub inner: MemoryDurableStore,
    pub failing: AtomicBool,
    pub writes: AtomicUsize,
}

impl FlakyDurable {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DurableError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DurableError::Database("disk I/O error".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FlakyDurable {
    async fn upsert_session(&self, session: &Session) -> Result<(), DurableError> {
        self.check()?;
        self.inner.upsert_session(session).await
    }
    async fn upsert_step(&self, step: &Step) -> Result<(), DurableError> {
        self.check()?;
        self.inner.upsert_step(step).await
    }
    async fn delete_step(&self, session_id: &str, step_id: &str) -> Result<(), DurableError> {
        self.check()?;
        self.inner.delete_step(session_id, step_id).await
    }
    async fn delete_session(&self, session_id: &str) -> Result<(), DurableError> {
        self.check()?;
        self.inner.delete_session(session_id).await
    }
    async fn replace_session(&self, session: &Session) -> Result<(), DurableError> {
        self.check()?;
        self.inner.replace_session(session).await
    }
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, DurableError> {
        self.inner.load_session(session_id).await
    }
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DurableError> {
        self.inner.list_sessions().await
    }
}

/// Memory mirror whose writes can be held until released.
pub struct GatedDurable {
    pub inner: MemoryDurableStore,
    held: AtomicBool,
    gate: Semaphore,
    pub waiting: AtomicUsize,
}

impl GatedDurable {
    pub fn new() -> Self {
        Self {
            inner: MemoryDurableStore::new(),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn hold(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }

    async fn pass(&self) {
        if self.held.load(Ordering::SeqCst) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
    }
}

#[async_trait]
impl DurableStore for GatedDurable {
    async fn upsert_session(&self, session: &Session) -> Result<(), DurableError> {
        self.pass().await;
        self.inner.upsert_session(session).await
    }
    async fn upsert_step(&self, step: &Step) -> Result<(), DurableError> {
        self.pass().await;
        self.inner.upsert_step(step).await
    }
    async fn delete_step(&self, session_id: &str, step_id: &str) -> Result<(), DurableError> {
        self.pass().await;
        self.inner.delete_step(session_id, step_id).await
    }
    async fn delete_session(&self, session_id: &str) -> Result<(), DurableError> {
        self.pass().await;
        self.inner.delete_session(session_id).await
    }
    async fn replace_session(&self, session: &Session) -> Result<(), DurableError> {
        self.pass().await;
        self.inner.replace_session(session).await
    }
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, DurableError> {
        self.inner.load_session(session_id).await
    }
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DurableError> {
        self.inner.list_sessions().await
    }
}

pub fn options() -> StoreOptions {
    StoreOptions {
        reconcile_interval: None,
        ..StoreOptions::default()
    }
}

pub fn memory_store() -> (SessionStore, Arc<MemoryDurableStore>) {
    let durable = Arc::new(MemoryDurableStore::new());
    let store = SessionStore::new(durable.clone(), None, options());
    (store, durable)
}

pub fn flaky_store() -> (SessionStore, Arc<FlakyDurable>) {
    let durable = Arc::new(FlakyDurable::default());
    let store = SessionStore::new(durable.clone(), None, options());
    (store, durable)
}

pub fn gated_store() -> (SessionStore, Arc<GatedDurable>) {
    let durable = Arc::new(GatedDurable::new());
    let store = SessionStore::new(durable.clone(), None, options());
    (store, durable)
}

pub fn driven_store() -> (SessionStore, Arc<MockLauncher>, Arc<MemoryDurableStore>) {
    let durable = Arc::new(MemoryDurableStore::new());
    let launcher = Arc::new(MockLauncher::default());
    let store = SessionStore::new(durable.clone(), Some(launcher.clone()), options());
    (store, launcher, durable)
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
