//! Recording session store.
//!
//! The store owns the canonical copy of every session it has seen. Each
//! session has its own writer lock; readers use a snapshot published after
//! every mutation. Durable writes are queued while the writer lock is held and
//! applied by a single background worker, so the mirror observes mutations in
//! the order they were accepted. Failed writes leave the entity `retrying` and
//! queue the session for a full rewrite by the reconciler.

mod capture;
pub mod durable;
pub mod sqlite;
mod worker;

pub use durable::{DurableError, DurableStore, MemoryDurableStore};
pub use sqlite::SqliteDurableStore;

use crate::backend::{BindingRequest, DriverBinding, DriverLauncher};
use crate::config::RetraceConfig;
use crate::config::schema::DefaultsConfig;
use crate::healing::generate_fallbacks;
use crate::notify::{Notifier, Subscription};
use chrono::Utc;
use retrace_common::error::{Mutation, RecorderError};
use retrace_common::event::{EventKind, SessionEvent};
use retrace_common::protocol::{
    Persistence, Session, SessionDraft, SessionId, SessionStatus, SessionSummary, SettingsPatch,
    Step, StepDraft, StepId, StepPatch, new_id,
};
use retrace_common::validation::{
    validate_session_draft, validate_settings_patch, validate_step_draft, validate_step_patch,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use worker::{DurableWorker, PendingWrite, WriteOp};

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How often dirty sessions are rewritten. `None` disables the background task.
    pub reconcile_interval: Option<Duration>,
    pub capture_capacity: usize,
    pub topic_capacity: usize,
    pub defaults: DefaultsConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&RetraceConfig::default())
    }
}

impl StoreOptions {
    pub fn from_config(config: &RetraceConfig) -> Self {
        let interval = config.store.reconcile_interval_ms;
        Self {
            reconcile_interval: (interval > 0).then(|| Duration::from_millis(interval)),
            capture_capacity: config.capture.channel_capacity.max(1),
            topic_capacity: config.store.topic_capacity,
            defaults: config.defaults.clone(),
        }
    }
}

struct LiveBinding {
    binding: Arc<dyn DriverBinding>,
    cancel: oneshot::Sender<()>,
    pump: JoinHandle<()>,
}

struct SlotState {
    session: Session,
    next_order: u64,
    live: Option<LiveBinding>,
    generation: u64,
    starting: bool,
    deleted: bool,
    revision: u64,
    session_revision: u64,
    step_revisions: HashMap<StepId, u64>,
}

impl SlotState {
    fn new(session: Session) -> Self {
        let next_order = session
            .steps
            .iter()
            .map(|s| s.order + 1)
            .max()
            .unwrap_or(0);
        Self {
            session,
            next_order,
            live: None,
            generation: 0,
            starting: false,
            deleted: false,
            revision: 0,
            session_revision: 0,
            step_revisions: HashMap::new(),
        }
    }

    fn ensure_alive(&self) -> Result<(), RecorderError> {
        if self.deleted {
            return Err(RecorderError::session_not_found(&self.session.id));
        }
        Ok(())
    }

    fn touch_session(&mut self) -> u64 {
        self.revision += 1;
        self.session_revision = self.revision;
        self.session.persistence = Persistence::Pending;
        self.session.updated_at = Utc::now();
        self.revision
    }

    fn touch_step(&mut self, step_id: &str) -> u64 {
        self.revision += 1;
        self.step_revisions.insert(step_id.to_string(), self.revision);
        self.session.updated_at = Utc::now();
        self.revision
    }

    fn step_index(&self, step_id: &str) -> Result<usize, RecorderError> {
        self.session
            .steps
            .iter()
            .position(|s| s.id == step_id)
            .ok_or_else(|| RecorderError::step_not_found(step_id))
    }

    /// Mark everything written at or before `revision` as stored.
    fn mark_stored_through(&mut self, revision: u64) {
        if self.session_revision <= revision {
            self.session.persistence = Persistence::Stored;
        }
        for step in &mut self.session.steps {
            let rev = self.step_revisions.get(&step.id).copied().unwrap_or(0);
            if rev <= revision {
                step.persistence = Persistence::Stored;
            }
        }
    }
}

struct SessionSlot {
    state: tokio::sync::Mutex<SlotState>,
    snapshot: RwLock<Arc<Session>>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        let snapshot = Arc::new(session.clone());
        Self {
            state: tokio::sync::Mutex::new(SlotState::new(session)),
            snapshot: RwLock::new(snapshot),
        }
    }

    fn snapshot(&self) -> Arc<Session> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, session: &Session) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(session.clone());
    }
}

/// What a queued write covers, so its acknowledgement lands on the right entity.
enum Target {
    Session,
    Step(StepId),
    Removal,
}

struct Pending {
    write: PendingWrite,
    target: Target,
    revision: u64,
}

struct StoreInner {
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    hydrating: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    tombstones: Mutex<HashSet<SessionId>>,
    dirty: Mutex<HashSet<SessionId>>,
    durable: DurableWorker,
    launcher: Option<Arc<dyn DriverLauncher>>,
    notifier: Arc<Notifier>,
    options: StoreOptions,
    reconciler: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    shut_down: AtomicBool,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the session store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Build a store around a durable mirror. Must be called inside a tokio
    /// runtime: the durable worker and reconciler are spawned here.
    pub fn new(
        durable: Arc<dyn DurableStore>,
        launcher: Option<Arc<dyn DriverLauncher>>,
        options: StoreOptions,
    ) -> Self {
        let inner = Arc::new(StoreInner {
            sessions: RwLock::new(HashMap::new()),
            hydrating: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            dirty: Mutex::new(HashSet::new()),
            durable: DurableWorker::spawn(durable),
            launcher,
            notifier: Arc::new(Notifier::new(options.topic_capacity)),
            options,
            reconciler: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        if let Some(interval) = inner.options.reconcile_interval {
            let handle = spawn_reconciler(Arc::downgrade(&inner), interval);
            *guard(&inner.reconciler) = Some(handle);
        }
        Self { inner }
    }

    pub fn notifier(&self) -> Arc<Notifier> {
        Arc::clone(&self.inner.notifier)
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        self.inner.notifier.join(session_id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.inner.notifier.leave(subscription)
    }

    pub fn launcher(&self) -> Option<Arc<dyn DriverLauncher>> {
        self.inner.launcher.clone()
    }

    pub fn capture_capacity(&self) -> usize {
        self.inner.options.capture_capacity
    }

    pub fn defaults(&self) -> &DefaultsConfig {
        &self.inner.options.defaults
    }

    fn notify(&self, session_id: &str, kind: EventKind) {
        self.inner
            .notifier
            .publish(SessionEvent::new(session_id, kind));
    }

    fn mark_dirty(&self, session_id: &str) {
        guard(&self.inner.dirty).insert(session_id.to_string());
    }

    /// Sessions waiting for a full rewrite.
    pub fn dirty_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = guard(&self.inner.dirty).iter().cloned().collect();
        ids.sort();
        ids
    }

    fn cached(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>, RecorderError> {
        if let Some(slot) = self.cached(session_id) {
            return Ok(slot);
        }
        self.hydrate(session_id).await
    }

    /// Single path from durable storage into memory. Concurrent callers for the
    /// same id wait on one load.
    async fn hydrate(&self, session_id: &str) -> Result<Arc<SessionSlot>, RecorderError> {
        let gate = guard(&self.inner.hydrating)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let result = {
            let _gate = gate.lock().await;
            self.hydrate_locked(session_id).await
        };
        let mut gates = guard(&self.inner.hydrating);
        if gates
            .get(session_id)
            .is_some_and(|g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) <= 2)
        {
            gates.remove(session_id);
        }
        result
    }

    async fn hydrate_locked(&self, session_id: &str) -> Result<Arc<SessionSlot>, RecorderError> {
        if let Some(slot) = self.cached(session_id) {
            return Ok(slot);
        }
        if guard(&self.inner.tombstones).contains(session_id) {
            return Err(RecorderError::session_not_found(session_id));
        }
        let loaded = self.inner.durable.load(session_id).await.map_err(|e| {
            warn!(session_id, error = %e, "hydration failed");
            RecorderError::DurableWrite(format!("could not load session {session_id}: {e}"))
        })?;
        let Some(mut session) = loaded else {
            return Err(RecorderError::session_not_found(session_id));
        };

        // No binding survives a restart.
        let interrupted = session.status.is_live();
        if interrupted {
            session.status = SessionStatus::Stopped;
            session.updated_at = Utc::now();
            session.persistence = Persistence::Retrying;
        }

        let slot = Arc::new(SessionSlot::new(session));
        {
            let mut sessions = self
                .inner
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if guard(&self.inner.tombstones).contains(session_id) {
                return Err(RecorderError::session_not_found(session_id));
            }
            sessions.insert(session_id.to_string(), Arc::clone(&slot));
        }
        if interrupted {
            info!(session_id, "interrupted recording hydrated as stopped");
            self.mark_dirty(session_id);
        }
        debug!(session_id, "hydrated session");
        Ok(slot)
    }

    /// Wait for a queued write and record its outcome on the entity it covers.
    async fn settle(
        &self,
        slot: &SessionSlot,
        session_id: &str,
        pending: Pending,
    ) -> Option<RecorderError> {
        let result = pending.write.wait().await;
        let persistence = if result.is_ok() {
            Persistence::Stored
        } else {
            Persistence::Retrying
        };
        {
            let mut state = slot.state.lock().await;
            let mut changed = false;
            match &pending.target {
                Target::Session => {
                    if state.session_revision == pending.revision {
                        state.session.persistence = persistence;
                        changed = true;
                    }
                }
                Target::Step(step_id) => {
                    if state.step_revisions.get(step_id) == Some(&pending.revision)
                        && let Some(step) = state.session.steps.iter_mut().find(|s| &s.id == step_id)
                    {
                        step.persistence = persistence;
                        changed = true;
                    }
                }
                Target::Removal => {}
            }
            if changed && !state.deleted {
                slot.publish(&state.session);
            }
        }
        let error = result.err()?;
        warn!(session_id, error = %error, "mirror write failed; queued for reconciliation");
        self.mark_dirty(session_id);
        let warning = RecorderError::DurableWrite(error.to_string());
        self.notify(
            session_id,
            EventKind::PersistenceWarning {
                error: warning.report(),
            },
        );
        Some(warning)
    }

    fn queue_session(&self, state: &mut SlotState) -> Pending {
        let revision = state.touch_session();
        let header = Session {
            steps: Vec::new(),
            ..state.session.clone()
        };
        Pending {
            write: self.inner.durable.enqueue(WriteOp::UpsertSession(header)),
            target: Target::Session,
            revision,
        }
    }

    fn queue_step(&self, state: &mut SlotState, index: usize) -> Pending {
        let step_id = state.session.steps[index].id.clone();
        let revision = state.touch_step(&step_id);
        state.session.steps[index].persistence = Persistence::Pending;
        let step = state.session.steps[index].clone();
        Pending {
            write: self.inner.durable.enqueue(WriteOp::UpsertStep(step)),
            target: Target::Step(step_id),
            revision,
        }
    }

    /// `session` is the state captured under the writer lock; only its
    /// persistence is updated once the write settles.
    async fn finish_session(
        &self,
        slot: &SessionSlot,
        session_id: &str,
        mut session: Session,
        pending: Pending,
    ) -> Mutation<Session> {
        let warning = self.settle(slot, session_id, pending).await;
        session.persistence = if warning.is_some() {
            Persistence::Retrying
        } else {
            Persistence::Stored
        };
        Mutation::with_warning(session, warning)
    }

    async fn finish_step(
        &self,
        slot: &SessionSlot,
        session_id: &str,
        mut step: Step,
        pending: Pending,
    ) -> Mutation<Step> {
        let warning = self.settle(slot, session_id, pending).await;
        step.persistence = if warning.is_some() {
            Persistence::Retrying
        } else {
            Persistence::Stored
        };
        Mutation::with_warning(step, warning)
    }

    pub async fn create_session(
        &self,
        draft: SessionDraft,
    ) -> Result<Mutation<Session>, RecorderError> {
        validate_session_draft(&draft)?;
        let now = Utc::now();
        let defaults = &self.inner.options.defaults;
        let session = Session {
            id: new_id(),
            name: draft.name.trim().to_string(),
            url: draft.url.trim().to_string(),
            status: SessionStatus::Created,
            created_at: now,
            updated_at: now,
            steps: Vec::new(),
            config: draft.config.unwrap_or_else(|| defaults.session.clone()),
            metadata: draft.metadata.unwrap_or_else(|| defaults.metadata.clone()),
            persistence: Persistence::Pending,
        };
        let session_id = session.id.clone();
        let slot = Arc::new(SessionSlot::new(session));

        let (session, pending) = {
            let mut state = slot.state.lock().await;
            self.inner
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session_id.clone(), Arc::clone(&slot));
            let pending = self.queue_session(&mut state);
            slot.publish(&state.session);
            (state.session.clone(), pending)
        };
        info!(session_id = %session_id, "session created");
        Ok(self
            .finish_session(&slot, &session_id, session, pending)
            .await)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Arc<Session>, RecorderError> {
        Ok(self.slot(session_id).await?.snapshot())
    }

    pub async fn list_steps(&self, session_id: &str) -> Result<Vec<Step>, RecorderError> {
        Ok(self.get_session(session_id).await?.steps.clone())
    }

    /// Every known session, merging the mirror with sessions held in memory.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RecorderError> {
        let mut merged: HashMap<SessionId, SessionSummary> = HashMap::new();
        match self.inner.durable.list().await {
            Ok(stored) => {
                for summary in stored {
                    merged.insert(summary.id.clone(), summary);
                }
            }
            Err(e) => warn!(error = %e, "listing stored sessions failed; using memory only"),
        }
        let slots: Vec<_> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for slot in slots {
            let summary = slot.snapshot().summary();
            merged.insert(summary.id.clone(), summary);
        }
        {
            let tombstones = guard(&self.inner.tombstones);
            merged.retain(|id, _| !tombstones.contains(id));
        }
        let mut out: Vec<_> = merged.into_values().collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Acquire a binding, navigate to the session URL and begin capturing.
    ///
    /// Driver failures leave the session `created` so the caller can retry.
    pub async fn start(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (metadata, url) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            if state.session.status != SessionStatus::Created {
                return Err(RecorderError::InvalidTransition {
                    from: state.session.status,
                    action: "start",
                });
            }
            if state.starting {
                return Err(RecorderError::DriverUnavailable(
                    "a start is already in progress for this session".into(),
                ));
            }
            state.starting = true;
            (state.session.metadata.clone(), state.session.url.clone())
        };

        let (capture_tx, capture_rx) = mpsc::channel(self.inner.options.capture_capacity);
        let request = BindingRequest {
            session_id: session_id.to_string(),
            metadata,
            capture: capture_tx,
        };
        let bound = self.open_binding(request, &url).await;

        let mut state = slot.state.lock().await;
        state.starting = false;
        let binding = bound?;
        if state.deleted || state.session.status != SessionStatus::Created {
            let err = if state.deleted {
                RecorderError::session_not_found(session_id)
            } else {
                RecorderError::InvalidTransition {
                    from: state.session.status,
                    action: "start",
                }
            };
            drop(state);
            close_quietly(session_id, binding.as_ref()).await;
            return Err(err);
        }

        state.generation += 1;
        let generation = state.generation;
        let (cancel, cancel_rx) = oneshot::channel();
        let pump = capture::spawn_pump(
            Arc::downgrade(&self.inner),
            session_id.to_string(),
            generation,
            capture_rx,
            cancel_rx,
        );
        state.live = Some(LiveBinding {
            binding,
            cancel,
            pump,
        });
        state.session.status = SessionStatus::Recording;
        let pending = self.queue_session(&mut state);
        slot.publish(&state.session);
        self.notify(
            session_id,
            EventKind::StatusChanged {
                status: SessionStatus::Recording,
            },
        );
        let session = state.session.clone();
        drop(state);

        info!(session_id, generation, "recording started");
        Ok(self.finish_session(&slot, session_id, session, pending).await)
    }

    async fn open_binding(
        &self,
        request: BindingRequest,
        url: &str,
    ) -> Result<Arc<dyn DriverBinding>, RecorderError> {
        let Some(launcher) = self.inner.launcher.clone() else {
            return Err(RecorderError::DriverUnavailable(
                "no browser driver is configured".into(),
            ));
        };
        let session_id = request.session_id.clone();
        let binding = launcher.bind(request).await.map_err(|e| {
            warn!(%session_id, error = %e, "could not acquire a browser context");
            RecorderError::DriverUnavailable(e.to_string())
        })?;
        let ready = match binding.navigate(url).await {
            Ok(nav) => {
                debug!(%session_id, url = %nav.url, status = nav.status, "navigated");
                binding.start_capture().await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            warn!(%session_id, error = %e, "binding failed to become ready");
            close_quietly(&session_id, binding.as_ref()).await;
            return Err(RecorderError::DriverUnavailable(e.to_string()));
        }
        Ok(binding)
    }

    async fn toggle(
        &self,
        session_id: &str,
        from: SessionStatus,
        to: SessionStatus,
        action: &'static str,
    ) -> Result<Mutation<Session>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (session, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            if state.session.status != from {
                return Err(RecorderError::InvalidTransition {
                    from: state.session.status,
                    action,
                });
            }
            state.session.status = to;
            let pending = self.queue_session(&mut state);
            slot.publish(&state.session);
            self.notify(session_id, EventKind::StatusChanged { status: to });
            (state.session.clone(), pending)
        };
        debug!(session_id, status = %to, "status changed");
        Ok(self.finish_session(&slot, session_id, session, pending).await)
    }

    pub async fn pause(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.toggle(
            session_id,
            SessionStatus::Recording,
            SessionStatus::Paused,
            "pause",
        )
        .await
    }

    pub async fn resume(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.toggle(
            session_id,
            SessionStatus::Paused,
            SessionStatus::Recording,
            "resume",
        )
        .await
    }

    /// Release the binding and end capture. Stopping twice is a no-op.
    pub async fn stop(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (session, pending, live) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            match state.session.status {
                SessionStatus::Stopped => {
                    return Ok(Mutation::clean(state.session.clone()));
                }
                SessionStatus::Recording | SessionStatus::Paused => {}
                from => {
                    return Err(RecorderError::InvalidTransition {
                        from,
                        action: "stop",
                    });
                }
            }
            state.generation += 1;
            let live = state.live.take();
            state.session.status = SessionStatus::Stopped;
            let pending = self.queue_session(&mut state);
            slot.publish(&state.session);
            self.notify(
                session_id,
                EventKind::StatusChanged {
                    status: SessionStatus::Stopped,
                },
            );
            (state.session.clone(), pending, live)
        };
        if let Some(live) = live {
            release(session_id, live).await;
        }
        info!(session_id, "recording stopped");
        Ok(self.finish_session(&slot, session_id, session, pending).await)
    }

    pub async fn complete(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (session, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            match state.session.status {
                SessionStatus::Completed => {
                    return Ok(Mutation::clean(state.session.clone()));
                }
                SessionStatus::Stopped => {}
                from => {
                    return Err(RecorderError::InvalidTransition {
                        from,
                        action: "complete",
                    });
                }
            }
            state.session.status = SessionStatus::Completed;
            let pending = self.queue_session(&mut state);
            slot.publish(&state.session);
            self.notify(
                session_id,
                EventKind::StatusChanged {
                    status: SessionStatus::Completed,
                },
            );
            (state.session.clone(), pending)
        };
        Ok(self.finish_session(&slot, session_id, session, pending).await)
    }

    /// Remove a session in any state, releasing its binding and every step.
    pub async fn delete(&self, session_id: &str) -> Result<Mutation<()>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (write, live) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            state.deleted = true;
            state.generation += 1;
            let live = state.live.take();
            {
                let mut sessions = self
                    .inner
                    .sessions
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                sessions.remove(session_id);
                guard(&self.inner.tombstones).insert(session_id.to_string());
            }
            let write = self
                .inner
                .durable
                .enqueue(WriteOp::DeleteSession(session_id.to_string()));
            self.notify(session_id, EventKind::SessionDeleted);
            (write, live)
        };
        self.inner.notifier.close_topic(session_id);
        if let Some(live) = live {
            release(session_id, live).await;
        }

        let warning = match write.wait().await {
            Ok(()) => {
                guard(&self.inner.tombstones).remove(session_id);
                guard(&self.inner.dirty).remove(session_id);
                None
            }
            Err(e) => {
                warn!(session_id, error = %e, "mirror delete failed; queued for reconciliation");
                self.mark_dirty(session_id);
                Some(RecorderError::DurableWrite(e.to_string()))
            }
        };
        info!(session_id, "session deleted");
        Ok(Mutation::with_warning((), warning))
    }

    fn materialize(state: &SlotState, draft: StepDraft) -> Step {
        let fallbacks = match (draft.locator.as_deref(), draft.action.kind()) {
            (Some(locator), Some(kind)) => {
                generate_fallbacks(locator, kind, &state.session.config.strategies)
            }
            _ => Vec::new(),
        };
        let description = draft
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| draft.action.describe(draft.locator.as_deref()));
        Step {
            id: new_id(),
            session_id: state.session.id.clone(),
            action: draft.action,
            locator: draft.locator,
            description,
            created_at: Utc::now(),
            fallbacks,
            screenshot: draft.screenshot,
            metadata: draft.metadata,
            order: state.next_order,
            persistence: Persistence::Pending,
        }
    }

    /// Append under the writer lock. Callers have already validated the draft.
    fn append(&self, slot: &SessionSlot, state: &mut SlotState, draft: StepDraft) -> (Step, Pending) {
        let step = Self::materialize(state, draft);
        state.next_order += 1;
        state.session.steps.push(step.clone());
        let index = state.session.steps.len() - 1;
        let pending = self.queue_step(state, index);
        slot.publish(&state.session);
        self.notify(
            &state.session.id,
            EventKind::StepAdded { step: step.clone() },
        );
        (step, pending)
    }

    pub async fn add_step(
        &self,
        session_id: &str,
        draft: StepDraft,
    ) -> Result<Mutation<Step>, RecorderError> {
        let slot = self.slot(session_id).await?;
        validate_step_draft(&draft)?;
        let (step, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            self.append(&slot, &mut state, draft)
        };
        debug!(session_id, step_id = %step.id, order = step.order, "step added");
        Ok(self.finish_step(&slot, session_id, step, pending).await)
    }

    /// Entry point for the capture pump. Rejected once the binding that
    /// produced the event has been retired.
    pub async fn add_captured_step(
        &self,
        session_id: &str,
        generation: u64,
        draft: StepDraft,
    ) -> Result<Mutation<Step>, RecorderError> {
        let slot = self.slot(session_id).await?;
        validate_step_draft(&draft)?;
        let (step, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            if state.generation != generation || state.live.is_none() {
                return Err(RecorderError::DriverUnavailable(
                    "capture binding is no longer active".into(),
                ));
            }
            if state.session.status != SessionStatus::Recording {
                return Err(RecorderError::InvalidTransition {
                    from: state.session.status,
                    action: "capture a step for",
                });
            }
            self.append(&slot, &mut state, draft)
        };
        Ok(self.finish_step(&slot, session_id, step, pending).await)
    }

    /// Current capture generation. Exposed for driver integrations and tests.
    pub async fn capture_generation(&self, session_id: &str) -> Result<u64, RecorderError> {
        let slot = self.slot(session_id).await?;
        let state = slot.state.lock().await;
        state.ensure_alive()?;
        Ok(state.generation)
    }

    /// The live binding of a recording or paused session.
    pub async fn binding(
        &self,
        session_id: &str,
    ) -> Result<Arc<dyn DriverBinding>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let state = slot.state.lock().await;
        state.ensure_alive()?;
        state
            .live
            .as_ref()
            .map(|live| Arc::clone(&live.binding))
            .ok_or_else(|| {
                RecorderError::DriverUnavailable(format!(
                    "session {session_id} has no active browser"
                ))
            })
    }

    pub async fn update_step(
        &self,
        session_id: &str,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<Mutation<Step>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (step, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            let index = state.step_index(step_id)?;
            let current = &state.session.steps[index];
            validate_step_patch(&patch, &current.action, current.locator.as_deref())?;

            let locator_changed = patch
                .locator
                .as_ref()
                .is_some_and(|l| current.locator.as_ref() != Some(l));
            let kind_changed = patch
                .action
                .as_ref()
                .is_some_and(|a| a.kind() != current.action.kind());
            let strategies = state.session.config.strategies.clone();

            let step = &mut state.session.steps[index];
            if let Some(action) = patch.action {
                step.action = action;
            }
            if let Some(locator) = patch.locator {
                step.locator = Some(locator);
            }
            if let Some(description) = patch.description {
                step.description = description;
            }
            if let Some(screenshot) = patch.screenshot {
                step.screenshot = Some(screenshot);
            }
            if let Some(metadata) = patch.metadata {
                step.metadata = metadata;
            }
            if locator_changed || kind_changed {
                step.fallbacks = match (step.locator.as_deref(), step.action.kind()) {
                    (Some(locator), Some(kind)) => generate_fallbacks(locator, kind, &strategies),
                    _ => Vec::new(),
                };
            }

            let pending = self.queue_step(&mut state, index);
            let step = state.session.steps[index].clone();
            slot.publish(&state.session);
            self.notify(session_id, EventKind::StepUpdated { step: step.clone() });
            (step, pending)
        };
        debug!(session_id, step_id, "step updated");
        Ok(self.finish_step(&slot, session_id, step, pending).await)
    }

    pub async fn remove_step(
        &self,
        session_id: &str,
        step_id: &str,
    ) -> Result<Mutation<Step>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (step, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            let index = state.step_index(step_id)?;
            let step = state.session.steps.remove(index);
            state.step_revisions.remove(step_id);
            state.revision += 1;
            state.session.updated_at = Utc::now();
            let write = self.inner.durable.enqueue(WriteOp::DeleteStep {
                session_id: session_id.to_string(),
                step_id: step_id.to_string(),
            });
            slot.publish(&state.session);
            self.notify(
                session_id,
                EventKind::StepRemoved {
                    step_id: step_id.to_string(),
                },
            );
            let pending = Pending {
                write,
                target: Target::Removal,
                revision: state.revision,
            };
            (step, pending)
        };
        debug!(session_id, step_id, "step removed");
        Ok(self.finish_step(&slot, session_id, step, pending).await)
    }

    /// Apply a partial settings update. Existing fallbacks keep the strategies
    /// they were generated with.
    pub async fn update_settings(
        &self,
        session_id: &str,
        patch: SettingsPatch,
    ) -> Result<Mutation<Session>, RecorderError> {
        let slot = self.slot(session_id).await?;
        let (session, pending) = {
            let mut state = slot.state.lock().await;
            state.ensure_alive()?;
            validate_settings_patch(&patch, &state.session.config)?;
            state.session.config = patch.apply(&state.session.config);
            if let Some(metadata) = patch.metadata {
                state.session.metadata = metadata;
            }
            let pending = self.queue_session(&mut state);
            slot.publish(&state.session);
            self.notify(
                session_id,
                EventKind::SettingsUpdated {
                    config: state.session.config.clone(),
                    metadata: state.session.metadata.clone(),
                },
            );
            (state.session.clone(), pending)
        };
        Ok(self.finish_session(&slot, session_id, session, pending).await)
    }

    /// Rewrite every dirty session in full. Returns how many were reconciled.
    pub async fn reconcile(&self) -> usize {
        let ids: Vec<SessionId> = guard(&self.inner.dirty).drain().collect();
        let mut reconciled = 0;
        for session_id in ids {
            let tombstoned = guard(&self.inner.tombstones).contains(&session_id);
            let ok = match self.cached(&session_id) {
                Some(slot) => self.rewrite(&slot, &session_id).await,
                None if tombstoned => {
                    let write = self
                        .inner
                        .durable
                        .enqueue(WriteOp::DeleteSession(session_id.clone()));
                    let ok = write.wait().await.is_ok();
                    if ok {
                        guard(&self.inner.tombstones).remove(&session_id);
                    }
                    ok
                }
                None => true,
            };
            if ok {
                reconciled += 1;
            } else {
                self.mark_dirty(&session_id);
            }
        }
        if reconciled > 0 {
            debug!(reconciled, "reconciled sessions");
        }
        reconciled
    }

    async fn rewrite(&self, slot: &SessionSlot, session_id: &str) -> bool {
        let (write, revision) = {
            let state = slot.state.lock().await;
            if state.deleted {
                return true;
            }
            let write = self
                .inner
                .durable
                .enqueue(WriteOp::ReplaceSession(state.session.clone()));
            (write, state.revision)
        };
        match write.wait().await {
            Ok(()) => {
                let mut state = slot.state.lock().await;
                state.mark_stored_through(revision);
                if !state.deleted {
                    slot.publish(&state.session);
                }
                true
            }
            Err(e) => {
                warn!(session_id, error = %e, "reconciliation failed");
                false
            }
        }
    }

    /// Stop every live session, flush pending reconciliation, close engines
    /// and the durable worker. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let reconciler = guard(&self.inner.reconciler).take();
        if let Some((stop, join)) = reconciler {
            let _ = stop.send(());
            let _ = join.await;
        }

        let slots: Vec<(SessionId, Arc<SessionSlot>)> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        for (session_id, slot) in slots {
            let live = slot.snapshot().status.is_live();
            if live && let Err(e) = self.stop(&session_id).await {
                warn!(session_id = %session_id, error = %e, "could not stop session during shutdown");
            }
        }

        self.reconcile().await;
        if let Some(launcher) = &self.inner.launcher
            && let Err(e) = launcher.shutdown().await
        {
            warn!(error = %e, "driver shutdown failed");
        }
        self.inner.durable.close().await;
        info!("session store shut down");
    }
}

async fn close_quietly(session_id: &str, binding: &dyn DriverBinding) {
    if let Err(e) = binding.close().await {
        warn!(session_id, error = %e, "closing browser context failed");
    }
}

async fn release(session_id: &str, live: LiveBinding) {
    let _ = live.cancel.send(());
    close_quietly(session_id, live.binding.as_ref()).await;
    if let Err(e) = live.pump.await {
        warn!(session_id, error = %e, "capture pump ended abnormally");
    }
}

fn spawn_reconciler(
    store: std::sync::Weak<StoreInner>,
    interval: Duration,
) -> (oneshot::Sender<()>, JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = oneshot::channel();
    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = store.upgrade() else {
                break;
            };
            SessionStore { inner }.reconcile().await;
        }
    });
    (stop_tx, join)
}
