//! Request/response surface over the session store.

use crate::backend::BindingRequest;
use crate::codegen::{self, Artifact, ExportFormat};
use crate::notify::Subscription;
use crate::replay::{self, ReplayOptions, ReplayReport};
use crate::store::SessionStore;
use retrace_common::error::{Mutation, RecorderError};
use retrace_common::protocol::{
    Session, SessionDraft, SessionSummary, SettingsPatch, Step, StepDraft, StepPatch,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Every operation a caller can request. Mutations return the materialized
/// entity plus any durable-write warnings.
#[derive(Clone)]
pub struct RecorderService {
    store: SessionStore,
}

impl RecorderService {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn create_session(
        &self,
        draft: SessionDraft,
    ) -> Result<Mutation<Session>, RecorderError> {
        self.store.create_session(draft).await
    }

    pub async fn start(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.store.start(session_id).await
    }

    pub async fn pause(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.store.pause(session_id).await
    }

    pub async fn resume(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.store.resume(session_id).await
    }

    pub async fn stop(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.store.stop(session_id).await
    }

    pub async fn complete(&self, session_id: &str) -> Result<Mutation<Session>, RecorderError> {
        self.store.complete(session_id).await
    }

    pub async fn delete(&self, session_id: &str) -> Result<Mutation<()>, RecorderError> {
        self.store.delete(session_id).await
    }

    pub async fn add_step(
        &self,
        session_id: &str,
        draft: StepDraft,
    ) -> Result<Mutation<Step>, RecorderError> {
        self.store.add_step(session_id, draft).await
    }

    pub async fn update_step(
        &self,
        session_id: &str,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<Mutation<Step>, RecorderError> {
        self.store.update_step(session_id, step_id, patch).await
    }

    pub async fn remove_step(
        &self,
        session_id: &str,
        step_id: &str,
    ) -> Result<Mutation<Step>, RecorderError> {
        self.store.remove_step(session_id, step_id).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Arc<Session>, RecorderError> {
        self.store.get_session(session_id).await
    }

    pub async fn list_steps(&self, session_id: &str) -> Result<Vec<Step>, RecorderError> {
        self.store.list_steps(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, RecorderError> {
        self.store.list_sessions().await
    }

    pub async fn update_settings(
        &self,
        session_id: &str,
        patch: SettingsPatch,
    ) -> Result<Mutation<Session>, RecorderError> {
        self.store.update_settings(session_id, patch).await
    }

    /// Render one artifact from the current snapshot. Never mutates the session.
    pub async fn export(
        &self,
        session_id: &str,
        format: ExportFormat,
    ) -> Result<Artifact, RecorderError> {
        let session = self.store.get_session(session_id).await?;
        Ok(codegen::export(&session, format))
    }

    /// Replay a session in a fresh browsing context, separate from any live recording.
    pub async fn replay(
        &self,
        session_id: &str,
        options: &ReplayOptions,
    ) -> Result<ReplayReport, RecorderError> {
        let session = self.store.get_session(session_id).await?;
        let launcher = self.store.launcher().ok_or_else(|| {
            RecorderError::DriverUnavailable("no browser driver is configured".into())
        })?;

        // Nothing reads the capture side; the binding never starts capturing.
        let (capture, _events) = mpsc::channel(1);
        let binding = launcher
            .bind(BindingRequest {
                session_id: format!("{session_id}-replay"),
                metadata: session.metadata.clone(),
                capture,
            })
            .await
            .map_err(|e| RecorderError::DriverUnavailable(e.to_string()))?;

        let report = replay::replay(&session, binding.as_ref(), options).await;
        if let Err(e) = binding.close().await {
            warn!(session_id, error = %e, "closing replay context failed");
        }
        if let Ok(report) = &report {
            info!(session_id, success = report.is_success(), "replay complete");
        }
        report
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        self.store.subscribe(session_id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        self.store.unsubscribe(subscription)
    }

    pub async fn shutdown(&self) {
        self.store.shutdown().await
    }
}
