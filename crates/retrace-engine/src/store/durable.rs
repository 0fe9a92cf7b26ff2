//! The durable mirror contract and an in-process implementation.

use async_trait::async_trait;
use retrace_common::protocol::{Persistence, Session, SessionSummary, Step};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DurableError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("durable worker stopped")]
    WorkerStopped,
}

impl From<serde_json::Error> for DurableError {
    fn from(e: serde_json::Error) -> Self {
        DurableError::Serialization(e.to_string())
    }
}

/// Storage for the mirror of sessions and steps.
///
/// Session writes carry only the session record; steps are written one row at
/// a time. `replace_session` rewrites a session and all its steps atomically.
/// Loaded steps must come back sorted by their order index.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn upsert_session(&self, session: &Session) -> Result<(), DurableError>;
    async fn upsert_step(&self, step: &Step) -> Result<(), DurableError>;
    async fn delete_step(&self, session_id: &str, step_id: &str) -> Result<(), DurableError>;
    async fn delete_session(&self, session_id: &str) -> Result<(), DurableError>;
    async fn replace_session(&self, session: &Session) -> Result<(), DurableError>;
    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, DurableError>;
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DurableError>;
}

/// Mark everything in a freshly loaded session as stored.
pub(crate) fn mark_loaded(mut session: Session) -> Session {
    session.persistence = Persistence::Stored;
    session.steps.sort_by_key(|s| s.order);
    for step in &mut session.steps {
        step.persistence = Persistence::Stored;
    }
    session
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, Session>,
    steps: HashMap<String, Step>,
}

/// Durable store kept in process memory. Used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryDurableStore {
    tables: Mutex<Tables>,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn step_rows(&self) -> usize {
        self.tables().steps.len()
    }

    pub fn step_rows_for(&self, session_id: &str) -> usize {
        self.tables()
            .steps
            .values()
            .filter(|s| s.session_id == session_id)
            .count()
    }

    pub fn contains_session(&self, session_id: &str) -> bool {
        self.tables().sessions.contains_key(session_id)
    }

    pub fn session_status(&self, session_id: &str) -> Option<String> {
        self.tables()
            .sessions
            .get(session_id)
            .map(|s| s.status.as_str().to_string())
    }
}

fn header(session: &Session) -> Session {
    Session {
        steps: Vec::new(),
        ..session.clone()
    }
}

#[async_trait]
impl DurableStore for MemoryDurableStore {
    async fn upsert_session(&self, session: &Session) -> Result<(), DurableError> {
        self.tables()
            .sessions
            .insert(session.id.clone(), header(session));
        Ok(())
    }

    async fn upsert_step(&self, step: &Step) -> Result<(), DurableError> {
        let mut tables = self.tables();
        if !tables.sessions.contains_key(&step.session_id) {
            return Err(DurableError::Constraint(format!(
                "step {} references missing session {}",
                step.id, step.session_id
            )));
        }
        tables.steps.insert(step.id.clone(), step.clone());
        Ok(())
    }

    async fn delete_step(&self, session_id: &str, step_id: &str) -> Result<(), DurableError> {
        let mut tables = self.tables();
        if tables
            .steps
            .get(step_id)
            .is_some_and(|s| s.session_id == session_id)
        {
            tables.steps.remove(step_id);
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.sessions.remove(session_id);
        tables.steps.retain(|_, s| s.session_id != session_id);
        Ok(())
    }

    async fn replace_session(&self, session: &Session) -> Result<(), DurableError> {
        let mut tables = self.tables();
        tables.steps.retain(|_, s| s.session_id != session.id);
        tables.sessions.insert(session.id.clone(), header(session));
        for step in &session.steps {
            tables.steps.insert(step.id.clone(), step.clone());
        }
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<Session>, DurableError> {
        let tables = self.tables();
        let Some(head) = tables.sessions.get(session_id) else {
            return Ok(None);
        };
        let mut session = head.clone();
        session.steps = tables
            .steps
            .values()
            .filter(|s| s.session_id == session_id)
            .cloned()
            .collect();
        Ok(Some(mark_loaded(session)))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, DurableError> {
        let tables = self.tables();
        Ok(tables
            .sessions
            .values()
            .map(|head| {
                let mut summary = head.summary();
                summary.step_count = tables
                    .steps
                    .values()
                    .filter(|s| s.session_id == head.id)
                    .count();
                summary
            })
            .collect())
    }
}
