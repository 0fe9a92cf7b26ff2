//! Single background task that applies durable operations in submission order.

use super::durable::{DurableError, DurableStore};
use retrace_common::protocol::{Session, SessionId, SessionSummary, Step, StepId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) enum WriteOp {
    UpsertSession(Session),
    UpsertStep(Step),
    DeleteStep {
        session_id: SessionId,
        step_id: StepId,
    },
    DeleteSession(SessionId),
    ReplaceSession(Session),
}

impl WriteOp {
    fn name(&self) -> &'static str {
        match self {
            Self::UpsertSession(_) => "upsert_session",
            Self::UpsertStep(_) => "upsert_step",
            Self::DeleteStep { .. } => "delete_step",
            Self::DeleteSession(_) => "delete_session",
            Self::ReplaceSession(_) => "replace_session",
        }
    }
}

enum DurableCmd {
    Write {
        op: WriteOp,
        reply: oneshot::Sender<Result<(), DurableError>>,
    },
    Load {
        session_id: SessionId,
        reply: oneshot::Sender<Result<Option<Session>, DurableError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<SessionSummary>, DurableError>>,
    },
}

/// Acknowledgement of a queued write.
pub(crate) struct PendingWrite {
    rx: Option<oneshot::Receiver<Result<(), DurableError>>>,
}

impl PendingWrite {
    pub(crate) async fn wait(self) -> Result<(), DurableError> {
        match self.rx {
            Some(rx) => rx.await.unwrap_or(Err(DurableError::WorkerStopped)),
            None => Err(DurableError::WorkerStopped),
        }
    }
}

pub(crate) struct DurableWorker {
    tx: Mutex<Option<mpsc::UnboundedSender<DurableCmd>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl DurableWorker {
    /// Spawn the worker on the current tokio runtime.
    pub(crate) fn spawn(store: Arc<dyn DurableStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DurableCmd>();
        let join = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    DurableCmd::Write { op, reply } => {
                        let name = op.name();
                        let result = apply(store.as_ref(), op).await;
                        if let Err(e) = &result {
                            warn!(op = name, error = %e, "durable write failed");
                        } else {
                            debug!(op = name, "durable write applied");
                        }
                        let _ = reply.send(result);
                    }
                    DurableCmd::Load { session_id, reply } => {
                        let _ = reply.send(store.load_session(&session_id).await);
                    }
                    DurableCmd::List { reply } => {
                        let _ = reply.send(store.list_sessions().await);
                    }
                }
            }
            debug!("durable worker drained");
        });
        Self {
            tx: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<DurableCmd>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, cmd: DurableCmd) -> bool {
        match self.sender().as_ref() {
            Some(tx) => tx.send(cmd).is_ok(),
            None => false,
        }
    }

    /// Queue a write without waiting. Writes are applied in the order queued.
    pub(crate) fn enqueue(&self, op: WriteOp) -> PendingWrite {
        let (reply, rx) = oneshot::channel();
        if self.submit(DurableCmd::Write { op, reply }) {
            PendingWrite { rx: Some(rx) }
        } else {
            PendingWrite { rx: None }
        }
    }

    /// Load through the queue so the read observes every earlier write.
    pub(crate) async fn load(&self, session_id: &str) -> Result<Option<Session>, DurableError> {
        let (reply, rx) = oneshot::channel();
        let cmd = DurableCmd::Load {
            session_id: session_id.to_string(),
            reply,
        };
        if !self.submit(cmd) {
            return Err(DurableError::WorkerStopped);
        }
        rx.await.unwrap_or(Err(DurableError::WorkerStopped))
    }

    pub(crate) async fn list(&self) -> Result<Vec<SessionSummary>, DurableError> {
        let (reply, rx) = oneshot::channel();
        if !self.submit(DurableCmd::List { reply }) {
            return Err(DurableError::WorkerStopped);
        }
        rx.await.unwrap_or(Err(DurableError::WorkerStopped))
    }

    /// Stop accepting work and wait for queued operations to finish.
    pub(crate) async fn close(&self) {
        drop(self.sender().take());
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join
            && let Err(e) = join.await
        {
            warn!(error = %e, "durable worker ended abnormally");
        }
    }
}

async fn apply(store: &dyn DurableStore, op: WriteOp) -> Result<(), DurableError> {
    match op {
        WriteOp::UpsertSession(session) => store.upsert_session(&session).await,
        WriteOp::UpsertStep(step) => store.upsert_step(&step).await,
        WriteOp::DeleteStep {
            session_id,
            step_id,
        } => store.delete_step(&session_id, &step_id).await,
        WriteOp::DeleteSession(session_id) => store.delete_session(&session_id).await,
        WriteOp::ReplaceSession(session) => store.replace_session(&session).await,
    }
}
