//! Pump that turns a binding's capture events into store mutations.

use super::{SessionStore, StoreInner};
use crate::backend::CaptureEvent;
use retrace_common::error::RecorderError;
use retrace_common::event::{EventKind, SessionEvent};
use retrace_common::protocol::{SessionId, StepAction, StepDraft, WaitCondition};
use std::sync::Weak;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(super) fn spawn_pump(
    store: Weak<StoreInner>,
    session_id: SessionId,
    generation: u64,
    mut events: mpsc::Receiver<CaptureEvent>,
    mut cancel: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = &mut cancel => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = store.upgrade() else {
                break;
            };
            let store = SessionStore { inner };
            if !handle(&store, &session_id, generation, event).await {
                break;
            }
        }
        debug!(%session_id, generation, "capture pump stopped");
    })
}

/// Returns false once the binding this pump serves is no longer current.
async fn handle(
    store: &SessionStore,
    session_id: &str,
    generation: u64,
    event: CaptureEvent,
) -> bool {
    let draft = match event {
        CaptureEvent::Step(draft) => draft,
        CaptureEvent::Navigated { url } => StepDraft::new(StepAction::Wait {
            condition: WaitCondition::Url { pattern: url },
        }),
        CaptureEvent::Console { level, text } => {
            info!(target: "retrace::console", session_id, level = %level, "{text}");
            return true;
        }
        CaptureEvent::Error { message } => {
            warn!(session_id, %message, "driver reported an error");
            store.inner.notifier.publish(SessionEvent::new(
                session_id,
                EventKind::DriverError { message },
            ));
            return true;
        }
    };

    match store.add_captured_step(session_id, generation, draft).await {
        Ok(mutation) => {
            debug!(session_id, step_id = %mutation.value.id, "captured step");
            true
        }
        Err(RecorderError::InvalidTransition { from, .. }) => {
            debug!(session_id, status = %from, "dropped captured step");
            true
        }
        Err(e @ (RecorderError::DriverUnavailable(_) | RecorderError::NotFound { .. })) => {
            debug!(session_id, error = %e, "capture binding retired");
            false
        }
        Err(e) => {
            warn!(session_id, error = %e, "rejected captured step");
            true
        }
    }
}
