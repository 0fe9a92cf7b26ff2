use crate::error::ErrorReport;
use crate::protocol::{SessionConfig, SessionId, SessionMetadata, SessionStatus, Step, StepId};
use serde::{Deserialize, Serialize};

/// Notification emitted on a session's topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<SessionId>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StepAdded {
        step: Step,
    },
    StepUpdated {
        step: Step,
    },
    StepRemoved {
        step_id: StepId,
    },
    SettingsUpdated {
        config: SessionConfig,
        metadata: SessionMetadata,
    },
    StatusChanged {
        status: SessionStatus,
    },
    SessionDeleted,
    /// Driver-side failure observed outside any request.
    DriverError {
        message: String,
    },
    /// A mutation was accepted but its durable mirror write failed.
    PersistenceWarning {
        error: ErrorReport,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::StepAdded { .. } => "step_added",
            Self::StepUpdated { .. } => "step_updated",
            Self::StepRemoved { .. } => "step_removed",
            Self::SettingsUpdated { .. } => "settings_updated",
            Self::StatusChanged { .. } => "status_changed",
            Self::SessionDeleted => "session_deleted",
            Self::DriverError { .. } => "driver_error",
            Self::PersistenceWarning { .. } => "persistence_warning",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_flat_tag() {
        let event = SessionEvent::new(
            "s1",
            EventKind::StatusChanged {
                status: SessionStatus::Recording,
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"session_id": "s1", "event": "status_changed", "status": "recording"})
        );
        assert_eq!(event.name(), "status_changed");
    }
}
