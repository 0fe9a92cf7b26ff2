use retrace_engine::error::{ErrorReport, RecorderError};
use retrace_engine::event::SessionEvent;
use retrace_engine::protocol::{SessionId, Step, StepDraft, StepId, StepPatch};
use serde::{Deserialize, Serialize};

/// Requests a client may send over the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        session_id: SessionId,
    },
    Leave {
        session_id: SessionId,
    },
    AddStep {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        step: StepDraft,
    },
    UpdateStep {
        session_id: SessionId,
        step_id: StepId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        patch: StepPatch,
    },
    RemoveStep {
        session_id: SessionId,
        step_id: StepId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::AddStep { request_id, .. }
            | Self::UpdateStep { request_id, .. }
            | Self::RemoveStep { request_id, .. } => request_id.as_deref(),
            Self::Join { .. } | Self::Leave { .. } => None,
        }
    }
}

/// Everything the server pushes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Joined {
        session_id: SessionId,
    },
    Left {
        session_id: SessionId,
    },
    Event {
        event: SessionEvent,
    },
    /// A step mutation was accepted. `warnings` carries durable write failures.
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        step: Step,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<ErrorReport>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: ErrorReport,
    },
}

impl ServerMessage {
    pub fn error(request_id: Option<&str>, error: &RecorderError) -> Self {
        Self::Error {
            request_id: request_id.map(str::to_string),
            error: error.report(),
        }
    }
}
