use crate::protocol::SessionStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable, machine readable failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    ValidationFailure,
    InvalidTransition,
    DriverUnavailable,
    HealingExhausted,
    DurableWriteFailure,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ValidationFailure => "validation_failure",
            Self::InvalidTransition => "invalid_transition",
            Self::DriverUnavailable => "driver_unavailable",
            Self::HealingExhausted => "healing_exhausted",
            Self::DurableWriteFailure => "durable_write_failure",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Error)]
pub enum RecorderError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation failed: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("cannot {action} a session that is {from}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    #[error("driver unavailable: {0}")]
    DriverUnavailable(String),

    #[error("no locator resolved for '{locator}' after {attempts} attempt(s)")]
    HealingExhausted {
        locator: String,
        attempts: u32,
        tried: Vec<String>,
    },

    #[error("durable write failed: {0}")]
    DurableWrite(String),
}

impl RecorderError {
    pub fn session_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "session",
            id: id.to_string(),
        }
    }

    pub fn step_not_found(id: &str) -> Self {
        Self::NotFound {
            entity: "step",
            id: id.to_string(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Validation(_) => ErrorCategory::ValidationFailure,
            Self::InvalidTransition { .. } => ErrorCategory::InvalidTransition,
            Self::DriverUnavailable(_) => ErrorCategory::DriverUnavailable,
            Self::HealingExhausted { .. } => ErrorCategory::HealingExhausted,
            Self::DurableWrite(_) => ErrorCategory::DurableWriteFailure,
        }
    }

    /// Field level detail, present only for validation failures.
    pub fn fields(&self) -> &[FieldError] {
        match self {
            Self::Validation(fields) => fields,
            _ => &[],
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            detail: self.to_string(),
            fields: self.fields().to_vec(),
        }
    }
}

/// Wire form of a failure or warning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

/// Result of an accepted mutation. Warnings carry durable mirror failures;
/// the value is authoritative regardless.
#[derive(Debug, Clone)]
pub struct Mutation<T> {
    pub value: T,
    pub warnings: Vec<RecorderError>,
}

impl<T> Mutation<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(value: T, warning: Option<RecorderError>) -> Self {
        Self {
            value,
            warnings: warning.into_iter().collect(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Mutation<U> {
        Mutation {
            value: f(self.value),
            warnings: self.warnings,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }
}
