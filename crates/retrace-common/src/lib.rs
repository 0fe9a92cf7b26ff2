pub mod error;
pub mod event;
pub mod protocol;
pub mod validation;

pub use error::{ErrorCategory, FieldError, Mutation, RecorderError};
