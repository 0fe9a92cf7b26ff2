//! Boundary checks applied before any mutation reaches the store.

use crate::error::{FieldError, RecorderError};
use crate::protocol::{
    SessionConfig, SessionDraft, SettingsPatch, StepAction, StepDraft, StepPatch, WaitCondition,
};

const MAX_RETRIES: u32 = 20;
const MAX_NAME_LEN: usize = 200;

fn finish(errors: Vec<FieldError>) -> Result<(), RecorderError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(RecorderError::Validation(errors))
    }
}

fn check_http_url(field: &str, raw: &str, errors: &mut Vec<FieldError>) {
    match url::Url::parse(raw) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        Ok(parsed) => errors.push(FieldError::new(
            field,
            format!("unsupported scheme '{}'", parsed.scheme()),
        )),
        Err(e) => errors.push(FieldError::new(field, e.to_string())),
    }
}

fn check_config(prefix: &str, config: &SessionConfig, errors: &mut Vec<FieldError>) {
    if !(0.0..=1.0).contains(&config.confidence_threshold) {
        errors.push(FieldError::new(
            format!("{prefix}confidence_threshold"),
            "must be between 0.0 and 1.0",
        ));
    }
    if config.max_retries == 0 || config.max_retries > MAX_RETRIES {
        errors.push(FieldError::new(
            format!("{prefix}max_retries"),
            format!("must be between 1 and {MAX_RETRIES}"),
        ));
    }
    if config.fallback_timeout_ms == 0 {
        errors.push(FieldError::new(
            format!("{prefix}fallback_timeout_ms"),
            "must be positive",
        ));
    }
    if config.wait_timeout_ms == 0 {
        errors.push(FieldError::new(
            format!("{prefix}wait_timeout_ms"),
            "must be positive",
        ));
    }
}

pub fn validate_session_draft(draft: &SessionDraft) -> Result<(), RecorderError> {
    let mut errors = Vec::new();
    let name = draft.name.trim();
    if name.is_empty() {
        errors.push(FieldError::new("name", "must not be empty"));
    } else if name.len() > MAX_NAME_LEN {
        errors.push(FieldError::new(
            "name",
            format!("must be at most {MAX_NAME_LEN} characters"),
        ));
    }
    check_http_url("url", &draft.url, &mut errors);
    if let Some(config) = &draft.config {
        check_config("config.", config, &mut errors);
    }
    finish(errors)
}

fn check_action(action: &StepAction, locator: Option<&str>, errors: &mut Vec<FieldError>) {
    let Some(kind) = action.kind() else {
        errors.push(FieldError::new(
            "action",
            format!("unsupported action kind '{}'", action.kind_name()),
        ));
        return;
    };

    let has_locator = locator.is_some_and(|l| !l.trim().is_empty());
    let needs_locator = kind.targets_element()
        || matches!(
            action,
            StepAction::Wait {
                condition: WaitCondition::Visible | WaitCondition::Hidden
            }
        );
    if needs_locator && !has_locator {
        errors.push(FieldError::new(
            "locator",
            format!("required for {} steps", kind.as_str()),
        ));
    }
    if locator.is_some_and(|l| l.trim().is_empty()) {
        errors.push(FieldError::new("locator", "must not be blank"));
    }

    match action {
        StepAction::Navigate { url } => check_http_url("url", url, errors),
        StepAction::Wait {
            condition: WaitCondition::Timeout { ms },
        } if *ms == 0 => errors.push(FieldError::new("condition.ms", "must be positive")),
        StepAction::Wait {
            condition: WaitCondition::Url { pattern },
        } if pattern.is_empty() => {
            errors.push(FieldError::new("condition.pattern", "must not be empty"))
        }
        StepAction::Screenshot { name, .. } => {
            if name.is_empty() {
                errors.push(FieldError::new("name", "must not be empty"));
            } else if name.contains(['/', '\\']) || name.contains("..") {
                errors.push(FieldError::new("name", "must be a plain file name"));
            }
        }
        _ => {}
    }
}

pub fn validate_step_draft(draft: &StepDraft) -> Result<(), RecorderError> {
    let mut errors = Vec::new();
    check_action(&draft.action, draft.locator.as_deref(), &mut errors);
    finish(errors)
}

/// Validate a patch against the step it would produce.
pub fn validate_step_patch(
    patch: &StepPatch,
    current_action: &StepAction,
    current_locator: Option<&str>,
) -> Result<(), RecorderError> {
    let mut errors = Vec::new();
    let action = patch.action.as_ref().unwrap_or(current_action);
    let locator = patch.locator.as_deref().or(current_locator);
    check_action(action, locator, &mut errors);
    finish(errors)
}

pub fn validate_settings_patch(
    patch: &SettingsPatch,
    current: &SessionConfig,
) -> Result<(), RecorderError> {
    let mut errors = Vec::new();
    check_config("", &patch.apply(current), &mut errors);
    if let Some(metadata) = &patch.metadata
        && (metadata.viewport.width == 0 || metadata.viewport.height == 0)
    {
        errors.push(FieldError::new("metadata.viewport", "must be non-zero"));
    }
    finish(errors)
}
