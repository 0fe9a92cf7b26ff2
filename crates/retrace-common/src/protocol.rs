use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub type SessionId = String;
pub type StepId = String;

/// Generate a fresh opaque identifier for sessions and steps.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Recording,
    Paused,
    Stopped,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Recording => "recording",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "recording" => Some(Self::Recording),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Whether a live driver binding is expected in this state.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Recording | Self::Paused)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named heuristics used to derive fallback locators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingStrategy {
    AttributeMatching,
    TextContentMatching,
    PositionalMatching,
    SemanticSimilarity,
    VisualMatching,
}

impl HealingStrategy {
    pub const ALL: [HealingStrategy; 5] = [
        HealingStrategy::AttributeMatching,
        HealingStrategy::TextContentMatching,
        HealingStrategy::PositionalMatching,
        HealingStrategy::SemanticSimilarity,
        HealingStrategy::VisualMatching,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AttributeMatching => "attribute_matching",
            Self::TextContentMatching => "text_content_matching",
            Self::PositionalMatching => "positional_matching",
            Self::SemanticSimilarity => "semantic_similarity",
            Self::VisualMatching => "visual_matching",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenshotPolicy {
    Never,
    #[default]
    OnFailure,
    EveryStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionStrictness {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_strategies")]
    pub strategies: Vec<HealingStrategy>,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
    #[serde(default)]
    pub screenshot_policy: ScreenshotPolicy,
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    #[serde(default)]
    pub assertion_strictness: AssertionStrictness,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            confidence_threshold: default_confidence_threshold(),
            max_retries: default_max_retries(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
            screenshot_policy: ScreenshotPolicy::default(),
            wait_timeout_ms: default_wait_timeout_ms(),
            assertion_strictness: AssertionStrictness::default(),
        }
    }
}

fn default_strategies() -> Vec<HealingStrategy> {
    vec![
        HealingStrategy::AttributeMatching,
        HealingStrategy::TextContentMatching,
        HealingStrategy::PositionalMatching,
        HealingStrategy::SemanticSimilarity,
    ]
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_max_retries() -> u32 {
    3
}

fn default_fallback_timeout_ms() -> u64 {
    5000
}

fn default_wait_timeout_ms() -> u64 {
    30000
}

/// Partial update of a session's configuration and metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategies: Option<Vec<HealingStrategy>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_policy: Option<ScreenshotPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion_strictness: Option<AssertionStrictness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

impl SettingsPatch {
    /// Apply the patch to a copy of `config`.
    pub fn apply(&self, config: &SessionConfig) -> SessionConfig {
        let mut next = config.clone();
        if let Some(strategies) = &self.strategies {
            next.strategies = strategies.clone();
        }
        if let Some(v) = self.confidence_threshold {
            next.confidence_threshold = v;
        }
        if let Some(v) = self.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = self.fallback_timeout_ms {
            next.fallback_timeout_ms = v;
        }
        if let Some(v) = self.screenshot_policy {
            next.screenshot_policy = v;
        }
        if let Some(v) = self.wait_timeout_ms {
            next.wait_timeout_ms = v;
        }
        if let Some(v) = self.assertion_strictness {
            next.assertion_strictness = v;
        }
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chromium => "chromium",
            Self::Firefox => "firefox",
            Self::Webkit => "webkit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub viewport: Viewport,
    #[serde(default)]
    pub browser: BrowserKind,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            viewport: Viewport::default(),
            browser: BrowserKind::default(),
            headless: default_headless(),
            user_agent: None,
        }
    }
}

fn default_headless() -> bool {
    true
}

/// Durability of an in-memory entity relative to its mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persistence {
    #[default]
    Pending,
    Stored,
    Retrying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Navigate,
    Click,
    Fill,
    Select,
    Wait,
    Assertion,
    Screenshot,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Navigate => "navigate",
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Select => "select",
            Self::Wait => "wait",
            Self::Assertion => "assertion",
            Self::Screenshot => "screenshot",
        }
    }

    /// Kinds that act on an element and therefore need a locator.
    pub fn targets_element(self) -> bool {
        matches!(
            self,
            Self::Click | Self::Fill | Self::Select | Self::Assertion
        )
    }

    pub fn is_interactive(self) -> bool {
        matches!(self, Self::Click | Self::Fill | Self::Select)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Load,
    DomContentLoaded,
    NetworkIdle,
}

impl LoadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::DomContentLoaded => "domcontentloaded",
            Self::NetworkIdle => "networkidle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    Timeout { ms: u64 },
    Visible,
    Hidden,
    LoadState {
        #[serde(default)]
        state: LoadState,
    },
    Url { pattern: String },
}

/// One action with its parameter schema.
///
/// `Unsupported` is never accepted from callers; it only appears for records
/// loaded from storage whose kind this build does not know.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    Navigate {
        url: String,
    },
    Click {
        #[serde(default)]
        double: bool,
    },
    Fill {
        value: String,
    },
    Select {
        value: String,
    },
    Wait {
        condition: WaitCondition,
    },
    Assertion {
        expected: String,
    },
    Screenshot {
        name: String,
        #[serde(default)]
        full_page: bool,
    },
    Unsupported {
        kind: String,
        #[serde(default)]
        params: Map<String, Value>,
    },
}

impl StepAction {
    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            Self::Navigate { .. } => Some(ActionKind::Navigate),
            Self::Click { .. } => Some(ActionKind::Click),
            Self::Fill { .. } => Some(ActionKind::Fill),
            Self::Select { .. } => Some(ActionKind::Select),
            Self::Wait { .. } => Some(ActionKind::Wait),
            Self::Assertion { .. } => Some(ActionKind::Assertion),
            Self::Screenshot { .. } => Some(ActionKind::Screenshot),
            Self::Unsupported { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &str {
        match self {
            Self::Unsupported { kind, .. } => kind,
            other => other.kind().map(ActionKind::as_str).unwrap_or("unsupported"),
        }
    }

    /// Action parameters without the kind tag, as stored in the mirror.
    pub fn params(&self) -> Map<String, Value> {
        if let Self::Unsupported { params, .. } = self {
            return params.clone();
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("action");
                map
            }
            _ => Map::new(),
        }
    }

    /// Rebuild an action from a stored kind and parameter map. Unknown kinds
    /// and parameter sets that no longer fit their schema are kept verbatim.
    pub fn from_record(kind: &str, params: Map<String, Value>) -> Self {
        let mut tagged = params.clone();
        tagged.insert("action".to_string(), Value::String(kind.to_string()));
        match serde_json::from_value::<StepAction>(Value::Object(tagged)) {
            Ok(StepAction::Unsupported { .. }) | Err(_) => StepAction::Unsupported {
                kind: kind.to_string(),
                params,
            },
            Ok(action) => action,
        }
    }

    /// Short human readable summary used when no description is given.
    pub fn describe(&self, locator: Option<&str>) -> String {
        let target = locator.unwrap_or("page");
        match self {
            Self::Navigate { url } => format!("Navigate to {url}"),
            Self::Click { double: true } => format!("Double-click {target}"),
            Self::Click { .. } => format!("Click {target}"),
            Self::Fill { .. } => format!("Fill {target}"),
            Self::Select { value } => format!("Select '{value}' in {target}"),
            Self::Wait { condition } => match condition {
                WaitCondition::Timeout { ms } => format!("Wait {ms} ms"),
                WaitCondition::Visible => format!("Wait for {target} to be visible"),
                WaitCondition::Hidden => format!("Wait for {target} to be hidden"),
                WaitCondition::LoadState { state } => {
                    format!("Wait for load state {}", state.as_str())
                }
                WaitCondition::Url { pattern } => format!("Wait for URL {pattern}"),
            },
            Self::Assertion { expected } => format!("Assert {target} has text '{expected}'"),
            Self::Screenshot { name, .. } => format!("Capture screenshot {name}"),
            Self::Unsupported { kind, .. } => format!("Unsupported action {kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub session_id: SessionId,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub order: u64,
    #[serde(default)]
    pub persistence: Persistence,
}

/// A step as submitted by a caller or the capture pipeline, before the store
/// assigns identity, order and fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StepDraft {
    pub fn new(action: StepAction) -> Self {
        Self {
            action,
            locator: None,
            description: None,
            screenshot: None,
            metadata: Map::new(),
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<StepAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub url: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub persistence: Persistence,
}

impl Session {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            status: self.status,
            step_count: self.steps.len(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDraft {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SessionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SessionMetadata>,
}

impl SessionDraft {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            config: None,
            metadata: None,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: String,
    pub url: String,
    pub status: SessionStatus,
    pub step_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_draft_parses_tagged_action() {
        let draft: StepDraft = serde_json::from_value(json!({
            "action": "fill",
            "value": "alice@example.com",
            "locator": "#email"
        }))
        .unwrap();
        assert_eq!(
            draft.action,
            StepAction::Fill {
                value: "alice@example.com".into()
            }
        );
        assert_eq!(draft.locator.as_deref(), Some("#email"));
    }

    #[test]
    fn unknown_action_is_rejected_by_serde() {
        let parsed = serde_json::from_value::<StepDraft>(json!({"action": "hover"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn from_record_keeps_unknown_kinds() {
        let mut params = Map::new();
        params.insert("x".into(), json!(10));
        let action = StepAction::from_record("drag", params.clone());
        assert_eq!(
            action,
            StepAction::Unsupported {
                kind: "drag".into(),
                params
            }
        );
        assert_eq!(action.kind_name(), "drag");
        assert!(action.kind().is_none());
    }

    #[test]
    fn params_strip_the_tag() {
        let action = StepAction::Screenshot {
            name: "home".into(),
            full_page: true,
        };
        let params = action.params();
        assert_eq!(params.get("name"), Some(&json!("home")));
        assert!(!params.contains_key("action"));
        assert_eq!(StepAction::from_record("screenshot", params), action);
    }

    #[test]
    fn settings_patch_only_touches_given_fields() {
        let config = SessionConfig::default();
        let patch = SettingsPatch {
            max_retries: Some(7),
            ..Default::default()
        };
        let next = patch.apply(&config);
        assert_eq!(next.max_retries, 7);
        assert_eq!(next.strategies, config.strategies);
        assert_eq!(next.fallback_timeout_ms, config.fallback_timeout_ms);
    }

    #[test]
    fn config_defaults_fill_missing_yaml_fields() {
        let config: SessionConfig = serde_yaml::from_str("max_retries: 1\n").unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.fallback_timeout_ms, 5000);
        assert_eq!(config.screenshot_policy, ScreenshotPolicy::OnFailure);
    }
}
