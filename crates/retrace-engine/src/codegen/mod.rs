//! Deterministic rendering of sessions into runnable artifacts.

pub mod ci;
pub mod report;
pub mod run_config;
pub mod script;

pub use ci::{CiPlatform, render_ci};
pub use report::{ReportFormat, render_report};
pub use run_config::render_run_config;
pub use script::render_script;

use retrace_common::error::RecorderError;
use retrace_common::protocol::Session;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Script,
    RunConfig,
    Ci(CiPlatform),
    Report(ReportFormat),
}

impl FromStr for ExportFormat {
    type Err = RecorderError;

    /// `script`, `config`, `ci:<platform>`, `report`, `report:json`, `report:markdown`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, tail) = match s.split_once(':') {
            Some((h, t)) => (h, Some(t)),
            None => (s, None),
        };
        match (head, tail) {
            ("script", None) => Ok(Self::Script),
            ("config", None) => Ok(Self::RunConfig),
            ("ci", Some(platform)) => Ok(Self::Ci(CiPlatform::from_name(platform)?)),
            ("report", None) | ("report", Some("json")) => Ok(Self::Report(ReportFormat::Json)),
            ("report", Some("markdown" | "md")) => Ok(Self::Report(ReportFormat::Markdown)),
            _ => Err(RecorderError::invalid_field(
                "format",
                format!("unknown export format '{s}'"),
            )),
        }
    }
}

/// A rendered file and the path it conventionally lives at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub content: String,
}

/// Lowercase, dash separated file stem derived from the session name.
pub fn slug(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "recording".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn script_file_name(session: &Session) -> String {
    format!("{}.spec.ts", slug(&session.name))
}

pub fn export(session: &Session, format: ExportFormat) -> Artifact {
    match format {
        ExportFormat::Script => Artifact {
            file_name: format!("tests/{}", script_file_name(session)),
            content: render_script(session),
        },
        ExportFormat::RunConfig => Artifact {
            file_name: "playwright.config.ts".to_string(),
            content: render_run_config(session),
        },
        ExportFormat::Ci(platform) => Artifact {
            file_name: platform.file_name().to_string(),
            content: render_ci(session, platform),
        },
        ExportFormat::Report(ReportFormat::Json) => Artifact {
            file_name: format!("{}.report.json", slug(&session.name)),
            content: render_report(session, ReportFormat::Json),
        },
        ExportFormat::Report(ReportFormat::Markdown) => Artifact {
            file_name: format!("{}.report.md", slug(&session.name)),
            content: render_report(session, ReportFormat::Markdown),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use retrace_common::protocol::{
        AssertionStrictness, Persistence, ScreenshotPolicy, SessionConfig, SessionMetadata,
        SessionStatus, Step, StepAction, WaitCondition,
    };
    use serde_json::Map;

    fn step(order: u64, action: StepAction, locator: Option<&str>, fallbacks: &[&str]) -> Step {
        Step {
            id: format!("step-{order}"),
            session_id: "s1".into(),
            description: action.describe(locator),
            action,
            locator: locator.map(String::from),
            created_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            fallbacks: fallbacks.iter().map(|s| s.to_string()).collect(),
            screenshot: None,
            metadata: Map::new(),
            order,
            persistence: Persistence::Stored,
        }
    }

    fn session(steps: Vec<Step>) -> Session {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        Session {
            id: "s1".into(),
            name: "Login Flow".into(),
            url: "https://example.com".into(),
            status: SessionStatus::Stopped,
            created_at: at,
            updated_at: at,
            steps,
            config: SessionConfig::default(),
            metadata: SessionMetadata::default(),
            persistence: Persistence::Stored,
        }
    }

    fn login_steps() -> Vec<Step> {
        vec![
            step(
                0,
                StepAction::Fill {
                    value: "alice".into(),
                },
                Some("#username"),
                &["[name=\"username\"]"],
            ),
            step(
                1,
                StepAction::Click { double: false },
                Some("#submit-button"),
                &["[data-testid=\"submit-button\"]", "role=button"],
            ),
        ]
    }

    #[test]
    fn script_is_byte_identical_across_renders() {
        let s = session(login_steps());
        assert_eq!(render_script(&s), render_script(&s));
    }

    #[test]
    fn script_tries_primary_then_fallbacks_in_order() {
        let out = render_script(&session(login_steps()));
        assert!(out.contains(
            "await (await healingLocator(page, [\"#submit-button\", \"[data-testid=\\\"submit-button\\\"]\", \"role=button\"])).click();"
        ));
        assert!(out.contains(".fill(\"alice\");"));
        assert!(out.starts_with("import { test, expect, Page, Locator }"));
    }

    #[test]
    fn appending_a_step_only_adds_its_block() {
        let before = render_script(&session(login_steps()));
        let mut steps = login_steps();
        steps.push(step(
            2,
            StepAction::Assertion {
                expected: "Welcome".into(),
            },
            Some("h1"),
            &[],
        ));
        let after = render_script(&session(steps));

        let tail = "  });\n});\n";
        let before_body = before.strip_suffix(tail).unwrap();
        assert!(after.starts_with(before_body));
        let added = &after[before_body.len()..after.len() - tail.len()];
        assert_eq!(
            added,
            "\n    // Step 3: Assert h1 has text 'Welcome'\n    await expect((await healingLocator(page, [\"h1\"]))).toHaveText(\"Welcome\");\n"
        );
    }

    #[test]
    fn unknown_kinds_render_inert() {
        let mut params = Map::new();
        params.insert("x".into(), serde_json::json!(3));
        let s = session(vec![step(
            0,
            StepAction::Unsupported {
                kind: "drag".into(),
                params,
            },
            None,
            &[],
        )]);
        let out = render_script(&s);
        assert!(out.contains("// unsupported step (unknown action): drag {\"x\":3}"));
    }

    #[test]
    fn each_kind_has_one_rule() {
        let mut s = session(vec![
            step(
                0,
                StepAction::Navigate {
                    url: "https://example.com/login".into(),
                },
                None,
                &[],
            ),
            step(
                1,
                StepAction::Select {
                    value: "NL".into(),
                },
                Some("#country"),
                &[],
            ),
            step(
                2,
                StepAction::Wait {
                    condition: WaitCondition::Url {
                        pattern: "**/home".into(),
                    },
                },
                None,
                &[],
            ),
            step(
                3,
                StepAction::Screenshot {
                    name: "home".into(),
                    full_page: true,
                },
                None,
                &[],
            ),
            step(
                4,
                StepAction::Assertion {
                    expected: "Hi".into(),
                },
                Some(".greeting"),
                &[],
            ),
        ]);
        s.config.assertion_strictness = AssertionStrictness::Lenient;
        let out = render_script(&s);
        assert!(out.contains("await page.goto(\"https://example.com/login\");"));
        assert!(out.contains(".selectOption(\"NL\");"));
        assert!(out.contains("await page.waitForURL(\"**/home\", { timeout: WAIT_TIMEOUT_MS });"));
        assert!(out.contains(
            "await page.screenshot({ path: \"screenshots/home.png\", fullPage: true });"
        ));
        assert!(out.contains(".toContainText(\"Hi\");"));
    }

    #[test]
    fn every_step_policy_adds_screenshots() {
        let mut s = session(login_steps());
        s.config.screenshot_policy = ScreenshotPolicy::EveryStep;
        let out = render_script(&s);
        assert!(out.contains("screenshots/step-001.png"));
        assert!(out.contains("screenshots/step-002.png"));
    }

    #[test]
    fn run_config_reflects_metadata() {
        let mut s = session(vec![]);
        s.metadata.headless = false;
        s.metadata.viewport.width = 1920;
        let out = render_run_config(&s);
        assert!(out.contains("headless: false,"));
        assert!(out.contains("viewport: { width: 1920, height: 720 },"));
        assert!(out.contains("screenshot: 'only-on-failure',"));
    }

    #[test]
    fn ci_platforms_are_keyed_by_name() {
        let s = session(vec![]);
        let gh = export(&s, "ci:github".parse().unwrap());
        assert_eq!(gh.file_name, ".github/workflows/retrace.yml");
        assert!(gh.content.contains("npx playwright test tests/login-flow.spec.ts"));
        assert!(gh.content.contains("\n  e2e:\n    runs-on: ubuntu-latest\n"));

        let jenkins = export(&s, "ci:jenkins".parse().unwrap());
        assert!(jenkins.content.starts_with("pipeline {\n  agent"));

        let err = "ci:travis".parse::<ExportFormat>().unwrap_err();
        assert_eq!(err.fields()[0].field, "platform");
    }

    #[test]
    fn report_formats() {
        let s = session(login_steps());
        let md = render_report(&s, ReportFormat::Markdown);
        assert!(md.contains("| 2 | click | `#submit-button` | 2 | Click #submit-button |"));
        let json: serde_json::Value =
            serde_json::from_str(&render_report(&s, ReportFormat::Json)).unwrap();
        assert_eq!(json["steps"][1]["fallback_count"], 2);
    }

    #[test]
    fn slug_is_filesystem_safe() {
        assert_eq!(slug("Login Flow"), "login-flow");
        assert_eq!(slug("  Checkout / Pay!! "), "checkout-pay");
        assert_eq!(slug("???"), "recording");
    }
}
