//! Playwright test rendering.
//!
//! Output is a pure function of the session: no clocks, counters or map
//! iteration order leak into it. The header depends only on name, URL and
//! configuration, so appending a step appends exactly one block.

use retrace_common::protocol::{
    AssertionStrictness, ScreenshotPolicy, Session, Step, StepAction, WaitCondition,
};
use std::fmt::Write;

const HELPER: &str = r#"async function healingLocator(page: Page, candidates: string[], timeout = FALLBACK_TIMEOUT_MS): Promise<Locator> {
  for (const candidate of candidates) {
    const locator = page.locator(candidate).first();
    try {
      await locator.waitFor({ state: 'attached', timeout });
      return locator;
    } catch {
      // fall through to the next candidate
    }
  }
  throw new Error(`No locator resolved: ${candidates.join(' | ')}`);
}
"#;

/// JavaScript string literal for `value`.
pub(crate) fn js_str(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

fn candidates(step: &Step, primary: &str) -> String {
    let mut items = Vec::with_capacity(step.fallbacks.len() + 1);
    items.push(js_str(primary));
    items.extend(step.fallbacks.iter().map(|f| js_str(f)));
    format!("[{}]", items.join(", "))
}

pub(crate) fn screenshot_path(name: &str) -> String {
    if name.contains('.') {
        format!("screenshots/{name}")
    } else {
        format!("screenshots/{name}.png")
    }
}

fn inert(step: &Step, reason: &str) -> String {
    let params = serde_json::to_string(&step.action.params()).unwrap_or_default();
    format!(
        "    // unsupported step ({reason}): {} {params}\n",
        step.action.kind_name()
    )
}

fn render_step(out: &mut String, index: usize, step: &Step, session: &Session) {
    let _ = writeln!(
        out,
        "    // Step {}: {}",
        index + 1,
        step.description.replace('\n', " ")
    );

    let locator = step.locator.as_deref();
    let located = |primary: &str, timeout: Option<&str>| match timeout {
        Some(t) => format!(
            "(await healingLocator(page, {}, {t}))",
            candidates(step, primary)
        ),
        None => format!("(await healingLocator(page, {}))", candidates(step, primary)),
    };

    let line = match (&step.action, locator) {
        (StepAction::Navigate { url }, _) => format!("    await page.goto({});\n", js_str(url)),
        (StepAction::Click { double }, Some(l)) => {
            let verb = if *double { "dblclick" } else { "click" };
            format!("    await {}.{verb}();\n", located(l, None))
        }
        (StepAction::Fill { value }, Some(l)) => {
            format!("    await {}.fill({});\n", located(l, None), js_str(value))
        }
        (StepAction::Select { value }, Some(l)) => format!(
            "    await {}.selectOption({});\n",
            located(l, None),
            js_str(value)
        ),
        (StepAction::Wait { condition }, _) => match (condition, locator) {
            (WaitCondition::Timeout { ms }, _) => format!("    await page.waitForTimeout({ms});\n"),
            (WaitCondition::Visible, Some(l)) => format!(
                "    await {}.waitFor({{ state: 'visible', timeout: WAIT_TIMEOUT_MS }});\n",
                located(l, Some("WAIT_TIMEOUT_MS"))
            ),
            (WaitCondition::Hidden, Some(l)) => format!(
                "    await page.locator({}).first().waitFor({{ state: 'hidden', timeout: WAIT_TIMEOUT_MS }});\n",
                js_str(l)
            ),
            (WaitCondition::LoadState { state }, _) => format!(
                "    await page.waitForLoadState('{}', {{ timeout: WAIT_TIMEOUT_MS }});\n",
                state.as_str()
            ),
            (WaitCondition::Url { pattern }, _) => format!(
                "    await page.waitForURL({}, {{ timeout: WAIT_TIMEOUT_MS }});\n",
                js_str(pattern)
            ),
            (WaitCondition::Visible | WaitCondition::Hidden, None) => {
                inert(step, "wait without locator")
            }
        },
        (StepAction::Assertion { expected }, Some(l)) => {
            let matcher = match session.config.assertion_strictness {
                AssertionStrictness::Strict => "toHaveText",
                AssertionStrictness::Lenient => "toContainText",
            };
            format!(
                "    await expect({}).{matcher}({});\n",
                located(l, None),
                js_str(expected)
            )
        }
        (StepAction::Screenshot { name, full_page }, _) => format!(
            "    await page.screenshot({{ path: {}, fullPage: {full_page} }});\n",
            js_str(&screenshot_path(name))
        ),
        (StepAction::Unsupported { .. }, _) => inert(step, "unknown action"),
        (StepAction::Click { .. }, None)
        | (StepAction::Fill { .. }, None)
        | (StepAction::Select { .. }, None)
        | (StepAction::Assertion { .. }, None) => inert(step, "missing locator"),
    };
    out.push_str(&line);

    if session.config.screenshot_policy == ScreenshotPolicy::EveryStep
        && !matches!(step.action, StepAction::Screenshot { .. })
    {
        let _ = writeln!(
            out,
            "    await page.screenshot({{ path: {} }});",
            js_str(&screenshot_path(&format!("step-{:03}", index + 1)))
        );
    }
}

/// Render the primary script for a session.
pub fn render_script(session: &Session) -> String {
    let mut out = String::new();
    out.push_str("import { test, expect, Page, Locator } from '@playwright/test';\n\n");
    let _ = writeln!(
        out,
        "const FALLBACK_TIMEOUT_MS = {};",
        session.config.fallback_timeout_ms
    );
    let _ = writeln!(
        out,
        "const WAIT_TIMEOUT_MS = {};\n",
        session.config.wait_timeout_ms
    );
    out.push_str(HELPER);
    out.push('\n');
    let _ = writeln!(out, "test.describe({}, () => {{", js_str(&session.name));
    out.push_str("  test('recorded flow', async ({ page }) => {\n");
    let _ = writeln!(out, "    await page.goto({});", js_str(&session.url));

    for (index, step) in session.steps.iter().enumerate() {
        out.push('\n');
        render_step(&mut out, index, step, session);
    }

    out.push_str("  });\n});\n");
    out
}
