use super::script::js_str;
use retrace_common::protocol::{ScreenshotPolicy, Session};
use std::fmt::Write;

/// `playwright.config.ts` derived from session configuration and metadata.
pub fn render_run_config(session: &Session) -> String {
    let config = &session.config;
    let meta = &session.metadata;
    let screenshot = match config.screenshot_policy {
        ScreenshotPolicy::Never => "off",
        ScreenshotPolicy::OnFailure => "only-on-failure",
        ScreenshotPolicy::EveryStep => "on",
    };

    let mut out = String::new();
    out.push_str("import { defineConfig } from '@playwright/test';\n\n");
    out.push_str("export default defineConfig({\n");
    out.push_str("  testDir: './tests',\n");
    let _ = writeln!(out, "  timeout: {},", config.wait_timeout_ms);
    let _ = writeln!(out, "  retries: {},", config.max_retries);
    out.push_str("  use: {\n");
    let _ = writeln!(out, "    baseURL: {},", js_str(&session.url));
    let _ = writeln!(out, "    browserName: '{}',", meta.browser.as_str());
    let _ = writeln!(out, "    headless: {},", meta.headless);
    let _ = writeln!(
        out,
        "    viewport: {{ width: {}, height: {} }},",
        meta.viewport.width, meta.viewport.height
    );
    let _ = writeln!(out, "    actionTimeout: {},", config.fallback_timeout_ms);
    let _ = writeln!(out, "    screenshot: '{screenshot}',");
    if let Some(agent) = &meta.user_agent {
        let _ = writeln!(out, "    userAgent: {},", js_str(agent));
    }
    out.push_str("  },\n");
    out.push_str("});\n");
    out
}
