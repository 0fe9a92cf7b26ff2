use retrace_common::protocol::{Session, SessionConfig, SessionStatus};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Json,
    Markdown,
}

#[derive(Debug, Serialize)]
struct StepRow<'a> {
    index: usize,
    action: &'a str,
    locator: Option<&'a str>,
    description: &'a str,
    fallback_count: usize,
    fallbacks: &'a [String],
}

#[derive(Debug, Serialize)]
struct Report<'a> {
    id: &'a str,
    name: &'a str,
    url: &'a str,
    status: SessionStatus,
    config: &'a SessionConfig,
    steps: Vec<StepRow<'a>>,
}

fn rows(session: &Session) -> Vec<StepRow<'_>> {
    session
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| StepRow {
            index: i + 1,
            action: step.action.kind_name(),
            locator: step.locator.as_deref(),
            description: &step.description,
            fallback_count: step.fallbacks.len(),
            fallbacks: &step.fallbacks,
        })
        .collect()
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

pub fn render_report(session: &Session, format: ReportFormat) -> String {
    match format {
        ReportFormat::Json => {
            let report = Report {
                id: &session.id,
                name: &session.name,
                url: &session.url,
                status: session.status,
                config: &session.config,
                steps: rows(session),
            };
            serde_json::to_string_pretty(&report).unwrap_or_default()
        }
        ReportFormat::Markdown => {
            let mut out = String::new();
            let _ = writeln!(out, "# {}\n", cell(&session.name));
            let _ = writeln!(out, "- URL: {}", session.url);
            let _ = writeln!(out, "- Status: {}", session.status);
            let strategies: Vec<_> = session
                .config
                .strategies
                .iter()
                .map(|s| s.as_str())
                .collect();
            let _ = writeln!(out, "- Healing strategies: {}", strategies.join(", "));
            let _ = writeln!(out, "- Steps: {}\n", session.steps.len());
            out.push_str("| # | Action | Locator | Fallbacks | Description |\n");
            out.push_str("|---|--------|---------|-----------|-------------|\n");
            for row in rows(session) {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} |",
                    row.index,
                    row.action,
                    row.locator.map(|l| format!("`{}`", cell(l))).unwrap_or_default(),
                    row.fallback_count,
                    cell(row.description)
                );
            }
            out
        }
    }
}
