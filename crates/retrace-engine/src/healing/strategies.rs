//! Fallback locator generation.
//!
//! Every function in this module is pure: the same primary locator, action
//! kind and strategy list always produce the same ordered output, and no live
//! document is consulted.

use lazy_static::lazy_static;
use regex::Regex;
use retrace_common::protocol::{ActionKind, HealingStrategy};
use std::collections::HashSet;

lazy_static! {
    static ref BRACKETS: Regex = Regex::new(r#"\[[^\]]*\]|"[^"]*"|'[^']*'"#).unwrap();
    static ref ID_FRAGMENT: Regex = Regex::new(r"#([A-Za-z_][A-Za-z0-9_-]*)").unwrap();
    static ref CLASS_FRAGMENT: Regex = Regex::new(r"\.([A-Za-z_][A-Za-z0-9_-]*)").unwrap();
    static ref ATTR_FRAGMENT: Regex =
        Regex::new(r#"\[\s*([A-Za-z_][A-Za-z0-9_:-]*)\s*[*^$|~]?=\s*["']?([^"'\]]+?)["']?\s*\]"#)
            .unwrap();
}

const ENGINE_PREFIXES: [&str; 6] = ["text=", "role=", "xpath=", "css=", "id=", "//"];

/// Identifying pieces pulled out of a CSS locator.
#[derive(Debug, Default, PartialEq, Eq)]
struct Fragments {
    id: Option<String>,
    class: Option<String>,
    attribute: Option<(String, String)>,
}

impl Fragments {
    fn parse(locator: &str) -> Self {
        let attribute = ATTR_FRAGMENT
            .captures(locator)
            .map(|c| (c[1].to_string(), c[2].trim().to_string()));
        // ids and classes inside attribute values or quoted text are not fragments
        let bare = BRACKETS.replace_all(locator, " ");
        Self {
            id: ID_FRAGMENT.captures(&bare).map(|c| c[1].to_string()),
            class: CLASS_FRAGMENT.captures(&bare).map(|c| c[1].to_string()),
            attribute,
        }
    }

    /// The most specific fragment, used to derive text.
    fn primary_word_source(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.attribute.as_ref().map(|(_, v)| v.as_str()))
            .or(self.class.as_deref())
    }
}

/// Whether a locator is plain CSS rather than an engine-prefixed expression.
pub fn is_css(locator: &str) -> bool {
    let trimmed = locator.trim_start();
    !ENGINE_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// `submit-button` / `submit_button` / `submitButton` → `submit button`.
pub fn humanize(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 4);
    let mut prev_lower = false;
    for ch in fragment.chars() {
        if ch == '-' || ch == '_' {
            if !out.ends_with(' ') && !out.is_empty() {
                out.push(' ');
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            out.push(' ');
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        out.extend(ch.to_lowercase());
    }
    out.trim().to_string()
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn attribute_matching(primary: &str) -> Vec<String> {
    if !is_css(primary) {
        return Vec::new();
    }
    let fragments = Fragments::parse(primary);
    let mut out = Vec::new();
    if let Some(id) = &fragments.id {
        let id = quote(id);
        out.push(format!("[data-testid=\"{id}\"]"));
        out.push(format!("[id*=\"{id}\"]"));
        out.push(format!("[name=\"{id}\"]"));
        out.push(format!("[aria-label*=\"{}\" i]", quote(&humanize(&id))));
    }
    if let Some(class) = &fragments.class {
        let class = quote(class);
        out.push(format!("[class*=\"{class}\"]"));
        out.push(format!("[data-testid=\"{class}\"]"));
        out.push(format!("[aria-label*=\"{}\" i]", quote(&humanize(&class))));
    }
    if let Some((name, value)) = &fragments.attribute {
        let value = quote(value);
        out.push(format!("[data-testid=\"{value}\"]"));
        out.push(format!("[{name}*=\"{value}\"]"));
        out.push(format!("[name=\"{value}\"]"));
    }
    out
}

fn text_content_matching(primary: &str, kind: ActionKind) -> Vec<String> {
    if !kind.is_interactive() {
        return Vec::new();
    }
    let words = if is_css(primary) {
        Fragments::parse(primary)
            .primary_word_source()
            .map(humanize)
            .filter(|w| !w.is_empty())
    } else {
        None
    };

    let mut out = Vec::new();
    match kind {
        ActionKind::Click => {
            if let Some(words) = &words {
                let text = quote(&capitalize(words));
                out.push(format!("button:has-text(\"{text}\")"));
                out.push(format!("a:has-text(\"{text}\")"));
            }
            out.extend(
                ["text=Submit", "text=Continue", "text=OK", "role=button"].map(String::from),
            );
        }
        ActionKind::Fill => {
            if let Some(words) = &words {
                out.push(format!("[placeholder*=\"{}\" i]", quote(words)));
            }
            out.extend(["role=textbox", "input[type=\"text\"]", "textarea"].map(String::from));
        }
        ActionKind::Select => {
            if let Some(words) = &words {
                out.push(format!("select[name*=\"{}\" i]", quote(words)));
            }
            out.extend(["role=combobox", "select"].map(String::from));
        }
        _ => {}
    }
    out
}

/// Split at `boundary` characters that sit outside quotes, brackets,
/// parentheses and backslash escapes. Pieces are trimmed; empty ones dropped.
fn split_top_level(locator: &str, boundary: impl Fn(char) -> bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, ch) in locator.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 && boundary(ch) => {
                parts.push(&locator[start..i]);
                start = i + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&locator[start..]);
    parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Members of a selector list (`#a, #b` → `#a`, `#b`).
fn list_members(locator: &str) -> Vec<&str> {
    split_top_level(locator, |c| c == ',')
}

/// First compound selector of a CSS locator (`form#login > button` → `form#login`).
/// Only the first member of a selector list is considered.
fn leading_token(primary: &str) -> Option<&str> {
    if !is_css(primary) {
        return None;
    }
    let first = list_members(primary).into_iter().next()?;
    split_top_level(first, |c| c.is_whitespace() || matches!(c, '>' | '+' | '~'))
        .into_iter()
        .next()
}

fn positional_matching(primary: &str) -> Vec<String> {
    let Some(lead) = leading_token(primary) else {
        return Vec::new();
    };
    vec![
        format!("{lead}:first-child"),
        format!("{lead}:nth-child(1)"),
        format!("form {lead}"),
        format!("main {lead}"),
    ]
}

fn semantic_similarity(kind: ActionKind) -> Vec<String> {
    let roles: &[&str] = match kind {
        ActionKind::Click => &["role=button", "role=link", "[role=\"button\"]"],
        ActionKind::Fill => &["role=textbox", "role=searchbox", "[role=\"textbox\"]"],
        ActionKind::Select => &["role=combobox", "role=listbox"],
        ActionKind::Assertion => &["role=heading", "role=alert", "role=status"],
        ActionKind::Navigate | ActionKind::Wait | ActionKind::Screenshot => &[],
    };
    roles.iter().map(|r| r.to_string()).collect()
}

/// Stand-in for image based matching: visibility predicates on the primary.
fn visual_matching(primary: &str) -> Vec<String> {
    if !is_css(primary) {
        return Vec::new();
    }
    let members = list_members(primary);
    if members.is_empty() {
        return Vec::new();
    }
    // every list member gets the predicate
    let suffixed = |suffix: &str| {
        members
            .iter()
            .map(|m| format!("{m}{suffix}"))
            .collect::<Vec<_>>()
            .join(", ")
    };
    vec![suffixed(":visible"), suffixed(":not([hidden])")]
}

fn apply(strategy: HealingStrategy, primary: &str, kind: ActionKind) -> Vec<String> {
    match strategy {
        HealingStrategy::AttributeMatching => attribute_matching(primary),
        HealingStrategy::TextContentMatching => text_content_matching(primary, kind),
        HealingStrategy::PositionalMatching => positional_matching(primary),
        HealingStrategy::SemanticSimilarity => semantic_similarity(kind),
        HealingStrategy::VisualMatching => visual_matching(primary),
    }
}

/// Produce the ranked fallback list for a primary locator.
///
/// Strategy outputs are concatenated in the order given and de-duplicated
/// keeping the first occurrence. The primary itself never appears.
pub fn generate_fallbacks(
    primary: &str,
    kind: ActionKind,
    strategies: &[HealingStrategy],
) -> Vec<String> {
    let primary = primary.trim();
    if primary.is_empty() {
        return Vec::new();
    }
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(primary.to_string());
    let mut out = Vec::new();
    for strategy in strategies {
        for candidate in apply(*strategy, primary, kind) {
            if seen.insert(candidate.clone()) {
                out.push(candidate);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_yields_attribute_variants() {
        let out = attribute_matching("#submit-button");
        assert_eq!(
            out,
            vec![
                "[data-testid=\"submit-button\"]",
                "[id*=\"submit-button\"]",
                "[name=\"submit-button\"]",
                "[aria-label*=\"submit button\" i]",
            ]
        );
    }

    #[test]
    fn fragments_ignore_dots_inside_attribute_values() {
        let f = Fragments::parse("a[href=\"docs.html\"]");
        assert_eq!(f.class, None);
        assert_eq!(
            f.attribute,
            Some(("href".to_string(), "docs.html".to_string()))
        );
    }

    #[test]
    fn humanize_handles_case_and_separators() {
        assert_eq!(humanize("submit-button"), "submit button");
        assert_eq!(humanize("loginForm_email"), "login form email");
        assert_eq!(humanize("--x--"), "x");
    }

    #[test]
    fn text_matching_only_for_interactive_kinds() {
        assert!(text_content_matching("#title", ActionKind::Assertion).is_empty());
        let click = text_content_matching("#submit-button", ActionKind::Click);
        assert_eq!(click[0], "button:has-text(\"Submit button\")");
        assert!(click.contains(&"role=button".to_string()));
    }

    #[test]
    fn positional_uses_leading_compound() {
        let out = positional_matching("form#login > button.primary");
        assert_eq!(out[0], "form#login:first-child");
        assert_eq!(out[3], "main form#login");
        assert!(positional_matching("text=Sign in").is_empty());
    }

    #[test]
    fn generate_dedupes_in_declaration_order() {
        let out = generate_fallbacks(
            "#submit-button",
            ActionKind::Click,
            &[
                HealingStrategy::TextContentMatching,
                HealingStrategy::SemanticSimilarity,
            ],
        );
        let role_button: Vec<_> = out.iter().filter(|l| *l == "role=button").collect();
        assert_eq!(role_button.len(), 1);
        // text strategy came first, so its copy of role=button wins the slot
        let text_pos = out.iter().position(|l| l == "text=OK").unwrap();
        let role_pos = out.iter().position(|l| l == "role=button").unwrap();
        assert!(role_pos > text_pos);
        assert!(out.contains(&"role=link".to_string()));
    }

    #[test]
    fn primary_never_appears_in_fallbacks() {
        let out = generate_fallbacks(
            "[data-testid=\"go\"]",
            ActionKind::Click,
            &HealingStrategy::ALL,
        );
        assert!(!out.contains(&"[data-testid=\"go\"]".to_string()));
    }

    #[test]
    fn visual_is_a_stub_that_never_errors() {
        assert_eq!(
            visual_matching(".card"),
            vec![".card:visible", ".card:not([hidden])"]
        );
        assert!(visual_matching("role=button").is_empty());
    }

    fn balanced(locator: &str) -> bool {
        let mut quotes = 0;
        let mut escaped = false;
        for ch in locator.chars() {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => quotes += 1,
                _ => {}
            }
        }
        quotes % 2 == 0
            && locator.matches('[').count() == locator.matches(']').count()
            && locator.matches('(').count() == locator.matches(')').count()
    }

    #[test]
    fn positional_keeps_quoted_spaces_intact() {
        let out = generate_fallbacks(
            "input[placeholder=\"Your email\"]",
            ActionKind::Fill,
            &[HealingStrategy::PositionalMatching],
        );
        assert_eq!(
            out,
            vec![
                "input[placeholder=\"Your email\"]:first-child",
                "input[placeholder=\"Your email\"]:nth-child(1)",
                "form input[placeholder=\"Your email\"]",
                "main input[placeholder=\"Your email\"]",
            ]
        );

        for primary in [
            "[aria-label=\"Close dialog\"]",
            "button:has-text(\"Sign in\")",
            "[aria-label=\"Say \\\"hi there\\\"\"] > span",
        ] {
            let out = generate_fallbacks(primary, ActionKind::Click, &HealingStrategy::ALL);
            assert!(!out.is_empty());
            for locator in &out {
                assert!(balanced(locator), "{primary} produced {locator}");
            }
        }
        assert_eq!(
            positional_matching("button:has-text(\"Sign in\") > span")[0],
            "button:has-text(\"Sign in\"):first-child"
        );
    }

    #[test]
    fn selector_lists_are_handled_per_member() {
        assert_eq!(leading_token("#a, #b"), Some("#a"));
        let out = positional_matching("#a, #b");
        assert_eq!(out[0], "#a:first-child");
        assert_eq!(out[2], "form #a");
        assert_eq!(
            visual_matching("#a, #b"),
            vec!["#a:visible, #b:visible", "#a:not([hidden]), #b:not([hidden])"]
        );
    }

    #[test]
    fn combinators_inside_parentheses_do_not_split() {
        assert_eq!(
            leading_token("li:nth-child(2n + 1) a"),
            Some("li:nth-child(2n + 1)")
        );
        assert_eq!(leading_token("ul>li"), Some("ul"));
    }

    #[test]
    fn empty_primary_has_no_fallbacks() {
        assert!(generate_fallbacks("  ", ActionKind::Click, &HealingStrategy::ALL).is_empty());
    }
}
