//! Template Engine: a small Handlebars-like renderer used by the Email
//! Handler to expand `subject`/`body_template` against the delivery payload.
//!
//! Supported constructs: `{{path.with.dots}}`, `{{#if cond}}…{{else}}…{{/if}}`,
//! `{{#each array}}…{{this}}…{{@index}}…{{/each}}`, helpers `{{helperName
//! path}}` (`json`, `upper`, `lower`, `capitalize`), `{{date path "fmt"}}`, and
//! `{{number path "currency|percent|decimal"}}`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error as ThisError;

const DEFAULT_MAX_TEMPLATE_SIZE: usize = 1024 * 1024;

#[derive(Debug, ThisError)]
pub enum TemplateError {
    #[error("template exceeds max_template_size ({0} bytes)")]
    TooLarge(usize),
    #[error("unclosed block tag: {0}")]
    UnclosedBlock(String),
    #[error("unexpected closing tag: {0}")]
    UnexpectedClose(String),
    #[error("invalid date value at path {0}")]
    InvalidDate(String),
    #[error("invalid number value at path {0}")]
    InvalidNumber(String),
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub allow_unsafe_html: bool,
    pub max_template_size: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            allow_unsafe_html: false,
            max_template_size: DEFAULT_MAX_TEMPLATE_SIZE,
        }
    }
}

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());

#[derive(Debug, Clone, Copy)]
enum Token<'a> {
    Text(&'a str),
    Tag(&'a str),
}

#[derive(Debug)]
enum Node {
    Text(String),
    Var(String),
    Helper(String, String),
    Date(String, String),
    Number(String, String),
    If(String, Vec<Node>, Vec<Node>),
    Each(String, Vec<Node>),
    This,
    Index,
}

/// Render `template` against `context`, honoring `options`.
pub fn process_template(template: &str, context: &Value, options: &RenderOptions) -> Result<String, TemplateError> {
    if template.len() > options.max_template_size {
        return Err(TemplateError::TooLarge(template.len()));
    }

    let tokens = tokenize(template);
    let mut pos = 0;
    let nodes = parse(&tokens, &mut pos, &[])?;
    let mut out = String::new();
    render_nodes(&nodes, context, options, &mut out)?;
    Ok(out)
}

fn tokenize(template: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut last_end = 0;
    for m in TAG_RE.find_iter(template) {
        if m.start() > last_end {
            tokens.push(Token::Text(&template[last_end..m.start()]));
        }
        let inner = &template[m.start() + 2..m.end() - 2];
        tokens.push(Token::Tag(inner.trim()));
        last_end = m.end();
    }
    if last_end < template.len() {
        tokens.push(Token::Text(&template[last_end..]));
    }
    tokens
}

/// Recursive-descent parse over the flat token stream. `stop_tags` names the
/// closing/else tags that should end this level without being consumed by a
/// nested call (e.g. an `{{#if}}` body stops at `else` or `/if`).
fn parse(tokens: &[Token], pos: &mut usize, stop_tags: &[&str]) -> Result<Vec<Node>, TemplateError> {
    let mut nodes = Vec::new();

    while *pos < tokens.len() {
        match tokens[*pos] {
            Token::Text(t) => {
                nodes.push(Node::Text(t.to_string()));
                *pos += 1;
            }
            Token::Tag(tag) => {
                if stop_tags.contains(&tag) {
                    return Ok(nodes);
                }

                if let Some(cond) = tag.strip_prefix("#if ") {
                    *pos += 1;
                    let then_branch = parse(tokens, pos, &["else", "/if"])?;
                    let else_branch = if matches!(tokens.get(*pos), Some(Token::Tag(t)) if *t == "else") {
                        *pos += 1;
                        parse(tokens, pos, &["/if"])?
                    } else {
                        Vec::new()
                    };
                    expect_close(tokens, pos, "/if")?;
                    nodes.push(Node::If(cond.trim().to_string(), then_branch, else_branch));
                } else if let Some(path) = tag.strip_prefix("#each ") {
                    *pos += 1;
                    let body = parse(tokens, pos, &["/each"])?;
                    expect_close(tokens, pos, "/each")?;
                    nodes.push(Node::Each(path.trim().to_string(), body));
                } else if tag.starts_with('/') || tag == "else" {
                    return Err(TemplateError::UnexpectedClose(tag.to_string()));
                } else if tag == "this" {
                    nodes.push(Node::This);
                    *pos += 1;
                } else if tag == "@index" {
                    nodes.push(Node::Index);
                    *pos += 1;
                } else {
                    nodes.push(parse_inline_tag(tag));
                    *pos += 1;
                }
            }
        }
    }

    if !stop_tags.is_empty() {
        return Err(TemplateError::UnclosedBlock(stop_tags[0].to_string()));
    }
    Ok(nodes)
}

fn expect_close(tokens: &[Token], pos: &mut usize, expected: &str) -> Result<(), TemplateError> {
    match tokens.get(*pos).copied() {
        Some(Token::Tag(t)) if t == expected => {
            *pos += 1;
            Ok(())
        }
        _ => Err(TemplateError::UnclosedBlock(expected.to_string())),
    }
}

fn parse_inline_tag(tag: &str) -> Node {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["date", path, fmt] => Node::Date(path.to_string(), unquote(fmt)),
        ["number", path, kind] => Node::Number(path.to_string(), unquote(kind)),
        [helper @ ("json" | "upper" | "lower" | "capitalize"), path] => Node::Helper(helper.to_string(), path.to_string()),
        [path] => Node::Var(path.to_string()),
        _ => Node::Var(tag.to_string()),
    }
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

struct EachFrame<'a> {
    this: &'a Value,
    index: usize,
}

fn render_nodes(nodes: &[Node], context: &Value, options: &RenderOptions, out: &mut String) -> Result<(), TemplateError> {
    render_nodes_scoped(nodes, context, None, options, out)
}

fn render_nodes_scoped(nodes: &[Node], context: &Value, each_frame: Option<&EachFrame>, options: &RenderOptions, out: &mut String) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::This => {
                if let Some(frame) = each_frame {
                    out.push_str(&escape(&value_to_display(frame.this), options));
                }
            }
            Node::Index => {
                if let Some(frame) = each_frame {
                    out.push_str(&frame.index.to_string());
                }
            }
            Node::Var(path) => {
                let value = lookup(context, path);
                out.push_str(&escape(&value_to_display(&value), options));
            }
            Node::Helper(name, path) => {
                let value = lookup(context, path);
                let rendered = apply_helper(name, &value);
                out.push_str(&escape(&rendered, options));
            }
            Node::Date(path, fmt) => {
                let value = lookup(context, path);
                let rendered = format_date(&value, fmt).ok_or_else(|| TemplateError::InvalidDate(path.clone()))?;
                out.push_str(&escape(&rendered, options));
            }
            Node::Number(path, kind) => {
                let value = lookup(context, path);
                let rendered = format_number(&value, kind).ok_or_else(|| TemplateError::InvalidNumber(path.clone()))?;
                out.push_str(&escape(&rendered, options));
            }
            Node::If(cond, then_branch, else_branch) => {
                let value = lookup(context, cond);
                if is_truthy(&value) {
                    render_nodes_scoped(then_branch, context, each_frame, options, out)?;
                } else {
                    render_nodes_scoped(else_branch, context, each_frame, options, out)?;
                }
            }
            Node::Each(path, body) => {
                let value = lookup(context, path);
                if let Value::Array(items) = value {
                    for (index, item) in items.iter().enumerate() {
                        let frame = EachFrame { this: item, index };
                        render_nodes_scoped(body, context, Some(&frame), options, out)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn lookup(context: &Value, path: &str) -> Value {
    let mut current = context;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => current = v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_none_or(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn apply_helper(name: &str, value: &Value) -> String {
    match name {
        "json" => serde_json::to_string(value).unwrap_or_default(),
        "upper" => value_to_display(value).to_uppercase(),
        "lower" => value_to_display(value).to_lowercase(),
        "capitalize" => {
            let s = value_to_display(value);
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => s,
            }
        }
        _ => value_to_display(value),
    }
}

fn format_date(value: &Value, pattern: &str) -> Option<String> {
    let text = value.as_str()?;
    let dt = chrono::DateTime::parse_from_rfc3339(text).ok()?.with_timezone(&chrono::Utc);
    let strftime_pattern = pattern
        .replace("YYYY", "%Y")
        .replace("MM", "%m")
        .replace("DD", "%d")
        .replace("HH", "%H")
        .replace("mm", "%M")
        .replace("ss", "%S");
    Some(dt.format(&strftime_pattern).to_string())
}

fn format_number(value: &Value, kind: &str) -> Option<String> {
    let n = value.as_f64()?;
    match kind {
        "currency" => Some(format!("${n:.2}")),
        "percent" => Some(format!("{:.1}%", n * 100.0)),
        "decimal" => Some(format!("{n:.2}")),
        _ => Some(n.to_string()),
    }
}

fn escape(text: &str, options: &RenderOptions) -> String {
    if options.allow_unsafe_html {
        return text.to_string();
    }
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// Validate a recipient list: syntax, duplicates (warning), and a hard cap.
pub fn validate_recipients(recipients: &[String], max_recipients: usize) -> crate::handlers::ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for recipient in recipients {
        if !EMAIL_RE.is_match(recipient) {
            errors.push(format!("invalid recipient address: {recipient}"));
        }
        if !seen.insert(recipient.to_lowercase()) {
            warnings.push(format!("duplicate recipient address: {recipient}"));
        }
    }

    if recipients.len() > max_recipients {
        errors.push(format!("{} recipients exceeds the max of {max_recipients}", recipients.len()));
    }

    crate::handlers::ValidationResult {
        valid: errors.is_empty(),
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn interpolates_nested_path() {
        let ctx = json!({ "user": { "name": "Ada" } });
        let out = process_template("Hello {{user.name}}", &ctx, &RenderOptions::default()).unwrap();
        assert_eq!(out, "Hello Ada");
    }

    #[test]
    fn escapes_html_by_default() {
        let ctx = json!({ "name": "<b>Ada</b>" });
        let out = process_template("{{name}}", &ctx, &RenderOptions::default()).unwrap();
        assert_eq!(out, "&lt;b&gt;Ada&lt;/b&gt;");
    }

    #[test]
    fn allows_unsafe_html_when_opted_in() {
        let ctx = json!({ "name": "<b>Ada</b>" });
        let options = RenderOptions { allow_unsafe_html: true, ..Default::default() };
        let out = process_template("{{name}}", &ctx, &options).unwrap();
        assert_eq!(out, "<b>Ada</b>");
    }

    #[test]
    fn if_else_branches_on_truthiness() {
        let ctx = json!({ "active": true });
        let out = process_template("{{#if active}}yes{{else}}no{{/if}}", &ctx, &RenderOptions::default()).unwrap();
        assert_eq!(out, "yes");

        let ctx = json!({ "active": false });
        let out = process_template("{{#if active}}yes{{else}}no{{/if}}", &ctx, &RenderOptions::default()).unwrap();
        assert_eq!(out, "no");
    }

    #[test]
    fn each_exposes_this_and_index() {
        let ctx = json!({ "items": ["a", "b"] });
        let out = process_template("{{#each items}}{{@index}}:{{this}} {{/each}}", &ctx, &RenderOptions::default()).unwrap();
        assert_eq!(out, "0:a 1:b ");
    }

    #[test]
    fn helpers_transform_text() {
        let ctx = json!({ "name": "ada" });
        assert_eq!(process_template("{{upper name}}", &ctx, &RenderOptions::default()).unwrap(), "ADA");
        assert_eq!(process_template("{{capitalize name}}", &ctx, &RenderOptions::default()).unwrap(), "Ada");
    }

    #[test]
    fn formats_date_and_number() {
        let ctx = json!({ "ts": "2024-01-15T10:30:00Z", "amount": 12.5 });
        assert_eq!(process_template(r#"{{date ts "YYYY-MM-DD"}}"#, &ctx, &RenderOptions::default()).unwrap(), "2024-01-15");
        assert_eq!(process_template(r#"{{number amount "currency"}}"#, &ctx, &RenderOptions::default()).unwrap(), "$12.50");
    }

    #[test]
    fn rejects_oversized_template() {
        let options = RenderOptions { max_template_size: 4, ..Default::default() };
        let err = process_template("hello", &json!({}), &options).unwrap_err();
        assert!(matches!(err, TemplateError::TooLarge(_)));
    }

    #[test]
    fn recipient_validation_flags_bad_syntax_and_duplicates() {
        let recipients = vec!["a@example.com".to_string(), "not-an-email".to_string(), "A@example.com".to_string()];
        let result = validate_recipients(&recipients, 50);
        assert!(!result.valid);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn recipient_validation_enforces_max_count() {
        let recipients: Vec<String> = (0..3).map(|i| format!("user{i}@example.com")).collect();
        let result = validate_recipients(&recipients, 2);
        assert!(!result.valid);
    }
}
