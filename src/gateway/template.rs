//! Mapping templates for direct integrations.
//!
//! Supported placeholders:
//!
//! - `$method.request.querystring.<name>`
//! - `$method.request.header.<name>`
//! - `$input.body`
//! - `$util.urlEncode(<expr>)`, where `<expr>` is a quoted string that may
//!   itself contain placeholders
//!
//! Missing parameters render as the empty string. Any other `$` is copied
//! through untouched.

use crate::gateway::message::GatewayRequest;
use crate::utils::{PipelineError, Result};

const QUERY: &str = "$method.request.querystring.";
const HEADER: &str = "$method.request.header.";
const BODY: &str = "$input.body";
const URL_ENCODE: &str = "$util.urlEncode(";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingTemplate {
    source: String,
}

impl MappingTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, request: &GatewayRequest) -> Result<String> {
        render(&self.source, request)
    }
}

fn render(src: &str, request: &GatewayRequest) -> Result<String> {
    let mut out = String::with_capacity(src.len());
    let mut rest = src;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if let Some(after) = rest.strip_prefix(URL_ENCODE) {
            let close = closing_paren(after).ok_or_else(|| {
                PipelineError::Template(format!("unterminated $util.urlEncode in {src:?}"))
            })?;
            let value = eval(&after[..close], request)?;
            out.extend(url::form_urlencoded::byte_serialize(value.as_bytes()));
            rest = &after[close + 1..];
        } else if let Some(after) = rest.strip_prefix(QUERY) {
            let (name, tail) = parameter_name(after, src)?;
            out.push_str(request.query.get(name).map(String::as_str).unwrap_or(""));
            rest = tail;
        } else if let Some(after) = rest.strip_prefix(HEADER) {
            let (name, tail) = parameter_name(after, src)?;
            out.push_str(request.header(name).unwrap_or(""));
            rest = tail;
        } else if let Some(after) = rest.strip_prefix(BODY) {
            out.push_str(&String::from_utf8_lossy(&request.body));
            rest = after;
        } else {
            out.push('$');
            rest = &rest[1..];
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn eval(expr: &str, request: &GatewayRequest) -> Result<String> {
    let expr = expr.trim();
    let unquoted = expr
        .strip_prefix('"')
        .and_then(|e| e.strip_suffix('"'))
        .or_else(|| expr.strip_prefix('\'').and_then(|e| e.strip_suffix('\'')));
    render(unquoted.unwrap_or(expr), request)
}

fn closing_paren(s: &str) -> Option<usize> {
    let mut quote = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (None, '"' | '\'') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            (None, ')') => return Some(i),
            _ => {}
        }
    }
    None
}

fn parameter_name<'a>(s: &'a str, src: &str) -> Result<(&'a str, &'a str)> {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(s.len());
    if end == 0 {
        return Err(PipelineError::Template(format!(
            "missing parameter name in {src:?}"
        )));
    }
    Ok(s.split_at(end))
}
