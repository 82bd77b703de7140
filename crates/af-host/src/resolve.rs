//! Template resolution: `{{name}}` markers become concrete values before a
//! sandbox ever sees the request.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use af_error::ResolveError;
use af_sandbox::{FormDataKind, HeaderValue, VariableValue};
use regex::Regex;
use serde_json::Value;

use crate::node::RequestNode;

/// `{{ name }}` with optional inner whitespace.
static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("static regex is valid")
});

/// Turns a node with template markers into a node with concrete values.
#[async_trait::async_trait]
pub trait TemplateResolver: Send + Sync {
    /// Resolve every marker in `node`.
    async fn resolve(&self, node: &RequestNode) -> Result<RequestNode, ResolveError>;
}

/// Leaves the node untouched. For callers that resolve upstream.
pub struct PassthroughResolver;

#[async_trait::async_trait]
impl TemplateResolver for PassthroughResolver {
    async fn resolve(&self, node: &RequestNode) -> Result<RequestNode, ResolveError> {
        Ok(node.clone())
    }
}

/// Substitutes `{{name}}` from the node's own variables.
///
/// Strings are inserted as-is, other values as JSON text. An unknown name is
/// an error.
pub struct VariableResolver;

#[async_trait::async_trait]
impl TemplateResolver for VariableResolver {
    async fn resolve(&self, node: &RequestNode) -> Result<RequestNode, ResolveError> {
        let vars = &node.variables;
        let mut out = node.clone();
        let req = &mut out.request;

        req.method = substitute(&req.method, vars)?;
        req.url = substitute(&req.url, vars)?;
        req.path = substitute(&req.path, vars)?;
        resolve_map(&mut req.query_params, vars)?;
        resolve_map(&mut req.path_params, vars)?;
        for value in req.headers.values_mut() {
            if let HeaderValue::Set(text) = value {
                *text = substitute(text, vars)?;
            }
        }
        resolve_map(&mut req.body.urlencoded, vars)?;
        for entry in req.body.formdata.values_mut() {
            if entry.kind == FormDataKind::Text {
                entry.value = substitute(&entry.value, vars)?;
            }
        }
        for value in req.body.json.values_mut() {
            resolve_json(value, vars)?;
        }
        req.body.raw = substitute(&req.body.raw, vars)?;
        resolve_map(&mut out.cookies, vars)?;

        Ok(out)
    }
}

fn resolve_map(
    map: &mut BTreeMap<String, String>,
    vars: &BTreeMap<String, VariableValue>,
) -> Result<(), ResolveError> {
    for value in map.values_mut() {
        *value = substitute(value, vars)?;
    }
    Ok(())
}

fn resolve_json(value: &mut Value, vars: &BTreeMap<String, VariableValue>) -> Result<(), ResolveError> {
    match value {
        Value::String(s) => *s = substitute(s, vars)?,
        Value::Array(items) => {
            for item in items {
                resolve_json(item, vars)?;
            }
        }
        Value::Object(members) => {
            for member in members.values_mut() {
                resolve_json(member, vars)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace every marker in `text`.
pub fn substitute(text: &str, vars: &BTreeMap<String, VariableValue>) -> Result<String, ResolveError> {
    if !text.contains("{{") {
        return Ok(text.to_string());
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in MARKER_RE.captures_iter(text) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var = vars
            .get(name.as_str())
            .ok_or_else(|| ResolveError::UnknownVariable(name.as_str().to_string()))?;
        out.push_str(&text[last..whole.start()]);
        match &var.value {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}
