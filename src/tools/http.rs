//! Raw HTTP request helpers for exploitation agents.
//!
//! Models reliably mangle Content-Length when asked to write raw requests
//! by hand. `build_http_request` assembles a well-formed request with a
//! byte-accurate Content-Length; `parse_http_request` goes the other way
//! so an agent can inspect captured traffic.

use super::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry};
use crate::errors::KernelError;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub fn register(registry: &mut ToolRegistry) -> Result<(), KernelError> {
    registry.register(
        "build_http_request",
        "Build a well-formed raw HTTP/1.1 request with an exact Content-Length.",
        json!({
            "type": "object",
            "properties": {
                "method": {"type": "string", "description": "HTTP method, default GET"},
                "url": {"type": "string", "description": "Absolute URL of the request"},
                "headers": {"type": "object", "description": "Header name/value pairs"},
                "body": {"type": "string", "description": "Request body, optional"}
            },
            "required": ["url"]
        }),
        Arc::new(BuildRequestTool),
    )?;

    registry.register(
        "parse_http_request",
        "Parse a raw HTTP request into method, path, headers, and body.",
        json!({
            "type": "object",
            "properties": {
                "raw": {"type": "string", "description": "The raw request text"}
            },
            "required": ["raw"]
        }),
        Arc::new(ParseRequestTool),
    )?;
    Ok(())
}

struct BuildRequestTool;

#[async_trait]
impl ToolHandler for BuildRequestTool {
    async fn call(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        let method = args["method"].as_str().unwrap_or("GET").to_uppercase();
        let url = args["url"].as_str().unwrap_or_default();
        let body = args["body"].as_str().unwrap_or_default();
        let headers = args["headers"].as_object().cloned().unwrap_or_default();

        let (host, path) = match split_url(url) {
            Some(parts) => parts,
            None => return ToolOutcome::error(format!("Cannot parse URL: {url}")),
        };

        match build_request(&method, &host, &path, &headers, body) {
            Ok(raw) => ToolOutcome::ok(json!({
                "raw": raw,
                "content_length": body.len()
            })),
            Err(e) => ToolOutcome::error(e),
        }
    }
}

struct ParseRequestTool;

#[async_trait]
impl ToolHandler for ParseRequestTool {
    async fn call(&self, args: serde_json::Value, _ctx: &ToolContext) -> ToolOutcome {
        let raw = args["raw"].as_str().unwrap_or_default();
        match parse_request(raw) {
            Ok(parsed) => ToolOutcome::ok(parsed),
            Err(e) => ToolOutcome::error(e),
        }
    }
}

/// Split an absolute URL into host (with port, when present) and path.
fn split_url(url: &str) -> Option<(String, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(idx) => Some((rest[..idx].to_string(), rest[idx..].to_string())),
        None => Some((rest.to_string(), "/".to_string())),
    }
}

/// Assemble the raw request. Caller-supplied Host and Content-Length
/// headers are overridden so the output is always self-consistent.
fn build_request(
    method: &str,
    host: &str,
    path: &str,
    headers: &serde_json::Map<String, serde_json::Value>,
    body: &str,
) -> Result<String, String> {
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("Invalid HTTP method: {method}"));
    }

    let mut raw = format!("{method} {path} HTTP/1.1\r\n");
    raw.push_str(&format!("Host: {host}\r\n"));

    for (name, value) in headers {
        let lower = name.to_lowercase();
        if lower == "host" || lower == "content-length" {
            continue;
        }
        let value = value.as_str().map(String::from).unwrap_or_else(|| value.to_string());
        if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
            return Err(format!("Header {name} contains line breaks"));
        }
        raw.push_str(&format!("{name}: {value}\r\n"));
    }

    if !body.is_empty() || matches!(method, "POST" | "PUT" | "PATCH") {
        raw.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    raw.push_str("\r\n");
    raw.push_str(body);
    Ok(raw)
}

/// Parse a raw request into a structured value.
fn parse_request(raw: &str) -> Result<serde_json::Value, String> {
    let (head, body) = match raw.find("\r\n\r\n") {
        Some(idx) => (&raw[..idx], &raw[idx + 4..]),
        None => match raw.find("\n\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 2..]),
            None => (raw, ""),
        },
    };

    let mut lines = head.lines();
    let request_line = lines.next().ok_or("Empty request")?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or("Missing method")?;
    let path = parts.next().ok_or("Missing path")?;
    let version = parts.next().unwrap_or("HTTP/1.1");

    let mut headers = serde_json::Map::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| format!("Malformed header line: {line}"))?;
        headers.insert(
            name.trim().to_string(),
            serde_json::Value::String(value.trim().to_string()),
        );
    }

    let declared_length = headers
        .iter()
        .find(|(k, _)| k.to_lowercase() == "content-length")
        .and_then(|(_, v)| v.as_str())
        .and_then(|v| v.parse::<usize>().ok());

    Ok(json!({
        "method": method,
        "path": path,
        "version": version,
        "headers": headers,
        "body": body,
        "body_length": body.len(),
        "content_length_matches": declared_length.map(|d| d == body.len()),
    }))
}
