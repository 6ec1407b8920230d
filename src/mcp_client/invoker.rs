//! Tool invocation: argument validation, coercion and dispatch.
//!
//! Arguments usually arrive as text (typed by a user or produced by a model),
//! so string values are coerced to the kind the tool's schema declares
//! before the `tools/call` request is sent.

use std::time::Instant;

use serde_json::{Map, Value};

use super::catalog::ToolCatalog;
use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{ArgKind, Tool, ToolCallResult};

/// Raw argument mapping supplied by the caller.
pub type RawArguments = Map<String, Value>;

/// A validated call, ready to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub tool_name: String,
    pub arguments: RawArguments,
}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Check `name` against the catalog and coerce `args` to the tool's schema.
///
/// No I/O happens here, so an unknown tool or a missing argument never
/// reaches the server.
pub fn prepare_call(
    catalog: &ToolCatalog,
    name: &str,
    mut args: RawArguments,
) -> Result<PreparedCall, McpError> {
    let tool = catalog.get(name).ok_or_else(|| McpError::UnknownTool {
        name: name.to_string(),
    })?;

    let mut arguments = Map::new();

    for (key, prop) in &tool.input_schema.properties {
        let required = tool.input_schema.is_required(key);
        match args.remove(key) {
            None | Some(Value::Null) => {
                if required {
                    return Err(missing(tool, key));
                }
            }
            // An optional field left blank is the same as not supplying it.
            Some(Value::String(s)) if s.is_empty() && !required => {}
            Some(value) => {
                let coerced = coerce(tool, key, &prop.arg_kind(), value)?;
                arguments.insert(key.clone(), coerced);
            }
        }
    }

    // Required names the schema lists without describing.
    for key in &tool.input_schema.required {
        if !tool.input_schema.properties.contains_key(key) && !is_present(&args, key) {
            return Err(missing(tool, key));
        }
    }

    // Anything not in the schema goes through as-is.
    arguments.extend(args);

    Ok(PreparedCall {
        tool_name: tool.name.clone(),
        arguments,
    })
}

fn is_present(args: &RawArguments, key: &str) -> bool {
    args.get(key).is_some_and(|v| !v.is_null())
}

fn missing(tool: &Tool, key: &str) -> McpError {
    McpError::MissingArgument {
        tool: tool.name.clone(),
        argument: key.to_string(),
    }
}

/// Coerce one raw value to `kind`. Only strings are reinterpreted.
fn coerce(tool: &Tool, key: &str, kind: &ArgKind, value: Value) -> Result<Value, McpError> {
    let Value::String(raw) = value else {
        return Ok(value);
    };

    match kind {
        ArgKind::Number => parse_number(&raw).ok_or_else(|| McpError::InvalidArgument {
            tool: tool.name.clone(),
            argument: key.to_string(),
            reason: format!("'{raw}' is not a number"),
        }),
        ArgKind::Boolean => Ok(Value::Bool(raw.eq_ignore_ascii_case("true"))),
        // Some schemas label free-form text as "object"; keep the text when
        // it isn't JSON.
        ArgKind::Object => Ok(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
        ArgKind::String | ArgKind::Other(_) => Ok(Value::String(raw)),
    }
}

/// Parse numeric text, keeping integers integral.
fn parse_number(raw: &str) -> Option<Value> {
    let text = raw.trim();
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(u) = text.parse::<u64>() {
        return Some(Value::from(u));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// Send a prepared call as `tools/call` and wrap the server's reply.
///
/// A JSON-RPC error from the server is a failed result, not an `Err`;
/// transport failures are returned as `ToolCallFailed`.
pub async fn submit(
    transport: &StdioTransport,
    call: PreparedCall,
) -> Result<ToolCallResult, McpError> {
    let start = Instant::now();
    let PreparedCall {
        tool_name,
        arguments,
    } = call;

    tracing::info!(tool = %tool_name, server = transport.server_name(), "calling tool");

    let params = serde_json::json!({
        "name": tool_name,
        "arguments": arguments,
    });

    let response = transport
        .request("tools/call", Some(params))
        .await
        .map_err(|e| McpError::ToolCallFailed {
            tool: tool_name.clone(),
            source: Box::new(e),
        })?;

    let elapsed = start.elapsed().as_millis() as u64;

    match extract_result(response) {
        Ok(mut result) => {
            let is_error = result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let content = result
                .get_mut("content")
                .map(Value::take)
                .unwrap_or(Value::Null);
            let error = is_error.then(|| error_text(&content));
            if is_error {
                tracing::warn!(tool = %tool_name, "tool reported an error");
            }
            Ok(ToolCallResult {
                tool_name,
                success: !is_error,
                content,
                error,
                execution_time_ms: elapsed,
            })
        }
        Err(McpError::ServerError { code, message, .. }) => {
            tracing::warn!(tool = %tool_name, code, %message, "tool call rejected by server");
            Ok(ToolCallResult {
                tool_name,
                success: false,
                content: Value::Null,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms: elapsed,
            })
        }
        Err(e) => Err(McpError::ToolCallFailed {
            tool: tool_name,
            source: Box::new(e),
        }),
    }
}

/// Text of the first text block in an MCP content list, or the raw JSON.
fn error_text(content: &Value) -> String {
    content
        .as_array()
        .and_then(|blocks| {
            blocks
                .iter()
                .find_map(|b| b.get("text").and_then(Value::as_str))
        })
        .map(str::to_string)
        .unwrap_or_else(|| content.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
