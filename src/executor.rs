//! Action execution pipeline.
//!
//! Validates and merges the caller's parameter buckets, checks the action
//! against the cached catalog (with at most one forced refresh), dispatches
//! through the connection manager, and flattens the downstream result into a
//! single JSON value. Only the pre-flight checks refuse execution outright;
//! downstream failures come back as a normal `{"error": ...}` value.

use std::sync::Arc;

use rmcp::model::CallToolResult;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    catalog::QualifiedActionName,
    core::{CallContext, ClientManager},
    error::{StrataError, StrataResult},
};

/// Raw `execute_action` arguments before validation.
#[derive(Debug, Default, Clone)]
pub struct ActionRequest {
    pub server: Option<String>,
    pub action: Option<String>,
    pub path_params: Option<Value>,
    pub query_params: Option<Value>,
    pub body_schema: Option<Value>,
}

impl ActionRequest {
    pub fn new(server: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            server: Some(server.into()),
            action: Some(action.into()),
            ..Default::default()
        }
    }
}

pub struct ActionExecutor {
    manager: Arc<ClientManager>,
}

impl ActionExecutor {
    pub fn new(manager: Arc<ClientManager>) -> Self {
        Self { manager }
    }

    /// Run the full pipeline for one action invocation.
    pub async fn execute(&self, request: ActionRequest, ctx: &CallContext) -> StrataResult<Value> {
        // Pre-flight: parse and merge the buckets, then require the target.
        // No network traffic happens before these pass.
        let path = parse_bucket("path_params", request.path_params)?;
        let query = parse_bucket("query_params", request.query_params)?;
        let body = parse_bucket("body_schema", request.body_schema)?;
        let arguments = merge_buckets([path, query, body])?;

        let server = request
            .server
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StrataError::MissingArgument("server".to_string()))?;
        let action = request
            .action
            .filter(|a| !a.is_empty())
            .ok_or_else(|| StrataError::MissingArgument("action".to_string()))?;

        self.ensure_in_catalog(&server, &action).await?;

        let qualified = QualifiedActionName::new(server.clone(), action.clone());
        let metrics = Arc::clone(self.manager.metrics());
        let started = Instant::now();
        metrics.record_execution_start(&qualified);
        // Balance the in-flight count even if the call path bails early.
        let guard = scopeguard::guard((metrics, qualified), |(metrics, qualified)| {
            metrics.record_execution_end(&qualified, false, started.elapsed().as_millis() as u64);
        });

        let args = if arguments.is_empty() {
            None
        } else {
            Some(arguments)
        };
        let outcome = self.manager.call_tool(&server, &action, args, ctx).await;

        let (metrics, qualified) = scopeguard::ScopeGuard::into_inner(guard);
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let value = flatten_result(result);
                let success = value.get("error").is_none();
                metrics.record_execution_end(&qualified, success, elapsed);
                Ok(value)
            }
            Err(e @ StrataError::Cancelled(_)) => {
                metrics.record_execution_end(&qualified, false, elapsed);
                Err(e)
            }
            Err(e) => {
                // Downstream and transport failures surface as a value, not
                // an error, so the caller sees what went wrong in-band.
                warn!("Action '{}' failed: {}", qualified, e);
                metrics.record_execution_end(&qualified, false, elapsed);
                Ok(json!({"error": e.to_string()}))
            }
        }
    }

    /// The action must exist in the server's cached catalog; a miss earns
    /// exactly one forced refresh before giving up.
    async fn ensure_in_catalog(&self, server: &str, action: &str) -> StrataResult<()> {
        let conn = self.manager.connection(server)?;
        if conn.catalog().tools.iter().any(|t| t.name == action) {
            return Ok(());
        }

        debug!(
            "Action '{}' not in cached catalog for '{}', refreshing once",
            action, server
        );
        match self.manager.refresh_catalog(server).await {
            Ok(tools) if tools.iter().any(|t| t.name == action) => Ok(()),
            Ok(_) => Err(StrataError::ActionNotFound {
                server: server.to_string(),
                action: action.to_string(),
            }),
            Err(e) => {
                warn!("Catalog refresh for '{}' failed: {}", server, e);
                Err(StrataError::ActionNotFound {
                    server: server.to_string(),
                    action: action.to_string(),
                })
            }
        }
    }
}

/// Accept a bucket as an object, a JSON-encoded object string, or nothing.
fn parse_bucket(bucket: &str, value: Option<Value>) -> StrataResult<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(Value::String(raw)) => {
            let parsed: Value = serde_json::from_str(&raw).map_err(|e| {
                StrataError::InvalidParameter {
                    bucket: bucket.to_string(),
                    message: format!("not valid JSON: {}", e),
                }
            })?;
            match parsed {
                Value::Object(map) => Ok(map),
                other => Err(StrataError::InvalidParameter {
                    bucket: bucket.to_string(),
                    message: format!("expected a JSON object, got {}", kind_of(&other)),
                }),
            }
        }
        Some(other) => Err(StrataError::InvalidParameter {
            bucket: bucket.to_string(),
            message: format!("expected a JSON object, got {}", kind_of(&other)),
        }),
    }
}

/// Merge the buckets into one flat argument object. A key appearing in more
/// than one bucket is a caller error.
fn merge_buckets(buckets: [Map<String, Value>; 3]) -> StrataResult<Map<String, Value>> {
    let mut merged = Map::new();
    for bucket in buckets {
        for (key, value) in bucket {
            if merged.contains_key(&key) {
                return Err(StrataError::Validation(format!(
                    "parameter '{}' appears in more than one bucket",
                    key
                )));
            }
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Flatten a downstream result into one JSON value. Text blocks are
/// concatenated and JSON-parsed when possible; anything else passes through
/// under `attachments`.
fn flatten_result(result: CallToolResult) -> Value {
    let content = serde_json::to_value(&result.content).unwrap_or_else(|e| {
        warn!("Failed to serialize downstream content: {}", e);
        Value::Array(vec![])
    });

    let mut texts: Vec<String> = Vec::new();
    let mut attachments: Vec<Value> = Vec::new();
    if let Value::Array(items) = content {
        for item in items {
            match item.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        texts.push(text.to_string());
                    }
                }
                _ => attachments.push(item),
            }
        }
    }

    let text = texts.join("\n");
    if result.is_error.unwrap_or(false) {
        return json!({"error": if text.is_empty() {
            "downstream tool reported an error".to_string()
        } else {
            text
        }});
    }

    let mut value = match serde_json::from_str::<Value>(&text) {
        Ok(parsed) => match parsed {
            Value::Object(map) => Value::Object(map),
            other => json!({"output": other}),
        },
        Err(_) => json!({"output": text}),
    };

    if !attachments.is_empty() {
        if let Value::Object(map) = &mut value {
            map.insert("attachments".to_string(), Value::Array(attachments));
        }
    }
    value
}
