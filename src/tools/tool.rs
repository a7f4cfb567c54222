//! The `Tool` trait and helpers for reading tool parameters.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::WorkerError;

/// A lightweight, stateless capability invoked directly by name.
///
/// Unlike agents, tools are not pooled: the registry hands out a shared
/// `Arc` and every call runs against the same instance.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing the accepted parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, WorkerError>;
}

/// Name, description and schema of a registered tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Read a required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, WorkerError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| WorkerError::terminal(format!("missing string parameter '{key}'")))
}

/// Read an optional integer parameter.
pub fn optional_i64(params: &serde_json::Value, key: &str) -> Result<Option<i64>, WorkerError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| WorkerError::terminal(format!("'{key}' must be an integer"))),
    }
}
