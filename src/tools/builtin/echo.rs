use async_trait::async_trait;
use serde_json::json;

use crate::error::WorkerError;
use crate::tools::tool::{Tool, require_str};

/// Returns its `message` parameter unchanged.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the given message."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Text to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, WorkerError> {
        let message = require_str(&params, "message")?;
        Ok(json!({ "message": message }))
    }
}
