use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use serde_json::json;

use crate::error::WorkerError;
use crate::tools::tool::{Tool, optional_i64};

/// Current time, optionally shifted to a fixed UTC offset.
pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in RFC 3339 format."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "utc_offset_minutes": {
                    "type": "integer",
                    "description": "Offset east of UTC in minutes (default 0)"
                }
            }
        })
    }

    async fn execute(&self, params: serde_json::Value) -> Result<serde_json::Value, WorkerError> {
        let offset_minutes = optional_i64(&params, "utc_offset_minutes")?.unwrap_or(0);
        let offset = offset_minutes
            .checked_mul(60)
            .and_then(|secs| i32::try_from(secs).ok())
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| WorkerError::terminal("utc_offset_minutes out of range"))?;

        let now = Utc::now().with_timezone(&offset);
        Ok(json!({
            "now": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_rfc3339() {
        let out = TimeTool.execute(json!({})).await.unwrap();
        let now = out["now"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(now).is_ok());
        assert!(out["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn applies_offset() {
        let out = TimeTool
            .execute(json!({"utc_offset_minutes": -300}))
            .await
            .unwrap();
        assert!(out["now"].as_str().unwrap().ends_with("-05:00"));

        let err = TimeTool
            .execute(json!({"utc_offset_minutes": 100000}))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
