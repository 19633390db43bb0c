use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent from the client to the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundFrame {
    Ping,
}

impl OutboundFrame {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frames received from the stream, classified by their `type` tag
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `{ "type": "alert", "alert": { "desc": "..." } }`
    Alert { description: String },
    /// Anything else; left to the normalizer
    Telemetry(Value),
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::classify(value)
    }

    /// An alert frame must carry an `alert` member; one without it is malformed
    /// and is not counted.
    pub fn classify(value: Value) -> Result<Self> {
        if value.get("type").and_then(Value::as_str) != Some("alert") {
            return Ok(InboundFrame::Telemetry(value));
        }

        let alert = match value.get("alert") {
            Some(Value::Null) | None => {
                return Err(AppError::Frame("alert frame without alert body".to_string()))
            }
            Some(alert) => alert,
        };

        let description = match alert.get("desc") {
            Some(Value::String(desc)) => desc.clone(),
            Some(Value::Null) | None => "unknown alert".to_string(),
            Some(other) => other.to_string(),
        };

        Ok(InboundFrame::Alert { description })
    }
}

/// Target identifiers are restricted to the characters the stream route accepts.
pub fn validate_target_id(target_id: &str) -> Result<()> {
    let valid = !target_id.is_empty()
        && target_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidTarget(target_id.to_string()))
    }
}

/// Stream address for a target: `<base_url>/<target_id>/`
pub fn endpoint_url(base_url: &str, target_id: &str) -> Result<String> {
    validate_target_id(target_id)?;
    Ok(format!("{}/{}/", base_url.trim_end_matches('/'), target_id))
}
