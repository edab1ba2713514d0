//! Inbound payload decoding.
//!
//! Producers wrap events as `{"kind": "feed" | "directory" | "schedule",
//! "payload": ...}`. Older feed publishers send a bare FeedMessage, and the
//! scheduler used to send a plain-text `cron schedule ...` tick; both are
//! still accepted.

use serde_json::Value;

use crate::directory::DirectoryEvent;
use crate::error::{PipelineError, Result};

const SCHEDULE_PREFIX: &[u8] = b"cron schedule";

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Undecoded FeedMessage document; normalization happens in the pipeline.
    Feed(Value),
    Directory(DirectoryEvent),
    Schedule,
}

pub fn decode(payload: &[u8]) -> Result<Inbound> {
    if payload.trim_ascii_start().starts_with(SCHEDULE_PREFIX) {
        return Ok(Inbound::Schedule);
    }

    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| PipelineError::MalformedInput(e.to_string()))?;
    let Some(fields) = value.as_object() else {
        return Err(PipelineError::MalformedInput(
            "payload is not a JSON object".to_string(),
        ));
    };

    let kind = match fields.get("kind") {
        None => return Ok(Inbound::Feed(value)),
        Some(Value::String(kind)) => kind.as_str(),
        Some(other) => {
            return Err(PipelineError::MalformedInput(format!(
                "envelope kind must be a string, got {other}"
            )))
        }
    };

    match kind {
        "schedule" => Ok(Inbound::Schedule),
        "feed" => envelope_payload(&value).map(|p| Inbound::Feed(p.clone())),
        "directory" => {
            let event = serde_json::from_value(envelope_payload(&value)?.clone())
                .map_err(|e| PipelineError::MalformedInput(format!("directory event: {e}")))?;
            Ok(Inbound::Directory(event))
        }
        other => Err(PipelineError::MalformedInput(format!(
            "unknown envelope kind {other}"
        ))),
    }
}

fn envelope_payload(envelope: &Value) -> Result<&Value> {
    envelope
        .get("payload")
        .filter(|p| !p.is_null())
        .ok_or_else(|| PipelineError::MalformedInput("envelope has no payload".to_string()))
}
