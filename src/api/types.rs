//! Inbound webhook payloads and response bodies.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::enqueue::{EnqueueError, EnqueueRequest, Enqueued};
use crate::partition::PartitionKey;
use crate::schedule::DelayRangeError;

/// `meta.key` marking the alternate `extras` payload shape.
pub const EXTRAS_PAYLOAD_KEY: &str = "humanizer_drip";

const TIME_FRAME_SEPARATOR: &str = "to";

#[derive(Debug, Default, Deserialize)]
pub struct IdRef {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CustomData {
    #[serde(default, rename = "TimeFrame")]
    pub time_frame: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extras {
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default, rename = "TimeFrame")]
    pub time_frame: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub key: Option<String>,
}

/// Either webhook shape. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub contact_id: Option<String>,
    #[serde(default)]
    pub location: Option<IdRef>,
    #[serde(default)]
    pub workflow: Option<IdRef>,
    #[serde(default, rename = "customData")]
    pub custom_data: Option<CustomData>,
    #[serde(default)]
    pub extras: Option<Extras>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

/// Fields common to both payload shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedPayload {
    pub contact_id: Option<String>,
    pub location_id: Option<String>,
    pub workflow_id: Option<String>,
    pub time_frame: Option<String>,
}

impl WebhookPayload {
    pub fn normalize(self) -> NormalizedPayload {
        let uses_extras = self
            .meta
            .as_ref()
            .and_then(|meta| meta.key.as_deref())
            .is_some_and(|key| key == EXTRAS_PAYLOAD_KEY);
        if uses_extras {
            if let Some(extras) = self.extras {
                return NormalizedPayload {
                    contact_id: extras.contact_id,
                    location_id: extras.location_id,
                    workflow_id: extras.workflow_id,
                    time_frame: extras.time_frame,
                };
            }
        }
        NormalizedPayload {
            contact_id: self.contact_id,
            location_id: self.location.and_then(|location| location.id),
            workflow_id: self.workflow.and_then(|workflow| workflow.id),
            time_frame: self.custom_data.and_then(|data| data.time_frame),
        }
    }
}

impl NormalizedPayload {
    pub fn into_request(self) -> Result<EnqueueRequest, EnqueueError> {
        let contact_id =
            non_empty(self.contact_id).ok_or(EnqueueError::MissingField("contact_id"))?;
        let location_id =
            non_empty(self.location_id).ok_or(EnqueueError::MissingField("location.id"))?;
        let time_frame =
            non_empty(self.time_frame).ok_or(EnqueueError::MissingField("TimeFrame"))?;
        let (min_delay_seconds, max_delay_seconds) = parse_time_frame(&time_frame)?;
        Ok(EnqueueRequest {
            entity_id: contact_id,
            partition: PartitionKey::new(location_id, self.workflow_id.as_deref()),
            min_delay_seconds,
            max_delay_seconds,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse `"<min> to <max>"` into whole seconds. Decimals are floored.
pub fn parse_time_frame(raw: &str) -> Result<(i64, i64), DelayRangeError> {
    let lowered = raw.trim().to_ascii_lowercase();
    let malformed = || DelayRangeError::Malformed(raw.to_string());
    let (min, max) = lowered
        .split_once(TIME_FRAME_SEPARATOR)
        .ok_or_else(malformed)?;
    let min = parse_seconds(min).ok_or_else(malformed)?;
    let max = parse_seconds(max).ok_or_else(malformed)?;
    Ok((min, max))
}

fn parse_seconds(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    if !value.is_finite() || value > i64::MAX as f64 {
        return None;
    }
    Some(value.floor() as i64)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub success: bool,
    pub scheduled_at: String,
    pub delay_seconds: i64,
}

impl From<&Enqueued> for EnqueueResponse {
    fn from(enqueued: &Enqueued) -> Self {
        Self {
            success: true,
            scheduled_at: format_timestamp(enqueued.run_at()),
            delay_seconds: enqueued.delay_seconds(),
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}
