//! Downstream CRM collaborators: the custom-field directory and contact updates.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::partition::PartitionKey;

pub const DEFAULT_BASE_URL: &str = "https://gh-connector.vercel.app/proxy";
pub const DEFAULT_FIELD_NAME: &str = "timerdone";
pub const DEFAULT_FIELD_VALUE: &str = "YES";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("downstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("downstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected downstream response: {0}")]
    Decode(String),
}

/// Connection settings for the downstream CRM proxy.
#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub base_url: String,
    /// Sent verbatim as the `Authorization` header.
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Custom field looked up in the directory, matched case-insensitively.
    pub field_name: String,
    /// Value written to the field when a delay elapses.
    pub field_value: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            field_name: DEFAULT_FIELD_NAME.to_string(),
            field_value: DEFAULT_FIELD_VALUE.to_string(),
        }
    }
}

/// Resolves the configured custom field for a partition.
#[async_trait]
pub trait FieldDirectory: Send + Sync {
    /// `Ok(None)` when the directory has no matching field.
    async fn lookup_field_id(
        &self,
        partition: &PartitionKey,
    ) -> Result<Option<String>, DownstreamError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub location_id: String,
    pub entity_id: String,
    pub field_id: String,
    pub value: String,
}

/// Writes a custom field on a contact. Repeating an update is harmless.
#[async_trait]
pub trait ContactUpdater: Send + Sync {
    async fn update_field(&self, update: &FieldUpdate) -> Result<(), DownstreamError>;
}

#[derive(Serialize)]
struct CustomFieldValue<'a> {
    id: &'a str,
    field_value: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContactUpdateBody<'a> {
    custom_fields: Vec<CustomFieldValue<'a>>,
}

/// reqwest-backed implementation of both collaborators.
#[derive(Clone)]
pub struct HttpConnector {
    config: DownstreamConfig,
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(config: DownstreamConfig) -> Result<Self, DownstreamError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DownstreamConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: String,
        location_id: &str,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .header("LocationId", location_id);
        if let Some(api_key) = &self.config.api_key {
            builder = builder.header(reqwest::header::AUTHORIZATION, api_key);
        }
        builder
    }

    async fn check_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DownstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DownstreamError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Find the id of the field named `field_name` in a directory response.
///
/// The proxy answers with either a bare array of fields or an object
/// wrapping them under `customFields`.
pub fn find_field_id(
    payload: &Value,
    field_name: &str,
) -> Result<Option<String>, DownstreamError> {
    let fields = match payload {
        Value::Array(fields) => fields,
        Value::Object(map) => match map.get("customFields") {
            Some(Value::Array(fields)) => fields,
            _ => {
                return Err(DownstreamError::Decode(
                    "expected a customFields array".to_string(),
                ));
            }
        },
        _ => {
            return Err(DownstreamError::Decode(
                "expected an array or object of custom fields".to_string(),
            ));
        }
    };
    let wanted = field_name.to_lowercase();
    Ok(fields
        .iter()
        .find(|field| {
            field
                .get("name")
                .and_then(Value::as_str)
                .is_some_and(|name| name.to_lowercase() == wanted)
        })
        .and_then(|field| field.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string))
}

#[async_trait]
impl FieldDirectory for HttpConnector {
    async fn lookup_field_id(
        &self,
        partition: &PartitionKey,
    ) -> Result<Option<String>, DownstreamError> {
        let location_id = partition.location_id();
        let url = self.url(&format!("locations/{location_id}/customFields"));
        debug!(location_id, "looking up custom field");
        let response = self
            .request(reqwest::Method::GET, url, location_id)
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|err| DownstreamError::Decode(err.to_string()))?;
        find_field_id(&payload, &self.config.field_name)
    }
}

#[async_trait]
impl ContactUpdater for HttpConnector {
    async fn update_field(&self, update: &FieldUpdate) -> Result<(), DownstreamError> {
        let url = self.url(&format!("contacts/{}", update.entity_id));
        let body = ContactUpdateBody {
            custom_fields: vec![CustomFieldValue {
                id: &update.field_id,
                field_value: &update.value,
            }],
        };
        let response = self
            .request(reqwest::Method::PUT, url, &update.location_id)
            .json(&body)
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}
