//! REST calls the sync layer consumes.
//!
//! [`CanvasApi`] is the seam [`SectionSync`](crate::sync::SectionSync) is
//! written against; [`RestClient`] implements it over `reqwest`.
//!
//! ERROR HANDLING
//! ==============
//! Every failure is an [`ApiError`]: unreachable server (`Network`),
//! non-2xx response (`Status`, message taken from the JSON `message` field
//! when present), or a body that does not parse into the expected shape
//! (`Decode`). Callers decide how to surface them; nothing here logs.

use frames::string_or_number;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("error parsing response: {0}")]
    Decode(String),
}

/// One editable section of an idea canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub text: String,
}

/// One audit-trail entry. `text` is present on single-entry reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub author: String,
    /// Milliseconds since the Unix epoch.
    #[serde(deserialize_with = "millis_or_rfc3339")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// REST operations on one idea's sections and history.
#[async_trait::async_trait]
pub trait CanvasApi: Send + Sync {
    /// `GET /ideas/{id}/sections`
    async fn list_sections(&self, idea_id: &str) -> Result<Vec<Section>, ApiError>;

    /// `PUT /ideas/{id}/sections/{sectionId}` with `{text}`.
    async fn update_section(&self, idea_id: &str, section_id: &str, text: &str) -> Result<(), ApiError>;

    /// `POST /ideas/{id}/sections/{sectionId}/history` with `{text}`.
    /// Returns the created entry exactly as the server sent it.
    async fn append_history(&self, idea_id: &str, section_id: &str, text: &str) -> Result<Value, ApiError>;

    /// `GET /ideas/{id}/history`, in server order.
    async fn list_history(&self, idea_id: &str) -> Result<Vec<HistoryEntry>, ApiError>;

    /// `GET /ideas/{id}/history/{entryId}`
    async fn get_history_entry(&self, idea_id: &str, entry_id: &str) -> Result<HistoryEntry, ApiError>;

    /// `POST /ideas/{id}/history/{entryId}/revert`
    async fn revert_history(&self, idea_id: &str, entry_id: &str) -> Result<(), ApiError>;
}

/// JSON-over-HTTP client with optional bearer authentication.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl RestClient {
    /// Client rooted at `base_url` (trailing slashes ignored).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidUrl`] when `base_url` is not an absolute URL
    /// and [`ApiError::Network`] when the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/').to_owned();
        reqwest::Url::parse(&base_url).map_err(|_| ApiError::InvalidUrl(base_url.clone()))?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self { http, base_url, token })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Issue one request and return the response body: parsed JSON when the
    /// server says so, otherwise the raw text as a JSON string.
    ///
    /// # Errors
    ///
    /// See the module docs.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        let url = join_url(&self.base_url, path)?;
        let mut request = self.http.request(method.clone(), url).header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(body) = body.filter(|_| sends_body(&method)) {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));

        let data = if is_json {
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice::<Value>(&bytes).map_err(|error| ApiError::Decode(error.to_string()))?
            }
        } else {
            Value::String(response.text().await?)
        };

        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), message: error_message(&data) });
        }
        Ok(data)
    }

    /// # Errors
    ///
    /// See [`RestClient::request`].
    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.request(Method::GET, path, None).await
    }

    /// # Errors
    ///
    /// See [`RestClient::request`].
    pub async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        self.request(Method::POST, path, body).await
    }

    /// # Errors
    ///
    /// See [`RestClient::request`].
    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, ApiError> {
        self.request(Method::PUT, path, Some(body)).await
    }

}

#[async_trait::async_trait]
impl CanvasApi for RestClient {
    async fn list_sections(&self, idea_id: &str) -> Result<Vec<Section>, ApiError> {
        let data = self.get(&sections_path(idea_id)).await?;
        decode(data)
    }

    async fn update_section(&self, idea_id: &str, section_id: &str, text: &str) -> Result<(), ApiError> {
        let path = format!("{}/{}", sections_path(idea_id), encode(section_id));
        self.put(&path, &serde_json::json!({ "text": text })).await?;
        Ok(())
    }

    async fn append_history(&self, idea_id: &str, section_id: &str, text: &str) -> Result<Value, ApiError> {
        let path = format!("{}/{}/history", sections_path(idea_id), encode(section_id));
        self.post(&path, Some(&serde_json::json!({ "text": text }))).await
    }

    async fn list_history(&self, idea_id: &str) -> Result<Vec<HistoryEntry>, ApiError> {
        let data = self.get(&history_path(idea_id)).await?;
        decode(data)
    }

    async fn get_history_entry(&self, idea_id: &str, entry_id: &str) -> Result<HistoryEntry, ApiError> {
        let data = self.get(&format!("{}/{}", history_path(idea_id), encode(entry_id))).await?;
        decode(data)
    }

    async fn revert_history(&self, idea_id: &str, entry_id: &str) -> Result<(), ApiError> {
        let path = format!("{}/{}/revert", history_path(idea_id), encode(entry_id));
        self.post(&path, None).await?;
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn sections_path(idea_id: &str) -> String {
    format!("/ideas/{}/sections", encode(idea_id))
}

fn history_path(idea_id: &str) -> String {
    format!("/ideas/{}/history", encode(idea_id))
}

fn encode(segment: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(segment)
}

fn join_url(base_url: &str, path: &str) -> Result<reqwest::Url, ApiError> {
    let raw = format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'));
    reqwest::Url::parse(&raw).map_err(|_| ApiError::InvalidUrl(raw))
}

/// GET and DELETE never carry a body.
fn sends_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::DELETE
}

/// Prefer the JSON `message` field, then a plain-text body, then the raw JSON.
fn error_message(data: &Value) -> String {
    if let Some(message) = data.get("message").and_then(Value::as_str) {
        return message.to_owned();
    }
    match data {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, ApiError> {
    serde_json::from_value(data).map_err(|error| ApiError::Decode(error.to_string()))
}

/// Timestamps arrive as epoch milliseconds or as RFC 3339 strings; both
/// normalize to milliseconds.
fn millis_or_rfc3339<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64().ok_or_else(|| D::Error::custom(format!("timestamp out of range: {n}"))),
        Value::String(s) => {
            if let Ok(millis) = s.trim().parse::<i64>() {
                return Ok(millis);
            }
            let at = OffsetDateTime::parse(s.trim(), &Rfc3339)
                .map_err(|error| D::Error::custom(format!("invalid timestamp `{s}`: {error}")))?;
            i64::try_from(at.unix_timestamp_nanos() / 1_000_000)
                .map_err(|_| D::Error::custom(format!("timestamp out of range: {s}")))
        }
        other => Err(D::Error::custom(format!("expected timestamp, got {other}"))),
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
