//! REST client for revision history and reorder persistence.
//!
//! Thin HTTP wrapper over the itinerary endpoints. Pure parsing lives in
//! [`parse_revision_list`] and [`error_message`] for testability.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::SyncConfig;
use crate::net::types::{DayOrder, ErrorCode, Revision, path_segment};
use crate::services::history::{HistoryApi, HistoryError};
use crate::services::mutation::{MutationError, MutationSink, OptimisticChange};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Http(_) => "E_API_HTTP",
            Self::Status { .. } => "E_API_STATUS",
            Self::Decode(_) => "E_API_DECODE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

impl From<ApiError> for HistoryError {
    fn from(err: ApiError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<ApiError> for MutationError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Status { status, message } if (400..500).contains(&status) => Self::Rejected(message),
            other => Self::Unreachable(other.to_string()),
        }
    }
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns [`ApiError::Http`] when the HTTP client cannot be built.
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ApiError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_owned(),
            auth_token: config.auth_token.clone(),
        })
    }

    pub(crate) fn endpoint(&self, resource_id: &str, tail: &str) -> String {
        format!("{}/itineraries/{}/{tail}", self.base_url, path_segment(resource_id))
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<String, ApiError> {
        let request = match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().await.map_err(|e| ApiError::Http(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ApiError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ApiError::Status { status: status.as_u16(), message: error_message(status.as_u16(), &text) });
        }
        Ok(text)
    }

    /// Ordered revision list for `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] for transport failures, non-2xx statuses, or
    /// bodies that are not a revision list.
    pub async fn list_revisions(&self, resource_id: &str) -> Result<Vec<Revision>, ApiError> {
        let text = self.execute(self.http.get(self.endpoint(resource_id, "revisions"))).await?;
        let body: Value = serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))?;
        let revisions = parse_revision_list(body)?;
        debug!(resource_id, count = revisions.len(), "api: revisions listed");
        Ok(revisions)
    }

    /// # Errors
    ///
    /// Returns an [`ApiError`] for transport failures or non-2xx statuses.
    pub async fn undo(&self, resource_id: &str) -> Result<(), ApiError> {
        self.execute(self.http.post(self.endpoint(resource_id, "undo"))).await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an [`ApiError`] for transport failures or non-2xx statuses.
    pub async fn redo(&self, resource_id: &str) -> Result<(), ApiError> {
        self.execute(self.http.post(self.endpoint(resource_id, "redo"))).await?;
        Ok(())
    }

    /// Persist new activity orders for one or more days as one write.
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] for transport failures or non-2xx statuses.
    pub async fn persist_reorder(&self, resource_id: &str, days: &[DayOrder]) -> Result<(), ApiError> {
        let body = json!({ "days": days });
        self.execute(self.http.put(self.endpoint(resource_id, "days/reorder")).json(&body))
            .await?;
        debug!(resource_id, days = days.len(), "api: reorder persisted");
        Ok(())
    }
}

#[async_trait]
impl HistoryApi for ApiClient {
    async fn list_revisions(&self, resource_id: &str) -> Result<Vec<Revision>, HistoryError> {
        Ok(Self::list_revisions(self, resource_id).await?)
    }

    async fn undo(&self, resource_id: &str) -> Result<(), HistoryError> {
        Ok(Self::undo(self, resource_id).await?)
    }

    async fn redo(&self, resource_id: &str) -> Result<(), HistoryError> {
        Ok(Self::redo(self, resource_id).await?)
    }
}

/// Entity id is the day id; state is its ordered activity ids.
#[async_trait]
impl MutationSink<Vec<String>> for ApiClient {
    async fn persist(&self, resource_id: &str, changes: &[OptimisticChange<Vec<String>>]) -> Result<(), MutationError> {
        Ok(self.persist_reorder(resource_id, &day_orders(changes)).await?)
    }
}

// =============================================================================
// PARSING
// =============================================================================

/// Accept either a bare array or `{"revisions": [...]}`.
///
/// # Errors
///
/// Returns [`ApiError::Decode`] for any other shape.
pub fn parse_revision_list(body: Value) -> Result<Vec<Revision>, ApiError> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(mut map) => map
            .remove("revisions")
            .ok_or_else(|| ApiError::Decode("missing revisions field".into()))?,
        other => return Err(ApiError::Decode(format!("expected revision list, got {other}"))),
    };
    serde_json::from_value(list).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Human-readable error text for a non-2xx response.
///
/// Prefers a JSON `message` (or `error`) field, then the raw body, then the
/// bare status.
#[must_use]
pub fn error_message(status: u16, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(body) {
        let field = ["message", "error"]
            .iter()
            .find_map(|key| parsed.get(key).and_then(Value::as_str));
        if let Some(message) = field {
            return message.to_owned();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() { format!("HTTP {status}") } else { trimmed.to_owned() }
}

/// Reorder payload for a batch of day changes.
#[must_use]
pub fn day_orders(changes: &[OptimisticChange<Vec<String>>]) -> Vec<DayOrder> {
    changes
        .iter()
        .map(|c| DayOrder { day_id: c.entity_id.clone(), activity_ids: c.proposed_state.clone() })
        .collect()
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
