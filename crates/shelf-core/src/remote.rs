//! The backend surface the sync layer talks to: the pull/push change-log RPCs
//! and plain per-table reads used by the one-time migration.

use async_trait::async_trait;
use reqwest::StatusCode;
use shelf_proto::{PullRequest, PullResponse, PushRequest, PushResponse, RawRecord};
use thiserror::Error;
use tracing::debug;

use crate::session::Session;
use crate::tables::Table;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The backend detected that a push was based on stale knowledge
    #[error("backend reported a conflict: {0}")]
    Conflict(String),

    #[error("backend returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// All changes since `request.last_pulled_at`
    async fn pull_changes(
        &self,
        session: &Session,
        request: PullRequest,
    ) -> Result<PullResponse, RemoteError>;

    /// Hand local changes to the backend
    async fn push_changes(
        &self,
        session: &Session,
        request: PushRequest,
    ) -> Result<PushResponse, RemoteError>;

    /// Every row of `table`, restricted to `user_id` when the table is user-scoped
    async fn fetch_table(
        &self,
        session: &Session,
        table: Table,
        user_id: Option<&str>,
    ) -> Result<Vec<RawRecord>, RemoteError>;
}

/// PostgREST-style HTTP backend.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, api_key)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        session: &Session,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/rest/v1/{}", self.base_url, path);
        let mut builder = self
            .client
            .request(method, url)
            .bearer_auth(session.access_token());
        if let Some(ref key) = self.api_key {
            builder = builder.header("apikey", key);
        }
        builder
    }

    async fn send(builder: reqwest::RequestBuilder) -> Result<String, RemoteError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status == StatusCode::CONFLICT {
            return Err(RemoteError::Conflict(body));
        }
        if !status.is_success() {
            return Err(RemoteError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn pull_changes(
        &self,
        session: &Session,
        request: PullRequest,
    ) -> Result<PullResponse, RemoteError> {
        debug!(last_pulled_at = request.last_pulled_at, "pulling changes");
        let body = Self::send(
            self.request(reqwest::Method::POST, "rpc/pull_changes", session)
                .json(&request),
        )
        .await?;
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn push_changes(
        &self,
        session: &Session,
        request: PushRequest,
    ) -> Result<PushResponse, RemoteError> {
        debug!(records = request.changes.record_count(), "pushing changes");
        let body = Self::send(
            self.request(reqwest::Method::POST, "rpc/push_changes", session)
                .json(&request),
        )
        .await?;

        // A void RPC answers with an empty body
        let trimmed = body.trim();
        let response = if trimmed.is_empty() || trimmed == "null" {
            PushResponse {
                ok: true,
                conflict: false,
                message: None,
            }
        } else {
            serde_json::from_str::<PushResponse>(trimmed)
                .map_err(|e| RemoteError::Decode(e.to_string()))?
        };

        if response.conflict {
            return Err(RemoteError::Conflict(
                response
                    .message
                    .unwrap_or_else(|| "push based on a stale checkpoint".to_string()),
            ));
        }
        if !response.ok {
            return Err(RemoteError::Other(
                response
                    .message
                    .unwrap_or_else(|| "push rejected".to_string()),
            ));
        }
        Ok(response)
    }

    async fn fetch_table(
        &self,
        session: &Session,
        table: Table,
        user_id: Option<&str>,
    ) -> Result<Vec<RawRecord>, RemoteError> {
        let mut query = vec![("select", "*".to_string())];
        if let (Some(column), Some(user_id)) = (table.user_column(), user_id) {
            query.push((column, format!("eq.{}", user_id)));
        }
        let body = Self::send(
            self.request(reqwest::Method::GET, table.name(), session)
                .query(&query),
        )
        .await?;
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}
