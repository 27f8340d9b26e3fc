//! PostgREST access to the messages table.

use std::time::Duration;

use backend_core::{
    BackendError, BackendErrorCategory, ChatErrorKind, Message, NewMessage, classify_http_status,
};
use reqwest::{Response, StatusCode, header::RETRY_AFTER};
use tracing::{debug, warn};

use crate::config::SupabaseConfig;

#[derive(Clone)]
pub(crate) struct PostgrestClient {
    http_client: reqwest::Client,
    table_url: String,
    anon_key: String,
}

impl PostgrestClient {
    pub(crate) fn new(config: &SupabaseConfig) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| {
                BackendError::new(
                    BackendErrorCategory::Config,
                    "http_client_build_failed",
                    err.to_string(),
                )
            })?;

        Ok(Self {
            http_client,
            table_url: config.rest_url(),
            anon_key: config.anon_key().to_owned(),
        })
    }

    /// All rows ordered by `created_at` ascending.
    pub(crate) async fn list_messages(&self) -> Result<Vec<Message>, BackendError> {
        let response = self
            .http_client
            .get(&self.table_url)
            .query(&[("select", "*"), ("order", "created_at.asc")])
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .send()
            .await
            .map_err(|err| map_reqwest_error(ChatErrorKind::Fetch, err))?;
        let response = check_response(ChatErrorKind::Fetch, response).await?;

        let messages: Vec<Message> = response
            .json()
            .await
            .map_err(|err| map_reqwest_error(ChatErrorKind::Fetch, err))?;
        debug!(count = messages.len(), "listed messages");
        Ok(messages)
    }

    pub(crate) async fn insert_message(&self, message: &NewMessage) -> Result<(), BackendError> {
        let response = self
            .http_client
            .post(&self.table_url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Prefer", "return=minimal")
            .json(&[message])
            .send()
            .await
            .map_err(|err| map_reqwest_error(ChatErrorKind::Insert, err))?;
        check_response(ChatErrorKind::Insert, response).await?;

        debug!(username = %message.username, "inserted message");
        Ok(())
    }
}

async fn check_response(kind: ChatErrorKind, response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    warn!(%status, kind = kind.code(), "Supabase request failed: {body}");
    Err(http_status_error(kind, status, &body, retry_after))
}

pub(crate) fn http_status_error(
    kind: ChatErrorKind,
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> BackendError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };
    let error = BackendError::for_kind(kind, classify_http_status(status.as_u16()), message);
    match retry_after {
        Some(delay) => error.with_retry_after(delay),
        None => error,
    }
}

fn map_reqwest_error(kind: ChatErrorKind, err: reqwest::Error) -> BackendError {
    let category = if err.is_decode() {
        BackendErrorCategory::Serialization
    } else if err.is_builder() {
        BackendErrorCategory::Config
    } else if let Some(status) = err.status() {
        classify_http_status(status.as_u16())
    } else {
        BackendErrorCategory::Network
    };
    BackendError::for_kind(kind, category, err.to_string())
}
