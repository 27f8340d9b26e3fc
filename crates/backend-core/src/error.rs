use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ChatErrorKind, Route};

/// Stable error codes carried by [`BackendError::code`] besides the [`ChatErrorKind`] codes.
pub mod codes {
    /// A command arrived on a screen that does not accept it.
    pub const INVALID_STATE_TRANSITION: &str = "invalid_state_transition";
    /// The submitted username is blank after trimming.
    pub const EMPTY_USERNAME: &str = "empty_username";
    /// Reading, writing or clearing the persisted identity failed.
    pub const IDENTITY_STORE_FAILED: &str = "identity_store_failed";
    /// `RetrySend` named a transaction with no failed send on record.
    pub const UNKNOWN_CLIENT_TXN: &str = "unknown_client_txn";
}

/// How a failure should be treated: shown as a setup problem, retried, or reported.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Bad settings, rejected project key, or a command the current screen does not accept.
    Config,
    /// Connection, timeout or server-side failure.
    Network,
    /// The backend asked the client to slow down.
    RateLimited,
    /// The local identity store failed.
    Storage,
    /// A payload could not be encoded or decoded.
    Serialization,
    Internal,
}

/// Error payload shared by backends, the runtime and frontends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct BackendError {
    pub category: BackendErrorCategory,
    /// Machine-readable code; see [`codes`] and [`ChatErrorKind::code`].
    pub code: String,
    pub message: String,
    /// Server-provided retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl BackendError {
    pub fn new(
        category: BackendErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Failure of one backend interaction, coded by its kind.
    pub fn for_kind(
        kind: ChatErrorKind,
        category: BackendErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        Self::new(category, kind.code(), message)
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// `action` is not accepted on the `current` screen (`None` before boot).
    pub fn invalid_state(current: Option<&Route>, action: impl Into<String>) -> Self {
        let action = action.into();
        let current = match current {
            Some(Route::Username) => "Username".to_owned(),
            Some(Route::ChatRoom { username }) => format!("ChatRoom({username})"),
            None => "Unbooted".to_owned(),
        };
        Self::new(
            BackendErrorCategory::Internal,
            codes::INVALID_STATE_TRANSITION,
            format!("cannot run '{action}' while navigation is at {current}"),
        )
    }

    pub fn empty_username() -> Self {
        Self::new(
            BackendErrorCategory::Config,
            codes::EMPTY_USERNAME,
            "username must not be blank",
        )
    }

    /// The identity store failed during `operation` (`load`, `save` or `clear`).
    pub fn identity_store(operation: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(
            BackendErrorCategory::Storage,
            codes::IDENTITY_STORE_FAILED,
            format!("failed to {operation} identity: {detail}"),
        )
    }

    pub fn unknown_client_txn(client_txn_id: &str) -> Self {
        Self::new(
            BackendErrorCategory::Internal,
            codes::UNKNOWN_CLIENT_TXN,
            format!("no failed send with id '{client_txn_id}'"),
        )
    }

    /// Network and rate-limit failures may clear up on their own; the rest need a change first.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            BackendErrorCategory::Network | BackendErrorCategory::RateLimited
        )
    }
}

/// Map an HTTP status to a category.
///
/// The backend is authentication-free, so a 401/403 means a wrong project key or policy
/// and is reported as configuration.
pub fn classify_http_status(status: u16) -> BackendErrorCategory {
    match status {
        408 | 429 => BackendErrorCategory::RateLimited,
        400..=499 => BackendErrorCategory::Config,
        500..=599 => BackendErrorCategory::Network,
        _ => BackendErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_statuses_map_to_categories() {
        let cases = [
            (401, BackendErrorCategory::Config),
            (403, BackendErrorCategory::Config),
            (404, BackendErrorCategory::Config),
            (408, BackendErrorCategory::RateLimited),
            (429, BackendErrorCategory::RateLimited),
            (503, BackendErrorCategory::Network),
            (700, BackendErrorCategory::Internal),
        ];
        for (status, category) in cases {
            assert_eq!(classify_http_status(status), category, "status {status}");
        }
    }

    #[test]
    fn invalid_state_error_names_current_route() {
        let err = BackendError::invalid_state(Some(&Route::Username), "send_message");
        assert_eq!(err.code, codes::INVALID_STATE_TRANSITION);
        assert_eq!(err.category, BackendErrorCategory::Internal);
        assert!(err.message.contains("Username"));

        let in_room = BackendError::invalid_state(
            Some(&Route::ChatRoom {
                username: "alice".into(),
            }),
            "join",
        );
        assert!(in_room.message.contains("ChatRoom(alice)"));

        let unbooted = BackendError::invalid_state(None, "join");
        assert!(unbooted.message.contains("Unbooted"));
    }

    #[test]
    fn kind_errors_use_kind_codes() {
        let err = BackendError::for_kind(
            ChatErrorKind::Insert,
            BackendErrorCategory::Network,
            "timed out",
        );
        assert_eq!(err.code, "insert_failed");
        assert_eq!(err.to_string(), "Network:insert_failed: timed out");
    }

    #[test]
    fn identity_store_errors_are_storage_failures() {
        let err = BackendError::identity_store("save", "disk full");
        assert_eq!(err.category, BackendErrorCategory::Storage);
        assert_eq!(err.code, codes::IDENTITY_STORE_FAILED);
        assert_eq!(err.message, "failed to save identity: disk full");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn only_transport_failures_are_recoverable() {
        let network = BackendError::new(BackendErrorCategory::Network, "n", "network");
        let rate = BackendError::new(BackendErrorCategory::RateLimited, "r", "rate")
            .with_retry_after(Duration::from_secs(3));
        let config = BackendError::empty_username();

        assert!(network.is_recoverable());
        assert!(rate.is_recoverable());
        assert_eq!(rate.retry_after_ms, Some(3000));
        assert!(!config.is_recoverable());
    }
}
