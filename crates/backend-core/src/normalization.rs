use crate::{
    error::BackendError,
    types::{BackendEvent, ChatErrorKind, SendAck, StreamError},
};

/// Insert result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The backend accepted the row; it will arrive through the live stream.
    Accepted,
    /// The insert failed.
    Failed { error: BackendError },
}

impl From<Result<(), BackendError>> for InsertOutcome {
    fn from(result: Result<(), BackendError>) -> Self {
        match result {
            Ok(()) => Self::Accepted,
            Err(error) => Self::Failed { error },
        }
    }
}

/// Convert an insert outcome to a stable `BackendEvent::SendAck`.
pub fn normalize_insert_outcome(
    client_txn_id: impl Into<String>,
    outcome: InsertOutcome,
) -> BackendEvent {
    let client_txn_id = client_txn_id.into();
    match outcome {
        InsertOutcome::Accepted => BackendEvent::SendAck(SendAck {
            client_txn_id,
            error_code: None,
        }),
        InsertOutcome::Failed { error } => BackendEvent::SendAck(SendAck {
            client_txn_id,
            error_code: Some(error.code),
        }),
    }
}

/// Convert a fetch or subscription failure into a non-fatal `StreamError` event.
pub fn normalize_stream_error(kind: ChatErrorKind, error: BackendError) -> BackendEvent {
    // Subscription drops are retried by the adapter itself; fetches need a manual reload.
    let retryable = match kind {
        ChatErrorKind::Fetch => true,
        ChatErrorKind::Subscription | ChatErrorKind::Insert => error.is_recoverable(),
    };
    BackendEvent::StreamError(StreamError {
        kind,
        error,
        retryable,
    })
}

/// Convert an error into a `FatalError` event.
pub fn normalize_fatal_error(error: BackendError) -> BackendEvent {
    let recoverable = error.is_recoverable();
    BackendEvent::FatalError {
        code: error.code,
        message: error.message,
        recoverable,
    }
}
