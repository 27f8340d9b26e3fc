use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::BackendError;

/// One chat message as stored by the hosted backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Backend-assigned identifier. Numeric ids are normalized to strings.
    #[serde(deserialize_with = "deserialize_message_id")]
    pub id: String,
    /// Sender display name at send time.
    pub username: String,
    /// User-authored body.
    pub content: String,
    /// ISO-8601 creation timestamp, assigned by the sending client.
    pub created_at: String,
}

impl Message {
    /// Parsed creation time, when `created_at` is a recognizable timestamp.
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.created_at)
    }
}

/// Insert payload: a message before the backend assigned it an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewMessage {
    pub username: String,
    pub content: String,
    pub created_at: String,
}

impl NewMessage {
    /// Build an insert payload stamped with the current time.
    pub fn now(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
            created_at: now_timestamp(),
        }
    }

    /// Attach a backend id.
    pub fn into_message(self, id: impl Into<String>) -> Message {
        Message {
            id: id.into(),
            username: self.username,
            content: self.content,
            created_at: self.created_at,
        }
    }
}

/// Current time as RFC 3339 UTC with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse the timestamp shapes produced by clients and by Postgres.
///
/// Accepts RFC 3339 (`2024-01-01T00:00:00Z`, `...+00:00`) and zone-less values, which are
/// read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMessageId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

fn deserialize_message_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawMessageId::deserialize(deserializer)? {
        RawMessageId::Text(value) => value,
        RawMessageId::Signed(value) => value.to_string(),
        RawMessageId::Unsigned(value) => value.to_string(),
    })
}

/// Screen the client is currently showing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Route {
    /// Username entry screen.
    Username,
    /// Chat room joined under `username`.
    ChatRoom {
        /// Identity used for sending and for own-message grouping.
        username: String,
    },
}

/// Command channel input accepted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendCommand {
    /// Read the persisted identity and pick the initial screen.
    Boot,
    /// Persist `username` and enter the chat room.
    Join {
        /// Raw user input; trimmed before use.
        username: String,
    },
    /// Insert one message as the current identity.
    SendMessage {
        /// Frontend-provided transaction ID echoed in `SendAck`.
        client_txn_id: String,
        /// Draft text, sent as typed.
        body: String,
    },
    /// Re-submit a send that previously failed.
    RetrySend {
        /// Transaction ID of the failed send.
        client_txn_id: String,
    },
    /// Re-run the bulk load and splice, for example after a fetch failure.
    ReloadMessages,
    /// Forget the identity and return to the username screen.
    ResetIdentity,
    /// Re-send the whole frontend-visible state as one `StateReplay` event.
    Resync {
        /// Frontend-chosen ID echoed in the replay.
        resync_id: u64,
    },
    /// Release resources and stop the runtime.
    Shutdown,
}

/// Live stream health reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamState {
    /// No room is active.
    Idle,
    /// Subscription opened, bulk load in flight.
    Syncing,
    /// Snapshot applied and live events flowing.
    Live,
    /// Subscription dropped and the adapter is reconnecting.
    Reconnecting,
}

/// Stream status update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    /// Current stream state.
    pub state: StreamState,
    /// Optional hint about the next reconnect attempt.
    pub retry_in_ms: Option<u64>,
}

/// Which backend interaction failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorKind {
    /// Bulk load failed.
    Fetch,
    /// Message insert failed.
    Insert,
    /// Live subscription dropped or could not be opened.
    Subscription,
}

impl ChatErrorKind {
    /// Stable machine-readable code for this failure kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::Fetch => "fetch_failed",
            Self::Insert => "insert_failed",
            Self::Subscription => "subscription_dropped",
        }
    }
}

/// Non-fatal stream failure surfaced to the frontend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamError {
    pub kind: ChatErrorKind,
    /// Underlying backend error.
    pub error: BackendError,
    /// Whether a manual `ReloadMessages` is expected to help.
    pub retryable: bool,
}

/// Acknowledgement for `SendMessage` and `RetrySend`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendAck {
    /// Original frontend transaction ID.
    pub client_txn_id: String,
    /// Stable backend error code on failure.
    pub error_code: Option<String>,
}

/// Snapshot of runtime state for a frontend that missed events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateReplay {
    /// ID from the `Resync` command being answered.
    pub resync_id: u64,
    /// Current screen, `None` before boot.
    pub route: Option<Route>,
    /// Timeline in display order; empty outside the room.
    pub messages: Vec<Message>,
    pub sync: SyncStatus,
    /// Transaction IDs whose insert has not completed yet.
    pub sending: Vec<String>,
    /// Failed sends still available to `RetrySend`.
    pub failed: Vec<SendAck>,
}

/// Event channel output emitted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendEvent {
    /// Navigation moved to a new screen.
    RouteChanged {
        /// Route now on top of the stack.
        route: Route,
    },
    /// Full timeline replacement after a bulk load and splice.
    TimelineSnapshot {
        /// Messages in display order.
        messages: Vec<Message>,
    },
    /// One live message appended at the tail.
    TimelineAppend {
        message: Message,
    },
    /// Timeline discarded because the room was left.
    TimelineCleared,
    /// Stream status update.
    SyncStatus(SyncStatus),
    /// Send acknowledgement.
    SendAck(SendAck),
    /// Fetch or subscription failure; the room stays usable.
    StreamError(StreamError),
    /// Everything a frontend shows, sent in answer to `Resync`.
    StateReplay(StateReplay),
    /// Command processing failure.
    FatalError {
        /// Stable backend error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
