//! Core contract shared between the session runtime, backend adapters and frontends.
//!
//! This crate defines the command/event protocol, the two-screen navigation model, the
//! snapshot/live timeline merge, retry and normalization helpers, and the message backend
//! abstraction.

/// Message backend trait and live subscription handles.
pub mod backend;
/// Async command/event channel primitives.
pub mod channel;
/// Stable backend error types and HTTP classification helpers.
pub mod error;
/// In-process backend for offline mode and tests.
pub mod loopback;
/// Event normalization helpers (send acknowledgements, stream errors).
pub mod normalization;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Two-screen navigation state machine.
pub mod state_machine;
/// Snapshot/live timeline merge.
pub mod timeline;
/// Frontend-facing protocol types (commands, events, messages).
pub mod types;

pub use backend::{MessageBackend, Subscription, SubscriptionEvent, SubscriptionFeed};
pub use channel::{BackendChannelError, BackendChannels, EventStream, StreamItem};
pub use error::{BackendError, BackendErrorCategory, classify_http_status, codes};
pub use loopback::LoopbackBackend;
pub use normalization::{
    InsertOutcome, normalize_fatal_error, normalize_insert_outcome, normalize_stream_error,
};
pub use retry::{Backoff, RetryPolicy};
pub use state_machine::{NavigationStateMachine, normalize_username};
pub use timeline::{LiveDelivery, MessageTimeline, SyncPhase};
pub use types::{
    BackendCommand, BackendEvent, ChatErrorKind, Message, NewMessage, Route, SendAck,
    StateReplay, StreamError, StreamState, SyncStatus, now_timestamp, parse_timestamp,
};
