use std::collections::{HashMap, HashSet};

use backend_core::{MessageTimeline, NewMessage, Subscription};
use tokio::time::Instant;

/// State owned by one chat room activation.
///
/// Dropped when the room is left, which releases the subscription with it.
pub(crate) struct RoomSession {
    generation: u64,
    username: String,
    subscription: Option<Subscription>,
    timeline: MessageTimeline,
    confirmed: bool,
    ready_deadline: Option<Instant>,
    fetch_generation: Option<u64>,
    sending: HashSet<String>,
    /// Failed inserts with the error code they failed with.
    failed_sends: HashMap<String, (NewMessage, String)>,
}

impl RoomSession {
    pub(crate) fn new(generation: u64, username: String) -> Self {
        Self {
            generation,
            username,
            subscription: None,
            timeline: MessageTimeline::new(),
            confirmed: false,
            ready_deadline: None,
            fetch_generation: None,
            sending: HashSet::new(),
            failed_sends: HashMap::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn timeline(&self) -> &MessageTimeline {
        &self.timeline
    }

    pub(crate) fn timeline_mut(&mut self) -> &mut MessageTimeline {
        &mut self.timeline
    }

    pub(crate) fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    pub(crate) fn subscription_mut(&mut self) -> Option<&mut Subscription> {
        self.subscription.as_mut()
    }

    /// Install a fresh subscription and hold live events until it is confirmed.
    pub(crate) fn attach_subscription(&mut self, subscription: Subscription, deadline: Instant) {
        self.subscription = Some(subscription);
        self.confirmed = false;
        self.ready_deadline = Some(deadline);
        self.timeline.begin_sync();
    }

    /// Forget a subscription whose feed ended.
    pub(crate) fn detach_subscription(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.confirmed = false;
        self.ready_deadline = None;
    }

    pub(crate) fn ready_deadline(&self) -> Option<Instant> {
        self.ready_deadline
    }

    /// Record a subscription confirmation. Returns whether a bulk load must start now.
    ///
    /// The first confirmation always needs one, since any earlier load may have missed
    /// rows inserted before the stream was live. A resumed stream needs one too.
    pub(crate) fn on_ready(&mut self, resumed: bool) -> bool {
        let first = !self.confirmed;
        self.confirmed = true;
        self.ready_deadline = None;
        first || resumed
    }

    /// Clear an expired confirmation deadline. Returns whether it was armed.
    pub(crate) fn expire_ready_deadline(&mut self) -> bool {
        self.ready_deadline.take().is_some()
    }

    /// Mark `generation` as the only bulk load whose result is accepted.
    pub(crate) fn begin_fetch(&mut self, generation: u64) {
        self.fetch_generation = Some(generation);
        self.timeline.begin_sync();
    }

    pub(crate) fn is_fetching(&self) -> bool {
        self.fetch_generation.is_some()
    }

    /// Accept a bulk load result if it belongs to the latest fetch.
    pub(crate) fn finish_fetch(&mut self, generation: u64) -> bool {
        if self.fetch_generation == Some(generation) {
            self.fetch_generation = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn begin_send(&mut self, client_txn_id: &str) {
        self.sending.insert(client_txn_id.to_owned());
    }

    pub(crate) fn finish_send(&mut self, client_txn_id: &str) {
        self.sending.remove(client_txn_id);
    }

    pub(crate) fn sending(&self) -> impl Iterator<Item = &str> {
        self.sending.iter().map(String::as_str)
    }

    pub(crate) fn record_failed_send(
        &mut self,
        client_txn_id: String,
        message: NewMessage,
        error_code: String,
    ) {
        self.sending.remove(&client_txn_id);
        self.failed_sends.insert(client_txn_id, (message, error_code));
    }

    pub(crate) fn take_failed_send(&mut self, client_txn_id: &str) -> Option<NewMessage> {
        self.failed_sends
            .remove(client_txn_id)
            .map(|(message, _)| message)
    }

    /// `(client_txn_id, error_code)` of every send that can be retried.
    pub(crate) fn failed_sends(&self) -> impl Iterator<Item = (&str, &str)> {
        self.failed_sends
            .iter()
            .map(|(client_txn_id, (_, error_code))| (client_txn_id.as_str(), error_code.as_str()))
    }
}
