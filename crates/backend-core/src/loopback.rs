//! In-process message backend used for offline mode and tests.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::{MessageBackend, Subscription, SubscriptionEvent},
    error::{BackendError, BackendErrorCategory},
    timeline::compare_created_at,
    types::{ChatErrorKind, Message, NewMessage},
};

const FANOUT_BUFFER: usize = 256;
const SUBSCRIPTION_BUFFER: usize = 64;

/// Message store kept in memory with broadcast fan-out to subscribers.
///
/// Failure switches and an artificial list delay let tests exercise error and race paths.
#[derive(Clone)]
pub struct LoopbackBackend {
    inner: Arc<LoopbackInner>,
}

struct LoopbackInner {
    messages: Mutex<Vec<Message>>,
    inserts: broadcast::Sender<Message>,
    fail_list: AtomicBool,
    fail_insert: AtomicBool,
    close_feeds: AtomicBool,
    list_delay_ms: AtomicUsize,
    list_calls: AtomicUsize,
    insert_calls: AtomicUsize,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBackend {
    pub fn new() -> Self {
        let (inserts, _) = broadcast::channel(FANOUT_BUFFER);
        Self {
            inner: Arc::new(LoopbackInner {
                messages: Mutex::new(Vec::new()),
                inserts,
                fail_list: AtomicBool::new(false),
                fail_insert: AtomicBool::new(false),
                close_feeds: AtomicBool::new(false),
                list_delay_ms: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
                insert_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Backend pre-filled with stored rows, without notifying subscribers.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let backend = Self::new();
        *backend.lock_messages() = messages;
        backend
    }

    /// Store a row written by another client and fan it out.
    pub fn insert_remote(&self, message: NewMessage) -> Message {
        let stored = message.into_message(Uuid::new_v4().to_string());
        self.lock_messages().push(stored.clone());
        let _ = self.inner.inserts.send(stored.clone());
        stored
    }

    /// Snapshot of stored rows in insertion order.
    pub fn stored_messages(&self) -> Vec<Message> {
        self.lock_messages().clone()
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.inner.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_insert(&self, fail: bool) {
        self.inner.fail_insert.store(fail, Ordering::SeqCst);
    }

    /// Close every new subscription feed before it is confirmed.
    pub fn set_close_feeds(&self, close: bool) {
        self.inner.close_feeds.store(close, Ordering::SeqCst);
    }

    /// Delay every `list_messages` call, to hold a bulk load in flight.
    pub fn set_list_delay(&self, delay: Duration) {
        self.inner
            .list_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> usize {
        self.inner.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.inserts.receiver_count()
    }

    fn lock_messages(&self) -> std::sync::MutexGuard<'_, Vec<Message>> {
        // Every write leaves the vector consistent, so a poisoned lock is still usable.
        self.inner
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageBackend for LoopbackBackend {
    async fn list_messages(&self) -> Result<Vec<Message>, BackendError> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay_ms = self.inner.list_delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }
        if self.inner.fail_list.load(Ordering::SeqCst) {
            return Err(BackendError::for_kind(
                ChatErrorKind::Fetch,
                BackendErrorCategory::Network,
                "loopback list failure requested",
            ));
        }

        let mut messages = self.stored_messages();
        messages.sort_by(compare_created_at);
        Ok(messages)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<(), BackendError> {
        self.inner.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_insert.load(Ordering::SeqCst) {
            return Err(BackendError::for_kind(
                ChatErrorKind::Insert,
                BackendErrorCategory::Network,
                "loopback insert failure requested",
            ));
        }
        let stored = self.insert_remote(message.clone());
        debug!(id = %stored.id, "loopback stored message");
        Ok(())
    }

    async fn subscribe_inserts(&self) -> Result<Subscription, BackendError> {
        let mut inserts = self.inner.inserts.subscribe();
        let (feed, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
        if self.inner.close_feeds.load(Ordering::SeqCst) {
            debug!("loopback closing subscription feed before ready");
            drop(feed);
            return Ok(subscription);
        }

        let task = tokio::spawn(async move {
            if !feed.deliver(SubscriptionEvent::Ready { resumed: false }).await {
                return;
            }
            loop {
                tokio::select! {
                    _ = feed.released() => break,
                    received = inserts.recv() => match received {
                        Ok(message) => {
                            if !feed.deliver(SubscriptionEvent::Inserted(message)).await {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "loopback subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(subscription.with_task(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_insert(subscription: &mut Subscription) -> Message {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
                .await
                .expect("event timeout")
                .expect("subscription closed");
            if let SubscriptionEvent::Inserted(message) = event {
                return message;
            }
        }
    }

    #[tokio::test]
    async fn lists_in_created_at_order() {
        let backend = LoopbackBackend::new();
        backend.insert_remote(NewMessage {
            username: "bob".into(),
            content: "second".into(),
            created_at: "2024-01-01T00:00:02Z".into(),
        });
        backend.insert_remote(NewMessage {
            username: "bob".into(),
            content: "first".into(),
            created_at: "2024-01-01T00:00:01Z".into(),
        });

        let listed = backend.list_messages().await.expect("list should work");
        let bodies: Vec<_> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
        assert_eq!(backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn insert_is_fanned_out_to_subscribers() {
        let backend = LoopbackBackend::new();
        let mut subscription = backend
            .subscribe_inserts()
            .await
            .expect("subscribe should work");

        backend
            .insert_message(&NewMessage::now("alice", "hello"))
            .await
            .expect("insert should work");

        let delivered = next_insert(&mut subscription).await;
        assert_eq!(delivered.username, "alice");
        assert_eq!(delivered.content, "hello");
        assert!(!delivered.id.is_empty());
    }

    #[tokio::test]
    async fn failure_switches_surface_errors() {
        let backend = LoopbackBackend::new();
        backend.set_fail_list(true);
        backend.set_fail_insert(true);

        assert!(backend.list_messages().await.is_err());
        assert!(
            backend
                .insert_message(&NewMessage::now("alice", "x"))
                .await
                .is_err()
        );
        assert!(backend.stored_messages().is_empty());
        assert_eq!(backend.insert_calls(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_releases_fanout_receiver() {
        let backend = LoopbackBackend::new();
        let subscription = backend
            .subscribe_inserts()
            .await
            .expect("subscribe should work");
        assert_eq!(backend.subscriber_count(), 1);

        subscription.unsubscribe();
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("receiver should be released");
    }
}
