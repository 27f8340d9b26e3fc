use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::BackendError,
    types::{Message, NewMessage},
};

/// Event delivered by a live insert subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The backend confirmed the subscription. `resumed` is set after a reconnect, when
    /// inserts may have been missed.
    Ready { resumed: bool },
    /// A row was inserted.
    Inserted(Message),
    /// The stream dropped; the adapter retries after `retry_in` unless it gave up.
    Dropped {
        error: BackendError,
        retry_in: Option<Duration>,
    },
}

/// Hosted message store consumed by the session runtime.
#[async_trait]
pub trait MessageBackend: Send + Sync + 'static {
    /// All messages ordered by `created_at` ascending.
    async fn list_messages(&self) -> Result<Vec<Message>, BackendError>;

    /// Insert one message. The stored row is delivered through subscriptions.
    async fn insert_message(&self, message: &NewMessage) -> Result<(), BackendError>;

    /// Open a live stream of inserted rows.
    async fn subscribe_inserts(&self) -> Result<Subscription, BackendError>;
}

/// Producer side of a [`Subscription`], held by adapter tasks.
#[derive(Debug, Clone)]
pub struct SubscriptionFeed {
    tx: mpsc::Sender<SubscriptionEvent>,
    cancel: CancellationToken,
}

impl SubscriptionFeed {
    /// Deliver one event. Returns `false` once the consumer released the subscription.
    pub async fn deliver(&self, event: SubscriptionEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// Resolves once the consumer released or dropped the subscription.
    pub async fn released(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Token cancelled on release, for adapters that spawn nested work.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Consumer handle for a live insert stream.
///
/// Releasing the handle, explicitly or by dropping it, cancels the feed and aborts the
/// adapter tasks attached to it, so no connection outlives its consumer.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<SubscriptionEvent>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Create a connected feed/handle pair.
    pub fn channel(buffer: usize) -> (SubscriptionFeed, Self) {
        let (tx, events) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            SubscriptionFeed {
                tx,
                cancel: cancel.clone(),
            },
            Self {
                events,
                cancel,
                tasks: Vec::new(),
            },
        )
    }

    /// Tie an adapter task's lifetime to this handle.
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Next event, or `None` when the feed is gone.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    pub fn is_released(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the stream and release its connection.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        self.cancel.cancel();
        self.events.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorCategory;

    fn message(id: &str) -> Message {
        Message {
            id: id.to_owned(),
            username: "bob".to_owned(),
            content: "hi".to_owned(),
            created_at: "2024-01-01T00:00:00Z".to_owned(),
        }
    }

    #[tokio::test]
    async fn feed_delivers_until_released() {
        let (feed, mut subscription) = Subscription::channel(4);
        assert!(feed.deliver(SubscriptionEvent::Inserted(message("1"))).await);
        assert_eq!(
            subscription.recv().await,
            Some(SubscriptionEvent::Inserted(message("1")))
        );

        subscription.unsubscribe();
        assert!(feed.is_released());
        assert!(!feed.deliver(SubscriptionEvent::Ready { resumed: false }).await);
    }

    #[tokio::test]
    async fn dropping_handle_aborts_attached_tasks() {
        let (feed, subscription) = Subscription::channel(4);
        let task = tokio::spawn(async move {
            feed.released().await;
        });
        let token = CancellationToken::new();
        let token_for_task = token.clone();
        let long_running = tokio::spawn(async move {
            token_for_task.cancelled().await;
        });
        let abort_handle = long_running.abort_handle();

        let subscription = subscription.with_task(long_running);
        drop(subscription);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("feed should observe release")
            .expect("feed task should finish");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(abort_handle.is_finished());
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn carries_drop_events_with_retry_hint() {
        let (feed, mut subscription) = Subscription::channel(4);
        let error = BackendError::new(BackendErrorCategory::Network, "socket_closed", "eof");
        feed.deliver(SubscriptionEvent::Dropped {
            error: error.clone(),
            retry_in: Some(Duration::from_millis(500)),
        })
        .await;

        match subscription.recv().await {
            Some(SubscriptionEvent::Dropped { error: got, retry_in }) => {
                assert_eq!(got, error);
                assert_eq!(retry_in, Some(Duration::from_millis(500)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
