use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{trace, warn};

use crate::types::{BackendCommand, BackendEvent};

/// Errors returned by runtime channel operations.
#[derive(Debug, Error)]
pub enum BackendChannelError {
    /// The runtime stopped and no longer accepts commands.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command sender plus event fan-out shared by the session runtime and its frontends.
#[derive(Clone, Debug)]
pub struct BackendChannels {
    command_tx: mpsc::Sender<BackendCommand>,
    event_tx: broadcast::Sender<BackendEvent>,
}

impl BackendChannels {
    /// Build the channel set; the runtime keeps the returned command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<BackendCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Events emitted after this call.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            events: self.event_tx.subscribe(),
            skipped: 0,
        }
    }

    pub async fn send_command(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| BackendChannelError::CommandChannelClosed)
    }

    /// Publish `event` to every live subscriber. Having none is not an error.
    pub fn emit(&self, event: BackendEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("event emitted with no subscribers");
        }
    }
}

/// One read from an [`EventStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Event(BackendEvent),
    /// The subscriber fell behind and `skipped` events were overwritten. State built from
    /// earlier events is stale until the runtime answers a `Resync`.
    Lagged { skipped: u64 },
}

/// One frontend's view of runtime events.
#[derive(Debug)]
pub struct EventStream {
    events: broadcast::Receiver<BackendEvent>,
    skipped: u64,
}

impl EventStream {
    /// Next event or lag marker, or `None` once the runtime is gone.
    pub async fn next(&mut self) -> Option<StreamItem> {
        match self.events.recv().await {
            Ok(event) => Some(StreamItem::Event(event)),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(skipped = count, "event subscriber lagged behind");
                self.skipped += count;
                Some(StreamItem::Lagged { skipped: count })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Events lost to lag so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
