use std::{cmp::Ordering, collections::HashSet};

use tracing::trace;

use crate::types::Message;

/// Where the timeline is in its snapshot/live cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// No room is active; live events are ignored.
    Idle,
    /// Subscription is open and the bulk load is in flight; live events are held back.
    Buffering,
    /// Snapshot applied; live events append at the tail.
    Live,
}

/// Result of offering one live event to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveDelivery {
    /// Appended at the tail.
    Appended,
    /// Held until the snapshot arrives.
    Buffered,
    /// Already present (or already buffered); dropped.
    Duplicate,
    /// Timeline is idle; dropped.
    Ignored,
}

/// In-memory message sequence merged from one bulk load and the live insert stream.
///
/// The subscription is expected to be opened before the bulk load. Events seen in the
/// meantime are buffered and spliced after the snapshot, skipping ids the snapshot already
/// holds, so each message id appears exactly once.
#[derive(Debug, Clone)]
pub struct MessageTimeline {
    items: Vec<Message>,
    seen_ids: HashSet<String>,
    buffered: Vec<Message>,
    phase: SyncPhase,
}

impl Default for MessageTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            seen_ids: HashSet::new(),
            buffered: Vec::new(),
            phase: SyncPhase::Idle,
        }
    }

    /// Current messages in display order.
    pub fn items(&self) -> &[Message] {
        &self.items
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// Number of live events waiting for the snapshot.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Start buffering live events ahead of a bulk load.
    ///
    /// Items from an earlier snapshot stay visible until the new snapshot replaces them.
    /// Restarting a sync that is already buffering keeps the events held so far.
    pub fn begin_sync(&mut self) {
        self.phase = SyncPhase::Buffering;
    }

    /// Replace the sequence with `snapshot` and splice buffered events after it.
    ///
    /// Returns how many buffered events were appended.
    pub fn apply_snapshot(&mut self, mut snapshot: Vec<Message>) -> usize {
        snapshot.sort_by(compare_created_at);

        self.items.clear();
        self.seen_ids.clear();
        for message in snapshot {
            if self.seen_ids.insert(message.id.clone()) {
                self.items.push(message);
            }
        }

        let spliced = self.flush_buffered();
        trace!(
            snapshot_len = self.items.len() - spliced,
            spliced, "applied timeline snapshot"
        );
        spliced
    }

    /// Give up on the pending bulk load and keep what the live stream delivered.
    ///
    /// Returns how many buffered events were appended.
    pub fn abandon_sync(&mut self) -> usize {
        if self.phase != SyncPhase::Buffering {
            return 0;
        }
        self.flush_buffered()
    }

    /// Offer one live event.
    pub fn push_live(&mut self, message: Message) -> LiveDelivery {
        match self.phase {
            SyncPhase::Idle => LiveDelivery::Ignored,
            SyncPhase::Buffering => {
                if self.buffered.iter().any(|held| held.id == message.id) {
                    LiveDelivery::Duplicate
                } else {
                    self.buffered.push(message);
                    LiveDelivery::Buffered
                }
            }
            SyncPhase::Live => {
                if self.seen_ids.insert(message.id.clone()) {
                    self.items.push(message);
                    LiveDelivery::Appended
                } else {
                    LiveDelivery::Duplicate
                }
            }
        }
    }

    /// Drop everything and return to `Idle`.
    pub fn clear(&mut self) {
        self.items.clear();
        self.seen_ids.clear();
        self.buffered.clear();
        self.phase = SyncPhase::Idle;
    }

    fn flush_buffered(&mut self) -> usize {
        let mut spliced = 0;
        for message in std::mem::take(&mut self.buffered) {
            if self.seen_ids.insert(message.id.clone()) {
                self.items.push(message);
                spliced += 1;
            }
        }
        self.phase = SyncPhase::Live;
        spliced
    }
}

/// Order by parsed `created_at`, falling back to string order for unparseable values.
pub fn compare_created_at(a: &Message, b: &Message) -> Ordering {
    match (a.created_at_utc(), b.created_at_utc()) {
        (Some(left), Some(right)) => left.cmp(&right),
        _ => a.created_at.cmp(&b.created_at),
    }
}
