//! Bridge that wires session runtime events into UI state snapshots.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use backend_core::{BackendCommand, BackendEvent, StreamItem};
use backend_runtime::ChatRuntimeHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::state::{AppSnapshot, AppState, Screen};

/// Callback used to publish new UI snapshots.
pub type UiUpdateCallback = Arc<dyn Fn(AppSnapshot) + Send + Sync + 'static>;

/// Bridges user actions and runtime events.
pub struct TerminalBridge {
    runtime: ChatRuntimeHandle,
    command_tx: mpsc::UnboundedSender<BackendCommand>,
    state: Arc<Mutex<AppState>>,
    ui_update: UiUpdateCallback,
    next_txn_id: AtomicU64,
    command_task: tokio::task::JoinHandle<()>,
    event_task: tokio::task::JoinHandle<()>,
}

impl TerminalBridge {
    /// Start command/event workers and boot the session.
    pub fn spawn(
        runtime: ChatRuntimeHandle,
        initial_state: AppState,
        runtime_handle: tokio::runtime::Handle,
        ui_update: UiUpdateCallback,
    ) -> Arc<Self> {
        info!(
            viewport_messages = initial_state.viewport_messages(),
            "spawning terminal bridge"
        );
        let state = Arc::new(Mutex::new(initial_state));

        let (command_tx, mut command_rx) = mpsc::unbounded_channel::<BackendCommand>();
        let runtime_for_commands = runtime.clone();
        let command_task = runtime_handle.spawn(async move {
            debug!("terminal command worker started");
            while let Some(command) = command_rx.recv().await {
                debug!(command = command_kind(&command), "forwarding command");
                if let Err(err) = runtime_for_commands.send(command).await {
                    error!(error = %err, "failed to forward command to session runtime");
                    break;
                }
            }
            debug!("terminal command worker exiting");
        });

        let state_for_events = Arc::clone(&state);
        let ui_update_for_events = Arc::clone(&ui_update);
        let resync_tx = command_tx.clone();
        let mut events = runtime.subscribe();
        let event_task = runtime_handle.spawn(async move {
            debug!("terminal event worker started");
            while let Some(item) = events.next().await {
                let mut state = state_for_events
                    .lock()
                    .expect("terminal state lock poisoned while handling backend event");
                match item {
                    StreamItem::Event(event) => {
                        debug!(event = event_kind(&event), "received backend event");
                        state.handle_backend_event(event);
                    }
                    StreamItem::Lagged { skipped } => {
                        let resync_id = state.begin_resync();
                        warn!(skipped, resync_id, "missed backend events, requesting resync");
                        if resync_tx
                            .send(BackendCommand::Resync { resync_id })
                            .is_err()
                        {
                            error!("backend command channel closed");
                            state.set_error_text("Backend command channel closed.");
                        }
                    }
                }
                (ui_update_for_events)(state.snapshot());
            }
            warn!(
                skipped = events.skipped(),
                "terminal event worker exiting: backend event stream closed"
            );
        });

        let bridge = Arc::new(Self {
            runtime,
            command_tx,
            state,
            ui_update,
            next_txn_id: AtomicU64::new(1),
            command_task,
            event_task,
        });

        bridge.publish_snapshot();
        bridge.enqueue_command(BackendCommand::Boot);
        bridge
    }

    pub fn screen(&self) -> Screen {
        self.state
            .lock()
            .expect("terminal state lock poisoned while reading screen")
            .screen()
    }

    /// Submit the username form.
    pub fn join(&self, raw_username: &str) {
        {
            let mut state = self
                .state
                .lock()
                .expect("terminal state lock poisoned while joining");
            if raw_username.trim().is_empty() {
                state.reject_blank_username();
                (self.ui_update)(state.snapshot());
                return;
            }
            state.begin_action();
            (self.ui_update)(state.snapshot());
        }
        self.enqueue_command(BackendCommand::Join {
            username: raw_username.to_owned(),
        });
    }

    /// Add a line to the draft without sending.
    pub fn continue_draft(&self, line: &str) {
        let mut state = self
            .state
            .lock()
            .expect("terminal state lock poisoned while editing draft");
        state.append_draft_line(line);
        (self.ui_update)(state.snapshot());
    }

    /// Append the final line to the draft and send it.
    ///
    /// Returns `false` when nothing was sent.
    pub fn send_line(&self, line: &str) -> bool {
        let client_txn_id = format!(
            "terminal-send-{}",
            self.next_txn_id.fetch_add(1, Ordering::Relaxed)
        );
        let mut state = self
            .state
            .lock()
            .expect("terminal state lock poisoned while sending draft");
        state.append_draft_line(line);
        let sent = match state.take_draft_for_send(&client_txn_id) {
            Some(body) => {
                info!(%client_txn_id, "sending message");
                self.forward_locked(
                    &mut state,
                    BackendCommand::SendMessage {
                        client_txn_id,
                        body,
                    },
                );
                true
            }
            None => {
                trace!("draft is blank; nothing sent");
                false
            }
        };
        (self.ui_update)(state.snapshot());
        sent
    }

    /// Retry the `index`-th failed send, counting from 1.
    pub fn retry_send(&self, index: usize) -> bool {
        let mut state = self
            .state
            .lock()
            .expect("terminal state lock poisoned while retrying send");
        let Some(client_txn_id) = state
            .failed_send_txn(index)
            .filter(|txn| state.mark_retry_requested(txn))
        else {
            state.set_error_text(format!("No failed message #{index}."));
            (self.ui_update)(state.snapshot());
            return false;
        };

        info!(%client_txn_id, "retrying failed send");
        self.forward_locked(&mut state, BackendCommand::RetrySend { client_txn_id });
        (self.ui_update)(state.snapshot());
        true
    }

    /// Re-run the bulk load for the current room.
    pub fn reload(&self) {
        {
            let mut state = self
                .state
                .lock()
                .expect("terminal state lock poisoned while reloading");
            if state.screen() != Screen::ChatRoom {
                return;
            }
            state.begin_action();
            (self.ui_update)(state.snapshot());
        }
        self.enqueue_command(BackendCommand::ReloadMessages);
    }

    /// Leave the chat room and forget the identity.
    ///
    /// Returns `false` when there is no room to leave.
    pub fn back(&self) -> bool {
        if self.screen() != Screen::ChatRoom {
            return false;
        }
        info!("leaving chat room");
        self.enqueue_command(BackendCommand::ResetIdentity);
        true
    }

    pub fn scroll_up(&self) {
        self.update_state(|state| {
            let rows = state.viewport_messages();
            state.scroll_up(rows);
        });
    }

    pub fn scroll_down(&self) {
        self.update_state(|state| {
            let rows = state.viewport_messages();
            state.scroll_down(rows);
        });
    }

    pub fn scroll_to_tail(&self) {
        self.update_state(AppState::scroll_to_tail);
    }

    pub fn show_error(&self, text: impl Into<String>) {
        let text = text.into();
        self.update_state(move |state| state.set_error_text(text));
    }

    /// Ask the session runtime to release its resources and stop.
    pub async fn shutdown(&self) {
        info!("shutting down session runtime");
        if let Err(err) = self.runtime.send(BackendCommand::Shutdown).await {
            debug!(error = %err, "session runtime already stopped");
        }
    }

    fn update_state(&self, apply: impl FnOnce(&mut AppState)) {
        let mut state = self
            .state
            .lock()
            .expect("terminal state lock poisoned while applying user action");
        apply(&mut state);
        (self.ui_update)(state.snapshot());
    }

    fn enqueue_command(&self, command: BackendCommand) {
        trace!(command = command_kind(&command), "enqueue_command");
        if self.command_tx.send(command).is_err() {
            let mut state = self
                .state
                .lock()
                .expect("terminal state lock poisoned while enqueueing command");
            state.set_error_text("Backend command channel closed.");
            (self.ui_update)(state.snapshot());
            error!("backend command channel closed");
        }
    }

    /// Queue a command that changes pending sends.
    ///
    /// Runs under the state lock so the command is ordered before any resync requested later.
    fn forward_locked(&self, state: &mut AppState, command: BackendCommand) {
        trace!(command = command_kind(&command), "forward_locked");
        if self.command_tx.send(command).is_err() {
            state.set_error_text("Backend command channel closed.");
            error!("backend command channel closed");
        }
    }

    fn publish_snapshot(&self) {
        let state = self
            .state
            .lock()
            .expect("terminal state lock poisoned while publishing snapshot");
        let snapshot = state.snapshot();
        trace!(
            messages = snapshot.messages.len(),
            screen = ?snapshot.screen,
            "publishing initial snapshot"
        );
        (self.ui_update)(snapshot);
    }
}

impl Drop for TerminalBridge {
    fn drop(&mut self) {
        info!("shutting down terminal bridge tasks");
        self.command_task.abort();
        self.event_task.abort();
    }
}

fn command_kind(command: &BackendCommand) -> &'static str {
    match command {
        BackendCommand::Boot => "Boot",
        BackendCommand::Join { .. } => "Join",
        BackendCommand::SendMessage { .. } => "SendMessage",
        BackendCommand::RetrySend { .. } => "RetrySend",
        BackendCommand::ReloadMessages => "ReloadMessages",
        BackendCommand::ResetIdentity => "ResetIdentity",
        BackendCommand::Resync { .. } => "Resync",
        BackendCommand::Shutdown => "Shutdown",
    }
}

fn event_kind(event: &BackendEvent) -> &'static str {
    match event {
        BackendEvent::RouteChanged { .. } => "RouteChanged",
        BackendEvent::TimelineSnapshot { .. } => "TimelineSnapshot",
        BackendEvent::TimelineAppend { .. } => "TimelineAppend",
        BackendEvent::TimelineCleared => "TimelineCleared",
        BackendEvent::SyncStatus(_) => "SyncStatus",
        BackendEvent::SendAck(_) => "SendAck",
        BackendEvent::StreamError(_) => "StreamError",
        BackendEvent::StateReplay(_) => "StateReplay",
        BackendEvent::FatalError { .. } => "FatalError",
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{OnceLock, Weak},
        time::Duration,
    };

    use backend_core::{LoopbackBackend, NewMessage};
    use backend_platform::{IdentityStore, InMemoryKeyValueStore, KeyValueStore, USERNAME_KEY};
    use backend_runtime::{RuntimeConfig, spawn_runtime};
    use chrono::FixedOffset;
    use tokio::time::timeout;

    use super::*;
    use crate::state::SendState;

    struct Fixture {
        bridge: Arc<TerminalBridge>,
        backend: Arc<LoopbackBackend>,
        store: InMemoryKeyValueStore,
        snapshots: mpsc::UnboundedReceiver<AppSnapshot>,
    }

    impl Fixture {
        fn start(stored_username: Option<&str>) -> Self {
            Self::start_with(stored_username, RuntimeConfig::default())
        }

        fn start_with(stored_username: Option<&str>, config: RuntimeConfig) -> Self {
            let store = InMemoryKeyValueStore::default();
            if let Some(username) = stored_username {
                store.set(USERNAME_KEY, username).expect("seed identity");
            }
            let backend = Arc::new(LoopbackBackend::new());
            let runtime = spawn_runtime(
                Arc::clone(&backend),
                IdentityStore::new(store.clone()),
                config,
            );

            let (snapshot_tx, snapshots) = mpsc::unbounded_channel();
            let ui_update: UiUpdateCallback = Arc::new(move |snapshot| {
                let _ = snapshot_tx.send(snapshot);
            });
            let bridge = TerminalBridge::spawn(
                runtime,
                AppState::new(FixedOffset::east_opt(0).expect("offset"), 20),
                tokio::runtime::Handle::current(),
                ui_update,
            );

            Self {
                bridge,
                backend,
                store,
                snapshots,
            }
        }

        async fn wait_for(&mut self, mut done: impl FnMut(&AppSnapshot) -> bool) -> AppSnapshot {
            timeout(Duration::from_secs(5), async {
                loop {
                    let snapshot = self.snapshots.recv().await.expect("snapshot stream closed");
                    if done(&snapshot) {
                        return snapshot;
                    }
                }
            })
            .await
            .expect("timed out waiting for snapshot")
        }
    }

    #[tokio::test]
    async fn join_then_send_shows_own_message() {
        let mut fixture = Fixture::start(None);
        fixture
            .wait_for(|snapshot| snapshot.screen == Screen::Username)
            .await;

        fixture.bridge.join("  alice  ");
        let snapshot = fixture
            .wait_for(|snapshot| snapshot.screen == Screen::ChatRoom)
            .await;
        assert_eq!(snapshot.username.as_deref(), Some("alice"));
        assert_eq!(
            fixture.store.get(USERNAME_KEY).expect("read identity"),
            Some("alice".to_owned())
        );
        fixture
            .wait_for(|snapshot| snapshot.status_text == "Live")
            .await;

        assert!(fixture.bridge.send_line("hello"));
        let snapshot = fixture
            .wait_for(|snapshot| !snapshot.messages.is_empty() && snapshot.pending_sends.is_empty())
            .await;
        assert_eq!(snapshot.messages[0].body, "hello");
        assert!(snapshot.messages[0].is_own);
        assert_eq!(snapshot.draft, "");
    }

    #[tokio::test]
    async fn blank_username_is_rejected_locally() {
        let mut fixture = Fixture::start(None);
        fixture
            .wait_for(|snapshot| snapshot.screen == Screen::Username)
            .await;

        fixture.bridge.join("   ");
        let snapshot = fixture
            .wait_for(|snapshot| snapshot.error_text.is_some())
            .await;
        assert_eq!(snapshot.screen, Screen::Username);
        assert_eq!(fixture.store.get(USERNAME_KEY).expect("read identity"), None);
    }

    #[tokio::test]
    async fn whitespace_line_sends_nothing() {
        let mut fixture = Fixture::start(Some("alice"));
        fixture
            .wait_for(|snapshot| snapshot.status_text == "Live")
            .await;

        assert!(!fixture.bridge.send_line("   "));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fixture.backend.stored_messages().is_empty());
    }

    #[tokio::test]
    async fn failed_send_is_retried_by_index() {
        let mut fixture = Fixture::start(Some("alice"));
        fixture
            .wait_for(|snapshot| snapshot.status_text == "Live")
            .await;

        fixture.backend.set_fail_insert(true);
        fixture.bridge.continue_draft("first line");
        assert!(fixture.bridge.send_line("second line"));
        let snapshot = fixture
            .wait_for(|snapshot| {
                snapshot
                    .pending_sends
                    .first()
                    .is_some_and(|send| send.state == SendState::Failed)
            })
            .await;
        assert_eq!(snapshot.draft, "");
        assert_eq!(snapshot.pending_sends[0].body, "first line\nsecond line");

        assert!(!fixture.bridge.retry_send(2));
        fixture.backend.set_fail_insert(false);
        assert!(fixture.bridge.retry_send(1));
        let snapshot = fixture
            .wait_for(|snapshot| snapshot.pending_sends.is_empty() && !snapshot.messages.is_empty())
            .await;
        assert_eq!(snapshot.messages[0].body, "first line\nsecond line");
        assert_eq!(fixture.backend.stored_messages().len(), 1);
    }

    #[tokio::test]
    async fn frontend_behind_a_tiny_event_buffer_catches_up() {
        let mut fixture = Fixture::start_with(
            Some("alice"),
            RuntimeConfig {
                event_buffer: 1,
                ..RuntimeConfig::default()
            },
        );
        fixture
            .wait_for(|snapshot| snapshot.status_text == "Live")
            .await;

        for n in 0..30 {
            fixture.backend.insert_remote(NewMessage {
                username: "bob".to_owned(),
                content: format!("m{n}"),
                created_at: format!("2024-01-01T00:00:{n:02}Z"),
            });
        }

        let snapshot = fixture
            .wait_for(|snapshot| snapshot.messages.len() == 30)
            .await;
        let bodies: Vec<&str> = snapshot.messages.iter().map(|m| m.body.as_str()).collect();
        let expected: Vec<String> = (0..30).map(|n| format!("m{n}")).collect();
        assert_eq!(bodies, expected);
        assert_eq!(snapshot.screen, Screen::ChatRoom);
    }

    #[tokio::test]
    async fn every_frame_is_drawn_under_the_state_lock() {
        let backend = Arc::new(LoopbackBackend::new());
        let store = InMemoryKeyValueStore::default();
        store.set(USERNAME_KEY, "alice").expect("seed identity");
        let runtime = spawn_runtime(
            Arc::clone(&backend),
            IdentityStore::new(store),
            RuntimeConfig::default(),
        );

        let cell: Arc<OnceLock<Weak<TerminalBridge>>> = Arc::new(OnceLock::new());
        let (draw_tx, mut draws) = mpsc::unbounded_channel::<(bool, usize)>();
        let cell_for_draws = Arc::clone(&cell);
        let ui_update: UiUpdateCallback = Arc::new(move |snapshot: AppSnapshot| {
            if let Some(bridge) = cell_for_draws.get().and_then(Weak::upgrade) {
                let locked = bridge.state.try_lock().is_err();
                let _ = draw_tx.send((locked, snapshot.messages.len()));
            }
        });
        let bridge = TerminalBridge::spawn(
            runtime,
            AppState::new(FixedOffset::east_opt(0).expect("offset"), 20),
            tokio::runtime::Handle::current(),
            ui_update,
        );
        cell.set(Arc::downgrade(&bridge)).expect("cell is set once");

        bridge.continue_draft("typing");
        backend.insert_remote(NewMessage::now("bob", "hi"));

        timeout(Duration::from_secs(5), async {
            loop {
                let (locked, messages) = draws.recv().await.expect("draw stream closed");
                assert!(locked, "frame drawn after the state lock was released");
                if messages == 1 {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for the message frame");
    }

    #[tokio::test]
    async fn back_returns_to_username_screen() {
        let mut fixture = Fixture::start(Some("alice"));
        fixture
            .wait_for(|snapshot| snapshot.screen == Screen::ChatRoom)
            .await;

        assert!(fixture.bridge.back());
        fixture
            .wait_for(|snapshot| snapshot.screen == Screen::Username)
            .await;
        assert_eq!(fixture.store.get(USERNAME_KEY).expect("read identity"), None);
        assert!(!fixture.bridge.back());

        fixture.bridge.shutdown().await;
    }
}
