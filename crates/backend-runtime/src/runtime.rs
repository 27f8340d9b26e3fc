use std::{sync::Arc, time::Duration};

use backend_core::{
    BackendChannelError, BackendChannels, BackendCommand, BackendError, BackendErrorCategory,
    BackendEvent, ChatErrorKind, EventStream, InsertOutcome, LiveDelivery, Message,
    MessageBackend, NavigationStateMachine, NewMessage, SendAck, StateReplay, StreamState,
    SubscriptionEvent, SyncPhase, SyncStatus, normalize_fatal_error, normalize_insert_outcome, normalize_stream_error,
    now_timestamp,
};
use backend_platform::{IdentityStore, KeyValueStore, KeyValueStoreError};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, trace, warn};

use crate::session::RoomSession;

/// Tunables for [`spawn_runtime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub command_buffer: usize,
    pub event_buffer: usize,
    pub completion_buffer: usize,
    /// How long to wait for a subscription confirmation before loading history anyway.
    pub subscription_ready_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_buffer: 128,
            event_buffer: 512,
            completion_buffer: 64,
            subscription_ready_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChatRuntimeHandle {
    channels: BackendChannels,
}

impl ChatRuntimeHandle {
    pub async fn send(&self, command: BackendCommand) -> Result<(), BackendChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }
}

/// Start the session runtime on the current tokio runtime.
pub fn spawn_runtime<B, S>(
    backend: Arc<B>,
    identity: IdentityStore<S>,
    config: RuntimeConfig,
) -> ChatRuntimeHandle
where
    B: MessageBackend,
    S: KeyValueStore + 'static,
{
    let (channels, command_rx) = BackendChannels::new(config.command_buffer, config.event_buffer);
    let runtime = ChatRuntime::new(backend, identity, config, channels.clone(), command_rx);
    tokio::spawn(async move {
        runtime.run().await;
    });

    ChatRuntimeHandle { channels }
}

/// Result of a spawned backend call, reported back to the runtime task.
enum Completion {
    Fetched {
        generation: u64,
        result: Result<Vec<Message>, BackendError>,
    },
    Inserted {
        room_generation: u64,
        client_txn_id: String,
        message: NewMessage,
        result: Result<(), BackendError>,
    },
}

struct ChatRuntime<B, S: KeyValueStore> {
    backend: Arc<B>,
    identity: IdentityStore<S>,
    config: RuntimeConfig,
    channels: BackendChannels,
    command_rx: mpsc::Receiver<BackendCommand>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    navigation: NavigationStateMachine,
    session: Option<RoomSession>,
    last_sync: SyncStatus,
    next_generation: u64,
}

impl<B, S> ChatRuntime<B, S>
where
    B: MessageBackend,
    S: KeyValueStore + 'static,
{
    fn new(
        backend: Arc<B>,
        identity: IdentityStore<S>,
        config: RuntimeConfig,
        channels: BackendChannels,
        command_rx: mpsc::Receiver<BackendCommand>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(config.completion_buffer.max(1));
        Self {
            backend,
            identity,
            config,
            channels,
            command_rx,
            completion_tx,
            completion_rx,
            navigation: NavigationStateMachine::default(),
            session: None,
            last_sync: SyncStatus {
                state: StreamState::Idle,
                retry_in_ms: None,
            },
            next_generation: 0,
        }
    }

    async fn run(mut self) {
        debug!("chat runtime started");
        loop {
            let deadline = self.session.as_ref().and_then(RoomSession::ready_deadline);
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if matches!(command, BackendCommand::Shutdown) {
                        break;
                    }
                    if let Err(err) = self.handle_command(command).await {
                        warn!(code = %err.code, "command failed: {}", err.message);
                        self.channels.emit(normalize_fatal_error(err));
                    }
                }
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }
                event = next_subscription_event(&mut self.session) => {
                    self.handle_subscription_event(event);
                }
                _ = wait_until(deadline) => {
                    self.handle_ready_timeout();
                }
            }
        }

        if let Some(session) = self.session.take() {
            debug!(generation = session.generation(), "releasing room on shutdown");
        }
        info!("chat runtime stopped");
    }

    async fn handle_command(&mut self, command: BackendCommand) -> Result<(), BackendError> {
        match command {
            BackendCommand::Boot => self.handle_boot().await,
            BackendCommand::Join { username } => self.handle_join(username).await,
            BackendCommand::SendMessage {
                client_txn_id,
                body,
            } => {
                self.handle_send_message(client_txn_id, body);
                Ok(())
            }
            BackendCommand::RetrySend { client_txn_id } => {
                self.handle_retry_send(client_txn_id);
                Ok(())
            }
            BackendCommand::ReloadMessages => self.handle_reload_messages().await,
            BackendCommand::ResetIdentity => self.handle_reset_identity(),
            BackendCommand::Resync { resync_id } => {
                self.handle_resync(resync_id);
                Ok(())
            }
            BackendCommand::Shutdown => Ok(()),
        }
    }

    async fn handle_boot(&mut self) -> Result<(), BackendError> {
        self.navigation.validate(&BackendCommand::Boot)?;

        let stored = match self.identity.load() {
            Ok(stored) => stored,
            Err(err) => {
                let mapped = map_identity_store_error("load", err);
                warn!("booting without identity: {}", mapped.message);
                self.channels.emit(normalize_fatal_error(mapped));
                None
            }
        };

        let event = self.navigation.boot(stored.as_deref())?;
        self.channels.emit(event);
        if let Some(username) = self.navigation.chat_username().map(str::to_owned) {
            info!(%username, "resuming stored identity");
            self.enter_room(username).await;
        }
        Ok(())
    }

    async fn handle_join(&mut self, raw_username: String) -> Result<(), BackendError> {
        let mut candidate = self.navigation.clone();
        let event = candidate.join(&raw_username)?;
        let username = candidate
            .chat_username()
            .map(str::to_owned)
            .ok_or_else(|| BackendError::invalid_state(candidate.route(), "join"))?;

        self.identity
            .save(&username)
            .map_err(|err| map_identity_store_error("save", err))?;
        self.navigation = candidate;
        self.channels.emit(event);
        info!(%username, "joined chat room");

        self.enter_room(username).await;
        Ok(())
    }

    fn handle_send_message(&mut self, client_txn_id: String, body: String) {
        let username = match self.require_room("send message") {
            Ok(session) => session.username().to_owned(),
            Err(error) => {
                self.channels.emit(normalize_insert_outcome(
                    client_txn_id,
                    InsertOutcome::Failed { error },
                ));
                return;
            }
        };

        if body.trim().is_empty() {
            debug!(%client_txn_id, "ignoring blank message");
            return;
        }

        self.spawn_insert(client_txn_id, NewMessage::now(username, body));
    }

    fn handle_retry_send(&mut self, client_txn_id: String) {
        let failed = match self.session.as_mut() {
            Some(session) => session
                .take_failed_send(&client_txn_id)
                .ok_or_else(|| BackendError::unknown_client_txn(&client_txn_id)),
            None => Err(BackendError::invalid_state(
                self.navigation.route(),
                "retry send",
            )),
        };

        match failed {
            Ok(mut message) => {
                message.created_at = now_timestamp();
                debug!(%client_txn_id, "retrying failed send");
                self.spawn_insert(client_txn_id, message);
            }
            Err(error) => {
                self.channels.emit(normalize_insert_outcome(
                    client_txn_id,
                    InsertOutcome::Failed { error },
                ));
            }
        }
    }

    async fn handle_reload_messages(&mut self) -> Result<(), BackendError> {
        let has_subscription = self.require_room("reload messages")?.has_subscription();
        if has_subscription {
            self.start_fetch();
        } else {
            self.open_stream().await;
        }
        Ok(())
    }

    fn handle_reset_identity(&mut self) -> Result<(), BackendError> {
        self.require_room("reset identity")?;
        let event = self.navigation.back()?;
        let cleared = self.identity.clear();

        self.leave_room();
        self.channels.emit(event);
        info!("identity reset, back on username screen");

        cleared.map_err(|err| map_identity_store_error("clear", err))
    }

    fn handle_resync(&mut self, resync_id: u64) {
        let (messages, sending, failed) = match self.session.as_ref() {
            Some(session) => (
                session.timeline().items().to_vec(),
                session.sending().map(str::to_owned).collect(),
                session
                    .failed_sends()
                    .map(|(client_txn_id, error_code)| SendAck {
                        client_txn_id: client_txn_id.to_owned(),
                        error_code: Some(error_code.to_owned()),
                    })
                    .collect(),
            ),
            None => (Vec::new(), Vec::new(), Vec::new()),
        };
        debug!(resync_id, messages = messages.len(), "replaying state to frontend");
        self.channels.emit(BackendEvent::StateReplay(StateReplay {
            resync_id,
            route: self.navigation.route().cloned(),
            messages,
            sync: self.last_sync.clone(),
            sending,
            failed,
        }));
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { generation, result } => {
                self.handle_fetch_result(generation, result)
            }
            Completion::Inserted {
                room_generation,
                client_txn_id,
                message,
                result,
            } => {
                let session = self
                    .session
                    .as_mut()
                    .filter(|session| session.generation() == room_generation);
                match &result {
                    Ok(()) => {
                        debug!(%client_txn_id, "insert accepted");
                        if let Some(session) = session {
                            session.finish_send(&client_txn_id);
                        }
                    }
                    Err(error) => {
                        warn!(%client_txn_id, code = %error.code, "insert failed: {}", error.message);
                        if let Some(session) = session {
                            session.record_failed_send(
                                client_txn_id.clone(),
                                message,
                                error.code.clone(),
                            );
                        }
                    }
                }
                self.channels.emit(normalize_insert_outcome(
                    client_txn_id,
                    InsertOutcome::from(result),
                ));
            }
        }
    }

    fn handle_fetch_result(&mut self, generation: u64, result: Result<Vec<Message>, BackendError>) {
        let Some(session) = self.session.as_mut() else {
            debug!(generation, "discarding bulk load after leaving the room");
            return;
        };
        if !session.finish_fetch(generation) {
            debug!(generation, "discarding superseded bulk load");
            return;
        }

        match result {
            Ok(messages) => {
                let fetched = messages.len();
                let spliced = session.timeline_mut().apply_snapshot(messages);
                info!(fetched, spliced, "timeline synced");
                self.channels.emit(BackendEvent::TimelineSnapshot {
                    messages: session.timeline().items().to_vec(),
                });
            }
            Err(error) => {
                warn!(code = %error.code, "bulk load failed: {}", error.message);
                let spliced = session.timeline_mut().abandon_sync();
                self.channels
                    .emit(normalize_stream_error(ChatErrorKind::Fetch, error));
                if spliced > 0 {
                    self.channels.emit(BackendEvent::TimelineSnapshot {
                        messages: session.timeline().items().to_vec(),
                    });
                }
            }
        }
        self.emit_sync_status(StreamState::Live, None);
    }

    fn handle_subscription_event(&mut self, event: Option<SubscriptionEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        match event {
            Some(SubscriptionEvent::Ready { resumed }) => {
                if session.on_ready(resumed) {
                    debug!(resumed, "subscription confirmed, syncing timeline");
                    self.start_fetch();
                }
            }
            Some(SubscriptionEvent::Inserted(message)) => {
                match session.timeline_mut().push_live(message.clone()) {
                    LiveDelivery::Appended => {
                        self.channels
                            .emit(BackendEvent::TimelineAppend { message });
                    }
                    LiveDelivery::Buffered => {
                        trace!(id = %message.id, "holding live message until snapshot");
                    }
                    LiveDelivery::Duplicate | LiveDelivery::Ignored => {
                        debug!(id = %message.id, "dropping repeated live message");
                    }
                }
            }
            Some(SubscriptionEvent::Dropped { error, retry_in }) => {
                warn!(code = %error.code, "live subscription dropped: {}", error.message);
                self.channels
                    .emit(normalize_stream_error(ChatErrorKind::Subscription, error));
                self.emit_sync_status(
                    StreamState::Reconnecting,
                    retry_in.map(|delay| delay.as_millis() as u64),
                );
            }
            None => {
                session.detach_subscription();
                let fetching = session.is_fetching();
                let never_loaded = session.timeline().phase() == SyncPhase::Buffering;
                warn!("live subscription closed");
                self.channels.emit(normalize_stream_error(
                    ChatErrorKind::Subscription,
                    BackendError::for_kind(
                        ChatErrorKind::Subscription,
                        BackendErrorCategory::Network,
                        "live subscription closed",
                    ),
                ));
                if fetching {
                    return;
                }
                if never_loaded {
                    debug!("subscription closed before the first load, loading history without it");
                    self.start_fetch();
                } else {
                    self.emit_sync_status(StreamState::Live, None);
                }
            }
        }
    }

    fn handle_ready_timeout(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.expire_ready_deadline() {
            warn!("subscription not confirmed in time, loading history without it");
            self.start_fetch();
        }
    }

    async fn enter_room(&mut self, username: String) {
        let generation = self.bump_generation();
        self.session = Some(RoomSession::new(generation, username));
        self.emit_sync_status(StreamState::Syncing, None);
        self.open_stream().await;
    }

    /// Open the live subscription. The bulk load starts once it is confirmed.
    async fn open_stream(&mut self) {
        let deadline = Instant::now() + self.config.subscription_ready_timeout;
        match self.backend.subscribe_inserts().await {
            Ok(subscription) => {
                if let Some(session) = self.session.as_mut() {
                    session.attach_subscription(subscription, deadline);
                }
            }
            Err(error) => {
                warn!(code = %error.code, "could not open live subscription: {}", error.message);
                self.channels
                    .emit(normalize_stream_error(ChatErrorKind::Subscription, error));
                self.start_fetch();
            }
        }
    }

    fn start_fetch(&mut self) {
        let generation = self.bump_generation();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.begin_fetch(generation);
        self.emit_sync_status(StreamState::Syncing, None);

        let backend = Arc::clone(&self.backend);
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = backend.list_messages().await;
            let _ = completion_tx
                .send(Completion::Fetched { generation, result })
                .await;
        });
    }

    fn spawn_insert(&mut self, client_txn_id: String, message: NewMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.begin_send(&client_txn_id);
        let room_generation = session.generation();

        let backend = Arc::clone(&self.backend);
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = backend.insert_message(&message).await;
            let _ = completion_tx
                .send(Completion::Inserted {
                    room_generation,
                    client_txn_id,
                    message,
                    result,
                })
                .await;
        });
    }

    fn leave_room(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(generation = session.generation(), "leaving chat room");
            drop(session);
            self.channels.emit(BackendEvent::TimelineCleared);
            self.emit_sync_status(StreamState::Idle, None);
        }
    }

    fn emit_sync_status(&mut self, state: StreamState, retry_in_ms: Option<u64>) {
        self.last_sync = SyncStatus { state, retry_in_ms };
        self.channels
            .emit(BackendEvent::SyncStatus(self.last_sync.clone()));
    }

    fn require_room(&self, action: &str) -> Result<&RoomSession, BackendError> {
        self.session
            .as_ref()
            .ok_or_else(|| BackendError::invalid_state(self.navigation.route(), action))
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }
}

async fn next_subscription_event(session: &mut Option<RoomSession>) -> Option<SubscriptionEvent> {
    match session.as_mut().and_then(RoomSession::subscription_mut) {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn map_identity_store_error(operation: &str, err: KeyValueStoreError) -> BackendError {
    BackendError::identity_store(operation, err)
}
