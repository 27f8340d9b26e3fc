//! Frontend-facing state reducer for `chatroom-terminal`.

use std::{
    collections::{HashMap, HashSet},
    mem,
};

use backend_core::{
    BackendEvent, ChatErrorKind, Message, Route, SendAck, StateReplay, StreamError, StreamState,
    SyncStatus, codes,
};
use chrono::FixedOffset;
use tracing::{debug, trace, warn};

use crate::presentation::{MessageView, present_messages, wrap};

const USERNAME_PROMPT_STATUS: &str = "Enter a username";
const BLANK_USERNAME_TEXT: &str = "Please enter a username.";
/// Height of one draft line in layout units.
pub const INPUT_LINE_HEIGHT: u32 = 40;
/// The input box grows with its content up to this height.
pub const INPUT_MAX_HEIGHT: u32 = 320;
/// Draft columns used until [`AppState::with_input_width`] sets the real width.
const DEFAULT_INPUT_WIDTH: usize = 70;

/// Screen currently shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// Waiting for the runtime to pick the initial route.
    Booting,
    Username,
    ChatRoom,
}

/// Delivery state of a locally submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    Failed,
}

/// Locally submitted message that has not been acknowledged as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSendView {
    pub client_txn_id: String,
    pub body: String,
    pub state: SendState,
    pub error_code: Option<String>,
}

/// Visible slice of the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollView {
    pub start: usize,
    pub end: usize,
    /// Rows below the visible slice.
    pub unseen_below: usize,
    pub following: bool,
}

/// Full UI snapshot emitted after state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSnapshot {
    pub screen: Screen,
    pub username: Option<String>,
    pub messages: Vec<MessageView>,
    pub pending_sends: Vec<PendingSendView>,
    pub draft: String,
    pub input_height: u32,
    pub status_text: String,
    pub error_text: Option<String>,
    pub can_send: bool,
    pub scroll: ScrollView,
    /// Number of scroll-to-tail requests issued so far.
    pub autoscroll_count: u64,
}

/// Follows the tail of the message list until the viewer scrolls away.
#[derive(Debug, Default, Clone)]
struct ScrollTracker {
    scrolled_away: bool,
    anchor_end: usize,
    last_scrolled_len: Option<usize>,
    autoscrolls: u64,
}

impl ScrollTracker {
    /// Issues one scroll-to-tail per distinct row count while following.
    fn content_changed(&mut self, len: usize) -> bool {
        if self.scrolled_away || len == 0 || self.last_scrolled_len == Some(len) {
            return false;
        }
        self.last_scrolled_len = Some(len);
        self.autoscrolls += 1;
        true
    }

    fn visible_end(&self, len: usize) -> usize {
        if self.scrolled_away {
            self.anchor_end.min(len)
        } else {
            len
        }
    }

    fn scroll_up(&mut self, rows: usize, len: usize, viewport: usize) {
        let end = self.visible_end(len);
        let new_end = end.saturating_sub(rows).max(viewport.min(len));
        if new_end < len {
            self.scrolled_away = true;
            self.anchor_end = new_end;
        }
    }

    fn scroll_down(&mut self, rows: usize, len: usize) {
        if !self.scrolled_away {
            return;
        }
        let new_end = self.anchor_end.saturating_add(rows);
        if new_end >= len {
            self.follow_tail(len);
        } else {
            self.anchor_end = new_end;
        }
    }

    fn follow_tail(&mut self, len: usize) {
        self.scrolled_away = false;
        self.content_changed(len);
    }

    fn view(&self, len: usize, viewport: usize) -> ScrollView {
        let end = self.visible_end(len);
        ScrollView {
            start: end.saturating_sub(viewport),
            end,
            unseen_below: len - end,
            following: !self.scrolled_away,
        }
    }

    fn reset(&mut self) {
        let autoscrolls = self.autoscrolls;
        *self = Self {
            autoscrolls,
            ..Self::default()
        };
    }
}

/// Mutable app state that receives backend events and user actions.
#[derive(Debug, Clone)]
pub struct AppState {
    utc_offset: FixedOffset,
    viewport_messages: usize,
    input_width: usize,
    screen: Screen,
    username: Option<String>,
    messages: Vec<Message>,
    message_views: Vec<MessageView>,
    pending_sends: Vec<PendingSendView>,
    draft: String,
    input_height: u32,
    status_text: String,
    error_text: Option<String>,
    stream_notice: Option<(ChatErrorKind, String)>,
    scroll: ScrollTracker,
    next_resync_id: u64,
    /// Latest requested resync and the sends its replay may settle.
    resync: Option<(u64, HashSet<String>)>,
}

impl AppState {
    /// Create a new reducer state.
    pub fn new(utc_offset: FixedOffset, viewport_messages: usize) -> Self {
        Self {
            utc_offset,
            viewport_messages: viewport_messages.max(1),
            input_width: DEFAULT_INPUT_WIDTH,
            screen: Screen::Booting,
            username: None,
            messages: Vec::new(),
            message_views: Vec::new(),
            pending_sends: Vec::new(),
            draft: String::new(),
            input_height: INPUT_LINE_HEIGHT,
            status_text: "Starting".to_owned(),
            error_text: None,
            stream_notice: None,
            scroll: ScrollTracker::default(),
            next_resync_id: 0,
            resync: None,
        }
    }

    /// Columns available to the draft; long lines wrap at this width.
    pub fn with_input_width(mut self, input_width: usize) -> Self {
        self.input_width = input_width.max(1);
        self
    }

    /// Current immutable snapshot for UI rendering.
    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            screen: self.screen,
            username: self.username.clone(),
            messages: self.message_views.clone(),
            pending_sends: self.pending_sends.clone(),
            draft: self.draft.clone(),
            input_height: self.input_height,
            status_text: self.status_text.clone(),
            error_text: self
                .error_text
                .clone()
                .or_else(|| self.stream_notice.as_ref().map(|(_, text)| text.clone())),
            can_send: self.can_send(),
            scroll: self
                .scroll
                .view(self.message_views.len(), self.viewport_messages),
            autoscroll_count: self.scroll.autoscrolls,
        }
    }

    pub fn screen(&self) -> Screen {
        self.screen
    }

    pub fn can_send(&self) -> bool {
        self.screen == Screen::ChatRoom
    }

    /// Apply one backend event.
    pub fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::RouteChanged { route } => self.apply_route(route),
            BackendEvent::TimelineSnapshot { messages } => {
                debug!(count = messages.len(), "timeline snapshot received");
                self.messages = messages;
                self.rebuild_views();
                self.scroll.content_changed(self.message_views.len());
            }
            BackendEvent::TimelineAppend { message } => {
                trace!(message_id = %message.id, "timeline append received");
                self.messages.push(message);
                self.rebuild_views();
                self.scroll.content_changed(self.message_views.len());
            }
            BackendEvent::TimelineCleared => {
                self.messages.clear();
                self.message_views.clear();
                self.scroll.reset();
            }
            BackendEvent::SyncStatus(status) => self.apply_sync_status(status),
            BackendEvent::SendAck(ack) => self.handle_send_ack(ack),
            BackendEvent::StreamError(error) => self.apply_stream_error(error),
            BackendEvent::StateReplay(replay) => self.apply_replay(replay),
            BackendEvent::FatalError { code, message, .. } => {
                warn!(%code, "backend fatal error: {message}");
                self.error_text = Some(if code == codes::EMPTY_USERNAME {
                    BLANK_USERNAME_TEXT.to_owned()
                } else {
                    format!("{message} ({code})")
                });
            }
        }
    }

    /// Clear the error line before a new user action.
    pub fn begin_action(&mut self) {
        self.error_text = None;
    }

    pub fn set_error_text(&mut self, text: impl Into<String>) {
        self.error_text = Some(text.into());
    }

    pub fn reject_blank_username(&mut self) {
        self.error_text = Some(BLANK_USERNAME_TEXT.to_owned());
    }

    /// Add one typed line to the draft and grow the input box with it.
    pub fn append_draft_line(&mut self, line: &str) {
        if !self.draft.is_empty() {
            self.draft.push('\n');
        }
        self.draft.push_str(line);
        let rows = wrap(&self.draft, self.input_width).len().max(1);
        let rows = u32::try_from(rows).unwrap_or(u32::MAX);
        self.set_input_content_height(rows.saturating_mul(INPUT_LINE_HEIGHT));
    }

    /// The input box follows its content height, capped at [`INPUT_MAX_HEIGHT`].
    pub fn set_input_content_height(&mut self, content_height: u32) {
        self.input_height = content_height.min(INPUT_MAX_HEIGHT);
    }

    /// Submit the draft as a pending send.
    ///
    /// Returns the body to send, or `None` when the draft is whitespace only or no room is
    /// open; in that case nothing changes.
    pub fn take_draft_for_send(&mut self, client_txn_id: &str) -> Option<String> {
        if !self.can_send() || self.draft.trim().is_empty() {
            return None;
        }
        let body = mem::take(&mut self.draft);
        self.input_height = INPUT_LINE_HEIGHT;
        self.error_text = None;
        self.pending_sends.push(PendingSendView {
            client_txn_id: client_txn_id.to_owned(),
            body: body.clone(),
            state: SendState::Pending,
            error_code: None,
        });
        Some(body)
    }

    /// Transaction ID of the `index`-th failed send, counting from 1.
    pub fn failed_send_txn(&self, index: usize) -> Option<String> {
        self.pending_sends
            .iter()
            .filter(|send| send.state == SendState::Failed)
            .nth(index.checked_sub(1)?)
            .map(|send| send.client_txn_id.clone())
    }

    /// Move a failed send back to pending before it is retried.
    pub fn mark_retry_requested(&mut self, client_txn_id: &str) -> bool {
        let Some(send) = self
            .pending_sends
            .iter_mut()
            .find(|send| send.client_txn_id == client_txn_id && send.state == SendState::Failed)
        else {
            return false;
        };
        send.state = SendState::Pending;
        send.error_code = None;
        self.error_text = None;
        if let Some((_, scope)) = self.resync.as_mut() {
            scope.remove(client_txn_id);
        }
        true
    }

    /// Start recovering from missed backend events. Returns the ID for `Resync`.
    ///
    /// The matching replay settles only sends that exist now; later ones wait for their acks.
    pub fn begin_resync(&mut self) -> u64 {
        self.next_resync_id += 1;
        let scope = self
            .pending_sends
            .iter()
            .map(|send| send.client_txn_id.clone())
            .collect();
        self.resync = Some((self.next_resync_id, scope));
        self.next_resync_id
    }

    /// Apply send acknowledgement.
    pub fn handle_send_ack(&mut self, ack: SendAck) {
        let Some(position) = self
            .pending_sends
            .iter()
            .position(|send| send.client_txn_id == ack.client_txn_id)
        else {
            debug!(client_txn_id = %ack.client_txn_id, "ack for unknown local send");
            return;
        };

        match ack.error_code {
            None => {
                self.pending_sends.remove(position);
            }
            Some(code) if code == codes::UNKNOWN_CLIENT_TXN => {
                self.pending_sends.remove(position);
                self.error_text = Some("That message can no longer be resent.".to_owned());
            }
            Some(code) => {
                warn!(client_txn_id = %ack.client_txn_id, %code, "send failed");
                let send = &mut self.pending_sends[position];
                send.state = SendState::Failed;
                send.error_code = Some(code.clone());
                self.error_text = Some(format!("Message not sent ({code})."));
            }
        }
    }

    pub fn scroll_up(&mut self, rows: usize) {
        self.scroll
            .scroll_up(rows, self.message_views.len(), self.viewport_messages);
    }

    pub fn scroll_down(&mut self, rows: usize) {
        self.scroll.scroll_down(rows, self.message_views.len());
    }

    pub fn scroll_to_tail(&mut self) {
        self.scroll.follow_tail(self.message_views.len());
    }

    pub fn viewport_messages(&self) -> usize {
        self.viewport_messages
    }

    fn apply_replay(&mut self, replay: StateReplay) {
        debug!(
            resync_id = replay.resync_id,
            messages = replay.messages.len(),
            "state replay received"
        );
        if let Some(route) = replay.route.filter(|route| !self.shows(route)) {
            self.apply_route(route);
        }
        self.messages = replay.messages;
        self.rebuild_views();
        self.scroll.content_changed(self.message_views.len());
        self.apply_sync_status(replay.sync);

        let scope = match self.resync.take() {
            Some((id, scope)) if id == replay.resync_id => scope,
            other => {
                // An older replay; the latest one settles pending sends.
                self.resync = other;
                return;
            }
        };
        let failed: HashMap<String, Option<String>> = replay
            .failed
            .into_iter()
            .map(|ack| (ack.client_txn_id, ack.error_code))
            .collect();
        self.pending_sends.retain_mut(|send| {
            if !scope.contains(&send.client_txn_id) {
                return true;
            }
            if let Some(code) = failed.get(&send.client_txn_id) {
                send.state = SendState::Failed;
                send.error_code = code.clone();
                return true;
            }
            replay.sending.contains(&send.client_txn_id)
        });
    }

    fn shows(&self, route: &Route) -> bool {
        match route {
            Route::Username => self.screen == Screen::Username,
            Route::ChatRoom { username } => {
                self.screen == Screen::ChatRoom
                    && self.username.as_deref() == Some(username.as_str())
            }
        }
    }

    fn apply_route(&mut self, route: Route) {
        debug!(?route, "route changed");
        match route {
            Route::Username => {
                self.screen = Screen::Username;
                self.username = None;
                self.messages.clear();
                self.message_views.clear();
                self.pending_sends.clear();
                self.draft.clear();
                self.input_height = INPUT_LINE_HEIGHT;
                self.stream_notice = None;
                self.scroll.reset();
                self.status_text = USERNAME_PROMPT_STATUS.to_owned();
            }
            Route::ChatRoom { username } => {
                self.screen = Screen::ChatRoom;
                self.username = Some(username);
                self.status_text = "Connecting".to_owned();
                self.rebuild_views();
            }
        }
    }

    fn apply_sync_status(&mut self, status: SyncStatus) {
        self.status_text = match status.state {
            StreamState::Idle if self.screen == Screen::Username => {
                USERNAME_PROMPT_STATUS.to_owned()
            }
            StreamState::Idle => "Idle".to_owned(),
            StreamState::Syncing => {
                self.stream_notice = None;
                "Loading messages".to_owned()
            }
            StreamState::Live => {
                if matches!(self.stream_notice, Some((ChatErrorKind::Subscription, _))) {
                    self.stream_notice = None;
                }
                "Live".to_owned()
            }
            StreamState::Reconnecting => match status.retry_in_ms {
                Some(ms) => format!("Reconnecting (retry in {ms} ms)"),
                None => "Reconnecting".to_owned(),
            },
        };
    }

    fn apply_stream_error(&mut self, error: StreamError) {
        warn!(
            kind = error.kind.code(),
            code = %error.error.code,
            "stream error: {}",
            error.error.message
        );
        let text = match error.kind {
            ChatErrorKind::Fetch => {
                format!("Could not load messages: {}. Use /reload to retry.", error.error.message)
            }
            ChatErrorKind::Subscription => {
                format!("Live updates interrupted: {}", error.error.message)
            }
            ChatErrorKind::Insert => format!("Message not sent: {}", error.error.message),
        };
        self.stream_notice = Some((error.kind, text));
    }

    fn rebuild_views(&mut self) {
        self.message_views =
            present_messages(&self.messages, self.username.as_deref(), self.utc_offset);
    }
}
