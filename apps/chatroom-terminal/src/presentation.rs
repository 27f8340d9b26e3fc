//! Pure mapping from timeline messages to display rows, and the text wrapping they share.

use backend_core::{Message, parse_timestamp};
use chrono::FixedOffset;

/// Label used when a timestamp cannot be parsed.
pub const UNKNOWN_TIME_LABEL: &str = "--:--";

/// Horizontal placement of a message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Start,
    End,
}

/// One rendered message row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub id: String,
    /// Sender name, shown only for other people's messages.
    pub sender_label: Option<String>,
    pub body: String,
    pub time_label: String,
    pub alignment: Alignment,
    pub is_own: bool,
}

/// Build display rows in timeline order.
///
/// A message is the viewer's own when its username equals `identity` exactly.
pub fn present_messages(
    messages: &[Message],
    identity: Option<&str>,
    offset: FixedOffset,
) -> Vec<MessageView> {
    messages
        .iter()
        .map(|message| present_message(message, identity, offset))
        .collect()
}

fn present_message(message: &Message, identity: Option<&str>, offset: FixedOffset) -> MessageView {
    let is_own = identity.is_some_and(|name| name == message.username);
    MessageView {
        id: message.id.clone(),
        sender_label: (!is_own).then(|| message.username.clone()),
        body: message.content.clone(),
        time_label: time_label(&message.created_at, offset),
        alignment: if is_own { Alignment::End } else { Alignment::Start },
        is_own,
    }
}

/// Hours and minutes of `created_at` in the viewer's offset, or `--:--`.
pub fn time_label(created_at: &str, offset: FixedOffset) -> String {
    parse_timestamp(created_at)
        .map(|at| at.with_timezone(&offset).format("%H:%M").to_string())
        .unwrap_or_else(|| UNKNOWN_TIME_LABEL.to_owned())
}

/// Word-wrap `text` to `width` columns, splitting words longer than a line.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut out = Vec::new();

    for paragraph in text.split('\n') {
        let mut current = String::new();
        let mut current_len = 0;
        for word in paragraph.split_whitespace() {
            let mut word: Vec<char> = word.chars().collect();
            while word.len() > width {
                if current_len > 0 {
                    out.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let rest = word.split_off(width);
                out.push(word.into_iter().collect());
                word = rest;
            }
            let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
            if needed > width {
                out.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.extend(word.iter());
            current_len += word.len();
        }
        if current_len > 0 || paragraph.trim().is_empty() {
            out.push(current);
        }
    }
    out
}
