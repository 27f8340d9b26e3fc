//! Plain-text frame rendering for UI snapshots.

use crate::{
    input::{CHAT_HELP, USERNAME_HELP},
    presentation::{Alignment, MessageView, wrap},
    state::{AppSnapshot, INPUT_LINE_HEIGHT, PendingSendView, Screen, SendState},
};

const MIN_BUBBLE_WIDTH: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    /// Frame width in columns.
    pub width: usize,
}

/// Render one full frame, top to bottom.
pub fn render_frame(snapshot: &AppSnapshot, options: &RenderOptions) -> Vec<String> {
    let width = options.width;
    let mut lines = Vec::new();

    match snapshot.screen {
        Screen::Booting => {
            lines.push(title("Chat room", width));
            lines.push(snapshot.status_text.clone());
        }
        Screen::Username => {
            lines.push(title("Chat room", width));
            lines.push(String::new());
            lines.push("Choose a username".to_owned());
            lines.push(USERNAME_HELP.to_owned());
            push_error(&mut lines, snapshot);
        }
        Screen::ChatRoom => render_room(&mut lines, snapshot, width),
    }
    lines
}

fn render_room(lines: &mut Vec<String>, snapshot: &AppSnapshot, width: usize) {
    let username = snapshot.username.as_deref().unwrap_or_default();
    lines.push(title(&format!("Chat room - {username}"), width));
    if snapshot.scroll.following {
        lines.push(format!("status: {}", snapshot.status_text));
    } else {
        lines.push(format!("status: {}  [scrolled]", snapshot.status_text));
    }
    lines.push("-".repeat(width));

    let bubble_width = (width * 3 / 4).max(MIN_BUBBLE_WIDTH).min(width);
    let scroll = snapshot.scroll;
    if scroll.start > 0 {
        lines.push(format!("  ^ {} earlier (/up)", scroll.start));
    }
    for view in &snapshot.messages[scroll.start..scroll.end] {
        render_message(lines, view, width, bubble_width);
    }
    if scroll.unseen_below > 0 {
        lines.push(format!("  v {} newer below (/bottom)", scroll.unseen_below));
    }

    let mut failed_index = 0;
    for send in &snapshot.pending_sends {
        if send.state == SendState::Failed {
            failed_index += 1;
        }
        render_pending(lines, send, failed_index, width, bubble_width);
    }

    lines.push("-".repeat(width));
    push_error(lines, snapshot);
    if !snapshot.can_send {
        return;
    }

    let input_rows = (snapshot.input_height / INPUT_LINE_HEIGHT).max(1) as usize;
    let draft_lines = wrap(&snapshot.draft, input_width(width));
    let hidden = draft_lines.len().saturating_sub(input_rows);
    for (row, line) in draft_lines[hidden..].iter().enumerate() {
        let prefix = if row == 0 && hidden == 0 { "> " } else { "  " };
        lines.push(format!("{prefix}{line}"));
    }
    lines.push(CHAT_HELP.to_owned());
}

fn render_message(lines: &mut Vec<String>, view: &MessageView, width: usize, bubble_width: usize) {
    match view.alignment {
        Alignment::Start => {
            let label = view.sender_label.as_deref().unwrap_or_default();
            lines.push(format!("{label}  {}", view.time_label));
            for line in wrap(&view.body, bubble_width.saturating_sub(2)) {
                lines.push(format!("  {line}"));
            }
        }
        Alignment::End => {
            lines.push(right_align(&view.time_label, width));
            for line in wrap(&view.body, bubble_width) {
                lines.push(right_align(&line, width));
            }
        }
    }
}

fn render_pending(
    lines: &mut Vec<String>,
    send: &PendingSendView,
    failed_index: usize,
    width: usize,
    bubble_width: usize,
) {
    let header = match send.state {
        SendState::Pending => "sending...".to_owned(),
        SendState::Failed => format!(
            "not sent ({}) /resend {failed_index}",
            send.error_code.as_deref().unwrap_or("unknown")
        ),
    };
    lines.push(right_align(&header, width));
    for line in wrap(&send.body, bubble_width) {
        lines.push(right_align(&line, width));
    }
}

/// Columns left for draft text after the `> ` prompt.
pub fn input_width(width: usize) -> usize {
    width.saturating_sub(2).max(1)
}

fn push_error(lines: &mut Vec<String>, snapshot: &AppSnapshot) {
    if let Some(error) = snapshot.error_text.as_deref() {
        lines.push(format!("! {error}"));
    }
}

fn title(text: &str, width: usize) -> String {
    let text = format!(" {text} ");
    let fill = width.saturating_sub(text.chars().count());
    let left = fill / 2;
    format!("{}{text}{}", "=".repeat(left), "=".repeat(fill - left))
}

fn right_align(line: &str, width: usize) -> String {
    let pad = width.saturating_sub(line.chars().count());
    format!("{}{line}", " ".repeat(pad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{INPUT_MAX_HEIGHT, ScrollView};

    fn snapshot(screen: Screen) -> AppSnapshot {
        AppSnapshot {
            screen,
            username: Some("alice".to_owned()),
            messages: Vec::new(),
            pending_sends: Vec::new(),
            draft: String::new(),
            input_height: INPUT_LINE_HEIGHT,
            status_text: "Live".to_owned(),
            error_text: None,
            can_send: screen == Screen::ChatRoom,
            scroll: ScrollView {
                start: 0,
                end: 0,
                unseen_below: 0,
                following: true,
            },
            autoscroll_count: 0,
        }
    }

    fn view(id: &str, own: bool, body: &str) -> MessageView {
        MessageView {
            id: id.to_owned(),
            sender_label: (!own).then(|| "bob".to_owned()),
            body: body.to_owned(),
            time_label: "00:00".to_owned(),
            alignment: if own { Alignment::End } else { Alignment::Start },
            is_own: own,
        }
    }

    const OPTIONS: RenderOptions = RenderOptions { width: 40 };

    #[test]
    fn username_screen_shows_prompt_and_error() {
        let mut snapshot = snapshot(Screen::Username);
        snapshot.error_text = Some("Please enter a username.".to_owned());
        let frame = render_frame(&snapshot, &OPTIONS);
        assert!(frame.iter().any(|line| line == USERNAME_HELP));
        assert_eq!(frame.last().map(String::as_str), Some("! Please enter a username."));
    }

    #[test]
    fn own_messages_are_right_aligned_and_others_labelled() {
        let mut snapshot = snapshot(Screen::ChatRoom);
        snapshot.messages = vec![view("1", false, "hi alice"), view("2", true, "hi bob")];
        snapshot.scroll.end = 2;
        let frame = render_frame(&snapshot, &OPTIONS);

        assert!(frame.contains(&"bob  00:00".to_owned()));
        assert!(frame.contains(&"  hi alice".to_owned()));
        let own = frame
            .iter()
            .find(|line| line.trim() == "hi bob")
            .expect("own message line");
        assert_eq!(own.chars().count(), 40);
        assert!(own.starts_with(' '));
    }

    #[test]
    fn scroll_markers_and_failed_sends_are_listed() {
        let mut snapshot = snapshot(Screen::ChatRoom);
        snapshot.messages = (0..5).map(|n| view(&n.to_string(), false, "x")).collect();
        snapshot.scroll = ScrollView {
            start: 1,
            end: 3,
            unseen_below: 2,
            following: false,
        };
        snapshot.pending_sends = vec![PendingSendView {
            client_txn_id: "t1".to_owned(),
            body: "lost".to_owned(),
            state: SendState::Failed,
            error_code: Some("insert_failed".to_owned()),
        }];
        let frame = render_frame(&snapshot, &OPTIONS);

        assert!(frame.contains(&"  ^ 1 earlier (/up)".to_owned()));
        assert!(frame.contains(&"  v 2 newer below (/bottom)".to_owned()));
        assert!(
            frame
                .iter()
                .any(|line| line.trim() == "not sent (insert_failed) /resend 1")
        );
        assert_eq!(frame.iter().filter(|line| line.starts_with("bob")).count(), 2);
    }

    #[test]
    fn input_area_follows_input_height() {
        let mut snapshot = snapshot(Screen::ChatRoom);
        snapshot.draft = (1..=10).map(|n| format!("l{n}")).collect::<Vec<_>>().join("\n");
        snapshot.input_height = INPUT_MAX_HEIGHT;
        let frame = render_frame(&snapshot, &OPTIONS);
        let draft_rows: Vec<&String> = frame
            .iter()
            .filter(|line| line.trim_start().starts_with('l'))
            .collect();
        assert_eq!(draft_rows.len(), 8);
        assert_eq!(draft_rows[0].trim(), "l3");
    }

    #[test]
    fn long_draft_is_wrapped_to_input_width() {
        let mut snapshot = snapshot(Screen::ChatRoom);
        snapshot.draft = "y".repeat(input_width(OPTIONS.width) * 2);
        snapshot.input_height = 2 * INPUT_LINE_HEIGHT;
        let frame = render_frame(&snapshot, &OPTIONS);
        let draft_rows: Vec<&String> = frame
            .iter()
            .filter(|line| line.trim_start().starts_with('y'))
            .collect();
        assert_eq!(draft_rows.len(), 2);
        assert!(draft_rows[0].starts_with("> "));
        assert!(draft_rows.iter().all(|row| row.chars().count() <= OPTIONS.width));
    }
}
