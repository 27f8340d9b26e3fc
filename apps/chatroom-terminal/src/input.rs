//! Line-oriented command parsing for the terminal UI.

use crate::state::Screen;

pub const USERNAME_HELP: &str = "Type a username and press Enter. /quit exits.";
pub const CHAT_HELP: &str = "/back leave  /reload  /resend N  /up /down /bottom  /quit  (end a line with \\ to continue, // to send a leading /)";

/// What one line of input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    Join(String),
    /// Final line of a message; the draft is sent.
    Send(String),
    /// Line added to a multi-line draft.
    ContinueDraft(String),
    Back,
    Reload,
    Resend(usize),
    ScrollUp,
    ScrollDown,
    ScrollToTail,
    Help,
    Quit,
    Invalid(String),
}

pub fn parse_input(screen: Screen, line: &str) -> InputAction {
    let line = line.strip_suffix('\r').unwrap_or(line);

    if let Some(command) = line.strip_prefix('/')
        && !command.starts_with('/')
    {
        return parse_command(screen, command);
    }

    match screen {
        Screen::Booting => InputAction::Invalid("Still starting, try again.".to_owned()),
        Screen::Username => InputAction::Join(line.to_owned()),
        Screen::ChatRoom => {
            let text = line.strip_prefix('/').unwrap_or(line);
            match text.strip_suffix('\\') {
                Some(partial) => InputAction::ContinueDraft(partial.to_owned()),
                None => InputAction::Send(text.to_owned()),
            }
        }
    }
}

fn parse_command(screen: Screen, command: &str) -> InputAction {
    let mut words = command.split_whitespace();
    let name = words.next().unwrap_or_default();

    match (name, screen) {
        ("quit" | "exit", _) => InputAction::Quit,
        ("help", _) => InputAction::Help,
        ("back", Screen::ChatRoom) => InputAction::Back,
        ("reload", Screen::ChatRoom) => InputAction::Reload,
        ("up", Screen::ChatRoom) => InputAction::ScrollUp,
        ("down", Screen::ChatRoom) => InputAction::ScrollDown,
        ("bottom", Screen::ChatRoom) => InputAction::ScrollToTail,
        ("resend", Screen::ChatRoom) => match words.next().map(str::parse::<usize>) {
            Some(Ok(index)) if index > 0 => InputAction::Resend(index),
            _ => InputAction::Invalid("Usage: /resend N (see the numbered failed messages)".to_owned()),
        },
        _ => InputAction::Invalid(format!("Unknown command /{name}. Try /help.")),
    }
}
