use crate::{
    error::BackendError,
    types::{BackendCommand, BackendEvent, Route},
};

/// Two-screen navigation stack: `Username` and `ChatRoom(username)`.
///
/// The stack is empty until `boot` runs. `join` pushes the chat room on top of the
/// username screen; `back` collapses the stack to a single `Username` entry.
#[derive(Debug, Clone, Default)]
pub struct NavigationStateMachine {
    stack: Vec<Route>,
}

impl NavigationStateMachine {
    /// Route on top of the stack, `None` before boot.
    pub fn route(&self) -> Option<&Route> {
        self.stack.last()
    }

    /// Full navigation history, bottom first.
    pub fn stack(&self) -> &[Route] {
        &self.stack
    }

    /// Identity of the active chat room, if one is shown.
    pub fn chat_username(&self) -> Option<&str> {
        match self.route() {
            Some(Route::ChatRoom { username }) => Some(username.as_str()),
            _ => None,
        }
    }

    /// Check that `command` is allowed from the current route.
    pub fn validate(&self, command: &BackendCommand) -> Result<(), BackendError> {
        use BackendCommand::*;

        match command {
            Boot => {
                if self.stack.is_empty() {
                    Ok(())
                } else {
                    Err(BackendError::invalid_state(self.route(), "boot"))
                }
            }
            Join { .. } => self.expect_username_screen("join"),
            SendMessage { .. } | RetrySend { .. } | ReloadMessages | ResetIdentity => {
                if self.chat_username().is_some() {
                    Ok(())
                } else {
                    Err(BackendError::invalid_state(self.route(), "room command"))
                }
            }
            Resync { .. } | Shutdown => Ok(()),
        }
    }

    /// Pick the initial screen from the persisted identity.
    pub fn boot(&mut self, stored_username: Option<&str>) -> Result<BackendEvent, BackendError> {
        self.validate(&BackendCommand::Boot)?;

        let route = match stored_username.and_then(normalize_username) {
            Some(username) => Route::ChatRoom { username },
            None => Route::Username,
        };
        self.stack.push(route.clone());
        Ok(BackendEvent::RouteChanged { route })
    }

    /// Enter the chat room as `raw_username` (trimmed; blank names are rejected).
    pub fn join(&mut self, raw_username: &str) -> Result<BackendEvent, BackendError> {
        self.expect_username_screen("join")?;
        let username = normalize_username(raw_username).ok_or_else(BackendError::empty_username)?;

        let route = Route::ChatRoom { username };
        self.stack.push(route.clone());
        Ok(BackendEvent::RouteChanged { route })
    }

    /// Leave the chat room and reset history to `[Username]`.
    pub fn back(&mut self) -> Result<BackendEvent, BackendError> {
        if self.chat_username().is_none() {
            return Err(BackendError::invalid_state(self.route(), "back"));
        }

        self.stack.clear();
        self.stack.push(Route::Username);
        Ok(BackendEvent::RouteChanged {
            route: Route::Username,
        })
    }

    fn expect_username_screen(&self, action: &str) -> Result<(), BackendError> {
        if self.route() == Some(&Route::Username) {
            Ok(())
        } else {
            Err(BackendError::invalid_state(self.route(), action))
        }
    }
}

/// Trim a submitted username, returning `None` when nothing is left.
pub fn normalize_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}
