use thiserror::Error;

/// Externally visible client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Created, never connected.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Negotiated; writes are accepted.
    Playing,
    /// Torn down by the caller.
    Stopped,
    /// Failed; a fresh `connect` is required.
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid state transition from {from:?} to {to:?}")]
pub struct StateError {
    pub from: ClientState,
    pub to: ClientState,
}

impl ClientState {
    /// Validates a transition and returns the new state.
    pub fn transition(self, next: ClientState) -> Result<ClientState, StateError> {
        use ClientState::*;
        let allowed = matches!(
            (self, next),
            (Idle | Stopped | Error, Connecting)
                | (Connecting, Playing | Stopped | Error)
                | (Playing, Stopped | Error)
                | (Error, Stopped)
        );
        if allowed {
            Ok(next)
        } else {
            Err(StateError {
                from: self,
                to: next,
            })
        }
    }

    /// True once the session has ended, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::Stopped | ClientState::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::ClientState::*;

    #[test]
    fn happy_path() {
        let s = Idle.transition(Connecting).unwrap();
        let s = s.transition(Playing).unwrap();
        assert_eq!(s.transition(Stopped).unwrap(), Stopped);
    }

    #[test]
    fn leaving_playing_is_terminal() {
        assert!(Error.transition(Playing).is_err());
        assert!(Stopped.transition(Playing).is_err());
        assert!(Error.is_terminal());
        assert!(!Playing.is_terminal());
    }

    #[test]
    fn reconnect_allowed_from_terminal_states() {
        assert!(Stopped.transition(Connecting).is_ok());
        assert!(Error.transition(Connecting).is_ok());
        assert!(Playing.transition(Connecting).is_err());
        assert!(Idle.transition(Playing).is_err());
    }
}
