use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::sdk::ClientError;

pub mod state;
pub use state::{ClientState, StateError};

/// Observer invoked with faults detected outside any caller call.
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// Shared session state: the current [`ClientState`] and the error hook.
///
/// Cloned into the background tasks so they can fail the session; every
/// clone observes the same state.
#[derive(Clone)]
pub struct Session {
    state: Arc<watch::Sender<ClientState>>,
    error_hook: Arc<Mutex<Option<ErrorCallback>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ClientState::Idle);
        Self {
            state: Arc::new(tx),
            error_hook: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn set_error_hook(&self, hook: ErrorCallback) {
        *self.error_hook.lock() = Some(hook);
    }

    /// Applies a validated transition.
    pub fn transition(&self, next: ClientState) -> Result<(), StateError> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| match current.transition(next) {
            Ok(state) => {
                debug!(from = ?*current, to = ?state, "client state");
                *current = state;
                true
            }
            Err(err) => {
                result = Err(err);
                false
            }
        });
        result
    }

    /// Moves a live session to `Error`. Returns false if it had already ended.
    pub fn fail(&self) -> bool {
        self.move_if(
            |s| matches!(s, ClientState::Connecting | ClientState::Playing),
            ClientState::Error,
        )
    }

    /// Moves the session to `Stopped` unless it is idle or already stopped.
    pub fn stop(&self) -> bool {
        self.move_if(
            |s| {
                matches!(
                    s,
                    ClientState::Connecting | ClientState::Playing | ClientState::Error
                )
            },
            ClientState::Stopped,
        )
    }

    /// Entry point for faults found by background tasks.
    ///
    /// Only a Playing session is failed and reported; during `Connecting` the
    /// in-flight `connect` call returns the error itself, and after the
    /// session ended there is nobody left to tell. The hook therefore runs at
    /// most once per session.
    pub fn report_background(&self, err: ClientError) {
        let failed = self.move_if(|s| s == ClientState::Playing, ClientState::Error);
        if !failed {
            debug!(error = %err, "background fault ignored outside Playing");
            return;
        }
        warn!(error = %err, "session failed in background");
        let hook = self.error_hook.lock().clone();
        if let Some(hook) = hook {
            hook(&err);
        }
    }

    fn move_if(&self, pred: impl Fn(ClientState) -> bool, next: ClientState) -> bool {
        self.state.send_if_modified(|current| {
            if pred(*current) {
                debug!(from = ?*current, to = ?next, "client state");
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn playing() -> Session {
        let session = Session::new();
        session.transition(ClientState::Connecting).unwrap();
        session.transition(ClientState::Playing).unwrap();
        session
    }

    #[test]
    fn background_fault_fires_hook_once() {
        let session = playing();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        session.set_error_hook(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        session.report_background(ClientError::Timeout("keepalive".into()));
        session.report_background(ClientError::Timeout("keepalive".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), ClientState::Error);
    }

    #[test]
    fn background_fault_while_connecting_is_left_to_caller() {
        let session = Session::new();
        session.transition(ClientState::Connecting).unwrap();
        session.report_background(ClientError::Timeout("keepalive".into()));
        assert_eq!(session.state(), ClientState::Connecting);
    }

    #[test]
    fn watchers_see_transitions() {
        let session = Session::new();
        let rx = session.subscribe();
        session.transition(ClientState::Connecting).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), ClientState::Connecting);
    }

    #[test]
    fn stop_is_noop_when_idle() {
        let session = Session::new();
        assert!(!session.stop());
        assert_eq!(session.state(), ClientState::Idle);
        let session = playing();
        assert!(session.stop());
        assert!(!session.stop());
    }
}
