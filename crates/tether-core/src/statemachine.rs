//! Hierarchical session state machine.
//!
//! States form a tree; "in state X" holds when the current leaf is X or has
//! X as an ancestor:
//!
//! ```text
//! NOT_CONNECTED
//! CONNECTED
//!   ├─ SESSION_NOT_READY            (initial child of CONNECTED)
//!   └─ SESSION_READY
//!        └─ ACTIVE                  (initial child of SESSION_READY)
//! ```
//!
//! Transitions always land on the target's initial leaf, so `CONNECT` ends
//! in `SESSION_NOT_READY` and `START_SESSION` ends in `ACTIVE`.

/// States of a session. `Connected` and `SessionReady` are composite; the
/// machine's current value is always a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No transport attached.
    NotConnected,
    /// Transport attached, handshake not finished.
    Connected,
    /// Initial child of [`SessionState::Connected`].
    SessionNotReady,
    /// Handshake finished on this side.
    SessionReady,
    /// Initial child of [`SessionState::SessionReady`]; all send
    /// operations are permitted here.
    Active,
}

impl SessionState {
    /// Parent in the state hierarchy, `None` for roots.
    #[must_use]
    fn parent(self) -> Option<Self> {
        match self {
            Self::NotConnected | Self::Connected => None,
            Self::SessionNotReady | Self::SessionReady => Some(Self::Connected),
            Self::Active => Some(Self::SessionReady),
        }
    }
}

/// Events driving the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Attach a transport.
    Connect,
    /// Drop the transport.
    Disconnect,
    /// Handshake completed.
    StartSession,
    /// Session torn down while the transport stays up.
    StopSession,
}

/// The session state machine. Holds the current leaf state.
#[derive(Debug)]
pub struct Statemachine {
    current: SessionState,
}

impl Statemachine {
    /// A fresh machine in `NOT_CONNECTED`.
    #[must_use]
    pub fn new() -> Self {
        Self { current: SessionState::NotConnected }
    }

    /// Current leaf state.
    #[must_use]
    pub fn current(&self) -> SessionState {
        self.current
    }

    /// Check membership, walking the ancestor chain of the current leaf.
    #[must_use]
    pub fn is_in_state(&self, state: SessionState) -> bool {
        let mut cursor = Some(self.current);
        while let Some(current) = cursor {
            if current == state {
                return true;
            }
            cursor = current.parent();
        }
        false
    }

    /// Apply an event. Returns `false` when the event is not permitted in
    /// the current state; the machine is left unchanged in that case.
    pub fn go_to_next_state(&mut self, event: SessionEvent) -> bool {
        let next = match event {
            SessionEvent::Connect if self.is_in_state(SessionState::NotConnected) => {
                SessionState::SessionNotReady
            }
            SessionEvent::Disconnect if self.is_in_state(SessionState::Connected) => {
                SessionState::NotConnected
            }
            SessionEvent::StartSession if self.is_in_state(SessionState::SessionNotReady) => {
                SessionState::Active
            }
            SessionEvent::StopSession if self.is_in_state(SessionState::SessionReady) => {
                SessionState::SessionNotReady
            }
            _ => return false,
        };

        self.current = next;
        true
    }
}

impl Default for Statemachine {
    fn default() -> Self {
        Self::new()
    }
}
