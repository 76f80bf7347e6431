//! Carrier connection state.

/// Two-state connection flag. It only ever moves from connected to
/// disconnected; only carrier construction creates a connected state.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectionState(State);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Disconnected,
}

impl ConnectionState {
    pub(crate) fn connected() -> Self {
        Self(State::Connected)
    }

    #[must_use]
    pub fn disconnected() -> Self {
        Self(State::Disconnected)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.0 == State::Connected
    }

    /// Disconnect, returning whether the state was connected.
    pub fn disconnect(&mut self) -> bool {
        std::mem::replace(&mut self.0, State::Disconnected) == State::Connected
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::disconnected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_once() {
        let mut state = ConnectionState::connected();
        assert!(state.is_connected());
        assert!(state.disconnect());
        assert!(!state.is_connected());
        assert!(!state.disconnect());
    }

    #[test]
    fn test_default_is_disconnected() {
        assert!(!ConnectionState::default().is_connected());
    }
}
