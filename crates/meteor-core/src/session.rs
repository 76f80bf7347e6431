//! Bayeux sessions.
//!
//! A session is created by the carrier when a connection opens. The server
//! pushes broadcast packets into the session's delivery queue and the owning
//! carrier drains it.

use meteor_protocol::Packet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Delivery queue capacity used by [`Session::new`].
pub const DEFAULT_MESSAGE_QUEUE_SIZE: usize = 1024;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique session ID.
#[must_use]
pub fn generate_session_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{timestamp:x}{counter:04x}")
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    /// Created, no handshake yet.
    Initialized = 0,
    /// Handshake completed.
    Handshook = 1,
    /// First connect received.
    Connected = 2,
    /// Disconnected; terminal.
    Disconnected = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::Handshook,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// A client session bound to one carrier.
pub struct Session {
    id: String,
    transport: String,
    local: bool,
    state: AtomicU8,
    delivery: mpsc::Sender<Packet>,
    dropped: AtomicU64,
}

impl Session {
    /// Create a session and the receiving end of its delivery queue.
    #[must_use]
    pub fn new(transport: impl Into<String>, local: bool) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        Self::with_queue_size(transport, local, DEFAULT_MESSAGE_QUEUE_SIZE)
    }

    /// Create a session whose delivery queue holds at most `queue_size`
    /// packets.
    #[must_use]
    pub fn with_queue_size(
        transport: impl Into<String>,
        local: bool,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (delivery, deliveries) = mpsc::channel(queue_size.max(1));
        let session = Arc::new(Self {
            id: generate_session_id(),
            transport: transport.into(),
            local,
            state: AtomicU8::new(SessionState::Initialized as u8),
            delivery,
            dropped: AtomicU64::new(0),
        });
        (session, deliveries)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the transport the session was created on.
    #[must_use]
    pub fn transport(&self) -> &str {
        &self.transport
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check if the handshake completed and the session is still alive.
    #[must_use]
    pub fn is_handshook(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Handshook | SessionState::Connected
        )
    }

    /// Move from `from` to `to`, returning whether the transition happened.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the session disconnected, returning whether it was alive.
    pub fn mark_disconnected(&self) -> bool {
        self.state
            .swap(SessionState::Disconnected as u8, Ordering::AcqRel)
            != SessionState::Disconnected as u8
    }

    /// Queue a packet for the owning carrier.
    ///
    /// A full queue drops the packet. Returns `false` if the packet was
    /// dropped or the carrier is gone.
    pub fn deliver(&self, packet: Packet) -> bool {
        match self.delivery.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    session = %self.id,
                    capacity = self.delivery.max_capacity(),
                    dropped,
                    "Delivery queue full, dropping packet"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Packets dropped because the delivery queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("local", &self.local)
            .field("state", &self.state())
            .finish()
    }
}

/// Lifecycle change reported by a request processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Subscribed(Arc<meteor_protocol::ChannelId>),
    Unsubscribed(Arc<meteor_protocol::ChannelId>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_protocol::PacketType;

    #[test]
    fn test_session_ids_unique() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_state_transitions() {
        let (session, _rx) = Session::new("websocket", false);
        assert_eq!(session.state(), SessionState::Initialized);
        assert!(!session.is_handshook());

        assert!(session.transition(SessionState::Initialized, SessionState::Handshook));
        assert!(!session.transition(SessionState::Initialized, SessionState::Handshook));
        assert!(session.is_handshook());

        assert!(session.transition(SessionState::Handshook, SessionState::Connected));
        assert!(session.mark_disconnected());
        assert!(!session.mark_disconnected());
        assert!(!session.is_handshook());
    }

    #[tokio::test]
    async fn test_deliver() {
        let (session, mut rx) = Session::new("local", true);
        assert!(session.deliver(Packet::new(PacketType::Delivery)));
        assert_eq!(rx.recv().await.map(|p| p.packet_type), Some(PacketType::Delivery));

        drop(rx);
        assert!(!session.deliver(Packet::new(PacketType::Delivery)));
        assert_eq!(session.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (session, mut rx) = Session::with_queue_size("websocket", false, 2);
        let packet = |channel: &str| {
            Packet::single(PacketType::Delivery, meteor_protocol::Message::for_channel(channel))
        };

        assert!(session.deliver(packet("/a")));
        assert!(session.deliver(packet("/b")));
        assert!(!session.deliver(packet("/c")));
        assert_eq!(session.dropped(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.messages[0].channel(), Some("/a"));
        assert!(session.deliver(packet("/d")));

        let queued: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|p| p.messages[0].channel().map(str::to_string))
            .collect();
        assert_eq!(queued, vec!["/b", "/d"]);
    }
}
