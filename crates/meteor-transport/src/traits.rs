//! Carrier abstraction traits for Meteor.
//!
//! A carrier is the per-connection endpoint of a transport. It owns exactly
//! one session, decodes inbound frames, and writes responses and deliveries
//! back to the client.

use async_trait::async_trait;
use meteor_core::{as_text, ExtensionNotifier, ProcessingError, RequestContext, Session};
use meteor_protocol::{Codec, Packet};
use std::sync::Arc;
use thiserror::Error;

/// Idle timeout used when neither the carrier nor its transport set one.
pub const DEFAULT_MAX_SESSION_IDLE_TIMEOUT_MS: i64 = 300_000;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A write did not complete within the async send timeout.
    #[error("Send timed out")]
    Timeout,

    /// The receiving queue is full; the data was dropped.
    #[error("Queue full")]
    QueueFull,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] meteor_protocol::ProtocolError),

    /// Request processing error.
    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Resolve an idle timeout override.
///
/// Negative values fall back to the transport's `max_interval`, and then to
/// [`DEFAULT_MAX_SESSION_IDLE_TIMEOUT_MS`].
#[must_use]
pub fn resolve_idle_timeout(requested_ms: i64, transport_max_interval_ms: i64) -> i64 {
    if requested_ms >= 0 {
        requested_ms
    } else if transport_max_interval_ms >= 0 {
        transport_max_interval_ms
    } else {
        DEFAULT_MAX_SESSION_IDLE_TIMEOUT_MS
    }
}

/// Per-connection endpoint of a transport.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Transport name, e.g. `"websocket"`.
    fn carrier_type(&self) -> &'static str;

    /// Transports this carrier can actually serve.
    fn actual_transports(&self) -> &[String];

    fn context(&self) -> &Arc<RequestContext>;

    fn user_agent(&self) -> Option<&str> {
        self.context().user_agent.as_deref()
    }

    /// The session bound to this carrier.
    fn session(&self) -> &Arc<Session>;

    /// Override the idle timeout; negative values restore the default.
    fn set_max_session_idle_timeout(&self, timeout_ms: i64);

    fn max_session_idle_timeout(&self) -> i64;

    async fn is_connected(&self) -> bool;

    /// Mark the carrier disconnected, returning whether it was connected.
    async fn set_disconnected(&self) -> bool;

    /// Encode and write `packets`. Nothing is written if they hold no
    /// messages.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if the write exceeded the async
    /// send timeout, or another error if encoding or writing failed.
    async fn send(&self, packets: &[Packet]) -> Result<(), TransportError>;

    /// Close the underlying channel normally.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake failed.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Run the outgoing extension pass over per-recipient copies of `packets`
/// and encode the survivors.
///
/// Returns the text and the number of messages it holds, or `None` when
/// nothing is left to send.
pub(crate) fn encode_outbound(
    packets: &[Packet],
    session: &Session,
    extensions: &dyn ExtensionNotifier,
    codec: &dyn Codec,
) -> Result<Option<(String, usize)>, TransportError> {
    let outbound: Vec<Packet> = packets
        .iter()
        .map(|packet| {
            let mut packet = packet.clone();
            packet
                .messages
                .retain_mut(|message| extensions.outgoing(session, message));
            packet
        })
        .collect();
    let count = outbound.iter().map(Packet::len).sum();

    Ok(as_text(&outbound, codec)?.map(|text| (text, count)))
}
