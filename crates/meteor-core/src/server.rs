//! The server collaborator.
//!
//! The core never owns subscription or session bookkeeping itself; it reports
//! lifecycle changes to a [`Server`] implementation.

use meteor_protocol::{ChannelId, Packet};
use std::sync::Arc;

use crate::context::MessageContext;
use crate::session::Session;

/// Session registry and broadcast hub consumed by carriers and the router.
pub trait Server: Send + Sync {
    /// Register a freshly opened session.
    fn add_session(&self, session: Arc<Session>);

    /// Forget a session whose connection closed.
    fn remove_session(&self, session: &Session);

    /// The session completed its first connect.
    fn on_session_connected(&self, session: &Arc<Session>, context: &MessageContext);

    /// The session went away.
    ///
    /// `abrupt` is true when the connection closed without a
    /// `/meta/disconnect`, in which case there is no message context.
    fn on_session_disconnected(
        &self,
        session: &Arc<Session>,
        context: Option<&MessageContext>,
        abrupt: bool,
    );

    fn on_channel_subscribed(
        &self,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        context: &MessageContext,
    );

    fn on_channel_unsubscribed(
        &self,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        context: &MessageContext,
    );

    /// Check if `session` has a subscription matching `channel`.
    fn is_subscribed(&self, session: &Session, channel: &ChannelId) -> bool;

    /// Deliver `packet` to every subscriber of its route except the sender.
    ///
    /// Returns the number of sessions the packet was queued for.
    fn publish(&self, sender: Option<&Session>, packet: Packet) -> usize;
}
