//! Request and message contexts handed to collaborators.

use meteor_protocol::{ChannelId, Message};
use std::net::SocketAddr;
use std::sync::Arc;

/// Metadata about the physical connection.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub remote_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
    /// True for in-process clients.
    pub local: bool,
}

impl RequestContext {
    /// Context for an in-process client.
    #[must_use]
    pub fn local() -> Self {
        Self {
            local: true,
            ..Self::default()
        }
    }
}

/// One inbound message together with everything needed to process it.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Name of the transport the message arrived on.
    pub transport: String,
    pub context: Arc<RequestContext>,
    pub channel_id: Arc<ChannelId>,
    pub message: Message,
}

impl MessageContext {
    #[must_use]
    pub fn new(
        transport: impl Into<String>,
        context: Arc<RequestContext>,
        channel_id: Arc<ChannelId>,
        message: Message,
    ) -> Self {
        Self {
            transport: transport.into(),
            context,
            channel_id,
            message,
        }
    }
}
