//! Bayeux protocol router.
//!
//! The router classifies each inbound message by its channel and dispatches
//! it to the matching request processor. Session events returned by the
//! processors are turned into notifications to the server collaborator.

use meteor_protocol::channel::{meta, META_PREFIX, SERVICE_PREFIX};
use meteor_protocol::{encode_packets, fields, Codec, Message, Packet, PacketType, ProtocolError};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::context::MessageContext;
use crate::processor::{decode_request, ProcessingError, Processed, RequestProcessors};
use crate::server::Server;
use crate::session::{Session, SessionEvent};

/// Error strings sent back to clients.
pub mod errors {
    pub const UNKNOWN_META_CHANNEL: &str = "Unknown meta channel";
    pub const WILDCARD_PUBLISH: &str = "Attempt to publish to a wildcard channel";
    pub const PROCESSING_DENIED: &str = "Processing was denied";
    pub const INVALID_CHANNEL: &str = "Invalid channel";
}

/// Where a channel path is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRoute {
    Handshake,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
    /// Any other `/meta/` channel.
    UnknownMeta,
    /// Paths ending in `/*` or `/**`.
    WildcardPublish,
    /// `/service/` channels are answered by server-side listeners only.
    ServiceChannel,
    ApplicationPublish,
}

/// Classify a channel path.
#[must_use]
pub fn classify(path: &str) -> ChannelRoute {
    match path {
        meta::HANDSHAKE => ChannelRoute::Handshake,
        meta::CONNECT => ChannelRoute::Connect,
        meta::DISCONNECT => ChannelRoute::Disconnect,
        meta::SUBSCRIBE => ChannelRoute::Subscribe,
        meta::UNSUBSCRIBE => ChannelRoute::Unsubscribe,
        p if p.starts_with(META_PREFIX) => ChannelRoute::UnknownMeta,
        p if p.ends_with("/*") || p.ends_with("/**") => ChannelRoute::WildcardPublish,
        p if p.starts_with(SERVICE_PREFIX) => ChannelRoute::ServiceChannel,
        _ => ChannelRoute::ApplicationPublish,
    }
}

/// Build a single-message error response.
///
/// The reply echoes the channel and the request `id` verbatim, and carries
/// the client id when a session is known.
#[must_use]
pub fn error_packet(channel: &str, error: &str, request: &Message, session: Option<&Session>) -> Packet {
    let mut reply = Message::new();
    reply
        .put(fields::SUCCESSFUL, false)
        .put(fields::CHANNEL, channel)
        .put(fields::ERROR, error);
    if let Some(id) = request.get(fields::ID) {
        reply.put(fields::ID, id.clone());
    }
    if let Some(session) = session {
        reply.put(fields::CLIENT_ID, session.id());
    }
    Packet::single(PacketType::Response, reply)
}

/// Encode every message of `packets` as one array.
///
/// Returns `None` when there is nothing to send.
///
/// # Errors
///
/// Returns an error if a message fails to encode.
pub fn as_text(packets: &[Packet], codec: &dyn Codec) -> Result<Option<String>, ProtocolError> {
    let text = encode_packets(packets, codec)?;
    if let Some(text) = &text {
        trace!(bytes = text.len(), "Encoded response");
    }
    Ok(text)
}

/// A disconnect whose side effects must wait until its reply was sent.
#[derive(Debug)]
pub struct DeferredDisconnect {
    pub context: MessageContext,
}

impl DeferredDisconnect {
    /// Notify the server of the graceful disconnect.
    pub fn apply(self, server: &dyn Server, session: &Arc<Session>) {
        session.mark_disconnected();
        server.on_session_disconnected(session, Some(&self.context), false);
    }
}

/// Result of routing one message.
#[derive(Debug, Default)]
pub struct Routed {
    pub packets: Vec<Packet>,
    pub deferred: Option<DeferredDisconnect>,
}

impl From<Vec<Packet>> for Routed {
    fn from(packets: Vec<Packet>) -> Self {
        Self {
            packets,
            deferred: None,
        }
    }
}

/// Dispatches inbound messages to request processors.
#[derive(Clone)]
pub struct Router {
    server: Arc<dyn Server>,
    processors: Arc<dyn RequestProcessors>,
}

impl Router {
    #[must_use]
    pub fn new(server: Arc<dyn Server>, processors: Arc<dyn RequestProcessors>) -> Self {
        Self { server, processors }
    }

    #[must_use]
    pub fn server(&self) -> &Arc<dyn Server> {
        &self.server
    }

    /// Route one accepted message.
    ///
    /// `transports` lists the transports the carrier can actually serve, for
    /// handshake negotiation.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be decoded into the request
    /// its channel requires, or a processor fails.
    pub fn respond(
        &self,
        session: &Arc<Session>,
        transports: &[String],
        context: MessageContext,
    ) -> Result<Routed, ProcessingError> {
        let channel_id = Arc::clone(&context.channel_id);
        let path = channel_id.path();
        let route = classify(path);
        let server = self.server.as_ref();
        trace!(session = %session.id(), channel = %path, ?route, "Routing message");

        let routed = match route {
            ChannelRoute::Handshake => {
                let request = decode_request(&context.message)?;
                let processed = self
                    .processors
                    .handshake(server, transports, session, request, &context)?;
                self.unexpected_event(session, &processed);
                Routed::from(processed.packets)
            }
            ChannelRoute::Connect => {
                let request = decode_request(&context.message)?;
                let processed = self.processors.connect(server, session, request, &context)?;
                match processed.event {
                    Some(SessionEvent::Connected) => {
                        debug!(session = %session.id(), "Session connected");
                        server.on_session_connected(session, &context);
                    }
                    _ => self.unexpected_event(session, &processed),
                }
                Routed::from(processed.packets)
            }
            ChannelRoute::Disconnect => {
                let request = decode_request(&context.message)?;
                let processed = self
                    .processors
                    .disconnect(server, session, request, &context)?;
                match processed.event {
                    Some(SessionEvent::Disconnected) => {
                        debug!(session = %session.id(), "Session disconnecting");
                        Routed {
                            packets: processed.packets,
                            deferred: Some(DeferredDisconnect { context }),
                        }
                    }
                    _ => {
                        self.unexpected_event(session, &processed);
                        Routed::from(processed.packets)
                    }
                }
            }
            ChannelRoute::Subscribe => {
                let request = decode_request(&context.message)?;
                let processed = self
                    .processors
                    .subscribe(server, session, request, &context)?;
                match &processed.event {
                    Some(SessionEvent::Subscribed(channel)) => {
                        server.on_channel_subscribed(session, channel, &context);
                    }
                    _ => self.unexpected_event(session, &processed),
                }
                Routed::from(processed.packets)
            }
            ChannelRoute::Unsubscribe => {
                let request = decode_request(&context.message)?;
                let processed = self
                    .processors
                    .unsubscribe(server, session, request, &context)?;
                match &processed.event {
                    Some(SessionEvent::Unsubscribed(channel)) => {
                        server.on_channel_unsubscribed(session, channel, &context);
                    }
                    _ => self.unexpected_event(session, &processed),
                }
                Routed::from(processed.packets)
            }
            ChannelRoute::UnknownMeta => vec![error_packet(
                path,
                errors::UNKNOWN_META_CHANNEL,
                &context.message,
                Some(session.as_ref()),
            )]
            .into(),
            ChannelRoute::WildcardPublish => vec![error_packet(
                path,
                errors::WILDCARD_PUBLISH,
                &context.message,
                Some(session.as_ref()),
            )]
            .into(),
            ChannelRoute::ServiceChannel => Routed::default(),
            ChannelRoute::ApplicationPublish => {
                let request = decode_request(&context.message)?;
                let processed = self
                    .processors
                    .publish(server, session, &channel_id, request, &context)?;
                self.unexpected_event(session, &processed);
                Routed::from(processed.packets)
            }
        };

        Ok(routed)
    }

    fn unexpected_event(&self, session: &Session, processed: &Processed) {
        if let Some(event) = &processed.event {
            warn!(session = %session.id(), ?event, "Ignoring session event for this channel");
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}
