//! Bayeux request processors.
//!
//! [`BayeuxProcessors`] decides the outcome of every meta operation and of
//! application publishes. It never touches subscription bookkeeping itself:
//! lifecycle changes are reported as [`SessionEvent`]s and applied to the
//! server by the router.

use meteor_core::{
    ConnectRequest, DisconnectRequest, HandshakeRequest, MessageContext, ProcessingError,
    Processed, PublishRequest, RequestProcessors, Server, Session, SessionEvent, SessionState,
    SubscribeRequest, UnsubscribeRequest,
};
use meteor_protocol::channel::META_PREFIX;
use meteor_protocol::{
    fields, ArrayValue, ChannelId, Message, Packet, PacketType, Value, Version, MINIMUM_VERSION,
    PROTOCOL_VERSION,
};
use std::sync::Arc;
use tracing::debug;

/// Error strings sent back to clients.
pub mod errors {
    pub const HANDSHAKE_COMPLETED: &str = "Handshake was previously completed";
    pub const HANDSHAKE_UNSUPPORTED_TRANSPORT: &str =
        "Handshake attempted on an unsupported transport";
    pub const HANDSHAKE_REQUIRED: &str = "Handshake required";
    pub const CONNECT_UNSUPPORTED_TRANSPORT: &str =
        "Connection requested on an unsupported transport";
    pub const CONNECTION_REQUIRED: &str = "Connection required";
    pub const MISSING_SUBSCRIPTION: &str = "Missing subscription";
    pub const META_SUBSCRIPTION: &str = "Attempt to subscribe to a meta channel";
}

/// Advice field names and reconnect values.
pub mod advice {
    pub const RECONNECT: &str = "reconnect";
    pub const INTERVAL: &str = "interval";
    pub const TIMEOUT: &str = "timeout";

    pub const RETRY: &str = "retry";
    pub const HANDSHAKE: &str = "handshake";
    pub const NONE: &str = "none";
}

/// Protocol settings advertised by the processors.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub version: Version,
    pub minimum_version: Version,
    /// Advised pause between connects.
    pub interval_ms: u64,
    /// Advised connect timeout.
    pub timeout_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            minimum_version: MINIMUM_VERSION,
            interval_ms: 0,
            timeout_ms: 30_000,
        }
    }
}

/// Standard Bayeux processors.
#[derive(Debug, Clone, Default)]
pub struct BayeuxProcessors {
    config: ProcessorConfig,
}

/// Reply skeleton: channel and id echoed, client id when known.
fn response(context: &MessageContext, client_id: Option<&str>) -> Message {
    let mut reply = Message::for_channel(context.channel_id.path());
    if let Some(id) = context.message.get(fields::ID) {
        reply.put(fields::ID, id.clone());
    }
    if let Some(client_id) = client_id {
        reply.put(fields::CLIENT_ID, client_id);
    }
    reply
}

fn success(context: &MessageContext, client_id: Option<&str>) -> Message {
    let mut reply = response(context, client_id);
    reply.put(fields::SUCCESSFUL, true);
    reply
}

fn failure(
    context: &MessageContext,
    client_id: Option<&str>,
    error: &str,
    reconnect: Option<&str>,
) -> Message {
    let mut reply = response(context, client_id);
    reply.put(fields::SUCCESSFUL, false).put(fields::ERROR, error);
    if let Some(reconnect) = reconnect {
        reply.advice_mut().put(advice::RECONNECT, reconnect);
    }
    reply
}

fn reply(message: Message) -> Processed {
    Processed::reply(Packet::single(PacketType::Response, message))
}

/// Check that the request speaks for `session` and the handshake completed.
fn handshook(session: &Session, client_id: Option<&str>) -> bool {
    client_id == Some(session.id()) && session.is_handshook()
}

impl BayeuxProcessors {
    #[must_use]
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    fn with_versions(&self, reply: &mut Message, transports: &[String]) {
        let supported: ArrayValue = transports
            .iter()
            .map(|t| Value::from(t.as_str()))
            .collect();
        reply
            .put(fields::VERSION, self.config.version.to_string())
            .put(fields::MINIMUM_VERSION, self.config.minimum_version.to_string())
            .put(fields::SUPPORTED_CONNECTION_TYPES, supported);
    }

    /// Validate a subscribe or unsubscribe and resolve its channel.
    fn subscription(
        &self,
        session: &Session,
        client_id: Option<&str>,
        subscription: Option<&str>,
        context: &MessageContext,
    ) -> Result<Arc<ChannelId>, Message> {
        let Some(subscription) = subscription else {
            return Err(failure(context, client_id, errors::MISSING_SUBSCRIPTION, None));
        };

        let reject = |error: &str, reconnect: Option<&str>| {
            let mut reply = failure(context, client_id, error, reconnect);
            reply.put(fields::SUBSCRIPTION, subscription);
            reply
        };

        if !handshook(session, client_id) {
            return Err(reject(errors::HANDSHAKE_REQUIRED, Some(advice::HANDSHAKE)));
        }
        if session.state() != SessionState::Connected {
            return Err(reject(errors::CONNECTION_REQUIRED, Some(advice::RETRY)));
        }
        if subscription.starts_with(META_PREFIX) {
            return Err(reject(errors::META_SUBSCRIPTION, None));
        }

        ChannelId::parse(subscription)
            .map(Arc::new)
            .map_err(|e| reject(&e.to_string(), None))
    }
}

impl RequestProcessors for BayeuxProcessors {
    fn handshake(
        &self,
        _server: &dyn Server,
        transports: &[String],
        session: &Arc<Session>,
        request: HandshakeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let supported = request
            .supported_connection_types
            .iter()
            .any(|requested| transports.contains(requested));

        let mut message = if session.state() != SessionState::Initialized {
            failure(context, Some(session.id()), errors::HANDSHAKE_COMPLETED, Some(advice::RETRY))
        } else if !supported {
            failure(
                context,
                Some(session.id()),
                errors::HANDSHAKE_UNSUPPORTED_TRANSPORT,
                Some(advice::HANDSHAKE),
            )
        } else if session.transition(SessionState::Initialized, SessionState::Handshook) {
            debug!(session = %session.id(), version = ?request.version, "Handshake completed");
            let mut message = success(context, Some(session.id()));
            message
                .advice_mut()
                .put(advice::RECONNECT, advice::RETRY)
                .put(advice::INTERVAL, self.config.interval_ms)
                .put(advice::TIMEOUT, self.config.timeout_ms);
            message
        } else {
            failure(context, Some(session.id()), errors::HANDSHAKE_COMPLETED, Some(advice::RETRY))
        };

        self.with_versions(&mut message, transports);
        Ok(reply(message))
    }

    fn connect(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        request: ConnectRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let client_id = request.client_id.as_deref();
        if !handshook(session, client_id) {
            return Ok(reply(failure(
                context,
                client_id,
                errors::HANDSHAKE_REQUIRED,
                Some(advice::HANDSHAKE),
            )));
        }

        let first = session.state() == SessionState::Handshook;
        if first
            && !request
                .connection_type
                .as_deref()
                .map_or(false, |t| context.transport == t)
        {
            return Ok(reply(failure(
                context,
                client_id,
                errors::CONNECT_UNSUPPORTED_TRANSPORT,
                Some(advice::HANDSHAKE),
            )));
        }

        let mut message = success(context, Some(session.id()));
        message
            .advice_mut()
            .put(advice::INTERVAL, self.config.interval_ms)
            .put(advice::TIMEOUT, self.config.timeout_ms);

        let processed = reply(message);
        if first && session.transition(SessionState::Handshook, SessionState::Connected) {
            Ok(processed.with_event(SessionEvent::Connected))
        } else {
            Ok(processed)
        }
    }

    fn disconnect(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        _request: DisconnectRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let mut message = success(context, Some(session.id()));
        message.advice_mut().put(advice::RECONNECT, advice::NONE);
        Ok(reply(message).with_event(SessionEvent::Disconnected))
    }

    fn subscribe(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        request: SubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let client_id = request.client_id.as_deref();
        match self.subscription(session, client_id, request.subscription.as_deref(), context) {
            Ok(channel) => {
                let mut message = success(context, Some(session.id()));
                message.put(fields::SUBSCRIPTION, channel.path());
                Ok(reply(message).with_event(SessionEvent::Subscribed(channel)))
            }
            Err(message) => Ok(reply(message)),
        }
    }

    fn unsubscribe(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        request: UnsubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let client_id = request.client_id.as_deref();
        match self.subscription(session, client_id, request.subscription.as_deref(), context) {
            Ok(channel) => {
                let mut message = success(context, Some(session.id()));
                message.put(fields::SUBSCRIPTION, channel.path());
                Ok(reply(message).with_event(SessionEvent::Unsubscribed(channel)))
            }
            Err(message) => Ok(reply(message)),
        }
    }

    /// Broadcast to other subscribers and acknowledge.
    ///
    /// A publisher subscribed to the channel also gets the delivery inline,
    /// after the acknowledgement.
    fn publish(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        request: PublishRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let client_id = request.client_id.as_deref();
        if !handshook(session, client_id) {
            return Ok(reply(failure(
                context,
                client_id,
                errors::HANDSHAKE_REQUIRED,
                Some(advice::HANDSHAKE),
            )));
        }
        if session.state() != SessionState::Connected {
            return Ok(reply(failure(
                context,
                client_id,
                errors::CONNECTION_REQUIRED,
                Some(advice::RETRY),
            )));
        }

        let mut delivery = Message::for_channel(channel.path());
        if let Some(id) = context.message.get(fields::ID) {
            delivery.put(fields::ID, id.clone());
        }
        if let Some(data) = context.message.data() {
            delivery.put(fields::DATA, data.clone());
        }

        let echo = Packet::single(PacketType::Response, delivery.clone());
        let recipients = server.publish(
            Some(session.as_ref()),
            Packet::single(PacketType::Delivery, delivery)
                .with_sender(session.id())
                .with_route(Arc::clone(channel)),
        );
        debug!(session = %session.id(), channel = %channel, recipients, "Published");

        let ack = Arc::new(Packet::single(
            PacketType::Response,
            success(context, Some(session.id())),
        ));
        let filtered = (!server.is_subscribed(session, channel)).then_some(&**channel);
        let merged = Packet::merge(ack, &echo, filtered);

        Ok(Processed::reply(
            Arc::try_unwrap(merged).unwrap_or_else(|shared| (*shared).clone()),
        ))
    }
}
