//! Collaborator doubles shared by the unit tests of this crate.

use async_trait::async_trait;
use meteor_core::{
    ConnectRequest, DisconnectRequest, Extension, HandshakeRequest, MessageContext,
    ProcessingError, Processed, PublishRequest, RequestProcessors, Router, Server, Session,
    SessionEvent, SubscribeRequest, UnsubscribeRequest,
};
use meteor_protocol::{fields, ChannelId, Message, Packet, PacketType};
use std::sync::{Arc, Mutex};

use crate::traits::TransportError;
use crate::websocket::FrameSink;

/// Shared log of everything written to a [`RecordingSink`].
#[derive(Clone, Default)]
pub struct SinkLog(Arc<Mutex<Vec<String>>>);

impl SinkLog {
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }
}

/// Frame sink that records writes and closes in order.
pub struct RecordingSink {
    log: SinkLog,
    stalled: bool,
}

impl RecordingSink {
    pub fn new(log: SinkLog) -> Self {
        Self { log, stalled: false }
    }

    /// A sink whose writes never complete.
    pub fn stalled(log: SinkLog) -> Self {
        Self { log, stalled: true }
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        self.log.push(format!("text:{text}"));
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), TransportError> {
        self.log.push(format!("close:{code}"));
        Ok(())
    }
}

/// Extension that denies inbound messages on one channel.
pub struct DenyChannel(pub &'static str);

impl Extension for DenyChannel {
    fn name(&self) -> &str {
        "deny-channel"
    }

    fn incoming(
        &self,
        _server: &dyn Server,
        _session: &Arc<Session>,
        context: &mut MessageContext,
    ) -> bool {
        context.channel_id.path() != self.0
    }
}

/// Server that records notifications as strings.
#[derive(Default)]
pub struct RecordingServer {
    events: Mutex<Vec<String>>,
    deliveries: Mutex<Vec<Arc<Session>>>,
}

impl RecordingServer {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

impl Server for RecordingServer {
    fn add_session(&self, session: Arc<Session>) {
        self.deliveries.lock().unwrap().push(session);
        self.record("added");
    }

    fn remove_session(&self, session: &Session) {
        self.deliveries
            .lock()
            .unwrap()
            .retain(|s| s.id() != session.id());
        self.record("removed");
    }

    fn on_session_connected(&self, _session: &Arc<Session>, _context: &MessageContext) {
        self.record("connected");
    }

    fn on_session_disconnected(
        &self,
        _session: &Arc<Session>,
        _context: Option<&MessageContext>,
        abrupt: bool,
    ) {
        self.record(format!("disconnected abrupt={abrupt}"));
    }

    fn on_channel_subscribed(
        &self,
        _session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        _context: &MessageContext,
    ) {
        self.record(format!("subscribed {channel}"));
    }

    fn on_channel_unsubscribed(
        &self,
        _session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        _context: &MessageContext,
    ) {
        self.record(format!("unsubscribed {channel}"));
    }

    fn is_subscribed(&self, _session: &Session, _channel: &ChannelId) -> bool {
        false
    }

    /// Fan a frozen copy out to every registered session except the sender.
    fn publish(&self, sender: Option<&Session>, packet: Packet) -> usize {
        let frozen = packet.freeze();
        let sessions = self.deliveries.lock().unwrap().clone();
        sessions
            .iter()
            .filter(|s| sender.map_or(true, |sender| sender.id() != s.id()))
            .filter(|s| s.deliver(frozen.clone()))
            .count()
    }
}

/// Processors that acknowledge everything and publish through the server.
pub struct AckProcessors;

fn ack(context: &MessageContext, session: &Session) -> Packet {
    let mut reply = Message::for_channel(context.channel_id.path());
    reply
        .put(fields::SUCCESSFUL, true)
        .put(fields::CLIENT_ID, session.id());
    if let Some(id) = context.message.get(fields::ID) {
        reply.put(fields::ID, id.clone());
    }
    Packet::single(PacketType::Response, reply)
}

impl RequestProcessors for AckProcessors {
    fn handshake(
        &self,
        _server: &dyn Server,
        _transports: &[String],
        session: &Arc<Session>,
        _request: HandshakeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        Ok(Processed::reply(ack(context, session)))
    }

    fn connect(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        _request: ConnectRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        Ok(Processed::reply(ack(context, session)).with_event(SessionEvent::Connected))
    }

    fn disconnect(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        _request: DisconnectRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        Ok(Processed::reply(ack(context, session)).with_event(SessionEvent::Disconnected))
    }

    fn subscribe(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        _request: SubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        Ok(Processed::reply(ack(context, session)))
    }

    fn unsubscribe(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        _request: UnsubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        Ok(Processed::reply(ack(context, session)))
    }

    fn publish(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        _request: PublishRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let delivery = Packet::single(PacketType::Delivery, context.message.clone())
            .with_sender(session.id())
            .with_route(Arc::clone(channel));
        server.publish(Some(session.as_ref()), delivery);
        Ok(Processed::reply(ack(context, session)))
    }
}

pub fn recording_router() -> (Router, Arc<RecordingServer>) {
    let server = Arc::new(RecordingServer::default());
    let router = Router::new(server.clone(), Arc::new(AckProcessors));
    (router, server)
}

pub fn test_router() -> Router {
    recording_router().0
}
