//! Collaborator doubles shared by the unit tests of this crate.

use meteor_protocol::{fields, ChannelId, Message, Packet, PacketType};
use std::sync::{Arc, Mutex};

use crate::context::MessageContext;
use crate::processor::{
    ConnectRequest, DisconnectRequest, HandshakeRequest, ProcessingError, Processed,
    PublishRequest, RequestProcessors, SubscribeRequest, UnsubscribeRequest,
};
use crate::server::Server;
use crate::session::{Session, SessionEvent};

/// Server that ignores every notification.
pub struct NullServer;

impl Server for NullServer {
    fn add_session(&self, _session: Arc<Session>) {}
    fn remove_session(&self, _session: &Session) {}
    fn on_session_connected(&self, _session: &Arc<Session>, _context: &MessageContext) {}
    fn on_session_disconnected(
        &self,
        _session: &Arc<Session>,
        _context: Option<&MessageContext>,
        _abrupt: bool,
    ) {
    }
    fn on_channel_subscribed(
        &self,
        _session: &Arc<Session>,
        _channel: &Arc<ChannelId>,
        _context: &MessageContext,
    ) {
    }
    fn on_channel_unsubscribed(
        &self,
        _session: &Arc<Session>,
        _channel: &Arc<ChannelId>,
        _context: &MessageContext,
    ) {
    }
    fn is_subscribed(&self, _session: &Session, _channel: &ChannelId) -> bool {
        false
    }
    fn publish(&self, _sender: Option<&Session>, _packet: Packet) -> usize {
        0
    }
}

/// Server that records notifications as strings.
#[derive(Default)]
pub struct RecordingServer {
    events: Mutex<Vec<String>>,
}

impl RecordingServer {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Server for RecordingServer {
    fn add_session(&self, _session: Arc<Session>) {
        self.record("added".to_string());
    }
    fn remove_session(&self, _session: &Session) {
        self.record("removed".to_string());
    }
    fn on_session_connected(&self, _session: &Arc<Session>, _context: &MessageContext) {
        self.record("connected".to_string());
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
    fn publish(&self, _sender: Option<&Session>, _packet: Packet) -> usize {
        0
    }
}

/// Processors that always succeed.
pub struct StubProcessors;

fn ack(context: &MessageContext, session: &Session) -> Packet {
    let mut reply = Message::for_channel(context.channel_id.path());
    reply
        .put(fields::SUCCESSFUL, true)
        .put(fields::CLIENT_ID, session.id());
    Packet::single(PacketType::Response, reply)
}

fn subscription(value: Option<String>) -> Result<Arc<ChannelId>, ProcessingError> {
    let path = value.ok_or_else(|| ProcessingError::Failed("missing subscription".into()))?;
    Ok(Arc::new(ChannelId::parse(&path)?))
}

impl RequestProcessors for StubProcessors {
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
        request: SubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let channel = subscription(request.subscription)?;
        Ok(Processed::reply(ack(context, session)).with_event(SessionEvent::Subscribed(channel)))
    }

    fn unsubscribe(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        request: UnsubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        let channel = subscription(request.subscription)?;
        Ok(Processed::reply(ack(context, session)).with_event(SessionEvent::Unsubscribed(channel)))
    }

    fn publish(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        _channel: &Arc<ChannelId>,
        _request: PublishRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError> {
        Ok(Processed::reply(ack(context, session)))
    }
}
