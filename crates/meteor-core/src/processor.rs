//! Request decoding and the request-processor collaborator.
//!
//! Each meta request is decoded from its raw message into a typed request
//! before it reaches a processor. Processors decide the protocol outcome and
//! report lifecycle changes as a [`SessionEvent`].

use meteor_protocol::{ChannelId, Message, Packet, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use crate::context::MessageContext;
use crate::server::Server;
use crate::session::{Session, SessionEvent};

/// Errors raised while processing a request.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The message does not have the shape its channel requires.
    #[error("Failed to decode {channel} request: {source}")]
    Decode {
        channel: String,
        #[source]
        source: serde_json::Error,
    },

    /// Protocol-level failure while building a response.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The processor itself failed.
    #[error("Processor failed: {0}")]
    Failed(String),
}

/// Outcome of processing one request.
#[derive(Debug, Default)]
pub struct Processed {
    /// Packets to send back on the requesting carrier.
    pub packets: Vec<Packet>,
    pub event: Option<SessionEvent>,
}

impl Processed {
    /// Nothing to send, nothing happened.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Reply with one packet.
    #[must_use]
    pub fn reply(packet: Packet) -> Self {
        Self {
            packets: vec![packet],
            event: None,
        }
    }

    #[must_use]
    pub fn with_event(mut self, event: SessionEvent) -> Self {
        self.event = Some(event);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub id: Option<serde_json::Value>,
    pub version: Option<String>,
    pub minimum_version: Option<String>,
    #[serde(default)]
    pub supported_connection_types: Vec<String>,
    pub ext: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub id: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub connection_type: Option<String>,
    pub advice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest {
    pub id: Option<serde_json::Value>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub id: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub id: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub id: Option<serde_json::Value>,
    pub client_id: Option<String>,
    pub channel: String,
}

/// Decode a typed request from a raw message.
///
/// # Errors
///
/// Returns [`ProcessingError::Decode`] if the message does not match `T`.
pub fn decode_request<T: DeserializeOwned>(message: &Message) -> Result<T, ProcessingError> {
    let decode_error = |source| ProcessingError::Decode {
        channel: message.channel().unwrap_or("<none>").to_string(),
        source,
    };

    let value = serde_json::to_value(message).map_err(decode_error)?;
    serde_json::from_value(value).map_err(decode_error)
}

/// Decides the outcome of each meta operation and of publishes.
///
/// Every method receives the message context (transport, connection
/// metadata, resolved channel and raw message) alongside the typed request.
pub trait RequestProcessors: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the handshake cannot be processed at all.
    fn handshake(
        &self,
        server: &dyn Server,
        transports: &[String],
        session: &Arc<Session>,
        request: HandshakeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError>;

    /// # Errors
    ///
    /// Returns an error if the connect cannot be processed at all.
    fn connect(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        request: ConnectRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError>;

    /// # Errors
    ///
    /// Returns an error if the disconnect cannot be processed at all.
    fn disconnect(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        request: DisconnectRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError>;

    /// # Errors
    ///
    /// Returns an error if the subscribe cannot be processed at all.
    fn subscribe(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        request: SubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError>;

    /// # Errors
    ///
    /// Returns an error if the unsubscribe cannot be processed at all.
    fn unsubscribe(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        request: UnsubscribeRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError>;

    /// Handle a publish to an application channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the publish cannot be processed at all.
    fn publish(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        request: PublishRequest,
        context: &MessageContext,
    ) -> Result<Processed, ProcessingError>;
}
