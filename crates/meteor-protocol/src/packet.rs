//! Packets: ordered batches of messages with routing metadata.
//!
//! Packets are immutable once built and usually travel behind an [`Arc`].
//! [`Packet::merge`] combines batches without copying when nothing changes,
//! and [`Packet::freeze`] prepares a packet for fan-out so each recipient can
//! mutate its own view.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;

use crate::channel::ChannelId;
use crate::codec::{Codec, ProtocolError};
use crate::message::Message;

/// Why a packet exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// Inbound client request.
    Request,
    /// Reply to a request.
    Response,
    /// Broadcast delivered to subscribers.
    Delivery,
}

/// A batch of messages.
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Session that originated the packet, if any.
    pub sender_id: Option<String>,
    /// Channel the packet was routed on, if any.
    pub route: Option<Arc<ChannelId>>,
    pub messages: Vec<Message>,
}

impl Packet {
    /// Create an empty packet.
    #[must_use]
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            sender_id: None,
            route: None,
            messages: Vec::new(),
        }
    }

    /// Create a packet holding a single message.
    #[must_use]
    pub fn single(packet_type: PacketType, message: Message) -> Self {
        Self {
            messages: vec![message],
            ..Self::new(packet_type)
        }
    }

    /// Create a response packet holding `messages`.
    #[must_use]
    pub fn response(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::new(PacketType::Response)
        }
    }

    #[must_use]
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = Some(sender_id.into());
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: Arc<ChannelId>) -> Self {
        self.route = Some(route);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append the messages of `other` to `base`.
    ///
    /// Messages of `other` whose channel equals `filtered_route` are skipped.
    /// If no message qualifies, `base` itself is returned without allocating.
    #[must_use]
    pub fn merge(base: Arc<Packet>, other: &Packet, filtered_route: Option<&ChannelId>) -> Arc<Packet> {
        let qualifies = |message: &&Message| match filtered_route {
            Some(route) => message.channel() != Some(route.path()),
            None => true,
        };

        if !other.messages.iter().any(|m| qualifies(&m)) {
            return base;
        }

        let mut merged = Packet {
            packet_type: base.packet_type,
            sender_id: base.sender_id.clone(),
            route: base.route.clone(),
            messages: Vec::with_capacity(base.messages.len() + other.messages.len()),
        };
        merged.messages.extend(base.messages.iter().cloned());
        merged
            .messages
            .extend(other.messages.iter().filter(qualifies).cloned());

        Arc::new(merged)
    }

    /// Copy this packet with every message wrapped in an overlay.
    ///
    /// Clones of a frozen packet can be mutated independently per recipient;
    /// the original messages are never touched.
    #[must_use]
    pub fn freeze(&self) -> Packet {
        Packet {
            packet_type: self.packet_type,
            sender_id: self.sender_id.clone(),
            route: self.route.clone(),
            messages: self.messages.iter().map(Message::overlay).collect(),
        }
    }

    /// Encode the messages as an array into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if a message fails to encode.
    pub fn encode_into(&self, codec: &dyn Codec, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(b'[');
        encode_messages(&self.messages, codec, buf, true)?;
        buf.put_u8(b']');
        Ok(())
    }

    /// Encode the messages as a JSON array string.
    ///
    /// # Errors
    ///
    /// Returns an error if a message fails to encode.
    pub fn encode(&self, codec: &dyn Codec) -> Result<String, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(codec, &mut buf)?;
        Ok(String::from_utf8(buf.to_vec())?)
    }
}

/// Encode the messages of several packets as one array.
///
/// Returns `None` when the packets hold no messages.
///
/// # Errors
///
/// Returns an error if a message fails to encode.
pub fn encode_packets(packets: &[Packet], codec: &dyn Codec) -> Result<Option<String>, ProtocolError> {
    if packets.iter().all(Packet::is_empty) {
        return Ok(None);
    }

    let mut buf = BytesMut::new();
    buf.put_u8(b'[');
    let mut first = true;
    for packet in packets {
        first = encode_messages(&packet.messages, codec, &mut buf, first)?;
    }
    buf.put_u8(b']');

    Ok(Some(String::from_utf8(buf.to_vec())?))
}

/// Write comma-separated messages, returning whether nothing was written yet.
fn encode_messages(
    messages: &[Message],
    codec: &dyn Codec,
    buf: &mut BytesMut,
    mut first: bool,
) -> Result<bool, ProtocolError> {
    for message in messages {
        if !first {
            buf.put_u8(b',');
        }
        codec.encode_object_into(message.as_object(), buf)?;
        first = false;
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::value::Value;
    use serde_json::json;

    fn message(value: serde_json::Value) -> Message {
        match Value::from(value) {
            Value::Object(object) => Message::from_object(object),
            _ => unreachable!(),
        }
    }

    fn packet(values: Vec<serde_json::Value>) -> Packet {
        Packet::response(values.into_iter().map(message).collect())
    }

    #[test]
    fn test_encode_empty() {
        let packet = Packet::new(PacketType::Response);
        assert_eq!(packet.encode(&JsonCodec).unwrap(), "[]");
        assert_eq!(encode_packets(&[packet], &JsonCodec).unwrap(), None);
    }

    #[test]
    fn test_encode_packets_joins_all() {
        let first = packet(vec![json!({"channel": "/a"})]);
        let empty = Packet::new(PacketType::Response);
        let second = packet(vec![json!({"channel": "/b"}), json!({"channel": "/c"})]);

        let text = encode_packets(&[first, empty, second], &JsonCodec).unwrap();
        assert_eq!(
            text.as_deref(),
            Some(r#"[{"channel":"/a"},{"channel":"/b"},{"channel":"/c"}]"#)
        );
    }

    #[test]
    fn test_merge_preserves_order_and_length() {
        let base = Arc::new(packet(vec![json!({"channel": "/a"}), json!({"channel": "/b"})]));
        let other = packet(vec![json!({"channel": "/c"}), json!({"channel": "/d"})]);

        let merged = Packet::merge(base, &other, None);
        let channels: Vec<_> = merged.messages.iter().filter_map(Message::channel).collect();
        assert_eq!(channels, vec!["/a", "/b", "/c", "/d"]);
    }

    #[test]
    fn test_merge_filters_route() {
        let base = Arc::new(packet(vec![json!({"channel": "/meta/publish-ack"})]));
        let other = packet(vec![json!({"channel": "/chat"}), json!({"channel": "/news"})]);
        let route = ChannelId::parse("/chat").unwrap();

        let merged = Packet::merge(base, &other, Some(&route));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.messages[1].channel(), Some("/news"));
    }

    #[test]
    fn test_merge_all_filtered_returns_base() {
        let base = Arc::new(packet(vec![json!({"channel": "/a"})]));
        let other = packet(vec![json!({"channel": "/chat"}), json!({"channel": "/chat"})]);
        let route = ChannelId::parse("/chat").unwrap();

        let merged = Packet::merge(Arc::clone(&base), &other, Some(&route));
        assert!(Arc::ptr_eq(&merged, &base));

        let merged = Packet::merge(Arc::clone(&base), &Packet::new(PacketType::Delivery), None);
        assert!(Arc::ptr_eq(&merged, &base));
    }

    #[test]
    fn test_frozen_clones_diverge() {
        let original = packet(vec![json!({"channel": "/chat", "data": {"text": "hi"}})]);
        let before = original.encode(&JsonCodec).unwrap();
        let frozen = original.freeze();

        let mut first = frozen.clone();
        let mut second = frozen.clone();
        first.messages[0].ext_mut().put("recipient", "one");
        second.messages[0]
            .data_mut()
            .as_object_mut()
            .unwrap()
            .put("text", "changed");

        let first_text = first.encode(&JsonCodec).unwrap();
        let second_text = second.encode(&JsonCodec).unwrap();

        assert_ne!(first_text, second_text);
        assert_eq!(original.encode(&JsonCodec).unwrap(), before);
        assert_eq!(frozen.encode(&JsonCodec).unwrap(), before);
        assert!(first_text.contains(r#""recipient":"one""#));
        assert!(second_text.contains(r#""text":"changed""#));
    }
}
