//! # meteor-protocol
//!
//! Value model and wire format for the Meteor Bayeux engine.
//!
//! This crate defines the JSON-like [`Value`] model, the copy-on-write
//! overlays that let many consumers mutate one shared broadcast payload,
//! Bayeux [`Message`]s, [`Packet`] batching and the pluggable [`Codec`].
//!
//! ## Example
//!
//! ```rust
//! use meteor_protocol::{Packet, PacketType, ValueFactory};
//!
//! let factory = ValueFactory::json();
//! let mut message = factory.message();
//! message.put("channel", "/chat/lobby").put("data", "hello");
//!
//! let packet = Packet::single(PacketType::Delivery, message);
//! let frozen = packet.freeze();
//!
//! let mut copy = frozen.clone();
//! copy.messages[0].ext_mut().put("seen", true);
//!
//! let codec = factory.codec().as_ref();
//! assert_eq!(
//!     packet.encode(codec).unwrap(),
//!     r#"[{"channel":"/chat/lobby","data":"hello"}]"#
//! );
//! assert_ne!(copy.encode(codec).unwrap(), packet.encode(codec).unwrap());
//! ```

pub mod array;
pub mod channel;
pub mod codec;
pub mod message;
pub mod object;
pub mod packet;
pub mod value;
pub mod version;

pub use array::ArrayValue;
pub use channel::{ChannelId, ChannelKind};
pub use codec::{Codec, JsonCodec, ProtocolError, ValueFactory};
pub use message::{fields, Message};
pub use object::{Map, ObjectValue};
pub use packet::{encode_packets, Packet, PacketType};
pub use value::{Value, ValueType};
pub use version::{Version, MINIMUM_VERSION, PROTOCOL_VERSION};
