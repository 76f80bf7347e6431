//! Bayeux messages.
//!
//! A [`Message`] is an object value with typed accessors for the reserved
//! Bayeux fields. Cloning a message is cheap; [`Message::overlay`] gives a
//! copy-on-write view whose mutations stay private to the holder.

use serde::ser::{Serialize, Serializer};

use crate::object::ObjectValue;
use crate::value::Value;

/// Reserved message field names.
pub mod fields {
    pub const ID: &str = "id";
    pub const CLIENT_ID: &str = "clientId";
    pub const CHANNEL: &str = "channel";
    pub const SUCCESSFUL: &str = "successful";
    pub const ERROR: &str = "error";
    pub const ADVICE: &str = "advice";
    pub const EXT: &str = "ext";
    pub const DATA: &str = "data";
    pub const VERSION: &str = "version";
    pub const MINIMUM_VERSION: &str = "minimumVersion";
    pub const CONNECTION_TYPE: &str = "connectionType";
    pub const SUPPORTED_CONNECTION_TYPES: &str = "supportedConnectionTypes";
    pub const SUBSCRIPTION: &str = "subscription";
}

/// A Bayeux message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    object: ObjectValue,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// View an existing object as a message.
    #[must_use]
    pub fn from_object(object: ObjectValue) -> Self {
        Self { object }
    }

    /// Create a message addressed to `channel`.
    #[must_use]
    pub fn for_channel(channel: &str) -> Self {
        let mut message = Self::new();
        message.put(fields::CHANNEL, channel);
        message
    }

    /// Wrap this message in a copy-on-write overlay.
    #[must_use]
    pub fn overlay(&self) -> Self {
        Self {
            object: self.object.overlay(),
        }
    }

    #[must_use]
    pub fn is_overlay(&self) -> bool {
        self.object.is_overlay()
    }

    #[must_use]
    pub fn as_object(&self) -> &ObjectValue {
        &self.object
    }

    pub fn as_object_mut(&mut self) -> &mut ObjectValue {
        &mut self.object
    }

    #[must_use]
    pub fn into_object(self) -> ObjectValue {
        self.object
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.object.get(field)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.object.get_mut(field)
    }

    pub fn put(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.object.put(field, value);
        self
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.object.remove(field)
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.str_field(fields::ID)
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.str_field(fields::CLIENT_ID)
    }

    /// Channel path, if present and non-empty.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.str_field(fields::CHANNEL).filter(|c| !c.is_empty())
    }

    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.str_field(fields::ERROR)
    }

    /// Check the `successful` flag. Absent means not successful.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.get(fields::SUCCESSFUL)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[must_use]
    pub fn advice(&self) -> Option<&ObjectValue> {
        self.get(fields::ADVICE).and_then(Value::as_object)
    }

    #[must_use]
    pub fn ext(&self) -> Option<&ObjectValue> {
        self.get(fields::EXT).and_then(Value::as_object)
    }

    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.get(fields::DATA)
    }

    /// Mutable advice, created empty if absent or not an object.
    pub fn advice_mut(&mut self) -> &mut ObjectValue {
        self.object_field_mut(fields::ADVICE)
    }

    /// Mutable extension object, created empty if absent or not an object.
    pub fn ext_mut(&mut self) -> &mut ObjectValue {
        self.object_field_mut(fields::EXT)
    }

    /// Mutable data payload, created as an empty object if absent.
    pub fn data_mut(&mut self) -> &mut Value {
        if !self.object.contains_key(fields::DATA) {
            self.object.put(fields::DATA, ObjectValue::new());
        }
        match self.object.get_mut(fields::DATA) {
            Some(value) => value,
            None => unreachable!("data inserted above"),
        }
    }

    fn object_field_mut(&mut self, field: &str) -> &mut ObjectValue {
        let is_object = matches!(self.object.get(field), Some(Value::Object(_)));
        if !is_object {
            self.object.put(field, ObjectValue::new());
        }
        match self.object.get_mut(field) {
            Some(Value::Object(object)) => object,
            _ => unreachable!("object field inserted above"),
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.object.serialize(serializer)
    }
}

impl From<ObjectValue> for Message {
    fn from(object: ObjectValue) -> Self {
        Self::from_object(object)
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Object(message.object)
    }
}
