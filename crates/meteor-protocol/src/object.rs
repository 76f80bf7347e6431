//! Object values and the merging copy-on-write overlay.
//!
//! An [`ObjectValue`] is either a plain map behind an [`Arc`], or a merging
//! overlay that presents a mutable façade over a shared base object. The
//! overlay never touches its base: writes land in an owned patch, removals of
//! base fields are recorded as tombstones, and the two are merged lazily when
//! the object is read or encoded.

use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::HashSet;
use std::sync::Arc;

use crate::value::Value;

/// Field storage for plain objects.
pub type Map = IndexMap<String, Value>;

/// A JSON object, possibly an overlay over a shared base.
#[derive(Debug, Clone)]
pub struct ObjectValue {
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    Plain(Arc<Map>),
    Merging(Box<MergingObject>),
}

/// Overlay over a shared base object.
#[derive(Debug, Clone)]
struct MergingObject {
    inner: ObjectValue,
    patch: Patch,
}

/// State of an overlay. `Unmodified` guarantees reads and encoding go
/// straight to the base.
#[derive(Debug, Clone)]
enum Patch {
    Unmodified,
    Patched(Delta),
}

#[derive(Debug, Clone, Default)]
struct Delta {
    outer: Map,
    removed: HashSet<String>,
}

impl ObjectValue {
    /// Create an empty object.
    #[must_use]
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    /// Create an object from an existing map.
    #[must_use]
    pub fn from_map(map: Map) -> Self {
        Self {
            repr: Repr::Plain(Arc::new(map)),
        }
    }

    /// Wrap this object in a copy-on-write overlay.
    ///
    /// The base is shared, not copied. Mutating the returned overlay never
    /// changes `self`.
    #[must_use]
    pub fn overlay(&self) -> Self {
        if let Repr::Merging(merging) = &self.repr {
            if matches!(merging.patch, Patch::Unmodified) {
                return self.clone();
            }
        }

        Self {
            repr: Repr::Merging(Box::new(MergingObject {
                inner: self.clone(),
                patch: Patch::Unmodified,
            })),
        }
    }

    /// Check if this object is a copy-on-write overlay.
    #[must_use]
    pub fn is_overlay(&self) -> bool {
        matches!(self.repr, Repr::Merging(_))
    }

    /// Check if this overlay has diverged from its base.
    ///
    /// Plain objects always report `false`.
    #[must_use]
    pub fn is_patched(&self) -> bool {
        matches!(&self.repr, Repr::Merging(m) if matches!(m.patch, Patch::Patched(_)))
    }

    /// Get a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        match &self.repr {
            Repr::Plain(map) => map.get(field),
            Repr::Merging(merging) => merging.get(field),
        }
    }

    /// Check if a field is visible.
    #[must_use]
    pub fn contains_key(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Get mutable access to a field value.
    ///
    /// On an overlay, a composite field that only exists in the base is
    /// copied into the patch as an overlay of its own, so mutating it leaves
    /// the base untouched.
    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        match &mut self.repr {
            Repr::Plain(map) => Arc::make_mut(map).get_mut(field),
            Repr::Merging(merging) => merging.get_mut(field),
        }
    }

    /// Insert or replace a field.
    pub fn put(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let field = field.into();
        let value = value.into();

        match &mut self.repr {
            Repr::Plain(map) => {
                Arc::make_mut(map).insert(field, value);
            }
            Repr::Merging(merging) => {
                let delta = merging.delta();
                delta.removed.remove(&field);
                delta.outer.insert(field, value);
            }
        }

        self
    }

    /// Remove a field, returning the value that was visible before removal.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        match &mut self.repr {
            Repr::Plain(map) => Arc::make_mut(map).shift_remove(field),
            Repr::Merging(merging) => merging.remove(field),
        }
    }

    /// Remove every visible field.
    pub fn remove_all(&mut self) -> &mut Self {
        match &mut self.repr {
            Repr::Plain(map) => *map = Arc::new(Map::new()),
            Repr::Merging(merging) => merging.remove_all(),
        }

        self
    }

    /// Iterate over visible fields in encoding order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&str, &Value)> + '_> {
        match &self.repr {
            Repr::Plain(map) => Box::new(map.iter().map(|(k, v)| (k.as_str(), v))),
            Repr::Merging(merging) => merging.iter(),
        }
    }

    /// Iterate over visible field names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.iter().map(|(field, _)| field)
    }

    /// Number of visible fields.
    #[must_use]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Plain(map) => map.len(),
            Repr::Merging(_) => self.iter().count(),
        }
    }

    /// Check if no fields are visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MergingObject {
    fn get(&self, field: &str) -> Option<&Value> {
        match &self.patch {
            Patch::Unmodified => self.inner.get(field),
            Patch::Patched(delta) => match delta.outer.get(field) {
                Some(value) => Some(value),
                None if delta.removed.contains(field) => None,
                None => self.inner.get(field),
            },
        }
    }

    fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        let (in_outer, tombstoned) = match &self.patch {
            Patch::Unmodified => (false, false),
            Patch::Patched(delta) => (
                delta.outer.contains_key(field),
                delta.removed.contains(field),
            ),
        };

        if !in_outer {
            if tombstoned {
                return None;
            }
            let child = self.inner.get(field)?.overlay();
            self.delta().outer.insert(field.to_string(), child);
        }

        self.delta().outer.get_mut(field)
    }

    fn remove(&mut self, field: &str) -> Option<Value> {
        let tombstoned = matches!(&self.patch, Patch::Patched(d) if d.removed.contains(field));
        let inner_value = if tombstoned {
            None
        } else {
            self.inner.get(field).cloned()
        };
        let outer_value = match &mut self.patch {
            Patch::Patched(delta) => delta.outer.shift_remove(field),
            Patch::Unmodified => None,
        };

        if inner_value.is_some() {
            self.delta().removed.insert(field.to_string());
        }

        outer_value.or(inner_value)
    }

    fn remove_all(&mut self) {
        let names: Vec<String> = self.inner.field_names().map(str::to_string).collect();
        let delta = self.delta();

        delta.outer.clear();
        delta.removed.extend(names);
    }

    fn iter(&self) -> Box<dyn Iterator<Item = (&str, &Value)> + '_> {
        match &self.patch {
            Patch::Unmodified => self.inner.iter(),
            Patch::Patched(delta) => Box::new(
                delta
                    .outer
                    .iter()
                    .map(|(k, v)| (k.as_str(), v))
                    .chain(self.inner.iter().filter(move |(field, _)| {
                        !delta.removed.contains(*field) && !delta.outer.contains_key(*field)
                    })),
            ),
        }
    }

    /// Materialize the patch on first mutation.
    fn delta(&mut self) -> &mut Delta {
        if matches!(self.patch, Patch::Unmodified) {
            self.patch = Patch::Patched(Delta::default());
        }

        match &mut self.patch {
            Patch::Patched(delta) => delta,
            Patch::Unmodified => unreachable!("patch materialized above"),
        }
    }
}

impl Default for ObjectValue {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ObjectValue {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(field, value)| other.get(field) == Some(value))
    }
}

impl Serialize for ObjectValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.repr {
            Repr::Plain(map) => map.serialize(serializer),
            Repr::Merging(merging) => match &merging.patch {
                // zero-copy fast path
                Patch::Unmodified => merging.inner.serialize(serializer),
                Patch::Patched(_) => {
                    let mut map = serializer.serialize_map(None)?;
                    for (field, value) in merging.iter() {
                        map.serialize_entry(field, value)?;
                    }
                    map.end()
                }
            },
        }
    }
}

impl From<Map> for ObjectValue {
    fn from(map: Map) -> Self {
        Self::from_map(map)
    }
}

impl FromIterator<(String, Value)> for ObjectValue {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> ObjectValue {
        match Value::from(json!({
            "channel": "/chat/room",
            "id": "7",
            "data": {"text": "hello", "tags": ["a", "b"]}
        })) {
            Value::Object(o) => o,
            _ => unreachable!(),
        }
    }

    fn encode(object: &ObjectValue) -> String {
        serde_json::to_string(object).unwrap()
    }

    #[test]
    fn test_unmodified_overlay_encodes_like_base() {
        let inner = base();
        let overlay = inner.overlay();

        assert!(overlay.is_overlay());
        assert!(!overlay.is_patched());
        assert_eq!(encode(&overlay), encode(&inner));
        assert_eq!(overlay, inner);
    }

    #[test]
    fn test_put_shadows_inner() {
        let inner = base();
        let mut overlay = inner.overlay();

        overlay.put("id", "8");

        assert_eq!(overlay.get("id"), Some(&Value::from("8")));
        assert_eq!(inner.get("id"), Some(&Value::from("7")));
        assert_eq!(overlay.len(), 3);
    }

    #[test]
    fn test_remove_tombstones_and_put_restores() {
        let inner = base();
        let mut overlay = inner.overlay();

        assert_eq!(overlay.remove("id"), Some(Value::from("7")));
        assert!(overlay.get("id").is_none());
        assert!(!overlay.field_names().any(|f| f == "id"));
        assert!(overlay.remove("id").is_none());

        overlay.put("id", "9");
        assert_eq!(overlay.get("id"), Some(&Value::from("9")));
        assert!(overlay.field_names().any(|f| f == "id"));
        assert_eq!(inner.get("id"), Some(&Value::from("7")));
    }

    #[test]
    fn test_remove_prefers_outer_value() {
        let mut overlay = base().overlay();
        overlay.put("id", "outer");

        assert_eq!(overlay.remove("id"), Some(Value::from("outer")));
        assert!(overlay.get("id").is_none());
    }

    #[test]
    fn test_remove_missing_field_keeps_fast_path() {
        let mut overlay = base().overlay();

        assert!(overlay.remove("missing").is_none());
        assert!(!overlay.is_patched());
    }

    #[test]
    fn test_remove_all_then_put() {
        let inner = base();
        let mut overlay = inner.overlay();
        overlay.put("extra", 1);

        overlay.remove_all();
        assert!(overlay.is_empty());
        assert_eq!(overlay.field_names().count(), 0);
        assert_eq!(encode(&overlay), "{}");

        overlay.put("channel", "/other");
        assert_eq!(overlay.field_names().collect::<Vec<_>>(), vec!["channel"]);
        assert_eq!(inner.len(), 3);
    }

    #[test]
    fn test_patched_encoding_merges_outer_first() {
        let mut overlay = base().overlay();
        overlay.put("clientId", "abc");
        overlay.remove("data");

        assert_eq!(
            encode(&overlay),
            r#"{"clientId":"abc","channel":"/chat/room","id":"7"}"#
        );
    }

    #[test]
    fn test_nested_mutation_does_not_touch_base() {
        let inner = base();
        let before = encode(&inner);
        let mut overlay = inner.overlay();

        let data = overlay
            .get_mut("data")
            .and_then(Value::as_object_mut)
            .unwrap();
        assert!(data.is_overlay());
        data.put("text", "changed");
        data.get_mut("tags")
            .and_then(Value::as_array_mut)
            .unwrap()
            .push("c");

        assert_eq!(encode(&inner), before);
        let data = overlay.get("data").and_then(Value::as_object).unwrap();
        assert_eq!(data.get("text"), Some(&Value::from("changed")));
        assert_eq!(data.get("tags").and_then(Value::as_array).unwrap().len(), 3);
    }

    #[test]
    fn test_get_mut_on_tombstone_is_none() {
        let mut overlay = base().overlay();
        overlay.remove("data");
        assert!(overlay.get_mut("data").is_none());
    }

    #[test]
    fn test_overlay_of_overlay() {
        let inner = base();
        let mut first = inner.overlay();
        first.put("id", "first");
        let mut second = first.overlay();
        second.remove("channel");

        assert_eq!(second.get("id"), Some(&Value::from("first")));
        assert!(first.get("channel").is_some());
        assert!(second.get("channel").is_none());
    }

    #[test]
    fn test_plain_object_clone_is_isolated() {
        let original = base();
        let mut copy = original.clone();
        copy.put("id", "changed");
        assert_eq!(original.get("id"), Some(&Value::from("7")));
    }
}
