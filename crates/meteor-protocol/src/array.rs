//! Array values and the copy-on-write array overlay.
//!
//! Array overlays copy coarsely: the first mutation materializes a full
//! element-wise copy of the base, after which every operation acts on the
//! copy alone.

use serde::ser::{Serialize, Serializer};
use std::sync::Arc;

use crate::value::Value;

/// A JSON array, possibly an overlay over a shared base.
#[derive(Debug, Clone)]
pub struct ArrayValue {
    repr: Repr,
}

#[derive(Debug, Clone)]
enum Repr {
    Plain(Arc<Vec<Value>>),
    CopyOnWrite(Box<CopyOnWriteArray>),
}

#[derive(Debug, Clone)]
struct CopyOnWriteArray {
    inner: ArrayValue,
    patch: Patch,
}

#[derive(Debug, Clone)]
enum Patch {
    Unmodified,
    Copied(Vec<Value>),
}

impl ArrayValue {
    /// Create an empty array.
    #[must_use]
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    #[must_use]
    pub fn from_vec(items: Vec<Value>) -> Self {
        Self {
            repr: Repr::Plain(Arc::new(items)),
        }
    }

    /// Wrap this array in a copy-on-write overlay sharing its storage.
    #[must_use]
    pub fn overlay(&self) -> Self {
        if let Repr::CopyOnWrite(cow) = &self.repr {
            if matches!(cow.patch, Patch::Unmodified) {
                return self.clone();
            }
        }

        Self {
            repr: Repr::CopyOnWrite(Box::new(CopyOnWriteArray {
                inner: self.clone(),
                patch: Patch::Unmodified,
            })),
        }
    }

    #[must_use]
    pub fn is_overlay(&self) -> bool {
        matches!(self.repr, Repr::CopyOnWrite(_))
    }

    /// Check if this overlay has materialized its copy.
    #[must_use]
    pub fn is_copied(&self) -> bool {
        matches!(&self.repr, Repr::CopyOnWrite(c) if matches!(c.patch, Patch::Copied(_)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match &self.repr {
            Repr::Plain(items) => items.len(),
            Repr::CopyOnWrite(cow) => match &cow.patch {
                Patch::Unmodified => cow.inner.len(),
                Patch::Copied(items) => items.len(),
            },
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        match &self.repr {
            Repr::Plain(items) => items.get(index),
            Repr::CopyOnWrite(cow) => match &cow.patch {
                Patch::Unmodified => cow.inner.get(index),
                Patch::Copied(items) => items.get(index),
            },
        }
    }

    /// Get mutable access to an element.
    ///
    /// Before the overlay has copied, this materializes the copy and replaces
    /// the element with an overlay of itself, so nested mutation never
    /// reaches the base.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Value> {
        match &mut self.repr {
            Repr::Plain(items) => Arc::make_mut(items).get_mut(index),
            Repr::CopyOnWrite(cow) => {
                if index >= cow.inner_len_or_copied() {
                    return None;
                }
                let fresh = matches!(cow.patch, Patch::Unmodified);
                let items = cow.copied();
                if fresh {
                    items[index] = items[index].overlay();
                }
                items.get_mut(index)
            }
        }
    }

    /// Append an element.
    pub fn push(&mut self, value: impl Into<Value>) {
        self.items_mut().push(value.into());
    }

    /// Replace the element at `index`, returning the previous value.
    ///
    /// Returns `None` and leaves the array untouched when `index` is out of
    /// bounds.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> Option<Value> {
        if index >= self.len() {
            return None;
        }
        let slot = self.items_mut().get_mut(index)?;
        Some(std::mem::replace(slot, value.into()))
    }

    /// Insert an element at `index`, shifting later elements.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&mut self, index: usize, value: impl Into<Value>) {
        self.items_mut().insert(index, value.into());
    }

    /// Remove the element at `index`.
    pub fn remove(&mut self, index: usize) -> Option<Value> {
        if index >= self.len() {
            return None;
        }
        Some(self.items_mut().remove(index))
    }

    /// Append every element of an iterator.
    pub fn extend<I, T>(&mut self, values: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.items_mut().extend(values.into_iter().map(Into::into));
    }

    /// Remove every element.
    pub fn remove_all(&mut self) {
        match &mut self.repr {
            Repr::Plain(items) => *items = Arc::new(Vec::new()),
            Repr::CopyOnWrite(cow) => cow.patch = Patch::Copied(Vec::new()),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.as_slice().iter()
    }

    fn as_slice(&self) -> &[Value] {
        match &self.repr {
            Repr::Plain(items) => items,
            Repr::CopyOnWrite(cow) => match &cow.patch {
                Patch::Unmodified => cow.inner.as_slice(),
                Patch::Copied(items) => items,
            },
        }
    }

    fn items_mut(&mut self) -> &mut Vec<Value> {
        match &mut self.repr {
            Repr::Plain(items) => Arc::make_mut(items),
            Repr::CopyOnWrite(cow) => cow.copied(),
        }
    }
}

impl CopyOnWriteArray {
    fn inner_len_or_copied(&self) -> usize {
        match &self.patch {
            Patch::Unmodified => self.inner.len(),
            Patch::Copied(items) => items.len(),
        }
    }

    /// Materialize the full copy on first mutation.
    fn copied(&mut self) -> &mut Vec<Value> {
        if matches!(self.patch, Patch::Unmodified) {
            self.patch = Patch::Copied(self.inner.iter().cloned().collect());
        }

        match &mut self.patch {
            Patch::Copied(items) => items,
            Patch::Unmodified => unreachable!("copy materialized above"),
        }
    }
}

impl Default for ArrayValue {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for ArrayValue {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Serialize for ArrayValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_slice().serialize(serializer)
    }
}

impl From<Vec<Value>> for ArrayValue {
    fn from(items: Vec<Value>) -> Self {
        Self::from_vec(items)
    }
}

impl FromIterator<Value> for ArrayValue {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self::from_vec(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ArrayValue {
    type Item = &'a Value;
    type IntoIter = std::slice::Iter<'a, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> ArrayValue {
        match Value::from(json!([1, "two", {"three": 3}])) {
            Value::Array(a) => a,
            _ => unreachable!(),
        }
    }

    fn encode(array: &ArrayValue) -> String {
        serde_json::to_string(array).unwrap()
    }

    #[test]
    fn test_unmodified_overlay_encodes_like_base() {
        let inner = base();
        let overlay = inner.overlay();

        assert!(overlay.is_overlay());
        assert!(!overlay.is_copied());
        assert_eq!(encode(&overlay), encode(&inner));
    }

    #[test]
    fn test_first_mutation_copies() {
        let inner = base();
        let mut overlay = inner.overlay();

        overlay.push(4);
        assert!(overlay.is_copied());
        assert_eq!(overlay.len(), 4);
        assert_eq!(inner.len(), 3);

        assert_eq!(overlay.set(0, "one"), Some(Value::from(1)));
        assert_eq!(overlay.remove(1), Some(Value::from("two")));
        overlay.insert(0, true);
        assert_eq!(encode(&overlay), r#"[true,"one",{"three":3},4]"#);
        assert_eq!(encode(&inner), r#"[1,"two",{"three":3}]"#);
    }

    #[test]
    fn test_out_of_bounds_leaves_overlay_unmodified() {
        let mut overlay = base().overlay();

        assert!(overlay.set(10, 1).is_none());
        assert!(overlay.remove(10).is_none());
        assert!(overlay.get_mut(10).is_none());
        assert!(!overlay.is_copied());
    }

    #[test]
    fn test_remove_all_materializes_empty() {
        let inner = base();
        let mut overlay = inner.overlay();

        overlay.remove_all();
        assert!(overlay.is_copied());
        assert!(overlay.is_empty());
        assert_eq!(encode(&overlay), "[]");

        overlay.extend(vec![1, 2]);
        assert_eq!(encode(&overlay), "[1,2]");
        assert_eq!(inner.len(), 3);
    }

    #[test]
    fn test_nested_element_mutation_isolated() {
        let inner = base();
        let mut overlay = inner.overlay();

        let element = overlay
            .get_mut(2)
            .and_then(Value::as_object_mut)
            .unwrap();
        assert!(element.is_overlay());
        element.put("three", "changed");

        assert_eq!(encode(&inner), r#"[1,"two",{"three":3}]"#);
        assert_eq!(encode(&overlay), r#"[1,"two",{"three":"changed"}]"#);
    }
}
