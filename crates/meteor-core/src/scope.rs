//! Per-frame channel resolution scope.
//!
//! A frame often repeats the same channel path many times. The scope parses
//! each distinct path once and shares the result for the rest of the frame.
//! It is dropped when the frame is done, whatever the outcome.

use meteor_protocol::{ChannelId, ProtocolError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Channel cache living for the duration of one inbound frame.
#[derive(Debug, Default)]
pub struct FrameScope {
    channels: HashMap<String, Arc<ChannelId>>,
}

impl FrameScope {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a channel path, parsing it only on first use.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidChannel`] for malformed paths.
    pub fn resolve(&mut self, path: &str) -> Result<Arc<ChannelId>, ProtocolError> {
        if let Some(channel) = self.channels.get(path) {
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(ChannelId::parse(path)?);
        self.channels.insert(path.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Number of distinct channels resolved so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Drop for FrameScope {
    fn drop(&mut self) {
        trace!(channels = self.channels.len(), "Released frame scope");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_caches() {
        let mut scope = FrameScope::new();

        let first = scope.resolve("/chat/room").unwrap();
        let second = scope.resolve("/chat/room").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        scope.resolve("/meta/connect").unwrap();
        assert_eq!(scope.len(), 2);
    }

    #[test]
    fn test_resolve_invalid_not_cached() {
        let mut scope = FrameScope::new();
        assert!(scope.resolve("bad").is_err());
        assert!(scope.is_empty());
    }
}
