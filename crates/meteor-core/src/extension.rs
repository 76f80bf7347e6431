//! Message extensions.
//!
//! Extensions see every inbound message before it is routed and every
//! outbound message before it is encoded. Either direction may veto a
//! message.

use meteor_protocol::Message;
use std::sync::Arc;
use tracing::debug;

use crate::context::MessageContext;
use crate::server::Server;
use crate::session::Session;

/// Filter consulted by carriers for every message.
pub trait ExtensionNotifier: Send + Sync {
    /// Inspect or rewrite an inbound message. Returning `false` denies it.
    fn incoming(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        context: &mut MessageContext,
    ) -> bool;

    /// Inspect or rewrite an outbound message. Returning `false` drops it.
    ///
    /// The message is the recipient's own copy.
    fn outgoing(&self, _session: &Session, _message: &mut Message) -> bool {
        true
    }

    /// Called once when a carrier deregisters its session.
    fn session_removed(&self, _session: &Session) {}
}

/// One link in an [`Extensions`] chain.
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn incoming(
        &self,
        _server: &dyn Server,
        _session: &Arc<Session>,
        _context: &mut MessageContext,
    ) -> bool {
        true
    }

    fn outgoing(&self, _session: &Session, _message: &mut Message) -> bool {
        true
    }

    /// Drop any per-session state.
    fn session_removed(&self, _session: &Session) {}
}

/// Ordered chain of extensions. The first denial wins.
#[derive(Default, Clone)]
pub struct Extensions {
    chain: Vec<Arc<dyn Extension>>,
}

impl Extensions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extension to the chain.
    #[must_use]
    pub fn with(mut self, extension: Arc<dyn Extension>) -> Self {
        self.chain.push(extension);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

impl ExtensionNotifier for Extensions {
    fn incoming(
        &self,
        server: &dyn Server,
        session: &Arc<Session>,
        context: &mut MessageContext,
    ) -> bool {
        for extension in &self.chain {
            if !extension.incoming(server, session, context) {
                debug!(
                    extension = extension.name(),
                    session = %session.id(),
                    channel = %context.channel_id,
                    "Incoming message denied"
                );
                return false;
            }
        }
        true
    }

    fn outgoing(&self, session: &Session, message: &mut Message) -> bool {
        for extension in &self.chain {
            if !extension.outgoing(session, message) {
                debug!(
                    extension = extension.name(),
                    session = %session.id(),
                    "Outgoing message dropped"
                );
                return false;
            }
        }
        true
    }

    fn session_removed(&self, session: &Session) {
        for extension in &self.chain {
            extension.session_removed(session);
        }
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.chain.iter().map(|e| e.name()))
            .finish()
    }
}

/// Notifier that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl ExtensionNotifier for AcceptAll {
    fn incoming(
        &self,
        _server: &dyn Server,
        _session: &Arc<Session>,
        _context: &mut MessageContext,
    ) -> bool {
        true
    }
}
