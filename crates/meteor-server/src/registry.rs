//! Session and subscription registry.
//!
//! [`Registry`] is the server collaborator behind every carrier. It tracks
//! live sessions, the channel patterns each session subscribed to, and fans
//! broadcast packets out to matching subscribers.

use dashmap::DashMap;
use meteor_core::{MessageContext, Server, Session};
use meteor_protocol::{ChannelId, Packet};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::metrics;

/// Sessions subscribed to one channel pattern.
struct Subscription {
    channel: Arc<ChannelId>,
    sessions: HashSet<String>,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    pub session_count: usize,
    /// Distinct subscribed patterns.
    pub channel_count: usize,
    pub subscription_count: usize,
}

/// Concurrent session registry and broadcast hub.
#[derive(Default)]
pub struct Registry {
    sessions: DashMap<String, Arc<Session>>,
    /// Pattern path -> subscribers.
    subscriptions: DashMap<String, Subscription>,
    /// Session id -> subscribed pattern paths.
    channels: DashMap<String, HashSet<String>>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            session_count: self.sessions.len(),
            channel_count: self.subscriptions.len(),
            subscription_count: self.channels.iter().map(|c| c.value().len()).sum(),
        }
    }

    /// Ids of the sessions subscribed to a pattern matching `channel`.
    fn subscribers(&self, channel: &ChannelId) -> HashSet<String> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.value().channel.matches(channel))
            .flat_map(|entry| entry.value().sessions.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Drop every subscription held by `session_id`.
    fn unsubscribe_all(&self, session_id: &str) {
        let Some((_, patterns)) = self.channels.remove(session_id) else {
            return;
        };

        for pattern in &patterns {
            if let Some(mut subscription) = self.subscriptions.get_mut(pattern) {
                subscription.sessions.remove(session_id);
            }
            self.subscriptions
                .remove_if(pattern, |_, subscription| subscription.sessions.is_empty());
        }
        metrics::set_active_channels(self.subscriptions.len());
    }
}

impl Server for Registry {
    fn add_session(&self, session: Arc<Session>) {
        trace!(session = %session.id(), transport = %session.transport(), "Session registered");
        self.sessions.insert(session.id().to_string(), session);
        metrics::set_active_sessions(self.sessions.len());
    }

    fn remove_session(&self, session: &Session) {
        self.sessions.remove(session.id());
        self.unsubscribe_all(session.id());
        metrics::set_active_sessions(self.sessions.len());
        trace!(session = %session.id(), "Session deregistered");
    }

    fn on_session_connected(&self, session: &Arc<Session>, context: &MessageContext) {
        info!(
            session = %session.id(),
            transport = %context.transport,
            remote = ?context.context.remote_addr,
            "Session connected"
        );
    }

    fn on_session_disconnected(
        &self,
        session: &Arc<Session>,
        _context: Option<&MessageContext>,
        abrupt: bool,
    ) {
        self.unsubscribe_all(session.id());
        info!(session = %session.id(), abrupt, "Session disconnected");
    }

    fn on_channel_subscribed(
        &self,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        _context: &MessageContext,
    ) {
        self.subscriptions
            .entry(channel.path().to_string())
            .or_insert_with(|| Subscription {
                channel: Arc::clone(channel),
                sessions: HashSet::new(),
            })
            .sessions
            .insert(session.id().to_string());
        self.channels
            .entry(session.id().to_string())
            .or_default()
            .insert(channel.path().to_string());

        metrics::record_subscription();
        metrics::set_active_channels(self.subscriptions.len());
        debug!(session = %session.id(), channel = %channel, "Subscribed");
    }

    fn on_channel_unsubscribed(
        &self,
        session: &Arc<Session>,
        channel: &Arc<ChannelId>,
        _context: &MessageContext,
    ) {
        if let Some(mut patterns) = self.channels.get_mut(session.id()) {
            patterns.remove(channel.path());
        }
        self.channels
            .remove_if(session.id(), |_, patterns| patterns.is_empty());

        if let Some(mut subscription) = self.subscriptions.get_mut(channel.path()) {
            subscription.sessions.remove(session.id());
        }
        self.subscriptions
            .remove_if(channel.path(), |_, subscription| subscription.sessions.is_empty());

        metrics::set_active_channels(self.subscriptions.len());
        debug!(session = %session.id(), channel = %channel, "Unsubscribed");
    }

    fn is_subscribed(&self, session: &Session, channel: &ChannelId) -> bool {
        let Some(patterns) = self.channels.get(session.id()) else {
            return false;
        };
        patterns.iter().any(|pattern| {
            self.subscriptions
                .get(pattern)
                .map_or(false, |subscription| subscription.channel.matches(channel))
        })
    }

    /// Freeze `packet` once and queue a copy for every matching subscriber
    /// other than the sender.
    fn publish(&self, sender: Option<&Session>, packet: Packet) -> usize {
        let Some(route) = packet.route.clone() else {
            debug!("Dropping broadcast without route");
            return 0;
        };

        let mut recipients = self.subscribers(&route);
        if let Some(sender) = sender {
            recipients.remove(sender.id());
        }
        if recipients.is_empty() {
            return 0;
        }

        let frozen = packet.freeze();
        let delivered = recipients
            .iter()
            .filter_map(|id| self.session(id))
            .filter(|session| session.deliver(frozen.clone()))
            .count();

        metrics::record_deliveries(delivered);
        trace!(channel = %route, recipients = delivered, "Broadcast queued");
        delivered
    }
}
