//! Clock synchronisation extension.
//!
//! Clients put `ext.timesync = {tc, l, o}` (client time, latency estimate,
//! offset estimate) on handshake and connect requests. The reply to the
//! same request id gets `ext.timesync = {tc, ts, p, a}` back, where `ts` is
//! the server receive time, `p` the server processing time and `a` the
//! client's apparent offset. Request ids may be strings or numbers.

use dashmap::DashMap;
use meteor_core::{Extension, MessageContext, Server, Session};
use meteor_protocol::channel::meta;
use meteor_protocol::{fields, Message, ObjectValue, Value};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Extension field name.
pub const TIMESYNC: &str = "timesync";

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn is_timed(message: &Message) -> bool {
    matches!(message.channel(), Some(meta::HANDSHAKE | meta::CONNECT))
}

/// A request id usable for matching: a string or a number.
fn request_id(message: &Message) -> Option<&Value> {
    message
        .get(fields::ID)
        .filter(|id| matches!(id, Value::String(_) | Value::Number(_)))
}

#[derive(Debug, Clone)]
struct Sample {
    id: Value,
    /// Server receive time.
    ts: i64,
    tc: i64,
    l: i64,
    o: i64,
}

/// Records client timing on requests and answers it on the matching reply.
#[derive(Debug, Default)]
pub struct TimesyncExtension {
    samples: DashMap<String, Sample>,
}

impl TimesyncExtension {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples awaiting their reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.samples.len()
    }

    fn sample(message: &Message) -> Option<Sample> {
        let id = request_id(message)?;
        let timesync = message.ext()?.get(TIMESYNC)?.as_object()?;
        let field = |name: &str| timesync.get(name).and_then(Value::as_i64);

        Some(Sample {
            id: id.clone(),
            ts: now_millis(),
            tc: field("tc")?,
            l: field("l")?,
            o: field("o")?,
        })
    }
}

impl Extension for TimesyncExtension {
    fn name(&self) -> &str {
        TIMESYNC
    }

    fn incoming(
        &self,
        _server: &dyn Server,
        session: &Arc<Session>,
        context: &mut MessageContext,
    ) -> bool {
        if !is_timed(&context.message) {
            return true;
        }
        let Some(sample) = Self::sample(&context.message) else {
            return true;
        };

        // Keep the newest client timestamp.
        let mut entry = self
            .samples
            .entry(session.id().to_string())
            .or_insert_with(|| sample.clone());
        if entry.tc <= sample.tc {
            *entry = sample;
        }
        true
    }

    fn outgoing(&self, session: &Session, message: &mut Message) -> bool {
        if !is_timed(message) {
            return true;
        }
        let Some(id) = request_id(message) else {
            return true;
        };
        let Some((_, sample)) = self
            .samples
            .remove_if(session.id(), |_, sample| &sample.id == id)
        else {
            return true;
        };

        let mut timesync = ObjectValue::new();
        timesync
            .put("tc", sample.tc)
            .put("ts", sample.ts)
            .put("p", now_millis() - sample.ts)
            .put("a", sample.tc + sample.o + sample.l - sample.ts);
        message.ext_mut().put(TIMESYNC, timesync);

        trace!(session = %session.id(), "Timesync answered");
        true
    }

    fn session_removed(&self, session: &Session) {
        if self.samples.remove(session.id()).is_some() {
            trace!(session = %session.id(), "Dropped unanswered timesync sample");
        }
    }
}
