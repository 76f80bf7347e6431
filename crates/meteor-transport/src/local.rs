//! In-process transport.
//!
//! A [`LocalTransport`] hands out [`LocalCarrier`]s to clients living in the
//! same process. Requests are injected one message at a time and answered
//! directly; deliveries are encoded and pushed into the client's inbox.
//! Carriers that stay silent longer than `max_interval` are expired by the
//! housekeeping sweep.

use async_trait::async_trait;
use dashmap::DashMap;
use meteor_core::router::errors;
use meteor_core::{
    error_packet, ExtensionNotifier, MessageContext, RequestContext, Router, Session,
    DEFAULT_MESSAGE_QUEUE_SIZE,
};
use meteor_protocol::{Message, Packet, ValueFactory};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::state::ConnectionState;
use crate::traits::{encode_outbound, resolve_idle_timeout, Carrier, TransportError};

/// Transport name advertised for local carriers.
pub const LOCAL_TRANSPORT: &str = "local";

/// Local transport configuration.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Idle time after which a silent carrier expires.
    pub max_interval: Duration,
    /// Period of the idle-expiry sweep.
    pub idle_check_cycle: Duration,
    /// Period at which a carrier's delivery pump re-checks its connection.
    pub connect_check_cycle: Duration,
    /// Capacity of each session's delivery queue and client inbox.
    pub max_message_queue_size: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_interval: Duration::from_millis(10_000),
            idle_check_cycle: Duration::from_millis(1_000),
            connect_check_cycle: Duration::from_millis(1_000),
            max_message_queue_size: DEFAULT_MESSAGE_QUEUE_SIZE,
        }
    }
}

type CarrierTable = DashMap<String, Arc<LocalCarrier>>;

/// Creates and tracks local carriers.
pub struct LocalTransport {
    config: LocalConfig,
    router: Router,
    extensions: Arc<dyn ExtensionNotifier>,
    factory: ValueFactory,
    carriers: Arc<CarrierTable>,
}

impl LocalTransport {
    #[must_use]
    pub fn new(
        config: LocalConfig,
        router: Router,
        extensions: Arc<dyn ExtensionNotifier>,
        factory: ValueFactory,
    ) -> Self {
        Self {
            config,
            router,
            extensions,
            factory,
            carriers: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    /// Number of live carriers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.carriers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.carriers.is_empty()
    }

    /// Open a carrier for an in-process client.
    ///
    /// Returns the carrier and the client's inbox of encoded deliveries.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> (Arc<LocalCarrier>, mpsc::Receiver<String>) {
        let queue_size = self.config.max_message_queue_size.max(1);
        let (session, deliveries) = Session::with_queue_size(LOCAL_TRANSPORT, true, queue_size);
        let (inbox, outbox) = mpsc::channel(queue_size);
        self.router.server().add_session(Arc::clone(&session));

        let max_interval_ms =
            i64::try_from(self.config.max_interval.as_millis()).unwrap_or(i64::MAX);
        let carrier = Arc::new(LocalCarrier {
            session,
            context: Arc::new(RequestContext::local()),
            router: self.router.clone(),
            extensions: Arc::clone(&self.extensions),
            factory: self.factory.clone(),
            transports: vec![LOCAL_TRANSPORT.to_string()],
            max_interval_ms,
            idle_timeout_ms: AtomicI64::new(resolve_idle_timeout(-1, max_interval_ms)),
            last_contact: StdMutex::new(Instant::now()),
            table: Arc::downgrade(&self.carriers),
            inner: Mutex::new(LocalInner {
                inbox,
                state: ConnectionState::connected(),
                closed: false,
            }),
        });

        self.carriers
            .insert(carrier.session.id().to_string(), Arc::clone(&carrier));
        tokio::spawn(pump(
            Arc::downgrade(&carrier),
            deliveries,
            self.config.connect_check_cycle,
        ));
        info!(session = %carrier.session.id(), "Local carrier opened");

        (carrier, outbox)
    }

    /// Close and forget every carrier idle for longer than its timeout.
    ///
    /// Returns the number of carriers expired.
    pub async fn expire_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<LocalCarrier>> = self
            .carriers
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for carrier in &expired {
            self.carriers.remove(carrier.session.id());
            debug!(session = %carrier.session.id(), "Expiring idle local carrier");
            if let Err(e) = carrier.close().await {
                warn!(session = %carrier.session.id(), error = %e, "Failed to close local carrier");
            }
        }

        expired.len()
    }
}

/// Forward deliveries queued on the session into the client's inbox.
async fn pump(
    carrier: Weak<LocalCarrier>,
    mut deliveries: mpsc::Receiver<Packet>,
    check_cycle: Duration,
) {
    let mut ticker = tokio::time::interval(check_cycle);

    loop {
        tokio::select! {
            packet = deliveries.recv() => {
                let (Some(packet), Some(carrier)) = (packet, carrier.upgrade()) else {
                    break;
                };
                match carrier.send(&[packet]).await {
                    Ok(()) => {}
                    Err(TransportError::QueueFull) => {
                        warn!(session = %carrier.session.id(), "Local inbox full, dropping delivery");
                    }
                    Err(e) => {
                        debug!(session = %carrier.session.id(), error = %e, "Dropping local delivery");
                    }
                }
            }
            _ = ticker.tick() => {
                let Some(carrier) = carrier.upgrade() else {
                    break;
                };
                if !carrier.is_connected().await {
                    break;
                }
            }
        }
    }

    trace!("Local delivery pump stopped");
}

struct LocalInner {
    inbox: mpsc::Sender<String>,
    state: ConnectionState,
    closed: bool,
}

/// Carrier for one in-process client.
pub struct LocalCarrier {
    session: Arc<Session>,
    context: Arc<RequestContext>,
    router: Router,
    extensions: Arc<dyn ExtensionNotifier>,
    factory: ValueFactory,
    transports: Vec<String>,
    max_interval_ms: i64,
    idle_timeout_ms: AtomicI64,
    last_contact: StdMutex<Instant>,
    table: Weak<CarrierTable>,
    inner: Mutex<LocalInner>,
}

impl LocalCarrier {
    /// Process one request and return the response packets.
    ///
    /// A processed `/meta/disconnect` closes the carrier before its reply is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the carrier is disconnected, the message has no
    /// channel, or the request could not be processed.
    pub async fn inject(&self, message: Message) -> Result<Vec<Packet>, TransportError> {
        self.touch();
        let mut inner = self.inner.lock().await;
        if !inner.state.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let path = message
            .channel()
            .ok_or_else(|| TransportError::Other("message has no channel".to_string()))?;
        let channel_id = match meteor_protocol::ChannelId::parse(path) {
            Ok(channel_id) => Arc::new(channel_id),
            Err(e) => {
                debug!(session = %self.session.id(), error = %e, "Rejecting local message");
                return Ok(vec![error_packet(
                    path,
                    errors::INVALID_CHANNEL,
                    &message,
                    Some(self.session.as_ref()),
                )]);
            }
        };

        let server = self.router.server();
        let mut context =
            MessageContext::new(LOCAL_TRANSPORT, Arc::clone(&self.context), channel_id, message);
        if !self
            .extensions
            .incoming(server.as_ref(), &self.session, &mut context)
        {
            return Ok(vec![error_packet(
                context.channel_id.path(),
                errors::PROCESSING_DENIED,
                &context.message,
                Some(self.session.as_ref()),
            )]);
        }

        let routed = self
            .router
            .respond(&self.session, &self.transports, context)?;
        let disconnected = routed.deferred.is_some();
        if let Some(deferred) = routed.deferred {
            inner.state.disconnect();
            deferred.apply(server.as_ref(), &self.session);
        }

        let mut packets = routed.packets;
        for packet in &mut packets {
            packet
                .messages
                .retain_mut(|m| self.extensions.outgoing(&self.session, m));
        }

        drop(inner);
        if disconnected {
            self.close().await?;
        }
        Ok(packets)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_contact.lock() {
            *last = Instant::now();
        }
    }

    /// Check if the carrier has been idle longer than its timeout at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        let timeout = Duration::from_millis(
            u64::try_from(self.max_session_idle_timeout()).unwrap_or_default(),
        );
        self.last_contact
            .lock()
            .map_or(false, |last| now.saturating_duration_since(*last) > timeout)
    }
}

#[async_trait]
impl Carrier for LocalCarrier {
    fn carrier_type(&self) -> &'static str {
        LOCAL_TRANSPORT
    }

    fn actual_transports(&self) -> &[String] {
        &self.transports
    }

    fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn set_max_session_idle_timeout(&self, timeout_ms: i64) {
        let resolved = resolve_idle_timeout(timeout_ms, self.max_interval_ms);
        self.idle_timeout_ms.store(resolved, Ordering::Relaxed);
    }

    fn max_session_idle_timeout(&self) -> i64 {
        self.idle_timeout_ms.load(Ordering::Relaxed)
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().await.state.is_connected()
    }

    async fn set_disconnected(&self) -> bool {
        self.inner.lock().await.state.disconnect()
    }

    async fn send(&self, packets: &[Packet]) -> Result<(), TransportError> {
        let inner = self.inner.lock().await;
        if !inner.state.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let Some((text, _)) = encode_outbound(
            packets,
            &self.session,
            self.extensions.as_ref(),
            self.factory.codec().as_ref(),
        )?
        else {
            return Ok(());
        };

        inner.inbox.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }

    /// Close the carrier, deregistering its session and forgetting the
    /// carrier. Closing twice is a no-op.
    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        let server = self.router.server();
        server.remove_session(&self.session);
        self.extensions.session_removed(&self.session);
        if let Some(table) = self.table.upgrade() {
            table.remove(self.session.id());
        }

        if inner.state.disconnect() {
            self.session.mark_disconnected();
            server.on_session_disconnected(&self.session, None, true);
            info!(session = %self.session.id(), "Local carrier closed abruptly");
        } else {
            debug!(session = %self.session.id(), "Local carrier closed");
        }
        Ok(())
    }
}
