//! WebSocket carrier.
//!
//! One [`WebSocketCarrier`] exists per WebSocket connection. Frame handling,
//! outbound sends and close are serialized by a per-carrier mutex, so a
//! disconnect acknowledgement is always written before the socket closes.

use async_trait::async_trait;
use meteor_core::router::errors;
use meteor_core::{
    error_packet, ExtensionNotifier, FrameScope, MessageContext, RequestContext, Router, Session,
    DEFAULT_MESSAGE_QUEUE_SIZE,
};
use meteor_protocol::{Message, Packet, Value, ValueFactory};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::state::ConnectionState;
use crate::traits::{encode_outbound, resolve_idle_timeout, Carrier, TransportError};

/// Transport name advertised for WebSocket carriers.
pub const WEBSOCKET_TRANSPORT: &str = "websocket";

/// Close codes used by the carrier.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// Write half of a WebSocket.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Send a close frame and shut the sink down.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

#[cfg(feature = "websocket")]
mod axum_sink {
    use super::{FrameSink, TransportError};
    use async_trait::async_trait;
    use axum::extract::ws::{CloseFrame, Message, WebSocket};
    use futures_util::stream::SplitSink;
    use futures_util::SinkExt;

    #[async_trait]
    impl FrameSink for SplitSink<WebSocket, Message> {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.send(Message::Text(text))
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
            let frame = CloseFrame {
                code,
                reason: reason.to_string().into(),
            };
            self.send(Message::Close(Some(frame)))
                .await
                .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))?;
            SinkExt::close(self)
                .await
                .map_err(|e| TransportError::Other(format!("Failed to close: {e}")))
        }
    }
}

/// WebSocket carrier configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Transport default idle timeout; negative means platform default.
    pub max_interval_ms: i64,
    /// Upper bound for a single write.
    pub async_send_timeout: Option<Duration>,
    /// Largest accepted inbound text frame in bytes.
    pub max_text_message_buffer_size: usize,
    /// Transports advertised during handshake.
    pub transports: Vec<String>,
    /// Capacity of each session's delivery queue.
    pub max_message_queue_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_interval_ms: -1,
            async_send_timeout: None,
            max_text_message_buffer_size: 64 * 1024,
            transports: vec![WEBSOCKET_TRANSPORT.to_string()],
            max_message_queue_size: DEFAULT_MESSAGE_QUEUE_SIZE,
        }
    }
}

/// What happened while handling one inbound frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    /// Messages dispatched.
    pub messages_in: usize,
    /// Messages written back.
    pub messages_out: usize,
    /// Bytes written back.
    pub bytes_out: usize,
    /// The carrier closed the channel; the connection should end.
    pub closed: bool,
}

struct Inner<S> {
    sink: S,
    state: ConnectionState,
    closed: bool,
}

/// Carrier bound to one WebSocket connection.
pub struct WebSocketCarrier<S> {
    session: Arc<Session>,
    context: Arc<RequestContext>,
    router: Router,
    extensions: Arc<dyn ExtensionNotifier>,
    factory: ValueFactory,
    config: WebSocketConfig,
    idle_timeout_ms: AtomicI64,
    opened: Instant,
    /// Last inbound frame, in milliseconds after `opened`.
    last_inbound_ms: AtomicU64,
    inner: Mutex<Inner<S>>,
}

impl<S: FrameSink> WebSocketCarrier<S> {
    /// Open a carrier: create the session, register it with the server and
    /// mark the carrier connected.
    ///
    /// Returns the carrier and the session's delivery queue, which the
    /// connection loop must drain with [`Carrier::send`].
    pub fn open(
        sink: S,
        router: Router,
        extensions: Arc<dyn ExtensionNotifier>,
        factory: ValueFactory,
        config: WebSocketConfig,
        context: RequestContext,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (session, deliveries) =
            Session::with_queue_size(WEBSOCKET_TRANSPORT, false, config.max_message_queue_size);
        router.server().add_session(Arc::clone(&session));

        let idle_timeout_ms = resolve_idle_timeout(-1, config.max_interval_ms);
        info!(
            session = %session.id(),
            remote = ?context.remote_addr,
            idle_timeout_ms,
            "WebSocket carrier opened"
        );

        let carrier = Arc::new(Self {
            session,
            context: Arc::new(context),
            router,
            extensions,
            factory,
            config,
            idle_timeout_ms: AtomicI64::new(idle_timeout_ms),
            opened: Instant::now(),
            last_inbound_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                sink,
                state: ConnectionState::connected(),
                closed: false,
            }),
        });

        (carrier, deliveries)
    }

    /// When the connection expires if no further frame arrives.
    #[must_use]
    pub fn idle_deadline(&self) -> Instant {
        let timeout = u64::try_from(self.idle_timeout_ms.load(Ordering::Relaxed)).unwrap_or_default();
        self.opened
            + Duration::from_millis(self.last_inbound_ms.load(Ordering::Relaxed))
            + Duration::from_millis(timeout)
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.opened.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_inbound_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Close the channel with a normal closure if the idle deadline passed.
    ///
    /// Returns whether the carrier is closed. The owner still runs
    /// [`on_close`](Self::on_close) afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame could not be written.
    pub async fn close_if_idle(&self) -> Result<bool, TransportError> {
        if Instant::now() < self.idle_deadline() {
            return Ok(false);
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(true);
        }
        info!(
            session = %self.session.id(),
            idle_timeout_ms = self.idle_timeout_ms.load(Ordering::Relaxed),
            "Closing idle WebSocket carrier"
        );
        inner.closed = true;
        inner.sink.close(close_code::NORMAL, "Idle timeout").await?;
        Ok(true)
    }

    /// Handle one inbound text frame.
    ///
    /// Messages are processed in order. Dispatch stops once the carrier is
    /// disconnected, and a disconnected carrier closes the channel after all
    /// responses were written.
    ///
    /// # Errors
    ///
    /// Returns an error if writing a response failed.
    pub async fn on_text(&self, text: &str) -> Result<FrameOutcome, TransportError> {
        self.touch();
        let mut inner = self.inner.lock().await;
        let mut outcome = FrameOutcome::default();

        if inner.closed || !inner.state.is_connected() {
            outcome.closed = true;
            return Ok(outcome);
        }

        if text.len() > self.config.max_text_message_buffer_size {
            warn!(
                session = %self.session.id(),
                size = text.len(),
                max = self.config.max_text_message_buffer_size,
                "Frame too large"
            );
            inner.closed = true;
            inner
                .sink
                .close(close_code::MESSAGE_TOO_BIG, "Message too big")
                .await?;
            outcome.closed = true;
            return Ok(outcome);
        }

        let batch = match self.factory.decode_batch(text.as_bytes()) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(session = %self.session.id(), error = %e, "Failed to decode frame");
                return Ok(outcome);
            }
        };

        let result = self.dispatch(&mut inner, batch, &mut outcome).await;

        if !inner.state.is_connected() && !inner.closed {
            debug!(session = %self.session.id(), "Closing disconnected carrier");
            inner.closed = true;
            inner.sink.close(close_code::NORMAL, "").await?;
            outcome.closed = true;
        }

        result.map(|()| outcome)
    }

    async fn dispatch(
        &self,
        inner: &mut Inner<S>,
        batch: Vec<Value>,
        outcome: &mut FrameOutcome,
    ) -> Result<(), TransportError> {
        let mut scope = FrameScope::new();
        let server = self.router.server();

        for value in batch {
            if !inner.state.is_connected() {
                break;
            }
            let Value::Object(object) = value else {
                trace!(session = %self.session.id(), "Skipping non-object batch entry");
                continue;
            };
            let message = Message::from_object(object);
            let Some(path) = message.channel() else {
                trace!(session = %self.session.id(), "Skipping message without channel");
                continue;
            };
            outcome.messages_in += 1;

            let channel_id = match scope.resolve(path) {
                Ok(channel_id) => channel_id,
                Err(e) => {
                    debug!(session = %self.session.id(), error = %e, "Rejecting message");
                    let reply = error_packet(
                        path,
                        errors::INVALID_CHANNEL,
                        &message,
                        Some(self.session.as_ref()),
                    );
                    self.write(inner, &[reply], outcome).await?;
                    continue;
                }
            };

            let mut context = MessageContext::new(
                WEBSOCKET_TRANSPORT,
                Arc::clone(&self.context),
                channel_id,
                message,
            );
            if !self
                .extensions
                .incoming(server.as_ref(), &self.session, &mut context)
            {
                let reply = error_packet(
                    context.channel_id.path(),
                    errors::PROCESSING_DENIED,
                    &context.message,
                    Some(self.session.as_ref()),
                );
                self.write(inner, &[reply], outcome).await?;
                continue;
            }

            let channel = Arc::clone(&context.channel_id);
            match self
                .router
                .respond(&self.session, &self.config.transports, context)
            {
                Ok(routed) => {
                    let written = self.write(inner, &routed.packets, outcome).await;
                    if let Some(deferred) = routed.deferred {
                        inner.state.disconnect();
                        deferred.apply(server.as_ref(), &self.session);
                    }
                    written?;
                }
                Err(e) => {
                    warn!(
                        session = %self.session.id(),
                        channel = %channel,
                        error = %e,
                        "Failed to process message"
                    );
                }
            }
        }

        Ok(())
    }

    async fn write(
        &self,
        inner: &mut Inner<S>,
        packets: &[Packet],
        outcome: &mut FrameOutcome,
    ) -> Result<(), TransportError> {
        let Some((text, count)) = encode_outbound(
            packets,
            &self.session,
            self.extensions.as_ref(),
            self.factory.codec().as_ref(),
        )?
        else {
            return Ok(());
        };
        let bytes = text.len();

        match self.config.async_send_timeout {
            Some(limit) => tokio::time::timeout(limit, inner.sink.send_text(text))
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => inner.sink.send_text(text).await?,
        }

        outcome.messages_out += count;
        outcome.bytes_out += bytes;
        Ok(())
    }

    /// Tear down after the connection ended.
    ///
    /// Deregisters the session and, if no `/meta/disconnect` was processed,
    /// reports an abrupt disconnect.
    pub async fn on_close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;

        let server = self.router.server();
        server.remove_session(&self.session);
        self.extensions.session_removed(&self.session);

        if inner.state.disconnect() {
            self.session.mark_disconnected();
            server.on_session_disconnected(&self.session, None, true);
            info!(session = %self.session.id(), "WebSocket carrier closed abruptly");
        } else {
            debug!(session = %self.session.id(), "WebSocket carrier closed");
        }
    }

    /// Write deliveries, returning the number of messages and bytes sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the carrier is disconnected or the write failed.
    pub async fn deliver(&self, packets: &[Packet]) -> Result<FrameOutcome, TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.closed || !inner.state.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }

        let mut outcome = FrameOutcome::default();
        self.write(&mut inner, packets, &mut outcome).await?;
        Ok(outcome)
    }
}

#[async_trait]
impl<S: FrameSink + 'static> Carrier for WebSocketCarrier<S> {
    fn carrier_type(&self) -> &'static str {
        WEBSOCKET_TRANSPORT
    }

    fn actual_transports(&self) -> &[String] {
        &self.config.transports
    }

    fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }

    fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn set_max_session_idle_timeout(&self, timeout_ms: i64) {
        let resolved = resolve_idle_timeout(timeout_ms, self.config.max_interval_ms);
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
        self.deliver(packets).await.map(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.sink.close(close_code::NORMAL, "").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{recording_router, test_router, DenyChannel, RecordingSink, SinkLog};
    use meteor_core::{AcceptAll, Extensions};

    fn open(sink: RecordingSink) -> (Arc<WebSocketCarrier<RecordingSink>>, mpsc::Receiver<Packet>) {
        WebSocketCarrier::open(
            sink,
            test_router(),
            Arc::new(AcceptAll),
            ValueFactory::json(),
            WebSocketConfig::default(),
            RequestContext::default(),
        )
    }

    #[tokio::test]
    async fn test_disconnect_ack_before_close() {
        let log = SinkLog::default();
        let (carrier, _rx) = open(RecordingSink::new(log.clone()));

        let outcome = carrier
            .on_text(r#"[{"id":"1","channel":"/meta/disconnect"},{"channel":"/chat","data":1}]"#)
            .await
            .unwrap();

        assert!(outcome.closed);
        assert_eq!(outcome.messages_in, 1);
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("text:"));
        assert!(entries[0].contains("/meta/disconnect"));
        assert_eq!(entries[1], "close:1000");
        assert!(!carrier.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_carrier_closes() {
        let log = SinkLog::default();
        let (router, server) = recording_router();
        let (carrier, _rx) = WebSocketCarrier::open(
            RecordingSink::new(log.clone()),
            router,
            Arc::new(AcceptAll),
            ValueFactory::json(),
            WebSocketConfig {
                max_interval_ms: 100,
                ..WebSocketConfig::default()
            },
            RequestContext::default(),
        );
        assert!(!carrier.close_if_idle().await.unwrap());

        tokio::time::advance(Duration::from_millis(60)).await;
        carrier.on_text(r#"[{"channel":"/service/ping"}]"#).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!carrier.close_if_idle().await.unwrap());

        tokio::time::sleep_until(carrier.idle_deadline()).await;
        assert!(carrier.close_if_idle().await.unwrap());
        assert_eq!(log.entries(), vec!["close:1000".to_string()]);

        carrier.on_close().await;
        assert_eq!(
            server.events(),
            vec!["added", "removed", "disconnected abrupt=true"]
        );
    }

    #[tokio::test]
    async fn test_denied_message_gets_error_reply() {
        let log = SinkLog::default();
        let extensions = Extensions::new().with(Arc::new(DenyChannel("/chat/private")));
        let (carrier, _rx) = WebSocketCarrier::open(
            RecordingSink::new(log.clone()),
            test_router(),
            Arc::new(extensions),
            ValueFactory::json(),
            WebSocketConfig::default(),
            RequestContext::default(),
        );

        let outcome = carrier
            .on_text(r#"[{"id":"7","channel":"/chat/private","data":1},{"id":"8","channel":"/chat/public","data":2}]"#)
            .await
            .unwrap();

        assert!(!outcome.closed);
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("Processing was denied"));
        assert!(entries[0].contains(r#""id":"7""#));
        assert!(entries[0].contains(r#""successful":false"#));
        assert!(entries[1].contains(r#""id":"8""#));
        assert!(entries[1].contains(r#""successful":true"#));
    }

    #[tokio::test]
    async fn test_bad_entries_do_not_stop_the_batch() {
        let log = SinkLog::default();
        let (carrier, _rx) = open(RecordingSink::new(log.clone()));

        let outcome = carrier
            .on_text(
                r#"[42,{"data":"no channel"},{"id":"1","channel":"/meta/subscribe","subscription":["/a","/b"]},{"id":"2","channel":"/meta/handshake"}]"#,
            )
            .await
            .unwrap();

        assert!(!outcome.closed);
        assert_eq!(outcome.messages_in, 2);
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("/meta/handshake"));
        assert!(entries[0].contains(r#""id":"2""#));
    }

    #[tokio::test]
    async fn test_user_agent_from_context() {
        let context = RequestContext {
            user_agent: Some("meteor-test/1.0".to_string()),
            ..RequestContext::default()
        };
        let (carrier, _rx) = WebSocketCarrier::open(
            RecordingSink::new(SinkLog::default()),
            test_router(),
            Arc::new(AcceptAll),
            ValueFactory::json(),
            WebSocketConfig::default(),
            context,
        );

        assert_eq!(carrier.user_agent(), Some("meteor-test/1.0"));
        assert_eq!(carrier.carrier_type(), WEBSOCKET_TRANSPORT);
    }

    #[tokio::test]
    async fn test_unknown_meta_keeps_connection() {
        let log = SinkLog::default();
        let (carrier, _rx) = open(RecordingSink::new(log.clone()));

        let outcome = carrier
            .on_text(r#"{"id":"2","channel":"/meta/bogus"}"#)
            .await
            .unwrap();

        assert!(!outcome.closed);
        assert!(carrier.is_connected().await);
        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("Unknown meta channel"));
    }

    #[tokio::test]
    async fn test_service_channel_writes_nothing() {
        let log = SinkLog::default();
        let (carrier, _rx) = open(RecordingSink::new(log.clone()));

        carrier
            .on_text(r#"[{"channel":"/service/echo"}]"#)
            .await
            .unwrap();
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_frame_too_large_closes() {
        let log = SinkLog::default();
        let (carrier, _rx) = WebSocketCarrier::open(
            RecordingSink::new(log.clone()),
            test_router(),
            Arc::new(AcceptAll),
            ValueFactory::json(),
            WebSocketConfig {
                max_text_message_buffer_size: 16,
                ..WebSocketConfig::default()
            },
            RequestContext::default(),
        );

        let outcome = carrier
            .on_text(r#"[{"channel":"/meta/connect"}]"#)
            .await
            .unwrap();

        assert!(outcome.closed);
        assert_eq!(log.entries(), vec!["close:1009".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_ignored() {
        let log = SinkLog::default();
        let (carrier, _rx) = open(RecordingSink::new(log.clone()));

        let outcome = carrier.on_text("[{").await.unwrap();
        assert!(!outcome.closed);
        assert!(carrier.is_connected().await);
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_channel_gets_error_reply() {
        let log = SinkLog::default();
        let (carrier, _rx) = open(RecordingSink::new(log.clone()));

        carrier
            .on_text(r#"[{"channel":"/a//b"}]"#)
            .await
            .unwrap();
        assert!(log.entries()[0].contains("Invalid channel"));
    }

    #[tokio::test]
    async fn test_abrupt_close_notifies_server() {
        let log = SinkLog::default();
        let (router, server) = recording_router();
        let (carrier, _rx) = WebSocketCarrier::open(
            RecordingSink::new(log),
            router,
            Arc::new(AcceptAll),
            ValueFactory::json(),
            WebSocketConfig::default(),
            RequestContext::default(),
        );

        carrier.on_close().await;
        assert_eq!(
            server.events(),
            vec!["added", "removed", "disconnected abrupt=true"]
        );
        assert!(carrier.send(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_send_timeout_keeps_carrier_open() {
        let log = SinkLog::default();
        let (carrier, _rx) = WebSocketCarrier::open(
            RecordingSink::stalled(log),
            test_router(),
            Arc::new(AcceptAll),
            ValueFactory::json(),
            WebSocketConfig {
                async_send_timeout: Some(Duration::from_millis(10)),
                ..WebSocketConfig::default()
            },
            RequestContext::default(),
        );

        let packet = Packet::single(
            meteor_protocol::PacketType::Delivery,
            Message::for_channel("/chat"),
        );
        let result = carrier.send(&[packet]).await;

        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(carrier.is_connected().await);
    }

    #[tokio::test]
    async fn test_idle_timeout_override() {
        let (carrier, _rx) = open(RecordingSink::new(SinkLog::default()));

        assert_eq!(carrier.max_session_idle_timeout(), 300_000);
        carrier.set_max_session_idle_timeout(5_000);
        assert_eq!(carrier.max_session_idle_timeout(), 5_000);
        carrier.set_max_session_idle_timeout(-1);
        assert_eq!(carrier.max_session_idle_timeout(), 300_000);
    }
}
