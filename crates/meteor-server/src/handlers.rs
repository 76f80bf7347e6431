//! Connection handlers for the Meteor server.
//!
//! This module wires the HTTP surface to the carriers: every WebSocket
//! upgrade gets its own [`WebSocketCarrier`] driven by a connection loop, and
//! a housekeeping task expires idle in-process carriers.

use crate::config::{self, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::processors::BayeuxProcessors;
use crate::registry::Registry;
use crate::timesync::TimesyncExtension;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use meteor_core::{ExtensionNotifier, Extensions, Router as BayeuxRouter};
use meteor_protocol::ValueFactory;
use meteor_transport::{Carrier, LocalTransport, TransportError, WebSocketCarrier, WebSocketConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    pub registry: Arc<Registry>,
    /// The Bayeux protocol router.
    pub router: BayeuxRouter,
    pub extensions: Arc<dyn ExtensionNotifier>,
    pub factory: ValueFactory,
    pub websocket: WebSocketConfig,
    /// In-process clients.
    pub local: Arc<LocalTransport>,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new());
        let router = BayeuxRouter::new(
            registry.clone(),
            Arc::new(BayeuxProcessors::new(config.processors())),
        );
        let extensions: Arc<dyn ExtensionNotifier> =
            Arc::new(Extensions::new().with(Arc::new(TimesyncExtension::new())));
        let factory = ValueFactory::json();
        let local = Arc::new(LocalTransport::new(
            config.local(),
            router.clone(),
            Arc::clone(&extensions),
            factory.clone(),
        ));

        Self {
            websocket: config.websocket(),
            config,
            registry,
            router,
            extensions,
            factory,
            local,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let websocket_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    tokio::spawn(expire_local_carriers(Arc::clone(&state.local)));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Meteor server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Periodically close in-process carriers that went silent.
async fn expire_local_carriers(local: Arc<LocalTransport>) {
    let mut ticker = tokio::time::interval(local.config().idle_check_cycle);

    loop {
        ticker.tick().await;
        let expired = local.expire_idle().await;
        if expired > 0 {
            debug!(expired, remaining = local.len(), "Expired idle local carriers");
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let stats = state.registry.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "bayeux": state.config.bayeux.version.to_string(),
        "registry": stats,
        "local_carriers": state.local.len(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let context = config::request_context(remote, user_agent);

    ws.on_upgrade(move |socket| handle_websocket(socket, state, context))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    context: meteor_core::RequestContext,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sink, mut stream) = socket.split();
    let (carrier, mut deliveries) = WebSocketCarrier::open(
        sink,
        state.router.clone(),
        Arc::clone(&state.extensions),
        state.factory.clone(),
        state.websocket.clone(),
        context,
    );
    let session_id = carrier.session().id().to_string();
    let idle = tokio::time::sleep_until(carrier.idle_deadline());
    tokio::pin!(idle);

    loop {
        tokio::select! {
            // Idle timeout, pushed forward by every inbound frame
            () = &mut idle => {
                match carrier.close_if_idle().await {
                    Ok(true) => {
                        info!(session = %session_id, "WebSocket idle timeout");
                        metrics::record_error("idle_timeout");
                        break;
                    }
                    Ok(false) => idle.as_mut().reset(carrier.idle_deadline()),
                    Err(e) => {
                        debug!(session = %session_id, error = %e, "Failed to close idle connection");
                        break;
                    }
                }
            }

            // Broadcasts queued on the session
            Some(packet) = deliveries.recv() => {
                let mut batch = vec![packet];
                while let Ok(more) = deliveries.try_recv() {
                    batch.push(more);
                }

                match carrier.deliver(&batch).await {
                    Ok(outcome) => metrics::record_outbound(&outcome),
                    Err(TransportError::Timeout) => {
                        warn!(session = %session_id, "Delivery timed out");
                        metrics::record_error("send_timeout");
                    }
                    Err(e) => {
                        debug!(session = %session_id, error = %e, "Delivery failed");
                        break;
                    }
                }
            }

            // Receive from WebSocket
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        let handled = carrier.on_text(&text).await;
                        idle.as_mut().reset(carrier.idle_deadline());
                        match handled {
                            Ok(outcome) => {
                                metrics::record_frame(&outcome, start.elapsed().as_secs_f64());
                                if outcome.closed {
                                    break;
                                }
                            }
                            Err(TransportError::Timeout) => {
                                warn!(session = %session_id, "Response timed out");
                                metrics::record_error("send_timeout");
                            }
                            Err(e) => {
                                warn!(session = %session_id, error = %e, "Frame handling error");
                                metrics::record_error("websocket");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(session = %session_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    carrier.on_close().await;
    debug!(session = %session_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use meteor_protocol::{Message as BayeuxMessage, Value};
    use meteor_transport::LocalCarrier;
    use serde_json::json;

    fn message(value: serde_json::Value) -> BayeuxMessage {
        match Value::from(value) {
            Value::Object(object) => BayeuxMessage::from_object(object),
            _ => unreachable!(),
        }
    }

    async fn request(carrier: &LocalCarrier, value: serde_json::Value) -> BayeuxMessage {
        let packets = carrier.inject(message(value)).await.unwrap();
        packets[0].messages[0].clone()
    }

    async fn connect(carrier: &LocalCarrier) {
        let reply = request(
            carrier,
            json!({"id": "1", "channel": "/meta/handshake", "supportedConnectionTypes": ["local"]}),
        )
        .await;
        assert!(reply.is_successful());

        let client_id = carrier_id(carrier);
        let reply = request(
            carrier,
            json!({"id": "2", "channel": "/meta/connect", "clientId": client_id, "connectionType": "local"}),
        )
        .await;
        assert!(reply.is_successful());
    }

    fn carrier_id(carrier: &LocalCarrier) -> String {
        carrier.session().id().to_string()
    }

    #[tokio::test]
    async fn test_local_clients_exchange_messages() {
        let state = AppState::new(Config::default());
        let (alice, _alice_inbox) = state.local.connect();
        let (bob, mut bob_inbox) = state.local.connect();
        connect(&alice).await;
        connect(&bob).await;

        let reply = request(
            &bob,
            json!({"channel": "/meta/subscribe", "clientId": carrier_id(&bob), "subscription": "/chat/*"}),
        )
        .await;
        assert!(reply.is_successful());

        let packets = alice
            .inject(message(json!({
                "id": "7",
                "channel": "/chat/lobby",
                "clientId": carrier_id(&alice),
                "data": {"text": "hello"}
            })))
            .await
            .unwrap();
        assert_eq!(packets[0].len(), 1);
        assert!(packets[0].messages[0].is_successful());

        let text = bob_inbox.recv().await.unwrap();
        assert!(text.contains(r#""channel":"/chat/lobby""#));
        assert!(text.contains(r#""text":"hello""#));

        let stats = state.registry.stats();
        assert_eq!(stats.session_count, 2);
        assert_eq!(stats.channel_count, 1);
    }

    #[tokio::test]
    async fn test_local_disconnect_deregisters() {
        let state = AppState::new(Config::default());
        let (carrier, _inbox) = state.local.connect();
        connect(&carrier).await;
        assert_eq!(state.registry.stats().session_count, 1);

        let reply = request(
            &carrier,
            json!({"id": "3", "channel": "/meta/disconnect", "clientId": carrier_id(&carrier)}),
        )
        .await;

        assert!(reply.is_successful());
        assert!(!carrier.is_connected().await);
        assert_eq!(state.registry.stats().session_count, 0);
        assert!(state.local.is_empty());
    }

    #[tokio::test]
    async fn test_timesync_on_local_handshake() {
        let state = AppState::new(Config::default());
        let (carrier, _inbox) = state.local.connect();

        let reply = request(
            &carrier,
            json!({
                "id": "1",
                "channel": "/meta/handshake",
                "supportedConnectionTypes": ["local"],
                "ext": {"timesync": {"tc": 10, "l": 1, "o": 2}}
            }),
        )
        .await;

        let timesync = reply
            .ext()
            .and_then(|ext| ext.get("timesync"))
            .and_then(Value::as_object)
            .unwrap();
        assert_eq!(timesync.get("tc").and_then(Value::as_i64), Some(10));
    }

    #[tokio::test]
    async fn test_health_reports_registry() {
        let state = Arc::new(AppState::new(Config::default()));
        let (_carrier, _inbox) = state.local.connect();

        let Json(body) = health_handler(State(Arc::clone(&state))).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["registry"]["session_count"], 1);
        assert_eq!(body["local_carriers"], 1);
    }
}
