//! # meteor-transport
//!
//! Carrier abstraction for the Meteor Bayeux engine.
//!
//! A carrier is the server-side endpoint of one client connection:
//!
//! - **WebSocket** - push carrier over an axum WebSocket
//! - **Local** - in-process carrier for clients in the same process
//!
//! ## Carrier Abstraction
//!
//! All carriers implement the [`Carrier`] trait, so processors and the
//! server never depend on a concrete transport.
//!
//! ```rust,ignore
//! use meteor_transport::{Carrier, WebSocketCarrier};
//!
//! let (carrier, mut deliveries) = WebSocketCarrier::open(sink, router, extensions, factory, config, context);
//! while let Some(text) = next_frame().await {
//!     if carrier.on_text(&text).await?.closed {
//!         break;
//!     }
//! }
//! carrier.on_close().await;
//! ```

pub mod local;
pub mod state;
pub mod traits;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use local::{LocalCarrier, LocalConfig, LocalTransport, LOCAL_TRANSPORT};
pub use state::ConnectionState;
pub use traits::{
    resolve_idle_timeout, Carrier, TransportError, DEFAULT_MAX_SESSION_IDLE_TIMEOUT_MS,
};
pub use websocket::{
    FrameOutcome, FrameSink, WebSocketCarrier, WebSocketConfig, WEBSOCKET_TRANSPORT,
};
