//! # meteor-core
//!
//! Sessions, collaborator traits and the Bayeux protocol router.
//!
//! This crate sits between the transports and the application:
//!
//! - **Session** - per-client protocol state and delivery queue
//! - **Server** - session registry and broadcast collaborator
//! - **Extensions** - inbound/outbound message filters
//! - **RequestProcessors** - decision logic for each meta operation
//! - **Router** - classifies channels and dispatches to processors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Carrier   │────▶│   Router    │────▶│ Processors  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                   │
//!        ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐
//! │ Extensions  │     │   Server    │
//! └─────────────┘     └─────────────┘
//! ```

pub mod context;
pub mod extension;
pub mod processor;
pub mod router;
pub mod scope;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

pub use context::{MessageContext, RequestContext};
pub use extension::{AcceptAll, Extension, ExtensionNotifier, Extensions};
pub use processor::{
    decode_request, ConnectRequest, DisconnectRequest, HandshakeRequest, ProcessingError,
    Processed, PublishRequest, RequestProcessors, SubscribeRequest, UnsubscribeRequest,
};
pub use router::{as_text, classify, error_packet, ChannelRoute, DeferredDisconnect, Routed, Router};
pub use scope::FrameScope;
pub use server::Server;
pub use session::{
    generate_session_id, Session, SessionEvent, SessionState, DEFAULT_MESSAGE_QUEUE_SIZE,
};
