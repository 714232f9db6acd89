//! WebSocket to message-bus RPC gateway.
//!
//! This service:
//! - Accepts WebSocket connections from browser clients
//! - Decodes each frame into a request and publishes it on the bus
//! - Correlates streamed replies back to the originating session
//! - Enforces per-request deadlines and abandons requests of closed sessions
//!
//! ## Architecture
//!
//! ```text
//! WebSocket client
//!         ↓ frame
//! Session (decode, namespace correlation id, push client hop)
//!         ↓
//! Engine ── publish ──► Bus (round-robin over endpoints) ──► microservice
//!    ▲                                                          │
//!    └──── demux by correlation id ◄── reply topic ◄────────────┘
//!         ↓
//! Session (strip namespace, pop hop, encode) → WebSocket client
//! ```

pub mod codec;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod health;
pub mod protocol;
pub mod session;
pub mod tls;
pub mod ws_server;

pub use codec::{FrameCodec, HexProtobufCodec, LegacyJsonCodec, WireFormat};
pub use config::{GatewayConfig, ServerDescriptor, TimeoutPolicyKind};
pub use engine::{
    DeliveryContext, DeliveryOutcome, Engine, EngineConfig, ErrorReplyOnTimeout, ResponseSink,
    RouteHandle, SilentTimeout, TimeoutPolicy,
};
pub use error::{GatewayError, Result};
pub use health::{HealthCheck, HealthOutcome};
pub use protocol::{Message, Method, Resource, Route, RoutingStack};
pub use session::{FrameSink, Session, SessionInfo, SessionRegistry, SessionServices};
pub use ws_server::{create_router, AppState};
