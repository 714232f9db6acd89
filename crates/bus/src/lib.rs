//! Bus access layer over one or more NATS endpoints.
//!
//! This crate provides:
//! - [`BusEndpoint`]: one broker connection that can publish and consume
//! - [`NatsDialer`] / [`NatsEndpoint`]: the `async-nats` backed endpoint
//! - [`DialerRegistry`]: per-address connection cache, dialed at most once
//! - [`MultiBus`]: round-robin publish and fan-in subscribe across endpoints
//!
//! ## Architecture
//!
//! ```text
//! publish(topic) ──► MultiBus ──► endpoint[offset % n]     (fan-out)
//!
//! endpoint[0] ─┐
//! endpoint[1] ─┼──► handler(topic)                          (fan-in)
//! endpoint[2] ─┘
//! ```

pub mod endpoint;
pub mod error;
pub mod memory;
pub mod multi;
pub mod nats;
pub mod registry;

pub use endpoint::{BusEndpoint, Dialer, MessageHandler};
pub use error::{BusError, Result};
pub use memory::{MemoryDialer, MemoryEndpoint};
pub use multi::{Bus, MultiBus};
pub use nats::{NatsDialer, NatsEndpoint};
pub use registry::DialerRegistry;
