//! Core WebSocket infrastructure.
//!
//! This module provides generic request/response multiplexing over a single persistent
//! connection, specialized for a concrete service through the [`MessageCodec`] and [`Handshake`]
//! traits.
//!
//! # Architecture
//!
//! - [`Connection`]: One WebSocket connection with its own receive loop
//! - [`PendingTable`]: Outstanding requests by correlation key, each completed exactly once
//! - [`SessionManager`]: Actor owning the connection, with heartbeat, timeouts and reconnection
//! - [`MessageCodec`]: Trait for encoding requests and decoding incoming frames
//!
//! # Example
//!
//! ```ignore
//! let session = SessionManager::new(endpoint, Config::default(), MyCodec);
//! let payload = session.fetch("B08N5WRWNW", Duration::from_secs(5)).await?;
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pending;
pub mod session;
pub mod traits;

pub use connection::Connection;
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use pending::{CorrelationKey, PendingTable, Registration};
pub use session::{CloseCause, SessionManager, SessionState};
pub use traits::*;
