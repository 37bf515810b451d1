//! Re-exported types from external crates for convenience.
//!
//! These types are commonly used in this SDK and are re-exported here
//! so users don't need to add these dependencies to their `Cargo.toml`.

/// Date and time types for the sample timestamps in product histories.
pub use chrono::{DateTime, Utc};
/// Raw bytes of a WebSocket frame.
pub use tokio_tungstenite::tungstenite::Bytes;
