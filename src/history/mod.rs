#![expect(
    clippy::module_name_repetitions,
    reason = "Re-exported names intentionally match their modules for API clarity"
)]

//! Product price history from the Keepa push service.
//!
//! Every request is a product lookup by ASIN, sent over one shared WebSocket connection and
//! answered with the full history of every price series Keepa tracks for that product.
//!
//! # Example
//!
//! ```rust, no_run
//! use std::time::Duration;
//!
//! use keepa_client_sdk::history::{Client, PriceType};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = Client::default();
//!
//!     let (first, second) = tokio::join!(
//!         client.fetch("B08N5WRWNW", Duration::from_secs(5)),
//!         client.fetch("B07XJ8C8F5", Duration::from_secs(5)),
//!     );
//!
//!     for history in [first?, second?] {
//!         println!("{}: {} new offers", history.asin, history.get(PriceType::New).len());
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod types;

// Re-export commonly used types
pub use client::{Client, KeepaHandshake, Options, generate_token};
pub use codec::KeepaCodec;
pub use types::request::{Domain, ProductRequest, ProductRequestTemplate};
pub use types::response::{PriceType, PricePoint, ProductHistory, keepa_minutes_to_datetime};
