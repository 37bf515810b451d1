//! Core traits for the generic session infrastructure.

use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;

use super::pending::CorrelationKey;

/// How an inbound frame identifies the request it answers.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correlation {
    /// The frame echoed the full correlation key. A sequence that was never issued falls back to
    /// [`Correlation::Product`] matching.
    Exact(CorrelationKey),
    /// The frame only names the product; the oldest pending request for it is the match
    Product(String),
    /// The frame only echoed the request sequence
    Sequence(u64),
}

/// Result of decoding one inbound frame.
#[non_exhaustive]
#[derive(Debug)]
pub enum Decoded<P> {
    /// A successful response for a pending request
    Response {
        correlation: Correlation,
        payload: P,
    },
    /// A frame that is recognizably an answer (or an out-of-band error) but could not be decoded
    ProtocolError {
        correlation: Option<Correlation>,
        message: String,
    },
    /// Anything else; logged and dropped
    Unrecognized,
}

/// Message codec trait for converting between requests and raw frames.
///
/// Decoding must never fail: malformed input maps to [`Decoded::Unrecognized`], which the session
/// discards without affecting pending requests.
///
/// # Example
///
/// ```ignore
/// pub struct EchoCodec;
///
/// impl MessageCodec for EchoCodec {
///     type Payload = String;
///
///     fn encode(&self, key: &CorrelationKey) -> crate::Result<Vec<u8>> {
///         Ok(key.to_string().into_bytes())
///     }
///
///     fn decode(&self, frame: &[u8]) -> Decoded<String> {
///         Decoded::Unrecognized
///     }
/// }
/// ```
pub trait MessageCodec: Send + Sync + 'static {
    /// Payload delivered to the caller on success
    type Payload: Send + 'static;

    /// Encode the request identified by `key`, embedding the key so the server can echo it.
    fn encode(&self, key: &CorrelationKey) -> crate::Result<Vec<u8>>;

    /// Decode one inbound frame.
    fn decode(&self, frame: &[u8]) -> Decoded<Self::Payload>;
}

/// Builds the handshake request for each connect attempt.
///
/// Called again for every reconnect, so per-connection values (tokens, nonces) are fresh.
pub trait Handshake: Send + Sync + 'static {
    fn request(&self) -> crate::Result<Request>;
}

impl Handshake for String {
    fn request(&self) -> crate::Result<Request> {
        Ok(self.as_str().into_client_request()?)
    }
}
