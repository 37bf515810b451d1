#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// WebSocket transport error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The handshake did not complete within the configured connect timeout
    ConnectTimeout(Duration),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// No inbound traffic was seen within the heartbeat timeout
    HeartbeatTimeout(Duration),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::ConnectTimeout(after) => {
                write!(f, "WebSocket handshake did not complete within {after:?}")
            }
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::HeartbeatTimeout(after) => {
                write!(f, "no traffic from server within {after:?}")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl WsError {
    /// Wrap as a connect failure.
    pub(crate) fn into_connect(self) -> crate::error::Error {
        crate::error::Error::with_source(crate::error::Kind::Connect, self)
    }

    /// Wrap as a send failure.
    pub(crate) fn into_send(self) -> crate::error::Error {
        crate::error::Error::with_source(crate::error::Kind::Send, self)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        WsError::Connection(e).into_connect()
    }
}
