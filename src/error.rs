use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Establishing the connection or completing the handshake failed
    Connect,
    /// Writing a frame to the connection failed
    Send,
    /// No matching response arrived before the caller's deadline
    Timeout,
    /// The connection dropped while the request was pending
    ConnectionLost,
    /// The client was explicitly closed
    ClientClosed,
    /// The session is not ready and the client is configured not to wait
    NotConnected,
    /// A correlated response could not be decoded
    Protocol,
    /// A correlation key was registered twice
    DuplicateKey,
    /// Error related to invalid caller input
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn timeout<S: Into<String>>(product_id: S, after: Duration) -> Self {
        Timeout {
            product_id: product_id.into(),
            after,
        }
        .into()
    }

    pub fn connection_lost<S: Into<String>>(reason: S) -> Self {
        ConnectionLost {
            reason: reason.into(),
        }
        .into()
    }

    pub fn connect_failed<S: Into<String>>(reason: S) -> Self {
        ConnectFailed {
            reason: reason.into(),
        }
        .into()
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Protocol {
            message: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn client_closed() -> Self {
        ClientClosed.into()
    }

    #[must_use]
    pub fn not_connected() -> Self {
        NotConnected.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// The caller's deadline elapsed before a matching response arrived.
///
/// The request is not cancelled at the remote service; only the local wait is abandoned.
#[non_exhaustive]
#[derive(Debug)]
pub struct Timeout {
    pub product_id: String,
    pub after: Duration,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no response for {} within {:?}",
            self.product_id, self.after
        )
    }
}

impl StdError for Timeout {}

#[non_exhaustive]
#[derive(Debug)]
pub struct ConnectionLost {
    pub reason: String,
}

impl fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection lost: {}", self.reason)
    }
}

impl StdError for ConnectionLost {}

#[non_exhaustive]
#[derive(Debug)]
pub struct ConnectFailed {
    pub reason: String,
}

impl fmt::Display for ConnectFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to connect: {}", self.reason)
    }
}

impl StdError for ConnectFailed {}

#[non_exhaustive]
#[derive(Debug)]
pub struct ClientClosed;

impl fmt::Display for ClientClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client has been closed")
    }
}

impl StdError for ClientClosed {}

#[non_exhaustive]
#[derive(Debug)]
pub struct NotConnected;

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not connected to the push server")
    }
}

impl StdError for NotConnected {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Protocol {
    pub message: String,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid response: {}", self.message)
    }
}

impl StdError for Protocol {}

#[non_exhaustive]
#[derive(Debug)]
pub struct DuplicateKey {
    pub key: String,
}

impl fmt::Display for DuplicateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request {} is already pending", self.key)
    }
}

impl StdError for DuplicateKey {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Timeout> for Error {
    fn from(err: Timeout) -> Self {
        Error::with_source(Kind::Timeout, err)
    }
}

impl From<ConnectionLost> for Error {
    fn from(err: ConnectionLost) -> Self {
        Error::with_source(Kind::ConnectionLost, err)
    }
}

impl From<ConnectFailed> for Error {
    fn from(err: ConnectFailed) -> Self {
        Error::with_source(Kind::Connect, err)
    }
}

impl From<ClientClosed> for Error {
    fn from(err: ClientClosed) -> Self {
        Error::with_source(Kind::ClientClosed, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::NotConnected, err)
    }
}

impl From<Protocol> for Error {
    fn from(err: Protocol) -> Self {
        Error::with_source(Kind::Protocol, err)
    }
}

impl From<DuplicateKey> for Error {
    fn from(err: DuplicateKey) -> Self {
        Error::with_source(Kind::DuplicateKey, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<InvalidHeaderValue> for Error {
    fn from(e: InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_display_should_succeed() {
        let error = Error::timeout("B07XJ8C8F5", Duration::from_millis(1));

        assert_eq!(error.kind(), Kind::Timeout);
        assert_eq!(
            error.to_string(),
            "Timeout: no response for B07XJ8C8F5 within 1ms"
        );
    }

    #[test]
    fn downcast_should_expose_source() {
        let error = Error::connection_lost("peer closed");

        let lost = error
            .downcast_ref::<ConnectionLost>()
            .expect("source should be ConnectionLost");
        assert_eq!(lost.reason, "peer closed");
        assert!(error.downcast_ref::<Timeout>().is_none());
    }

    #[test]
    fn client_closed_into_error_should_succeed() {
        let error: Error = ClientClosed.into();

        assert_eq!(error.kind(), Kind::ClientClosed);
        assert!(error.to_string().contains("closed"));
    }

    #[test]
    fn duplicate_key_into_error_should_succeed() {
        let error: Error = DuplicateKey {
            key: "B08N5WRWNW#3".to_owned(),
        }
        .into();

        assert_eq!(error.kind(), Kind::DuplicateKey);
        assert!(error.to_string().contains("B08N5WRWNW#3"));
    }
}
