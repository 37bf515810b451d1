#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use super::config::Config;
use super::error::WsError;
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a requested close waits for the close frame to be flushed.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a single transport connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// Close requested, close frame being flushed
    Closing,
    /// Resources released
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Why the receive loop stopped.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Connection::close`] was called or the connection was dropped
    Requested,
    /// The server sent a close frame
    PeerClosed(Option<String>),
    /// Reading from the socket failed
    Error(String),
    /// The stream ended without a close frame
    StreamEnded,
}

impl CloseReason {
    #[must_use]
    pub const fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "close requested"),
            Self::PeerClosed(Some(reason)) if !reason.is_empty() => {
                write!(f, "server closed the connection: {reason}")
            }
            Self::PeerClosed(_) => write!(f, "server closed the connection"),
            Self::Error(e) => write!(f, "read failed: {e}"),
            Self::StreamEnded => write!(f, "stream ended"),
        }
    }
}

/// The single persistent WebSocket connection.
///
/// The write half lives here and is driven by whoever owns the connection. The read half runs on
/// its own task for the lifetime of the connection, handing every inbound frame to `on_frame` in
/// arrival order and calling `on_closed` exactly once when it stops.
///
/// Dropping the connection stops the receive loop, which releases the socket.
pub struct Connection {
    sink: SplitSink<WsStream, Message>,
    shutdown: CancellationToken,
    activity: watch::Receiver<Instant>,
    state: ConnectionState,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Perform the handshake and start the receive loop.
    ///
    /// The whole attempt, TCP/TLS setup and upgrade included, is bounded by
    /// [`Config::connect_timeout`].
    pub async fn open<F, C>(
        request: Request,
        config: &Config,
        on_frame: F,
        on_closed: C,
    ) -> Result<Self>
    where
        F: FnMut(Bytes) + Send + 'static,
        C: FnOnce(CloseReason) + Send + 'static,
    {
        #[cfg(feature = "tracing")]
        tracing::debug!(uri = %request.uri(), "opening WebSocket connection");

        let ws_stream = match timeout(config.connect_timeout, connect_async(request)).await {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => return Err(WsError::Connection(e).into_connect()),
            Err(_elapsed) => {
                return Err(WsError::ConnectTimeout(config.connect_timeout).into_connect());
            }
        };

        let (sink, stream) = ws_stream.split();
        let shutdown = CancellationToken::new();
        let (activity_tx, activity) = watch::channel(Instant::now());

        let reader = tokio::spawn(Self::receive_loop(
            stream,
            shutdown.clone(),
            activity_tx,
            on_frame,
            on_closed,
        ));

        Ok(Self {
            sink,
            shutdown,
            activity,
            state: ConnectionState::Connected {
                since: Instant::now(),
            },
            reader,
        })
    }

    async fn receive_loop<F, C>(
        mut stream: SplitStream<WsStream>,
        shutdown: CancellationToken,
        activity_tx: watch::Sender<Instant>,
        mut on_frame: F,
        on_closed: C,
    ) where
        F: FnMut(Bytes) + Send + 'static,
        C: FnOnce(CloseReason) + Send + 'static,
    {
        let reason = loop {
            tokio::select! {
                () = shutdown.cancelled() => break CloseReason::Requested,

                msg = stream.next() => {
                    activity_tx.send_replace(Instant::now());

                    match msg {
                        Some(Ok(Message::Binary(bytes))) => on_frame(bytes),
                        Some(Ok(Message::Text(text))) => {
                            on_frame(Bytes::copy_from_slice(text.as_bytes()));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break CloseReason::PeerClosed(
                                frame.map(|f| f.reason.as_str().to_owned()),
                            );
                        }
                        Some(Ok(_)) => {
                            // PING/PONG only count as activity.
                        }
                        Some(Err(e)) => break CloseReason::Error(e.to_string()),
                        None => break CloseReason::StreamEnded,
                    }
                }
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(%reason, "receive loop stopped");

        on_closed(reason);
    }

    /// Write one binary frame.
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed.into_send());
        }

        self.sink
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| WsError::Connection(e).into_send())
    }

    /// Send a PING frame.
    pub async fn ping(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed.into_send());
        }

        self.sink
            .send(Message::Ping(Bytes::new()))
            .await
            .map_err(|e| WsError::Connection(e).into_send())
    }

    /// When anything, data or control frame, was last read from the socket.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self.activity.borrow()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Connected and the receive loop is still running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.is_connected() && !self.reader.is_finished()
    }

    /// Close the connection.
    ///
    /// Idempotent. Stops the receive loop (firing `on_closed` if it has not fired yet) and makes a
    /// best-effort attempt to send a close frame.
    pub async fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }

        self.state = ConnectionState::Closing;
        self.shutdown.cancel();

        match timeout(CLOSE_FRAME_TIMEOUT, self.sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(error = %e, "close frame not delivered");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            Err(_elapsed) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("timed out flushing close frame");
            }
        }

        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::traits::Handshake as _;

    #[test]
    fn close_reason_display() {
        assert_eq!(
            CloseReason::PeerClosed(Some("going away".to_owned())).to_string(),
            "server closed the connection: going away"
        );
        assert_eq!(
            CloseReason::PeerClosed(Some(String::new())).to_string(),
            "server closed the connection"
        );
        assert!(CloseReason::Requested.is_requested());
        assert!(!CloseReason::StreamEnded.is_requested());
    }

    #[tokio::test]
    async fn open_fails_with_connect_error_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = format!("ws://{addr}").request().unwrap();
        let result = Connection::open(request, &Config::default(), |_| {}, |_| {}).await;

        let Err(error) = result else {
            panic!("connect to a closed port should fail");
        };
        assert_eq!(error.kind(), crate::error::Kind::Connect);
    }
}
