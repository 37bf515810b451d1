#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Deeply nested uses in sub-modules are falsely flagged as being unused"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use keepa_client_sdk::ws::config::{Config, ReconnectConfig};
use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec_zlib;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use tracing_subscriber::EnvFilter;

pub const ASIN: &str = "B08N5WRWNW";
pub const OTHER_ASIN: &str = "B07XJ8C8F5";
pub const THIRD_ASIN: &str = "B0BSHF7WHW";

#[derive(Debug, Clone)]
enum Action {
    Send(Vec<u8>),
    Disconnect,
}

/// Headers the client sent in one handshake.
#[derive(Debug, Clone)]
pub struct HandshakeHeaders {
    pub protocol: Option<String>,
    pub user_agent: Option<String>,
    pub uri: String,
}

/// Mock Keepa push server.
///
/// Inflates every request into JSON for the test to inspect, and sends whatever frames the test
/// asks for to every live connection.
pub struct MockKeepaServer {
    addr: SocketAddr,
    /// Broadcast actions to ALL connected clients
    action_tx: broadcast::Sender<Action>,
    /// Decoded requests from any client
    request_rx: mpsc::UnboundedReceiver<Value>,
    handshakes: Arc<Mutex<Vec<HandshakeHeaders>>>,
    connections: Arc<AtomicUsize>,
    /// Refuse upgrades with 503 while set
    reject: Arc<AtomicBool>,
    /// New connections never read, so PINGs go unanswered
    silent: Arc<AtomicBool>,
}

impl MockKeepaServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (action_tx, _) = broadcast::channel::<Action>(100);
        let (request_tx, request_rx) = mpsc::unbounded_channel::<Value>();
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let reject = Arc::new(AtomicBool::new(false));
        let silent = Arc::new(AtomicBool::new(false));

        let server = Self {
            addr,
            action_tx: action_tx.clone(),
            request_rx,
            handshakes: Arc::clone(&handshakes),
            connections: Arc::clone(&connections),
            reject: Arc::clone(&reject),
            silent: Arc::clone(&silent),
        };

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let handshakes = Arc::clone(&handshakes);
                let reject = Arc::clone(&reject);
                let callback = move |request: &Request, mut response: Response| {
                    if reject.load(Ordering::SeqCst) {
                        let mut refused = ErrorResponse::new(Some("unavailable".to_owned()));
                        *refused.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                        return Err(refused);
                    }

                    let header = |name: HeaderName| {
                        request
                            .headers()
                            .get(name)
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_owned)
                    };
                    handshakes.lock().unwrap().push(HandshakeHeaders {
                        protocol: header(SEC_WEBSOCKET_PROTOCOL),
                        user_agent: header(USER_AGENT),
                        uri: request.uri().to_string(),
                    });

                    if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                        response
                            .headers_mut()
                            .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                    }
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                connections.fetch_add(1, Ordering::SeqCst);

                if silent.load(Ordering::SeqCst) {
                    // Hold the socket open without ever reading from it, until told to drop it.
                    let mut action_rx = action_tx.subscribe();
                    tokio::spawn(async move {
                        let disconnect = async {
                            while let Ok(action) = action_rx.recv().await {
                                if matches!(action, Action::Disconnect) {
                                    break;
                                }
                            }
                        };
                        _ = timeout(Duration::from_secs(30), disconnect).await;
                        drop(ws_stream);
                    });
                    continue;
                }

                let (mut write, mut read) = ws_stream.split();
                let request_tx = request_tx.clone();
                let mut action_rx = action_tx.subscribe();

                // Spawn a task to handle this connection
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Binary(bytes))) => {
                                        let inflated = decompress_to_vec_zlib(&bytes).unwrap();
                                        let request = serde_json::from_slice(&inflated).unwrap();
                                        drop(request_tx.send(request));
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            action = action_rx.recv() => {
                                match action {
                                    Ok(Action::Send(frame)) => {
                                        let sent = write.send(Message::Binary(frame.into())).await;
                                        if sent.is_err() {
                                            break;
                                        }
                                    }
                                    // Dropping both halves resets the socket without a close frame.
                                    Ok(Action::Disconnect) | Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        server
    }

    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/apps/cloud/", self.addr)
    }

    /// Send a raw frame to all connected clients.
    pub fn send_frame(&self, frame: Vec<u8>) {
        drop(self.action_tx.send(Action::Send(frame)));
    }

    /// Send `message` as a raw deflate stream, the way the real service does.
    pub fn send(&self, message: &Value) {
        self.send_frame(deflate(message));
    }

    /// Drop every live connection.
    pub fn disconnect_all(&self) {
        drop(self.action_tx.send(Action::Disconnect));
    }

    pub fn reject_handshakes(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Receive the next product request.
    pub async fn recv_request(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.request_rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn handshakes(&self) -> Vec<HandshakeHeaders> {
        self.handshakes.lock().unwrap().clone()
    }
}

/// Log to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

#[must_use]
pub fn deflate(message: &Value) -> Vec<u8> {
    compress_to_vec(message.to_string().as_bytes(), 6)
}

/// A product response echoing `id`, with one AMAZON sample worth `price`.
#[must_use]
pub fn product(id: Option<u64>, asin: &str, price: i64) -> Value {
    let product = json!({
        "asin": asin,
        "title": format!("Product {asin}"),
        "csv": [[7_000_000, price + 100, 7_000_060, price], null, [7_000_000, -1]],
    });

    match id {
        Some(id) => json!({ "id": id, "products": [product] }),
        None => json!({ "products": [product] }),
    }
}

/// Request id the client chose for a product request.
#[must_use]
pub fn request_id(request: &Value) -> u64 {
    request["id"].as_u64().unwrap()
}

/// Fast reconnects and no heartbeat unless a test asks for one.
#[must_use]
pub fn config() -> Config {
    Config::default()
        .with_connect_timeout(Duration::from_secs(2))
        .with_heartbeat(None, Duration::from_secs(60))
        .with_reconnect(ReconnectConfig::new(
            Some(5),
            Duration::from_millis(50),
            Duration::from_millis(200),
        ))
}
