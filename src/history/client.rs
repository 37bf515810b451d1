use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bon::Builder;
use rand::Rng as _;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL, USER_AGENT};
use url::Url;

use super::codec::KeepaCodec;
use super::types::request::ProductRequestTemplate;
use super::types::response::ProductHistory;
use crate::Result;
use crate::error::Error;
use crate::ws::config::Config;
use crate::ws::session::{CloseCause, SessionManager, SessionState};
use crate::ws::traits::Handshake;

/// Public push endpoint of the Keepa website.
pub const DEFAULT_ENDPOINT: &str = "wss://push2.keepa.com/apps/cloud/";

/// User agent sent with the handshake unless overridden.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:134.0) Gecko/20100101 Firefox/134.0";

const ENDPOINT_PARAMS: [(&str, &str); 2] = [("app", "keepaWebsite"), ("version", "2.0")];

/// Generate a fresh handshake token: 32 random bytes as sixteen 4-digit hex groups.
#[must_use]
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    (0..16).fold(String::with_capacity(64), |mut token, _| {
        let _ = write!(token, "{:04x}", rng.random::<u16>());
        token
    })
}

/// Handshake for the push endpoint. A new token is generated for every connect attempt.
#[derive(Debug, Clone)]
pub struct KeepaHandshake {
    url: Url,
    user_agent: HeaderValue,
}

impl KeepaHandshake {
    pub fn new(endpoint: &str, user_agent: &str) -> Result<Self> {
        Ok(Self {
            url: Url::parse_with_params(endpoint, ENDPOINT_PARAMS)?,
            user_agent: HeaderValue::from_str(user_agent)?,
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Handshake for KeepaHandshake {
    fn request(&self) -> Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(&generate_token())?);
        headers.insert(USER_AGENT, self.user_agent.clone());
        Ok(request)
    }
}

/// Everything a [`Client`] can be configured with.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use keepa_client_sdk::history::Options;
/// use keepa_client_sdk::ws::config::Config;
///
/// let options = Options::builder()
///     .endpoint("ws://127.0.0.1:8080")
///     .user_agent("keepa-client-sdk")
///     .config(Config::default().with_request_timeout(Duration::from_secs(10)))
///     .build();
/// assert_eq!(options.endpoint, "ws://127.0.0.1:8080");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Options {
    #[builder(default = DEFAULT_ENDPOINT.to_owned(), into)]
    pub endpoint: String,
    #[builder(default)]
    pub config: Config,
    #[builder(default = DEFAULT_USER_AGENT.to_owned(), into)]
    pub user_agent: String,
    #[builder(default)]
    pub template: ProductRequestTemplate,
}

impl Default for Options {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Client for product price histories served over the Keepa push connection.
///
/// All requests share one persistent connection, opened on the first request. Cloning is cheap
/// and every clone shares the connection.
///
/// If the connection cannot be established, or is lost and cannot be re-established, the failed
/// session stays closed and the next request starts a new one. Only [`Client::close`] is final.
///
/// # Examples
///
/// ```rust, no_run
/// use std::time::Duration;
///
/// use keepa_client_sdk::history::{Client, PriceType};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::default();
///
///     let history = client.fetch("B08N5WRWNW", Duration::from_secs(5)).await?;
///     if let Some(point) = history.latest(PriceType::Amazon) {
///         println!("{} at {}", point.value, point.timestamp);
///     }
///
///     client.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::with_options(Options::default())
            .expect("Keepa client with default options should succeed")
    }
}

struct ClientInner {
    /// Handshake for every session this client creates
    handshake: KeepaHandshake,
    /// Configuration for each session
    config: Config,
    codec: KeepaCodec,
    /// Session currently in use
    session: RwLock<SessionManager<KeepaCodec>>,
    /// Set once by [`Client::close`]
    closed: AtomicBool,
}

impl Client {
    /// Create a client for `endpoint` with default request settings.
    ///
    /// Must be called from within a tokio runtime. No connection is made yet.
    pub fn new(endpoint: &str, config: Config) -> Result<Self> {
        Self::with_options(Options::builder().endpoint(endpoint).config(config).build())
    }

    /// Create a client from a full set of [`Options`].
    pub fn with_options(options: Options) -> Result<Self> {
        let handshake = KeepaHandshake::new(&options.endpoint, &options.user_agent)?;
        let codec = KeepaCodec::new(options.template);
        let session = SessionManager::new(handshake.clone(), options.config.clone(), codec);

        Ok(Self {
            inner: Arc::new(ClientInner {
                handshake,
                config: options.config,
                codec,
                session: RwLock::new(session),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Connect now instead of on the first request.
    pub async fn open(&self) -> Result<()> {
        self.session()?.open().await
    }

    /// Fetch the price history of `asin`, waiting at most `timeout` for it.
    ///
    /// # Errors
    ///
    /// Each call fails only with the outcome of its own request:
    /// [`Timeout`](crate::error::Kind::Timeout) when no answer arrived in time,
    /// [`ConnectionLost`](crate::error::Kind::ConnectionLost) when the connection dropped while
    /// waiting, [`Protocol`](crate::error::Kind::Protocol) when the answer could not be decoded,
    /// [`Connect`](crate::error::Kind::Connect) when no connection could be made, and
    /// [`ClientClosed`](crate::error::Kind::ClientClosed) after [`Client::close`].
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self), err(level = "debug"))
    )]
    pub async fn fetch(&self, asin: &str, timeout: Duration) -> Result<ProductHistory> {
        self.session()?.fetch(asin, timeout).await
    }

    /// [`fetch`](Self::fetch) with [`Config::request_timeout`].
    pub async fn fetch_default(&self, asin: &str) -> Result<ProductHistory> {
        self.fetch(asin, self.inner.config.request_timeout).await
    }

    /// Close the client.
    ///
    /// Idempotent. Pending requests fail with [`ClientClosed`](crate::error::Kind::ClientClosed),
    /// as does everything called afterwards.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let session = self.current();
        session.close().await;
    }

    /// Get the current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.current().state()
    }

    /// Number of requests currently waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.current().pending_count()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn current(&self) -> SessionManager<KeepaCodec> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The session to use for the next operation, replacing it if it failed.
    fn session(&self) -> Result<SessionManager<KeepaCodec>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::client_closed());
        }

        let current = self.current();
        if !is_failed(&current.state()) {
            return Ok(current);
        }

        let mut session = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        // Checked again under the lock so close() never races a replacement.
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::client_closed());
        }

        if is_failed(&session.state()) {
            #[cfg(feature = "tracing")]
            tracing::info!(state = ?session.state(), "starting a new session");

            *session = SessionManager::new(
                self.inner.handshake.clone(),
                self.inner.config.clone(),
                self.inner.codec,
            );
        }

        Ok(session.clone())
    }
}

fn is_failed(state: &SessionState) -> bool {
    matches!(state, SessionState::Closed { cause } if *cause != CloseCause::Requested)
}
