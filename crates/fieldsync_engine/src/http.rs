//! HTTP transport with CBOR bodies.
//!
//! The HTTP library itself sits behind [`HttpClient`], so the engine does not
//! pick one. [`LoopbackClient`] routes requests to an in-process server.

use crate::error::{SyncError, SyncResult};
use crate::transport::SyncTransport;
use async_trait::async_trait;
use fieldsync_protocol::{PullRequest, PullResponse, PushRequest, PushResponse, WireMessage};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Path of the pull endpoint.
pub const PULL_PATH: &str = "/sync/pull";
/// Path of the push endpoint.
pub const PUSH_PATH: &str = "/sync/push";

/// Failure reported by an [`HttpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The request never completed (DNS, connect, reset). Worth retrying.
    Connection(String),
    /// The server answered with an error status.
    Status {
        /// HTTP status code.
        code: u16,
        /// Response body as text.
        message: String,
    },
}

impl From<HttpError> for SyncError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Connection(message) => SyncError::transport_retryable(message),
            HttpError::Status { code, message } if code >= 500 => {
                SyncError::ServerError(format!("{code}: {message}"))
            }
            HttpError::Status { code, message } => {
                SyncError::transport_fatal(format!("{code}: {message}"))
            }
        }
    }
}

/// Minimal HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError>;

    /// Returns true if the client believes the network is up.
    fn is_healthy(&self) -> bool;
}

/// Sync transport that POSTs CBOR bodies.
pub struct HttpTransport<C: HttpClient> {
    base_url: String,
    client: C,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for `base_url` (e.g. `https://sync.example.org`).
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            last_error: RwLock::new(None),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    async fn post_cbor<Req, Res>(&self, path: &str, request: &Req) -> SyncResult<Res>
    where
        Req: WireMessage + Sync,
        Res: WireMessage,
    {
        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, path);

        let response = match self.client.post(&url, body).await {
            Ok(response) => response,
            Err(err) => {
                *self.last_error.write() = Some(format!("{err:?}"));
                return Err(err.into());
            }
        };

        *self.last_error.write() = None;
        Ok(Res::decode(&response)?)
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.post_cbor(PULL_PATH, request).await
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post_cbor(PUSH_PATH, request).await
    }

    fn is_reachable(&self) -> bool {
        self.client.is_healthy()
    }
}

/// A server reachable without a network.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST to `path` and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError>;
}

/// HTTP client that calls a [`LoopbackServer`] in-process.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client connected to `server`.
    pub fn new(server: S) -> Self {
        Self {
            server,
            online: AtomicBool::new(true),
        }
    }

    /// Simulates losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, HttpError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(HttpError::Connection("network unreachable".into()));
        }
        let path = url.find("/sync/").map_or(url, |i| &url[i..]);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
