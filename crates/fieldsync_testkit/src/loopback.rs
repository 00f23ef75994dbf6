//! In-process server endpoint with fault injection.

use fieldsync_engine::{HttpError, LoopbackServer};
use fieldsync_server::{SyncServer, PUSH_ENDPOINT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Routes loopback HTTP requests to a shared [`SyncServer`].
///
/// Faults are counted down per request:
/// - `fail_next(n)`: the next `n` requests never reach the server
/// - `lose_push_responses(n)`: the next `n` pushes are applied by the server
///   but the device never sees the response
pub struct ServerLoopback {
    server: Arc<SyncServer>,
    failing: AtomicUsize,
    losing: AtomicUsize,
}

impl ServerLoopback {
    /// Creates an endpoint for `server`.
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self {
            server,
            failing: AtomicUsize::new(0),
            losing: AtomicUsize::new(0),
        }
    }

    /// The shared server.
    pub fn server(&self) -> &Arc<SyncServer> {
        &self.server
    }

    /// Fails the next `n` requests before they reach the server.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    /// Drops the responses of the next `n` applied pushes.
    pub fn lose_push_responses(&self, n: usize) {
        self.losing.store(n, Ordering::SeqCst);
    }
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LoopbackServer for ServerLoopback {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, HttpError> {
        if take(&self.failing) {
            return Err(HttpError::Connection("connection reset by peer".into()));
        }

        let response = self
            .server
            .handle_http(path, body)
            .map_err(|e| HttpError::Status {
                code: e.status_code(),
                message: e.to_string(),
            })?;

        if path == PUSH_ENDPOINT && take(&self.losing) {
            return Err(HttpError::Connection("connection closed before response".into()));
        }
        Ok(response)
    }
}
