//! Transport abstraction for pull and push.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fieldsync_protocol::{Disposition, PullRequest, PullResponse, PushRequest, PushResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Network access to the authoritative store.
///
/// Implementations perform one call each; retries, timeouts and
/// cancellation are layered on top by [`crate::retry::with_retry`].
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches server records committed after `request.since`.
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Submits change log entries.
    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Returns true if the server is believed reachable.
    fn is_reachable(&self) -> bool;
}

type PushHandler = Box<dyn Fn(&PushRequest) -> SyncResult<PushResponse> + Send + Sync>;

/// A scripted transport for testing.
///
/// Scripted results are consumed first; after that the default pull
/// response and the push handler answer.
pub struct MockTransport {
    reachable: AtomicBool,
    pull_script: Mutex<VecDeque<SyncResult<PullResponse>>>,
    push_script: Mutex<VecDeque<SyncResult<PushResponse>>>,
    default_pull: Mutex<Option<PullResponse>>,
    push_handler: Mutex<Option<PushHandler>>,
    delay: Mutex<Option<Duration>>,
    pulls: Mutex<Vec<PullRequest>>,
    pushes: Mutex<Vec<PushRequest>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("reachable", &self.reachable.load(Ordering::SeqCst))
            .field("pulls", &self.pulls.lock().len())
            .field("pushes", &self.pushes.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a reachable mock with nothing scripted.
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            pull_script: Mutex::new(VecDeque::new()),
            push_script: Mutex::new(VecDeque::new()),
            default_pull: Mutex::new(None),
            push_handler: Mutex::new(None),
            delay: Mutex::new(None),
            pulls: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
        }
    }

    /// Creates a mock that returns `pull` for every pull and accepts every
    /// pushed entry at `base_version + 1`.
    pub fn accepting(pull: PullResponse) -> Self {
        let mock = Self::new();
        mock.set_pull_response(pull);
        mock.set_push_handler(|request| {
            Ok(PushResponse::new(
                request
                    .entries
                    .iter()
                    .map(|e| Disposition::accepted(e, e.base_version + 1))
                    .collect(),
            ))
        });
        mock
    }

    /// Sets reachability.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queues a one-shot pull result.
    pub fn queue_pull(&self, result: SyncResult<PullResponse>) {
        self.pull_script.lock().push_back(result);
    }

    /// Queues a one-shot push result.
    pub fn queue_push(&self, result: SyncResult<PushResponse>) {
        self.push_script.lock().push_back(result);
    }

    /// Sets the response used once the pull script is empty.
    pub fn set_pull_response(&self, response: PullResponse) {
        *self.default_pull.lock() = Some(response);
    }

    /// Sets the handler used once the push script is empty.
    pub fn set_push_handler<F>(&self, handler: F)
    where
        F: Fn(&PushRequest) -> SyncResult<PushResponse> + Send + Sync + 'static,
    {
        *self.push_handler.lock() = Some(Box::new(handler));
    }

    /// Delays every call, to exercise timeouts and cancellation.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Recorded pull requests.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pulls.lock().clone()
    }

    /// Recorded push requests.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.pushes.lock().clone()
    }

    async fn wait(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn pull(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        self.pulls.lock().push(request.clone());
        self.wait().await;
        if let Some(result) = self.pull_script.lock().pop_front() {
            return result;
        }
        self.default_pull
            .lock()
            .clone()
            .ok_or_else(|| SyncError::Protocol("no pull response configured".into()))
    }

    async fn push(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.pushes.lock().push(request.clone());
        self.wait().await;
        if let Some(result) = self.push_script.lock().pop_front() {
            return result;
        }
        match self.push_handler.lock().as_ref() {
            Some(handler) => handler(request),
            None => Err(SyncError::Protocol("no push response configured".into())),
        }
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
