//! Main sync server.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{DeviceActivity, HandlerContext, RequestHandler};
use crate::store::AuthoritativeStore;
use crate::validation::{DefaultValidator, PayloadValidator};
use fieldsync_protocol::{
    DeviceId, PullRequest, PullResponse, PushRequest, PushResponse, WireMessage,
};
use std::sync::Arc;

/// Path of the pull endpoint.
pub const PULL_ENDPOINT: &str = "/sync/pull";
/// Path of the push endpoint.
pub const PUSH_ENDPOINT: &str = "/sync/push";

/// The sync server.
///
/// Handles pull and push requests against an [`AuthoritativeStore`]. It
/// owns no sockets: embed it behind any HTTP front end by routing POST
/// bodies through [`SyncServer::handle_http`].
///
/// # Example
///
/// ```
/// use fieldsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// assert_eq!(server.record_count(), 0);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a server with an empty store and the default validator.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(AuthoritativeStore::new()))
    }

    /// Creates a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<AuthoritativeStore>) -> Self {
        Self::with_parts(config, store, Box::new(DefaultValidator))
    }

    /// Creates a server with a custom payload validator.
    pub fn with_parts(
        config: ServerConfig,
        store: Arc<AuthoritativeStore>,
        validator: Box<dyn PayloadValidator>,
    ) -> Self {
        let context = Arc::new(HandlerContext::new(config, store, validator));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: PullRequest) -> ServerResult<PullResponse> {
        self.handler.handle_pull(request)
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: PushRequest) -> ServerResult<PushResponse> {
        self.handler.handle_push(request)
    }

    /// Routes a CBOR POST body to its endpoint and encodes the response.
    pub fn handle_http(&self, path: &str, body: &[u8]) -> ServerResult<Vec<u8>> {
        match path {
            PULL_ENDPOINT => Ok(self.handle_pull(PullRequest::decode(body)?)?.encode()?),
            PUSH_ENDPOINT => Ok(self.handle_push(PushRequest::decode(body)?)?.encode()?),
            other => Err(ServerError::UnknownEndpoint(other.to_string())),
        }
    }

    /// The authoritative store.
    pub fn store(&self) -> &Arc<AuthoritativeStore> {
        &self.context.store
    }

    /// Number of records, tombstones included.
    pub fn record_count(&self) -> usize {
        self.context.store.len()
    }

    /// Request counters of one device.
    pub fn device_activity(&self, device_id: DeviceId) -> Option<DeviceActivity> {
        self.context.activity(device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fieldsync_protocol::{EntryId, Operation, PushEntry, PushOutcome, RecordId, SyncRecord};

    fn create(id: u128) -> PushEntry {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let record = SyncRecord::new(RecordId::from_u128(id), "asset", 1, at, vec![7]);
        PushEntry {
            entry_id: EntryId::from_u128(id),
            record_id: record.id,
            base_version: 0,
            operation: Operation::Create,
            payload: record,
        }
    }

    #[test]
    fn server_lifecycle() {
        let server = SyncServer::new(ServerConfig::default());
        assert_eq!(server.record_count(), 0);
        assert!(server.device_activity(DeviceId::from_u128(1)).is_none());
    }

    #[test]
    fn http_round_trip() {
        let server = SyncServer::new(ServerConfig::default());
        let device = DeviceId::from_u128(1);

        let body = PushRequest::new(device, vec![create(1), create(2)]).encode().unwrap();
        let bytes = server.handle_http(PUSH_ENDPOINT, &body).unwrap();
        let pushed = PushResponse::decode(&bytes).unwrap();
        assert!(pushed.dispositions.iter().all(|d| d.outcome == PushOutcome::Accepted));

        let body = PullRequest::new(device, None).encode().unwrap();
        let bytes = server.handle_http(PULL_ENDPOINT, &body).unwrap();
        assert_eq!(PullResponse::decode(&bytes).unwrap().records.len(), 2);
    }

    #[test]
    fn unknown_endpoint() {
        let server = SyncServer::new(ServerConfig::default());
        let err = server.handle_http("/sync/handshake", &[]).unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn garbage_body_is_client_error() {
        let server = SyncServer::new(ServerConfig::default());
        let err = server.handle_http(PULL_ENDPOINT, &[0xff, 0x01]).unwrap_err();
        assert!(err.is_client_error());
    }

    #[test]
    fn custom_validator() {
        let validator = |entry: &PushEntry| {
            if entry.payload.entity_type == "asset" {
                Err("assets are read-only".to_string())
            } else {
                Ok(())
            }
        };
        let server = SyncServer::with_parts(
            ServerConfig::default(),
            Arc::new(AuthoritativeStore::new()),
            Box::new(validator),
        );

        let response = server
            .handle_push(PushRequest::new(DeviceId::from_u128(1), vec![create(1)]))
            .unwrap();
        assert_eq!(response.dispositions[0].reason.as_deref(), Some("assets are read-only"));
        assert_eq!(server.record_count(), 0);
    }
}
