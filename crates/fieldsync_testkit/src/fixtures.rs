//! Test fixtures: clocks, servers and simulated devices.

use crate::loopback::ServerLoopback;
use chrono::{DateTime, Duration, TimeZone, Utc};
use fieldsync_engine::{
    FileStateStore, HttpTransport, LocalStore, LoopbackClient, ManualClock, RetryConfig,
    SessionReport, SyncConfig, SyncCoordinator, SyncTrigger,
};
use fieldsync_protocol::DeviceId;
use fieldsync_server::{ServerConfig, SyncServer};
use std::sync::Arc;
use tempfile::TempDir;

/// Transport used by [`TestDevice`].
pub type LoopbackTransport = HttpTransport<LoopbackClient<ServerLoopback>>;

/// Fixed starting point for test clocks.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 8, 0, 0).single().unwrap_or_default()
}

/// A manual clock at [`base_time`].
pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(base_time()))
}

/// A server with default limits.
pub fn test_server() -> Arc<SyncServer> {
    Arc::new(SyncServer::new(ServerConfig::default()))
}

/// A device config that never sleeps between retries.
pub fn test_config(device: u128) -> SyncConfig {
    SyncConfig::new(DeviceId::from_u128(device)).with_retry(RetryConfig::no_retry())
}

/// A simulated device: local store, clock and coordinator wired to a
/// shared in-process server.
pub struct TestDevice {
    /// Device clock.
    pub clock: Arc<ManualClock>,
    /// Local store.
    pub store: Arc<LocalStore>,
    /// Sync coordinator.
    pub coordinator: SyncCoordinator<LoopbackTransport>,
}

impl TestDevice {
    /// Creates device `n` with an in-memory store.
    pub fn new(server: &Arc<SyncServer>, n: u128) -> Self {
        let clock = test_clock();
        let store = Arc::new(LocalStore::in_memory_with_clock(clock.clone()));
        Self::with_store(server, test_config(n), store, clock)
    }

    /// Creates a device around an existing store.
    pub fn with_store(
        server: &Arc<SyncServer>,
        config: SyncConfig,
        store: Arc<LocalStore>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let client = LoopbackClient::new(ServerLoopback::new(Arc::clone(server)));
        let transport = HttpTransport::new("http://loopback", client);
        Self {
            clock,
            coordinator: SyncCoordinator::new(config, Arc::clone(&store), transport),
            store,
        }
    }

    /// Runs a manual session and returns its report.
    ///
    /// # Panics
    ///
    /// Panics if the session could not start or hit a storage error.
    pub async fn sync(&self) -> SessionReport {
        self.coordinator
            .run_session(SyncTrigger::Manual)
            .await
            .expect("session should run")
            .into_report()
            .expect("session should not be coalesced")
    }

    /// Simulates losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.coordinator.transport().client().set_online(online);
    }

    /// The device's server endpoint, for fault injection.
    pub fn endpoint(&self) -> &ServerLoopback {
        self.coordinator.transport().client().server()
    }

    /// Moves the device clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }
}

/// A temporary state directory opened with a [`FileStateStore`].
pub struct TempStateDir {
    dir: TempDir,
}

impl TempStateDir {
    /// Creates an empty temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp directory"),
        }
    }

    /// Path of the state directory.
    pub fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("state")
    }

    /// Opens a local store over the directory.
    ///
    /// # Panics
    ///
    /// Panics if the directory is locked or the state is unreadable.
    pub fn open(&self, clock: Arc<ManualClock>) -> LocalStore {
        let backend = FileStateStore::open(&self.path()).expect("failed to open state dir");
        LocalStore::open(Box::new(backend), clock).expect("failed to load state")
    }
}

impl Default for TempStateDir {
    fn default() -> Self {
        Self::new()
    }
}
