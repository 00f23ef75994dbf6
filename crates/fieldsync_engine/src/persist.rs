//! Durable storage for device state.
//!
//! The file layout is:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK          # Advisory lock, one engine per directory
//! └─ state.cbor    # Latest committed DeviceState
//! ```

use crate::error::{SyncError, SyncResult};
use crate::store::DeviceState;
use fieldsync_protocol::{from_cbor, to_cbor};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "state.cbor";
const STATE_TEMP: &str = "state.cbor.tmp";

/// On-disk format version.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct Envelope<'a> {
    format_version: u32,
    state: &'a DeviceState,
}

#[derive(Deserialize)]
struct OwnedEnvelope {
    format_version: u32,
    state: DeviceState,
}

/// Backend that persists the whole device state.
///
/// `persist` must be atomic: after a crash, `load` returns either the old or
/// the new state, never a mix.
pub trait StateStore: Send + Sync {
    /// Loads the last persisted state, or `None` for a fresh device.
    fn load(&self) -> SyncResult<Option<DeviceState>>;

    /// Persists a complete state.
    fn persist(&self, state: &DeviceState) -> SyncResult<()>;
}

impl<S: StateStore + ?Sized> StateStore for Arc<S> {
    fn load(&self) -> SyncResult<Option<DeviceState>> {
        (**self).load()
    }

    fn persist(&self, state: &DeviceState) -> SyncResult<()> {
        (**self).persist(state)
    }
}

fn encode(state: &DeviceState) -> SyncResult<Vec<u8>> {
    let envelope = Envelope {
        format_version: FORMAT_VERSION,
        state,
    };
    to_cbor(&envelope).map_err(|e| SyncError::storage(format!("encode device state: {e}")))
}

fn decode(bytes: &[u8]) -> SyncResult<DeviceState> {
    let envelope: OwnedEnvelope =
        from_cbor(bytes).map_err(|e| SyncError::storage(format!("decode device state: {e}")))?;
    if envelope.format_version != FORMAT_VERSION {
        return Err(SyncError::storage(format!(
            "unsupported state format version {} (expected {FORMAT_VERSION})",
            envelope.format_version
        )));
    }
    Ok(envelope.state)
}

/// In-memory backend. Keeps the encoded bytes so state round-trips through
/// the same codec as the file backend.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    bytes: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `persist` fail with a storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns true if something was persisted.
    pub fn has_state(&self) -> bool {
        self.bytes.lock().is_some()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> SyncResult<Option<DeviceState>> {
        match self.bytes.lock().as_deref() {
            Some(bytes) => decode(bytes).map(Some),
            None => Ok(None),
        }
    }

    fn persist(&self, state: &DeviceState) -> SyncResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::storage("disk full"));
        }
        let bytes = encode(state)?;
        *self.bytes.lock() = Some(bytes);
        Ok(())
    }
}

/// File backend holding an exclusive lock on its directory.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    _lock_file: File,
}

impl FileStateStore {
    /// Opens or creates a state directory.
    ///
    /// # Errors
    ///
    /// Fails if another process holds the directory lock or on I/O errors.
    pub fn open(path: &Path) -> SyncResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(SyncError::storage(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::storage(format!(
                "state directory is locked: {}",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path of the state file.
    pub fn state_path(&self) -> PathBuf {
        self.path.join(STATE_FILE)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> SyncResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SyncResult<()> {
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> SyncResult<Option<DeviceState>> {
        let state_path = self.state_path();
        if !state_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&state_path)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        decode(&bytes).map(Some)
    }

    fn persist(&self, state: &DeviceState) -> SyncResult<()> {
        let temp_path = self.path.join(STATE_TEMP);
        let bytes = encode(state)?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.state_path())?;
        self.sync_directory()
    }
}
