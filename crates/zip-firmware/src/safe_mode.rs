//! Persistent boot-failure counter with a latched fallback mode.
//!
//! A small magic-tagged record lives in storage that survives a soft or
//! watchdog reset but not power loss.  Every failed subsystem init bumps the
//! counter; reaching [`SAFE_MODE_MAX_FAILURES`] latches safe mode on, and it
//! stays on across later boots until one fully successful init clears it.
//!
//! The record is validated on every access: a missing or mismatched magic
//! means the storage was lost and the record is rebuilt as zero failures,
//! disabled.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

/// `"SAFE"` in ASCII.
pub const SAFE_MODE_MAGIC: u32 = 0x5341_4645;

/// Failures tolerated before safe mode latches.
pub const SAFE_MODE_MAX_FAILURES: u8 = 3;

/// Serialised record size: magic (4), failure count (1), enabled (1),
/// reserved (2).
pub const RECORD_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum SafeModeError {
    #[error("retained storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Record
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory form of the retained record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafeModeRecord {
    pub magic: u32,
    pub failure_count: u8,
    pub enabled: bool,
}

impl SafeModeRecord {
    fn fresh() -> Self {
        Self {
            magic: SAFE_MODE_MAGIC,
            failure_count: 0,
            enabled: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SAFE_MODE_MAGIC
    }

    pub fn to_bytes(self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4] = self.failure_count;
        out[5] = u8::from(self.enabled);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; RECORD_LEN] = bytes.try_into().ok()?;
        Some(Self {
            magic: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            failure_count: bytes[4],
            enabled: bytes[5] != 0,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage backends
// ─────────────────────────────────────────────────────────────────────────────

/// Storage retained across resets.
pub trait RetainedStore {
    /// Raw record bytes, or `None` when nothing has been stored.
    fn load(&self) -> Result<Option<Vec<u8>>, SafeModeError>;

    fn store(&mut self, bytes: &[u8]) -> Result<(), SafeModeError>;
}

/// RAM-backed retained region.
///
/// Clones share the same region, so a test can drop a tracker ("reset") and
/// build another over the same memory.  [`MemoryStore::power_loss`] wipes it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    region: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate power loss: the retained contents are gone.
    pub fn power_loss(&self) {
        *self.region.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Overwrite the region with arbitrary bytes.
    pub fn corrupt(&self, bytes: &[u8]) {
        *self.region.lock().unwrap_or_else(|p| p.into_inner()) = Some(bytes.to_vec());
    }
}

impl RetainedStore for MemoryStore {
    fn load(&self) -> Result<Option<Vec<u8>>, SafeModeError> {
        Ok(self.region.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn store(&mut self, bytes: &[u8]) -> Result<(), SafeModeError> {
        *self.region.lock().unwrap_or_else(|p| p.into_inner()) = Some(bytes.to_vec());
        Ok(())
    }
}

/// File-backed retained segment.  The file standing in for reset-retained
/// memory is best-effort: deleting it behaves like power loss.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RetainedStore for FileStore {
    fn load(&self) -> Result<Option<Vec<u8>>, SafeModeError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&mut self, bytes: &[u8]) -> Result<(), SafeModeError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Counts init failures across resets and latches safe mode.
///
/// # Example
///
/// ```
/// use zip_firmware::safe_mode::{MemoryStore, SafeModeTracker, SAFE_MODE_MAX_FAILURES};
///
/// let mut tracker = SafeModeTracker::init(MemoryStore::new()).unwrap();
/// for _ in 0..SAFE_MODE_MAX_FAILURES {
///     tracker.record_failure().unwrap();
/// }
/// assert!(tracker.is_enabled());
///
/// tracker.clear_failures().unwrap();
/// assert!(!tracker.is_enabled());
/// assert_eq!(tracker.fail_count(), 0);
/// ```
pub struct SafeModeTracker<S: RetainedStore> {
    store: S,
    record: SafeModeRecord,
}

impl<S: RetainedStore> SafeModeTracker<S> {
    /// Validate the retained record, reinitialising it on a magic mismatch.
    pub fn init(mut store: S) -> Result<Self, SafeModeError> {
        let loaded = store
            .load()?
            .and_then(|bytes| SafeModeRecord::from_bytes(&bytes))
            .filter(SafeModeRecord::is_valid);

        let record = match loaded {
            Some(record) => {
                if record.enabled {
                    warn!(failures = record.failure_count, "booting in safe mode");
                }
                record
            }
            None => {
                info!("retained safe-mode record invalid, reinitialising");
                let record = SafeModeRecord::fresh();
                store.store(&record.to_bytes())?;
                record
            }
        };
        Ok(Self { store, record })
    }

    /// Whether fallback behaviour must be used on this boot.
    pub fn is_enabled(&self) -> bool {
        self.record.is_valid() && self.record.enabled
    }

    pub fn fail_count(&self) -> u8 {
        if self.record.is_valid() {
            self.record.failure_count
        } else {
            0
        }
    }

    /// Record one failed subsystem init.  Saturates instead of wrapping.
    pub fn record_failure(&mut self) -> Result<(), SafeModeError> {
        self.ensure_valid();
        self.record.failure_count = self.record.failure_count.saturating_add(1);
        if self.record.failure_count >= SAFE_MODE_MAX_FAILURES && !self.record.enabled {
            self.record.enabled = true;
            warn!(failures = self.record.failure_count, "safe mode latched");
        }
        self.persist()
    }

    /// One fully successful init: zero the counter and leave safe mode.
    pub fn clear_failures(&mut self) -> Result<(), SafeModeError> {
        self.ensure_valid();
        self.record.failure_count = 0;
        self.record.enabled = false;
        self.persist()
    }

    pub fn record(&self) -> SafeModeRecord {
        self.record
    }

    /// Give the storage back, e.g. to simulate a reset.
    pub fn into_store(self) -> S {
        self.store
    }

    fn ensure_valid(&mut self) {
        if !self.record.is_valid() {
            self.record = SafeModeRecord::fresh();
        }
    }

    fn persist(&mut self) -> Result<(), SafeModeError> {
        self.store.store(&self.record.to_bytes())
    }
}
