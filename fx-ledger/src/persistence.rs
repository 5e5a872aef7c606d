//! Durable snapshots and the single-writer discipline
//!
//! The whole ledger state is written as one snapshot file:
//!
//! ```text
//! <data_dir>/ledger.snapshot       current snapshot
//! <data_dir>/ledger.snapshot.tmp   in-flight write, renamed over the current one
//! ```
//!
//! A crash mid-write leaves at most a stale `.tmp` file; the current
//! snapshot is always either the previous or the next complete state.
//! Only the worker named by the [`WriterAssignment`] may persist.

use crate::{
    config::{Config, SnapshotFormat},
    store::LedgerState,
    types::{lenient_decimal, AccountId, Currency, WorkerId},
    writer::WriterAssignment,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Current snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Format version
    pub version: u32,
    /// Sequence of the last log entry included
    pub sequence: u64,
    /// When the snapshot was written
    pub written_at: DateTime<Utc>,
    /// Worker that wrote it
    pub writer: Option<WorkerId>,
    /// SHA-256 (hex) of the bincode encoding of `state`
    pub checksum: String,
    /// Ledger state
    pub state: LedgerState,
}

impl Snapshot {
    /// Wrap `state`, computing its checksum
    pub fn new(state: LedgerState, writer: Option<WorkerId>) -> Result<Self> {
        Ok(Self {
            version: SNAPSHOT_VERSION,
            sequence: state.sequence(),
            written_at: Utc::now(),
            writer,
            checksum: state_checksum(&state)?,
            state,
        })
    }

    /// Check version and checksum
    pub fn verify(&self) -> Result<()> {
        if self.version > SNAPSHOT_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }

        let actual = state_checksum(&self.state)?;
        if actual != self.checksum {
            return Err(Error::Integrity {
                expected: self.checksum.clone(),
                actual,
            });
        }

        self.state
            .check_invariants()
            .map_err(|msg| Error::Persistence(format!("snapshot violates invariants: {}", msg)))
    }
}

/// SHA-256 over the canonical (bincode) bytes of a state
pub fn state_checksum(state: &LedgerState) -> Result<String> {
    let bytes = bincode::serialize(state)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Seed file: initial accounts and rates
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Seed {
    /// Accounts to create
    pub accounts: Vec<SeedAccount>,
    /// Rates to store
    pub rates: Vec<SeedRate>,
}

/// Seeded account
#[derive(Debug, Clone, Deserialize)]
pub struct SeedAccount {
    /// Account ID
    pub id: String,
    /// Currency code
    pub currency: String,
    /// Opening balance
    #[serde(deserialize_with = "lenient_decimal::deserialize")]
    pub balance: Decimal,
}

/// Seeded rate
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRate {
    /// Currency converted from
    pub base_currency: String,
    /// Currency converted to
    pub counter_currency: String,
    /// Multiplier
    #[serde(deserialize_with = "lenient_decimal::deserialize")]
    pub rate: Decimal,
}

impl Seed {
    /// Read a seed file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid seed file {:?}: {}", path, e)))
    }

    /// Build a state, enforcing the balance and rate invariants
    pub fn into_state(self) -> Result<LedgerState> {
        let mut state = LedgerState::empty();

        for account in self.accounts {
            let currency = Currency::new(&account.currency);
            state
                .apply_balance(&AccountId::new(account.id.clone()), account.balance, Some(&currency))
                .map_err(|reason| {
                    Error::Config(format!("Seed account {} rejected: {}", account.id, reason))
                })?;
        }

        for rate in self.rates {
            let base = Currency::new(&rate.base_currency);
            let counter = Currency::new(&rate.counter_currency);
            state.apply_rate(&base, &counter, rate.rate).map_err(|reason| {
                Error::Config(format!("Seed rate {}/{} rejected: {}", base, counter, reason))
            })?;
        }

        Ok(state)
    }
}

/// Persistence coordinator
#[derive(Debug)]
pub struct PersistenceCoordinator {
    path: PathBuf,
    format: SnapshotFormat,
    seed_file: Option<PathBuf>,
    assignment: Arc<WriterAssignment>,
    write_lock: Mutex<()>,
}

impl PersistenceCoordinator {
    /// Create a coordinator for the configured snapshot
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.snapshot_path(),
            format: config.snapshot_format,
            seed_file: config.seed_file.clone(),
            assignment: Arc::new(WriterAssignment::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Writer-role record
    pub fn assignment(&self) -> &Arc<WriterAssignment> {
        &self.assignment
    }

    /// Whether `worker` may persist
    pub fn is_writer(&self, worker: WorkerId) -> bool {
        self.assignment.is_writer(worker)
    }

    /// Snapshot file path
    pub fn snapshot_path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot has ever been written
    pub fn snapshot_exists(&self) -> bool {
        self.path.exists()
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Load the last durable state.
    ///
    /// Falls back to the seed file, then to an empty ledger, when no
    /// snapshot exists.
    pub fn load_snapshot(&self) -> Result<LedgerState> {
        let tmp = self.tmp_path();
        if tmp.exists() {
            tracing::warn!(path = ?tmp, "Discarding incomplete snapshot write");
            if let Err(e) = fs::remove_file(&tmp) {
                tracing::warn!(path = ?tmp, error = %e, "Could not remove incomplete snapshot");
            }
        }

        // Only a missing file falls back; an unreadable path is an error
        let missing = match fs::metadata(&self.path) {
            Ok(_) => false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        if missing {
            return match &self.seed_file {
                Some(seed) => {
                    let state = Seed::from_file(seed)?.into_state()?;
                    tracing::info!(
                        path = ?seed,
                        accounts = state.accounts.len(),
                        rates = state.rates.len(),
                        "No snapshot found, loaded seed"
                    );
                    Ok(state)
                }
                None => {
                    tracing::info!(path = ?self.path, "No snapshot found, starting empty");
                    Ok(LedgerState::empty())
                }
            };
        }

        let bytes = fs::read(&self.path)?;
        let snapshot: Snapshot = match self.format {
            SnapshotFormat::Json => serde_json::from_slice(&bytes)?,
            SnapshotFormat::Bincode => bincode::deserialize(&bytes)?,
        };
        snapshot.verify()?;

        tracing::info!(
            path = ?self.path,
            sequence = snapshot.sequence,
            accounts = snapshot.state.accounts.len(),
            rates = snapshot.state.rates.len(),
            "Snapshot loaded"
        );

        Ok(snapshot.state)
    }

    /// Durably write `state` on behalf of `worker`.
    ///
    /// Refuses with [`Error::NotWriter`] unless `worker` holds the writer
    /// role. I/O failures surface as [`Error::Persistence`]. Returns the
    /// persisted sequence.
    pub fn persist(&self, worker: WorkerId, state: &LedgerState) -> Result<u64> {
        let _guard = self.write_lock.lock();

        if !self.is_writer(worker) {
            return Err(Error::NotWriter(worker));
        }

        let snapshot = Snapshot::new(state.clone(), Some(worker))?;
        let bytes = match self.format {
            SnapshotFormat::Json => serde_json::to_vec(&snapshot)?,
            SnapshotFormat::Bincode => bincode::serialize(&snapshot)?,
        };

        self.write_atomic(&bytes).map_err(|e| {
            tracing::error!(path = ?self.path, error = %e, "Snapshot write failed");
            Error::Persistence(format!("writing {:?}: {}", self.path, e))
        })?;

        tracing::debug!(
            writer = %worker,
            sequence = snapshot.sequence,
            bytes = bytes.len(),
            "Snapshot persisted"
        );

        Ok(snapshot.sequence)
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}
