mod error;
mod ledger;
pub mod overlap;
mod queries;
mod registry;
mod store;

pub use error::EngineError;
pub use overlap::OverlapPolicy;
pub use queries::{calendar_events, member_summaries, weekend_days};
pub use store::LedgerStore;

use std::io;
use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tracing::{info, warn};

use crate::model::Event;
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub overlap: OverlapPolicy,
    /// Registering an existing name fails with `DuplicateMember` instead of
    /// overwriting it.
    pub reject_duplicate_members: bool,
    /// Rewrite the WAL after this many appends. 0 disables compaction.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overlap: OverlapPolicy::default(),
            reject_duplicate_members: false,
            compact_threshold: 1000,
        }
    }
}

/// Owns the member registry and the request ledger.
///
/// Every mutation holds the store write lock from its availability checks
/// through WAL append and apply, so mutations are serialized and readers never
/// see half of one.
pub struct Engine {
    store: RwLock<LedgerStore>,
    wal: Mutex<Wal>,
    config: EngineConfig,
}

impl Engine {
    /// Load the ledger from the WAL at `wal_path`, creating it if missing.
    pub fn open(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let mut store = LedgerStore::new();
        for event in &events {
            store.apply(event);
        }
        info!(
            "ledger loaded from {}: {} events, {} members, {} requests, {} holidays",
            wal_path.display(),
            events.len(),
            store.member_count(),
            store.request_count(),
            store.holiday_count()
        );

        Ok(Self {
            store: RwLock::new(store),
            wal: Mutex::new(wal),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared view of the store for read projections.
    pub async fn read(&self) -> RwLockReadGuard<'_, LedgerStore> {
        self.store.read().await
    }

    /// WAL-append then apply. The caller holds the store write lock, so a
    /// failed append leaves memory untouched.
    pub(super) async fn persist_and_apply(
        &self,
        store: &mut LedgerStore,
        event: Event,
    ) -> Result<(), EngineError> {
        let mut wal = self.wal.lock().await;
        let started = Instant::now();
        wal.append(&event)
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::histogram!(crate::observability::WAL_APPEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        store.apply(&event);

        let threshold = self.config.compact_threshold;
        if threshold > 0 && wal.appends_since_compact() >= threshold {
            let snapshot = store.snapshot_events();
            match wal.compact(&snapshot) {
                Ok(()) => {
                    info!("compacted {} to {} events", wal.path().display(), snapshot.len());
                    metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
                }
                // The append above is already durable; compaction is retried next time.
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
        Ok(())
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let store = self.store.write().await;
        let snapshot = store.snapshot_events();
        let mut wal = self.wal.lock().await;
        wal.compact(&snapshot)
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.lock().await.appends_since_compact()
    }
}
