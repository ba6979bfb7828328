//! In-process registry of the connections that are being synced.

use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};

use crate::bank_connection::BankConnectionId;

/// Tracks which bank connections have a sync in flight.
///
/// Acquisition never waits: a second sync for the same connection is
/// rejected rather than queued. Sufficient for a single process, several
/// server processes sharing one database would need a lock on the
/// connection row instead.
#[derive(Debug, Clone, Default)]
pub struct SyncLocks {
    in_flight: Arc<DashMap<BankConnectionId, ()>>,
}

impl SyncLocks {
    /// Try to take the lock for `bank_connection_id`.
    ///
    /// Returns `None` if another sync holds it. The lock is released when the
    /// returned guard is dropped.
    pub fn try_acquire(&self, bank_connection_id: BankConnectionId) -> Option<SyncLockGuard> {
        match self.in_flight.entry(bank_connection_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(());

                Some(SyncLockGuard {
                    in_flight: Arc::clone(&self.in_flight),
                    bank_connection_id,
                })
            }
        }
    }

    /// Whether a sync is running for `bank_connection_id`.
    pub fn is_locked(&self, bank_connection_id: BankConnectionId) -> bool {
        self.in_flight.contains_key(&bank_connection_id)
    }
}

/// Releases the lock of a connection when dropped.
#[derive(Debug)]
pub struct SyncLockGuard {
    in_flight: Arc<DashMap<BankConnectionId, ()>>,
    bank_connection_id: BankConnectionId,
}

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.bank_connection_id);
    }
}
