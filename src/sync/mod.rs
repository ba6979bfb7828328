//! The sync engine: runs reconciliation passes against an external
//! transaction source and keeps an audit log of every run.

mod endpoints;
mod error;
mod history;
mod lock;
mod orchestrator;

#[cfg(test)]
pub(crate) mod test_utils;

pub use endpoints::{get_sync_history_endpoint, sync_connection_endpoint};
pub use error::{SyncError, SyncErrorKind};
pub use history::{SyncHistoryEntry, SyncType, create_sync_history_table};
pub use orchestrator::{SyncConfig, SyncOrchestrator, SyncResult, SyncTrigger};
