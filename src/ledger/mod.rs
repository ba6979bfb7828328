//! The transaction ledger: one row per external transaction ID.
//!
//! Rows are never deleted. Transactions the external service no longer
//! reports are marked as removed, and settled transactions are linked to the
//! expense created for them.

mod core;
mod upsert;

pub use core::{
    LedgerEntry, LedgerTransaction, SyncStatus, count_transactions,
    create_ledger_transaction_table, get_settled_unlinked_transactions,
    get_transaction_by_external_id, link_expense,
};
pub use upsert::{UpsertOutcome, mark_removed, upsert_transaction};
