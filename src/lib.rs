//! Expense Sync keeps a small-business expense ledger in step with the
//! transactions reported by a bank-data aggregator or payment processor.
//!
//! Each linked bank connection is synced page by page from its stored cursor.
//! External transactions are mapped to internal categories, upserted into the
//! ledger keyed by their external ID, and every settled transaction gets
//! exactly one expense. Every sync run is recorded in an append-only history.
//!
//! This library provides the sync engine, a periodic scheduler and a small
//! JSON API for triggering syncs and reading the sync history.

#![warn(missing_docs)]

use std::{net::SocketAddr, time::Duration};

use axum_server::Handle;
use tokio::signal;

mod account;
mod aggregator;
mod app_state;
mod bank_connection;
mod category;
mod credential;
mod database_id;
mod db;
mod endpoints;
mod error;
mod expense;
mod ledger;
mod logging;
mod routing;
mod scheduler;
mod source;
mod sync;

pub use account::{
    Account, AccountId, ensure_account, get_accounts_for_connection, upsert_account,
};
pub use aggregator::{AggregatorClient, AggregatorConfig, classify_error};
pub use app_state::AppState;
pub use bank_connection::{
    BankConnection, BankConnectionId, NewBankConnection, UserId, create_bank_connection,
    deactivate_bank_connection, get_bank_connection, get_syncable_bank_connections,
};
pub use category::{CategoryMapper, CategoryName, CategoryRules, KeywordRule};
pub use credential::StoredCredentialProvider;
pub use database_id::{DatabaseId, TransactionId};
pub use db::initialize as initialize_db;
pub use endpoints::format_endpoint;
pub use error::Error;
pub use expense::{
    Expense, ExpenseId, ExpenseSink, NewExpense, SqliteExpenseStore, count_expenses, get_expenses,
};
pub use ledger::{
    LedgerEntry, LedgerTransaction, SyncStatus, UpsertOutcome, count_transactions,
    get_transaction_by_external_id, mark_removed, upsert_transaction,
};
pub use logging::{LOG_BODY_LENGTH_LIMIT, logging_middleware};
pub use routing::build_router;
pub use scheduler::{spawn_scheduler, sync_due_connections};
pub use source::{
    Credential, CredentialProvider, RawAccount, RawTransaction, RemovedTransaction, SyncPage,
    TransactionSource,
};
pub use sync::{
    SyncConfig, SyncError, SyncErrorKind, SyncHistoryEntry, SyncOrchestrator, SyncResult,
    SyncTrigger, SyncType,
};

/// An async task that waits for either the ctrl+c or terminate signal, whichever comes first, and
/// then signals the server to shut down gracefully.
///
/// `handle` is a handle to an Axum `Server`.
pub async fn graceful_shutdown(handle: Handle<SocketAddr>) {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!("failed to install signal handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::debug!("Received ctrl+c signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
        _ = terminate => {
            tracing::debug!("Received terminate signal.");
            handle.graceful_shutdown(Some(Duration::from_secs(1)));
        },
    }
}
