//! Database setup.

use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::{
    Error, account::create_account_table, bank_connection::create_bank_connection_table,
    expense::create_expense_table, ledger::create_ledger_transaction_table,
    sync::create_sync_history_table,
};

/// Create the tables for the domain models if they do not exist.
///
/// Foreign key enforcement is switched on for `connection`.
///
/// # Errors
/// Returns an [Error::SqlError] if the tables cannot be created.
pub fn initialize(connection: &Connection) -> Result<(), Error> {
    connection.pragma_update(None, "foreign_keys", true)?;

    let transaction = Transaction::new_unchecked(connection, TransactionBehavior::Exclusive)?;

    create_bank_connection_table(&transaction)?;
    create_account_table(&transaction)?;
    create_ledger_transaction_table(&transaction)?;
    create_expense_table(&transaction)?;
    create_sync_history_table(&transaction)?;

    transaction.commit()?;

    Ok(())
}
