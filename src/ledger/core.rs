//! Defines the ledger data models and the queries that read them.

use std::fmt::Display;

use rusqlite::{
    Connection, OptionalExtension, Row,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef},
};
use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::{
    Error,
    account::AccountId,
    bank_connection::BankConnectionId,
    category::CategoryName,
    database_id::TransactionId,
    expense::ExpenseId,
    source::RawTransaction,
};

// ============================================================================
// MODELS
// ============================================================================

/// Whether the external service still reports a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The transaction exists in the external service.
    Synced,
    /// The external service reported the transaction as removed. The row is
    /// kept for the audit trail.
    Removed,
}

impl SyncStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Removed => "removed",
        }
    }
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SyncStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "synced" => Ok(SyncStatus::Synced),
            "removed" => Ok(SyncStatus::Removed),
            other => Err(FromSqlError::Other(
                format!("invalid sync status \"{other}\"").into(),
            )),
        }
    }
}

/// A transaction imported from an external service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerTransaction {
    /// The ID of the transaction.
    pub id: TransactionId,
    /// The account the transaction belongs to.
    pub account_id: AccountId,
    /// The transaction ID used by the external service.
    pub external_id: String,
    /// The signed amount, negative values are money leaving the account.
    pub amount: f64,
    /// The ISO currency code.
    pub currency: Option<String>,
    /// When the transaction happened.
    pub date: Date,
    /// The raw description from the statement.
    pub description: String,
    /// The merchant name, if the external service could determine it.
    pub merchant_name: Option<String>,
    /// The external category tags, in the order the external service sent them.
    pub category_tags: Vec<String>,
    /// The internal category the transaction was mapped to.
    pub category: CategoryName,
    /// Whether the transaction has not settled yet.
    pub pending: bool,
    /// Whether the external service still reports the transaction.
    pub status: SyncStatus,
    /// The expense created for the transaction once it settled.
    pub expense_id: Option<ExpenseId>,
    /// When the row was last written.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The mutable fields of a ledger transaction, i.e. an external record after
/// category mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    /// The account the transaction belongs to.
    pub account_id: AccountId,
    /// The transaction ID used by the external service.
    pub external_id: String,
    /// The signed amount, negative values are money leaving the account.
    pub amount: f64,
    /// The ISO currency code.
    pub currency: Option<String>,
    /// When the transaction happened.
    pub date: Date,
    /// The raw description from the statement.
    pub description: String,
    /// The merchant name, if the external service could determine it.
    pub merchant_name: Option<String>,
    /// The external category tags.
    pub category_tags: Vec<String>,
    /// The internal category.
    pub category: CategoryName,
    /// Whether the transaction has not settled yet.
    pub pending: bool,
}

impl LedgerEntry {
    /// Create an entry for `raw` in the account `account_id`.
    pub fn from_raw(account_id: AccountId, raw: &RawTransaction, category: CategoryName) -> Self {
        Self {
            account_id,
            external_id: raw.external_id.clone(),
            amount: raw.amount,
            currency: raw.currency.clone(),
            date: raw.date,
            description: raw.description.clone(),
            merchant_name: raw.merchant_name.clone(),
            category_tags: raw.category_tags.clone(),
            category,
            pending: raw.pending,
        }
    }
}

impl LedgerTransaction {
    /// Whether writing `entry` would leave this row as it is.
    pub(super) fn matches(&self, entry: &LedgerEntry) -> bool {
        self.status == SyncStatus::Synced
            && self.account_id == entry.account_id
            && self.amount == entry.amount
            && self.currency == entry.currency
            && self.date == entry.date
            && self.description == entry.description
            && self.merchant_name == entry.merchant_name
            && self.category_tags == entry.category_tags
            && self.category == entry.category
            && self.pending == entry.pending
    }
}

// ============================================================================
// DATABASE FUNCTIONS
// ============================================================================

/// Create the ledger table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_ledger_transaction_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS ledger_transaction (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                external_id TEXT NOT NULL UNIQUE,
                amount REAL NOT NULL,
                currency TEXT,
                date TEXT NOT NULL,
                description TEXT NOT NULL,
                merchant_name TEXT,
                category_tags TEXT NOT NULL,
                category TEXT NOT NULL,
                pending INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'synced',
                expense_id INTEGER,
                updated_at TEXT NOT NULL,
                FOREIGN KEY(account_id) REFERENCES account(id) ON UPDATE CASCADE
                )",
        (),
    )?;

    // Speeds up the search for settled transactions without an expense.
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_ledger_transaction_account_expense
         ON ledger_transaction(account_id, expense_id)",
        (),
    )?;

    Ok(())
}

pub(super) const SELECT_COLUMNS: &str = "id, account_id, external_id, amount, currency, date, \
    description, merchant_name, category_tags, category, pending, status, expense_id, updated_at";

/// Map a database row to a [LedgerTransaction].
pub fn map_ledger_transaction_row(row: &Row) -> Result<LedgerTransaction, rusqlite::Error> {
    let raw_tags: String = row.get(8)?;
    let category_tags = serde_json::from_str(&raw_tags)
        .map_err(|error| rusqlite::Error::FromSqlConversionFailure(8, Type::Text, Box::new(error)))?;
    let raw_category: String = row.get(9)?;

    Ok(LedgerTransaction {
        id: row.get(0)?,
        account_id: row.get(1)?,
        external_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        date: row.get(5)?,
        description: row.get(6)?,
        merchant_name: row.get(7)?,
        category_tags,
        category: CategoryName::new_unchecked(&raw_category),
        pending: row.get(10)?,
        status: row.get(11)?,
        expense_id: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

pub(super) fn find_by_external_id(
    external_id: &str,
    connection: &Connection,
) -> Result<Option<LedgerTransaction>, rusqlite::Error> {
    connection
        .prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM ledger_transaction WHERE external_id = ?1"
        ))?
        .query_row([external_id], map_ledger_transaction_row)
        .optional()
}

/// Retrieve a ledger transaction by its external ID.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if there is no transaction with `external_id`,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn get_transaction_by_external_id(
    external_id: &str,
    connection: &Connection,
) -> Result<LedgerTransaction, Error> {
    find_by_external_id(external_id, connection)?.ok_or(Error::NotFound)
}

/// Retrieve the settled, non-removed transactions of a bank connection that
/// do not have an expense yet, oldest first.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_settled_unlinked_transactions(
    bank_connection_id: BankConnectionId,
    connection: &Connection,
) -> Result<Vec<LedgerTransaction>, Error> {
    connection
        .prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM ledger_transaction
             WHERE pending = 0
                AND status = 'synced'
                AND expense_id IS NULL
                AND account_id IN (SELECT id FROM account WHERE bank_connection_id = ?1)
             ORDER BY date ASC, id ASC"
        ))?
        .query_map([bank_connection_id], map_ledger_transaction_row)?
        .map(|maybe_transaction| maybe_transaction.map_err(Error::from))
        .collect()
}

/// Link a transaction to the expense created for it.
///
/// Returns `false` without changing anything if the transaction already has
/// an expense, a transaction is only ever linked once.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn link_expense(
    transaction_id: TransactionId,
    expense_id: ExpenseId,
    connection: &Connection,
) -> Result<bool, Error> {
    let rows_affected = connection.execute(
        "UPDATE ledger_transaction SET expense_id = ?1
         WHERE id = ?2 AND expense_id IS NULL",
        (expense_id, transaction_id),
    )?;

    Ok(rows_affected > 0)
}

/// Get the number of ledger transactions, including removed ones.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn count_transactions(connection: &Connection) -> Result<usize, Error> {
    connection
        .query_row("SELECT COUNT(id) FROM ledger_transaction;", [], |row| {
            // COUNT is never negative.
            row.get::<_, i64>(0).map(|count| count as usize)
        })
        .map_err(Error::from)
}
