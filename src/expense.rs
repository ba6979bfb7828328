//! Expense records created for settled ledger transactions.
//!
//! Expenses belong to the expense tracking side of the application, the sync
//! engine only ever creates them through an [ExpenseSink].

use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use time::{Date, OffsetDateTime};

use crate::{
    Error,
    category::CategoryName,
    database_id::{DatabaseId, TransactionId},
    ledger::LedgerTransaction,
};

/// Database identifier for an expense.
pub type ExpenseId = DatabaseId;

/// The data needed to create an expense for a settled transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExpense {
    /// The ledger transaction the expense was created for.
    pub transaction_id: TransactionId,
    /// The amount spent or received.
    pub amount: f64,
    /// The internal category of the transaction.
    pub category: CategoryName,
    /// Who was paid, the merchant name if known or else the raw description.
    pub vendor: String,
    /// When the transaction happened.
    pub date: Date,
}

impl NewExpense {
    /// Build the expense for a settled ledger transaction.
    pub fn for_transaction(transaction: &LedgerTransaction) -> Self {
        let vendor = transaction
            .merchant_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| transaction.description.clone());

        Self {
            transaction_id: transaction.id,
            amount: transaction.amount,
            category: transaction.category.clone(),
            vendor,
            date: transaction.date,
        }
    }
}

/// An expense record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expense {
    /// The ID of the expense.
    pub id: ExpenseId,
    /// The ledger transaction the expense was created for.
    pub transaction_id: TransactionId,
    /// The amount spent or received.
    pub amount: f64,
    /// The internal category.
    pub category: CategoryName,
    /// Who was paid.
    pub vendor: String,
    /// When the transaction happened.
    pub date: Date,
}

/// Where the sync engine writes expenses for settled transactions.
///
/// Both methods receive the connection of the ledger transaction that is being
/// applied, so an expense is committed together with its ledger link.
pub trait ExpenseSink: Send + Sync {
    /// Create an expense and return its ID.
    ///
    /// # Errors
    /// Implementations should return [Error::DuplicateExpense] if an expense
    /// already exists for the transaction.
    fn create_expense(
        &self,
        expense: &NewExpense,
        connection: &Connection,
    ) -> Result<ExpenseId, Error>;

    /// Find the expense that was created for a transaction, if any.
    ///
    /// # Errors
    /// Returns an [Error::SqlError] if there is an SQL error.
    fn find_expense_for_transaction(
        &self,
        transaction_id: TransactionId,
        connection: &Connection,
    ) -> Result<Option<ExpenseId>, Error>;
}

/// Stores expenses in the `expense` table of the application database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteExpenseStore;

impl ExpenseSink for SqliteExpenseStore {
    fn create_expense(
        &self,
        expense: &NewExpense,
        connection: &Connection,
    ) -> Result<ExpenseId, Error> {
        connection
            .prepare(
                "INSERT INTO expense (transaction_id, amount, category, vendor, date, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 RETURNING id",
            )?
            .query_row(
                (
                    expense.transaction_id,
                    expense.amount,
                    expense.category.as_ref(),
                    &expense.vendor,
                    expense.date,
                    OffsetDateTime::now_utc(),
                ),
                |row| row.get(0),
            )
            .map_err(Error::from)
    }

    fn find_expense_for_transaction(
        &self,
        transaction_id: TransactionId,
        connection: &Connection,
    ) -> Result<Option<ExpenseId>, Error> {
        connection
            .prepare("SELECT id FROM expense WHERE transaction_id = ?1")?
            .query_row([transaction_id], |row| row.get(0))
            .optional()
            .map_err(Error::from)
    }
}

/// Create the expense table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_expense_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    // The unique transaction ID backs up the linkage check done during a sync.
    connection.execute(
        "CREATE TABLE IF NOT EXISTS expense (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transaction_id INTEGER NOT NULL UNIQUE,
                amount REAL NOT NULL,
                category TEXT NOT NULL,
                vendor TEXT NOT NULL,
                date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY(transaction_id) REFERENCES ledger_transaction(id) ON UPDATE CASCADE
                )",
        (),
    )?;

    Ok(())
}

fn map_expense_row(row: &Row) -> Result<Expense, rusqlite::Error> {
    let raw_category: String = row.get(3)?;

    Ok(Expense {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        amount: row.get(2)?,
        category: CategoryName::new_unchecked(&raw_category),
        vendor: row.get(4)?,
        date: row.get(5)?,
    })
}

/// Retrieve every expense, ordered by ID.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_expenses(connection: &Connection) -> Result<Vec<Expense>, Error> {
    connection
        .prepare(
            "SELECT id, transaction_id, amount, category, vendor, date
             FROM expense ORDER BY id ASC",
        )?
        .query_map([], map_expense_row)?
        .map(|maybe_expense| maybe_expense.map_err(Error::from))
        .collect()
}

/// Get the number of expenses.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn count_expenses(connection: &Connection) -> Result<usize, Error> {
    connection
        .query_row("SELECT COUNT(id) FROM expense;", [], |row| {
            row.get::<_, i64>(0).map(|count| count as usize)
        })
        .map_err(Error::from)
}
