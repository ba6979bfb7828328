use rusqlite::{Connection, OptionalExtension};

use crate::{
    Error, bank_connection::BankConnectionId, database_id::DatabaseId, source::RawAccount,
};

/// Database identifier for an account.
pub type AccountId = DatabaseId;

/// A bank account or credit card reported by a bank connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    /// The id for the account.
    pub id: AccountId,
    /// The connection the account was reported by.
    pub bank_connection_id: BankConnectionId,
    /// The account ID used by the external service, unique within the connection.
    pub external_id: String,
    /// The display name of the account.
    pub name: String,
    /// The account type, e.g. "depository" or "credit".
    pub account_type: String,
    /// The account subtype, e.g. "checking".
    pub subtype: Option<String>,
    /// The last four digits of the account number.
    pub mask: Option<String>,
    /// The cached current balance.
    pub current_balance: Option<f64>,
    /// The cached available balance.
    pub available_balance: Option<f64>,
    /// The ISO currency code of the balances.
    pub currency: Option<String>,
    /// Whether the account is still active, see [deactivate_accounts_for_connection].
    pub is_active: bool,
}

pub fn create_account_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS account (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            bank_connection_id INTEGER NOT NULL,
            external_id TEXT NOT NULL,
            name TEXT NOT NULL,
            account_type TEXT NOT NULL,
            subtype TEXT,
            mask TEXT,
            current_balance REAL,
            available_balance REAL,
            currency TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(bank_connection_id) REFERENCES bank_connection(id) ON UPDATE CASCADE,
            UNIQUE(bank_connection_id, external_id)
        )",
        (),
    )?;

    Ok(())
}

pub fn map_row_to_account(row: &rusqlite::Row) -> Result<Account, rusqlite::Error> {
    Ok(Account {
        id: row.get(0)?,
        bank_connection_id: row.get(1)?,
        external_id: row.get(2)?,
        name: row.get(3)?,
        account_type: row.get(4)?,
        subtype: row.get(5)?,
        mask: row.get(6)?,
        current_balance: row.get(7)?,
        available_balance: row.get(8)?,
        currency: row.get(9)?,
        is_active: row.get(10)?,
    })
}

/// Insert or update an account from the metadata reported by the external service.
///
/// Balances and names are overwritten with the latest values. A previously
/// deactivated account is reactivated, since the service reported it again.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn upsert_account(
    bank_connection_id: BankConnectionId,
    raw_account: &RawAccount,
    connection: &Connection,
) -> Result<Account, Error> {
    connection
        .prepare(
            "INSERT INTO account (bank_connection_id, external_id, name, account_type, subtype,
                 mask, current_balance, available_balance, currency, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1)
             ON CONFLICT(bank_connection_id, external_id) DO UPDATE SET
                 name = excluded.name,
                 account_type = excluded.account_type,
                 subtype = excluded.subtype,
                 mask = excluded.mask,
                 current_balance = excluded.current_balance,
                 available_balance = excluded.available_balance,
                 currency = excluded.currency,
                 is_active = 1
             RETURNING id, bank_connection_id, external_id, name, account_type, subtype,
                 mask, current_balance, available_balance, currency, is_active",
        )?
        .query_row(
            (
                bank_connection_id,
                &raw_account.external_id,
                &raw_account.name,
                &raw_account.account_type,
                &raw_account.subtype,
                &raw_account.mask,
                raw_account.current_balance,
                raw_account.available_balance,
                &raw_account.currency,
            ),
            map_row_to_account,
        )
        .map_err(Error::from)
}

/// Get the ID of the account with `external_id`, creating a placeholder
/// account if the external service never described it.
///
/// The placeholder is named after the external ID and is filled in by
/// [upsert_account] once the service reports the account metadata.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn ensure_account(
    bank_connection_id: BankConnectionId,
    external_id: &str,
    connection: &Connection,
) -> Result<AccountId, Error> {
    let existing = connection
        .prepare("SELECT id FROM account WHERE bank_connection_id = ?1 AND external_id = ?2")?
        .query_row((bank_connection_id, external_id), |row| row.get(0))
        .optional()?;

    if let Some(account_id) = existing {
        return Ok(account_id);
    }

    tracing::debug!(
        "Creating placeholder account for unknown account {external_id} on connection {bank_connection_id}"
    );

    connection
        .prepare(
            "INSERT INTO account (bank_connection_id, external_id, name, account_type, is_active)
             VALUES (?1, ?2, ?2, 'unknown', 1)
             RETURNING id",
        )?
        .query_row((bank_connection_id, external_id), |row| row.get(0))
        .map_err(Error::from)
}

/// Get all accounts, active or not, that belong to a bank connection.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn get_accounts_for_connection(
    bank_connection_id: BankConnectionId,
    connection: &Connection,
) -> Result<Vec<Account>, Error> {
    connection
        .prepare(
            "SELECT id, bank_connection_id, external_id, name, account_type, subtype,
                 mask, current_balance, available_balance, currency, is_active
             FROM account WHERE bank_connection_id = ?1 ORDER BY id ASC",
        )?
        .query_map([bank_connection_id], map_row_to_account)?
        .map(|maybe_account| maybe_account.map_err(|error| error.into()))
        .collect()
}

/// Deactivate every account that belongs to a bank connection.
///
/// # Errors
/// Returns an [Error::SqlError] if there is an SQL error.
pub fn deactivate_accounts_for_connection(
    bank_connection_id: BankConnectionId,
    connection: &Connection,
) -> Result<usize, Error> {
    connection
        .execute(
            "UPDATE account SET is_active = 0 WHERE bank_connection_id = ?1",
            [bank_connection_id],
        )
        .map_err(Error::from)
}
