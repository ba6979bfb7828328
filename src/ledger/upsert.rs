//! Idempotent writes to the ledger.
//!
//! The external service delivers changes at least once, so every write here
//! must give the same ledger state when it is repeated.

use rusqlite::Connection;
use time::OffsetDateTime;

use crate::{Error, account::AccountId, bank_connection::BankConnectionId};

use super::core::{LedgerEntry, find_by_external_id};

/// What [upsert_transaction] did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The external ID was unseen and a new row was inserted.
    Inserted,
    /// An existing row was changed.
    Updated,
    /// An existing row already held the same data, nothing was written.
    Unchanged,
    /// The external ID belongs to a row of another bank connection, nothing
    /// was written.
    Skipped,
}

impl UpsertOutcome {
    /// Whether the entry created a new ledger row.
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted)
    }
}

/// Insert `entry` if its external ID is unseen, otherwise update the existing
/// row in place.
///
/// Writing an identical entry twice is a no-op the second time. A row that was
/// marked as removed returns to synced when the external service delivers it
/// again. The expense link is never touched.
///
/// Rows are only ever written for the bank connection that owns the entry's
/// account. An external ID already stored under another connection's account
/// is skipped and logged.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error,
/// e.g. the account does not exist.
pub fn upsert_transaction(
    entry: &LedgerEntry,
    connection: &Connection,
) -> Result<UpsertOutcome, Error> {
    let category_tags = serde_json::to_string(&entry.category_tags)?;
    let now = OffsetDateTime::now_utc();

    match find_by_external_id(&entry.external_id, connection)? {
        None => {
            connection.execute(
                "INSERT INTO ledger_transaction (account_id, external_id, amount, currency, date,
                     description, merchant_name, category_tags, category, pending, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'synced', ?11)",
                (
                    entry.account_id,
                    &entry.external_id,
                    entry.amount,
                    &entry.currency,
                    entry.date,
                    &entry.description,
                    &entry.merchant_name,
                    &category_tags,
                    entry.category.as_ref(),
                    entry.pending,
                    now,
                ),
            )?;

            Ok(UpsertOutcome::Inserted)
        }
        Some(existing) => {
            if !same_bank_connection(existing.account_id, entry.account_id, connection)? {
                tracing::warn!(
                    "Skipping transaction {} since it is stored under the account {} of another bank connection",
                    entry.external_id,
                    existing.account_id
                );
                return Ok(UpsertOutcome::Skipped);
            }

            if existing.matches(entry) {
                return Ok(UpsertOutcome::Unchanged);
            }

            connection.execute(
                "UPDATE ledger_transaction SET
                     account_id = ?1, amount = ?2, currency = ?3, date = ?4, description = ?5,
                     merchant_name = ?6, category_tags = ?7, category = ?8, pending = ?9,
                     status = 'synced', updated_at = ?10
                 WHERE id = ?11",
                (
                    entry.account_id,
                    entry.amount,
                    &entry.currency,
                    entry.date,
                    &entry.description,
                    &entry.merchant_name,
                    &category_tags,
                    entry.category.as_ref(),
                    entry.pending,
                    now,
                    existing.id,
                ),
            )?;

            Ok(UpsertOutcome::Updated)
        }
    }
}

fn same_bank_connection(
    account_id: AccountId,
    other_account_id: AccountId,
    connection: &Connection,
) -> Result<bool, Error> {
    if account_id == other_account_id {
        return Ok(true);
    }

    let same = connection.query_row(
        "SELECT a.bank_connection_id = b.bank_connection_id
         FROM account a, account b
         WHERE a.id = ?1 AND b.id = ?2",
        (account_id, other_account_id),
        |row| row.get(0),
    )?;

    Ok(same)
}

/// Mark the transaction with `external_id` as removed.
///
/// Only transactions in accounts of `bank_connection_id` are affected.
/// Unknown and already removed transactions are left alone, since removal
/// notifications can arrive more than once or before the transaction itself.
///
/// Returns whether a row changed to removed.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn mark_removed(
    external_id: &str,
    bank_connection_id: BankConnectionId,
    connection: &Connection,
) -> Result<bool, Error> {
    let rows_affected = connection.execute(
        "UPDATE ledger_transaction SET status = 'removed', updated_at = ?1
         WHERE external_id = ?2
            AND status = 'synced'
            AND account_id IN (SELECT id FROM account WHERE bank_connection_id = ?3)",
        (OffsetDateTime::now_utc(), external_id, bank_connection_id),
    )?;

    Ok(rows_affected > 0)
}
