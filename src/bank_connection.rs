//! The connection store: one row per linked aggregator item or payment processor account.
//!
//! A bank connection holds the opaque access credential issued by the external
//! service, the sync cursor that marks how far the ledger has been synced, and
//! the outcome of the most recent sync.

use rusqlite::{Connection, Row};
use time::OffsetDateTime;

use crate::{Error, account::deactivate_accounts_for_connection, database_id::DatabaseId};

/// Database identifier for a bank connection.
pub type BankConnectionId = DatabaseId;

/// Identifier of the user that owns a bank connection.
pub type UserId = DatabaseId;

/// A linkage between a user and an external account provider.
///
/// Connections are never deleted while the ledger references them, instead
/// they are deactivated with [deactivate_bank_connection].
#[derive(Debug, Clone, PartialEq)]
pub struct BankConnection {
    /// The ID of the connection.
    pub id: BankConnectionId,
    /// The user that linked the external account.
    pub user_id: UserId,
    /// The aggregator item or processor account ID.
    pub external_id: String,
    /// The display name of the bank or payment processor.
    pub institution_name: String,
    /// The encrypted access credential. The sync engine never interprets it.
    pub access_credential: String,
    /// When the access credential stops being valid, if known.
    pub credential_expires_at: Option<OffsetDateTime>,
    /// The continuation token for incremental syncs, `None` before the first sync.
    pub cursor: Option<String>,
    /// Whether the connection is still linked.
    pub is_active: bool,
    /// Set when the external service rejected the credential and the user
    /// must re-authorize the connection.
    pub needs_reauth: bool,
    /// When the last successful sync finished. Failed syncs leave it alone.
    pub last_synced_at: Option<OffsetDateTime>,
    /// The error message of the last failed sync, cleared by a successful sync.
    pub last_sync_error: Option<String>,
    /// When the last sync finished, whether it succeeded or not.
    pub last_attempted_at: Option<OffsetDateTime>,
}

/// The data needed to create a bank connection after a successful
/// authorization handshake with the external service.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBankConnection {
    /// The user that linked the external account.
    pub user_id: UserId,
    /// The aggregator item or processor account ID.
    pub external_id: String,
    /// The display name of the bank or payment processor.
    pub institution_name: String,
    /// The encrypted access credential.
    pub access_credential: String,
    /// When the access credential stops being valid, if known.
    pub credential_expires_at: Option<OffsetDateTime>,
}

/// Create a bank connection, or re-authorize the existing active connection
/// for the same user and external item.
///
/// There is at most one active connection per (user, external item) pair.
/// Linking the same item again replaces the credential on the active row,
/// keeps its cursor, and clears any re-authorization flag.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn create_bank_connection(
    new_connection: &NewBankConnection,
    connection: &Connection,
) -> Result<BankConnection, Error> {
    connection
        .prepare(
            "INSERT INTO bank_connection
                (user_id, external_id, institution_name, access_credential,
                 credential_expires_at, is_active, needs_reauth, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, ?6)
             ON CONFLICT(user_id, external_id) WHERE is_active = 1 DO UPDATE SET
                 institution_name = excluded.institution_name,
                 access_credential = excluded.access_credential,
                 credential_expires_at = excluded.credential_expires_at,
                 needs_reauth = 0,
                 last_sync_error = NULL
             RETURNING id, user_id, external_id, institution_name, access_credential,
                 credential_expires_at, cursor, is_active, needs_reauth,
                 last_synced_at, last_sync_error, last_attempted_at",
        )?
        .query_row(
            (
                new_connection.user_id,
                &new_connection.external_id,
                &new_connection.institution_name,
                &new_connection.access_credential,
                new_connection.credential_expires_at,
                OffsetDateTime::now_utc(),
            ),
            map_bank_connection_row,
        )
        .map_err(Error::from)
}

/// Retrieve a bank connection by its `id`.
///
/// # Errors
/// This function will return a:
/// - [Error::NotFound] if `id` does not refer to a bank connection,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn get_bank_connection(
    id: BankConnectionId,
    connection: &Connection,
) -> Result<BankConnection, Error> {
    connection
        .prepare(
            "SELECT id, user_id, external_id, institution_name, access_credential,
                credential_expires_at, cursor, is_active, needs_reauth,
                last_synced_at, last_sync_error, last_attempted_at
             FROM bank_connection WHERE id = :id",
        )?
        .query_row(&[(":id", &id)], map_bank_connection_row)
        .map_err(Error::from)
}

/// Retrieve all active bank connections that do not need re-authorization,
/// i.e. the connections a scheduled sync should visit.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_syncable_bank_connections(connection: &Connection) -> Result<Vec<BankConnection>, Error> {
    connection
        .prepare(
            "SELECT id, user_id, external_id, institution_name, access_credential,
                credential_expires_at, cursor, is_active, needs_reauth,
                last_synced_at, last_sync_error, last_attempted_at
             FROM bank_connection
             WHERE is_active = 1 AND needs_reauth = 0
             ORDER BY id ASC",
        )?
        .query_map([], map_bank_connection_row)?
        .map(|maybe_connection| maybe_connection.map_err(Error::from))
        .collect()
}

/// Deactivate a bank connection and all of its accounts.
///
/// Ledger rows keep referencing the deactivated accounts, so nothing is deleted.
///
/// # Errors
/// This function will return a:
/// - [Error::UpdateMissingBankConnection] if `id` does not refer to a bank connection,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn deactivate_bank_connection(
    id: BankConnectionId,
    connection: &Connection,
) -> Result<(), Error> {
    let tx = connection.unchecked_transaction()?;

    let rows_affected = tx.execute(
        "UPDATE bank_connection SET is_active = 0 WHERE id = ?1",
        [id],
    )?;

    if rows_affected == 0 {
        return Err(Error::UpdateMissingBankConnection);
    }

    deactivate_accounts_for_connection(id, &tx)?;
    tx.commit()?;

    tracing::info!("Deactivated bank connection {id}");

    Ok(())
}

/// Persist the sync cursor for a bank connection.
///
/// # Errors
/// This function will return a:
/// - [Error::UpdateMissingBankConnection] if `id` does not refer to a bank connection,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn update_cursor(
    id: BankConnectionId,
    cursor: &str,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE bank_connection SET cursor = ?1 WHERE id = ?2",
        (cursor, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::UpdateMissingBankConnection);
    }

    Ok(())
}

/// Record a successful sync: set the last sync and attempt times and clear any
/// error or re-authorization flag.
///
/// # Errors
/// This function will return a:
/// - [Error::UpdateMissingBankConnection] if `id` does not refer to a bank connection,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn record_sync_success(
    id: BankConnectionId,
    synced_at: OffsetDateTime,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE bank_connection
         SET last_synced_at = ?1, last_attempted_at = ?1, last_sync_error = NULL,
             needs_reauth = 0
         WHERE id = ?2",
        (synced_at, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::UpdateMissingBankConnection);
    }

    Ok(())
}

/// Record a failed sync that finished at `attempted_at`.
///
/// The time of the last successful sync is kept.
///
/// `needs_reauth` only ever sets the flag, a later successful sync or a new
/// authorization handshake clears it.
///
/// # Errors
/// This function will return a:
/// - [Error::UpdateMissingBankConnection] if `id` does not refer to a bank connection,
/// - or [Error::SqlError] if there is some other SQL error.
pub fn record_sync_failure(
    id: BankConnectionId,
    error_message: &str,
    needs_reauth: bool,
    attempted_at: OffsetDateTime,
    connection: &Connection,
) -> Result<(), Error> {
    let rows_affected = connection.execute(
        "UPDATE bank_connection
         SET last_sync_error = ?1, needs_reauth = MAX(needs_reauth, ?2), last_attempted_at = ?3
         WHERE id = ?4",
        (error_message, needs_reauth, attempted_at, id),
    )?;

    if rows_affected == 0 {
        return Err(Error::UpdateMissingBankConnection);
    }

    Ok(())
}

/// Create the bank connection table in the database.
///
/// # Errors
/// Returns an error if the table cannot be created or if there is an SQL error.
pub fn create_bank_connection_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS bank_connection (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                external_id TEXT NOT NULL,
                institution_name TEXT NOT NULL,
                access_credential TEXT NOT NULL,
                credential_expires_at TEXT,
                cursor TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                needs_reauth INTEGER NOT NULL DEFAULT 0,
                last_synced_at TEXT,
                last_sync_error TEXT,
                last_attempted_at TEXT,
                created_at TEXT NOT NULL
                )",
        (),
    )?;

    // Only one active connection per user and external item, deactivated
    // connections stay around for the ledger rows that reference them.
    connection.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_bank_connection_active_item
         ON bank_connection(user_id, external_id) WHERE is_active = 1",
        (),
    )?;

    Ok(())
}

/// Map a database row to a [BankConnection].
pub fn map_bank_connection_row(row: &Row) -> Result<BankConnection, rusqlite::Error> {
    Ok(BankConnection {
        id: row.get(0)?,
        user_id: row.get(1)?,
        external_id: row.get(2)?,
        institution_name: row.get(3)?,
        access_credential: row.get(4)?,
        credential_expires_at: row.get(5)?,
        cursor: row.get(6)?,
        is_active: row.get(7)?,
        needs_reauth: row.get(8)?,
        last_synced_at: row.get(9)?,
        last_sync_error: row.get(10)?,
        last_attempted_at: row.get(11)?,
    })
}
