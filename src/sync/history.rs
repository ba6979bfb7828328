//! The append-only log of sync runs.
//!
//! Entries are only ever inserted and read, there is no way to change or
//! delete them through this module.

use rusqlite::{
    Connection, Row,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::{
    Error,
    bank_connection::BankConnectionId,
    database_id::DatabaseId,
    sync::{SyncError, SyncErrorKind, SyncTrigger},
};

/// Whether a sync run fetched the full history or continued from a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// The first sync of a connection, i.e. without a cursor.
    Initial,
    /// A scheduled sync that continued from the stored cursor.
    Incremental,
    /// A user triggered sync that continued from the stored cursor.
    Manual,
}

impl SyncType {
    /// The type of a run that starts from `cursor`.
    pub fn for_run(cursor: Option<&str>, trigger: SyncTrigger) -> Self {
        match (cursor, trigger) {
            (None, _) => SyncType::Initial,
            (Some(_), SyncTrigger::Manual) => SyncType::Manual,
            (Some(_), SyncTrigger::Scheduled) => SyncType::Incremental,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            SyncType::Initial => "initial",
            SyncType::Incremental => "incremental",
            SyncType::Manual => "manual",
        }
    }
}

impl ToSql for SyncType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "initial" => Ok(SyncType::Initial),
            "incremental" => Ok(SyncType::Incremental),
            "manual" => Ok(SyncType::Manual),
            other => Err(FromSqlError::Other(
                format!("invalid sync type \"{other}\"").into(),
            )),
        }
    }
}

/// The summary of a finished sync run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncHistoryEntry {
    pub bank_connection_id: BankConnectionId,
    pub sync_type: SyncType,
    pub added: u32,
    pub modified: u32,
    pub removed: u32,
    pub duration_ms: i64,
    pub error: Option<SyncError>,
    pub started_at: OffsetDateTime,
}

/// A recorded sync run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncHistoryEntry {
    /// The ID of the entry.
    pub id: DatabaseId,
    /// The connection that was synced.
    pub bank_connection_id: BankConnectionId,
    /// Whether the run was the first, a scheduled or a manual sync.
    pub sync_type: SyncType,
    /// The number of transactions that were inserted.
    pub added: u32,
    /// The number of transactions that were changed.
    pub modified: u32,
    /// The number of transactions that were marked as removed.
    pub removed: u32,
    /// How long the run took.
    pub duration_ms: i64,
    /// Whether the run finished without error.
    pub success: bool,
    /// The kind of error that stopped the run.
    pub error_kind: Option<SyncErrorKind>,
    /// The error message of a failed run.
    pub error: Option<String>,
    /// When the run started.
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

/// Record a sync run.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn append_sync_history(
    entry: &NewSyncHistoryEntry,
    connection: &Connection,
) -> Result<SyncHistoryEntry, Error> {
    connection
        .prepare(
            "INSERT INTO sync_history (bank_connection_id, sync_type, added, modified, removed,
                 duration_ms, success, error_kind, error, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             RETURNING id, bank_connection_id, sync_type, added, modified, removed,
                 duration_ms, success, error_kind, error, started_at",
        )?
        .query_row(
            (
                entry.bank_connection_id,
                entry.sync_type,
                entry.added,
                entry.modified,
                entry.removed,
                entry.duration_ms,
                entry.error.is_none(),
                entry.error.as_ref().map(SyncError::kind),
                entry.error.as_ref().map(|error| error.to_string()),
                entry.started_at,
            ),
            map_sync_history_row,
        )
        .map_err(Error::from)
}

/// Retrieve the sync runs of a bank connection, newest first.
///
/// # Errors
/// This function will return an [Error::SqlError] if there is an SQL error.
pub fn get_sync_history(
    bank_connection_id: BankConnectionId,
    connection: &Connection,
) -> Result<Vec<SyncHistoryEntry>, Error> {
    connection
        .prepare(
            "SELECT id, bank_connection_id, sync_type, added, modified, removed,
                 duration_ms, success, error_kind, error, started_at
             FROM sync_history
             WHERE bank_connection_id = ?1
             ORDER BY id DESC",
        )?
        .query_map([bank_connection_id], map_sync_history_row)?
        .map(|maybe_entry| maybe_entry.map_err(Error::from))
        .collect()
}

pub fn create_sync_history_table(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute(
        "CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bank_connection_id INTEGER NOT NULL,
                sync_type TEXT NOT NULL,
                added INTEGER NOT NULL,
                modified INTEGER NOT NULL,
                removed INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                success INTEGER NOT NULL,
                error_kind TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                FOREIGN KEY(bank_connection_id) REFERENCES bank_connection(id) ON UPDATE CASCADE
                )",
        (),
    )?;

    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_sync_history_connection
         ON sync_history(bank_connection_id)",
        (),
    )?;

    Ok(())
}

fn map_sync_history_row(row: &Row) -> Result<SyncHistoryEntry, rusqlite::Error> {
    Ok(SyncHistoryEntry {
        id: row.get(0)?,
        bank_connection_id: row.get(1)?,
        sync_type: row.get(2)?,
        added: row.get(3)?,
        modified: row.get(4)?,
        removed: row.get(5)?,
        duration_ms: row.get(6)?,
        success: row.get(7)?,
        error_kind: row.get(8)?,
        error: row.get(9)?,
        started_at: row.get(10)?,
    })
}
