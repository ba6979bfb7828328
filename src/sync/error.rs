//! The error taxonomy of a sync run.

use std::{fmt::Display, str::FromStr};

use axum::http::StatusCode;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::{Error, bank_connection::BankConnectionId};

/// The ways a sync run can fail.
///
/// Sync errors never escape [crate::SyncOrchestrator::run_sync], they are
/// returned in the [crate::SyncResult] and recorded in the sync history.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SyncError {
    /// The credential is invalid or expired. Not retried automatically, the
    /// user has to re-authorize the connection.
    #[error("the connection must be re-authorized: {0}")]
    ReauthRequired(String),

    /// The external service is throttling requests. Retry later with the same cursor.
    #[error("rate limited by the external service: {0}")]
    RateLimited(String),

    /// The request failed or timed out. Retrying with the same cursor is safe.
    #[error("transient network error: {0}")]
    TransientNetworkError(String),

    /// The external service returned an error that cannot be classified.
    /// Not retried automatically.
    #[error("unexpected error from the external service: {0}")]
    UnknownExternalError(String),

    /// Another sync is running for the same connection.
    #[error("a sync is already running for connection {0}")]
    SyncInProgress(BankConnectionId),

    /// The connection does not exist.
    #[error("connection {0} does not exist")]
    ConnectionNotFound(BankConnectionId),

    /// The connection has been disconnected by the user.
    #[error("connection {0} has been deactivated")]
    ConnectionInactive(BankConnectionId),

    /// Reading or writing the ledger failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SyncError {
    /// The kind of the error, without its message.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::ReauthRequired(_) => SyncErrorKind::ReauthRequired,
            SyncError::RateLimited(_) => SyncErrorKind::RateLimited,
            SyncError::TransientNetworkError(_) => SyncErrorKind::TransientNetworkError,
            SyncError::UnknownExternalError(_) => SyncErrorKind::UnknownExternalError,
            SyncError::SyncInProgress(_) => SyncErrorKind::SyncInProgress,
            SyncError::ConnectionNotFound(_) => SyncErrorKind::ConnectionNotFound,
            SyncError::ConnectionInactive(_) => SyncErrorKind::ConnectionInactive,
            SyncError::Storage(_) => SyncErrorKind::Storage,
        }
    }

    /// The HTTP status to report this error with when a sync is triggered over HTTP.
    pub fn status_code(&self) -> StatusCode {
        match self {
            SyncError::ReauthRequired(_) => StatusCode::FORBIDDEN,
            SyncError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            SyncError::TransientNetworkError(_) | SyncError::UnknownExternalError(_) => {
                StatusCode::BAD_GATEWAY
            }
            SyncError::SyncInProgress(_) | SyncError::ConnectionInactive(_) => {
                StatusCode::CONFLICT
            }
            SyncError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for SyncError {
    fn from(error: Error) -> Self {
        SyncError::Storage(error.to_string())
    }
}

/// The kind of a [SyncError], as stored in the sync history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// See [SyncError::ReauthRequired].
    ReauthRequired,
    /// See [SyncError::RateLimited].
    RateLimited,
    /// See [SyncError::TransientNetworkError].
    TransientNetworkError,
    /// See [SyncError::UnknownExternalError].
    UnknownExternalError,
    /// See [SyncError::SyncInProgress].
    SyncInProgress,
    /// See [SyncError::ConnectionNotFound].
    ConnectionNotFound,
    /// See [SyncError::ConnectionInactive].
    ConnectionInactive,
    /// See [SyncError::Storage].
    Storage,
}

impl SyncErrorKind {
    /// Whether a later run with the same cursor is expected to succeed
    /// without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::RateLimited | SyncErrorKind::TransientNetworkError
        )
    }

    /// The name of the kind as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::ReauthRequired => "reauth_required",
            SyncErrorKind::RateLimited => "rate_limited",
            SyncErrorKind::TransientNetworkError => "transient_network_error",
            SyncErrorKind::UnknownExternalError => "unknown_external_error",
            SyncErrorKind::SyncInProgress => "sync_in_progress",
            SyncErrorKind::ConnectionNotFound => "connection_not_found",
            SyncErrorKind::ConnectionInactive => "connection_inactive",
            SyncErrorKind::Storage => "storage",
        }
    }
}

impl FromStr for SyncErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reauth_required" => Ok(SyncErrorKind::ReauthRequired),
            "rate_limited" => Ok(SyncErrorKind::RateLimited),
            "transient_network_error" => Ok(SyncErrorKind::TransientNetworkError),
            "unknown_external_error" => Ok(SyncErrorKind::UnknownExternalError),
            "sync_in_progress" => Ok(SyncErrorKind::SyncInProgress),
            "connection_not_found" => Ok(SyncErrorKind::ConnectionNotFound),
            "connection_inactive" => Ok(SyncErrorKind::ConnectionInactive),
            "storage" => Ok(SyncErrorKind::Storage),
            other => Err(format!("unknown sync error kind \"{other}\"")),
        }
    }
}

impl Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SyncErrorKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SyncErrorKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|error: String| FromSqlError::Other(error.into()))
    }
}
