//! Supplies access credentials from the bank connection table.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use time::OffsetDateTime;

use crate::{
    Error,
    bank_connection::{BankConnectionId, get_bank_connection},
    source::{Credential, CredentialProvider},
    sync::SyncError,
};

/// Hands out the credential stored on the bank connection row.
///
/// The credential is only handed out while it can still be used: the
/// connection must be active, not flagged for re-authorization, and the
/// credential must not have expired.
#[derive(Debug, Clone)]
pub struct StoredCredentialProvider {
    db_connection: Arc<Mutex<Connection>>,
}

impl StoredCredentialProvider {
    /// Create a provider that reads from `db_connection`.
    pub fn new(db_connection: Arc<Mutex<Connection>>) -> Self {
        Self { db_connection }
    }
}

#[async_trait]
impl CredentialProvider for StoredCredentialProvider {
    async fn get_valid_credential(
        &self,
        connection_id: BankConnectionId,
    ) -> Result<Credential, SyncError> {
        let bank_connection = {
            let connection = self
                .db_connection
                .lock()
                .map_err(|_| SyncError::from(Error::DatabaseLockError))?;

            get_bank_connection(connection_id, &connection)
        }
        .map_err(|error| match error {
            Error::NotFound => SyncError::ConnectionNotFound(connection_id),
            error => error.into(),
        })?;

        if !bank_connection.is_active {
            return Err(SyncError::ConnectionInactive(connection_id));
        }

        if bank_connection.needs_reauth {
            return Err(SyncError::ReauthRequired(
                "the connection is waiting to be re-authorized".to_owned(),
            ));
        }

        if let Some(expires_at) = bank_connection.credential_expires_at
            && expires_at <= OffsetDateTime::now_utc()
        {
            return Err(SyncError::ReauthRequired(format!(
                "the access credential expired at {expires_at}"
            )));
        }

        Ok(Credential::new(bank_connection.access_credential))
    }
}
