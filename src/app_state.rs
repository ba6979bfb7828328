//! Implements a struct that holds the state of the REST server.

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::{
    Error,
    category::CategoryMapper,
    credential::StoredCredentialProvider,
    db::initialize,
    source::TransactionSource,
    sync::{SyncConfig, SyncOrchestrator},
};

/// The state of the REST server.
#[derive(Clone)]
pub struct AppState {
    /// The database connection
    pub db_connection: Arc<Mutex<Connection>>,

    /// Runs syncs against the external transaction source.
    pub orchestrator: SyncOrchestrator,
}

impl AppState {
    /// Create a new [AppState] with a SQLite database connection.
    ///
    /// This function will initialize the database by adding the tables for the
    /// domain models. Credentials are read from the bank connection table.
    ///
    /// # Errors
    /// Returns an error if the database cannot be initialized.
    pub fn new(
        db_connection: Connection,
        source: Arc<dyn TransactionSource>,
        category_mapper: CategoryMapper,
        sync_config: SyncConfig,
    ) -> Result<Self, Error> {
        initialize(&db_connection)?;

        let db_connection = Arc::new(Mutex::new(db_connection));
        let credentials = Arc::new(StoredCredentialProvider::new(db_connection.clone()));
        let orchestrator = SyncOrchestrator::new(
            db_connection.clone(),
            source,
            credentials,
            category_mapper,
            sync_config,
        );

        Ok(Self {
            db_connection,
            orchestrator,
        })
    }
}
