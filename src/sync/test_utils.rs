//! Fake collaborators for testing the sync engine.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use rusqlite::Connection;
use time::macros::date;
use tokio::sync::Notify;

use crate::{
    bank_connection::{BankConnectionId, NewBankConnection, create_bank_connection},
    category::CategoryMapper,
    credential::StoredCredentialProvider,
    db::initialize,
    source::{Credential, RawAccount, RawTransaction, SyncPage, TransactionSource},
    sync::{SyncConfig, SyncError, SyncOrchestrator},
};

/// A transaction source that replays a scripted list of responses.
///
/// Once the script runs out it returns empty pages that echo the requested cursor.
pub struct ScriptedSource {
    responses: Mutex<VecDeque<Result<SyncPage, SyncError>>>,
    requested_cursors: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

impl ScriptedSource {
    pub fn new(responses: Vec<Result<SyncPage, SyncError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requested_cursors: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Wait `delay` before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The cursors the source was called with, in order.
    pub fn requested_cursors(&self) -> Vec<Option<String>> {
        self.requested_cursors.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionSource for ScriptedSource {
    async fn fetch_page(
        &self,
        _credential: &Credential,
        cursor: Option<&str>,
    ) -> Result<SyncPage, SyncError> {
        self.requested_cursors
            .lock()
            .unwrap()
            .push(cursor.map(str::to_owned));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().unwrap().pop_front();

        next.unwrap_or_else(|| {
            Ok(SyncPage {
                next_cursor: cursor.unwrap_or_default().to_owned(),
                ..Default::default()
            })
        })
    }
}

/// A transaction source that blocks until released, for testing overlapping syncs.
#[derive(Default)]
pub struct GatedSource {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl TransactionSource for GatedSource {
    async fn fetch_page(
        &self,
        _credential: &Credential,
        cursor: Option<&str>,
    ) -> Result<SyncPage, SyncError> {
        self.started.notify_one();
        self.release.notified().await;

        Ok(SyncPage {
            next_cursor: format!("{}-next", cursor.unwrap_or("start")),
            ..Default::default()
        })
    }
}

/// A page with settled transactions `external_ids` in account "acc-1".
pub fn page(external_ids: &[&str], next_cursor: &str, has_more: bool) -> SyncPage {
    SyncPage {
        accounts: vec![account("acc-1")],
        added: external_ids
            .iter()
            .map(|external_id| transaction(external_id, -10.0, false))
            .collect(),
        next_cursor: next_cursor.to_owned(),
        has_more,
        ..Default::default()
    }
}

pub fn account(external_id: &str) -> RawAccount {
    RawAccount {
        external_id: external_id.to_owned(),
        name: "Business Checking".to_owned(),
        account_type: "depository".to_owned(),
        subtype: Some("checking".to_owned()),
        mask: Some("0000".to_owned()),
        current_balance: Some(1200.0),
        available_balance: Some(1150.0),
        currency: Some("USD".to_owned()),
    }
}

pub fn transaction(external_id: &str, amount: f64, pending: bool) -> RawTransaction {
    RawTransaction {
        external_id: external_id.to_owned(),
        account_external_id: "acc-1".to_owned(),
        amount,
        currency: Some("USD".to_owned()),
        date: date!(2025 - 05 - 20),
        description: "UBER TRIP 123".to_owned(),
        merchant_name: Some("Uber".to_owned()),
        category_tags: vec![],
        pending,
    }
}

/// Create an in-memory database with one active bank connection.
pub fn get_test_db() -> (Arc<Mutex<Connection>>, BankConnectionId) {
    let conn = Connection::open_in_memory().unwrap();
    initialize(&conn).unwrap();
    let bank_connection = create_bank_connection(
        &NewBankConnection {
            user_id: 1,
            external_id: "item-1".to_owned(),
            institution_name: "First Platypus Bank".to_owned(),
            access_credential: "access-sandbox-123".to_owned(),
            credential_expires_at: None,
        },
        &conn,
    )
    .unwrap();

    (Arc::new(Mutex::new(conn)), bank_connection.id)
}

/// Sync settings with short waits so tests run quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        deadline: Duration::from_secs(5),
        max_rate_limit_retries: 3,
        initial_backoff: Duration::from_millis(1),
    }
}

pub fn get_orchestrator(
    db_connection: Arc<Mutex<Connection>>,
    source: Arc<dyn TransactionSource>,
    config: SyncConfig,
) -> SyncOrchestrator {
    SyncOrchestrator::new(
        db_connection.clone(),
        source,
        Arc::new(StoredCredentialProvider::new(db_connection)),
        CategoryMapper::default(),
        config,
    )
}
