//! Drives one reconciliation pass for a bank connection.
//!
//! A run fetches pages of changes from the [TransactionSource] starting at the
//! stored cursor. Each page is applied in its own database transaction together
//! with the page's cursor, so a failed run keeps the pages it finished and the
//! next run resumes after the last of them.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use rusqlite::Connection;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::{
    Error,
    account::{ensure_account, upsert_account},
    bank_connection::{
        BankConnection, BankConnectionId, get_bank_connection, get_syncable_bank_connections,
        record_sync_failure, record_sync_success, update_cursor,
    },
    category::CategoryMapper,
    expense::{ExpenseSink, NewExpense, SqliteExpenseStore},
    ledger::{
        LedgerEntry, UpsertOutcome, get_settled_unlinked_transactions, link_expense,
        mark_removed, upsert_transaction,
    },
    source::{Credential, CredentialProvider, SyncPage, TransactionSource},
    sync::{
        SyncError,
        history::{self, NewSyncHistoryEntry, SyncHistoryEntry, SyncType, append_sync_history},
        lock::SyncLocks,
    },
};

/// Limits for a single sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    /// How long a run may take in total. A run that exceeds it fails with a
    /// [SyncError::TransientNetworkError].
    pub deadline: Duration,
    /// How many times a rate limited request is retried before the run fails.
    pub max_rate_limit_retries: u32,
    /// The wait before the first retry, doubled for each following retry.
    pub initial_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            max_rate_limit_retries: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The periodic scheduler.
    Scheduled,
    /// A user action.
    Manual,
}

/// The outcome of [SyncOrchestrator::run_sync].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    /// The connection that was synced.
    pub bank_connection_id: BankConnectionId,
    /// The type of the run, `None` if the run was rejected before it started.
    pub sync_type: Option<SyncType>,
    /// The number of transactions that were inserted.
    pub added: u32,
    /// The number of transactions that were changed.
    pub modified: u32,
    /// The number of transactions that were marked as removed.
    pub removed: u32,
    /// The number of expenses created for settled transactions.
    pub expenses_created: u32,
    /// Whether the run finished without error.
    pub success: bool,
    /// Why the run failed.
    pub error: Option<SyncError>,
    /// The stored cursor after the run.
    pub cursor: Option<String>,
    /// How long the run took.
    pub duration_ms: i64,
}

impl SyncResult {
    fn rejected(
        bank_connection_id: BankConnectionId,
        error: SyncError,
        start_time: Instant,
    ) -> Self {
        Self {
            bank_connection_id,
            sync_type: None,
            added: 0,
            modified: 0,
            removed: 0,
            expenses_created: 0,
            success: false,
            error: Some(error),
            cursor: None,
            duration_ms: elapsed_ms(start_time),
        }
    }
}

/// The counts accumulated over the pages of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct PageCounts {
    added: u32,
    modified: u32,
    removed: u32,
    expenses_created: u32,
}

impl PageCounts {
    fn add(&mut self, other: PageCounts) {
        self.added += other.added;
        self.modified += other.modified;
        self.removed += other.removed;
        self.expenses_created += other.expenses_created;
    }
}

#[derive(Debug)]
struct SyncProgress {
    counts: PageCounts,
    cursor: Option<String>,
}

/// Runs syncs for bank connections.
///
/// Cloning is cheap and clones share the database, the collaborators and the
/// set of running syncs.
#[derive(Clone)]
pub struct SyncOrchestrator {
    db_connection: Arc<Mutex<Connection>>,
    source: Arc<dyn TransactionSource>,
    credentials: Arc<dyn CredentialProvider>,
    expense_sink: Arc<dyn ExpenseSink>,
    category_mapper: Arc<CategoryMapper>,
    locks: SyncLocks,
    config: SyncConfig,
}

impl SyncOrchestrator {
    /// Create an orchestrator that writes expenses to the application database.
    pub fn new(
        db_connection: Arc<Mutex<Connection>>,
        source: Arc<dyn TransactionSource>,
        credentials: Arc<dyn CredentialProvider>,
        category_mapper: CategoryMapper,
        config: SyncConfig,
    ) -> Self {
        Self {
            db_connection,
            source,
            credentials,
            expense_sink: Arc::new(SqliteExpenseStore),
            category_mapper: Arc::new(category_mapper),
            locks: SyncLocks::default(),
            config,
        }
    }

    /// Replace the destination of the expenses created for settled transactions.
    pub fn with_expense_sink(mut self, expense_sink: Arc<dyn ExpenseSink>) -> Self {
        self.expense_sink = expense_sink;
        self
    }

    /// Run one sync for `bank_connection_id`.
    ///
    /// Errors do not escape, they are reported in the returned [SyncResult]
    /// and, for every run that got past the lock and found the connection, in
    /// the sync history. A second call for a connection that is already being
    /// synced is rejected with [SyncError::SyncInProgress].
    pub async fn run_sync(
        &self,
        bank_connection_id: BankConnectionId,
        trigger: SyncTrigger,
    ) -> SyncResult {
        let start_time = Instant::now();
        let started_at = OffsetDateTime::now_utc();

        let Some(_guard) = self.locks.try_acquire(bank_connection_id) else {
            tracing::warn!(
                "Rejected {trigger:?} sync of connection {bank_connection_id}: a sync is already running"
            );
            return SyncResult::rejected(
                bank_connection_id,
                SyncError::SyncInProgress(bank_connection_id),
                start_time,
            );
        };

        let bank_connection =
            match self.with_db(|connection| get_bank_connection(bank_connection_id, connection)) {
                Ok(bank_connection) => bank_connection,
                Err(Error::NotFound) => {
                    tracing::warn!("Cannot sync connection {bank_connection_id}: it does not exist");
                    return SyncResult::rejected(
                        bank_connection_id,
                        SyncError::ConnectionNotFound(bank_connection_id),
                        start_time,
                    );
                }
                Err(error) => {
                    tracing::error!("Could not load connection {bank_connection_id}: {error}");
                    return SyncResult::rejected(bank_connection_id, error.into(), start_time);
                }
            };

        let sync_type = SyncType::for_run(bank_connection.cursor.as_deref(), trigger);
        let mut progress = SyncProgress {
            counts: PageCounts::default(),
            cursor: bank_connection.cursor.clone(),
        };

        tracing::debug!("Starting {sync_type:?} sync of connection {bank_connection_id}");

        let outcome = if bank_connection.is_active {
            self.sync_pages(&bank_connection, &mut progress, start_time + self.config.deadline)
                .await
        } else {
            Err(SyncError::ConnectionInactive(bank_connection_id))
        };

        self.finish(
            bank_connection_id,
            sync_type,
            progress,
            outcome.err(),
            start_time,
            started_at,
        )
    }

    /// Retrieve the sync runs of a bank connection, newest first.
    ///
    /// # Errors
    /// This function will return a:
    /// - [Error::NotFound] if `bank_connection_id` does not refer to a bank connection,
    /// - [Error::DatabaseLockError] if the database lock is poisoned,
    /// - or [Error::SqlError] if there is some other SQL error.
    pub fn get_sync_history(
        &self,
        bank_connection_id: BankConnectionId,
    ) -> Result<Vec<SyncHistoryEntry>, Error> {
        self.with_db(|connection| {
            get_bank_connection(bank_connection_id, connection)?;
            history::get_sync_history(bank_connection_id, connection)
        })
    }

    /// The IDs of the connections a scheduled sync should visit.
    ///
    /// # Errors
    /// Returns an error if the database lock is poisoned or there is an SQL error.
    pub fn syncable_connection_ids(&self) -> Result<Vec<BankConnectionId>, Error> {
        self.with_db(|connection| {
            get_syncable_bank_connections(connection).map(|bank_connections| {
                bank_connections
                    .into_iter()
                    .map(|bank_connection| bank_connection.id)
                    .collect()
            })
        })
    }

    /// Run `f` with the database connection.
    ///
    /// The lock is released before this returns, so it is never held across an `.await`.
    fn with_db<T>(&self, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
        let connection = self.db_connection.lock().map_err(|error| {
            tracing::error!("could not acquire database lock: {error}");
            Error::DatabaseLockError
        })?;

        f(&connection)
    }

    async fn sync_pages(
        &self,
        bank_connection: &BankConnection,
        progress: &mut SyncProgress,
        deadline: Instant,
    ) -> Result<(), SyncError> {
        let credential = self
            .credentials
            .get_valid_credential(bank_connection.id)
            .await?;

        loop {
            let page = self
                .fetch_page_with_retry(&credential, progress.cursor.as_deref(), deadline)
                .await?;

            let counts = self
                .with_db(|connection| self.apply_page(bank_connection.id, &page, connection))?;
            progress.counts.add(counts);

            if !page.next_cursor.is_empty() {
                progress.cursor = Some(page.next_cursor);
            }

            tracing::debug!(
                "Applied page for connection {}: {} added, {} modified, {} removed",
                bank_connection.id,
                counts.added,
                counts.modified,
                counts.removed
            );

            if !page.has_more {
                return Ok(());
            }

            // Let syncs of other connections make progress between pages.
            tokio::task::yield_now().await;
        }
    }

    /// Fetch the page after `cursor`, retrying rate limited requests with
    /// exponential backoff until the retries or the deadline run out.
    async fn fetch_page_with_retry(
        &self,
        credential: &Credential,
        cursor: Option<&str>,
        deadline: Instant,
    ) -> Result<SyncPage, SyncError> {
        let mut retries = 0;
        let mut backoff = self.config.initial_backoff;

        loop {
            let result =
                tokio::time::timeout_at(deadline, self.source.fetch_page(credential, cursor))
                    .await
                    .map_err(|_| deadline_exceeded(self.config.deadline))?;

            match result {
                Err(SyncError::RateLimited(message))
                    if retries < self.config.max_rate_limit_retries =>
                {
                    retries += 1;
                    tracing::warn!(
                        "Rate limited ({message}), retry {retries} of {} in {}ms",
                        self.config.max_rate_limit_retries,
                        backoff.as_millis()
                    );

                    tokio::time::timeout_at(deadline, tokio::time::sleep(backoff))
                        .await
                        .map_err(|_| deadline_exceeded(self.config.deadline))?;

                    backoff = backoff.saturating_mul(2);
                }
                result => return result,
            }
        }
    }

    /// Apply one page in a single database transaction.
    ///
    /// The page's cursor is written in the same transaction, so the stored
    /// cursor never points past a page that was not fully applied.
    fn apply_page(
        &self,
        bank_connection_id: BankConnectionId,
        page: &SyncPage,
        connection: &Connection,
    ) -> Result<PageCounts, Error> {
        let transaction = connection.unchecked_transaction()?;
        let mut counts = PageCounts::default();

        for account in &page.accounts {
            upsert_account(bank_connection_id, account, &transaction)?;
        }

        for raw_transaction in page.added.iter().chain(&page.modified) {
            let account_id = ensure_account(
                bank_connection_id,
                &raw_transaction.account_external_id,
                &transaction,
            )?;
            let category = self
                .category_mapper
                .map_category(&raw_transaction.description, &raw_transaction.category_tags);
            let entry = LedgerEntry::from_raw(account_id, raw_transaction, category);

            match upsert_transaction(&entry, &transaction)? {
                UpsertOutcome::Inserted => counts.added += 1,
                UpsertOutcome::Updated => counts.modified += 1,
                UpsertOutcome::Unchanged | UpsertOutcome::Skipped => {}
            }
        }

        for removed in &page.removed {
            if mark_removed(&removed.external_id, bank_connection_id, &transaction)? {
                counts.removed += 1;
            }
        }

        counts.expenses_created = self.create_expenses(bank_connection_id, &transaction)?;

        if !page.next_cursor.is_empty() {
            update_cursor(bank_connection_id, &page.next_cursor, &transaction)?;
        }

        transaction.commit()?;

        Ok(counts)
    }

    /// Create one expense for each settled transaction of the connection that
    /// does not have one yet.
    fn create_expenses(
        &self,
        bank_connection_id: BankConnectionId,
        connection: &Connection,
    ) -> Result<u32, Error> {
        let mut created = 0;

        let settled = get_settled_unlinked_transactions(bank_connection_id, connection)?;

        for ledger_transaction in settled {
            let new_expense = NewExpense::for_transaction(&ledger_transaction);

            let expense_id = match self.expense_sink.create_expense(&new_expense, connection) {
                Ok(expense_id) => {
                    created += 1;
                    expense_id
                }
                Err(Error::DuplicateExpense) => {
                    match self
                        .expense_sink
                        .find_expense_for_transaction(ledger_transaction.id, connection)?
                    {
                        Some(expense_id) => {
                            tracing::debug!(
                                "Transaction {} already has expense {expense_id}, linking it",
                                ledger_transaction.id
                            );
                            expense_id
                        }
                        None => continue,
                    }
                }
                Err(error) => return Err(error),
            };

            if !link_expense(ledger_transaction.id, expense_id, connection)? {
                tracing::debug!(
                    "Transaction {} was already linked to an expense, skipping",
                    ledger_transaction.id
                );
            }
        }

        Ok(created)
    }

    /// Record the outcome of a run on the connection and in the sync history.
    fn finish(
        &self,
        bank_connection_id: BankConnectionId,
        sync_type: SyncType,
        progress: SyncProgress,
        error: Option<SyncError>,
        start_time: Instant,
        started_at: OffsetDateTime,
    ) -> SyncResult {
        let duration_ms = elapsed_ms(start_time);
        let SyncProgress { counts, cursor } = progress;

        let history_entry = NewSyncHistoryEntry {
            bank_connection_id,
            sync_type,
            added: counts.added,
            modified: counts.modified,
            removed: counts.removed,
            duration_ms,
            error: error.clone(),
            started_at,
        };
        let history_recorded =
            self.with_db(|connection| append_sync_history(&history_entry, connection));
        if let Err(record_error) = &history_recorded {
            tracing::error!(
                "Could not append the sync history of connection {bank_connection_id}: {record_error}"
            );
        }

        let status_recorded = self.with_db(|connection| {
            let finished_at = OffsetDateTime::now_utc();

            match &error {
                None => record_sync_success(bank_connection_id, finished_at, connection),
                // A deactivated connection keeps its last sync status.
                Some(SyncError::ConnectionInactive(_)) => Ok(()),
                Some(error) => record_sync_failure(
                    bank_connection_id,
                    &error.to_string(),
                    matches!(error, SyncError::ReauthRequired(_)),
                    finished_at,
                    connection,
                ),
            }
        });
        if let Err(record_error) = &status_recorded {
            tracing::error!(
                "Could not update the sync status of connection {bank_connection_id}: {record_error}"
            );
        }

        let error = match (error, history_recorded.and(status_recorded)) {
            (None, Err(record_error)) => Some(record_error.into()),
            (error, _) => error,
        };

        match &error {
            None => tracing::info!(
                "{sync_type:?} sync of connection {bank_connection_id} completed in {duration_ms}ms: \
                 {} added, {} modified, {} removed, {} expenses created",
                counts.added,
                counts.modified,
                counts.removed,
                counts.expenses_created
            ),
            Some(error) if error.kind().is_retryable() => tracing::warn!(
                "{sync_type:?} sync of connection {bank_connection_id} failed after {duration_ms}ms, will retry: {error}"
            ),
            Some(error) => tracing::error!(
                "{sync_type:?} sync of connection {bank_connection_id} failed after {duration_ms}ms: {error}"
            ),
        }

        SyncResult {
            bank_connection_id,
            sync_type: Some(sync_type),
            added: counts.added,
            modified: counts.modified,
            removed: counts.removed,
            expenses_created: counts.expenses_created,
            success: error.is_none(),
            error,
            cursor,
            duration_ms,
        }
    }
}

fn deadline_exceeded(deadline: Duration) -> SyncError {
    SyncError::TransientNetworkError(format!(
        "the sync did not finish within {}s",
        deadline.as_secs_f64()
    ))
}

fn elapsed_ms(start_time: Instant) -> i64 {
    i64::try_from(start_time.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod run_sync_tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use rusqlite::Connection;
    use time::{Duration as TimeDuration, OffsetDateTime};

    use crate::{
        Error,
        account::get_accounts_for_connection,
        bank_connection::{
            NewBankConnection, create_bank_connection, deactivate_bank_connection,
            get_bank_connection, update_cursor,
        },
        database_id::TransactionId,
        expense::{
            ExpenseId, ExpenseSink, NewExpense, SqliteExpenseStore, count_expenses, get_expenses,
        },
        ledger::{SyncStatus, count_transactions, get_transaction_by_external_id},
        source::{RemovedTransaction, SyncPage},
        sync::{
            SyncError, SyncErrorKind, SyncTrigger, SyncType,
            test_utils::{
                GatedSource, ScriptedSource, account, fast_config, get_orchestrator, get_test_db,
                page, transaction,
            },
        },
    };

    #[tokio::test]
    async fn first_sync_imports_all_pages() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1", "t2", "t3"], "c1", true)),
            Ok(page(&["t4"], "c2", false)),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source.clone(), fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(got.success, "sync failed: {:?}", got.error);
        assert_eq!((got.added, got.modified, got.removed), (4, 0, 0));
        assert_eq!(got.expenses_created, 4);
        assert_eq!(got.sync_type, Some(SyncType::Initial));
        assert_eq!(got.cursor.as_deref(), Some("c2"));
        assert_eq!(source.requested_cursors(), vec![None, Some("c1".to_owned())]);

        let conn = db_connection.lock().unwrap();
        assert_eq!(count_transactions(&conn).unwrap(), 4);
        assert_eq!(count_expenses(&conn).unwrap(), 4);
        let bank_connection = get_bank_connection(id, &conn).unwrap();
        assert_eq!(bank_connection.cursor.as_deref(), Some("c2"));
        assert!(bank_connection.last_synced_at.is_some());
        drop(conn);

        let history = orchestrator.get_sync_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sync_type, SyncType::Initial);
        assert_eq!(history[0].added, 4);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn transactions_are_mapped_to_categories() {
        let (db_connection, id) = get_test_db();
        let mut tagged = transaction("t2", -30.0, false);
        tagged.description = "SQ *BLUE BOTTLE".to_owned();
        tagged.category_tags = vec!["FOOD_AND_DRINK".to_owned()];
        let source = Arc::new(ScriptedSource::new(vec![Ok(SyncPage {
            accounts: vec![account("acc-1")],
            added: vec![transaction("t1", -10.0, false), tagged],
            next_cursor: "c1".to_owned(),
            ..Default::default()
        })]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        let conn = db_connection.lock().unwrap();
        assert_eq!(
            get_transaction_by_external_id("t1", &conn).unwrap().category.as_ref(),
            "Transportation"
        );
        assert_eq!(
            get_transaction_by_external_id("t2", &conn).unwrap().category.as_ref(),
            "Meals"
        );
        let expenses = get_expenses(&conn).unwrap();
        assert_eq!(expenses[0].vendor, "Uber");
        assert_eq!(expenses[0].category.as_ref(), "Transportation");
    }

    #[tokio::test]
    async fn incremental_sync_without_changes_is_no_op() {
        let (db_connection, id) = get_test_db();
        update_cursor(id, "c5", &db_connection.lock().unwrap()).unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(SyncPage {
            next_cursor: "c5".to_owned(),
            has_more: false,
            ..Default::default()
        })]));
        let orchestrator = get_orchestrator(db_connection.clone(), source.clone(), fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(got.success);
        assert_eq!((got.added, got.modified, got.removed), (0, 0, 0));
        assert_eq!(got.sync_type, Some(SyncType::Incremental));
        assert_eq!(source.requested_cursors(), vec![Some("c5".to_owned())]);
        assert_eq!(
            get_bank_connection(id, &db_connection.lock().unwrap())
                .unwrap()
                .cursor
                .as_deref(),
            Some("c5")
        );
        let history = orchestrator.get_sync_history(id).unwrap();
        assert_eq!(history.len(), 1, "a no-op sync must still be recorded");
        assert_eq!(history[0].added, 0);
    }

    #[tokio::test]
    async fn redelivered_page_creates_no_duplicates() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1", "t2"], "c1", false)),
            Ok(page(&["t1", "t2"], "c1", false)),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let first = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let second = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert_eq!(first.added, 2);
        assert!(second.success);
        assert_eq!((second.added, second.modified, second.removed), (0, 0, 0));
        assert_eq!(second.expenses_created, 0);
        let conn = db_connection.lock().unwrap();
        assert_eq!(count_transactions(&conn).unwrap(), 2);
        assert_eq!(count_expenses(&conn).unwrap(), 2);
    }

    #[tokio::test]
    async fn failure_mid_sync_keeps_finished_pages() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1", "t2"], "c1", true)),
            Err(SyncError::TransientNetworkError("connection reset".to_owned())),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(!got.success);
        assert_eq!(got.added, 2);
        assert_eq!(
            got.error.as_ref().map(SyncError::kind),
            Some(SyncErrorKind::TransientNetworkError)
        );
        {
            let conn = db_connection.lock().unwrap();
            assert_eq!(count_transactions(&conn).unwrap(), 2);
            let bank_connection = get_bank_connection(id, &conn).unwrap();
            assert_eq!(bank_connection.cursor.as_deref(), Some("c1"));
            assert!(bank_connection.last_sync_error.is_some());
            assert!(!bank_connection.needs_reauth);
        }
        let history = orchestrator.get_sync_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].added, 2);
        assert!(!history[0].success);
        assert_eq!(history[0].error_kind, Some(SyncErrorKind::TransientNetworkError));
        assert!(history[0].error.is_some());
    }

    #[tokio::test]
    async fn retry_after_failure_resumes_from_last_page() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1", "t2"], "c1", true)),
            Err(SyncError::TransientNetworkError("connection reset".to_owned())),
            Ok(page(&["t3"], "c2", false)),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source.clone(), fast_config());

        orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(got.success);
        assert_eq!(got.added, 1);
        assert_eq!(got.sync_type, Some(SyncType::Incremental));
        assert_eq!(
            source.requested_cursors(),
            vec![None, Some("c1".to_owned()), Some("c1".to_owned())]
        );
        let bank_connection = get_bank_connection(id, &db_connection.lock().unwrap()).unwrap();
        assert_eq!(bank_connection.last_sync_error, None);
    }

    #[tokio::test]
    async fn expired_credential_requires_reauth_without_ledger_changes() {
        let (db_connection, _) = get_test_db();
        let id = create_bank_connection(
            &NewBankConnection {
                user_id: 2,
                external_id: "item-2".to_owned(),
                institution_name: "Second Platypus Bank".to_owned(),
                access_credential: "expired".to_owned(),
                credential_expires_at: Some(OffsetDateTime::now_utc() - TimeDuration::hours(1)),
            },
            &db_connection.lock().unwrap(),
        )
        .unwrap()
        .id;
        let source = Arc::new(ScriptedSource::new(vec![Ok(page(&["t1"], "c1", false))]));
        let orchestrator = get_orchestrator(db_connection.clone(), source.clone(), fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(!got.success);
        assert_eq!(
            got.error.as_ref().map(SyncError::kind),
            Some(SyncErrorKind::ReauthRequired)
        );
        assert!(source.requested_cursors().is_empty());
        {
            let conn = db_connection.lock().unwrap();
            assert_eq!(count_transactions(&conn).unwrap(), 0);
            let bank_connection = get_bank_connection(id, &conn).unwrap();
            assert!(bank_connection.needs_reauth);
            assert!(bank_connection.last_sync_error.is_some());
            assert_eq!(bank_connection.cursor, None);
        }
        let history = orchestrator.get_sync_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!((history[0].added, history[0].modified, history[0].removed), (0, 0, 0));
        assert!(!history[0].success);
        assert_eq!(history[0].error_kind, Some(SyncErrorKind::ReauthRequired));
    }

    #[tokio::test]
    async fn source_reauth_error_flags_connection() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![Err(SyncError::ReauthRequired(
            "ITEM_LOGIN_REQUIRED".to_owned(),
        ))]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Manual).await;

        assert!(!got.success);
        assert!(get_bank_connection(id, &db_connection.lock().unwrap()).unwrap().needs_reauth);
        assert!(orchestrator.syncable_connection_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn settled_transaction_gets_one_expense() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(SyncPage {
                added: vec![transaction("t1", -25.0, true)],
                next_cursor: "c1".to_owned(),
                ..Default::default()
            }),
            Ok(SyncPage {
                modified: vec![transaction("t1", -26.5, false)],
                next_cursor: "c2".to_owned(),
                ..Default::default()
            }),
            Ok(SyncPage {
                modified: vec![transaction("t1", -26.5, false)],
                next_cursor: "c3".to_owned(),
                ..Default::default()
            }),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let pending = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let settled = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let redelivered = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert_eq!((pending.added, pending.expenses_created), (1, 0));
        assert_eq!((settled.modified, settled.expenses_created), (1, 1));
        assert_eq!((redelivered.modified, redelivered.expenses_created), (0, 0));
        let conn = db_connection.lock().unwrap();
        let expenses = get_expenses(&conn).unwrap();
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0].amount, -26.5);
        let ledger_transaction = get_transaction_by_external_id("t1", &conn).unwrap();
        assert_eq!(ledger_transaction.expense_id, Some(expenses[0].id));
    }

    #[tokio::test]
    async fn removals_are_counted_once_and_unknown_ids_ignored() {
        let (db_connection, id) = get_test_db();
        let removal = |next_cursor: &str| SyncPage {
            removed: vec![
                RemovedTransaction { external_id: "t1".to_owned() },
                RemovedTransaction { external_id: "never-seen".to_owned() },
            ],
            next_cursor: next_cursor.to_owned(),
            ..Default::default()
        };
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1", "t2"], "c1", false)),
            Ok(removal("c2")),
            Ok(removal("c3")),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let first_removal = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let second_removal = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(first_removal.success && second_removal.success);
        assert_eq!(first_removal.removed, 1);
        assert_eq!(second_removal.removed, 0);
        let conn = db_connection.lock().unwrap();
        assert_eq!(
            get_transaction_by_external_id("t1", &conn).unwrap().status,
            SyncStatus::Removed
        );
        assert_eq!(
            get_transaction_by_external_id("t2", &conn).unwrap().status,
            SyncStatus::Synced
        );
        assert_eq!(count_transactions(&conn).unwrap(), 2);
    }

    #[tokio::test]
    async fn rate_limited_request_is_retried_with_same_cursor() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SyncError::RateLimited("RATE_LIMIT_EXCEEDED".to_owned())),
            Err(SyncError::RateLimited("RATE_LIMIT_EXCEEDED".to_owned())),
            Ok(page(&["t1"], "c1", false)),
        ]));
        let orchestrator = get_orchestrator(db_connection, source.clone(), fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(got.success, "sync failed: {:?}", got.error);
        assert_eq!(got.added, 1);
        assert_eq!(source.requested_cursors(), vec![None, None, None]);
    }

    #[tokio::test]
    async fn rate_limit_fails_run_after_last_retry() {
        let (db_connection, id) = get_test_db();
        let rate_limited = || Err(SyncError::RateLimited("RATE_LIMIT_EXCEEDED".to_owned()));
        let source = Arc::new(ScriptedSource::new(vec![
            rate_limited(),
            rate_limited(),
            rate_limited(),
            rate_limited(),
            Ok(page(&["t1"], "c1", false)),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source.clone(), fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(!got.success);
        assert_eq!(
            got.error.as_ref().map(SyncError::kind),
            Some(SyncErrorKind::RateLimited)
        );
        assert_eq!(source.requested_cursors().len(), 4);
        assert_eq!(
            get_bank_connection(id, &db_connection.lock().unwrap()).unwrap().cursor,
            None
        );
    }

    #[tokio::test]
    async fn slow_source_times_out_as_network_error() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(
            ScriptedSource::new(vec![Ok(page(&["t1"], "c1", false))])
                .with_delay(Duration::from_secs(5)),
        );
        let mut config = fast_config();
        config.deadline = Duration::from_millis(50);
        let orchestrator = get_orchestrator(db_connection.clone(), source, config);

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(!got.success);
        assert_eq!(
            got.error.as_ref().map(SyncError::kind),
            Some(SyncErrorKind::TransientNetworkError)
        );
        let conn = db_connection.lock().unwrap();
        assert_eq!(count_transactions(&conn).unwrap(), 0);
        assert_eq!(get_bank_connection(id, &conn).unwrap().cursor, None);
    }

    #[tokio::test]
    async fn overlapping_sync_is_rejected() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(GatedSource::default());
        let orchestrator = get_orchestrator(db_connection, source.clone(), fast_config());
        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run_sync(id, SyncTrigger::Scheduled).await })
        };
        source.started.notified().await;

        let rejected = orchestrator.run_sync(id, SyncTrigger::Manual).await;
        source.release.notify_one();
        let finished = running.await.unwrap();

        assert!(!rejected.success);
        assert_eq!(rejected.error, Some(SyncError::SyncInProgress(id)));
        assert_eq!(rejected.sync_type, None);
        assert!(finished.success);
        assert_eq!(
            orchestrator.get_sync_history(id).unwrap().len(),
            1,
            "a rejected trigger is not a run"
        );
    }

    #[tokio::test]
    async fn manual_sync_with_cursor_is_manual() {
        let (db_connection, id) = get_test_db();
        update_cursor(id, "c1", &db_connection.lock().unwrap()).unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let orchestrator = get_orchestrator(db_connection, source, fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Manual).await;

        assert!(got.success);
        assert_eq!(got.sync_type, Some(SyncType::Manual));
        assert_eq!(
            orchestrator.get_sync_history(id).unwrap()[0].sync_type,
            SyncType::Manual
        );
    }

    #[tokio::test]
    async fn inactive_connection_is_recorded_but_not_synced() {
        let (db_connection, id) = get_test_db();
        deactivate_bank_connection(id, &db_connection.lock().unwrap()).unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(page(&["t1"], "c1", false))]));
        let orchestrator = get_orchestrator(db_connection, source.clone(), fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Manual).await;

        assert_eq!(got.error, Some(SyncError::ConnectionInactive(id)));
        assert!(source.requested_cursors().is_empty());
        let history = orchestrator.get_sync_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error_kind, Some(SyncErrorKind::ConnectionInactive));
    }

    #[tokio::test]
    async fn unknown_connection_is_not_found() {
        let (db_connection, _) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let orchestrator = get_orchestrator(db_connection, source, fast_config());

        let got = orchestrator.run_sync(999, SyncTrigger::Manual).await;

        assert_eq!(got.error, Some(SyncError::ConnectionNotFound(999)));
        assert_eq!(
            orchestrator.get_sync_history(999),
            Err(crate::Error::NotFound)
        );
    }

    #[tokio::test]
    async fn transaction_for_unknown_account_gets_placeholder_account() {
        let (db_connection, id) = get_test_db();
        let mut orphan = transaction("t1", -5.0, false);
        orphan.account_external_id = "acc-unknown".to_owned();
        let source = Arc::new(ScriptedSource::new(vec![Ok(SyncPage {
            added: vec![orphan],
            next_cursor: "c1".to_owned(),
            ..Default::default()
        })]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(got.success, "sync failed: {:?}", got.error);
        let conn = db_connection.lock().unwrap();
        let accounts = get_accounts_for_connection(id, &conn).unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].external_id, "acc-unknown");
    }

    #[tokio::test]
    async fn sync_does_not_take_over_rows_of_other_connections() {
        let (db_connection, first_id) = get_test_db();
        let second_id = create_bank_connection(
            &NewBankConnection {
                user_id: 2,
                external_id: "item-2".to_owned(),
                institution_name: "Second Platypus Bank".to_owned(),
                access_credential: "access-sandbox-456".to_owned(),
                credential_expires_at: None,
            },
            &db_connection.lock().unwrap(),
        )
        .unwrap()
        .id;
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1"], "c1", false)),
            Ok(SyncPage {
                accounts: vec![account("acc-1")],
                added: vec![transaction("t1", -99.0, false)],
                next_cursor: "other-c1".to_owned(),
                ..Default::default()
            }),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let first = orchestrator.run_sync(first_id, SyncTrigger::Scheduled).await;
        let second = orchestrator.run_sync(second_id, SyncTrigger::Scheduled).await;

        assert_eq!((first.added, first.expenses_created), (1, 1));
        assert!(second.success, "sync failed: {:?}", second.error);
        assert_eq!(
            (second.added, second.modified, second.expenses_created),
            (0, 0, 0)
        );
        let conn = db_connection.lock().unwrap();
        let stored = get_transaction_by_external_id("t1", &conn).unwrap();
        let first_accounts = get_accounts_for_connection(first_id, &conn).unwrap();
        assert_eq!(stored.account_id, first_accounts[0].id);
        assert_eq!(stored.amount, -10.0);
        let expenses = get_expenses(&conn).unwrap();
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0].amount, -10.0);
        assert_eq!(stored.expense_id, Some(expenses[0].id));
    }

    #[tokio::test]
    async fn history_is_appended_when_status_update_fails() {
        let (db_connection, id) = get_test_db();
        db_connection
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_sync_status BEFORE UPDATE OF last_sync_error ON bank_connection
                 BEGIN SELECT RAISE(ABORT, 'read only'); END;",
            )
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Err(
            SyncError::TransientNetworkError("connection reset".to_owned()),
        )]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        let got = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert!(!got.success);
        assert_eq!(
            got.error.as_ref().map(SyncError::kind),
            Some(SyncErrorKind::TransientNetworkError)
        );
        assert_eq!(
            get_bank_connection(id, &db_connection.lock().unwrap())
                .unwrap()
                .last_sync_error,
            None
        );
        let history = orchestrator.get_sync_history(id).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].error_kind, Some(SyncErrorKind::TransientNetworkError));
    }

    #[tokio::test]
    async fn failed_sync_stamps_attempt_time() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1"], "c1", false)),
            Err(SyncError::TransientNetworkError("connection reset".to_owned())),
        ]));
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config());

        orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let succeeded = get_bank_connection(id, &db_connection.lock().unwrap()).unwrap();
        orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let failed = get_bank_connection(id, &db_connection.lock().unwrap()).unwrap();

        assert_eq!(succeeded.last_attempted_at, succeeded.last_synced_at);
        assert_eq!(failed.last_synced_at, succeeded.last_synced_at);
        assert!(failed.last_sync_error.is_some());
        assert!(failed.last_attempted_at >= succeeded.last_attempted_at);
    }

    /// Creates expenses in the database and remembers which transactions they were for.
    #[derive(Default)]
    struct RecordingExpenseSink {
        created_for: Mutex<Vec<TransactionId>>,
    }

    impl ExpenseSink for RecordingExpenseSink {
        fn create_expense(
            &self,
            expense: &NewExpense,
            connection: &Connection,
        ) -> Result<ExpenseId, Error> {
            self.created_for.lock().unwrap().push(expense.transaction_id);
            SqliteExpenseStore.create_expense(expense, connection)
        }

        fn find_expense_for_transaction(
            &self,
            transaction_id: TransactionId,
            connection: &Connection,
        ) -> Result<Option<ExpenseId>, Error> {
            SqliteExpenseStore.find_expense_for_transaction(transaction_id, connection)
        }
    }

    #[tokio::test]
    async fn expense_sink_is_called_once_per_settled_transaction() {
        let (db_connection, id) = get_test_db();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(page(&["t1", "t2"], "c1", false)),
            Ok(SyncPage {
                added: vec![transaction("t3", -4.0, true)],
                modified: vec![transaction("t1", -10.0, false), transaction("t2", -10.0, false)],
                next_cursor: "c2".to_owned(),
                ..Default::default()
            }),
            Ok(SyncPage {
                modified: vec![transaction("t3", -4.0, false)],
                next_cursor: "c3".to_owned(),
                ..Default::default()
            }),
        ]));
        let sink = Arc::new(RecordingExpenseSink::default());
        let orchestrator = get_orchestrator(db_connection.clone(), source, fast_config())
            .with_expense_sink(sink.clone());

        let first = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let redelivered = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;
        let settled = orchestrator.run_sync(id, SyncTrigger::Scheduled).await;

        assert_eq!(first.expenses_created, 2);
        assert_eq!(redelivered.expenses_created, 0);
        assert_eq!(settled.expenses_created, 1);
        let conn = db_connection.lock().unwrap();
        let transaction_ids: Vec<_> = ["t1", "t2", "t3"]
            .iter()
            .map(|external_id| get_transaction_by_external_id(external_id, &conn).unwrap().id)
            .collect();
        assert_eq!(*sink.created_for.lock().unwrap(), transaction_ids);
        assert_eq!(count_expenses(&conn).unwrap(), 3);
    }
}
