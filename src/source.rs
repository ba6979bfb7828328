//! The interfaces to the external collaborators of the sync engine.
//!
//! The aggregator or payment processor API is abstracted as a
//! [TransactionSource] that returns pages of strongly typed records, and the
//! auth layer is abstracted as a [CredentialProvider]. Raw payloads are
//! converted into these types as soon as they are received.

use std::fmt;

use async_trait::async_trait;
use time::Date;

use crate::{bank_connection::BankConnectionId, sync::SyncError};

/// An opaque access credential for the external service.
///
/// The sync engine only passes the credential through to the
/// [TransactionSource], it never inspects it.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap an access credential.
    pub fn new(credential: impl Into<String>) -> Self {
        Self(credential.into())
    }

    /// The credential to send to the external service.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(********)")
    }
}

/// Account metadata reported by the external service.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAccount {
    /// The account ID used by the external service.
    pub external_id: String,
    /// The display name of the account.
    pub name: String,
    /// The account type, e.g. "depository" or "credit".
    pub account_type: String,
    /// The account subtype, e.g. "checking".
    pub subtype: Option<String>,
    /// The last four digits of the account number.
    pub mask: Option<String>,
    /// The current balance.
    pub current_balance: Option<f64>,
    /// The available balance.
    pub available_balance: Option<f64>,
    /// The ISO currency code of the balances.
    pub currency: Option<String>,
}

/// A transaction reported as added or modified by the external service.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTransaction {
    /// The transaction ID used by the external service, globally unique.
    pub external_id: String,
    /// The external ID of the account the transaction belongs to.
    pub account_external_id: String,
    /// The signed amount, negative values are money leaving the account.
    pub amount: f64,
    /// The ISO currency code.
    pub currency: Option<String>,
    /// When the transaction happened.
    pub date: Date,
    /// The raw description from the statement.
    pub description: String,
    /// The cleaned up merchant name, if the service could determine it.
    pub merchant_name: Option<String>,
    /// The external category tags, most specific first.
    pub category_tags: Vec<String>,
    /// Whether the transaction has not settled yet.
    pub pending: bool,
}

/// A transaction the external service reports as no longer existing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedTransaction {
    /// The transaction ID used by the external service.
    pub external_id: String,
}

/// One page of changes returned by the external service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncPage {
    /// The accounts the changes belong to.
    pub accounts: Vec<RawAccount>,
    /// Transactions that are new since the requested cursor.
    pub added: Vec<RawTransaction>,
    /// Transactions that changed since the requested cursor.
    pub modified: Vec<RawTransaction>,
    /// Transactions that were removed since the requested cursor.
    pub removed: Vec<RemovedTransaction>,
    /// The cursor to request the next page with.
    pub next_cursor: String,
    /// Whether there are more pages after this one.
    pub has_more: bool,
}

/// A source of transactions, e.g. a bank-data aggregator or payment processor.
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Fetch the page of changes that follows `cursor`.
    ///
    /// A `None` cursor requests the full history of the connection.
    ///
    /// # Errors
    /// Implementations should classify failures as [SyncError::ReauthRequired],
    /// [SyncError::RateLimited], [SyncError::TransientNetworkError] or
    /// [SyncError::UnknownExternalError]. Retrying is left to the caller.
    async fn fetch_page(
        &self,
        credential: &Credential,
        cursor: Option<&str>,
    ) -> Result<SyncPage, SyncError>;
}

/// Supplies a valid access credential for a bank connection.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Get a valid credential for `connection_id`, refreshing it if needed.
    ///
    /// # Errors
    /// Returns [SyncError::ReauthRequired] if the credential is invalid or
    /// expired and the user has to re-authorize the connection.
    async fn get_valid_credential(
        &self,
        connection_id: BankConnectionId,
    ) -> Result<Credential, SyncError>;
}
