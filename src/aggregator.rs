//! A [TransactionSource] backed by a bank-data aggregator's
//! `/transactions/sync` API.
//!
//! The JSON payloads are decoded into private wire types and converted to the
//! strongly typed records of [crate::source] straight away, so nothing
//! downstream sees the aggregator's field names or sign convention.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::{
    source::{
        Credential, RawAccount, RawTransaction, RemovedTransaction, SyncPage, TransactionSource,
    },
    sync::SyncError,
};

/// Settings for talking to the aggregator.
#[derive(Clone)]
pub struct AggregatorConfig {
    /// The API root, e.g. "https://sandbox.plaid.com".
    pub base_url: String,
    /// The client ID issued by the aggregator.
    pub client_id: String,
    /// The API secret issued by the aggregator.
    pub secret: String,
    /// How many transactions to request per page.
    pub page_size: u32,
    /// How long a single request may take.
    pub request_timeout: Duration,
}

impl fmt::Debug for AggregatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregatorConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("secret", &"********")
            .field("page_size", &self.page_size)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Fetches pages of transaction changes over HTTP.
#[derive(Debug, Clone)]
pub struct AggregatorClient {
    config: AggregatorConfig,
    client: Client,
}

impl AggregatorClient {
    /// Create a client for the aggregator described by `config`.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be initialised, e.g. the
    /// TLS backend is unavailable.
    pub fn new(config: AggregatorConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self { config, client })
    }

    fn sync_url(&self) -> String {
        format!(
            "{}/transactions/sync",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl TransactionSource for AggregatorClient {
    async fn fetch_page(
        &self,
        credential: &Credential,
        cursor: Option<&str>,
    ) -> Result<SyncPage, SyncError> {
        let request = SyncRequest {
            client_id: &self.config.client_id,
            secret: &self.config.secret,
            access_token: credential.expose(),
            cursor,
            count: self.config.page_size,
        };

        let response = self
            .client
            .post(self.sync_url())
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status, &body));
        }

        let body: SyncResponse = response.json().await.map_err(|error| {
            if error.is_decode() {
                SyncError::UnknownExternalError(format!("could not parse sync response: {error}"))
            } else {
                classify_transport_error(error)
            }
        })?;

        Ok(body.into_sync_page())
    }
}

#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    client_id: &'a str,
    secret: &'a str,
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct SyncResponse {
    #[serde(default)]
    accounts: Vec<WireAccount>,
    #[serde(default)]
    added: Vec<WireTransaction>,
    #[serde(default)]
    modified: Vec<WireTransaction>,
    #[serde(default)]
    removed: Vec<WireRemovedTransaction>,
    next_cursor: String,
    has_more: bool,
}

impl SyncResponse {
    fn into_sync_page(self) -> SyncPage {
        SyncPage {
            accounts: self.accounts.into_iter().map(RawAccount::from).collect(),
            added: self.added.into_iter().map(RawTransaction::from).collect(),
            modified: self.modified.into_iter().map(RawTransaction::from).collect(),
            removed: self
                .removed
                .into_iter()
                .map(|removed| RemovedTransaction {
                    external_id: removed.transaction_id,
                })
                .collect(),
            next_cursor: self.next_cursor,
            has_more: self.has_more,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireAccount {
    account_id: String,
    name: String,
    #[serde(rename = "type")]
    account_type: String,
    subtype: Option<String>,
    mask: Option<String>,
    #[serde(default)]
    balances: WireBalances,
}

#[derive(Debug, Default, Deserialize)]
struct WireBalances {
    current: Option<f64>,
    available: Option<f64>,
    iso_currency_code: Option<String>,
}

impl From<WireAccount> for RawAccount {
    fn from(account: WireAccount) -> Self {
        Self {
            external_id: account.account_id,
            name: account.name,
            account_type: account.account_type,
            subtype: account.subtype,
            mask: account.mask,
            current_balance: account.balances.current,
            available_balance: account.balances.available,
            currency: account.balances.iso_currency_code,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireTransaction {
    transaction_id: String,
    account_id: String,
    /// Positive values are money leaving the account.
    amount: f64,
    iso_currency_code: Option<String>,
    date: Date,
    name: String,
    merchant_name: Option<String>,
    #[serde(default)]
    category: Option<Vec<String>>,
    personal_finance_category: Option<WireCategory>,
    #[serde(default)]
    pending: bool,
}

#[derive(Debug, Deserialize)]
struct WireCategory {
    primary: String,
    detailed: Option<String>,
}

impl From<WireTransaction> for RawTransaction {
    fn from(transaction: WireTransaction) -> Self {
        // Most specific first: detailed, primary, then the legacy hierarchy.
        let mut category_tags = Vec::new();

        if let Some(category) = transaction.personal_finance_category {
            category_tags.extend(category.detailed);
            category_tags.push(category.primary);
        }

        category_tags.extend(transaction.category.unwrap_or_default().into_iter().rev());

        Self {
            external_id: transaction.transaction_id,
            account_external_id: transaction.account_id,
            amount: -transaction.amount,
            currency: transaction.iso_currency_code,
            date: transaction.date,
            description: transaction.name,
            merchant_name: transaction.merchant_name,
            category_tags,
            pending: transaction.pending,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRemovedTransaction {
    transaction_id: String,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    error_type: String,
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

/// Classify an error response from the aggregator.
pub fn classify_error(status: StatusCode, body: &str) -> SyncError {
    let Ok(error) = serde_json::from_str::<WireError>(body) else {
        let message = format!("HTTP {status}: {}", body.trim());

        return match status {
            StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited(message),
            status if status.is_server_error() => SyncError::TransientNetworkError(message),
            _ => SyncError::UnknownExternalError(message),
        };
    };

    let message = format!("{}: {}", error.error_code, error.error_message);

    match (error.error_type.as_str(), error.error_code.as_str()) {
        (_, "ITEM_LOGIN_REQUIRED" | "INVALID_ACCESS_TOKEN" | "ACCESS_NOT_GRANTED") => {
            SyncError::ReauthRequired(message)
        }
        ("RATE_LIMIT_EXCEEDED", _) | (_, "RATE_LIMIT_EXCEEDED") => SyncError::RateLimited(message),
        _ if status == StatusCode::TOO_MANY_REQUESTS => SyncError::RateLimited(message),
        // The data changed while paging, starting again from the same cursor fixes it.
        (_, "TRANSACTIONS_SYNC_MUTATION_DURING_PAGINATION") => {
            SyncError::TransientNetworkError(message)
        }
        ("API_ERROR" | "INSTITUTION_ERROR", _) => SyncError::TransientNetworkError(message),
        _ if status.is_server_error() => SyncError::TransientNetworkError(message),
        _ => SyncError::UnknownExternalError(message),
    }
}

fn classify_transport_error(error: reqwest::Error) -> SyncError {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        SyncError::TransientNetworkError(error.to_string())
    } else {
        SyncError::UnknownExternalError(error.to_string())
    }
}
