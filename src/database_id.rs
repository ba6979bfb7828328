//! Database ID type definitions.

/// Alias for the integer type used for mapping to database IDs.
pub type DatabaseId = i64;

/// The row ID of a transaction in the ledger.
pub type TransactionId = DatabaseId;
