//! The account registry: the bank accounts and credit cards reported by each
//! bank connection, with their cached balances.

mod core;

pub use core::{
    Account, AccountId, create_account_table, deactivate_accounts_for_connection, ensure_account,
    get_accounts_for_connection, upsert_account,
};
