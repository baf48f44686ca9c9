//! Database module for checkwarden.
//!
//! Provides SQLite storage with the schema applied on open.

mod models;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use store::tests::{exec_sql, sample_result, test_store};
