//! checkwarden - periodic check scheduler and executor.
//!
//! Runs registered checks against users, domains and services on per-schedule
//! intervals or on demand, and keeps a bounded history of their results.

pub mod checker;
pub mod config;
pub mod db;
pub mod error;
pub mod ident;
pub mod options;
pub mod scheduler;
pub mod storage;
pub mod usecase;

pub use error::{Error, Result};
