//! Error types returned by the usecases and the scheduler.

use thiserror::Error;

use crate::db::{DbError, ExecutionStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("storage error: {0}")]
    Storage(DbError),
    #[error("execution cannot move from {from} to {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
    #[error("scheduler is disabled in configuration")]
    SchedulerDisabled,
    #[error("scheduler is not running")]
    SchedulerStopped,
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(kind) => Error::NotFound(kind),
            other => Error::Storage(other),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
