use std::time::Duration;

use sqlx::mysql::MySqlDatabaseError;
use thiserror::Error;

/// Failure taxonomy shared by the collectors.
#[derive(Debug, Clone, Error)]
pub enum CollectError {
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("throttled by remote API: {0}")]
    Throttling(String),

    #[error("malformed data: {0}")]
    Data(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl CollectError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn throttling(message: impl Into<String>) -> Self {
        Self::Throttling(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Transient failures worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Throttling(_) | Self::Timeout(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "connectivity",
            Self::Throttling(_) => "throttling",
            Self::Data(_) => "data",
            Self::NotFound(_) => "not_found",
            Self::Validation(_) => "validation",
            Self::Fatal(_) => "fatal",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// MySQL `ER_NO_SUCH_THREAD`: the thread finished or was killed.
const MYSQL_NO_SUCH_THREAD: u16 = 1094;
/// MySQL `ER_ACCESS_DENIED_ERROR` and `ER_DBACCESS_DENIED_ERROR`.
const MYSQL_ACCESS_DENIED: &[u16] = &[1045, 1044];

impl From<sqlx::Error> for CollectError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_) => Self::Connectivity(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let number = db_err
                    .try_downcast_ref::<MySqlDatabaseError>()
                    .map(MySqlDatabaseError::number);
                match number {
                    Some(MYSQL_NO_SUCH_THREAD) => Self::NotFound(db_err.message().to_string()),
                    Some(code) if MYSQL_ACCESS_DENIED.contains(&code) => {
                        Self::Fatal(db_err.message().to_string())
                    }
                    _ => Self::Data(db_err.message().to_string()),
                }
            }
            _ => Self::Data(err.to_string()),
        }
    }
}

pub type CollectResult<T> = Result<T, CollectError>;
