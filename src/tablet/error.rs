// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;

use thiserror::Error;

use crate::types::ColumnId;

/// Status taxonomy surfaced across the engine boundary.
///
/// Client errors (`AlreadyPresent`, `NotFound`, `InvalidArgument`,
/// `InvalidTimestamp`) are recoverable by the caller. `ServiceUnavailable`
/// and `Aborted` are transient. `Io` is retried once internally where it
/// occurs and surfaced if persistent. `Corruption` is fatal to the tablet.
#[derive(Error, Debug)]
pub enum TabletError {
    #[error("already present: {0}")]
    AlreadyPresent(String),
    #[error("{0}({1}) not found")]
    NotFound(&'static str, String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("invalid column id: {0}")]
    InvalidColumn(ColumnId),
    #[error("corruption: {0}")]
    Corruption(String),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl TabletError {
    pub fn not_found(ty: &'static str, item: impl ToString) -> TracedTabletError {
        TabletError::NotFound(ty, item.to_string()).into()
    }

    pub fn already_present(item: impl ToString) -> TracedTabletError {
        TabletError::AlreadyPresent(item.to_string()).into()
    }

    pub fn corruption(message: impl ToString) -> TracedTabletError {
        TabletError::Corruption(message.to_string()).into()
    }

    /// Whether the error indicates transient unavailability rather than a
    /// definite failure.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, TabletError::ServiceUnavailable(_))
    }
}

/// [`TabletError`] with a captured backtrace.
pub struct TracedTabletError {
    source: TabletError,
    backtrace: Backtrace,
}

impl std::fmt::Display for TracedTabletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for TracedTabletError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<TabletError> for TracedTabletError {
    fn from(source: TabletError) -> TracedTabletError {
        TracedTabletError {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl std::fmt::Debug for TracedTabletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.source, self.backtrace)
    }
}

impl TracedTabletError {
    pub fn error(&self) -> &TabletError {
        &self.source
    }
}

impl From<std::io::Error> for TracedTabletError {
    #[inline]
    fn from(e: std::io::Error) -> TracedTabletError {
        TabletError::Io(e.into()).into()
    }
}

impl From<serde_json::Error> for TracedTabletError {
    #[inline]
    fn from(e: serde_json::Error) -> TracedTabletError {
        // A metadata file that fails to decode is an on-disk inconsistency.
        TabletError::Corruption(format!("metadata decode: {}", e)).into()
    }
}

pub type TabletResult<T> = std::result::Result<T, TracedTabletError>;

/// Run `f`, retrying exactly once on an IO error.
pub fn with_io_retry<T>(op: &str, mut f: impl FnMut() -> TabletResult<T>) -> TabletResult<T> {
    match f() {
        Err(e) if matches!(e.error(), TabletError::Io(_)) => {
            tracing::warn!("{} hit IO error, retrying once: {}", op, e);
            f()
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_retry_succeeds_second_time() {
        let mut attempts = 0;
        let result: TabletResult<i32> = with_io_retry("test", || {
            attempts += 1;
            if attempts == 1 {
                Err(std::io::Error::other("flaky").into())
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_io_retry_gives_up() {
        let mut attempts = 0;
        let result: TabletResult<i32> = with_io_retry("test", || {
            attempts += 1;
            Err(std::io::Error::other("down").into())
        });
        assert!(result.is_err());
        assert_eq!(attempts, 2);
    }
}
