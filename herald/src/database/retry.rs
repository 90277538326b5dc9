//! Retry helpers for database operations.
//!
//! SQLite reports lock contention as `SQLITE_BUSY` (another connection holds
//! the write lock) or `SQLITE_LOCKED` (shared-cache table lock). Both are safe
//! to retry for the short claim and status-update transactions.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const SQLITE_BUSY_MAX_RETRIES: usize = 12;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 2000;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

fn is_lock_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked")
        || msg.contains("database is busy")
        || msg.contains("table is locked")
}

pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        return is_lock_message(&sqlx_err.to_string());
    };

    // Extended result codes carry the primary code in the low byte.
    let primary = db_err
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
        return true;
    }

    is_lock_message(db_err.message())
}

fn backoff_delay(attempt: usize) -> Duration {
    let exp_backoff_ms = SQLITE_BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(16));
    let capped_ms = exp_backoff_ms.min(SQLITE_BUSY_MAX_DELAY_MS);
    let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
    Duration::from_millis((capped_ms + jitter_ms).min(SQLITE_BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports
/// lock contention. Any other error is returned immediately.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy_error(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                    return Err(err);
                }

                let delay = backoff_delay(attempt);
                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    SQLITE_BUSY_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_is_capped() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt) <= Duration::from_millis(SQLITE_BUSY_MAX_DELAY_MS));
        }
    }

    #[test]
    fn test_non_database_errors_are_not_busy() {
        assert!(!is_sqlite_busy_error(&Error::Other(
            "database is locked".to_string()
        )));
        assert!(is_sqlite_busy_error(&Error::DatabaseSqlx(
            sqlx::Error::Protocol("database is locked".to_string())
        )));
    }

    #[tokio::test]
    async fn test_retries_only_busy_errors() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let result: Result<u32> = retry_on_sqlite_busy("test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::DatabaseSqlx(sqlx::Error::Protocol(
                        "database is busy".to_string(),
                    )))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<u32> = retry_on_sqlite_busy("test", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("bad input"))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
