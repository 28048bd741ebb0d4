//! Retry with backoff for SQLITE_BUSY / SQLITE_LOCKED

use crate::{Error, Result};
use rusqlite::ErrorCode;
use std::thread;
use std::time::Duration;

/// Maximum retry attempts for SQLITE_BUSY
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Base backoff duration in milliseconds
pub const BASE_BACKOFF_MS: u64 = 50;

/// Maximum backoff duration in milliseconds
pub const MAX_BACKOFF_MS: u64 = 1000;

/// Run `f`, retrying with exponential backoff while the database is busy
pub fn with_busy_retry<F, T>(mut f: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0;

    loop {
        match f() {
            Ok(result) => return Ok(result),
            Err(Error::Database(ref e)) if is_busy_error(e) && attempts < MAX_BUSY_RETRIES => {
                attempts += 1;
                let backoff = calculate_backoff(attempts);
                tracing::debug!(
                    "SQLITE_BUSY (attempt {}/{}), retrying in {}ms",
                    attempts,
                    MAX_BUSY_RETRIES,
                    backoff
                );
                thread::sleep(Duration::from_millis(backoff));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Check if error is SQLITE_BUSY or SQLITE_LOCKED
pub(crate) fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// Calculate exponential backoff with jitter
fn calculate_backoff(attempt: u32) -> u64 {
    let base = BASE_BACKOFF_MS * (1 << attempt.min(6));
    let jitter = rand::random::<u64>() % (base / 4 + 1);
    (base + jitter).min(MAX_BACKOFF_MS)
}
