//! Retry discipline for mutating Memory Store calls (spec §4.1).
//!
//! Transient lock/contention errors are retried up to `attempts` times with
//! backoff doubling from `base_backoff` up to `max_backoff`; every other
//! error kind propagates immediately.

use std::thread::sleep;
use std::time::Duration;

use ambit_config::MemoryConfig;

use crate::types::{StorageError, StorageErrorKind};

pub fn with_retry<T>(
    config: &MemoryConfig,
    mut f: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut attempt = 0;
    let mut backoff = Duration::from_millis(config.retry_base_backoff_ms);
    let max_backoff = Duration::from_millis(config.retry_max_backoff_ms);

    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == StorageErrorKind::Locked && attempt < config.retry_attempts => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "memory store call hit lock contention, retrying");
                sleep(backoff);
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn config() -> MemoryConfig {
        MemoryConfig {
            retry_base_backoff_ms: 1,
            retry_max_backoff_ms: 4,
            ..Default::default()
        }
    }

    #[test]
    fn succeeds_first_try_without_retry() {
        let calls = Cell::new(0);
        let result = with_retry(&config(), || {
            calls.set(calls.get() + 1);
            Ok::<_, StorageError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retries_locked_errors_up_to_the_cap() {
        let calls = Cell::new(0);
        let result = with_retry(&config(), || {
            calls.set(calls.get() + 1);
            Err::<i32, _>(StorageError::Locked("busy".into()))
        });
        assert!(result.is_err());
        // initial attempt + `retry_attempts` (default 3) retries = 4 calls.
        assert_eq!(calls.get(), 1 + config().retry_attempts);
    }

    #[test]
    fn integrity_errors_never_retry() {
        let calls = Cell::new(0);
        let result = with_retry(&config(), || {
            calls.set(calls.get() + 1);
            Err::<i32, _>(StorageError::Integrity("dup".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn recovers_after_transient_lock() {
        let calls = Cell::new(0);
        let result = with_retry(&config(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(StorageError::Locked("busy".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }
}
