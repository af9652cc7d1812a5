//! Transaction options.

use std::time::Duration;

/// Default upper bound of the random pause before a deadlock retry.
pub const DEFAULT_RETRY_PAUSE_MS: u64 = 100;

/// How a transaction is demarcated and retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    /// How many times the whole callback is re-run after a deadlock.
    pub retries: u32,
    /// Upper bound of the random delay before each retry.
    pub retry_pause: Duration,
    /// Tables locked with `READ` for the duration of each attempt.
    pub lock_for_read: Vec<String>,
    /// Tables locked with `WRITE` for the duration of each attempt.
    pub lock_for_write: Vec<String>,
    /// Issue `UNLOCK TABLES` even if this transaction took no lock itself.
    pub unlock_after: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            retry_pause: Duration::from_millis(DEFAULT_RETRY_PAUSE_MS),
            lock_for_read: Vec::new(),
            lock_for_write: Vec::new(),
            unlock_after: false,
        }
    }
}

impl TransactionOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of deadlock retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the maximum jitter before a retry.
    pub fn with_retry_pause(mut self, retry_pause: Duration) -> Self {
        self.retry_pause = retry_pause;
        self
    }

    /// Lock the given tables for reading.
    pub fn lock_for_read<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_for_read.extend(tables.into_iter().map(Into::into));
        self
    }

    /// Lock the given tables for writing.
    pub fn lock_for_write<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_for_write.extend(tables.into_iter().map(Into::into));
        self
    }

    /// Always unlock tables when an attempt finishes.
    pub fn with_unlock_after(mut self, unlock_after: bool) -> Self {
        self.unlock_after = unlock_after;
        self
    }

    /// True when the attempt takes table locks.
    pub fn takes_locks(&self) -> bool {
        !self.lock_for_read.is_empty() || !self.lock_for_write.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransactionOptions::new();
        assert_eq!(options.retries, 0);
        assert_eq!(
            options.retry_pause,
            Duration::from_millis(DEFAULT_RETRY_PAUSE_MS)
        );
        assert!(!options.takes_locks());
        assert!(!options.unlock_after);
    }

    #[test]
    fn test_lock_builders() {
        let options = TransactionOptions::new()
            .lock_for_read(["test"])
            .lock_for_write(vec!["test2".to_string()]);
        assert!(options.takes_locks());
        assert_eq!(options.lock_for_read, vec!["test"]);
        assert_eq!(options.lock_for_write, vec!["test2"]);
    }
}
