//! Transactions with table locks and deadlock retry.
//!
//! One connection is checked out for the whole transaction. Each attempt runs
//! on that connection:
//!
//! 1. `SET autocommit=0`
//! 2. `LOCK TABLES ...` when read/write locks were requested (a failure here ends
//!    the transaction without retry)
//! 3. the callback, with a `Queryable` bound to the connection
//! 4. `COMMIT`, or `ROLLBACK` if the callback or the commit failed
//! 5. `UNLOCK TABLES` when this attempt locked tables or `unlock_after` is set
//!
//! A deadlock with retries left sleeps a random pause and starts over at step 1
//! on the same connection. Whatever happens, the connection is released exactly
//! once afterwards: autocommit is restored and it goes back to the pool, or it
//! is closed if its session state cannot be restored.

use crate::db::connection::{SharedConnection, connection_mut};
use crate::error::{DbError, DbResult};
use crate::models::TransactionOptions;
use rand::Rng;
use sqlx::{AssertSqlSafe, Executor};
use sqlx::mysql::MySqlConnection;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{Instrument, Span, debug, info, warn};

pub(crate) const BEGIN: &str = "SET autocommit=0";
pub(crate) const COMMIT: &str = "COMMIT";
pub(crate) const ROLLBACK: &str = "ROLLBACK";
pub(crate) const UNLOCK: &str = "UNLOCK TABLES";
pub(crate) const RESTORE_AUTOCOMMIT: &str = "SET autocommit=1";

/// The connection-level operations a transaction needs.
pub(crate) trait ControlSession: Send {
    /// Run a transaction control statement.
    fn execute_control(&mut self, sql: &str) -> impl Future<Output = DbResult<()>> + Send;

    /// Give the connection back. Called exactly once, after the last attempt.
    fn release(self) -> impl Future<Output = ()> + Send;
}

/// Generate a unique transaction ID.
pub(crate) fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Run `callback` transactionally on `session`, retrying on deadlock.
pub(crate) async fn run<S, H, T, F, Fut>(
    mut session: S,
    handle: H,
    options: &TransactionOptions,
    mut callback: F,
) -> DbResult<T>
where
    S: ControlSession,
    H: Clone,
    F: FnMut(H) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let result = attempts(&mut session, handle, options, &mut callback).await;
    session.release().await;
    result
}

struct AttemptFailure {
    error: DbError,
    retryable: bool,
}

impl AttemptFailure {
    fn retryable(error: DbError) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    fn fatal(error: DbError) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

async fn attempts<S, H, T, F, Fut>(
    session: &mut S,
    handle: H,
    options: &TransactionOptions,
    callback: &mut F,
) -> DbResult<T>
where
    S: ControlSession,
    H: Clone,
    F: FnMut(H) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let lock = lock_statement(options);
    let mut retries_left = options.retries;
    let mut attempt: u32 = 1;

    loop {
        match run_attempt(session, handle.clone(), options, lock.as_deref(), callback).await {
            Ok(value) => {
                info!(attempt, "Transaction committed");
                return Ok(value);
            }
            Err(failure) if failure.retryable && failure.error.is_deadlock() && retries_left > 0 => {
                retries_left -= 1;
                let pause = retry_delay(options.retry_pause);
                warn!(
                    attempt,
                    retries_left,
                    pause_ms = pause.as_millis() as u64,
                    error = %failure.error,
                    "Deadlock, retrying transaction"
                );
                tokio::time::sleep(pause).await;
                attempt += 1;
            }
            Err(failure) => {
                info!(
                    attempt,
                    class = %failure.error.class(),
                    error = %failure.error,
                    "Transaction rolled back"
                );
                return Err(failure.error);
            }
        }
    }
}

async fn run_attempt<S, H, T, F, Fut>(
    session: &mut S,
    handle: H,
    options: &TransactionOptions,
    lock: Option<&str>,
    callback: &mut F,
) -> Result<T, AttemptFailure>
where
    S: ControlSession,
    F: FnMut(H) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    session
        .execute_control(BEGIN)
        .await
        .map_err(AttemptFailure::fatal)?;

    let mut locked = false;
    if let Some(lock) = lock {
        if let Err(err) = session.execute_control(lock).await {
            finish(session, false, options.unlock_after).await;
            return Err(AttemptFailure::fatal(err));
        }
        locked = true;
    }

    let outcome = match callback(handle).await {
        Ok(value) => session.execute_control(COMMIT).await.map(|()| value),
        Err(err) => Err(err),
    };

    match outcome {
        Ok(value) => {
            if locked || options.unlock_after {
                unlock(session).await;
            }
            Ok(value)
        }
        Err(err) => {
            finish(session, locked, options.unlock_after).await;
            Err(AttemptFailure::retryable(err))
        }
    }
}

/// Roll back a failed attempt and release table locks if needed.
async fn finish<S: ControlSession>(session: &mut S, locked: bool, unlock_after: bool) {
    if let Err(err) = session.execute_control(ROLLBACK).await {
        warn!(error = %err, "Rollback failed");
    }
    if locked || unlock_after {
        unlock(session).await;
    }
}

async fn unlock<S: ControlSession>(session: &mut S) {
    if let Err(err) = session.execute_control(UNLOCK).await {
        warn!(error = %err, "Unlocking tables failed");
    }
}

/// `LOCK TABLES` naming the read tables, then the write tables.
pub(crate) fn lock_statement(options: &TransactionOptions) -> Option<String> {
    if !options.takes_locks() {
        return None;
    }
    let clauses: Vec<String> = options
        .lock_for_read
        .iter()
        .map(|table| format!("{} READ", quote_identifier(table)))
        .chain(
            options
                .lock_for_write
                .iter()
                .map(|table| format!("{} WRITE", quote_identifier(table))),
        )
        .collect();
    Some(format!("LOCK TABLES {}", clauses.join(", ")))
}

/// Backtick-quote a possibly schema-qualified table name.
fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("`{}`", part.replace('`', "``")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Random pause in `[0, max)`.
fn retry_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// The pooled connection a transaction runs on.
pub(crate) struct TxSession {
    conn: SharedConnection,
    released: bool,
}

impl TxSession {
    pub(crate) fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            released: false,
        }
    }
}

impl ControlSession for TxSession {
    async fn execute_control(&mut self, sql: &str) -> DbResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = connection_mut(&mut guard)?;
        debug!(sql, "Transaction control statement");
        conn.execute(AssertSqlSafe(sql)).await?;
        Ok(())
    }

    async fn release(mut self) {
        let taken = self.conn.take().await;
        self.released = true;
        let Some(mut conn) = taken else {
            return;
        };
        let raw: &mut MySqlConnection = &mut conn;
        match raw.execute(RESTORE_AUTOCOMMIT).await {
            Ok(_) => debug!("Transaction connection returned to the pool"),
            Err(err) => {
                warn!(error = %err, "Could not restore autocommit, closing connection");
                conn.close_on_drop();
            }
        }
    }
}

impl Drop for TxSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // The transaction future was dropped or a callback panicked mid-attempt.
        // The session state is unknown, so the connection is closed, not reused.
        let conn = self.conn.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(
                    async move {
                        if let Some(mut conn) = conn.take().await {
                            conn.close_on_drop();
                            warn!("Transaction abandoned, connection closed");
                        }
                    }
                    .instrument(Span::current()),
                );
            }
            Err(_) => warn!("Transaction abandoned outside a runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;
    type FailFn = Box<dyn FnMut(&str) -> Option<DbError> + Send>;

    struct FakeSession {
        log: Log,
        releases: Arc<AtomicUsize>,
        fail: FailFn,
    }

    impl ControlSession for FakeSession {
        async fn execute_control(&mut self, sql: &str) -> DbResult<()> {
            self.log.lock().push(sql.to_string());
            match (self.fail)(sql) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn release(self) {
            self.log.lock().push(RESTORE_AUTOCOMMIT.to_string());
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(fail: FailFn) -> (FakeSession, Log, Arc<AtomicUsize>) {
        let log: Log = Arc::default();
        let releases = Arc::new(AtomicUsize::new(0));
        let session = FakeSession {
            log: Arc::clone(&log),
            releases: Arc::clone(&releases),
            fail,
        };
        (session, log, releases)
    }

    fn no_failures() -> FailFn {
        Box::new(|_| None)
    }

    fn immediate() -> TransactionOptions {
        TransactionOptions::new().with_retry_pause(Duration::ZERO)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (session, log, releases) = session(no_failures());
        let value = run(session, Arc::clone(&log), &immediate(), |log: Log| async move {
            log.lock().push("callback".into());
            Ok(42)
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(
            entries(&log),
            vec![BEGIN, "callback", COMMIT, RESTORE_AUTOCOMMIT]
        );
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rollback_on_callback_error() {
        let (session, log, releases) = session(no_failures());
        let err = run(session, Arc::clone(&log), &immediate(), |log: Log| async move {
            log.lock().push("callback".into());
            Err::<(), _>(DbError::callback("Fail!"))
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "Fail!");
        assert_eq!(
            entries(&log),
            vec![BEGIN, "callback", ROLLBACK, RESTORE_AUTOCOMMIT]
        );
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadlock_retried_on_same_session() {
        let (session, log, releases) = session(no_failures());
        let calls = Arc::new(AtomicUsize::new(0));
        let options = immediate().with_retries(1);
        let value = run(session, Arc::clone(&log), &options, |log: Log| {
            let calls = Arc::clone(&calls);
            async move {
                log.lock().push("callback".into());
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(DbError::deadlock("Deadlock found"))
                } else {
                    Ok("second")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "second");
        assert_eq!(
            entries(&log),
            vec![
                BEGIN,
                "callback",
                ROLLBACK,
                BEGIN,
                "callback",
                COMMIT,
                RESTORE_AUTOCOMMIT
            ]
        );
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadlock_without_retries_surfaces() {
        let (session, log, releases) = session(no_failures());
        let err = run(session, Arc::clone(&log), &immediate(), |_log: Log| async {
            Err::<(), _>(DbError::deadlock("Deadlock found"))
        })
        .await
        .unwrap_err();

        assert!(err.is_deadlock());
        assert_eq!(err.code(), Some(crate::error::ER_LOCK_DEADLOCK));
        assert_eq!(entries(&log).iter().filter(|s| *s == BEGIN).count(), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_not_retried() {
        let (session, log, _) = session(no_failures());
        let options = immediate().with_retries(5);
        let err = run(session, Arc::clone(&log), &options, |_log: Log| async {
            Err::<(), _>(DbError::database("Duplicate entry", Some(1062), None))
        })
        .await
        .unwrap_err();

        assert_eq!(err.code(), Some(1062));
        assert_eq!(entries(&log).iter().filter(|s| *s == BEGIN).count(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_and_retries_deadlock() {
        let mut commits = 0;
        let (session, log, _) = session(Box::new(move |sql| {
            if sql == COMMIT {
                commits += 1;
                if commits == 1 {
                    return Some(DbError::deadlock("at commit"));
                }
            }
            None
        }));
        let options = immediate().with_retries(1);
        run(session, Arc::clone(&log), &options, |_log: Log| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec![BEGIN, COMMIT, ROLLBACK, BEGIN, COMMIT, RESTORE_AUTOCOMMIT]
        );
    }

    #[tokio::test]
    async fn test_table_locks_taken_and_released() {
        let (session, log, _) = session(no_failures());
        let options = immediate()
            .lock_for_read(["test"])
            .lock_for_write(["test2"]);
        run(session, Arc::clone(&log), &options, |_log: Log| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec![
                BEGIN,
                "LOCK TABLES `test` READ, `test2` WRITE",
                COMMIT,
                UNLOCK,
                RESTORE_AUTOCOMMIT
            ]
        );
    }

    #[tokio::test]
    async fn test_lock_failure_is_not_retried() {
        let (session, log, releases) = session(Box::new(|sql| {
            sql.starts_with("LOCK")
                .then(|| DbError::deadlock("lock wait"))
        }));
        let options = immediate().with_retries(3).lock_for_write(["test"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let err = run(session, Arc::clone(&log), &options, |_log: Log| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await
        .unwrap_err();

        assert!(err.is_deadlock());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            entries(&log),
            vec![BEGIN, "LOCK TABLES `test` WRITE", ROLLBACK, RESTORE_AUTOCOMMIT]
        );
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unlock_after_without_locks() {
        let (session, log, _) = session(no_failures());
        let options = immediate().with_unlock_after(true);
        run(session, Arc::clone(&log), &options, |_log: Log| async {
            Err::<(), _>(DbError::callback("nope"))
        })
        .await
        .unwrap_err();

        assert_eq!(
            entries(&log),
            vec![BEGIN, ROLLBACK, UNLOCK, RESTORE_AUTOCOMMIT]
        );
    }

    #[tokio::test]
    async fn test_no_unlock_without_locks() {
        let (session, log, _) = session(no_failures());
        run(session, Arc::clone(&log), &immediate(), |_log: Log| async { Ok(()) })
            .await
            .unwrap();
        assert!(!entries(&log).iter().any(|s| s == UNLOCK));
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_original_error() {
        let (session, log, releases) = session(Box::new(|sql| {
            (sql == ROLLBACK).then(|| DbError::connection("gone", "reconnect"))
        }));
        let err = run(session, Arc::clone(&log), &immediate(), |_log: Log| async {
            Err::<(), _>(DbError::callback("Fail!"))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, DbError::Callback(_)));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pause_is_bounded() {
        let (session, log, _) = session(no_failures());
        let options = TransactionOptions::new()
            .with_retries(2)
            .with_retry_pause(Duration::from_millis(100));
        let started = tokio::time::Instant::now();
        let err = run(session, Arc::clone(&log), &options, |_log: Log| async {
            Err::<(), _>(DbError::deadlock("again"))
        })
        .await
        .unwrap_err();

        assert!(err.is_deadlock());
        assert_eq!(entries(&log).iter().filter(|s| *s == BEGIN).count(), 3);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_lock_statement() {
        assert_eq!(lock_statement(&TransactionOptions::new()), None);
        let options = TransactionOptions::new()
            .lock_for_read(["a", "shop.b"])
            .lock_for_write(["we`ird"]);
        assert_eq!(
            lock_statement(&options).as_deref(),
            Some("LOCK TABLES `a` READ, `shop`.`b` READ, `we``ird` WRITE")
        );
    }

    #[test]
    fn test_retry_delay_range() {
        assert_eq!(retry_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..100 {
            assert!(retry_delay(Duration::from_millis(50)) < Duration::from_millis(50));
        }
    }

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
    }
}
