//! Exclusively owned pooled connections.
//!
//! A transaction checks one connection out of the pool and shares it between
//! the transaction manager (control statements) and the `Queryable` handed to
//! the callback. Statements serialize on the mutex, which is fair, so they run
//! in the order they were issued. Releasing takes the connection out of the
//! slot, so it can happen only once and later use fails with `DbError::Released`.

use crate::error::{DbError, DbResult};
use sqlx::MySql;
use sqlx::mysql::MySqlConnection;
use sqlx::pool::PoolConnection;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub(crate) type ConnectionGuard = OwnedMutexGuard<Option<PoolConnection<MySql>>>;

#[derive(Debug, Clone)]
pub(crate) struct SharedConnection {
    slot: Arc<Mutex<Option<PoolConnection<MySql>>>>,
}

impl SharedConnection {
    pub(crate) fn new(conn: PoolConnection<MySql>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(conn))),
        }
    }

    /// Wait for exclusive use of the connection.
    pub(crate) async fn lock(&self) -> ConnectionGuard {
        Arc::clone(&self.slot).lock_owned().await
    }

    /// Take the connection without waiting, if nobody is using it.
    pub(crate) fn try_lock(&self) -> Option<ConnectionGuard> {
        Arc::clone(&self.slot).try_lock_owned().ok()
    }

    /// Remove the connection from the slot once every earlier user is done with it.
    pub(crate) async fn take(&self) -> Option<PoolConnection<MySql>> {
        self.slot.lock().await.take()
    }
}

/// The live connection behind a guard, or `Released` once it went back to the pool.
pub(crate) fn connection_mut(guard: &mut ConnectionGuard) -> DbResult<&mut MySqlConnection> {
    match guard.as_mut() {
        Some(conn) => Ok(&mut **conn),
        None => Err(DbError::Released),
    }
}

/// Where a lazily started statement gets its connection from.
pub(crate) enum Lease {
    /// Already holding the lock (taken when the statement was issued).
    Held(ConnectionGuard),
    /// Queue behind whoever holds it now.
    Waiting(SharedConnection),
}

impl Lease {
    /// Claim the connection, keeping issue order when it is free right now.
    pub(crate) fn claim(conn: &SharedConnection) -> Self {
        match conn.try_lock() {
            Some(guard) => Self::Held(guard),
            None => Self::Waiting(conn.clone()),
        }
    }

    pub(crate) async fn acquire(self) -> ConnectionGuard {
        match self {
            Self::Held(guard) => guard,
            Self::Waiting(conn) => conn.lock().await,
        }
    }
}
