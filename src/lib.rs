//! mysql-queryable
//!
//! A connection-pooled MySQL access layer on top of sqlx:
//!
//! - buffered statements with row/value/write projections (`getall`, `getrow`,
//!   `getval`, `getvals`, `insert`, `update`, `delete`, `execute`)
//! - consumer-paced row streams with backpressure and cancellation
//! - transactions with optional table locks and automatic deadlock retry
//! - a readiness gate for servers that are still starting up
//!
//! ```no_run
//! use mysql_queryable::{Db, DbResult, binds};
//! use futures_util::StreamExt;
//!
//! # async fn demo() -> DbResult<()> {
//! let db = Db::from_env()?;
//! db.wait().await?;
//!
//! let id = db.insert("INSERT INTO test (name) VALUES (?)", ["name 1"]).await?;
//! let _row = db.getrow("SELECT * FROM test WHERE id=:id", binds! { "id" => id }).await?;
//!
//! let mut rows = db.stream("SELECT * FROM test", ());
//! while let Some(row) = rows.next().await {
//!     println!("{}", serde_json::to_string(&row?).unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{DbConfig, PoolOptions};
pub use db::{Db, Queryable, RowIterator, RowStream};
pub use error::{DbError, DbResult};
pub use models::{
    Binds, QueryOptions, QueryOutcome, QueryParam, Row, RowShape, StreamOptions,
    TransactionOptions, WriteResult,
};
