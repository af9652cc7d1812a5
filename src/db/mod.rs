//! Database layer.
//!
//! - `Db`: pool owner, readiness gate, transactions
//! - `Queryable`: buffered statements and their projections
//! - Row streams with backpressure and cancellation
//! - Transaction manager with table locks and deadlock retry
//! - Bind handling and MySQL type mappings

mod connection;
pub mod database;
#[macro_use]
pub mod macros;
pub(crate) mod params;
pub mod queryable;
pub(crate) mod statement;
pub mod stream;
pub(crate) mod transaction;
pub mod types;

pub use database::Db;
pub use queryable::Queryable;
pub use stream::{RowIterator, RowStream};
