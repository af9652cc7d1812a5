//! Data models for mysql-queryable.
//!
//! This module re-exports all model types used throughout the crate.

pub mod query;
pub mod row;
pub mod transaction;

// Re-export commonly used types
pub use query::{
    Binds, DEFAULT_HIGH_WATER_MARK, DEFAULT_QUERY_TIMEOUT_SECS, MAX_QUERY_TIMEOUT_SECS,
    QueryOptions, QueryOutcome, QueryParam, RowShape, StreamOptions, WriteResult,
};
pub use row::Row;
pub use transaction::{DEFAULT_RETRY_PAUSE_MS, TransactionOptions};
