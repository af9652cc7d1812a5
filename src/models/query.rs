//! Query-related data models.
//!
//! This module defines bind parameters, per-statement options and the shapes a
//! statement result can take.

use crate::models::Row;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 3600;

/// Default number of rows a stream buffers ahead of its consumer.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Unsigned integer value (for BIGINT UNSIGNED columns)
    UInt(u64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// JSON document
    Json(JsonValue),
    /// Point in time, sent as a UTC DATETIME
    DateTime(DateTime<Utc>),
    /// Wall-clock DATETIME without a zone
    NaiveDateTime(NaiveDateTime),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::UInt(_) => "uint",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
            Self::DateTime(_) => "datetime",
            Self::NaiveDateTime(_) => "naive_datetime",
        }
    }
}

macro_rules! impl_param_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for QueryParam {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )+
    };
}

impl_param_from! {
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    u64 => UInt,
    f32 => Float,
    f64 => Float,
    String => String,
    &str => String,
    Vec<u8> => Bytes,
    DateTime<Utc> => DateTime,
    NaiveDateTime => NaiveDateTime,
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(QueryParam::Null)
    }
}

/// JSON scalars map onto their natural parameter type; arrays and objects are
/// sent as JSON documents.
impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::UInt(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

/// Bind values for one statement: positional (`?`) or named (`:name`).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Binds {
    #[default]
    None,
    Positional(Vec<QueryParam>),
    Named(BTreeMap<String, QueryParam>),
}

impl Binds {
    /// True when no values are bound.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::None => true,
            Self::Positional(params) => params.is_empty(),
            Self::Named(params) => params.is_empty(),
        }
    }

    /// Number of bound values.
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Positional(params) => params.len(),
            Self::Named(params) => params.len(),
        }
    }
}

impl From<()> for Binds {
    fn from(_: ()) -> Self {
        Self::None
    }
}

impl<T: Into<QueryParam>> From<Vec<T>> for Binds {
    fn from(params: Vec<T>) -> Self {
        Self::Positional(params.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<QueryParam>, const N: usize> From<[T; N]> for Binds {
    fn from(params: [T; N]) -> Self {
        Self::Positional(params.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, T: Into<QueryParam>> From<BTreeMap<K, T>> for Binds {
    fn from(params: BTreeMap<K, T>) -> Self {
        Self::Named(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<K: Into<String>, T: Into<QueryParam>> From<HashMap<K, T>> for Binds {
    fn from(params: HashMap<K, T>) -> Self {
        Self::Named(
            params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// How rows are laid out when serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowShape {
    /// `{"column": value, ...}`
    #[default]
    Object,
    /// `[value, ...]` in column order
    Array,
    /// `{"table": {"column": value, ...}, ...}`; computed columns go under `""`.
    /// Joins whose tables share column names keep every value.
    Nested,
    /// `{"table_column": value, ...}`; computed columns keep their plain name.
    Prefixed,
}

impl RowShape {
    /// True when rows need the source table of each column.
    pub fn needs_tables(self) -> bool {
        matches!(self, Self::Nested | Self::Prefixed)
    }
}

/// Options applied to every statement a `Queryable` issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Keep the statement prepared on the server and reuse it on later calls.
    pub prepared: bool,
    pub row_shape: RowShape,
    /// Applies to buffered queries only; streams are consumer paced.
    pub timeout: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            prepared: false,
            row_shape: RowShape::Object,
            timeout: Some(Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS)),
        }
    }
}

impl QueryOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Save the statement as a server-side prepared statement.
    pub fn with_prepared(mut self, prepared: bool) -> Self {
        self.prepared = prepared;
        self
    }

    /// Set the row shape.
    pub fn with_row_shape(mut self, row_shape: RowShape) -> Self {
        self.row_shape = row_shape;
        self
    }

    /// Set the timeout, clamped to `MAX_QUERY_TIMEOUT_SECS`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout.min(Duration::from_secs(MAX_QUERY_TIMEOUT_SECS)));
        self
    }

    /// Disable the timeout.
    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

/// Options for a row stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Rows buffered ahead of the consumer before the connection is paused.
    pub high_water_mark: usize,
    pub prepared: bool,
    pub row_shape: RowShape,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            prepared: false,
            row_shape: RowShape::Object,
        }
    }
}

impl StreamOptions {
    /// Create stream options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the high water mark (at least 1).
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark.max(1);
        self
    }

    pub fn with_prepared(mut self, prepared: bool) -> Self {
        self.prepared = prepared;
        self
    }

    pub fn with_row_shape(mut self, row_shape: RowShape) -> Self {
        self.row_shape = row_shape;
        self
    }
}

impl From<&QueryOptions> for StreamOptions {
    fn from(options: &QueryOptions) -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            prepared: options.prepared,
            row_shape: options.row_shape,
        }
    }
}

/// Result of a mutation statement (INSERT/UPDATE/DELETE/DDL).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    pub affected_rows: u64,
    /// Last AUTO_INCREMENT value generated, 0 when none was
    pub insert_id: u64,
}

/// What a statement produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutcome {
    /// The statement returns rows (SELECT, SHOW, ...), possibly none.
    Rows(Vec<Row>),
    /// The statement modified data or schema.
    Write(WriteResult),
}

impl QueryOutcome {
    /// Rows returned, if this was a row-returning statement.
    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            Self::Rows(rows) => Some(rows),
            Self::Write(_) => None,
        }
    }

    /// Write summary, if this was a mutation statement.
    pub fn write_result(&self) -> Option<WriteResult> {
        match self {
            Self::Rows(_) => None,
            Self::Write(result) => Some(*result),
        }
    }

    /// Get the number of rows in the result (affected rows for writes).
    pub fn row_count(&self) -> u64 {
        match self {
            Self::Rows(rows) => rows.len() as u64,
            Self::Write(result) => result.affected_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::from(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::from(u64::MAX).type_name(), "uint");
        assert_eq!(QueryParam::from(None::<i32>), QueryParam::Null);
    }

    #[test]
    fn test_query_param_from_json() {
        assert_eq!(QueryParam::from(json!(15)), QueryParam::Int(15));
        assert_eq!(QueryParam::from(json!(1.5)), QueryParam::Float(1.5));
        assert_eq!(
            QueryParam::from(json!("name 5")),
            QueryParam::String("name 5".into())
        );
        assert_eq!(QueryParam::from(json!(null)), QueryParam::Null);
        assert_eq!(
            QueryParam::from(json!({"a": 1})),
            QueryParam::Json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_binds_conversions() {
        assert!(Binds::from(()).is_empty());
        let positional = Binds::from(["name 1", "name 2"]);
        assert_eq!(positional.len(), 2);
        let named = Binds::from(BTreeMap::from([("id", 15)]));
        assert!(matches!(named, Binds::Named(ref m) if m["id"] == QueryParam::Int(15)));
    }

    #[test]
    fn test_row_shape_tables() {
        assert!(RowShape::Nested.needs_tables());
        assert!(RowShape::Prefixed.needs_tables());
        assert!(!RowShape::Object.needs_tables());
        assert_eq!(serde_json::to_value(RowShape::Prefixed).unwrap(), json!("prefixed"));
    }

    #[test]
    fn test_query_options_defaults() {
        let options = QueryOptions::new();
        assert!(!options.prepared);
        assert_eq!(options.row_shape, RowShape::Object);
        assert_eq!(
            options.timeout,
            Some(Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS))
        );
    }

    #[test]
    fn test_query_options_timeout_clamped() {
        let options = QueryOptions::new().with_timeout(Duration::from_secs(999_999));
        assert_eq!(
            options.timeout,
            Some(Duration::from_secs(MAX_QUERY_TIMEOUT_SECS))
        );
        assert_eq!(QueryOptions::new().without_timeout().timeout, None);
    }

    #[test]
    fn test_stream_options_high_water_mark_at_least_one() {
        assert_eq!(StreamOptions::new().with_high_water_mark(0).high_water_mark, 1);
        assert_eq!(StreamOptions::new().high_water_mark, DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn test_outcome_accessors() {
        let write = QueryOutcome::Write(WriteResult {
            affected_rows: 3,
            insert_id: 7,
        });
        assert_eq!(write.row_count(), 3);
        assert_eq!(write.write_result().map(|w| w.insert_id), Some(7));
        assert!(write.rows().is_none());

        let rows = QueryOutcome::Rows(Vec::new());
        assert_eq!(rows.row_count(), 0);
        assert!(rows.write_result().is_none());
    }
}
