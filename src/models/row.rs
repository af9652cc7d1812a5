//! Result rows.

use crate::error::{DbError, DbResult};
use crate::models::RowShape;
use serde::de::DeserializeOwned;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use std::sync::Arc;

/// One result row: column names shared across the result set, values decoded to JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    /// Source table per column, empty for computed columns. Only kept for
    /// shapes that group or prefix by table.
    tables: Option<Arc<[String]>>,
    values: Vec<JsonValue>,
    shape: RowShape,
}

impl Row {
    /// Create a row. `values` must be in column order.
    pub fn new(columns: Arc<[String]>, values: Vec<JsonValue>, shape: RowShape) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self {
            columns,
            tables: None,
            values,
            shape,
        }
    }

    /// Attach the source table of each column, in column order.
    pub fn with_tables(mut self, tables: Arc<[String]>) -> Self {
        debug_assert_eq!(tables.len(), self.columns.len());
        self.tables = Some(tables);
        self
    }

    /// Column names in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in column order.
    pub fn values(&self) -> &[JsonValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<JsonValue> {
        self.values
    }

    pub fn shape(&self) -> RowShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Source table of a column; empty for computed columns or when unknown.
    pub fn table(&self, idx: usize) -> Option<&str> {
        match &self.tables {
            Some(tables) => tables.get(idx).map(String::as_str),
            None => (idx < self.columns.len()).then_some(""),
        }
    }

    /// Value of a column by name. With duplicate names the last one wins, matching
    /// what the object form shows. With [`RowShape::Prefixed`] the name is the
    /// prefixed key (`table_column`).
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        (0..self.columns.len())
            .rev()
            .find(|&idx| self.key(idx) == column)
            .map(|idx| &self.values[idx])
    }

    /// Value of a column of a given source table.
    pub fn get_in(&self, table: &str, column: &str) -> Option<&JsonValue> {
        (0..self.columns.len())
            .rev()
            .find(|&idx| self.columns[idx] == column && self.table(idx) == Some(table))
            .map(|idx| &self.values[idx])
    }

    /// Value of a column by position.
    pub fn get_index(&self, idx: usize) -> Option<&JsonValue> {
        self.values.get(idx)
    }

    /// Value of the first column.
    pub fn first(&self) -> Option<&JsonValue> {
        self.values.first()
    }

    /// Decode one column into `T`. `Ok(None)` when the column is missing or NULL.
    pub fn get_as<T: DeserializeOwned>(&self, column: &str) -> DbResult<Option<T>> {
        match self.get(column) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| DbError::decode(format!("column '{}': {}", column, e))),
        }
    }

    /// Decode the whole row (as a map, see [`Row::to_map`]) into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> DbResult<T> {
        serde_json::from_value(JsonValue::Object(self.to_map()))
            .map_err(|e| DbError::decode(e.to_string()))
    }

    /// The row as a map: column to value, or table to column map for
    /// [`RowShape::Nested`]. The array shape maps like the object shape.
    pub fn to_map(&self) -> serde_json::Map<String, JsonValue> {
        if self.shape != RowShape::Nested {
            return (0..self.columns.len())
                .map(|idx| (self.key(idx).into_owned(), self.values[idx].clone()))
                .collect();
        }

        let mut tables = serde_json::Map::new();
        for (idx, (column, value)) in self.columns.iter().zip(&self.values).enumerate() {
            let table = self.table(idx).unwrap_or_default();
            let entry = tables
                .entry(table)
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            if let JsonValue::Object(columns) = entry {
                columns.insert(column.clone(), value.clone());
            }
        }
        tables
    }

    /// Map key of a column under the row's shape.
    fn key(&self, idx: usize) -> Cow<'_, str> {
        let column = self.columns[idx].as_str();
        match (self.shape, self.table(idx)) {
            (RowShape::Prefixed, Some(table)) if !table.is_empty() => {
                Cow::Owned(format!("{}_{}", table, column))
            }
            _ => Cow::Borrowed(column),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.shape {
            RowShape::Object => {
                let mut map = serializer.serialize_map(Some(self.values.len()))?;
                for (column, value) in self.columns.iter().zip(&self.values) {
                    map.serialize_entry(column, value)?;
                }
                map.end()
            }
            RowShape::Nested | RowShape::Prefixed => self.to_map().serialize(serializer),
            RowShape::Array => {
                let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
                for value in &self.values {
                    seq.serialize_element(value)?;
                }
                seq.end()
            }
        }
    }
}
