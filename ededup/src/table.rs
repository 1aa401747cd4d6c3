//! The tabular data a worker deduplicates: one table per corpus partition,
//! each row a JSON object holding the content column plus passthrough fields.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Row = Map<String, Value>;

/// Identifies a row across the whole corpus: the partition it came from and
/// its position within that partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowRef {
    pub partition: Arc<str>,
    pub row_id: u64,
}

impl RowRef {
    pub fn new(partition: Arc<str>, row_id: u64) -> Self {
        Self { partition, row_id }
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.row_id)
    }
}

/// A partition's rows and the columns its schema declares.
///
/// A column can be declared while some rows lack a value for it; a missing
/// declaration means the whole partition lacks the column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Records the source could not parse into rows and left out.
    #[serde(default)]
    pub malformed_rows: u64,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            malformed_rows: 0,
        }
    }

    /// Build a table whose schema is every key seen across the rows, in
    /// first-seen order.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        Self::new(columns, rows)
    }

    pub fn with_malformed_rows(mut self, malformed_rows: u64) -> Self {
        self.malformed_rows = malformed_rows;
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Same schema, no rows.
    pub fn empty_like(&self) -> Self {
        Self::new(self.columns.clone(), Vec::new())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The content of `row` under `column`, if it is text.
pub fn content<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}
