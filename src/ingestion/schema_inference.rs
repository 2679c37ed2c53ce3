//! Schema Inference - Deterministic column typing from row batches
//!
//! Used to pick polars dtypes when a batch becomes a `DataFrame` and SQLite
//! column affinities when a batch creates a table.

use crate::ingestion::batch::RowBatch;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar type of a column across every row of a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Every cell was null
    Null,
    Boolean,
    Integer,
    Float,
    Text,
}

impl ColumnType {
    /// Declared SQLite type. `None` for all-null columns: no declared type
    /// means no affinity, so later values keep their own storage class.
    pub fn sql_type(&self) -> Option<&'static str> {
        match self {
            ColumnType::Integer | ColumnType::Boolean => Some("INTEGER"),
            ColumnType::Float => Some("REAL"),
            ColumnType::Text => Some("TEXT"),
            ColumnType::Null => None,
        }
    }
}

/// Inferred column information
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferredColumn {
    pub name: String,
    pub data_type: ColumnType,
    pub nullable: bool,
}

/// Schema Inference Engine
pub struct SchemaInference;

impl SchemaInference {
    pub fn new() -> Self {
        Self
    }

    /// Infer one column per batch column, in batch column order.
    pub fn infer_schema(&self, batch: &RowBatch) -> Vec<InferredColumn> {
        batch
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let mut data_type = ColumnType::Null;
                let mut nullable = false;
                for row in batch.rows() {
                    let cell = row.get(idx).unwrap_or(&Value::Null);
                    match Self::cell_type(cell) {
                        ColumnType::Null => nullable = true,
                        t => data_type = Self::merge_types(data_type, t),
                    }
                }
                InferredColumn {
                    name: name.clone(),
                    data_type,
                    nullable,
                }
            })
            .collect()
    }

    fn cell_type(value: &Value) -> ColumnType {
        match value {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) => {
                if n.is_f64() {
                    ColumnType::Float
                } else {
                    ColumnType::Integer
                }
            }
            Value::String(s) if s.is_empty() => ColumnType::Null,
            _ => ColumnType::Text,
        }
    }

    fn merge_types(current: ColumnType, next: ColumnType) -> ColumnType {
        if current == next {
            return current;
        }

        match (current, next) {
            (ColumnType::Null, t) | (t, ColumnType::Null) => t,
            (ColumnType::Integer, ColumnType::Float) | (ColumnType::Float, ColumnType::Integer) => {
                ColumnType::Float
            }
            _ => ColumnType::Text,
        }
    }
}

impl Default for SchemaInference {
    fn default() -> Self {
        Self::new()
    }
}
