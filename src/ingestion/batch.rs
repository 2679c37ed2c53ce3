//! Row batches - the tabular unit that flows from the fetcher to the sinks

use crate::error::{IngestError, Result};
use crate::ingestion::schema_inference::{ColumnType, SchemaInference};
use polars::prelude::*;
use serde_json::Value;
use std::collections::HashMap;

pub type Row = Vec<Value>;

/// Ordered rows sharing one column list. Every row has exactly
/// `columns.len()` cells.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowBatch {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl RowBatch {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a batch from rows, padding short rows with nulls and cutting long ones.
    pub fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let mut batch = Self::new(columns);
        for row in rows {
            batch.push_row(row);
        }
        batch
    }

    /// Build a batch from flat JSON objects. Columns are the union of keys in
    /// first-seen order; keys missing from an object become nulls.
    pub fn from_objects(objects: &[Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for (pos, object) in objects.iter().enumerate() {
            let map = object.as_object().ok_or_else(|| {
                IngestError::MalformedResponse(format!("row {} is not a JSON object", pos))
            })?;
            for key in map.keys() {
                if !index.contains_key(key) {
                    index.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }

        let mut rows = Vec::with_capacity(objects.len());
        for object in objects {
            let mut row = vec![Value::Null; columns.len()];
            if let Some(map) = object.as_object() {
                for (key, value) in map {
                    if let Some(&idx) = index.get(key) {
                        row[idx] = value.clone();
                    }
                }
            }
            rows.push(row);
        }

        Ok(Self { columns, rows })
    }

    /// Build a batch from a JSON array of arrays whose first row is the header.
    pub fn from_header_rows(rows: &[Value]) -> Result<Self> {
        let (header, body) = rows
            .split_first()
            .ok_or_else(|| IngestError::MalformedResponse("missing header row".to_string()))?;

        let columns = header
            .as_array()
            .ok_or_else(|| IngestError::MalformedResponse("header row is not an array".to_string()))?
            .iter()
            .map(|cell| match cell {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>();

        let mut batch = Self::new(columns);
        for (pos, row) in body.iter().enumerate() {
            let cells = row.as_array().ok_or_else(|| {
                IngestError::MalformedResponse(format!("row {} is not an array", pos + 1))
            })?;
            batch.push_row(cells.clone());
        }
        Ok(batch)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn push_row(&mut self, mut row: Row) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Set a column's values, replacing it when it already exists.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) {
        let idx = match self.column_index(name) {
            Some(idx) => idx,
            None => {
                self.columns.push(name.to_string());
                for row in &mut self.rows {
                    row.push(Value::Null);
                }
                self.columns.len() - 1
            }
        };
        for (row, value) in self.rows.iter_mut().zip(values) {
            row[idx] = value;
        }
    }

    pub fn drop_columns(&mut self, names: &[&str]) {
        let keep: Vec<bool> = self
            .columns
            .iter()
            .map(|c| !names.contains(&c.as_str()))
            .collect();
        if keep.iter().all(|k| *k) {
            return;
        }

        let mut flags = keep.iter();
        self.columns.retain(|_| *flags.next().unwrap_or(&true));
        for row in &mut self.rows {
            let mut flags = keep.iter();
            row.retain(|_| *flags.next().unwrap_or(&true));
        }
    }

    pub fn rename_column(&mut self, from: &str, to: &str) {
        if let Some(idx) = self.column_index(from) {
            self.columns[idx] = to.to_string();
        }
    }

    /// Keep only the rows for which `keep` returns true.
    pub fn retain_rows<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Row) -> bool,
    {
        self.rows.retain(|row| keep(row));
    }

    /// Append another batch, aligning its cells by column name.
    ///
    /// A batch without columns adopts the incoming ones; rows it already
    /// holds become all-null rows. Otherwise columns the incoming batch lacks
    /// become nulls and columns this batch lacks are dropped. Returns the
    /// names of dropped columns.
    pub fn append(&mut self, other: RowBatch) -> Vec<String> {
        if self.columns.is_empty() {
            let width = other.columns.len();
            let mut rows: Vec<Row> = (0..self.rows.len()).map(|_| vec![Value::Null; width]).collect();
            rows.extend(other.rows);
            self.columns = other.columns;
            self.rows = rows;
            return Vec::new();
        }
        if other.columns == self.columns {
            self.rows.extend(other.rows);
            return Vec::new();
        }

        let mapping: Vec<Option<usize>> = self
            .columns
            .iter()
            .map(|c| other.column_index(c))
            .collect();
        let dropped = other
            .columns
            .iter()
            .filter(|c| !self.columns.contains(c))
            .cloned()
            .collect();

        for mut row in other.rows {
            let aligned = mapping
                .iter()
                .map(|src| match src {
                    Some(idx) => std::mem::take(&mut row[*idx]),
                    None => Value::Null,
                })
                .collect();
            self.rows.push(aligned);
        }
        dropped
    }

    /// Remove up to `n` rows from the front, keeping the column list.
    pub fn split_front(&mut self, n: usize) -> RowBatch {
        let n = n.min(self.rows.len());
        let rows = self.rows.drain(..n).collect();
        RowBatch {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Move every row out, keeping the column list.
    pub fn take_rows(&mut self) -> RowBatch {
        RowBatch {
            columns: self.columns.clone(),
            rows: std::mem::take(&mut self.rows),
        }
    }

    /// Convert into a polars `DataFrame`, typing each column from its cells.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        if self.columns.is_empty() {
            return Ok(DataFrame::empty());
        }

        let schema = SchemaInference::new().infer_schema(self);
        let mut series = Vec::with_capacity(self.columns.len());

        for (idx, column) in schema.iter().enumerate() {
            let cells = self.rows.iter().map(|row| &row[idx]);
            let s = match column.data_type {
                ColumnType::Integer => {
                    Series::new(&column.name, cells.map(Value::as_i64).collect::<Vec<_>>())
                }
                ColumnType::Float => {
                    Series::new(&column.name, cells.map(Value::as_f64).collect::<Vec<_>>())
                }
                ColumnType::Boolean => {
                    Series::new(&column.name, cells.map(Value::as_bool).collect::<Vec<_>>())
                }
                ColumnType::Null | ColumnType::Text => Series::new(
                    &column.name,
                    cells
                        .map(|v| match v {
                            Value::Null => None,
                            other => Some(cell_to_string(other)),
                        })
                        .collect::<Vec<Option<String>>>(),
                ),
            };
            series.push(s);
        }

        Ok(DataFrame::new(series)?)
    }
}

/// Render one cell the way it is written to CSV.
pub fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_objects_keeps_first_seen_column_order() {
        let batch = RowBatch::from_objects(&[
            json!({"state_code": "06", "county_code": "073", "sample_measurement": 12.5}),
            json!({"state_code": "06", "extra": 1}),
        ])
        .unwrap();

        assert_eq!(
            batch.columns(),
            &["state_code", "county_code", "sample_measurement", "extra"]
        );
        assert_eq!(batch.get(1, "county_code"), Some(&Value::Null));
        assert_eq!(batch.get(1, "extra"), Some(&json!(1)));
    }

    #[test]
    fn test_from_objects_rejects_non_objects() {
        let err = RowBatch::from_objects(&[json!([1, 2])]).unwrap_err();
        assert!(matches!(err, IngestError::MalformedResponse(_)));
    }

    #[test]
    fn test_from_header_rows() {
        let batch = RowBatch::from_header_rows(&[
            json!(["NAME", "DP05_0001E", "state", "county"]),
            json!(["Alameda County, California", "1600000", "06", "001"]),
        ])
        .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(0, "county"), Some(&json!("001")));
        assert!(RowBatch::from_header_rows(&[]).is_err());
    }

    #[test]
    fn test_append_aligns_by_name() {
        let mut acc = RowBatch::with_rows(
            vec!["a".into(), "b".into()],
            vec![vec![json!(1), json!(2)]],
        );
        let dropped = acc.append(RowBatch::with_rows(
            vec!["b".into(), "c".into()],
            vec![vec![json!(20), json!(30)]],
        ));

        assert_eq!(dropped, vec!["c".to_string()]);
        assert_eq!(acc.rows()[1], vec![Value::Null, json!(20)]);
    }

    #[test]
    fn test_append_to_empty_adopts_schema() {
        let mut acc = RowBatch::default();
        acc.append(RowBatch::with_rows(vec!["x".into()], vec![vec![json!("v")]]));
        assert_eq!(acc.columns(), &["x"]);
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn test_columnless_rows_adopt_later_schema() {
        let mut acc = RowBatch::from_objects(&[json!({})]).unwrap();
        assert!(acc.columns().is_empty());
        assert_eq!(acc.len(), 1);

        acc.append(RowBatch::with_rows(
            vec!["FIPS".into(), "sample_measurement".into()],
            vec![vec![json!("06073"), json!(12.5)]],
        ));
        assert_eq!(acc.columns(), &["FIPS", "sample_measurement"]);
        assert_eq!(acc.len(), 2);
        assert_eq!(acc.rows()[0], vec![Value::Null, Value::Null]);
        assert_eq!(acc.get(1, "sample_measurement"), Some(&json!(12.5)));
    }

    #[test]
    fn test_split_front_and_drop_columns() {
        let mut batch = RowBatch::with_rows(
            vec!["a".into(), "b".into(), "c".into()],
            (0..5).map(|i| vec![json!(i), json!(i * 2), json!("x")]).collect(),
        );
        batch.drop_columns(&["b"]);
        let head = batch.split_front(3);

        assert_eq!(head.len(), 3);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.columns(), &["a", "c"]);
        assert_eq!(batch.rows()[0], vec![json!(3), json!("x")]);
    }

    #[test]
    fn test_to_dataframe_types_columns() {
        let batch = RowBatch::from_objects(&[
            json!({"FIPS": "06073", "sample_measurement": 12.5, "year": 2020}),
            json!({"FIPS": "06001", "sample_measurement": 3, "year": null}),
        ])
        .unwrap();

        let df = batch.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.column("sample_measurement").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("year").unwrap().dtype(), &DataType::Int64);
        assert_eq!(df.column("FIPS").unwrap().str().unwrap().get(0), Some("06073"));
    }
}
