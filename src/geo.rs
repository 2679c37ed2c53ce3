//! Geo keys - county FIPS derivation and joins on it
//!
//! The FIPS key is the 2-digit state code followed by the 3-digit county
//! code, both zero-padded. It is the join key between air-quality samples
//! and census tables.

use crate::error::{IngestError, Result};
use crate::ingestion::batch::RowBatch;
use crate::ingestion::transform::RowTransform;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const FIPS_COLUMN: &str = "FIPS";

/// Derive the 5-character county key from state and county codes.
pub fn derive_key(state: &str, county: &str) -> String {
    format!("{}{}", zfill(&normalize_code(state), 2), zfill(&normalize_code(county), 3))
}

/// Left-pad with zeros to `width`; longer codes are kept as they are.
fn zfill(code: &str, width: usize) -> String {
    format!("{:0>width$}", code, width = width)
}

/// Trim and drop a float-style `.0` suffix ("6.0" -> "6").
fn normalize_code(code: &str) -> String {
    let code = code.trim();
    match code.split_once('.') {
        Some((whole, frac)) if !whole.is_empty() && frac.chars().all(|c| c == '0') => {
            whole.to_string()
        }
        _ => code.to_string(),
    }
}

fn code_from_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Row transform adding a FIPS column from state and county columns.
/// Rows with a null state or county get a null key.
pub struct FipsColumn {
    state_column: String,
    county_column: String,
    target: String,
}

impl FipsColumn {
    pub fn new(state_column: impl Into<String>, county_column: impl Into<String>) -> Self {
        Self {
            state_column: state_column.into(),
            county_column: county_column.into(),
            target: FIPS_COLUMN.to_string(),
        }
    }

    /// AQS responses carry `state_code` / `county_code`.
    pub fn aqs() -> Self {
        Self::new("state_code", "county_code")
    }

    /// Census responses carry `state` / `county`.
    pub fn census() -> Self {
        Self::new("state", "county")
    }
}

impl RowTransform for FipsColumn {
    fn name(&self) -> &str {
        "fips"
    }

    fn apply(&self, mut batch: RowBatch) -> RowBatch {
        let (Some(s), Some(c)) = (
            batch.column_index(&self.state_column),
            batch.column_index(&self.county_column),
        ) else {
            debug!(
                "fips: '{}'/'{}' not both present, skipping",
                self.state_column, self.county_column
            );
            return batch;
        };

        let keys = batch
            .rows()
            .iter()
            .map(|row| match (code_from_value(&row[s]), code_from_value(&row[c])) {
                (Some(state), Some(county)) => Value::String(derive_key(&state, &county)),
                _ => Value::Null,
            })
            .collect();
        batch.set_column(&self.target, keys);
        batch
    }
}

/// Join semantics for merging two sources on the geo key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Rows without a match on either side are dropped
    #[default]
    Inner,
    Left,
    Outer,
}

impl From<JoinKind> for JoinType {
    fn from(kind: JoinKind) -> Self {
        match kind {
            JoinKind::Inner => JoinType::Inner,
            JoinKind::Left => JoinType::Left,
            JoinKind::Outer => JoinType::Outer,
        }
    }
}

/// Merge two frames on `key`. The key is compared as text on both sides.
pub fn join_on_geo(left: DataFrame, right: DataFrame, key: &str, kind: JoinKind) -> Result<DataFrame> {
    for (side, df) in [("left", &left), ("right", &right)] {
        if df.column(key).is_err() {
            return Err(IngestError::InvalidInput(format!(
                "{} table has no '{}' column",
                side, key
            )));
        }
    }

    let left = left.lazy().with_column(col(key).cast(DataType::String));
    let right = right.lazy().with_column(col(key).cast(DataType::String));

    let joined = left
        .join(right, [col(key)], [col(key)], JoinArgs::new(kind.into()))
        .collect()?;
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_key() {
        assert_eq!(derive_key("6", "73"), "06073");
        assert_eq!(derive_key("06", "073"), "06073");
        assert_eq!(derive_key("", ""), "00000");
        assert_eq!(derive_key("6.0", "1"), "06001");
        assert_eq!(derive_key(" 36", "061 "), "36061");
        assert_eq!(derive_key("6", "73"), derive_key("6", "73"));
    }

    #[test]
    fn test_fips_transform_handles_numbers_and_nulls() {
        let batch = RowBatch::from_objects(&[
            json!({"state": 6, "county": 1}),
            json!({"state": "06", "county": null}),
        ])
        .unwrap();

        let out = FipsColumn::census().apply(batch);
        assert_eq!(out.get(0, FIPS_COLUMN), Some(&json!("06001")));
        assert_eq!(out.get(1, FIPS_COLUMN), Some(&Value::Null));
    }

    #[test]
    fn test_fips_transform_skips_without_columns() {
        let batch = RowBatch::from_objects(&[json!({"code": "06", "name": "California"})]).unwrap();
        let out = FipsColumn::aqs().apply(batch.clone());
        assert_eq!(out, batch);
    }

    #[test]
    fn test_join_kinds() {
        let air = df![
            "FIPS" => ["06073", "06001"],
            "pm25" => [12.0, 7.5],
        ]
        .unwrap();
        let census = df![
            "FIPS" => ["06073", "06037"],
            "income" => [82000i64, 71000],
        ]
        .unwrap();

        let inner = join_on_geo(air.clone(), census.clone(), "FIPS", JoinKind::Inner).unwrap();
        assert_eq!(inner.height(), 1);

        let left = join_on_geo(air, census, "FIPS", JoinKind::Left).unwrap();
        assert_eq!(left.height(), 2);
        assert_eq!(left.column("income").unwrap().null_count(), 1);
    }

    #[test]
    fn test_join_requires_key() {
        let a = df!["x" => [1i64]].unwrap();
        let b = df!["FIPS" => ["06001"]].unwrap();
        assert!(matches!(
            join_on_geo(a, b, "FIPS", JoinKind::Inner),
            Err(IngestError::InvalidInput(_))
        ));
    }
}
