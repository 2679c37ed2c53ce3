//! Row transforms - per-batch post-processing applied before accumulation

use crate::geo::FipsColumn;
use crate::ingestion::batch::RowBatch;
use chrono::{Datelike, NaiveDate};
use serde_json::Value;
use tracing::debug;

/// Columns the AQS sample cleaning removes.
pub const AQS_DROPPED_COLUMNS: &[&str] = &[
    "sample_duration",
    "sample_duration_code",
    "sample_frequency",
    "poc",
    "detection_limit",
    "uncertainty",
    "qualifier",
    "method_type",
    "method",
    "method_code",
    "site_number",
];

pub trait RowTransform: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, batch: RowBatch) -> RowBatch;
}

/// Adds `year`, `month` and `day` columns parsed from a `%Y-%m-%d` column.
pub struct DateParts {
    column: String,
}

impl DateParts {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl RowTransform for DateParts {
    fn name(&self) -> &str {
        "date_parts"
    }

    fn apply(&self, mut batch: RowBatch) -> RowBatch {
        let Some(idx) = batch.column_index(&self.column) else {
            debug!("date_parts: no '{}' column, skipping", self.column);
            return batch;
        };

        let dates: Vec<Option<NaiveDate>> = batch
            .rows()
            .iter()
            .map(|row| {
                row[idx]
                    .as_str()
                    .and_then(|s| s.get(..10))
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            })
            .collect();

        let part = |f: fn(&NaiveDate) -> i64| -> Vec<Value> {
            dates
                .iter()
                .map(|d| d.as_ref().map_or(Value::Null, |d| Value::from(f(d))))
                .collect()
        };
        batch.set_column("year", part(|d| d.year() as i64));
        batch.set_column("month", part(|d| d.month() as i64));
        batch.set_column("day", part(|d| d.day() as i64));
        batch
    }
}

/// Keeps only rows whose qualifier column is null or blank.
pub struct DropQualified {
    column: String,
}

impl DropQualified {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl RowTransform for DropQualified {
    fn name(&self) -> &str {
        "drop_qualified"
    }

    fn apply(&self, mut batch: RowBatch) -> RowBatch {
        if let Some(idx) = batch.column_index(&self.column) {
            batch.retain_rows(|row| match &row[idx] {
                Value::Null => true,
                Value::String(s) => s.trim().is_empty(),
                _ => false,
            });
        }
        batch
    }
}

pub struct DropColumns {
    columns: Vec<String>,
}

impl DropColumns {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
        }
    }
}

impl RowTransform for DropColumns {
    fn name(&self) -> &str {
        "drop_columns"
    }

    fn apply(&self, mut batch: RowBatch) -> RowBatch {
        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        batch.drop_columns(&names);
        batch
    }
}

/// FIPS enrichment only; the pipeline's default post-processing.
pub fn fips_enrichment() -> Vec<Box<dyn RowTransform>> {
    vec![Box::new(FipsColumn::aqs())]
}

/// Cleaning chain for AQS sample/daily data: FIPS, date parts, drop
/// qualified readings, drop unused columns.
pub fn aqs_sample_cleaning() -> Vec<Box<dyn RowTransform>> {
    vec![
        Box::new(FipsColumn::aqs()),
        Box::new(DateParts::new("date_local")),
        Box::new(DropQualified::new("qualifier")),
        Box::new(DropColumns::new(AQS_DROPPED_COLUMNS.iter().copied())),
    ]
}

/// Chain used when loading sample files: the cleaning chain, or FIPS
/// enrichment only when `raw`.
pub fn sample_load_transforms(raw: bool) -> Vec<Box<dyn RowTransform>> {
    if raw {
        fips_enrichment()
    } else {
        aqs_sample_cleaning()
    }
}

pub fn apply_all(transforms: &[Box<dyn RowTransform>], batch: RowBatch) -> RowBatch {
    transforms.iter().fold(batch, |batch, t| t.apply(batch))
}
