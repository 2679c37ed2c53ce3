//! Row sinks - durable destinations for flushed accumulator contents

use crate::error::Result;
use crate::ingestion::batch::{cell_to_string, RowBatch};
use csv::WriterBuilder;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Destination for flushed rows.
///
/// The first write of a sink creates (or replaces) the destination and fixes
/// its column set; later writes append.
pub trait RowSink: Send {
    /// Write a batch, returning the number of rows written.
    fn write(&mut self, batch: &RowBatch) -> Result<usize>;

    fn rows_written(&self) -> u64;

    /// Human-readable destination, used in log lines and messages.
    fn describe(&self) -> String;
}

/// Project a batch's rows onto a fixed column list.
pub(crate) fn project_rows<'a>(
    fixed: &'a [String],
    batch: &'a RowBatch,
) -> impl Iterator<Item = Vec<&'a Value>> + 'a {
    let mapping: Vec<Option<usize>> = fixed.iter().map(|c| batch.column_index(c)).collect();
    batch.rows().iter().map(move |row| {
        mapping
            .iter()
            .map(|idx| idx.and_then(|i| row.get(i)).unwrap_or(&Value::Null))
            .collect()
    })
}

pub(crate) fn warn_on_extra_columns(fixed: &[String], batch: &RowBatch, target: &str) {
    let extra: Vec<&str> = batch
        .columns()
        .iter()
        .filter(|c| !fixed.contains(c))
        .map(String::as_str)
        .collect();
    if !extra.is_empty() {
        warn!("{}: ignoring columns not in the first batch: {}", target, extra.join(", "));
    }
}

/// CSV file sink: UTF-8, comma-delimited, header once, appends afterwards.
pub struct CsvSink {
    path: PathBuf,
    columns: Option<Vec<String>>,
    rows_written: u64,
}

impl CsvSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            columns: None,
            rows_written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSink for CsvSink {
    fn write(&mut self, batch: &RowBatch) -> Result<usize> {
        let first_write = self.columns.is_none();
        if first_write && batch.columns().is_empty() {
            return Ok(0);
        }

        let file = if first_write {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            File::create(&self.path)?
        } else {
            OpenOptions::new().append(true).open(&self.path)?
        };

        let columns = self
            .columns
            .get_or_insert_with(|| batch.columns().to_vec())
            .clone();
        warn_on_extra_columns(&columns, batch, &self.describe());

        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        if first_write {
            writer.write_record(&columns)?;
        }
        for row in project_rows(&columns, batch) {
            writer.write_record(row.iter().map(|v| cell_to_string(v)))?;
        }

        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.sync_data()?;

        self.rows_written += batch.len() as u64;
        debug!("Wrote {} rows to {}", batch.len(), self.path.display());
        Ok(batch.len())
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
