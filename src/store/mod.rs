//! Fact Store - SQLite tables holding ingested air-quality and census facts
//!
//! Values are always bound as parameters. Table and column names cannot be
//! bound, so they are validated against a strict pattern and quoted.

pub mod sqlite_sink;

pub use sqlite_sink::SqliteSink;

use crate::error::{IngestError, Result};
use crate::ingestion::batch::{Row, RowBatch};
use crate::ingestion::sink::RowSink;
use crate::ingestion::transform::{apply_all, RowTransform};
use chrono::NaiveDate;
use csv::ReaderBuilder;
use polars::prelude::DataFrame;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use tracing::{debug, info};

fn is_identifier(name: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// Check a table or column name and return it double-quoted.
pub fn quote_ident(name: &str) -> Result<String> {
    if is_identifier(name) {
        Ok(format!("\"{}\"", name))
    } else {
        Err(IngestError::InvalidIdentifier(name.to_string()))
    }
}

/// Row filter on a year column or a date column, both inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Window {
    All,
    Years(i32, i32),
    Dates(NaiveDate, NaiveDate),
}

impl From<(i32, i32)> for Window {
    fn from((begin, end): (i32, i32)) -> Self {
        Window::Years(begin, end)
    }
}

impl From<(NaiveDate, NaiveDate)> for Window {
    fn from((begin, end): (NaiveDate, NaiveDate)) -> Self {
        Window::Dates(begin, end)
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Window::All => f.write_str("all dates"),
            Window::Years(begin, end) => write!(f, "years {}-{}", begin, end),
            Window::Dates(begin, end) => write!(f, "{} to {}", begin, end),
        }
    }
}

impl Window {
    /// SQL predicate and its bound values. Dates compare as `YYYY-MM-DD` text,
    /// so a date column holding `YYYY-MM-DD...` values filters correctly.
    pub(crate) fn predicate(&self, year_column: &str, date_column: &str) -> Result<Option<(String, Vec<SqlValue>)>> {
        match self {
            Window::All => Ok(None),
            Window::Years(begin, end) => Ok(Some((
                format!("{} BETWEEN ? AND ?", quote_ident(year_column)?),
                vec![SqlValue::Integer(*begin as i64), SqlValue::Integer(*end as i64)],
            ))),
            Window::Dates(begin, end) => Ok(Some((
                format!("substr({}, 1, 10) BETWEEN ? AND ?", quote_ident(date_column)?),
                vec![
                    SqlValue::Text(begin.format("%Y-%m-%d").to_string()),
                    SqlValue::Text(end.format("%Y-%m-%d").to_string()),
                ],
            ))),
        }
    }
}

/// Column names used to read geographic labels from a table.
#[derive(Clone, Debug)]
pub struct GeoColumns {
    pub fips: String,
    pub label: String,
    pub state: String,
}

impl Default for GeoColumns {
    fn default() -> Self {
        Self {
            fips: "FIPS".to_string(),
            label: "county".to_string(),
            state: "state".to_string(),
        }
    }
}

/// A geo key with its display label.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeoLabel {
    pub fips: String,
    pub label: String,
}

pub struct FactStore {
    path: Option<PathBuf>,
    db: Mutex<Connection>,
}

impl FactStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path)
            .map_err(|e| IngestError::Database(format!("Failed to open database: {}", e)))?;
        info!("Opened fact store at {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            db: Mutex::new(db),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            path: None,
            db: Mutex::new(Connection::open_in_memory()?),
        })
    }

    pub fn describe(&self) -> String {
        match &self.path {
            Some(p) => p.display().to_string(),
            None => ":memory:".to_string(),
        }
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| IngestError::Database("connection lock poisoned".to_string()))
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let db = self.conn()?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn column_names(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table)?);
        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if names.is_empty() {
            return Err(IngestError::Database(format!("no such table: {}", table)));
        }
        Ok(names)
    }

    /// Create `idx_<table>_<cols>` if missing and return its name.
    pub fn create_index(&self, table: &str, columns: &[&str]) -> Result<String> {
        if columns.is_empty() {
            return Err(IngestError::InvalidInput("index needs at least one column".to_string()));
        }
        let quoted = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        let name = format!("idx_{}_{}", table, columns.join("_"));
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quote_ident(&name)?,
            quote_ident(table)?,
            quoted.join(", ")
        );
        self.conn()?.execute(&sql, [])?;
        info!("Index {} ready", name);
        Ok(name)
    }

    pub fn unique_fips(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT FIPS FROM {} WHERE FIPS IS NOT NULL ORDER BY FIPS",
            quote_ident(table)?
        );
        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Distinct monitor coordinates as (latitude, longitude).
    pub fn unique_sites(&self, table: &str) -> Result<Vec<(f64, f64)>> {
        let sql = format!(
            "SELECT DISTINCT latitude, longitude FROM {} \
             WHERE latitude IS NOT NULL AND longitude IS NOT NULL",
            quote_ident(table)?
        );
        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let sites = stmt
            .query_map([], |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// Distinct (FIPS, label) pairs, optionally for one state.
    pub fn county_fips(&self, table: &str, columns: &GeoColumns, state: Option<&str>) -> Result<Vec<GeoLabel>> {
        let fips = quote_ident(&columns.fips)?;
        let label = quote_ident(&columns.label)?;
        let mut sql = format!(
            "SELECT {fips}, MIN({label}) FROM {} WHERE {fips} IS NOT NULL",
            quote_ident(table)?
        );
        let mut values = Vec::new();
        if let Some(state) = state {
            sql.push_str(&format!(" AND {} = ?", quote_ident(&columns.state)?));
            values.push(SqlValue::Text(state.to_string()));
        }
        sql.push_str(&format!(" GROUP BY {fips} ORDER BY {fips}"));

        let db = self.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let labels = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok(GeoLabel {
                    fips: row.get::<_, String>(0)?,
                    label: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    /// Select columns within a window, optionally for one FIPS code.
    /// Years filter on `Year`, dates on `date_local`.
    pub fn query_table(&self, table: &str, columns: &[&str], window: Window, fips: Option<&str>) -> Result<DataFrame> {
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ")
        };

        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some((clause, bound)) = window.predicate("Year", "date_local")? {
            clauses.push(clause);
            values.extend(bound);
        }
        if let Some(fips) = fips {
            clauses.push("FIPS = ?".to_string());
            values.push(SqlValue::Text(fips.to_string()));
        }

        let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(table)?);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        debug!("query_table: {}", sql);

        self.select_batch(&sql, &values)?.to_dataframe()
    }

    /// Census variables for one year, one row per FIPS code, with the
    /// county name trimmed to its short form and `values` holding the sum of
    /// the requested columns.
    pub fn census_values(&self, table: &str, columns: &[&str], year: i32) -> Result<DataFrame> {
        if columns.is_empty() {
            return Err(IngestError::InvalidInput("no census columns requested".to_string()));
        }
        if !self.table_exists(table)? {
            return Err(IngestError::InvalidInput(format!("no table named '{}'", table)));
        }

        let quoted = columns.iter().map(|c| quote_ident(c)).collect::<Result<Vec<_>>>()?;
        let total = match quoted.as_slice() {
            [single] => format!("CAST({} AS REAL)", single),
            many => many
                .iter()
                .map(|c| format!("COALESCE(CAST({} AS REAL), 0)", c))
                .collect::<Vec<_>>()
                .join(" + "),
        };
        let sql = format!(
            "SELECT FIPS, NAME, {}, {} AS \"values\" FROM {} WHERE Year = ? ORDER BY FIPS",
            quoted.join(", "),
            total,
            quote_ident(table)?
        );
        debug!("census_values: {}", sql);

        let mut batch = self.select_batch(&sql, &[SqlValue::Integer(year as i64)])?;
        let names: Vec<Value> = batch
            .rows()
            .iter()
            .map(|row| match &row[1] {
                Value::String(name) => Value::String(short_county_name(name).to_string()),
                other => other.clone(),
            })
            .collect();
        batch.set_column("NAME", names);
        batch.to_dataframe()
    }

    pub(crate) fn select_batch(&self, sql: &str, values: &[SqlValue]) -> Result<RowBatch> {
        let db = self.conn()?;
        let mut stmt = db.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                (0..width)
                    .map(|i| row.get_ref(i).map(json_from_sql))
                    .collect::<std::result::Result<Row, _>>()
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(RowBatch::with_rows(columns, rows))
    }

    /// Stream CSV files into `table` in chunks of `chunk_size` rows. The
    /// table is replaced by the first chunk and appended to afterwards.
    pub fn load_csv_files<P: AsRef<Path>>(
        &self,
        paths: &[P],
        chunk_size: usize,
        table: &str,
        transforms: &[Box<dyn RowTransform>],
    ) -> Result<u64> {
        let chunk_size = chunk_size.max(1);
        let mut sink = SqliteSink::new(self, table)?;

        for path in paths {
            let path = path.as_ref();
            info!("Loading {} into {}", path.display(), table);
            let mut reader = ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .from_path(path)?;
            let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

            let mut chunk = RowBatch::new(headers.clone());
            for record in reader.records() {
                let record = record?;
                chunk.push_row(record.iter().map(coerce_cell).collect());
                if chunk.len() >= chunk_size {
                    let full = std::mem::replace(&mut chunk, RowBatch::new(headers.clone()));
                    sink.write(&apply_all(transforms, full))?;
                }
            }
            if !chunk.is_empty() {
                sink.write(&apply_all(transforms, chunk))?;
            }
        }

        info!("Loaded {} rows into {}", sink.rows_written(), table);
        Ok(sink.rows_written())
    }
}

/// "San Diego County, California" -> "San Diego"
fn short_county_name(name: &str) -> &str {
    let county = name.split(',').next().unwrap_or(name).trim();
    county.strip_suffix(" County").unwrap_or(county)
}

fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

pub(crate) fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Type a CSV cell. Codes with a leading zero ("06", "073") stay text so
/// FIPS parts survive the round trip.
fn coerce_cell(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
    if digits.len() > 1 && digits.starts_with('0') && digits.as_bytes()[1].is_ascii_digit() {
        return Value::String(trimmed.to_string());
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = serde_json::Number::from_f64(f) {
            return Value::Number(n);
        }
    }

    Value::String(trimmed.to_string())
}
