//! Relational sink: replaces the table on first write, appends afterwards

use crate::error::Result;
use crate::ingestion::batch::RowBatch;
use crate::ingestion::schema_inference::SchemaInference;
use crate::ingestion::sink::{project_rows, warn_on_extra_columns, RowSink};
use crate::store::{quote_ident, sql_from_json, FactStore};
use rusqlite::params_from_iter;
use tracing::{debug, info};

pub struct SqliteSink<'a> {
    store: &'a FactStore,
    table: String,
    columns: Option<Vec<String>>,
    rows_written: u64,
}

impl<'a> SqliteSink<'a> {
    pub fn new(store: &'a FactStore, table: &str) -> Result<Self> {
        quote_ident(table)?;
        Ok(Self {
            store,
            table: table.to_string(),
            columns: None,
            rows_written: 0,
        })
    }

    /// DROP + CREATE with column types inferred from the first batch.
    fn create_table(&self, batch: &RowBatch) -> Result<Vec<String>> {
        let schema = SchemaInference::new().infer_schema(batch);
        let definitions = schema
            .iter()
            .map(|c| {
                let name = quote_ident(&c.name)?;
                Ok(match c.data_type.sql_type() {
                    Some(sql_type) => format!("{} {}", name, sql_type),
                    None => name,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let table = quote_ident(&self.table)?;
        let db = self.store.conn()?;
        db.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
        db.execute(
            &format!("CREATE TABLE IF NOT EXISTS {} ({})", table, definitions.join(", ")),
            [],
        )?;
        info!("Created table {} ({} columns)", self.table, definitions.len());
        Ok(batch.columns().to_vec())
    }
}

impl RowSink for SqliteSink<'_> {
    fn write(&mut self, batch: &RowBatch) -> Result<usize> {
        if self.columns.is_none() {
            if batch.columns().is_empty() {
                return Ok(0);
            }
            self.columns = Some(self.create_table(batch)?);
        }
        let columns = match &self.columns {
            Some(columns) => columns.clone(),
            None => return Ok(0),
        };
        warn_on_extra_columns(&columns, batch, &self.table);

        let quoted = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>>>()?;
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table)?,
            quoted.join(", "),
            placeholders
        );

        let mut db = self.store.conn()?;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in project_rows(&columns, batch) {
                stmt.execute(params_from_iter(row.into_iter().map(sql_from_json)))?;
            }
        }
        tx.commit()?;

        self.rows_written += batch.len() as u64;
        debug!("Inserted {} rows into {}", batch.len(), self.table);
        Ok(batch.len())
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.store.describe(), self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_write_fixes_schema() {
        let store = FactStore::in_memory().unwrap();
        let mut sink = SqliteSink::new(&store, "PM25").unwrap();

        sink.write(&RowBatch::with_rows(
            vec!["FIPS".into(), "sample_measurement".into()],
            vec![vec![json!("06073"), json!(12.5)], vec![json!("06001"), json!(3)]],
        ))
        .unwrap();
        sink.write(&RowBatch::with_rows(
            vec!["sample_measurement".into(), "FIPS".into(), "extra".into()],
            vec![vec![json!(40.0), json!("06073"), json!(true)]],
        ))
        .unwrap();

        assert_eq!(sink.rows_written(), 3);
        assert_eq!(store.column_names("PM25").unwrap(), vec!["FIPS", "sample_measurement"]);
        assert_eq!(store.unique_fips("PM25").unwrap(), vec!["06001", "06073"]);
    }

    #[test]
    fn test_new_sink_replaces_existing_table() {
        let store = FactStore::in_memory().unwrap();
        let batch = RowBatch::with_rows(vec!["FIPS".into()], vec![vec![json!("06073")]]);

        for _ in 0..2 {
            let mut sink = SqliteSink::new(&store, "t").unwrap();
            sink.write(&batch).unwrap();
        }
        let df = store.query_table("t", &[], crate::store::Window::All, None).unwrap();
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn test_empty_first_batch_keeps_numbers_numeric() {
        let store = FactStore::in_memory().unwrap();
        let mut sink = SqliteSink::new(&store, "daily").unwrap();
        let columns = vec!["FIPS".to_string(), "sample_measurement".to_string()];

        sink.write(&RowBatch::new(columns.clone())).unwrap();
        sink.write(&RowBatch::with_rows(
            columns,
            vec![vec![json!("06073"), json!(40.0)], vec![json!("06073"), json!(5.0)]],
        ))
        .unwrap();

        let db = store.conn().unwrap();
        let (fips_type, value_type): (String, String) = db
            .query_row(
                "SELECT typeof(FIPS), typeof(sample_measurement) FROM daily LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(fips_type, "text");
        assert_eq!(value_type, "real");

        let above: i64 = db
            .query_row("SELECT COUNT(*) FROM daily WHERE sample_measurement > 10", [], |row| row.get(0))
            .unwrap();
        assert_eq!(above, 1);
    }

    #[test]
    fn test_rejects_bad_table_name() {
        let store = FactStore::in_memory().unwrap();
        assert!(SqliteSink::new(&store, "x; DROP TABLE y").is_err());
    }
}
