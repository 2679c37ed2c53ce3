//! Census ACS 5-year profile pulls, one request per year

use crate::credentials::Credentials;
use crate::error::{IngestError, Result};
use crate::geo::FipsColumn;
use crate::ingestion::batch::RowBatch;
use crate::ingestion::fetcher::{Envelope, RemoteFetcher};
use crate::ingestion::pacer::{Pacer, SleepPacer};
use crate::ingestion::transform::RowTransform;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CensusVariable {
    /// ACS variable code, e.g. `DP03_0062E`
    pub code: String,
    /// Column name used in the output
    pub label: String,
}

impl CensusVariable {
    pub fn new(code: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            label: label.into(),
        }
    }
}

/// Read `{"CODE": "label", ...}`, keeping file order.
pub fn load_variables(path: impl AsRef<Path>) -> Result<Vec<CensusVariable>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let map: serde_json::Map<String, Value> = serde_json::from_str(&content)?;
    map.into_iter()
        .map(|(code, label)| match label {
            Value::String(label) => Ok(CensusVariable::new(code, label)),
            other => Err(IngestError::Config(format!(
                "{}: label for {} must be a string, got {}",
                path.display(),
                code,
                other
            ))),
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct CensusQuery {
    pub start_year: i32,
    /// Inclusive
    pub end_year: i32,
    pub variables: Vec<CensusVariable>,
    /// 2-digit state FIPS code
    pub state: String,
}

impl CensusQuery {
    pub fn endpoint(year: i32) -> String {
        format!("{}/acs/acs5/profile", year)
    }

    fn validate(&self) -> Result<()> {
        if self.end_year < self.start_year {
            return Err(IngestError::InvalidInput(format!(
                "end year {} is before start year {}",
                self.end_year, self.start_year
            )));
        }
        if self.variables.is_empty() {
            return Err(IngestError::InvalidInput("no census variables requested".to_string()));
        }
        Ok(())
    }

    pub fn params(&self, credentials: &Credentials) -> Vec<(String, String)> {
        let codes: Vec<&str> = self.variables.iter().map(|v| v.code.as_str()).collect();
        let mut params = vec![
            ("get".to_string(), format!("NAME,{}", codes.join(","))),
            ("for".to_string(), "county:*".to_string()),
            ("in".to_string(), format!("state:{}", self.state)),
        ];
        params.extend(credentials.query_pairs().iter().cloned());
        params
    }
}

#[derive(Debug)]
pub struct CensusPull {
    pub rows: RowBatch,
    pub years_loaded: Vec<i32>,
    pub years_skipped: Vec<(i32, String)>,
}

pub struct CensusClient {
    fetcher: Arc<dyn RemoteFetcher>,
    pacer: Arc<dyn Pacer>,
    pacing: Duration,
    fips: FipsColumn,
}

impl CensusClient {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, pacing: Duration) -> Self {
        Self {
            fetcher,
            pacer: Arc::new(SleepPacer),
            pacing,
            fips: FipsColumn::census(),
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    /// Fetch every year in the query. A failed year is logged and skipped;
    /// the pull fails only when no year succeeds.
    pub async fn fetch_years(&self, query: &CensusQuery, credentials: &Credentials) -> Result<CensusPull> {
        query.validate()?;
        let params = query.params(credentials);

        let mut pull = CensusPull {
            rows: RowBatch::default(),
            years_loaded: Vec::new(),
            years_skipped: Vec::new(),
        };

        for year in query.start_year..=query.end_year {
            if year > query.start_year {
                self.pacer.pause(self.pacing).await;
            }
            info!("Querying census profile for {}", year);

            let mut batch = match self
                .fetcher
                .fetch(&CensusQuery::endpoint(year), Envelope::HeaderRow, &params)
                .await
            {
                Ok(batch) => batch,
                Err(err) => {
                    warn!("Skipping census year {}: {}", year, err);
                    pull.years_skipped.push((year, err.to_string()));
                    continue;
                }
            };

            for var in &query.variables {
                batch.rename_column(&var.code, &var.label);
            }
            batch.set_column("Year", vec![Value::from(year); batch.len()]);
            let batch = self.fips.apply(batch);

            pull.rows.append(batch);
            pull.years_loaded.push(year);
        }

        if pull.years_loaded.is_empty() {
            let reasons: Vec<String> = pull
                .years_skipped
                .iter()
                .map(|(y, e)| format!("{}: {}", y, e))
                .collect();
            return Err(IngestError::Remote {
                status: 0,
                message: format!("no census year could be fetched ({})", reasons.join("; ")),
            });
        }

        info!(
            "Census pull: {} rows across {} years ({} skipped)",
            pull.rows.len(),
            pull.years_loaded.len(),
            pull.years_skipped.len()
        );
        Ok(pull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_params() {
        let query = CensusQuery {
            start_year: 2019,
            end_year: 2020,
            variables: vec![
                CensusVariable::new("DP03_0062E", "median_income"),
                CensusVariable::new("DP05_0001E", "population"),
            ],
            state: "06".to_string(),
        };
        let params = query.params(&Credentials::census("k"));
        assert_eq!(params[0], ("get".to_string(), "NAME,DP03_0062E,DP05_0001E".to_string()));
        assert_eq!(params[2], ("in".to_string(), "state:06".to_string()));
        assert_eq!(params[3], ("key".to_string(), "k".to_string()));
        assert_eq!(CensusQuery::endpoint(2019), "2019/acs/acs5/profile");
    }

    #[test]
    fn test_load_variables_keeps_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vars.json");
        std::fs::write(&path, r#"{"DP05_0001E": "population", "DP03_0062E": "median_income"}"#).unwrap();

        let vars = load_variables(&path).unwrap();
        assert_eq!(vars[0].code, "DP05_0001E");
        assert_eq!(vars[1].label, "median_income");

        std::fs::write(&path, r#"{"DP05_0001E": 3}"#).unwrap();
        assert!(matches!(load_variables(&path), Err(IngestError::Config(_))));
    }

    #[test]
    fn test_reversed_years_rejected() {
        let query = CensusQuery {
            start_year: 2021,
            end_year: 2019,
            variables: vec![CensusVariable::new("DP05_0001E", "population")],
            state: "06".to_string(),
        };
        assert!(matches!(query.validate(), Err(IngestError::InvalidInput(_))));
    }
}
