//! Threshold Aggregator - share of readings above a threshold per geo key

use crate::error::Result;
use crate::geo::{join_on_geo, JoinKind, FIPS_COLUMN};
use crate::store::{quote_ident, FactStore, GeoLabel, Window};
use polars::prelude::*;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// A percentage in [0, 100], or Undefined when no rows matched.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Ratio {
    Percent(f64),
    Undefined,
}

impl Ratio {
    fn from_counts(above: i64, total: i64) -> Self {
        if total == 0 {
            Ratio::Undefined
        } else {
            Ratio::Percent(above as f64 / total as f64 * 100.0)
        }
    }

    pub fn percent(&self) -> Option<f64> {
        match self {
            Ratio::Percent(p) => Some(*p),
            Ratio::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Ratio::Undefined)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ratio::Percent(p) => write!(f, "{:.2}%", p),
            Ratio::Undefined => f.write_str("undefined"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeoRatio {
    pub fips: String,
    pub label: String,
    pub ratio: Ratio,
}

/// PM2.5 levels (µg/m³) used for yearly proportions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AirLevel {
    Moderate,
    Unhealthy,
    Custom(f64),
}

impl AirLevel {
    pub fn lower_bound(&self) -> f64 {
        match self {
            AirLevel::Moderate => 15.0,
            AirLevel::Unhealthy => 30.0,
            AirLevel::Custom(v) => *v,
        }
    }
}

impl std::str::FromStr for AirLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "moderate" => Ok(AirLevel::Moderate),
            "unhealthy" => Ok(AirLevel::Unhealthy),
            other => other
                .parse::<f64>()
                .map(AirLevel::Custom)
                .map_err(|_| format!("unknown air level '{}' (moderate, unhealthy or a number)", s)),
        }
    }
}

/// Column names the aggregator reads.
#[derive(Clone, Debug)]
pub struct AggregateColumns {
    pub measurement: String,
    pub geo: String,
    pub label: String,
    pub year: String,
    pub date: String,
}

impl Default for AggregateColumns {
    fn default() -> Self {
        Self {
            measurement: "sample_measurement".to_string(),
            geo: "FIPS".to_string(),
            label: "county".to_string(),
            year: "Year".to_string(),
            date: "date_local".to_string(),
        }
    }
}

pub struct ThresholdAggregator<'a> {
    store: &'a FactStore,
    columns: AggregateColumns,
}

impl<'a> ThresholdAggregator<'a> {
    pub fn new(store: &'a FactStore) -> Self {
        Self {
            store,
            columns: AggregateColumns::default(),
        }
    }

    pub fn with_columns(mut self, columns: AggregateColumns) -> Self {
        self.columns = columns;
        self
    }

    /// Share of rows for `geo_key` whose measurement is strictly above
    /// `threshold`, within `window`.
    pub fn percent_above(&self, table: &str, geo_key: &str, threshold: f64, window: Window) -> Result<Ratio> {
        let measurement = quote_ident(&self.columns.measurement)?;
        let mut sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN CAST({m} AS REAL) > ? THEN 1 ELSE 0 END), 0) FROM {} WHERE {} = ?",
            quote_ident(table)?,
            quote_ident(&self.columns.geo)?,
            m = measurement,
        );
        let mut values = vec![SqlValue::Real(threshold), SqlValue::Text(geo_key.to_string())];
        if let Some((clause, bound)) = window.predicate(&self.columns.year, &self.columns.date)? {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            values.extend(bound);
        }

        let db = self.store.conn()?;
        let (total, above): (i64, i64) =
            db.query_row(&sql, params_from_iter(values.iter()), |row| Ok((row.get(0)?, row.get(1)?)))?;

        let ratio = Ratio::from_counts(above, total);
        if ratio.is_undefined() {
            debug!("No measurements for {} in {:?}", geo_key, window);
        }
        Ok(ratio)
    }

    /// `percent_above` for each geo in input order. Undefined geos stay in
    /// the output.
    pub fn percent_above_for_all_geos(
        &self,
        table: &str,
        geos: &[GeoLabel],
        threshold: f64,
        window: Window,
    ) -> Result<Vec<GeoRatio>> {
        let mut out = Vec::with_capacity(geos.len());
        for geo in geos {
            let ratio = self.percent_above(table, &geo.fips, threshold, window)?;
            out.push(GeoRatio {
                fips: geo.fips.clone(),
                label: geo.label.clone(),
                ratio,
            });
        }
        info!(
            "Computed {} ratios ({} undefined) above {}",
            out.len(),
            out.iter().filter(|r| r.ratio.is_undefined()).count(),
            threshold
        );
        Ok(out)
    }

    /// Per-geo share of `year`'s readings at or above `level`, ordered by geo key.
    pub fn proportions_for_year(&self, table: &str, level: AirLevel, year: i32) -> Result<Vec<GeoRatio>> {
        let geo = quote_ident(&self.columns.geo)?;
        let sql = format!(
            "SELECT {geo}, MIN({label}), COUNT(*), \
             COALESCE(SUM(CASE WHEN CAST({m} AS REAL) >= ? THEN 1 ELSE 0 END), 0) \
             FROM {table} WHERE {year} = ? AND {geo} IS NOT NULL \
             GROUP BY {geo} ORDER BY {geo}",
            label = quote_ident(&self.columns.label)?,
            m = quote_ident(&self.columns.measurement)?,
            table = quote_ident(table)?,
            year = quote_ident(&self.columns.year)?,
        );

        let db = self.store.conn()?;
        let mut stmt = db.prepare(&sql)?;
        let ratios = stmt
            .query_map(
                params_from_iter([SqlValue::Real(level.lower_bound()), SqlValue::Integer(year as i64)].iter()),
                |row| {
                    Ok(GeoRatio {
                        fips: row.get(0)?,
                        label: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        ratio: Ratio::from_counts(row.get(3)?, row.get(2)?),
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ratios)
    }

    /// Yearly proportions at `level` beside census values for the same
    /// year, inner-joined on FIPS. Counties missing from either side drop out.
    pub fn compare_with_census(
        &self,
        air_table: &str,
        level: AirLevel,
        year: i32,
        census_table: &str,
        census_columns: &[&str],
    ) -> Result<DataFrame> {
        let ratios = self.proportions_for_year(air_table, level, year)?;
        let census = self.store.census_values(census_table, census_columns, year)?;
        let joined = join_on_geo(ratios_to_dataframe(&ratios)?, census, FIPS_COLUMN, JoinKind::Inner)?;
        info!(
            "Matched {} of {} counties between {} and {} for {}",
            joined.height(),
            ratios.len(),
            air_table,
            census_table,
            year
        );
        Ok(joined)
    }
}

/// `FIPS`, `County`, `Percentage` (null when undefined).
pub fn ratios_to_dataframe(ratios: &[GeoRatio]) -> Result<DataFrame> {
    let fips: Vec<&str> = ratios.iter().map(|r| r.fips.as_str()).collect();
    let labels: Vec<&str> = ratios.iter().map(|r| r.label.as_str()).collect();
    let percents: Vec<Option<f64>> = ratios.iter().map(|r| r.ratio.percent()).collect();

    Ok(DataFrame::new(vec![
        Series::new(FIPS_COLUMN, fips),
        Series::new("County", labels),
        Series::new("Percentage", percents),
    ])?)
}

pub fn write_ratios_csv(ratios: &[GeoRatio], path: impl AsRef<Path>) -> Result<()> {
    let mut df = ratios_to_dataframe(ratios)?;
    write_frame_csv(&mut df, path)
}

pub fn write_frame_csv(df: &mut DataFrame, path: impl AsRef<Path>) -> Result<()> {
    let mut file = std::fs::File::create(path.as_ref())?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    info!("Wrote {} rows to {}", df.height(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::batch::RowBatch;
    use crate::ingestion::sink::RowSink;
    use crate::store::SqliteSink;
    use chrono::NaiveDate;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> FactStore {
        let store = FactStore::in_memory().unwrap();
        let rows = [
            ("06073", "San Diego", "2020-01-01", 2020, 10.0),
            ("06073", "San Diego", "2020-06-01", 2020, 20.0),
            ("06073", "San Diego", "2020-07-01", 2020, 30.0),
            ("06073", "San Diego", "2021-01-01", 2021, 40.0),
            ("06001", "Alameda", "2020-02-01", 2020, 5.0),
        ];
        let batch = RowBatch::with_rows(
            vec!["FIPS".into(), "county".into(), "date_local".into(), "year".into(), "sample_measurement".into()],
            rows.iter()
                .map(|(f, c, d, y, m)| vec![json!(f), json!(c), json!(d), json!(y), json!(m)])
                .collect(),
        );
        SqliteSink::new(&store, "PM25").unwrap().write(&batch).unwrap();
        store
    }

    #[test]
    fn test_percent_above_windows() {
        let store = store();
        let agg = ThresholdAggregator::new(&store);

        assert_eq!(agg.percent_above("PM25", "06073", 15.0, Window::All).unwrap(), Ratio::Percent(75.0));
        // strictly above: 30.0 does not count against 30
        assert_eq!(
            agg.percent_above("PM25", "06073", 30.0, Window::Years(2020, 2020)).unwrap(),
            Ratio::Percent(0.0)
        );
        let dates = Window::from((
            NaiveDate::from_ymd_opt(2020, 5, 1).unwrap(),
            NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        ));
        assert_eq!(agg.percent_above("PM25", "06073", 25.0, dates).unwrap(), Ratio::Percent(50.0));
    }

    #[test]
    fn test_empty_set_is_undefined_not_zero() {
        let store = store();
        let agg = ThresholdAggregator::new(&store);
        let ratio = agg.percent_above("PM25", "06001", 1.0, Window::Years(2021, 2021)).unwrap();
        assert_eq!(ratio, Ratio::Undefined);
        assert_ne!(ratio, Ratio::Percent(0.0));
    }

    #[test]
    fn test_all_geos_keeps_order_and_undefined() {
        let store = store();
        let agg = ThresholdAggregator::new(&store);
        let geos = vec![
            GeoLabel { fips: "06073".into(), label: "San Diego".into() },
            GeoLabel { fips: "06999".into(), label: "Nowhere".into() },
            GeoLabel { fips: "06001".into(), label: "Alameda".into() },
        ];

        let ratios = agg.percent_above_for_all_geos("PM25", &geos, 4.0, Window::Years(2020, 2021)).unwrap();
        let keys: Vec<&str> = ratios.iter().map(|r| r.fips.as_str()).collect();
        assert_eq!(keys, vec!["06073", "06999", "06001"]);
        assert_eq!(ratios[1].ratio, Ratio::Undefined);
        assert_eq!(ratios[2].ratio, Ratio::Percent(100.0));
    }

    #[test]
    fn test_text_measurements_compare_as_numbers() {
        let store = FactStore::in_memory().unwrap();
        let batch = RowBatch::with_rows(
            vec!["FIPS".into(), "county".into(), "year".into(), "sample_measurement".into()],
            vec![
                vec![json!("06073"), json!("San Diego"), json!(2020), json!("40.0")],
                vec![json!("06073"), json!("San Diego"), json!(2020), json!("5.0")],
            ],
        );
        SqliteSink::new(&store, "PM25").unwrap().write(&batch).unwrap();
        let agg = ThresholdAggregator::new(&store);

        assert_eq!(agg.percent_above("PM25", "06073", 10.0, Window::All).unwrap(), Ratio::Percent(50.0));
        let ratios = agg.proportions_for_year("PM25", AirLevel::Custom(10.0), 2020).unwrap();
        assert_eq!(ratios[0].ratio, Ratio::Percent(50.0));
    }

    #[test]
    fn test_proportions_for_year() {
        let store = store();
        let agg = ThresholdAggregator::new(&store);
        let ratios = agg.proportions_for_year("PM25", AirLevel::Unhealthy, 2020).unwrap();

        assert_eq!(ratios.len(), 2);
        assert_eq!(ratios[0].fips, "06001");
        assert_eq!(ratios[0].ratio, Ratio::Percent(0.0));
        assert_eq!(ratios[1].label, "San Diego");
        // at or above: the 30.0 reading counts
        let p = ratios[1].ratio.percent().unwrap();
        assert!((p - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_compare_with_census_joins_on_fips() {
        let store = store();
        let census = RowBatch::with_rows(
            vec!["NAME".into(), "FIPS".into(), "Year".into(), "median_income".into()],
            vec![
                vec![json!("San Diego County, California"), json!("06073"), json!(2020), json!(82000)],
                vec![json!("Kern County, California"), json!("06029"), json!(2020), json!(53000)],
            ],
        );
        SqliteSink::new(&store, "Income").unwrap().write(&census).unwrap();

        let df = ThresholdAggregator::new(&store)
            .compare_with_census("PM25", AirLevel::Moderate, 2020, "Income", &["median_income"])
            .unwrap();

        assert_eq!(df.height(), 1);
        let fips: Vec<_> = df.column("FIPS").unwrap().str().unwrap().into_iter().collect();
        assert_eq!(fips, vec![Some("06073")]);
        let pct = df.column("Percentage").unwrap().f64().unwrap().get(0).unwrap();
        assert!((pct - 200.0 / 3.0).abs() < 1e-9);
        assert_eq!(df.column("values").unwrap().f64().unwrap().get(0), Some(82000.0));
        assert_eq!(df.column("NAME").unwrap().str().unwrap().get(0), Some("San Diego"));
    }

    #[test]
    fn test_air_level_parse() {
        assert_eq!("Moderate".parse::<AirLevel>().unwrap(), AirLevel::Moderate);
        assert_eq!("42.5".parse::<AirLevel>().unwrap().lower_bound(), 42.5);
        assert!("bad".parse::<AirLevel>().is_err());
    }

    #[test]
    fn test_write_ratios_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ratios.csv");
        let ratios = vec![
            GeoRatio { fips: "06073".into(), label: "San Diego".into(), ratio: Ratio::Percent(12.5) },
            GeoRatio { fips: "06001".into(), label: "Alameda".into(), ratio: Ratio::Undefined },
        ];
        write_ratios_csv(&ratios, &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "FIPS,County,Percentage");
        assert_eq!(lines[1], "06073,San Diego,12.5");
        assert_eq!(lines[2], "06001,Alameda,");
    }
}
