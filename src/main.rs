use airquality_ingest::aggregate::{write_frame_csv, write_ratios_csv, AirLevel, GeoRatio, ThresholdAggregator};
use airquality_ingest::catalog::GoalCatalog;
use airquality_ingest::census::{load_variables, CensusClient, CensusQuery};
use airquality_ingest::config::AppConfig;
use airquality_ingest::credentials::{CredentialKind, CredentialProvider, Credentials, InteractiveCredentials};
use airquality_ingest::geo::FipsColumn;
use airquality_ingest::ingestion::sink::{CsvSink, RowSink};
use airquality_ingest::ingestion::transform::{aqs_sample_cleaning, fips_enrichment, sample_load_transforms, RowTransform};
use airquality_ingest::ingestion::{
    AlwaysApprove, ChunkPlan, ConsentGate, HttpFetcher, IngestionOutcome, IngestionPipeline, Request,
};
use airquality_ingest::store::{FactStore, GeoColumns, Window};
use airquality_ingest::viz::{choropleth_geojson, load_geojson};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "airquality-ingest")]
#[command(about = "Chunked EPA AQS / Census ingestion, storage and threshold aggregation")]
struct Cli {
    /// Optional JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a goal against the AQS API
    Fetch {
        /// Goal name from the catalog, e.g. "Daily Data by County"
        #[arg(short, long)]
        goal: String,

        /// Request parameter as name=value (repeatable)
        #[arg(short, long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Output CSV file
        #[arg(short, long)]
        out: PathBuf,

        /// Two-line file with account email and key
        #[arg(long, default_value = "aqsEmailKey.txt")]
        key_file: PathBuf,

        /// Skip the confirmation for chunked pulls
        #[arg(short, long)]
        yes: bool,

        /// Apply the sample-data cleaning chain instead of FIPS enrichment only
        #[arg(long)]
        clean: bool,
    },

    /// Pull ACS 5-year profile variables for every county of a state
    Census {
        #[arg(long)]
        start_year: i32,

        #[arg(long)]
        end_year: i32,

        /// JSON object of variable code -> column label
        #[arg(long)]
        variables: PathBuf,

        #[arg(long, default_value = "06")]
        state: String,

        #[arg(short, long)]
        out: PathBuf,

        #[arg(long, default_value = "censusKey.txt")]
        key_file: PathBuf,
    },

    /// Load AQS CSV files into a table (replaces the table)
    Load {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long)]
        table: String,

        #[arg(long, default_value_t = 10_000)]
        chunk_size: usize,

        /// Skip the sample-data cleaning chain and only add FIPS keys
        #[arg(long)]
        raw: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Load a census CSV into a table (replaces the table)
    LoadCensus {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long)]
        table: String,

        file: PathBuf,
    },

    /// Percentage of readings above a threshold for one county
    Percent {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long)]
        table: String,

        #[arg(long)]
        fips: String,

        #[arg(long)]
        threshold: f64,

        #[command(flatten)]
        window: WindowArgs,
    },

    /// Percentage above a threshold for every county in a table
    PercentAll {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long)]
        table: String,

        #[arg(long)]
        threshold: f64,

        /// Only counties of this state (matched against the `state` column)
        #[arg(long)]
        state: Option<String>,

        #[command(flatten)]
        window: WindowArgs,

        #[command(flatten)]
        output: RatioOutput,
    },

    /// Yearly share of readings at or above an air level, per county
    Proportions {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long, default_value = "PM25")]
        table: String,

        /// moderate, unhealthy, or a number
        #[arg(long, default_value = "unhealthy")]
        level: AirLevel,

        #[arg(long)]
        year: i32,

        #[command(flatten)]
        output: RatioOutput,
    },

    /// Join yearly air-level shares with census columns on FIPS
    Compare {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long, default_value = "PM25")]
        air_table: String,

        /// moderate, unhealthy, or a number
        #[arg(long, default_value = "unhealthy")]
        level: AirLevel,

        #[arg(long)]
        year: i32,

        #[arg(long)]
        census_table: String,

        /// Census columns to total into `values`
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,

        /// Write the joined table as CSV here
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// List tables
    Tables {
        #[command(flatten)]
        db: DbArgs,
    },

    /// List a table's columns
    Columns {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long)]
        table: String,
    },

    /// Create an index on one or more columns
    Index {
        #[command(flatten)]
        db: DbArgs,

        #[arg(long)]
        table: String,

        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
    },
}

#[derive(Args)]
struct DbArgs {
    /// SQLite database file
    #[arg(long, default_value = "airquality.sqlite")]
    db: PathBuf,
}

#[derive(Args)]
struct WindowArgs {
    #[arg(long, requires = "end_year", conflicts_with_all = ["begin_date", "end_date"])]
    begin_year: Option<i32>,

    #[arg(long, requires = "begin_year")]
    end_year: Option<i32>,

    /// YYYY-MM-DD
    #[arg(long, requires = "end_date")]
    begin_date: Option<NaiveDate>,

    #[arg(long, requires = "begin_date")]
    end_date: Option<NaiveDate>,
}

impl WindowArgs {
    fn window(&self) -> Window {
        match (self.begin_year, self.end_year, self.begin_date, self.end_date) {
            (Some(b), Some(e), _, _) => Window::Years(b, e),
            (_, _, Some(b), Some(e)) => Window::Dates(b, e),
            _ => Window::All,
        }
    }
}

#[derive(Args)]
struct RatioOutput {
    /// Write FIPS,County,Percentage CSV here
    #[arg(long)]
    out: Option<PathBuf>,

    /// County GeoJSON to attach ratios to
    #[arg(long, requires = "geojson_out")]
    geojson: Option<PathBuf>,

    #[arg(long, requires = "geojson")]
    geojson_out: Option<PathBuf>,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    Ok((k.trim().to_string(), v.trim().to_string()))
}

/// Asks on the terminal before a chunked pull starts.
struct PromptConsent;

impl ConsentGate for PromptConsent {
    fn confirm(&self, plan: &ChunkPlan) -> bool {
        println!(
            "Goal '{}' spans {} and will be fetched in {} quarterly chunks.",
            plan.goal,
            plan.span,
            plan.chunks.len()
        );
        if let Some(advisory) = &plan.advisory {
            println!("Warning: {}.", advisory.message);
        }
        print!("Continue? [y/N] ");
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}

fn resolve_credentials(path: PathBuf, kind: CredentialKind) -> Result<Credentials> {
    let provider = InteractiveCredentials::new(path, kind, BufReader::new(std::io::stdin()), std::io::stdout());
    Ok(provider.resolve()?)
}

fn emit_ratios(ratios: &[GeoRatio], output: &RatioOutput) -> Result<()> {
    for r in ratios {
        println!("{}\t{}\t{}", r.fips, r.label, r.ratio);
    }
    if let Some(out) = &output.out {
        write_ratios_csv(ratios, out)?;
    }
    if let (Some(geojson), Some(geojson_out)) = (&output.geojson, &output.geojson_out) {
        let counties = load_geojson(geojson)?;
        let collection = choropleth_geojson(&counties, ratios, "Percentage")?;
        std::fs::write(geojson_out, serde_json::to_string(&collection)?)
            .with_context(|| format!("writing {}", geojson_out.display()))?;
        info!("Wrote choropleth data to {}", geojson_out.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Fetch {
            goal,
            params,
            out,
            key_file,
            yes,
            clean,
        } => {
            let catalog = match &config.goals_file {
                Some(path) => GoalCatalog::load(path)?,
                None => GoalCatalog::aqs_default(),
            };
            let credentials = resolve_credentials(key_file, CredentialKind::AccountAndKey)?;
            let fetcher = HttpFetcher::new(config.aqs_base_url.clone(), config.request_timeout)?;
            let transforms: Vec<Box<dyn RowTransform>> = if clean {
                aqs_sample_cleaning()
            } else {
                fips_enrichment()
            };

            let pipeline = IngestionPipeline::new(Arc::new(catalog), Arc::new(fetcher), config.pipeline.clone())
                .with_transforms(transforms);
            let request = Request::new(goal).params(params).credentials(credentials);
            let consent: Box<dyn ConsentGate> = if yes { Box::new(AlwaysApprove) } else { Box::new(PromptConsent) };

            let mut sink = CsvSink::new(&out);
            let outcome = pipeline.run(&request, consent.as_ref(), &mut sink).await;

            // rows still in memory: the whole single-request result, or what a
            // failed chunked run had not flushed yet
            if let Some(report) = outcome.report() {
                if !report.rows.is_empty() {
                    sink.write(&report.rows)?;
                }
            }

            println!("{}", outcome.message());
            match outcome {
                IngestionOutcome::Succeeded(_) | IngestionOutcome::Declined(_) => Ok(()),
                IngestionOutcome::PartiallyFailed { .. } => {
                    warn!("Partial data kept in {}", out.display());
                    bail!("ingestion stopped early")
                }
                IngestionOutcome::Rejected(_) | IngestionOutcome::Failed { .. } => bail!("ingestion failed"),
            }
        }

        Command::Census {
            start_year,
            end_year,
            variables,
            state,
            out,
            key_file,
        } => {
            let credentials = resolve_credentials(key_file, CredentialKind::KeyOnly)?;
            let fetcher = HttpFetcher::new(config.census_base_url.clone(), config.request_timeout)?;
            let client = CensusClient::new(Arc::new(fetcher), config.pipeline.pacing);
            let query = CensusQuery {
                start_year,
                end_year,
                variables: load_variables(&variables)?,
                state,
            };

            let pull = client.fetch_years(&query, &credentials).await?;
            CsvSink::new(&out).write(&pull.rows)?;
            println!(
                "Saved {} rows for {} years to {}",
                pull.rows.len(),
                pull.years_loaded.len(),
                out.display()
            );
            for (year, reason) in &pull.years_skipped {
                println!("Skipped {}: {}", year, reason);
            }
            Ok(())
        }

        Command::Load {
            db,
            table,
            chunk_size,
            raw,
            files,
        } => {
            let store = FactStore::open(&db.db)?;
            let rows = store.load_csv_files(&files, chunk_size, &table, &sample_load_transforms(raw))?;
            println!("Loaded {} rows into {}", rows, table);
            Ok(())
        }

        Command::LoadCensus { db, table, file } => {
            let store = FactStore::open(&db.db)?;
            let transforms: Vec<Box<dyn RowTransform>> = vec![Box::new(FipsColumn::census())];
            let rows = store.load_csv_files(&[file], 10_000, &table, &transforms)?;
            println!("Loaded {} rows into {}", rows, table);
            Ok(())
        }

        Command::Percent {
            db,
            table,
            fips,
            threshold,
            window,
        } => {
            let store = FactStore::open(&db.db)?;
            let ratio = ThresholdAggregator::new(&store).percent_above(&table, &fips, threshold, window.window())?;
            if ratio.is_undefined() {
                println!("no data returned for FIPS code {} in {}", fips, window.window());
            } else {
                println!("{}: {}", fips, ratio);
            }
            Ok(())
        }

        Command::PercentAll {
            db,
            table,
            threshold,
            state,
            window,
            output,
        } => {
            let store = FactStore::open(&db.db)?;
            let geos = store.county_fips(&table, &GeoColumns::default(), state.as_deref())?;
            let ratios = ThresholdAggregator::new(&store).percent_above_for_all_geos(
                &table,
                &geos,
                threshold,
                window.window(),
            )?;
            emit_ratios(&ratios, &output)
        }

        Command::Proportions {
            db,
            table,
            level,
            year,
            output,
        } => {
            let store = FactStore::open(&db.db)?;
            let ratios = ThresholdAggregator::new(&store).proportions_for_year(&table, level, year)?;
            emit_ratios(&ratios, &output)
        }

        Command::Compare {
            db,
            air_table,
            level,
            year,
            census_table,
            columns,
            out,
        } => {
            let store = FactStore::open(&db.db)?;
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            let mut joined = ThresholdAggregator::new(&store).compare_with_census(
                &air_table,
                level,
                year,
                &census_table,
                &columns,
            )?;
            println!("{}", joined);
            if let Some(out) = &out {
                write_frame_csv(&mut joined, out)?;
            }
            Ok(())
        }

        Command::Tables { db } => {
            for table in FactStore::open(&db.db)?.list_tables()? {
                println!("{}", table);
            }
            Ok(())
        }

        Command::Columns { db, table } => {
            for column in FactStore::open(&db.db)?.column_names(&table)? {
                println!("{}", column);
            }
            Ok(())
        }

        Command::Index { db, table, columns } => {
            let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
            let name = FactStore::open(&db.db)?.create_index(&table, &columns)?;
            println!("Index {} ready", name);
            Ok(())
        }
    }
}
