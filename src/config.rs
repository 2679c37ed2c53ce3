//! Application configuration
//!
//! Built once at process start: defaults, then an optional JSON file, then
//! environment overrides. Passed by reference into the components that need it.

use crate::error::{IngestError, Result};
use crate::ingestion::strategy::DatePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_AQS_BASE_URL: &str = "https://aqs.epa.gov/data/api";
pub const DEFAULT_CENSUS_BASE_URL: &str = "https://api.census.gov/data";

/// Knobs for one ingestion pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Accumulator size that triggers a flush to the sink
    pub flush_threshold: usize,
    /// Pause between consecutive chunk requests
    #[serde(with = "duration_secs")]
    pub pacing: Duration,
    pub date_policy: DatePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 10_000,
            pacing: Duration::from_secs(5),
            date_policy: DatePolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub aqs_base_url: String,
    pub census_base_url: String,
    /// Goal catalog file; the built-in AQS catalog is used when unset
    pub goals_file: Option<PathBuf>,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            aqs_base_url: DEFAULT_AQS_BASE_URL.to_string(),
            census_base_url: DEFAULT_CENSUS_BASE_URL.to_string(),
            goals_file: None,
            request_timeout: Duration::from_secs(120),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid by `path` when given, then by the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        base.with_env_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| IngestError::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("AQS_BASE_URL") {
            self.aqs_base_url = url;
        }
        if let Some(url) = lookup("CENSUS_BASE_URL") {
            self.census_base_url = url;
        }
        if let Some(file) = lookup("AIRQ_GOALS_FILE") {
            self.goals_file = Some(PathBuf::from(file));
        }
        if let Some(v) = lookup("AIRQ_FLUSH_THRESHOLD") {
            self.pipeline.flush_threshold = parse_var("AIRQ_FLUSH_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("AIRQ_PACING_SECS") {
            self.pipeline.pacing = Duration::from_secs(parse_var("AIRQ_PACING_SECS", &v)?);
        }
        if let Some(v) = lookup("AIRQ_REQUEST_TIMEOUT_SECS") {
            self.request_timeout = Duration::from_secs(parse_var("AIRQ_REQUEST_TIMEOUT_SECS", &v)?);
        }

        if self.pipeline.flush_threshold == 0 {
            return Err(IngestError::Config("flush threshold must be positive".to_string()));
        }
        debug!("Resolved config: {:?}", self);
        Ok(self)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| IngestError::Config(format!("{} has an invalid value '{}'", name, value)))
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
