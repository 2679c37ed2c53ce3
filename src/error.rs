use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl IngestError {
    /// True for failures reported by the remote service or its transport,
    /// as opposed to local storage/config problems.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            IngestError::Remote { .. } | IngestError::MalformedResponse(_) | IngestError::Transport(_)
        )
    }
}

impl From<polars::error::PolarsError> for IngestError {
    fn from(err: polars::error::PolarsError) -> Self {
        IngestError::Polars(err.to_string())
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Transport(err.to_string())
    }
}

/// Date-range policy violations. Never clamped, always surfaced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("could not parse {param} value '{value}' (expected format {format})")]
    UnparseableDate { param: String, value: String, format: String },

    #[error("date {date} cannot be before {floor}")]
    BeforeFloor { date: NaiveDate, floor: NaiveDate },

    #[error("date {date} cannot be in the future (today is {today})")]
    InFuture { date: NaiveDate, today: NaiveDate },

    #[error("end date {end} cannot be before begin date {begin}")]
    EndBeforeBegin { begin: NaiveDate, end: NaiveDate },

    #[error("date range cannot exceed {max_years} years ({days} days requested)")]
    SpanTooLong { days: i64, max_years: i64 },

    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("unknown search goal '{0}'")]
    UnknownGoal(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;
