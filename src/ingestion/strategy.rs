//! Query strategy selection - decides how a request's date span is fetched

use crate::error::ValidationError;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Date limits and thresholds applied to every date-ranged request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DatePolicy {
    /// Earliest date the remote service holds
    pub floor: NaiveDate,
    pub single_shot_max_days: i64,
    /// Chunked spans longer than this carry a performance advisory
    pub advisory_after_days: i64,
    pub max_span_days: i64,
    pub begin_param: String,
    pub end_param: String,
    pub date_format: String,
}

impl Default for DatePolicy {
    fn default() -> Self {
        Self {
            floor: NaiveDate::from_ymd_opt(1980, 1, 1).unwrap_or(NaiveDate::MIN),
            single_shot_max_days: 90,
            advisory_after_days: 1825,
            max_span_days: 3650,
            begin_param: "bdate".to_string(),
            end_param: "edate".to_string(),
            date_format: "%Y%m%d".to_string(),
        }
    }
}

impl DatePolicy {
    pub fn format_date(&self, date: NaiveDate) -> String {
        date.format(&self.date_format).to_string()
    }
}

/// A validated, immutable (begin, end) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSpan {
    begin: NaiveDate,
    end: NaiveDate,
}

impl DateSpan {
    pub fn begin(&self) -> NaiveDate {
        self.begin
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Whole days from begin to end (0 for a single-day span).
    pub fn days(&self) -> i64 {
        (self.end - self.begin).num_days()
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.begin, self.end)
    }
}

/// Non-fatal warning attached to very long chunked spans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advisory {
    pub days: i64,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Begin or end date absent: one request, parameters as given
    NoDateFilter,
    SingleShot(DateSpan),
    Chunked {
        span: DateSpan,
        advisory: Option<Advisory>,
    },
}

impl QueryStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            QueryStrategy::NoDateFilter => StrategyKind::NoDateFilter,
            QueryStrategy::SingleShot(_) => StrategyKind::SingleShot,
            QueryStrategy::Chunked { .. } => StrategyKind::Chunked,
        }
    }

    pub fn span(&self) -> Option<DateSpan> {
        match self {
            QueryStrategy::NoDateFilter => None,
            QueryStrategy::SingleShot(span) => Some(*span),
            QueryStrategy::Chunked { span, .. } => Some(*span),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    NoDateFilter,
    SingleShot,
    Chunked,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::NoDateFilter => "no-date-filter",
            StrategyKind::SingleShot => "single-shot",
            StrategyKind::Chunked => "chunked",
        };
        f.write_str(name)
    }
}

pub struct QueryStrategySelector {
    policy: DatePolicy,
}

impl QueryStrategySelector {
    pub fn new(policy: DatePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DatePolicy {
        &self.policy
    }

    /// Select a strategy against the local calendar date.
    pub fn select(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<QueryStrategy, ValidationError> {
        self.select_at(params, Local::now().date_naive())
    }

    pub fn select_at(
        &self,
        params: &BTreeMap<String, String>,
        today: NaiveDate,
    ) -> Result<QueryStrategy, ValidationError> {
        let begin = params.get(&self.policy.begin_param).map(|s| s.trim());
        let end = params.get(&self.policy.end_param).map(|s| s.trim());

        match (begin, end) {
            (Some(b), Some(e)) if !b.is_empty() && !e.is_empty() => {
                let begin = self.parse(&self.policy.begin_param, b)?;
                let end = self.parse(&self.policy.end_param, e)?;
                self.classify(begin, end, today)
            }
            _ => Ok(QueryStrategy::NoDateFilter),
        }
    }

    /// Validate a span and pick single-shot or chunked handling.
    pub fn classify(
        &self,
        begin: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
    ) -> Result<QueryStrategy, ValidationError> {
        let span = self.validate(begin, end, today)?;
        let days = span.days();

        if days <= self.policy.single_shot_max_days {
            Ok(QueryStrategy::SingleShot(span))
        } else if days <= self.policy.advisory_after_days {
            Ok(QueryStrategy::Chunked { span, advisory: None })
        } else {
            Ok(QueryStrategy::Chunked {
                span,
                advisory: Some(Advisory {
                    days,
                    message: format!(
                        "large date range ({} days) may result in slower performance",
                        days
                    ),
                }),
            })
        }
    }

    pub fn validate(
        &self,
        begin: NaiveDate,
        end: NaiveDate,
        today: NaiveDate,
    ) -> Result<DateSpan, ValidationError> {
        let floor = self.policy.floor;
        for date in [begin, end] {
            if date < floor {
                return Err(ValidationError::BeforeFloor { date, floor });
            }
        }
        for date in [begin, end] {
            if date > today {
                return Err(ValidationError::InFuture { date, today });
            }
        }
        if end < begin {
            return Err(ValidationError::EndBeforeBegin { begin, end });
        }

        let days = (end - begin).num_days();
        if days > self.policy.max_span_days {
            return Err(ValidationError::SpanTooLong {
                days,
                max_years: self.policy.max_span_days / 365,
            });
        }

        Ok(DateSpan { begin, end })
    }

    fn parse(&self, param: &str, value: &str) -> Result<NaiveDate, ValidationError> {
        NaiveDate::parse_from_str(value, &self.policy.date_format).map_err(|_| {
            ValidationError::UnparseableDate {
                param: param.to_string(),
                value: value.to_string(),
                format: self.policy.date_format.clone(),
            }
        })
    }
}

impl Default for QueryStrategySelector {
    fn default() -> Self {
        Self::new(DatePolicy::default())
    }
}
