//! Ingestion Pipeline - drives one request from validation to a typed outcome
//!
//! Flow: select a strategy, then either fetch once (no date filter / single
//! shot) or, after consent, fetch quarter-aligned chunks serially with pacing
//! between them. Fetched rows go through the row transforms into the
//! accumulator, which is flushed to the sink in threshold-sized units.

use crate::catalog::{GoalCatalog, GoalSpec};
use crate::config::PipelineConfig;
use crate::credentials::Credentials;
use crate::error::{IngestError, ValidationError};
use crate::ingestion::accumulator::Accumulator;
use crate::ingestion::batch::RowBatch;
use crate::ingestion::fetcher::RemoteFetcher;
use crate::ingestion::pacer::{Pacer, SleepPacer};
use crate::ingestion::partition::{partition, Chunk};
use crate::ingestion::sink::RowSink;
use crate::ingestion::strategy::{Advisory, DateSpan, QueryStrategy, QueryStrategySelector, StrategyKind};
use crate::ingestion::transform::{apply_all, fips_enrichment, RowTransform};
use chrono::{Local, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One ingestion request: a goal plus its parameters and credentials.
#[derive(Clone, Debug)]
pub struct Request {
    goal: String,
    parameters: BTreeMap<String, String>,
    credentials: Credentials,
}

impl Request {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            parameters: BTreeMap::new(),
            credentials: Credentials::none(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.parameters
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }
}

/// What a chunked run is about to do, shown to the consent gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub goal: String,
    pub span: DateSpan,
    pub chunks: Vec<Chunk>,
    pub advisory: Option<Advisory>,
}

/// Caller decision point before any chunked fetch is issued.
pub trait ConsentGate: Send + Sync {
    fn confirm(&self, plan: &ChunkPlan) -> bool;
}

impl<F> ConsentGate for F
where
    F: Fn(&ChunkPlan) -> bool + Send + Sync,
{
    fn confirm(&self, plan: &ChunkPlan) -> bool {
        self(plan)
    }
}

pub struct AlwaysApprove;

impl ConsentGate for AlwaysApprove {
    fn confirm(&self, _plan: &ChunkPlan) -> bool {
        true
    }
}

pub struct AlwaysDecline;

impl ConsentGate for AlwaysDecline {
    fn confirm(&self, _plan: &ChunkPlan) -> bool {
        false
    }
}

/// Counters and in-memory rows of a run.
#[derive(Clone, Debug)]
pub struct IngestionReport {
    pub run_id: String,
    pub goal: String,
    pub strategy: StrategyKind,
    pub span: Option<DateSpan>,
    pub advisory: Option<Advisory>,
    pub chunks_total: usize,
    pub chunks_completed: usize,
    pub rows_fetched: u64,
    pub rows_flushed: u64,
    pub flushes: usize,
    pub pauses: usize,
    /// Sink description when anything was flushed
    pub sink: Option<String>,
    /// Rows held in memory: the whole result for single requests, the
    /// unflushed remainder after a partial failure
    pub rows: RowBatch,
}

impl IngestionReport {
    fn new(goal: &str, strategy: StrategyKind, span: Option<DateSpan>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            goal: goal.to_string(),
            strategy,
            span,
            advisory: None,
            chunks_total: 0,
            chunks_completed: 0,
            rows_fetched: 0,
            rows_flushed: 0,
            flushes: 0,
            pauses: 0,
            sink: None,
            rows: RowBatch::default(),
        }
    }

    /// Rows this run kept, flushed or still in memory.
    pub fn rows_kept(&self) -> u64 {
        self.rows_flushed + self.rows.len() as u64
    }

    fn scope(&self) -> String {
        match &self.span {
            Some(span) => format!("goal '{}' in range {}", self.goal, span),
            None => format!("goal '{}'", self.goal),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum IngestionOutcome {
    Succeeded(IngestionReport),
    /// Request rejected before any network call
    Rejected(ValidationError),
    /// Caller declined the chunked plan; no calls made
    Declined(ChunkPlan),
    /// The only request of a non-chunked run failed
    Failed { goal: String, error: IngestError },
    /// A chunk failed; everything before it is kept
    PartiallyFailed {
        report: IngestionReport,
        failed_chunk: Chunk,
        error: IngestError,
    },
}

impl IngestionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, IngestionOutcome::Succeeded(_))
    }

    pub fn report(&self) -> Option<&IngestionReport> {
        match self {
            IngestionOutcome::Succeeded(report) => Some(report),
            IngestionOutcome::PartiallyFailed { report, .. } => Some(report),
            _ => None,
        }
    }

    pub fn into_report(self) -> Option<IngestionReport> {
        match self {
            IngestionOutcome::Succeeded(report) => Some(report),
            IngestionOutcome::PartiallyFailed { report, .. } => Some(report),
            _ => None,
        }
    }

    /// User-facing summary. An empty result never reads as a failure.
    pub fn message(&self) -> String {
        match self {
            IngestionOutcome::Succeeded(report) if report.rows_fetched == 0 => {
                format!("no data returned for {}", report.scope())
            }
            IngestionOutcome::Succeeded(report) => {
                let mut msg = format!("fetched {} rows for {}", report.rows_fetched, report.scope());
                if let Some(sink) = &report.sink {
                    msg.push_str(&format!(" ({} written to {})", report.rows_flushed, sink));
                }
                msg
            }
            IngestionOutcome::Rejected(err) => format!("request rejected: {}", err),
            IngestionOutcome::Declined(plan) => format!(
                "declined chunked fetch of {} chunks for {}",
                plan.chunks.len(),
                plan.span
            ),
            IngestionOutcome::Failed { goal, error } => {
                format!("request for goal '{}' failed: {}", goal, error)
            }
            IngestionOutcome::PartiallyFailed {
                report,
                failed_chunk,
                error,
            } => format!(
                "chunk {} ({} of {}) failed: {}; kept {} rows from {} completed chunks",
                failed_chunk,
                report.chunks_completed + 1,
                report.chunks_total,
                error,
                report.rows_kept(),
                report.chunks_completed
            ),
        }
    }
}

pub struct IngestionPipeline {
    catalog: Arc<GoalCatalog>,
    selector: QueryStrategySelector,
    fetcher: Arc<dyn RemoteFetcher>,
    pacer: Arc<dyn Pacer>,
    transforms: Vec<Box<dyn RowTransform>>,
    config: PipelineConfig,
    today: Option<NaiveDate>,
}

impl IngestionPipeline {
    pub fn new(catalog: Arc<GoalCatalog>, fetcher: Arc<dyn RemoteFetcher>, config: PipelineConfig) -> Self {
        Self {
            catalog,
            selector: QueryStrategySelector::new(config.date_policy.clone()),
            fetcher,
            pacer: Arc::new(SleepPacer),
            transforms: fips_enrichment(),
            config,
            today: None,
        }
    }

    pub fn with_pacer(mut self, pacer: Arc<dyn Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<Box<dyn RowTransform>>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Pin "today" for date validation instead of the local clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(
        &self,
        request: &Request,
        consent: &dyn ConsentGate,
        sink: &mut dyn RowSink,
    ) -> IngestionOutcome {
        let (goal, strategy) = match self.validate(request) {
            Ok(v) => v,
            Err(err) => {
                warn!("Rejected request for '{}': {}", request.goal, err);
                return IngestionOutcome::Rejected(err);
            }
        };

        info!("Goal '{}' using {} strategy", request.goal, strategy.kind());

        match strategy {
            QueryStrategy::NoDateFilter | QueryStrategy::SingleShot(_) => {
                self.run_single(request, goal, &strategy).await
            }
            QueryStrategy::Chunked { span, advisory } => {
                let plan = ChunkPlan {
                    goal: request.goal.clone(),
                    span,
                    chunks: partition(span.begin(), span.end()),
                    advisory,
                };
                if let Some(advisory) = &plan.advisory {
                    warn!("{}", advisory.message);
                }
                if !consent.confirm(&plan) {
                    info!("Chunked fetch of {} chunks declined", plan.chunks.len());
                    return IngestionOutcome::Declined(plan);
                }
                self.run_chunked(request, goal, plan, sink).await
            }
        }
    }

    fn validate<'a>(&'a self, request: &Request) -> Result<(&'a GoalSpec, QueryStrategy), ValidationError> {
        let goal = self.catalog.get(&request.goal)?;
        let policy = self.selector.policy();

        for name in &goal.parameters {
            if *name == policy.begin_param || *name == policy.end_param {
                continue;
            }
            let present = request
                .parameters
                .get(name)
                .is_some_and(|v| !v.trim().is_empty());
            if !present {
                return Err(ValidationError::MissingParameter(name.clone()));
            }
        }

        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let strategy = self.selector.select_at(&request.parameters, today)?;
        Ok((goal, strategy))
    }

    /// Credentials, then the goal's parameters in catalog order, then any
    /// extra request parameters. `chunk` replaces the date bounds.
    fn query_params(&self, request: &Request, goal: &GoalSpec, chunk: Option<&Chunk>) -> Vec<(String, String)> {
        let policy = self.selector.policy();
        let mut params: Vec<(String, String)> = request.credentials.query_pairs().to_vec();

        let ordered = goal
            .parameters
            .iter()
            .filter_map(|name| request.parameters.get(name).map(|v| (name, v)));
        let extra = request
            .parameters
            .iter()
            .filter(|(name, _)| !goal.requires(name));

        for (name, value) in ordered.chain(extra) {
            let value = match chunk {
                Some(c) if *name == policy.begin_param => policy.format_date(c.begin),
                Some(c) if *name == policy.end_param => policy.format_date(c.end),
                _ => value.trim().to_string(),
            };
            params.push((name.clone(), value));
        }
        params
    }

    async fn run_single(&self, request: &Request, goal: &GoalSpec, strategy: &QueryStrategy) -> IngestionOutcome {
        let mut report = IngestionReport::new(&request.goal, strategy.kind(), strategy.span());
        report.chunks_total = 1;

        let params = self.query_params(request, goal, None);
        match self.fetcher.fetch(&goal.endpoint, goal.envelope, &params).await {
            Ok(batch) => {
                let batch = apply_all(&self.transforms, batch);
                report.rows_fetched = batch.len() as u64;
                report.chunks_completed = 1;
                report.rows = batch;
                info!("Goal '{}' returned {} rows", request.goal, report.rows_fetched);
                IngestionOutcome::Succeeded(report)
            }
            Err(err) => {
                error!("Request for goal '{}' failed: {}", request.goal, err);
                IngestionOutcome::Failed {
                    goal: request.goal.clone(),
                    error: err,
                }
            }
        }
    }

    async fn run_chunked(
        &self,
        request: &Request,
        goal: &GoalSpec,
        plan: ChunkPlan,
        sink: &mut dyn RowSink,
    ) -> IngestionOutcome {
        let mut report = IngestionReport::new(&request.goal, StrategyKind::Chunked, Some(plan.span));
        report.chunks_total = plan.chunks.len();
        report.advisory = plan.advisory.clone();

        let mut accumulator = Accumulator::new(self.config.flush_threshold);
        info!(
            "Run {}: {} chunks for goal '{}' over {}",
            report.run_id,
            plan.chunks.len(),
            request.goal,
            plan.span
        );

        for (i, chunk) in plan.chunks.iter().enumerate() {
            if i > 0 {
                self.pacer.pause(self.config.pacing).await;
                report.pauses += 1;
            }

            debug!("Chunk {}/{}: {}", i + 1, plan.chunks.len(), chunk);
            let params = self.query_params(request, goal, Some(chunk));
            let batch = match self.fetcher.fetch(&goal.endpoint, goal.envelope, &params).await {
                Ok(batch) => apply_all(&self.transforms, batch),
                Err(err) => {
                    error!("Chunk {} failed, stopping: {}", chunk, err);
                    report.rows = accumulator.take_remaining();
                    return IngestionOutcome::PartiallyFailed {
                        report,
                        failed_chunk: *chunk,
                        error: err,
                    };
                }
            };

            report.rows_fetched += batch.len() as u64;
            accumulator.append(batch);
            report.chunks_completed += 1;

            while let Some(ready) = accumulator.take_ready() {
                if let Err(err) = flush(sink, &ready, &mut report) {
                    return flush_failed(report, ready, accumulator, *chunk, err);
                }
            }
        }

        let remaining = accumulator.take_remaining();
        if !remaining.is_empty() {
            if let Err(err) = flush(sink, &remaining, &mut report) {
                let last = plan.chunks.last().copied().unwrap_or(Chunk {
                    begin: plan.span.begin(),
                    end: plan.span.end(),
                });
                return flush_failed(report, remaining, accumulator, last, err);
            }
        }

        info!(
            "Run {} complete: {} rows fetched, {} flushed in {} writes",
            report.run_id, report.rows_fetched, report.rows_flushed, report.flushes
        );
        IngestionOutcome::Succeeded(report)
    }
}

fn flush(sink: &mut dyn RowSink, batch: &RowBatch, report: &mut IngestionReport) -> crate::error::Result<()> {
    let written = sink.write(batch)?;
    report.rows_flushed += written as u64;
    report.flushes += 1;
    report.sink.get_or_insert_with(|| sink.describe());
    info!("Flushed {} rows to {}", written, sink.describe());
    Ok(())
}

/// A failed write keeps the unwritten rows in memory ahead of the remainder.
fn flush_failed(
    mut report: IngestionReport,
    mut unwritten: RowBatch,
    mut accumulator: Accumulator,
    chunk: Chunk,
    err: IngestError,
) -> IngestionOutcome {
    error!("Flush to sink failed, stopping: {}", err);
    unwritten.append(accumulator.take_remaining());
    report.rows = unwritten;
    IngestionOutcome::PartiallyFailed {
        report,
        failed_chunk: chunk,
        error: err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::fetcher::Envelope;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoFetcher {
        calls: Mutex<Vec<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl RemoteFetcher for EchoFetcher {
        async fn fetch(
            &self,
            _endpoint: &str,
            _envelope: Envelope,
            params: &[(String, String)],
        ) -> crate::error::Result<RowBatch> {
            self.calls.lock().unwrap().push(params.to_vec());
            Ok(RowBatch::default())
        }
    }

    fn pipeline() -> (IngestionPipeline, Arc<EchoFetcher>) {
        let fetcher = Arc::new(EchoFetcher {
            calls: Mutex::new(Vec::new()),
        });
        let pipeline = IngestionPipeline::new(
            Arc::new(GoalCatalog::aqs_default()),
            fetcher.clone(),
            PipelineConfig::default(),
        )
        .with_today(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        (pipeline, fetcher)
    }

    #[test]
    fn test_query_params_order_and_chunk_override() {
        let (pipeline, _) = pipeline();
        let goal = GoalCatalog::aqs_default().get("Daily Data by County").unwrap().clone();
        let request = Request::new("Daily Data by County")
            .params([
                ("state", "06"),
                ("county", "073"),
                ("param", "88101"),
                ("bdate", "20200101"),
                ("edate", "20201231"),
                ("cbdate", "20190101"),
            ])
            .credentials(Credentials::aqs("me@example.org", "k"));

        let chunk = Chunk {
            begin: NaiveDate::from_ymd_opt(2020, 4, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2020, 6, 30).unwrap(),
        };
        let params = pipeline.query_params(&request, &goal, Some(&chunk));
        let names: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["email", "key", "param", "bdate", "edate", "state", "county", "cbdate"]);
        assert_eq!(params[3].1, "20200401");
        assert_eq!(params[4].1, "20200630");
        assert_eq!(params[7].1, "20190101");
    }

    #[tokio::test]
    async fn test_missing_required_parameter_is_rejected() {
        let (pipeline, fetcher) = pipeline();
        let request = Request::new("Sites").param("state", "06");
        let mut sink = crate::ingestion::sink::CsvSink::new("unused.csv");

        let outcome = pipeline.run(&request, &AlwaysApprove, &mut sink).await;
        assert!(matches!(
            outcome,
            IngestionOutcome::Rejected(ValidationError::MissingParameter(ref p)) if p == "county"
        ));
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_goal_is_rejected() {
        let (pipeline, fetcher) = pipeline();
        let mut sink = crate::ingestion::sink::CsvSink::new("unused.csv");

        let outcome = pipeline.run(&Request::new("Hourly"), &AlwaysApprove, &mut sink).await;
        assert!(matches!(outcome, IngestionOutcome::Rejected(ValidationError::UnknownGoal(_))));
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_result_message_is_not_a_failure() {
        let (pipeline, _) = pipeline();
        let request = Request::new("Counties").param("state", "06");
        let mut sink = crate::ingestion::sink::CsvSink::new("unused.csv");

        let outcome = pipeline.run(&request, &AlwaysApprove, &mut sink).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.message(), "no data returned for goal 'Counties'");
    }
}
