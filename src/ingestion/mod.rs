//! Chunked, rate-aware bulk ingestion
//!
//! Partitioning, strategy selection, remote fetching, accumulation and
//! flushing to a sink, tied together by the pipeline.

pub mod accumulator;
pub mod batch;
pub mod fetcher;
pub mod pacer;
pub mod partition;
pub mod pipeline;
pub mod schema_inference;
pub mod sink;
pub mod strategy;
pub mod transform;

pub use accumulator::Accumulator;
pub use batch::{Row, RowBatch};
pub use fetcher::{Envelope, HttpFetcher, RemoteFetcher};
pub use pacer::{Pacer, SleepPacer};
pub use partition::{partition, Chunk};
pub use pipeline::{
    AlwaysApprove, AlwaysDecline, ChunkPlan, ConsentGate, IngestionOutcome, IngestionPipeline,
    IngestionReport, Request,
};
pub use schema_inference::{ColumnType, InferredColumn, SchemaInference};
pub use sink::{CsvSink, RowSink};
pub use strategy::{Advisory, DatePolicy, DateSpan, QueryStrategy, QueryStrategySelector, StrategyKind};
pub use transform::{aqs_sample_cleaning, apply_all, DateParts, DropColumns, DropQualified, RowTransform};
