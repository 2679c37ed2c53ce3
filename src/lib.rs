pub mod aggregate;
pub mod catalog;
pub mod census;
pub mod config;
pub mod credentials;
pub mod error;
pub mod geo;
pub mod ingestion;
pub mod store;
pub mod viz;

pub use aggregate::{AirLevel, GeoRatio, Ratio, ThresholdAggregator};
pub use catalog::{GoalCatalog, GoalSpec};
pub use config::{AppConfig, PipelineConfig};
pub use credentials::{CredentialProvider, Credentials};
pub use error::{IngestError, Result, ValidationError};
pub use geo::{derive_key, join_on_geo, JoinKind};
pub use ingestion::{IngestionOutcome, IngestionPipeline, IngestionReport, Request};
pub use store::{FactStore, Window};
