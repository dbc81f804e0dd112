//! natal-core: natal chart attributes, vocational feature encoding and the forest classifier.
//!
//! The batch pipeline and the HTTP gateway both go through [`FeatureRecordBuilder`] and a
//! frozen [`EncodingSchema`], so a record is encoded the same way at training and serving time.

mod error;
mod forest;
mod trainer;
pub mod artifacts;
pub mod chart;
pub mod config;
pub mod dataset;
pub mod derive;
pub mod encoding;
pub mod features;
pub mod predict;
pub mod remote;
pub mod sources;

// Errors
pub use error::{
    ArtifactError, ConfigError, DataError, DataResult, OracleError, PredictionError, RequestStage,
    TrainingError, ValidationError,
};

// Chart and attributes
pub use chart::{BirthFact, Body, Chart, ChartOracle, ChartPoint, MeanMotionOracle, PointId, Sign};
pub use derive::{AttributeDeriver, DerivedAttributeSet, Temperament};

// Features and encoding
pub use encoding::{EncodingSchema, LabelMapping, PreparedDataset, PreparedRow};
pub use features::{FeatureRecord, FeatureRecordBuilder, FieldValue, Row, LAYOUT};

// Training
pub use forest::{ForestParams, RandomForest};
pub use trainer::{ClassMetrics, ClassifierTrainer, TrainerConfig, TrainingReport};

// Artifacts, data and serving
pub use artifacts::{ArtifactPaths, ModelBundle};
pub use config::{GatewayConfig, PipelineConfig};
pub use dataset::PersonRecord;
pub use predict::{AnalysisResponse, Prediction, ServiceContext};
pub use remote::{RemoteSource, RemoteSourceConfig};
pub use sources::{BundledSample, DataSource, Fetched, LocalFile, Resource, SourceChain};
