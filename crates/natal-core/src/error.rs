//! Error types for chart computation, data acquisition, training and serving.

use thiserror::Error;

/// Result type alias for data-source operations
pub type DataResult<T> = Result<T, DataError>;

/// The chart oracle could not produce a chart for a birth fact.
///
/// Batch feature building recovers from this locally by degrading the record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("invalid coordinates: latitude {latitude}, longitude {longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("birth year {0} is outside the supported range")]
    YearOutOfRange(i32),

    #[error("oracle failure: {0}")]
    Computation(String),
}

/// Upstream data could not be acquired or parsed.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("source {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("malformed payload from {source_name}: {reason}")]
    Malformed { source_name: String, reason: String },

    #[error("every data source failed for {0}")]
    Exhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Required configuration is missing or invalid. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("configuration load failed: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration serialization failed: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// A client request is missing fields or carries unparseable values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Persisted artifacts could not be read, written or matched against each other.
#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact mismatch: {0}")]
    Mismatch(String),
}

/// Training could not proceed on the supplied dataset.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("inconsistent dataset: {0}")]
    Inconsistent(String),
}

/// Per-request pipeline position used to tag prediction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStage {
    Received,
    ChartComputed,
    FeaturesBuilt,
    Encoded,
    Scored,
    Responded,
}

impl std::fmt::Display for RequestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStage::Received => "received",
            RequestStage::ChartComputed => "chart_computed",
            RequestStage::FeaturesBuilt => "features_built",
            RequestStage::Encoded => "encoded",
            RequestStage::Scored => "scored",
            RequestStage::Responded => "responded",
        };
        f.write_str(s)
    }
}

/// A request failed after entering the prediction pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("prediction failed at stage {stage}: {cause}")]
pub struct PredictionError {
    /// Stage the request was attempting when it failed.
    pub stage: RequestStage,
    pub cause: String,
}

impl PredictionError {
    pub fn new(stage: RequestStage, cause: impl Into<String>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }
}
