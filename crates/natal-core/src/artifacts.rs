//! Persisted model bundle and the on-disk layout of pipeline artifacts.
//!
//! The classifier, its encoding schema and its label mapping are written as one document and
//! validated together on load, so a model can never be paired with a schema or label list it
//! was not trained with.

use crate::encoding::{EncodingSchema, LabelMapping, PreparedDataset};
use crate::error::{ArtifactError, DataError};
use crate::forest::RandomForest;
use crate::sources::{read_jsonl, write_jsonl};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bumped when the bundle document changes shape.
pub const BUNDLE_FORMAT: u32 = 1;

/// A classifier bound to the schema and labels it was trained with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub format: u32,
    pub trained_at: DateTime<Utc>,
    pub schema_fingerprint: String,
    pub schema: EncodingSchema,
    pub labels: LabelMapping,
    pub forest: RandomForest,
}

impl ModelBundle {
    pub fn new(
        schema: EncodingSchema,
        labels: LabelMapping,
        forest: RandomForest,
    ) -> Result<Self, ArtifactError> {
        let bundle = Self {
            format: BUNDLE_FORMAT,
            trained_at: Utc::now(),
            schema_fingerprint: schema.fingerprint(),
            schema,
            labels,
            forest,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    /// Checks that the three parts still describe the same model.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        if self.format != BUNDLE_FORMAT {
            return Err(ArtifactError::Mismatch(format!(
                "bundle format {} (expected {BUNDLE_FORMAT})",
                self.format
            )));
        }
        if self.forest.n_features() != self.schema.width() {
            return Err(ArtifactError::Mismatch(format!(
                "model expects {} features, schema has {} columns",
                self.forest.n_features(),
                self.schema.width()
            )));
        }
        if self.forest.n_classes() != self.labels.len() {
            return Err(ArtifactError::Mismatch(format!(
                "model has {} classes, label mapping has {}",
                self.forest.n_classes(),
                self.labels.len()
            )));
        }
        if self.schema_fingerprint != self.schema.fingerprint() {
            return Err(ArtifactError::Mismatch("schema fingerprint differs".into()));
        }
        self.labels.check()?;
        self.forest.check().map_err(ArtifactError::Mismatch)?;
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let bundle: Self = read_json(path)?;
        bundle.validate()?;
        tracing::info!(
            target: "natal::artifacts",
            path = %path.display(),
            features = bundle.schema.width(),
            classes = bundle.labels.len(),
            "model bundle loaded"
        );
        Ok(bundle)
    }

    /// Verifies that a prepared dataset was encoded with this bundle's schema.
    pub fn check_dataset(&self, dataset: &PreparedDataset) -> Result<(), ArtifactError> {
        if dataset.schema.fingerprint() != self.schema_fingerprint {
            return Err(ArtifactError::Mismatch(
                "prepared dataset schema differs from the model schema".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ArtifactError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Writes the prepared table as JSON Lines, one encoded row per line.
pub fn save_prepared(path: &Path, dataset: &PreparedDataset) -> Result<(), ArtifactError> {
    write_jsonl(path, &dataset.to_rows()).map_err(data_to_artifact)
}

pub fn load_prepared(path: &Path) -> Result<PreparedDataset, ArtifactError> {
    let rows = read_jsonl(path).map_err(data_to_artifact)?;
    PreparedDataset::from_rows(&rows)
}

fn data_to_artifact(e: DataError) -> ArtifactError {
    match e {
        DataError::Io(io) => ArtifactError::Io(io),
        DataError::Json(json) => ArtifactError::Json(json),
        other => ArtifactError::Mismatch(other.to_string()),
    }
}

pub fn save_labels(path: &Path, labels: &LabelMapping) -> Result<(), ArtifactError> {
    write_json(path, labels)
}

pub fn load_labels(path: &Path) -> Result<LabelMapping, ArtifactError> {
    let labels: LabelMapping = read_json(path)?;
    labels.check()?;
    Ok(labels)
}

/// File names of every pipeline stage output under one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    root: PathBuf,
}

impl ArtifactPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_people(&self) -> PathBuf {
        self.root.join("people.jsonl")
    }

    pub fn cleaned(&self) -> PathBuf {
        self.root.join("cleaned.jsonl")
    }

    pub fn reduced(&self) -> PathBuf {
        self.root.join("reduced.jsonl")
    }

    pub fn features(&self) -> PathBuf {
        self.root.join("features.jsonl")
    }

    pub fn prepared(&self) -> PathBuf {
        self.root.join("prepared.jsonl")
    }

    pub fn labels(&self) -> PathBuf {
        self.root.join("labels.json")
    }

    pub fn model(&self) -> PathBuf {
        self.root.join("model.json")
    }

    pub fn report(&self) -> PathBuf {
        self.root.join("training_report.json")
    }
}
