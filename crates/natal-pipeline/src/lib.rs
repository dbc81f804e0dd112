//! Offline batch stages of the occupation model.
//!
//! Each stage reads its input through an explicit [`SourceChain`], writes one artifact under the
//! configured data directory and reports where its input came from:
//!
//! | Stage | Input chain | Output |
//! |-------|-------------|--------|
//! | clean | remote → `people.jsonl` → bundled | `cleaned.jsonl` |
//! | reduce | `cleaned.jsonl` → remote → bundled | `reduced.jsonl` |
//! | features | `reduced.jsonl` → remote → bundled | `features.jsonl` |
//! | prepare | `features.jsonl` → remote → bundled | `prepared.jsonl`, `labels.json` |
//! | train | `prepared.jsonl` → remote → bundled | `model.json`, `training_report.json` |
//!
//! The remote database only joins a chain when `use_remote` is set.

use chrono::{DateTime, Utc};
use natal_core::artifacts::{self, ArtifactPaths};
use natal_core::{
    dataset, ArtifactError, BundledSample, ChartOracle, ClassifierTrainer, ConfigError, DataError,
    DataSource, FeatureRecord, FeatureRecordBuilder, FieldValue, LocalFile, MeanMotionOracle,
    PipelineConfig, PreparedDataset, RemoteSource, RemoteSourceConfig, Resource, Row, SourceChain,
    TrainingError, TrainingReport,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a stage read and wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutcome {
    pub stage: &'static str,
    pub source: String,
    pub records: usize,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub description: String,
    pub source: String,
}

/// Index written next to exported artifacts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

pub struct Pipeline {
    config: PipelineConfig,
    paths: ArtifactPaths,
    oracle: Arc<dyn ChartOracle>,
    remote: Option<RemoteSourceConfig>,
}

impl Pipeline {
    /// Builds the pipeline with the built-in oracle. With `use_remote` set, the remote
    /// database settings must be present in the environment.
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        Self::with_lookup(config, |key| std::env::var(key).ok())
    }

    /// Like [`Pipeline::new`], reading the remote settings through `lookup`.
    pub fn with_lookup<F>(config: PipelineConfig, lookup: F) -> Result<Self, PipelineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let remote = if config.use_remote {
            Some(RemoteSourceConfig::from_lookup(lookup)?)
        } else {
            None
        };
        Ok(Self::with_parts(config, Arc::new(MeanMotionOracle), remote))
    }

    pub fn with_parts(
        config: PipelineConfig,
        oracle: Arc<dyn ChartOracle>,
        remote: Option<RemoteSourceConfig>,
    ) -> Self {
        let paths = ArtifactPaths::new(&config.data_dir);
        Self {
            config,
            paths,
            oracle,
            remote,
        }
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    fn remote_source(&self, limit: Option<usize>) -> Result<Option<RemoteSource>, PipelineError> {
        let Some(cfg) = &self.remote else {
            return Ok(None);
        };
        let source = RemoteSource::new(cfg.clone())?;
        Ok(Some(match limit {
            Some(n) => source.with_limit(n),
            None => source,
        }))
    }

    /// Input chain of a stage. Raw people prefer the remote database; every later table
    /// prefers the local snapshot.
    fn chain(
        &self,
        resource: Resource,
        local: PathBuf,
        limit: Option<usize>,
    ) -> Result<SourceChain, PipelineError> {
        let mut chain = SourceChain::new();
        let local = Box::new(LocalFile::new(local, resource));
        let remote = self.remote_source(limit)?;
        if resource == Resource::People {
            if let Some(r) = remote {
                chain.push(Box::new(r));
            }
            chain.push(local);
        } else {
            chain.push(local);
            if let Some(r) = remote {
                chain.push(Box::new(r));
            }
        }
        chain.push(Box::new(BundledSample::new(self.oracle.clone())));
        tracing::debug!(target: "natal::pipeline", %resource, sources = ?chain.source_names(), "source chain");
        Ok(chain)
    }

    fn outcome(stage: &'static str, source: String, records: usize, output: PathBuf) -> StageOutcome {
        tracing::info!(
            target: "natal::pipeline",
            stage,
            source = %source,
            records,
            output = %output.display(),
            "stage complete"
        );
        StageOutcome {
            stage,
            source,
            records,
            output,
        }
    }

    pub async fn clean(&self) -> Result<StageOutcome, PipelineError> {
        let chain = self.chain(Resource::People, self.paths.raw_people(), None)?;
        let fetched = chain.fetch_with(Resource::People, dataset::clean).await?;

        let rows: Vec<Row> = fetched.value.iter().map(|p| p.to_row()).collect();
        let output = self.paths.cleaned();
        natal_core::sources::write_jsonl(&output, &rows)?;
        Ok(Self::outcome("clean", fetched.source, rows.len(), output))
    }

    pub async fn reduce(&self) -> Result<StageOutcome, PipelineError> {
        let limit = self.config.max_records;
        let chain = self.chain(Resource::CleanedPeople, self.paths.cleaned(), Some(limit))?;
        let fetched = chain.fetch_with(Resource::CleanedPeople, dataset::clean).await?;

        let reduced = dataset::reduce(fetched.value, limit);
        let rows: Vec<Row> = reduced.iter().map(|p| p.to_row()).collect();
        let output = self.paths.reduced();
        natal_core::sources::write_jsonl(&output, &rows)?;
        Ok(Self::outcome("reduce", fetched.source, rows.len(), output))
    }

    pub async fn features(&self) -> Result<StageOutcome, PipelineError> {
        let chain = self.chain(Resource::ReducedPeople, self.paths.reduced(), None)?;
        let fetched = chain.fetch_with(Resource::ReducedPeople, dataset::clean).await?;

        let builder = FeatureRecordBuilder::new(self.oracle.clone());
        let facts: Vec<_> = fetched
            .value
            .iter()
            .map(|p| (p.birth_fact(), p.occupation.clone()))
            .collect();
        let records = builder.build_batch(facts.iter().map(|(f, o)| (f, Some(o.clone()))));
        let degraded = records
            .iter()
            .filter(|r| matches!(r.get("sun_sign"), Some(FieldValue::Missing)))
            .count();
        if degraded > 0 {
            tracing::warn!(target: "natal::pipeline", degraded, "records without a resolved chart");
        }

        let rows: Vec<Row> = records.iter().map(FeatureRecord::to_row).collect();
        let output = self.paths.features();
        natal_core::sources::write_jsonl(&output, &rows)?;
        Ok(Self::outcome("features", fetched.source, rows.len(), output))
    }

    pub async fn prepare(&self) -> Result<StageOutcome, PipelineError> {
        let chain = self.chain(Resource::Features, self.paths.features(), None)?;
        let fetched = chain
            .fetch_with(Resource::Features, |rows| {
                let records: Vec<FeatureRecord> = rows.iter().map(FeatureRecord::from_row).collect();
                PreparedDataset::prepare(&records).map_err(|e| DataError::Malformed {
                    source_name: Resource::Features.to_string(),
                    reason: e.to_string(),
                })
            })
            .await?;

        let data = fetched.value;
        let output = self.paths.prepared();
        artifacts::save_prepared(&output, &data)?;
        artifacts::save_labels(&self.paths.labels(), &data.labels)?;
        tracing::info!(
            target: "natal::pipeline",
            columns = data.schema.width(),
            labels = data.labels.len(),
            "training matrix encoded"
        );
        Ok(Self::outcome("prepare", fetched.source, data.rows.len(), output))
    }

    pub async fn train(&self) -> Result<(StageOutcome, TrainingReport), PipelineError> {
        let local = self.paths.prepared();
        let chain = self.chain(Resource::Prepared, local.clone(), None)?;
        let fetched = chain
            .fetch_with(Resource::Prepared, |rows| {
                PreparedDataset::from_rows(&rows).map_err(|e| DataError::Malformed {
                    source_name: Resource::Prepared.to_string(),
                    reason: e.to_string(),
                })
            })
            .await?;
        let data = fetched.value;

        // The service needs the exact table the model was fit on.
        if fetched.source != LocalFile::new(&local, Resource::Prepared).name() {
            artifacts::save_prepared(&local, &data)?;
        }

        let trainer = ClassifierTrainer::new(self.config.trainer.clone());
        let (bundle, report) = trainer.train(&data)?;

        let output = self.paths.model();
        bundle.save(&output)?;
        artifacts::save_labels(&self.paths.labels(), &bundle.labels)?;
        std::fs::write(self.paths.report(), serde_json::to_string_pretty(&report)?)?;

        Ok((
            Self::outcome("train", fetched.source, data.rows.len(), output),
            report,
        ))
    }

    /// Every stage in order.
    pub async fn run(&self) -> Result<(Vec<StageOutcome>, TrainingReport), PipelineError> {
        let mut outcomes = vec![
            self.clean().await?,
            self.reduce().await?,
            self.features().await?,
            self.prepare().await?,
        ];
        let (trained, report) = self.train().await?;
        outcomes.push(trained);
        Ok((outcomes, report))
    }

    /// Copies existing artifacts into `dest` and writes `manifest.json` there.
    pub fn export(&self, dest: &Path) -> Result<Manifest, PipelineError> {
        std::fs::create_dir_all(dest)?;
        let listed = [
            (self.paths.cleaned(), "Cleaned person records"),
            (self.paths.reduced(), "Reduced person sample used for feature extraction"),
            (self.paths.features(), "Chart-derived feature records"),
            (self.paths.prepared(), "Encoded training matrix"),
            (self.paths.labels(), "Ordered occupation labels"),
            (self.paths.model(), "Model bundle with encoding schema"),
            (self.paths.report(), "Holdout evaluation report"),
        ];

        let mut files = Vec::new();
        for (path, description) in listed {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if !path.exists() {
                tracing::warn!(target: "natal::pipeline", file = %filename, "artifact missing; not exported");
                continue;
            }
            std::fs::copy(&path, dest.join(&filename))?;
            files.push(ManifestEntry {
                filename,
                description: description.to_string(),
                source: path.display().to_string(),
            });
        }

        let manifest = Manifest {
            generated_at: Utc::now(),
            files,
        };
        std::fs::write(dest.join("manifest.json"), serde_json::to_string_pretty(&manifest)?)?;
        tracing::info!(
            target: "natal::pipeline",
            dest = %dest.display(),
            files = manifest.files.len(),
            "artifacts exported"
        );
        Ok(manifest)
    }
}
