//! Data sources and explicit fallback chains.
//!
//! Each batch stage lists its sources in priority order. The chain asks them one by one,
//! logs every failure, and returns the first result the stage accepts.

use crate::chart::ChartOracle;
use crate::dataset::{self, PersonRecord};
use crate::encoding::PreparedDataset;
use crate::error::{DataError, DataResult};
use crate::features::{FeatureRecordBuilder, Row};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tables produced and consumed along the batch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    People,
    CleanedPeople,
    ReducedPeople,
    Features,
    Prepared,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Resource::People => "people",
            Resource::CleanedPeople => "cleaned people",
            Resource::ReducedPeople => "reduced people",
            Resource::Features => "features",
            Resource::Prepared => "prepared dataset",
        };
        f.write_str(s)
    }
}

/// Anything that can hand over a table of rows.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> String;

    async fn fetch(&self, resource: Resource) -> DataResult<Vec<Row>>;
}

// -----------------------------------------------------------------------------
// JSON Lines
// -----------------------------------------------------------------------------

/// Parses JSON Lines text; blank lines are skipped and every other line must be an object.
pub fn parse_jsonl(text: &str, source_name: &str) -> DataResult<Vec<Row>> {
    let mut rows = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line)? {
            Value::Object(row) => rows.push(row),
            _ => {
                return Err(DataError::Malformed {
                    source_name: source_name.to_string(),
                    reason: format!("line {} is not an object", i + 1),
                })
            }
        }
    }
    Ok(rows)
}

/// Blocking read for the synchronous artifact loaders.
pub fn read_jsonl(path: &Path) -> DataResult<Vec<Row>> {
    let text = std::fs::read_to_string(path)?;
    parse_jsonl(&text, &path.display().to_string())
}

pub fn write_jsonl(path: &Path, rows: &[Row]) -> DataResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(std::fs::File::create(path)?);
    for row in rows {
        serde_json::to_writer(&mut out, row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

// -----------------------------------------------------------------------------
// Sources
// -----------------------------------------------------------------------------

/// A JSON Lines snapshot on disk serving exactly one resource.
pub struct LocalFile {
    path: PathBuf,
    resource: Resource,
}

impl LocalFile {
    pub fn new(path: impl Into<PathBuf>, resource: Resource) -> Self {
        Self {
            path: path.into(),
            resource,
        }
    }
}

#[async_trait]
impl DataSource for LocalFile {
    fn name(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn fetch(&self, resource: Resource) -> DataResult<Vec<Row>> {
        if resource != self.resource {
            return Err(DataError::Unavailable {
                source_name: self.name(),
                reason: format!("serves {} only", self.resource),
            });
        }
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(DataError::Unavailable {
                source_name: self.name(),
                reason: "file not found".into(),
            });
        }
        let text = tokio::fs::read_to_string(&self.path).await?;
        parse_jsonl(&text, &self.name())
    }
}

const SAMPLE_PEOPLE: &str = include_str!("../data/sample_people.jsonl");

/// Small built-in people sample; derived tables are computed from it on demand.
#[derive(Clone)]
pub struct BundledSample {
    oracle: Arc<dyn ChartOracle>,
}

impl BundledSample {
    pub fn new(oracle: Arc<dyn ChartOracle>) -> Self {
        Self { oracle }
    }

    pub fn people_rows() -> DataResult<Vec<Row>> {
        SAMPLE_PEOPLE
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| match serde_json::from_str::<Value>(l)? {
                Value::Object(row) => Ok(row),
                _ => Err(DataError::Malformed {
                    source_name: "bundled sample".into(),
                    reason: "non-object line".into(),
                }),
            })
            .collect()
    }

    fn people(&self) -> DataResult<Vec<PersonRecord>> {
        dataset::clean(Self::people_rows()?)
    }

    fn feature_rows(&self) -> DataResult<Vec<Row>> {
        let builder = FeatureRecordBuilder::new(self.oracle.clone());
        Ok(self
            .people()?
            .iter()
            .map(|p| builder.build(&p.birth_fact(), Some(p.occupation.clone())).to_row())
            .collect())
    }
}

#[async_trait]
impl DataSource for BundledSample {
    fn name(&self) -> String {
        "bundled sample".into()
    }

    async fn fetch(&self, resource: Resource) -> DataResult<Vec<Row>> {
        match resource {
            Resource::People => Self::people_rows(),
            Resource::CleanedPeople | Resource::ReducedPeople => {
                Ok(self.people()?.iter().map(PersonRecord::to_row).collect())
            }
            Resource::Features => self.feature_rows(),
            Resource::Prepared => {
                let records: Vec<_> = self
                    .feature_rows()?
                    .iter()
                    .map(crate::features::FeatureRecord::from_row)
                    .collect();
                let prepared = PreparedDataset::prepare(&records).map_err(|e| DataError::Unavailable {
                    source_name: self.name(),
                    reason: e.to_string(),
                })?;
                Ok(prepared.to_rows())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Chain
// -----------------------------------------------------------------------------

/// Ordered fallback over data sources.
#[derive(Default)]
pub struct SourceChain {
    sources: Vec<Box<dyn DataSource>>,
}

/// A table accepted from one of the chain's sources.
#[derive(Debug)]
pub struct Fetched<T> {
    pub value: T,
    pub source: String,
}

impl SourceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: impl DataSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn push(&mut self, source: Box<dyn DataSource>) {
        self.sources.push(source);
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn fetch(&self, resource: Resource) -> DataResult<Fetched<Vec<Row>>> {
        self.fetch_with(resource, Ok).await
    }

    /// Tries each source in order. An error, an empty table, or a table `accept` rejects
    /// moves on to the next source.
    pub async fn fetch_with<T, F>(&self, resource: Resource, mut accept: F) -> DataResult<Fetched<T>>
    where
        F: FnMut(Vec<Row>) -> DataResult<T> + Send,
    {
        for source in &self.sources {
            let name = source.name();
            let attempt = match source.fetch(resource).await {
                Ok(rows) if rows.is_empty() => Err(DataError::Unavailable {
                    source_name: name.clone(),
                    reason: "returned no records".into(),
                }),
                Ok(rows) => accept(rows),
                Err(e) => Err(e),
            };
            match attempt {
                Ok(value) => {
                    tracing::info!(target: "natal::data", %resource, source = %name, "data source selected");
                    return Ok(Fetched {
                        value,
                        source: name,
                    });
                }
                Err(e) => {
                    tracing::warn!(target: "natal::data", %resource, source = %name, error = %e, "data source failed; trying next");
                }
            }
        }
        Err(DataError::Exhausted(resource.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::MeanMotionOracle;

    struct Failing;

    #[async_trait]
    impl DataSource for Failing {
        fn name(&self) -> String {
            "failing".into()
        }

        async fn fetch(&self, _: Resource) -> DataResult<Vec<Row>> {
            Err(DataError::Unavailable {
                source_name: "failing".into(),
                reason: "down".into(),
            })
        }
    }

    fn sample() -> BundledSample {
        BundledSample::new(Arc::new(MeanMotionOracle))
    }

    #[tokio::test]
    async fn first_success_wins() {
        let chain = SourceChain::new().with(Failing).with(sample());
        let fetched = chain.fetch(Resource::People).await.unwrap();
        assert_eq!(fetched.source, "bundled sample");
        assert!(!fetched.value.is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_errors() {
        let chain = SourceChain::new().with(Failing);
        assert!(matches!(
            chain.fetch(Resource::Features).await,
            Err(DataError::Exhausted(_))
        ));
    }

    #[tokio::test]
    async fn rejected_table_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.jsonl");
        let junk: Row = serde_json::from_str(r#"{"unrelated": 1}"#).unwrap();
        write_jsonl(&path, &[junk]).unwrap();

        let chain = SourceChain::new()
            .with(LocalFile::new(&path, Resource::People))
            .with(sample());
        let fetched = chain
            .fetch_with(Resource::People, dataset::clean)
            .await
            .unwrap();
        assert_eq!(fetched.source, "bundled sample");
    }

    #[tokio::test]
    async fn local_file_serves_only_its_resource() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.jsonl");
        let source = LocalFile::new(&path, Resource::Features);
        assert!(source.fetch(Resource::People).await.is_err());
        assert!(source.fetch(Resource::Features).await.is_err());
    }

    #[tokio::test]
    async fn local_file_reads_rows_asynchronously() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("people.jsonl");
        tokio::fs::write(&path, "{\"name\":\"A\"}\n\n{\"name\":\"B\"}\n")
            .await
            .unwrap();

        let rows = LocalFile::new(&path, Resource::People)
            .fetch(Resource::People)
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["A", "B"]);
    }

    #[test]
    fn non_object_line_is_malformed() {
        let err = parse_jsonl("{\"a\":1}\n[1,2]\n", "inline").unwrap_err();
        assert!(matches!(err, DataError::Malformed { ref reason, .. } if reason.contains("line 2")));
    }

    #[test]
    fn bundled_people_are_clean_and_trainable() {
        let people = dataset::clean(BundledSample::people_rows().unwrap()).unwrap();
        assert!(people.len() >= 20);
        let mut counts = std::collections::HashMap::new();
        for p in &people {
            *counts.entry(p.occupation.as_str()).or_insert(0) += 1;
        }
        assert!(counts.values().all(|&n| n >= 2));
    }
}
