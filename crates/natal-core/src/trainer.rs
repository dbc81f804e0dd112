//! Classifier training: rare-class filtering, stratified holdout, forest fit and evaluation.

use crate::artifacts::ModelBundle;
use crate::encoding::PreparedDataset;
use crate::error::TrainingError;
use crate::forest::{ForestParams, RandomForest};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_test_ratio() -> f64 {
    0.2
}

fn default_split_seed() -> u64 {
    42
}

fn default_min_class_size() -> usize {
    2
}

/// Trainer settings. Defaults: 20% holdout, seed 42, classes need at least two members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    #[serde(default = "default_test_ratio")]
    pub test_ratio: f64,
    #[serde(default = "default_split_seed")]
    pub seed: u64,
    #[serde(default = "default_min_class_size")]
    pub min_class_size: usize,
    #[serde(default)]
    pub forest: ForestParams,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            test_ratio: default_test_ratio(),
            seed: default_split_seed(),
            min_class_size: default_min_class_size(),
            forest: ForestParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub label: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Held-out evaluation of a freshly trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub n_train: usize,
    pub n_test: usize,
    /// Occupations excluded for having fewer than the minimum number of members.
    pub dropped_classes: Vec<String>,
    /// `None` when the holdout split came out empty.
    pub accuracy: Option<f64>,
    /// Only labels present in the held-out split, in label order.
    pub per_class: Vec<ClassMetrics>,
}

impl TrainingReport {
    pub fn macro_f1(&self) -> Option<f64> {
        (!self.per_class.is_empty())
            .then(|| self.per_class.iter().map(|c| c.f1).sum::<f64>() / self.per_class.len() as f64)
    }
}

impl fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "train samples: {}  test samples: {}", self.n_train, self.n_test)?;
        if !self.dropped_classes.is_empty() {
            writeln!(f, "dropped classes: {}", self.dropped_classes.join(", "))?;
        }
        match self.accuracy {
            Some(acc) => writeln!(f, "accuracy: {:.4}", acc)?,
            None => writeln!(f, "accuracy: n/a (empty holdout)")?,
        }
        if self.per_class.is_empty() {
            return Ok(());
        }
        let width = self
            .per_class
            .iter()
            .map(|c| c.label.len())
            .max()
            .unwrap_or(0)
            .max(12);
        writeln!(
            f,
            "{:<width$} {:>9} {:>9} {:>9} {:>7}",
            "label", "precision", "recall", "f1", "support"
        )?;
        for c in &self.per_class {
            writeln!(
                f,
                "{:<width$} {:>9.2} {:>9.2} {:>9.2} {:>7}",
                c.label, c.precision, c.recall, c.f1, c.support
            )?;
        }
        if let Some(m) = self.macro_f1() {
            writeln!(f, "{:<width$} {:>29.2}", "macro f1", m)?;
        }
        Ok(())
    }
}

/// Trains and evaluates a forest on a prepared dataset.
#[derive(Debug, Clone, Default)]
pub struct ClassifierTrainer {
    config: TrainerConfig,
}

impl ClassifierTrainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Returns the model bound to the dataset's schema and labels, plus the holdout report.
    pub fn train(
        &self,
        dataset: &PreparedDataset,
    ) -> Result<(ModelBundle, TrainingReport), TrainingError> {
        let n_classes = dataset.labels.len();
        let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); n_classes];
        for (i, row) in dataset.rows.iter().enumerate() {
            let members = by_class.get_mut(row.class).ok_or_else(|| {
                TrainingError::Inconsistent(format!("row {i} has unknown class {}", row.class))
            })?;
            members.push(i);
        }

        let mut dropped_classes = Vec::new();
        for (class, members) in by_class.iter_mut().enumerate() {
            if !members.is_empty() && members.len() < self.config.min_class_size {
                if let Some(label) = dataset.labels.decode(class) {
                    dropped_classes.push(label.to_string());
                }
                members.clear();
            }
        }
        if !dropped_classes.is_empty() {
            tracing::warn!(
                target: "natal::trainer",
                count = dropped_classes.len(),
                classes = %dropped_classes.join(", "),
                "classes below minimum size excluded from training"
            );
        }

        let retained = by_class.iter().filter(|m| !m.is_empty()).count();
        if retained < 2 {
            return Err(TrainingError::InsufficientData(format!(
                "{retained} class(es) left after filtering; need at least 2"
            )));
        }

        let (train_idx, test_idx) = self.stratified_split(&by_class);
        let x_train: Vec<Vec<f64>> = train_idx
            .iter()
            .map(|&i| dataset.rows[i].features.clone())
            .collect();
        let y_train: Vec<usize> = train_idx.iter().map(|&i| dataset.rows[i].class).collect();

        tracing::info!(
            target: "natal::trainer",
            train = train_idx.len(),
            test = test_idx.len(),
            classes = retained,
            trees = self.config.forest.n_trees,
            "training forest"
        );
        let forest = RandomForest::fit(&x_train, &y_train, n_classes, &self.config.forest)?;

        let predicted: Vec<(usize, usize)> = test_idx
            .iter()
            .map(|&i| {
                let row = &dataset.rows[i];
                (row.class, forest.predict(&row.features))
            })
            .collect();
        let report = TrainingReport {
            n_train: train_idx.len(),
            n_test: test_idx.len(),
            dropped_classes,
            accuracy: accuracy(&predicted),
            per_class: per_class_metrics(&predicted, dataset),
        };
        if let Some(acc) = report.accuracy {
            tracing::info!(target: "natal::trainer", accuracy = acc, "holdout evaluation complete");
        } else {
            tracing::warn!(target: "natal::trainer", "holdout split is empty; no evaluation");
        }

        let bundle = ModelBundle::new(dataset.schema.clone(), dataset.labels.clone(), forest)
            .map_err(|e| TrainingError::Inconsistent(e.to_string()))?;
        Ok((bundle, report))
    }

    /// Per-class holdout: each class contributes `round(n * ratio)` rows to the test split,
    /// always leaving at least one row for training.
    fn stratified_split(&self, by_class: &[Vec<usize>]) -> (Vec<usize>, Vec<usize>) {
        let mut rng = ChaCha20Rng::seed_from_u64(self.config.seed);
        let mut train = Vec::new();
        let mut test = Vec::new();
        for members in by_class.iter().filter(|m| !m.is_empty()) {
            let mut shuffled = members.clone();
            shuffled.shuffle(&mut rng);
            let n_test = ((shuffled.len() as f64 * self.config.test_ratio) + 0.5).floor() as usize;
            let n_test = n_test.min(shuffled.len() - 1);
            test.extend_from_slice(&shuffled[..n_test]);
            train.extend_from_slice(&shuffled[n_test..]);
        }
        train.sort_unstable();
        test.sort_unstable();
        (train, test)
    }
}

fn accuracy(predicted: &[(usize, usize)]) -> Option<f64> {
    if predicted.is_empty() {
        return None;
    }
    let hits = predicted.iter().filter(|(t, p)| t == p).count();
    Some(hits as f64 / predicted.len() as f64)
}

fn per_class_metrics(predicted: &[(usize, usize)], dataset: &PreparedDataset) -> Vec<ClassMetrics> {
    let mut present: Vec<usize> = predicted.iter().map(|(t, _)| *t).collect();
    present.sort_unstable();
    present.dedup();

    present
        .into_iter()
        .map(|class| {
            let tp = predicted.iter().filter(|(t, p)| *t == class && *p == class).count();
            let predicted_pos = predicted.iter().filter(|(_, p)| *p == class).count();
            let support = predicted.iter().filter(|(t, _)| *t == class).count();
            let precision = ratio(tp, predicted_pos);
            let recall = ratio(tp, support);
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                label: dataset.labels.decode(class).unwrap_or_default().to_string(),
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect()
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{EncodingSchema, LabelMapping, PreparedRow};
    use crate::features::{FeatureRecord, FieldValue};

    fn dataset(sizes: &[(&str, usize)]) -> PreparedDataset {
        let mut records = Vec::new();
        for (label, n) in sizes {
            for i in 0..*n {
                let mut r = FeatureRecord::empty(Some(format!("{label}{i}")), Some(label.to_string()));
                let offset = (label.len() * 10) as f64;
                r.set("sun_degree", FieldValue::Number(offset + i as f64));
                records.push(r);
            }
        }
        PreparedDataset::prepare(&records).unwrap()
    }

    #[test]
    fn split_is_stratified_and_keeps_a_training_row() {
        let data = dataset(&[("Actor", 10), ("Banker", 5), ("Chef", 2)]);
        let trainer = ClassifierTrainer::default();
        let (train, test) = trainer.stratified_split(&[
            (0..10).collect(),
            (10..15).collect(),
            (15..17).collect(),
        ]);
        assert_eq!(data.rows.len(), 17);
        assert_eq!(test.len(), 2 + 1);
        assert_eq!(train.len() + test.len(), 17);
        assert!(train.contains(&15) || train.contains(&16));
    }

    #[test]
    fn singleton_classes_are_reported_as_dropped() {
        let data = dataset(&[("Actor", 6), ("Banker", 6), ("Cartographer", 1)]);
        let (bundle, report) = ClassifierTrainer::default().train(&data).unwrap();
        assert_eq!(report.dropped_classes, vec!["Cartographer".to_string()]);
        assert_eq!(report.n_train + report.n_test, 12);
        assert_eq!(bundle.labels.len(), 3);
        assert!(report.per_class.iter().all(|c| c.label != "Cartographer"));
    }

    #[test]
    fn one_class_is_not_enough() {
        let data = dataset(&[("Actor", 5), ("Banker", 1)]);
        assert!(matches!(
            ClassifierTrainer::default().train(&data),
            Err(TrainingError::InsufficientData(_))
        ));
    }

    #[test]
    fn unknown_class_index_is_rejected() {
        let (_, schema) = EncodingSchema::fit(&[FeatureRecord::empty(None, Some("A".into()))]);
        let data = PreparedDataset {
            schema,
            labels: LabelMapping::fit(["A"]),
            rows: vec![PreparedRow {
                name: "x".into(),
                occupation: "B".into(),
                class: 4,
                features: vec![],
            }],
        };
        assert!(matches!(
            ClassifierTrainer::default().train(&data),
            Err(TrainingError::Inconsistent(_))
        ));
    }

    #[test]
    fn report_renders_table() {
        let report = TrainingReport {
            n_train: 8,
            n_test: 2,
            dropped_classes: vec![],
            accuracy: Some(0.5),
            per_class: vec![ClassMetrics {
                label: "Poet".into(),
                precision: 1.0,
                recall: 0.5,
                f1: 2.0 / 3.0,
                support: 2,
            }],
        };
        let text = report.to_string();
        assert!(text.contains("accuracy: 0.5000"));
        assert!(text.contains("Poet"));
    }
}
