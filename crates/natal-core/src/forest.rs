//! Random forest classifier: bootstrap-aggregated CART trees with Gini impurity.
//!
//! Class weights are balanced over the training labels (`n / (k * n_c)`), every tree draws a
//! bootstrap sample and considers `sqrt(d)` random features per split, and `predict_proba`
//! averages the normalized leaf distributions. Feature importances are the mean decrease in
//! impurity, normalized per tree and then averaged.

use crate::error::TrainingError;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

fn default_n_trees() -> usize {
    100
}

fn default_min_samples_split() -> usize {
    2
}

fn default_min_samples_leaf() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

fn default_true() -> bool {
    true
}

/// Forest hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForestParams {
    #[serde(default = "default_n_trees")]
    pub n_trees: usize,
    /// Unlimited when `None`.
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,
    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub balanced_class_weight: bool,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: default_n_trees(),
            max_depth: None,
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            seed: default_seed(),
            balanced_class_weight: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Node {
    Leaf {
        distribution: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Children must point forward into the node list, which also rules out cycles.
    fn check(&self, n_features: usize, n_classes: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Leaf { distribution } if distribution.len() != n_classes => {
                    return Err(format!(
                        "leaf {idx} has {} classes, expected {n_classes}",
                        distribution.len()
                    ));
                }
                Node::Leaf { .. } => {}
                Node::Split {
                    feature,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(format!("node {idx} splits on feature {feature} of {n_features}"));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(format!("node {idx} points to invalid child {child}"));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn leaf_distribution(&self, row: &[f64]) -> &[f64] {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { distribution } => return distribution,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

/// A fitted forest. Immutable once trained; safe to share across threads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForest {
    n_features: usize,
    n_classes: usize,
    trees: Vec<DecisionTree>,
    importances: Vec<f64>,
}

impl RandomForest {
    /// Trains on `x` (one row per sample) and dense class indices `y` in `0..n_classes`.
    pub fn fit(
        x: &[Vec<f64>],
        y: &[usize],
        n_classes: usize,
        params: &ForestParams,
    ) -> Result<Self, TrainingError> {
        if x.is_empty() {
            return Err(TrainingError::InsufficientData("empty training matrix".into()));
        }
        if x.len() != y.len() {
            return Err(TrainingError::Inconsistent(format!(
                "{} rows but {} labels",
                x.len(),
                y.len()
            )));
        }
        let n_features = x[0].len();
        if let Some(bad) = x.iter().position(|r| r.len() != n_features) {
            return Err(TrainingError::Inconsistent(format!(
                "row {bad} has {} features, expected {n_features}",
                x[bad].len()
            )));
        }
        if let Some(&bad) = y.iter().find(|&&c| c >= n_classes) {
            return Err(TrainingError::Inconsistent(format!(
                "class {bad} outside 0..{n_classes}"
            )));
        }
        if params.n_trees == 0 {
            return Err(TrainingError::Inconsistent("n_trees must be positive".into()));
        }

        let class_weight = class_weights(y, n_classes, params.balanced_class_weight);
        let max_features = ((n_features as f64).sqrt() as usize).max(1);
        let mut master = ChaCha20Rng::seed_from_u64(params.seed);

        let mut trees = Vec::with_capacity(params.n_trees);
        let mut importances = vec![0.0; n_features];
        for _ in 0..params.n_trees {
            let mut rng = ChaCha20Rng::seed_from_u64(master.next_u64());

            let mut counts = vec![0u32; x.len()];
            for _ in 0..x.len() {
                counts[rng.gen_range(0..x.len())] += 1;
            }
            let mut weights = vec![0.0; x.len()];
            let mut samples = Vec::new();
            for (i, &c) in counts.iter().enumerate() {
                if c > 0 {
                    weights[i] = f64::from(c) * class_weight[y[i]];
                    samples.push(i);
                }
            }

            let mut grower = TreeGrower {
                x,
                y,
                weights: &weights,
                n_classes,
                max_features,
                params,
                rng,
                nodes: Vec::new(),
                importances: vec![0.0; n_features],
                root_weight: samples.iter().map(|&i| weights[i]).sum(),
            };
            grower.grow(samples, 0);

            let total: f64 = grower.importances.iter().sum();
            if total > 0.0 {
                for (acc, v) in importances.iter_mut().zip(&grower.importances) {
                    *acc += v / total;
                }
            }
            trees.push(DecisionTree {
                nodes: grower.nodes,
            });
        }

        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }

        tracing::debug!(
            target: "natal::forest",
            trees = trees.len(),
            n_features,
            n_classes,
            "forest trained"
        );

        Ok(Self {
            n_features,
            n_classes,
            trees,
            importances,
        })
    }

    /// Class probabilities for one row, averaged over the trees.
    pub fn predict_proba(&self, row: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.n_classes];
        for tree in &self.trees {
            for (acc, p) in out.iter_mut().zip(tree.leaf_distribution(row)) {
                *acc += p;
            }
        }
        let n = self.trees.len().max(1) as f64;
        out.iter_mut().for_each(|v| *v /= n);
        out
    }

    /// Most probable class; ties go to the lower index.
    pub fn predict(&self, row: &[f64]) -> usize {
        argmax(&self.predict_proba(row))
    }

    /// Normalized mean-decrease-impurity importance per feature.
    pub fn feature_importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Structural check for forests read from disk.
    pub fn check(&self) -> Result<(), String> {
        if self.importances.len() != self.n_features {
            return Err(format!(
                "{} importances for {} features",
                self.importances.len(),
                self.n_features
            ));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.check(self.n_features, self.n_classes)
                .map_err(|e| format!("tree {i}: {e}"))?;
        }
        Ok(())
    }
}

pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

fn class_weights(y: &[usize], n_classes: usize, balanced: bool) -> Vec<f64> {
    if !balanced {
        return vec![1.0; n_classes];
    }
    let mut counts = vec![0usize; n_classes];
    for &c in y {
        counts[c] += 1;
    }
    let present = counts.iter().filter(|&&c| c > 0).count().max(1);
    counts
        .iter()
        .map(|&c| {
            if c == 0 {
                0.0
            } else {
                y.len() as f64 / (present as f64 * c as f64)
            }
        })
        .collect()
}

fn gini(dist: &[f64], total: f64) -> f64 {
    if total <= 0.0 {
        return 0.0;
    }
    1.0 - dist.iter().map(|w| (w / total).powi(2)).sum::<f64>()
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    /// Weighted child impurity: `w_l * g_l + w_r * g_r`.
    child_impurity: f64,
}

struct TreeGrower<'a> {
    x: &'a [Vec<f64>],
    y: &'a [usize],
    weights: &'a [f64],
    n_classes: usize,
    max_features: usize,
    params: &'a ForestParams,
    rng: ChaCha20Rng,
    nodes: Vec<Node>,
    importances: Vec<f64>,
    root_weight: f64,
}

impl TreeGrower<'_> {
    fn distribution(&self, samples: &[usize]) -> (Vec<f64>, f64) {
        let mut dist = vec![0.0; self.n_classes];
        for &i in samples {
            dist[self.y[i]] += self.weights[i];
        }
        let total = dist.iter().sum();
        (dist, total)
    }

    fn push_leaf(&mut self, mut dist: Vec<f64>, total: f64) -> usize {
        if total > 0.0 {
            dist.iter_mut().for_each(|v| *v /= total);
        }
        self.nodes.push(Node::Leaf { distribution: dist });
        self.nodes.len() - 1
    }

    fn grow(&mut self, samples: Vec<usize>, depth: usize) -> usize {
        let (dist, total) = self.distribution(&samples);
        let impurity = gini(&dist, total);
        let depth_reached = self.params.max_depth.is_some_and(|d| depth >= d);
        if depth_reached
            || samples.len() < self.params.min_samples_split.max(2)
            || impurity <= f64::EPSILON
        {
            return self.push_leaf(dist, total);
        }

        let Some(best) = self.best_split(&samples) else {
            return self.push_leaf(dist, total);
        };

        let (left, right): (Vec<usize>, Vec<usize>) = samples
            .iter()
            .partition(|&&i| self.x[i][best.feature] <= best.threshold);

        if self.root_weight > 0.0 {
            self.importances[best.feature] +=
                (total * impurity - best.child_impurity) / self.root_weight;
        }

        let idx = self.nodes.len();
        self.nodes.push(Node::Leaf {
            distribution: Vec::new(),
        });
        let left_idx = self.grow(left, depth + 1);
        let right_idx = self.grow(right, depth + 1);
        self.nodes[idx] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: left_idx,
            right: right_idx,
        };
        idx
    }

    /// Scans random features until `max_features` have been visited and a valid split
    /// exists, or the features run out.
    fn best_split(&mut self, samples: &[usize]) -> Option<BestSplit> {
        let n_features = self.x[samples[0]].len();
        let mut features: Vec<usize> = (0..n_features).collect();
        features.shuffle(&mut self.rng);

        let min_leaf = self.params.min_samples_leaf.max(1);
        let mut best: Option<BestSplit> = None;
        let mut order: Vec<(f64, usize)> = Vec::with_capacity(samples.len());

        for (visited, &f) in features.iter().enumerate() {
            if visited >= self.max_features && best.is_some() {
                break;
            }
            order.clear();
            order.extend(samples.iter().map(|&i| (self.x[i][f], i)));
            order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            if order[0].0 == order[order.len() - 1].0 {
                continue;
            }

            let (right_total_dist, total) = self.distribution(samples);
            let mut right_dist = right_total_dist;
            let mut left_dist = vec![0.0; self.n_classes];
            let mut left_w = 0.0;

            for k in 0..order.len() - 1 {
                let (v, i) = order[k];
                let w = self.weights[i];
                left_dist[self.y[i]] += w;
                right_dist[self.y[i]] -= w;
                left_w += w;

                let next = order[k + 1].0;
                if next <= v {
                    continue;
                }
                let n_left = k + 1;
                if n_left < min_leaf || order.len() - n_left < min_leaf {
                    continue;
                }
                let right_w = total - left_w;
                let child = left_w * gini(&left_dist, left_w) + right_w * gini(&right_dist, right_w);
                if best.as_ref().map_or(true, |b| child < b.child_impurity - 1e-12) {
                    let mut threshold = (v + next) / 2.0;
                    if threshold >= next {
                        threshold = v;
                    }
                    best = Some(BestSplit {
                        feature: f,
                        threshold,
                        child_impurity: child,
                    });
                }
            }
        }
        best
    }
}
