//! Decision tree trainer
//!
//! Leaves hold per-class score distributions (classification) or a single
//! mean value (regression), so downstream conversion to tensor form has the
//! class scores it needs.

use crate::error::{CipherMlError, Result};
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Impurity criterion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Criterion {
    /// Gini impurity (classification)
    Gini,
    /// Entropy (classification)
    Entropy,
    /// Mean squared error (regression)
    Mse,
}

/// Decision tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    /// Leaf with per-output scores
    Leaf { scores: Vec<f64>, n_samples: usize },
    /// Internal split on `feature_idx <= threshold`
    Split {
        feature_idx: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        n_samples: usize,
    },
}

impl TreeNode {
    fn depth(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    fn count_leaves(&self) -> usize {
        match self {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => left.count_leaves() + right.count_leaves(),
        }
    }
}

/// Decision tree model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    root: Option<TreeNode>,
    /// Maximum depth
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    /// Impurity criterion
    pub criterion: Criterion,
    declared_classes: Option<usize>,
    n_features: usize,
    n_outputs: usize,
    is_classification: bool,
}

impl Default for DecisionTree {
    fn default() -> Self {
        Self::new_classifier()
    }
}

impl DecisionTree {
    /// Create a new classifier tree
    pub fn new_classifier() -> Self {
        Self {
            root: None,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            criterion: Criterion::Gini,
            declared_classes: None,
            n_features: 0,
            n_outputs: 0,
            is_classification: true,
        }
    }

    /// Create a new regressor tree
    pub fn new_regressor() -> Self {
        Self {
            root: None,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            criterion: Criterion::Mse,
            declared_classes: None,
            n_features: 0,
            n_outputs: 1,
            is_classification: false,
        }
    }

    /// Set maximum depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Set minimum samples to split
    pub fn with_min_samples_split(mut self, min_samples: usize) -> Self {
        self.min_samples_split = min_samples;
        self
    }

    /// Set minimum samples in leaf
    pub fn with_min_samples_leaf(mut self, min_samples: usize) -> Self {
        self.min_samples_leaf = min_samples;
        self
    }

    /// Set criterion
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = criterion;
        self
    }

    /// Declare the class count up front (ensemble members trained on
    /// bootstrap samples may not observe every class)
    pub fn with_n_classes(mut self, n_classes: usize) -> Self {
        self.declared_classes = Some(n_classes);
        self
    }

    /// Fit the tree. Classification targets must be ordinals `0..k-1`.
    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<&mut Self> {
        let n_samples = x.nrows();
        if n_samples != y.len() {
            return Err(CipherMlError::Shape {
                expected: format!("y length = {}", n_samples),
                actual: format!("y length = {}", y.len()),
            });
        }
        if n_samples == 0 {
            return Err(CipherMlError::Validation(
                "cannot fit on an empty dataset".to_string(),
            ));
        }

        self.n_features = x.ncols();
        if self.is_classification {
            let observed = y.iter().copied().fold(0.0f64, f64::max) as usize + 1;
            for &label in y.iter() {
                if label < 0.0 || (label - label.round()).abs() > 1e-9 {
                    return Err(CipherMlError::Validation(format!(
                        "classification target {} is not a zero-based ordinal",
                        label
                    )));
                }
            }
            self.n_outputs = self.declared_classes.unwrap_or(observed).max(observed);
        }

        let indices: Vec<usize> = (0..n_samples).collect();
        self.root = Some(self.build_node(x, y, &indices, 0));
        Ok(self)
    }

    fn build_node(&self, x: &Array2<f64>, y: &Array1<f64>, indices: &[usize], depth: usize) -> TreeNode {
        let targets: Vec<f64> = indices.iter().map(|&i| y[i]).collect();
        let should_stop = indices.len() < self.min_samples_split
            || self.max_depth.is_some_and(|d| depth >= d)
            || is_pure(&targets);

        if should_stop {
            return self.leaf(&targets);
        }

        let Some((feature_idx, threshold)) = self.find_best_split(x, y, indices) else {
            return self.leaf(&targets);
        };

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
            .iter()
            .partition(|&&i| x[[i, feature_idx]] <= threshold);

        if left_indices.len() < self.min_samples_leaf || right_indices.len() < self.min_samples_leaf {
            return self.leaf(&targets);
        }

        let left = Box::new(self.build_node(x, y, &left_indices, depth + 1));
        let right = Box::new(self.build_node(x, y, &right_indices, depth + 1));
        TreeNode::Split {
            feature_idx,
            threshold,
            left,
            right,
            n_samples: indices.len(),
        }
    }

    fn leaf(&self, targets: &[f64]) -> TreeNode {
        let scores = if self.is_classification {
            let mut counts = vec![0.0f64; self.n_outputs];
            for &t in targets {
                counts[t as usize] += 1.0;
            }
            let n = targets.len() as f64;
            counts.iter_mut().for_each(|c| *c /= n);
            counts
        } else {
            let mean = targets.iter().sum::<f64>() / targets.len() as f64;
            vec![mean]
        };
        TreeNode::Leaf {
            scores,
            n_samples: targets.len(),
        }
    }

    /// Best split across features: each feature scanned independently with
    /// prefix statistics over its sorted values, candidates taken at
    /// midpoints between distinct consecutive values.
    fn find_best_split(&self, x: &Array2<f64>, y: &Array1<f64>, indices: &[usize]) -> Option<(usize, f64)> {
        let parent_impurity = self.impurity(&indices.iter().map(|&i| y[i]).collect::<Vec<_>>());

        let candidates: Vec<Option<(usize, f64, f64)>> = (0..self.n_features)
            .into_par_iter()
            .map(|feature_idx| {
                let mut pairs: Vec<(f64, f64)> = indices
                    .iter()
                    .map(|&i| (x[[i, feature_idx]], y[i]))
                    .collect();
                pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

                let n = pairs.len();
                let mut best: Option<(f64, f64)> = None;

                let mut left_counts = vec![0usize; self.n_outputs.max(1)];
                let mut left_sum = 0.0;
                let mut left_sq_sum = 0.0;
                let mut right_counts = vec![0usize; self.n_outputs.max(1)];
                let mut right_sum = 0.0;
                let mut right_sq_sum = 0.0;
                for &(_, t) in &pairs {
                    if self.is_classification {
                        right_counts[t as usize] += 1;
                    }
                    right_sum += t;
                    right_sq_sum += t * t;
                }

                for split in 1..n {
                    let (_, t) = pairs[split - 1];
                    if self.is_classification {
                        left_counts[t as usize] += 1;
                        right_counts[t as usize] -= 1;
                    }
                    left_sum += t;
                    left_sq_sum += t * t;
                    right_sum -= t;
                    right_sq_sum -= t * t;

                    if pairs[split].0 == pairs[split - 1].0 {
                        continue;
                    }
                    if split < self.min_samples_leaf || n - split < self.min_samples_leaf {
                        continue;
                    }

                    let left_impurity =
                        self.impurity_from_stats(split, left_sum, left_sq_sum, &left_counts);
                    let right_impurity =
                        self.impurity_from_stats(n - split, right_sum, right_sq_sum, &right_counts);
                    let weighted = (split as f64 * left_impurity
                        + (n - split) as f64 * right_impurity)
                        / n as f64;
                    let gain = parent_impurity - weighted;

                    if gain > 1e-12 && best.map_or(true, |(g, _)| gain > g) {
                        let threshold = (pairs[split - 1].0 + pairs[split].0) / 2.0;
                        best = Some((gain, threshold));
                    }
                }

                best.map(|(gain, threshold)| (feature_idx, threshold, gain))
            })
            .collect();

        // first feature wins ties, keeping the split deterministic
        candidates
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<(usize, f64, f64)>, cand| match acc {
                Some(best) if best.2 >= cand.2 => Some(best),
                _ => Some(cand),
            })
            .map(|(feature_idx, threshold, _)| (feature_idx, threshold))
    }

    fn impurity_from_stats(&self, count: usize, sum: f64, sq_sum: f64, counts: &[usize]) -> f64 {
        if count == 0 {
            return 0.0;
        }
        let n = count as f64;
        match self.criterion {
            Criterion::Gini => {
                1.0 - counts
                    .iter()
                    .map(|&c| {
                        let p = c as f64 / n;
                        p * p
                    })
                    .sum::<f64>()
            }
            Criterion::Entropy => -counts
                .iter()
                .filter(|&&c| c > 0)
                .map(|&c| {
                    let p = c as f64 / n;
                    p * p.ln()
                })
                .sum::<f64>(),
            Criterion::Mse => sq_sum / n - (sum / n).powi(2),
        }
    }

    fn impurity(&self, targets: &[f64]) -> f64 {
        let mut counts = vec![0usize; self.n_outputs.max(1)];
        if self.is_classification {
            for &t in targets {
                counts[t as usize] += 1;
            }
        }
        let sum: f64 = targets.iter().sum();
        let sq_sum: f64 = targets.iter().map(|t| t * t).sum();
        self.impurity_from_stats(targets.len(), sum, sq_sum, &counts)
    }

    /// Predict class ordinals (classification) or values (regression)
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let proba = self.predict_scores(x)?;
        let predictions = if self.is_classification {
            proba
                .rows()
                .into_iter()
                .map(|row| {
                    row.iter()
                        .enumerate()
                        .fold((0usize, f64::NEG_INFINITY), |best, (i, &v)| {
                            if v > best.1 {
                                (i, v)
                            } else {
                                best
                            }
                        })
                        .0 as f64
                })
                .collect()
        } else {
            proba.column(0).to_vec()
        };
        Ok(Array1::from_vec(predictions))
    }

    /// Per-sample leaf scores: class distributions or single-column values
    pub fn predict_scores(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let root = self.root.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        let mut out = Array2::zeros((x.nrows(), self.n_outputs.max(1)));
        for (i, sample) in x.outer_iter().enumerate() {
            let mut node = root;
            loop {
                match node {
                    TreeNode::Leaf { scores, .. } => {
                        for (j, &s) in scores.iter().enumerate() {
                            out[[i, j]] = s;
                        }
                        break;
                    }
                    TreeNode::Split {
                        feature_idx,
                        threshold,
                        left,
                        right,
                        ..
                    } => {
                        node = if sample[*feature_idx] <= *threshold {
                            left.as_ref()
                        } else {
                            right.as_ref()
                        };
                    }
                }
            }
        }
        Ok(out)
    }

    /// Root node of the fitted tree
    pub fn root(&self) -> Option<&TreeNode> {
        self.root.as_ref()
    }

    /// Number of features seen at fit time
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Number of output scores per leaf
    pub fn n_outputs(&self) -> usize {
        self.n_outputs.max(1)
    }

    /// Whether the tree was fitted for classification
    pub fn is_classification(&self) -> bool {
        self.is_classification
    }

    /// Depth of the fitted tree (a lone leaf has depth 1)
    pub fn depth(&self) -> usize {
        self.root.as_ref().map_or(0, |n| n.depth())
    }

    /// Number of leaves in the fitted tree
    pub fn n_leaves(&self) -> usize {
        self.root.as_ref().map_or(0, |n| n.count_leaves())
    }
}

fn is_pure(targets: &[f64]) -> bool {
    targets
        .first()
        .map_or(true, |&first| targets.iter().all(|&t| (t - first).abs() < 1e-12))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_classifier_separable() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];

        let mut tree = DecisionTree::new_classifier();
        tree.fit(&x, &y).unwrap();

        let predictions = tree.predict(&x).unwrap();
        assert_eq!(predictions, y);
    }

    #[test]
    fn test_leaf_distributions_sum_to_one() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];

        let mut tree = DecisionTree::new_classifier().with_max_depth(1);
        tree.fit(&x, &y).unwrap();

        let proba = tree.predict_scores(&x).unwrap();
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_regressor_simple() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = array![1.0, 2.0, 3.0, 4.0, 5.0];

        let mut tree = DecisionTree::new_regressor();
        tree.fit(&x, &y).unwrap();

        let predictions = tree.predict(&x).unwrap();
        let mse: f64 = predictions
            .iter()
            .zip(y.iter())
            .map(|(p, a)| (p - a).powi(2))
            .sum::<f64>()
            / y.len() as f64;
        assert!(mse < 1.0, "MSE too high: {}", mse);
    }

    #[test]
    fn test_max_depth_respected() {
        let x = array![[1.0], [2.0], [3.0], [4.0], [5.0], [6.0], [7.0], [8.0]];
        let y = array![0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0];

        let mut tree = DecisionTree::new_classifier().with_max_depth(2);
        tree.fit(&x, &y).unwrap();
        assert!(tree.depth() <= 3);
    }

    #[test]
    fn test_declared_classes_pad_distribution() {
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 0.0];
        let mut tree = DecisionTree::new_classifier().with_n_classes(3);
        tree.fit(&x, &y).unwrap();
        assert_eq!(tree.n_outputs(), 3);
    }

    #[test]
    fn test_unfitted_predict_errors() {
        let tree = DecisionTree::new_classifier();
        let x = array![[0.0]];
        assert!(matches!(
            tree.predict(&x),
            Err(CipherMlError::UncalibratedModel)
        ));
    }

    #[test]
    fn test_non_ordinal_labels_rejected() {
        let x = array![[0.0], [1.0]];
        let y = array![1.5, 2.0];
        let mut tree = DecisionTree::new_classifier();
        assert!(matches!(
            tree.fit(&x, &y),
            Err(CipherMlError::Validation(_))
        ));
    }
}
