//! Random forest trainer

use crate::error::{CipherMlError, Result};
use crate::models::decision_tree::DecisionTree;
use ndarray::{Array1, Array2, Axis};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Random forest classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    /// Number of trees
    pub n_estimators: usize,
    /// Maximum depth per tree
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    /// Bootstrap sampling
    pub bootstrap: bool,
    /// Random state for reproducible bootstrap draws
    pub random_state: Option<u64>,
    n_features: usize,
    n_classes: usize,
}

impl Default for RandomForest {
    fn default() -> Self {
        Self::new_classifier(100)
    }
}

impl RandomForest {
    /// Create a new classifier forest
    pub fn new_classifier(n_estimators: usize) -> Self {
        Self {
            trees: Vec::new(),
            n_estimators,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            bootstrap: true,
            random_state: None,
            n_features: 0,
            n_classes: 0,
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

    /// Enable/disable bootstrap sampling
    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Set random state
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    /// A fresh untrained forest with the same hyperparameters
    pub fn fresh(&self) -> Self {
        let mut forest = Self::new_classifier(self.n_estimators)
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf)
            .with_bootstrap(self.bootstrap);
        forest.max_depth = self.max_depth;
        forest.random_state = self.random_state;
        forest
    }

    /// Fit the forest. Targets must be ordinals `0..k-1`.
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
        self.n_classes = y.iter().copied().fold(0.0f64, f64::max) as usize + 1;

        let base_seed = self.random_state.unwrap_or(42);
        let trees: Vec<Result<DecisionTree>> = (0..self.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let mut rng = ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(tree_idx as u64));

                let sample_indices: Vec<usize> = if self.bootstrap {
                    (0..n_samples)
                        .map(|_| (rng.next_u64() as usize) % n_samples)
                        .collect()
                } else {
                    (0..n_samples).collect()
                };

                let x_boot = x.select(Axis(0), &sample_indices);
                let y_boot =
                    Array1::from_vec(sample_indices.iter().map(|&i| y[i]).collect());

                let mut tree = DecisionTree::new_classifier()
                    .with_min_samples_split(self.min_samples_split)
                    .with_min_samples_leaf(self.min_samples_leaf)
                    .with_n_classes(self.n_classes);
                if let Some(d) = self.max_depth {
                    tree = tree.with_max_depth(d);
                }
                tree.fit(&x_boot, &y_boot)?;
                Ok(tree)
            })
            .collect();

        self.trees = trees.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(self)
    }

    /// Average class distributions across trees
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if self.trees.is_empty() {
            return Err(CipherMlError::UncalibratedModel);
        }
        let per_tree: Vec<Array2<f64>> = self
            .trees
            .par_iter()
            .map(|tree| tree.predict_scores(x))
            .collect::<Result<Vec<_>>>()?;

        let mut total = Array2::<f64>::zeros((x.nrows(), self.n_classes));
        for scores in &per_tree {
            total = total + scores;
        }
        Ok(total / self.trees.len() as f64)
    }

    /// Predict class ordinals by majority of averaged distributions
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let proba = self.predict_proba(x)?;
        let labels: Vec<f64> = proba
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
            .collect();
        Ok(Array1::from_vec(labels))
    }

    /// The fitted trees
    pub fn trees(&self) -> &[DecisionTree] {
        &self.trees
    }

    /// Number of classes seen at fit time
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }
}
