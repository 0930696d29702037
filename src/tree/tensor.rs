//! Branch-free tensor representation of decision-tree ensembles
//!
//! Each tree is linearized into a one-hot feature-selection matrix, an
//! integer threshold vector, a signed path matrix and a quantized leaf-score
//! matrix. A sample's leaf is selected arithmetically: the `<=` comparisons
//! of every internal node are computed at once, a leaf is active exactly
//! when the signed sum of its path comparisons equals its left-edge count,
//! and the score is the indicator-weighted sum over leaves.
//!
//! Trees are trained on integer-quantized inputs, so learned thresholds sit
//! on midpoints of the integer grid; flooring them preserves the `<=`
//! decision of the float path exactly, including ties at grid points.

use crate::error::{CipherMlError, Result};
use crate::models::{DecisionTree, TreeNode};
use crate::quantization::QuantizedArray;
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Maximum tree depth the fixed-shape representation supports
pub const MAX_TENSOR_DEPTH: usize = 16;

/// One tree as fixed-shape integer tensors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorTree {
    /// One-hot feature selection, `(n_nodes, n_features)`
    feature_select: Array2<i64>,
    /// Integer split thresholds, `(n_nodes,)`
    thresholds: Array1<i64>,
    /// +1 for "leaf in left subtree of node", -1 for right, 0 otherwise,
    /// `(n_nodes, n_leaves)`
    path_matrix: Array2<i64>,
    /// Left edges on each leaf's path, `(n_leaves,)`
    left_counts: Array1<i64>,
    /// Quantized leaf scores, `(n_leaves, n_outputs)`
    leaf_scores: Array2<i64>,
}

impl TensorTree {
    fn n_nodes(&self) -> usize {
        self.thresholds.len()
    }

    /// Evaluate a quantized batch, `(n_samples, n_outputs)` integer scores
    fn evaluate_batch(&self, q_x: &Array2<i64>) -> Array2<i64> {
        let n_samples = q_x.nrows();
        if self.n_nodes() == 0 {
            // constant tree: the single leaf always wins
            let mut out = Array2::zeros((n_samples, self.leaf_scores.ncols()));
            for mut row in out.axis_iter_mut(Axis(0)) {
                row.assign(&self.leaf_scores.row(0));
            }
            return out;
        }

        let selected = q_x.dot(&self.feature_select.t());
        let decisions = Array2::from_shape_fn(selected.dim(), |(i, n)| {
            i64::from(selected[[i, n]] <= self.thresholds[n])
        });
        let path_sums = decisions.dot(&self.path_matrix);
        let indicator = Array2::from_shape_fn(path_sums.dim(), |(i, l)| {
            i64::from(path_sums[[i, l]] == self.left_counts[l])
        });
        indicator.dot(&self.leaf_scores)
    }

    /// Evaluate one quantized sample, `(n_outputs,)` integer scores
    fn evaluate_row(&self, q_x: ArrayView1<i64>) -> Array1<i64> {
        if self.n_nodes() == 0 {
            return self.leaf_scores.row(0).to_owned();
        }
        let selected = self.feature_select.dot(&q_x);
        let decisions = Array1::from_shape_fn(selected.len(), |n| {
            i64::from(selected[n] <= self.thresholds[n])
        });
        let path_sums = self.path_matrix.t().dot(&decisions);
        let indicator = Array1::from_shape_fn(path_sums.len(), |l| {
            i64::from(path_sums[l] == self.left_counts[l])
        });
        self.leaf_scores.t().dot(&indicator)
    }
}

/// A whole fitted ensemble as one vectorized integer computation, plus the
/// output quantizer calibrated over the union of all trees' leaf outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorTreeEnsemble {
    trees: Vec<TensorTree>,
    q_leaf: QuantizedArray,
    n_features: usize,
    n_outputs: usize,
}

/// Linearized float view of one tree, before leaf quantization
struct LinearizedTree {
    features: Vec<usize>,
    thresholds: Vec<f64>,
    leaf_paths: Vec<Vec<(usize, bool)>>,
    leaf_scores: Vec<Vec<f64>>,
}

fn linearize(root: &TreeNode) -> LinearizedTree {
    let mut tree = LinearizedTree {
        features: Vec::new(),
        thresholds: Vec::new(),
        leaf_paths: Vec::new(),
        leaf_scores: Vec::new(),
    };
    let mut path = Vec::new();
    walk(root, &mut tree, &mut path);
    tree
}

fn walk(node: &TreeNode, tree: &mut LinearizedTree, path: &mut Vec<(usize, bool)>) {
    match node {
        TreeNode::Leaf { scores, .. } => {
            tree.leaf_paths.push(path.clone());
            tree.leaf_scores.push(scores.clone());
        }
        TreeNode::Split {
            feature_idx,
            threshold,
            left,
            right,
            ..
        } => {
            let node_idx = tree.features.len();
            tree.features.push(*feature_idx);
            tree.thresholds.push(*threshold);

            path.push((node_idx, true));
            walk(left, tree, path);
            path.pop();

            path.push((node_idx, false));
            walk(right, tree, path);
            path.pop();
        }
    }
}

impl TensorTreeEnsemble {
    /// Compile fitted trees into tensor form.
    ///
    /// All trees must be fitted on the same feature and output arity.
    /// The output quantizer is calibrated once over every leaf score of
    /// every tree at `output_n_bits`; signedness follows the observed range.
    pub fn from_trees(trees: &[&DecisionTree], output_n_bits: u32) -> Result<Self> {
        if trees.is_empty() {
            return Err(CipherMlError::Validation(
                "ensemble has no trees".to_string(),
            ));
        }
        let n_features = trees[0].n_features();
        let n_outputs = trees[0].n_outputs();

        let mut linearized = Vec::with_capacity(trees.len());
        for (i, tree) in trees.iter().enumerate() {
            let root = tree.root().ok_or(CipherMlError::UncalibratedModel)?;
            if tree.n_features() != n_features || tree.n_outputs() != n_outputs {
                return Err(CipherMlError::UnsupportedTreeStructure(format!(
                    "tree {} has inconsistent arity ({} features, {} outputs)",
                    i,
                    tree.n_features(),
                    tree.n_outputs()
                )));
            }
            if tree.depth() > MAX_TENSOR_DEPTH {
                return Err(CipherMlError::UnsupportedTreeStructure(format!(
                    "tree {} has depth {}, maximum is {}",
                    i,
                    tree.depth(),
                    MAX_TENSOR_DEPTH
                )));
            }
            linearized.push(linearize(root));
        }

        let all_scores: Vec<f64> = linearized
            .iter()
            .flat_map(|t| t.leaf_scores.iter().flatten().copied())
            .collect();
        let is_signed = all_scores.iter().any(|&v| v < 0.0);
        let q_leaf = QuantizedArray::new(
            output_n_bits,
            Array1::from_vec(all_scores).into_dyn(),
            is_signed,
        );

        let tensor_trees = linearized
            .iter()
            .map(|lin| Self::build_tensor_tree(lin, n_features, n_outputs, &q_leaf))
            .collect();

        tracing::debug!(
            n_trees = trees.len(),
            n_features,
            n_outputs,
            "compiled ensemble to tensor form"
        );
        Ok(Self {
            trees: tensor_trees,
            q_leaf,
            n_features,
            n_outputs,
        })
    }

    fn build_tensor_tree(
        lin: &LinearizedTree,
        n_features: usize,
        n_outputs: usize,
        q_leaf: &QuantizedArray,
    ) -> TensorTree {
        let n_nodes = lin.features.len();
        let n_leaves = lin.leaf_paths.len();

        let mut feature_select = Array2::zeros((n_nodes, n_features));
        for (node, &feat) in lin.features.iter().enumerate() {
            feature_select[[node, feat]] = 1;
        }

        // thresholds learned on integer inputs floor exactly: for integer x,
        // x <= t  <=>  x <= floor(t)
        let thresholds =
            Array1::from_vec(lin.thresholds.iter().map(|t| t.floor() as i64).collect());

        let mut path_matrix = Array2::zeros((n_nodes, n_leaves));
        let mut left_counts = Array1::zeros(n_leaves);
        for (leaf, path) in lin.leaf_paths.iter().enumerate() {
            for &(node, went_left) in path {
                path_matrix[[node, leaf]] = if went_left { 1 } else { -1 };
            }
            left_counts[leaf] = path.iter().filter(|(_, left)| *left).count() as i64;
        }

        let quantizer = q_leaf.quantizer();
        let mut leaf_scores = Array2::zeros((n_leaves, n_outputs));
        for (leaf, scores) in lin.leaf_scores.iter().enumerate() {
            for (out, &score) in scores.iter().enumerate() {
                leaf_scores[[leaf, out]] = quantizer.quant(score);
            }
        }

        TensorTree {
            feature_select,
            thresholds,
            path_matrix,
            left_counts,
            leaf_scores,
        }
    }

    /// Number of trees in the ensemble
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Feature arity of the quantized input
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Scores per tree per sample
    pub fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    /// The output quantizer for leaf scores
    pub fn output_quantizer(&self) -> &QuantizedArray {
        &self.q_leaf
    }

    /// Evaluate a quantized batch over all trees in the clear.
    ///
    /// Returns `(n_trees, n_samples, n_outputs)` integer scores; trees run
    /// in parallel, output order is preserved.
    pub fn evaluate(&self, q_x: &Array2<i64>) -> Result<Array3<i64>> {
        if q_x.ncols() != self.n_features {
            return Err(CipherMlError::Shape {
                expected: format!("{} feature columns", self.n_features),
                actual: format!("{} columns", q_x.ncols()),
            });
        }
        let per_tree: Vec<Array2<i64>> = self
            .trees
            .par_iter()
            .map(|tree| tree.evaluate_batch(q_x))
            .collect();
        let views: Vec<_> = per_tree.iter().map(|a| a.view()).collect();
        ndarray::stack(Axis(0), &views).map_err(Into::into)
    }

    /// Evaluate one quantized sample over all trees, flattened to
    /// `(n_trees * n_outputs,)`, the form the compiled circuit returns.
    pub fn evaluate_sample(&self, q_x: ArrayView1<i64>) -> Result<Array1<i64>> {
        if q_x.len() != self.n_features {
            return Err(CipherMlError::Shape {
                expected: format!("{} features", self.n_features),
                actual: format!("{} values", q_x.len()),
            });
        }
        let mut flat = Vec::with_capacity(self.trees.len() * self.n_outputs);
        for tree in &self.trees {
            flat.extend(tree.evaluate_row(q_x).into_iter());
        }
        Ok(Array1::from_vec(flat))
    }

    /// Reshape a flat per-sample circuit output back to `(n_trees, n_outputs)`
    pub fn reshape_sample_output(&self, flat: &Array1<i64>) -> Result<Array2<i64>> {
        flat.to_owned()
            .into_shape_with_order((self.trees.len(), self.n_outputs))
            .map_err(|e| CipherMlError::Shape {
                expected: format!("{} x {} scores", self.trees.len(), self.n_outputs),
                actual: e.to_string(),
            })
    }

    /// Dequantize integer scores through the output quantizer
    pub fn dequantize(&self, scores: &Array3<i64>) -> Array3<f64> {
        self.q_leaf.quantizer().dequant_array(scores)
    }
}
