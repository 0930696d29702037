//! Floating computation graph consumed by the quantizer
//!
//! A minimal acyclic op list over one input tensor. Operators with no
//! integer equivalent (casts, softmax, argmax) are elided by the
//! simplification pass; monotonic host-side post-processing reproduces
//! their effect on label selection.

use crate::error::{CipherMlError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// A single floating operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GraphOp {
    /// Dense affine transform: `x . weights + bias`
    Gemm {
        weights: Array2<f64>,
        bias: Array1<f64>,
    },
    /// Type cast, a no-op on numeric tensors
    Cast,
    /// Row-wise softmax
    Softmax,
    /// Row-wise index of the maximum score
    ArgMax,
    /// Pass-through
    Identity,
}

impl GraphOp {
    /// Whether the op has no integer equivalent and must be elided
    pub fn is_elidable(&self) -> bool {
        matches!(self, GraphOp::Cast | GraphOp::Softmax | GraphOp::ArgMax)
    }
}

/// An ordered acyclic computation over one 2-D input tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatGraph {
    n_features: usize,
    ops: Vec<GraphOp>,
}

impl FloatGraph {
    /// Create an empty graph over `n_features` input columns
    pub fn new(n_features: usize) -> Self {
        Self {
            n_features,
            ops: Vec::new(),
        }
    }

    /// Append an op, validating Gemm shapes against the running output width
    pub fn push(&mut self, op: GraphOp) -> Result<&mut Self> {
        if let GraphOp::Gemm { weights, bias } = &op {
            let expected = self.output_width();
            if weights.nrows() != expected {
                return Err(CipherMlError::Shape {
                    expected: format!("weights with {} rows", expected),
                    actual: format!("{} rows", weights.nrows()),
                });
            }
            if bias.len() != weights.ncols() {
                return Err(CipherMlError::Shape {
                    expected: format!("bias of length {}", weights.ncols()),
                    actual: format!("length {}", bias.len()),
                });
            }
        }
        self.ops.push(op);
        Ok(self)
    }

    /// Number of input columns
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// The ops in execution order
    pub fn ops(&self) -> &[GraphOp] {
        &self.ops
    }

    /// Width of the graph output, tracking Gemm column counts
    pub fn output_width(&self) -> usize {
        self.ops
            .iter()
            .rev()
            .find_map(|op| match op {
                GraphOp::Gemm { weights, .. } => Some(weights.ncols()),
                _ => None,
            })
            .unwrap_or(self.n_features)
    }

    /// The graph-cleaning pass: rewrite non-integer ops to identity, then
    /// drop all identity (no-op) nodes.
    pub fn simplify(&mut self) {
        for op in &mut self.ops {
            if op.is_elidable() {
                *op = GraphOp::Identity;
            }
        }
        self.ops.retain(|op| !matches!(op, GraphOp::Identity));
    }

    /// Float evaluation, used for calibration forward passes
    pub fn forward(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.n_features {
            return Err(CipherMlError::Shape {
                expected: format!("{} columns", self.n_features),
                actual: format!("{} columns", x.ncols()),
            });
        }
        let mut current = x.to_owned();
        for op in &self.ops {
            current = match op {
                GraphOp::Gemm { weights, bias } => current.dot(weights) + bias,
                GraphOp::Cast | GraphOp::Identity => current,
                GraphOp::Softmax => softmax_rows(&current),
                GraphOp::ArgMax => {
                    let indices: Vec<f64> = current
                        .axis_iter(Axis(0))
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
                    Array2::from_shape_vec((current.nrows(), 1), indices)?
                }
            };
        }
        Ok(current)
    }
}

fn softmax_rows(x: &Array2<f64>) -> Array2<f64> {
    let mut out = x.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}
