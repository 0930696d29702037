//! Estimator lifecycle controller
//!
//! Orchestrates fit -> quantize -> [compile] -> predict, dispatches to clear
//! tensor evaluation or to an external backend, and applies host-side
//! post-processing (label remapping, argmax, ensemble summation).

mod linear;
mod tree;

pub use linear::{QuantizedLinearRegressor, QuantizedLogisticClassifier};
pub use tree::{QuantizedForestClassifier, QuantizedTreeClassifier, QuantizedTreeRegressor};

use crate::backend::{CompilationBackend, CompileConfig};
use crate::error::Result;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorState {
    /// No model fitted yet
    Unfitted,
    /// Fitted and quantized; clear prediction available
    Fitted,
    /// A backend accepted the integer program; backend execution available
    Compiled,
}

/// Where a prediction executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Whole-batch clear integer evaluation
    #[default]
    Clear,
    /// One backend call per sample through the compiled circuit
    Encrypted,
}

/// The estimator contract consumed by callers
pub trait Estimator {
    /// Current lifecycle state
    fn state(&self) -> EstimatorState;

    /// Calibrate quantization and fit the underlying model.
    ///
    /// Valid from any state; resets to `Fitted` and discards any compiled
    /// circuit.
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()>;

    /// Hand the integer program to a backend. Valid only when `Fitted`.
    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()>;

    /// Predict labels (classifiers) or values (regressors)
    fn predict(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>>;

    /// Predict per-class scores or decision values
    fn predict_proba(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>>;
}

/// Mapping between original class labels and zero-based ordinals.
///
/// Built at fit time when labels are not already `0..k-1`; decodes argmax
/// ordinals back to the caller's labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelMapping {
    classes: Vec<f64>,
}

impl LabelMapping {
    /// Derive the mapping from targets and remap them to ordinals
    pub fn fit(y: &Array1<f64>) -> (Self, Array1<f64>) {
        let mut classes: Vec<f64> = y.to_vec();
        classes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        classes.dedup();

        let remapped = y.mapv(|label| {
            classes
                .iter()
                .position(|&c| c == label)
                .unwrap_or(0) as f64
        });
        (Self { classes }, remapped)
    }

    /// Number of distinct classes
    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// Whether labels were already `0..k-1`
    pub fn is_identity(&self) -> bool {
        self.classes
            .iter()
            .enumerate()
            .all(|(i, &c)| c == i as f64)
    }

    /// Original label for an ordinal
    pub fn decode(&self, ordinal: usize) -> f64 {
        self.classes.get(ordinal).copied().unwrap_or(ordinal as f64)
    }

    /// Decode a vector of ordinals
    pub fn decode_all(&self, ordinals: &Array1<f64>) -> Array1<f64> {
        ordinals.mapv(|o| self.decode(o as usize))
    }
}

/// Row-wise argmax as ordinals; the lowest index wins ties
pub(crate) fn argmax_rows(scores: &Array2<f64>) -> Array1<f64> {
    let ordinals: Vec<f64> = scores
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
    Array1::from_vec(ordinals)
}
