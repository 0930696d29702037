//! Quantized tree estimators
//!
//! Tree models quantize per feature, train on the quantized grid, and
//! compile the fitted ensemble into a branch-free tensor program. Each
//! estimator owns a quantization engine and its base model by composition.

use crate::backend::{Circuit, CircuitFn, CompilationBackend, CompileConfig};
use crate::error::{CipherMlError, Result};
use crate::estimator::{argmax_rows, Estimator, EstimatorState, ExecutionMode, LabelMapping};
use crate::models::{Criterion, DecisionTree, RandomForest};
use crate::quantization::QuantizedArray;
use crate::tree::TensorTreeEnsemble;
use ndarray::{Array1, Array2, Axis};
use std::sync::Arc;

/// Quantization and integer-inference state shared by tree estimators:
/// per-feature input quantizers, the tensor ensemble and the compiled
/// circuit.
struct TreeQuantizationEngine {
    n_bits: u32,
    q_x_byfeatures: Vec<QuantizedArray>,
    ensemble: Option<TensorTreeEnsemble>,
    circuit: Option<Box<dyn Circuit>>,
}

impl std::fmt::Debug for TreeQuantizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeQuantizationEngine")
            .field("n_bits", &self.n_bits)
            .field("n_features", &self.q_x_byfeatures.len())
            .field("has_ensemble", &self.ensemble.is_some())
            .field("is_compiled", &self.circuit.is_some())
            .finish()
    }
}

impl TreeQuantizationEngine {
    fn new(n_bits: u32) -> Self {
        Self {
            n_bits,
            q_x_byfeatures: Vec::new(),
            ensemble: None,
            circuit: None,
        }
    }

    fn state(&self) -> EstimatorState {
        if self.ensemble.is_none() {
            EstimatorState::Unfitted
        } else if self.circuit.is_some() {
            EstimatorState::Compiled
        } else {
            EstimatorState::Fitted
        }
    }

    /// Calibrate one quantizer per feature column and return the quantized
    /// training grid (integers carried as f64 for the trainers). Discards
    /// any previous ensemble and circuit.
    fn calibrate(&mut self, x: &Array2<f64>) -> Array2<f64> {
        self.ensemble = None;
        self.circuit = None;
        self.q_x_byfeatures = (0..x.ncols())
            .map(|i| {
                QuantizedArray::new(self.n_bits, x.column(i).to_owned().into_dyn(), false)
            })
            .collect();

        let mut q_x = Array2::zeros(x.dim());
        for (i, qa) in self.q_x_byfeatures.iter().enumerate() {
            for (r, &q) in qa.qvalues().iter().enumerate() {
                q_x[[r, i]] = q as f64;
            }
        }
        q_x
    }

    /// Quantize production inputs feature by feature with the fixed
    /// parameters learned at fit time.
    fn quantize_input(&self, x: &Array2<f64>) -> Result<Array2<i64>> {
        if self.q_x_byfeatures.is_empty() {
            return Err(CipherMlError::UncalibratedModel);
        }
        if x.ncols() != self.q_x_byfeatures.len() {
            return Err(CipherMlError::Shape {
                expected: format!("{} feature columns", self.q_x_byfeatures.len()),
                actual: format!("{} columns", x.ncols()),
            });
        }
        let mut q_x = Array2::zeros((x.nrows(), x.ncols()));
        for (i, qa) in self.q_x_byfeatures.iter().enumerate() {
            let q_col = qa.quantizer().quant_array(&x.column(i));
            q_x.column_mut(i).assign(&q_col);
        }
        Ok(q_x)
    }

    fn attach(&mut self, trees: &[&DecisionTree]) -> Result<()> {
        self.ensemble = Some(TensorTreeEnsemble::from_trees(trees, self.n_bits)?);
        Ok(())
    }

    /// Summed dequantized scores, `(n_samples, n_outputs)`
    fn scores(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        let ensemble = self.ensemble.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        let q_x = self.quantize_input(x)?;
        match mode {
            ExecutionMode::Clear => {
                let scores = ensemble.evaluate(&q_x)?;
                let deq = ensemble.dequantize(&scores);
                Ok(deq.sum_axis(Axis(0)))
            }
            ExecutionMode::Encrypted => {
                let circuit = self.circuit.as_deref().ok_or(CipherMlError::NotCompiled)?;
                let mut out = Array2::zeros((q_x.nrows(), ensemble.n_outputs()));
                for (i, row) in q_x.outer_iter().enumerate() {
                    let flat = circuit.encrypt_run_decrypt(row)?;
                    let per_tree = ensemble.reshape_sample_output(&flat)?;
                    let deq = ensemble
                        .output_quantizer()
                        .quantizer()
                        .dequant_array(&per_tree);
                    out.row_mut(i).assign(&deq.sum_axis(Axis(0)));
                }
                Ok(out)
            }
        }
    }

    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()> {
        let ensemble = self.ensemble.as_ref().ok_or(CipherMlError::PrecompileOrder)?;
        let q_inputset = self.quantize_input(x)?;

        let program = ensemble.clone();
        let function: CircuitFn = Arc::new(move |sample| program.evaluate_sample(sample));
        let circuit = backend.compile(function, &q_inputset, config)?;
        tracing::info!(
            n_trees = ensemble.n_trees(),
            n_outputs = circuit.n_outputs(),
            "tree ensemble compiled"
        );
        self.circuit = Some(circuit);
        Ok(())
    }
}

/// Single decision-tree classifier with integer-only inference
#[derive(Debug)]
pub struct QuantizedTreeClassifier {
    engine: TreeQuantizationEngine,
    /// Maximum tree depth
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    base: Option<DecisionTree>,
    labels: Option<LabelMapping>,
}

impl QuantizedTreeClassifier {
    /// Create a classifier quantizing at `n_bits`
    pub fn new(n_bits: u32) -> Self {
        Self {
            engine: TreeQuantizationEngine::new(n_bits),
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            base: None,
            labels: None,
        }
    }

    /// Set maximum tree depth
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

    /// The fitted base tree
    pub fn base_model(&self) -> Option<&DecisionTree> {
        self.base.as_ref()
    }

    fn configure_tree(&self) -> DecisionTree {
        let mut tree = DecisionTree::new_classifier()
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf);
        if let Some(d) = self.max_depth {
            tree = tree.with_max_depth(d);
        }
        tree
    }

    /// Fit the quantized estimator and an unquantized reference tree with
    /// the same hyperparameters on the raw floats.
    pub fn fit_benchmark(
        mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<(Self, DecisionTree)> {
        let (_, y_ordinal) = LabelMapping::fit(y);
        let mut reference = self.configure_tree();
        reference.fit(x, &y_ordinal)?;
        Estimator::fit(&mut self, x, y)?;
        Ok((self, reference))
    }
}

impl Estimator for QuantizedTreeClassifier {
    fn state(&self) -> EstimatorState {
        self.engine.state()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        let q_x = self.engine.calibrate(x);
        let (labels, y_ordinal) = LabelMapping::fit(y);

        let mut tree = self.configure_tree();
        tree.fit(&q_x, &y_ordinal)?;
        self.engine.attach(&[&tree])?;
        self.base = Some(tree);
        self.labels = Some(labels);
        tracing::info!(n_samples = x.nrows(), "tree classifier fitted and quantized");
        Ok(())
    }

    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()> {
        self.engine.compile(x, backend, config)
    }

    fn predict(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>> {
        let proba = self.predict_proba(x, mode)?;
        let ordinals = argmax_rows(&proba);
        let labels = self.labels.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        Ok(labels.decode_all(&ordinals))
    }

    fn predict_proba(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        self.engine.scores(x, mode)
    }
}

/// Single decision-tree regressor with integer-only inference
#[derive(Debug)]
pub struct QuantizedTreeRegressor {
    engine: TreeQuantizationEngine,
    /// Maximum tree depth
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    base: Option<DecisionTree>,
}

impl QuantizedTreeRegressor {
    /// Create a regressor quantizing at `n_bits`
    pub fn new(n_bits: u32) -> Self {
        Self {
            engine: TreeQuantizationEngine::new(n_bits),
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            base: None,
        }
    }

    /// Set maximum tree depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// The fitted base tree
    pub fn base_model(&self) -> Option<&DecisionTree> {
        self.base.as_ref()
    }

    fn configure_tree(&self) -> DecisionTree {
        let mut tree = DecisionTree::new_regressor()
            .with_criterion(Criterion::Mse)
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf);
        if let Some(d) = self.max_depth {
            tree = tree.with_max_depth(d);
        }
        tree
    }

    /// Fit the quantized estimator and an unquantized reference tree with
    /// the same hyperparameters on the raw floats.
    pub fn fit_benchmark(
        mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<(Self, DecisionTree)> {
        let mut reference = self.configure_tree();
        reference.fit(x, y)?;
        Estimator::fit(&mut self, x, y)?;
        Ok((self, reference))
    }
}

impl Estimator for QuantizedTreeRegressor {
    fn state(&self) -> EstimatorState {
        self.engine.state()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        let q_x = self.engine.calibrate(x);
        let mut tree = self.configure_tree();
        tree.fit(&q_x, y)?;
        self.engine.attach(&[&tree])?;
        self.base = Some(tree);
        tracing::info!(n_samples = x.nrows(), "tree regressor fitted and quantized");
        Ok(())
    }

    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()> {
        self.engine.compile(x, backend, config)
    }

    fn predict(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>> {
        let scores = self.predict_proba(x, mode)?;
        Ok(scores.column(0).to_owned())
    }

    fn predict_proba(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        self.engine.scores(x, mode)
    }
}

/// Random-forest classifier with integer-only inference.
///
/// Per-tree integer scores are summed host-side and averaged into class
/// probabilities.
#[derive(Debug)]
pub struct QuantizedForestClassifier {
    engine: TreeQuantizationEngine,
    /// Number of trees
    pub n_estimators: usize,
    /// Maximum tree depth
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    /// Random state shared with benchmark references
    pub random_state: Option<u64>,
    base: Option<RandomForest>,
    labels: Option<LabelMapping>,
}

impl QuantizedForestClassifier {
    /// Create a forest classifier quantizing at `n_bits`
    pub fn new(n_bits: u32, n_estimators: usize) -> Self {
        Self {
            engine: TreeQuantizationEngine::new(n_bits),
            n_estimators,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            random_state: None,
            base: None,
            labels: None,
        }
    }

    /// Set maximum tree depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Set random state
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    /// The fitted base forest
    pub fn base_model(&self) -> Option<&RandomForest> {
        self.base.as_ref()
    }

    fn configure_forest(&self) -> RandomForest {
        let mut forest = RandomForest::new_classifier(self.n_estimators)
            .with_min_samples_split(self.min_samples_split)
            .with_min_samples_leaf(self.min_samples_leaf);
        if let Some(d) = self.max_depth {
            forest = forest.with_max_depth(d);
        }
        if let Some(seed) = self.random_state {
            forest = forest.with_random_state(seed);
        }
        forest
    }

    /// Fit the quantized estimator and an unquantized reference forest with
    /// identical hyperparameters and seed on the raw floats.
    pub fn fit_benchmark(
        mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<(Self, RandomForest)> {
        let (_, y_ordinal) = LabelMapping::fit(y);
        let mut reference = self.configure_forest();
        reference.fit(x, &y_ordinal)?;
        Estimator::fit(&mut self, x, y)?;
        Ok((self, reference))
    }
}

impl Estimator for QuantizedForestClassifier {
    fn state(&self) -> EstimatorState {
        self.engine.state()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        let q_x = self.engine.calibrate(x);
        let (labels, y_ordinal) = LabelMapping::fit(y);

        let mut forest = self.configure_forest();
        forest.fit(&q_x, &y_ordinal)?;
        let tree_refs: Vec<&DecisionTree> = forest.trees().iter().collect();
        self.engine.attach(&tree_refs)?;
        self.base = Some(forest);
        self.labels = Some(labels);
        tracing::info!(
            n_samples = x.nrows(),
            n_trees = self.n_estimators,
            "forest classifier fitted and quantized"
        );
        Ok(())
    }

    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()> {
        self.engine.compile(x, backend, config)
    }

    fn predict(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>> {
        let proba = self.predict_proba(x, mode)?;
        let ordinals = argmax_rows(&proba);
        let labels = self.labels.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        Ok(labels.decode_all(&ordinals))
    }

    fn predict_proba(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        let summed = self.engine.scores(x, mode)?;
        let n_trees = self
            .engine
            .ensemble
            .as_ref()
            .map(|e| e.n_trees())
            .unwrap_or(1);
        Ok(summed / n_trees as f64)
    }
}
