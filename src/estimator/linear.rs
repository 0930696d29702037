//! Quantized linear estimators
//!
//! Linear models quantize through the affine post-training path: the fitted
//! coefficients become a one-layer floating graph, calibrated on the
//! training data and rewritten into a quantized module.

use crate::backend::{CompilationBackend, CompileConfig};
use crate::error::{CipherMlError, Result};
use crate::estimator::{argmax_rows, Estimator, EstimatorState, ExecutionMode, LabelMapping};
use crate::graph::{FloatGraph, GraphOp};
use crate::models::{LinearRegression, LogisticRegression};
use crate::quantization::{BitWidths, PostTrainingAffineQuantizer, QuantizedModule};
use ndarray::{Array1, Array2, Ix2};

fn coefficient_graph(coef: &Array1<f64>, intercept: f64, nonlinearity: Option<GraphOp>) -> Result<FloatGraph> {
    let n_features = coef.len();
    let weights = coef
        .to_owned()
        .into_shape_with_order((n_features, 1))
        .map_err(|e| CipherMlError::Shape {
            expected: "column vector of coefficients".to_string(),
            actual: e.to_string(),
        })?;
    let mut graph = FloatGraph::new(n_features);
    graph.push(GraphOp::Gemm {
        weights,
        bias: Array1::from_vec(vec![intercept]),
    })?;
    if let Some(op) = nonlinearity {
        graph.push(op)?;
    }
    Ok(graph)
}

fn compile_module(
    module: &mut QuantizedModule,
    x: &Array2<f64>,
    backend: &dyn CompilationBackend,
    config: &CompileConfig,
) -> Result<()> {
    // re-quantize the representative set through a snapshot of the fitted
    // input array; parameters stay fixed
    let mut snapshot = module.q_inputs()[0].clone();
    snapshot.update_values(x.to_owned().into_dyn());
    let q_inputset = snapshot
        .qvalues()
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| CipherMlError::Shape {
            expected: "2-D input set".to_string(),
            actual: e.to_string(),
        })?
        .to_owned();
    module.compile(backend, &q_inputset, config)
}

/// Linear regressor with integer-only inference
#[derive(Debug)]
pub struct QuantizedLinearRegressor {
    n_bits: BitWidths,
    base: LinearRegression,
    module: Option<QuantizedModule>,
}

impl QuantizedLinearRegressor {
    /// Create a regressor quantizing at the given bit widths
    pub fn new(n_bits: impl Into<BitWidths>) -> Self {
        Self {
            n_bits: n_bits.into(),
            base: LinearRegression::new(),
            module: None,
        }
    }

    /// Set L2 regularization on the underlying model
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.base = self.base.clone().with_alpha(alpha);
        self
    }

    /// Enable/disable the intercept on the underlying model
    pub fn with_fit_intercept(mut self, fit_intercept: bool) -> Self {
        self.base = self.base.clone().with_fit_intercept(fit_intercept);
        self
    }

    /// The fitted base model
    pub fn base_model(&self) -> &LinearRegression {
        &self.base
    }

    /// The quantized module, once fitted
    pub fn quantized_module(&self) -> Option<&QuantizedModule> {
        self.module.as_ref()
    }

    fn scores(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        let module = self.module.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        let q_x = module.quantize_input(x)?;
        match mode {
            ExecutionMode::Clear => module.forward_and_dequant(&q_x),
            ExecutionMode::Encrypted => {
                let q_y = module.run_backend(&q_x)?;
                Ok(module.dequantize_output(&q_y))
            }
        }
    }

    /// Fit the quantized estimator and an unquantized reference with the
    /// same hyperparameters, for accuracy-drop comparison.
    pub fn fit_benchmark(
        mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<(Self, LinearRegression)> {
        let mut reference = self.base.fresh();
        reference.fit(x, y)?;
        Estimator::fit(&mut self, x, y)?;
        Ok((self, reference))
    }
}

impl Estimator for QuantizedLinearRegressor {
    fn state(&self) -> EstimatorState {
        match &self.module {
            None => EstimatorState::Unfitted,
            Some(m) if m.is_compiled() => EstimatorState::Compiled,
            Some(_) => EstimatorState::Fitted,
        }
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        // quantization is lost on refit
        self.module = None;

        let mut base = self.base.fresh();
        base.fit(x, y)?;
        let coef = base
            .coefficients()
            .ok_or(CipherMlError::UncalibratedModel)?
            .clone();
        let intercept = base.intercept().unwrap_or(0.0);
        self.base = base;

        let graph = coefficient_graph(&coef, intercept, Some(GraphOp::Cast))?;
        let ptq = PostTrainingAffineQuantizer::new(self.n_bits, graph, true);
        self.module = Some(ptq.quantize_module(x)?);
        tracing::info!(n_features = coef.len(), "linear regressor fitted and quantized");
        Ok(())
    }

    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()> {
        let module = self.module.as_mut().ok_or(CipherMlError::PrecompileOrder)?;
        compile_module(module, x, backend, config)
    }

    fn predict(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>> {
        // for a linear regressor the prediction is the decision value
        let scores = self.predict_proba(x, mode)?;
        Ok(scores.column(0).to_owned())
    }

    fn predict_proba(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        self.scores(x, mode)
    }
}

/// Binary logistic classifier with integer-only inference.
///
/// The sigmoid has no integer equivalent; it is elided from the quantized
/// graph and applied host-side after dequantization, which preserves label
/// selection because it is monotonic.
#[derive(Debug)]
pub struct QuantizedLogisticClassifier {
    n_bits: BitWidths,
    base: LogisticRegression,
    module: Option<QuantizedModule>,
    labels: Option<LabelMapping>,
}

impl QuantizedLogisticClassifier {
    /// Create a classifier quantizing at the given bit widths
    pub fn new(n_bits: impl Into<BitWidths>) -> Self {
        Self {
            n_bits: n_bits.into(),
            base: LogisticRegression::new(),
            module: None,
            labels: None,
        }
    }

    /// Set L2 regularization on the underlying model
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.base = self.base.clone().with_alpha(alpha);
        self
    }

    /// Set maximum gradient-descent iterations
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.base = self.base.clone().with_max_iter(max_iter);
        self
    }

    /// The fitted base model
    pub fn base_model(&self) -> &LogisticRegression {
        &self.base
    }

    fn decision_values(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>> {
        let module = self.module.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        let q_x = module.quantize_input(x)?;
        let scores = match mode {
            ExecutionMode::Clear => module.forward_and_dequant(&q_x)?,
            ExecutionMode::Encrypted => {
                let q_y = module.run_backend(&q_x)?;
                module.dequantize_output(&q_y)
            }
        };
        Ok(scores.column(0).to_owned())
    }

    /// Fit the quantized estimator and an unquantized reference with the
    /// same hyperparameters, for accuracy-drop comparison.
    pub fn fit_benchmark(
        mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
    ) -> Result<(Self, LogisticRegression)> {
        let (_, y_ordinal) = LabelMapping::fit(y);
        let mut reference = self.base.fresh();
        reference.fit(x, &y_ordinal)?;
        Estimator::fit(&mut self, x, y)?;
        Ok((self, reference))
    }
}

impl Estimator for QuantizedLogisticClassifier {
    fn state(&self) -> EstimatorState {
        match &self.module {
            None => EstimatorState::Unfitted,
            Some(m) if m.is_compiled() => EstimatorState::Compiled,
            Some(_) => EstimatorState::Fitted,
        }
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<()> {
        self.module = None;

        let (labels, y_ordinal) = LabelMapping::fit(y);
        if labels.n_classes() != 2 {
            return Err(CipherMlError::Validation(format!(
                "logistic classifier requires exactly 2 classes, got {}",
                labels.n_classes()
            )));
        }

        let mut base = self.base.fresh();
        base.fit(x, &y_ordinal)?;
        let coef = base
            .coefficients()
            .ok_or(CipherMlError::UncalibratedModel)?
            .clone();
        let intercept = base.intercept().unwrap_or(0.0);
        self.base = base;

        let graph = coefficient_graph(&coef, intercept, Some(GraphOp::Softmax))?;
        let ptq = PostTrainingAffineQuantizer::new(self.n_bits, graph, true);
        self.module = Some(ptq.quantize_module(x)?);
        self.labels = Some(labels);
        tracing::info!(n_features = coef.len(), "logistic classifier fitted and quantized");
        Ok(())
    }

    fn compile(
        &mut self,
        x: &Array2<f64>,
        backend: &dyn CompilationBackend,
        config: &CompileConfig,
    ) -> Result<()> {
        let module = self.module.as_mut().ok_or(CipherMlError::PrecompileOrder)?;
        compile_module(module, x, backend, config)
    }

    fn predict(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array1<f64>> {
        let proba = self.predict_proba(x, mode)?;
        let ordinals = argmax_rows(&proba);
        let labels = self.labels.as_ref().ok_or(CipherMlError::UncalibratedModel)?;
        Ok(labels.decode_all(&ordinals))
    }

    fn predict_proba(&self, x: &Array2<f64>, mode: ExecutionMode) -> Result<Array2<f64>> {
        let z = self.decision_values(x, mode)?;
        let mut proba = Array2::zeros((z.len(), 2));
        for (i, &v) in z.iter().enumerate() {
            let p = 1.0 / (1.0 + (-v).exp());
            proba[[i, 0]] = 1.0 - p;
            proba[[i, 1]] = p;
        }
        Ok(proba)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use ndarray::array;

    fn separable() -> (Array2<f64>, Array1<f64>) {
        (
            array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]],
            array![0.0, 0.0, 1.0, 1.0],
        )
    }

    #[test]
    fn test_regressor_lifecycle() {
        let (x, _) = separable();
        let y = array![1.0, 2.0, 3.0, 4.0];
        let mut model = QuantizedLinearRegressor::new(8);
        assert_eq!(model.state(), EstimatorState::Unfitted);

        model.fit(&x, &y).unwrap();
        assert_eq!(model.state(), EstimatorState::Fitted);

        let backend = SimulatedBackend::new();
        model.compile(&x, &backend, &CompileConfig::default()).unwrap();
        assert_eq!(model.state(), EstimatorState::Compiled);
    }

    #[test]
    fn test_regressor_clear_predictions_track_float() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![1.0, 3.0, 5.0, 7.0];
        let mut model = QuantizedLinearRegressor::new(10);
        model.fit(&x, &y).unwrap();

        let pred = model.predict(&x, ExecutionMode::Clear).unwrap();
        for (p, a) in pred.iter().zip(y.iter()) {
            assert!((p - a).abs() < 0.2, "{} vs {}", p, a);
        }
    }

    #[test]
    fn test_classifier_matches_float_labels() {
        let (x, y) = separable();
        let mut model = QuantizedLogisticClassifier::new(8).with_max_iter(5000);
        model.fit(&x, &y).unwrap();

        let float_labels = model.base_model().predict(&x).unwrap();
        let quantized_labels = model.predict(&x, ExecutionMode::Clear).unwrap();
        assert_eq!(quantized_labels, float_labels);
        assert_eq!(quantized_labels, y);
    }

    #[test]
    fn test_classifier_label_remapping() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![-1.0, -1.0, 1.0, 1.0];
        let mut model = QuantizedLogisticClassifier::new(8).with_max_iter(5000);
        model.fit(&x, &y).unwrap();

        let pred = model.predict(&x, ExecutionMode::Clear).unwrap();
        assert_eq!(pred, y);
    }

    #[test]
    fn test_encrypted_before_compile_errors() {
        let (x, y) = separable();
        let mut model = QuantizedLogisticClassifier::new(8);
        model.fit(&x, &y).unwrap();
        assert!(matches!(
            model.predict(&x, ExecutionMode::Encrypted),
            Err(CipherMlError::NotCompiled)
        ));
    }

    #[test]
    fn test_compile_before_fit_errors() {
        let (x, _) = separable();
        let mut model = QuantizedLinearRegressor::new(8);
        let backend = SimulatedBackend::new();
        assert!(matches!(
            model.compile(&x, &backend, &CompileConfig::default()),
            Err(CipherMlError::PrecompileOrder)
        ));
    }

    #[test]
    fn test_fit_benchmark_returns_pair() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 1.0, 2.0, 3.0];
        let model = QuantizedLinearRegressor::new(8);
        let (fitted, reference) = model.fit_benchmark(&x, &y).unwrap();
        assert_eq!(fitted.state(), EstimatorState::Fitted);
        assert!(reference.coefficients().is_some());
    }

    #[test]
    fn test_multiclass_rejected() {
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![0.0, 1.0, 2.0];
        let mut model = QuantizedLogisticClassifier::new(8);
        assert!(matches!(
            model.fit(&x, &y),
            Err(CipherMlError::Validation(_))
        ));
    }
}
