//! Integration tests for the estimator lifecycle: state machine ordering,
//! backend execution, and benchmark determinism

use cipherml::backend::{CompileConfig, SimulatedBackend};
use cipherml::error::CipherMlError;
use cipherml::estimator::{
    Estimator, EstimatorState, ExecutionMode, QuantizedForestClassifier,
    QuantizedLinearRegressor, QuantizedLogisticClassifier, QuantizedTreeClassifier,
};
use ndarray::{array, Array1, Array2};

fn four_points() -> (Array2<f64>, Array1<f64>) {
    (
        array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]],
        array![0.0, 0.0, 1.0, 1.0],
    )
}

// ============================================================================
// Scenario 1: linear model on linearly separable data
// ============================================================================

#[test]
fn test_linear_classifier_matches_float_on_separable_data() {
    let (x, y) = four_points();
    let mut model = QuantizedLogisticClassifier::new(8).with_max_iter(5000);
    model.fit(&x, &y).unwrap();

    let float_labels = model.base_model().predict(&x).unwrap();
    let clear_labels = model.predict(&x, ExecutionMode::Clear).unwrap();
    assert_eq!(clear_labels, float_labels);
    assert_eq!(clear_labels, y);
}

// ============================================================================
// Scenarios 3 and 4: lifecycle ordering errors
// ============================================================================

#[test]
fn test_backend_predict_before_compile_is_not_compiled_error() {
    let (x, y) = four_points();
    let mut model = QuantizedTreeClassifier::new(4).with_max_depth(2);
    model.fit(&x, &y).unwrap();

    assert!(matches!(
        model.predict(&x, ExecutionMode::Encrypted),
        Err(CipherMlError::NotCompiled)
    ));
    assert!(matches!(
        model.predict_proba(&x, ExecutionMode::Encrypted),
        Err(CipherMlError::NotCompiled)
    ));
}

#[test]
fn test_compile_before_fit_is_precompile_order_error() {
    let (x, _) = four_points();
    let backend = SimulatedBackend::new();

    let mut tree = QuantizedTreeClassifier::new(4);
    assert!(matches!(
        tree.compile(&x, &backend, &CompileConfig::default()),
        Err(CipherMlError::PrecompileOrder)
    ));

    let mut linear = QuantizedLogisticClassifier::new(8);
    assert!(matches!(
        linear.compile(&x, &backend, &CompileConfig::default()),
        Err(CipherMlError::PrecompileOrder)
    ));
}

#[test]
fn test_predict_before_fit_is_uncalibrated_error() {
    let (x, _) = four_points();
    let model = QuantizedLinearRegressor::new(8);
    assert!(matches!(
        model.predict(&x, ExecutionMode::Clear),
        Err(CipherMlError::UncalibratedModel)
    ));
}

// ============================================================================
// Scenario 5: refit resets the compiled state
// ============================================================================

#[test]
fn test_refit_discards_compiled_circuit() {
    let (x, y) = four_points();
    let backend = SimulatedBackend::new();

    let mut model = QuantizedLogisticClassifier::new(8).with_max_iter(2000);
    assert_eq!(model.state(), EstimatorState::Unfitted);

    model.fit(&x, &y).unwrap();
    assert_eq!(model.state(), EstimatorState::Fitted);

    model.compile(&x, &backend, &CompileConfig::default()).unwrap();
    assert_eq!(model.state(), EstimatorState::Compiled);
    model.predict(&x, ExecutionMode::Encrypted).unwrap();

    model.fit(&x, &y).unwrap();
    assert_eq!(model.state(), EstimatorState::Fitted);
    assert!(matches!(
        model.predict(&x, ExecutionMode::Encrypted),
        Err(CipherMlError::NotCompiled)
    ));
}

// ============================================================================
// Ordering preservation: clear vs backend argmax at 6 bits
// ============================================================================

#[test]
fn test_clear_and_backend_argmax_agree_at_6_bits() {
    let x = array![
        [0.0, 0.0],
        [0.2, 0.1],
        [0.1, 0.3],
        [1.0, 1.0],
        [0.8, 0.9],
        [0.9, 0.7]
    ];
    let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
    let backend = SimulatedBackend::new();

    let mut tree = QuantizedTreeClassifier::new(6).with_max_depth(3);
    tree.fit(&x, &y).unwrap();
    tree.compile(&x, &backend, &CompileConfig::default()).unwrap();
    assert_eq!(
        tree.predict(&x, ExecutionMode::Clear).unwrap(),
        tree.predict(&x, ExecutionMode::Encrypted).unwrap()
    );

    let mut forest = QuantizedForestClassifier::new(6, 5).with_random_state(13);
    forest.fit(&x, &y).unwrap();
    forest.compile(&x, &backend, &CompileConfig::default()).unwrap();
    assert_eq!(
        forest.predict(&x, ExecutionMode::Clear).unwrap(),
        forest.predict(&x, ExecutionMode::Encrypted).unwrap()
    );

    let mut logistic = QuantizedLogisticClassifier::new(6).with_max_iter(2000);
    logistic.fit(&x, &y).unwrap();
    logistic.compile(&x, &backend, &CompileConfig::default()).unwrap();
    assert_eq!(
        logistic.predict(&x, ExecutionMode::Clear).unwrap(),
        logistic.predict(&x, ExecutionMode::Encrypted).unwrap()
    );
}

#[test]
fn test_backend_output_order_matches_input_order() {
    let (x, y) = four_points();
    let backend = SimulatedBackend::new();

    let mut model = QuantizedTreeClassifier::new(4).with_max_depth(2);
    model.fit(&x, &y).unwrap();
    model.compile(&x, &backend, &CompileConfig::default()).unwrap();

    // reversed input must give reversed output
    let reversed = array![[1.0, 1.0], [1.0, 0.0], [0.0, 1.0], [0.0, 0.0]];
    let forward = model.predict(&x, ExecutionMode::Encrypted).unwrap();
    let backward = model.predict(&reversed, ExecutionMode::Encrypted).unwrap();
    for i in 0..4 {
        assert_eq!(forward[i], backward[3 - i]);
    }
}

// ============================================================================
// Benchmark determinism
// ============================================================================

#[test]
fn test_fit_benchmark_deterministic_with_seed() {
    let x = array![
        [0.0, 0.0],
        [0.1, 0.2],
        [0.3, 0.1],
        [1.0, 0.9],
        [0.8, 1.0],
        [0.9, 0.8]
    ];
    let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];

    let run = || {
        QuantizedForestClassifier::new(6, 6)
            .with_random_state(101)
            .fit_benchmark(&x, &y)
            .unwrap()
    };
    let (model_a, ref_a) = run();
    let (model_b, ref_b) = run();

    assert_eq!(
        model_a.predict_proba(&x, ExecutionMode::Clear).unwrap(),
        model_b.predict_proba(&x, ExecutionMode::Clear).unwrap()
    );
    assert_eq!(
        ref_a.predict_proba(&x).unwrap(),
        ref_b.predict_proba(&x).unwrap()
    );
}

// ============================================================================
// Trait-object dispatch and backend configuration
// ============================================================================

#[test]
fn test_estimators_usable_as_trait_objects() {
    let (x, y) = four_points();
    let mut estimators: Vec<Box<dyn Estimator>> = vec![
        Box::new(QuantizedTreeClassifier::new(4).with_max_depth(2)),
        Box::new(QuantizedLogisticClassifier::new(8).with_max_iter(2000)),
    ];

    for estimator in &mut estimators {
        estimator.fit(&x, &y).unwrap();
        let labels = estimator.predict(&x, ExecutionMode::Clear).unwrap();
        assert_eq!(labels, y);
    }
}

#[test]
fn test_compile_writes_debug_artifacts() {
    let (x, y) = four_points();
    let dir = tempfile::tempdir().unwrap();
    let config = CompileConfig::default()
        .with_show_mlir(true)
        .with_artifacts_dir(dir.path());

    let mut model = QuantizedTreeClassifier::new(4).with_max_depth(2);
    model.fit(&x, &y).unwrap();
    model.compile(&x, &SimulatedBackend::new(), &config).unwrap();

    let summary = std::fs::read_to_string(dir.path().join("compilation.txt")).unwrap();
    assert!(summary.contains("max bit width"));
}

#[test]
fn test_tight_bit_width_ceiling_rejected_and_state_unchanged() {
    let (x, y) = four_points();
    let mut model = QuantizedLinearRegressor::new(12);
    model.fit(&x, &y).unwrap();

    let config = CompileConfig::default().with_bit_width_ceiling(2);
    let result = model.compile(&x, &SimulatedBackend::new(), &config);
    assert!(matches!(result, Err(CipherMlError::BackendCompilation(_))));
    assert_eq!(model.state(), EstimatorState::Fitted);
}
