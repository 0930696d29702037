//! Integration tests for tree-to-tensor conversion and tree estimators

use cipherml::error::CipherMlError;
use cipherml::estimator::{
    Estimator, ExecutionMode, QuantizedForestClassifier, QuantizedTreeClassifier,
    QuantizedTreeRegressor,
};
use cipherml::models::DecisionTree;
use cipherml::tree::{TensorTreeEnsemble, MAX_TENSOR_DEPTH};
use ndarray::{array, Array1, Array2};

// ============================================================================
// Tensorized evaluation equals recursive branching
// ============================================================================

#[test]
fn test_depth2_tree_tensor_equals_recursive_at_4_bits() {
    // the four-point scenario: depth-2 tree, n_bits = 4
    let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let y = array![0.0, 0.0, 1.0, 1.0];

    let mut model = QuantizedTreeClassifier::new(4).with_max_depth(2);
    model.fit(&x, &y).unwrap();

    // recursive evaluation of the base tree on the quantized grid
    let base = model.base_model().unwrap();
    let q_x = array![[0.0, 0.0], [0.0, 15.0], [15.0, 0.0], [15.0, 15.0]];
    let recursive = base.predict(&q_x).unwrap();

    let tensorized = model.predict(&x, ExecutionMode::Clear).unwrap();
    assert_eq!(tensorized, recursive);
    assert_eq!(tensorized, y);
}

#[test]
fn test_tensor_ensemble_matches_recursive_over_grid() {
    // deeper tree, probing every point of the quantized input grid
    let n = 32;
    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
    let y = Array1::from_shape_fn(n, |i| if i < 10 || i >= 25 { 0.0 } else { 1.0 });

    let mut tree = DecisionTree::new_classifier().with_max_depth(5);
    tree.fit(&x, &y).unwrap();

    let ensemble = TensorTreeEnsemble::from_trees(&[&tree], 8).unwrap();
    let q_x = x.mapv(|v| v as i64);
    let scores = ensemble.evaluate(&q_x).unwrap();
    let deq = ensemble.dequantize(&scores);

    let recursive = tree.predict_scores(&x).unwrap();
    let tolerance = ensemble.output_quantizer().quantizer().scale;
    for i in 0..n {
        for j in 0..2 {
            assert!(
                (deq[[0, i, j]] - recursive[[i, j]]).abs() <= tolerance,
                "grid point {}: {} vs {}",
                i,
                deq[[0, i, j]],
                recursive[[i, j]]
            );
        }
    }
}

#[test]
fn test_threshold_on_grid_point_agrees_with_float() {
    // learned threshold lands exactly on an integer grid point; the <=
    // decision must agree between recursive and tensor paths
    let x = array![[0.0], [2.0], [4.0], [6.0], [8.0]];
    let y = array![0.0, 0.0, 1.0, 1.0, 1.0];

    let mut tree = DecisionTree::new_classifier().with_max_depth(2);
    tree.fit(&x, &y).unwrap();

    let ensemble = TensorTreeEnsemble::from_trees(&[&tree], 6).unwrap();
    let probe = array![[3.0], [2.0], [4.0]];
    let scores = ensemble.evaluate(&probe.mapv(|v| v as i64)).unwrap();
    let deq = ensemble.dequantize(&scores);
    let recursive = tree.predict_scores(&probe).unwrap();

    let tolerance = ensemble.output_quantizer().quantizer().scale;
    for i in 0..probe.nrows() {
        for j in 0..2 {
            assert!((deq[[0, i, j]] - recursive[[i, j]]).abs() <= tolerance);
        }
    }
}

// ============================================================================
// Structure limits
// ============================================================================

#[test]
fn test_deep_tree_rejected() {
    let n = 300;
    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
    let y = Array1::from_shape_fn(n, |i| (i % 2) as f64);

    let mut tree = DecisionTree::new_classifier();
    tree.fit(&x, &y).unwrap();
    assert!(tree.depth() > MAX_TENSOR_DEPTH);

    assert!(matches!(
        TensorTreeEnsemble::from_trees(&[&tree], 6),
        Err(CipherMlError::UnsupportedTreeStructure(_))
    ));
}

#[test]
fn test_mixed_arity_ensemble_rejected() {
    let x2 = array![[0.0, 0.0], [1.0, 1.0], [2.0, 0.0], [3.0, 1.0]];
    let x1 = array![[0.0], [1.0], [2.0], [3.0]];
    let y = array![0.0, 0.0, 1.0, 1.0];

    let mut a = DecisionTree::new_classifier();
    a.fit(&x2, &y).unwrap();
    let mut b = DecisionTree::new_classifier();
    b.fit(&x1, &y).unwrap();

    assert!(matches!(
        TensorTreeEnsemble::from_trees(&[&a, &b], 6),
        Err(CipherMlError::UnsupportedTreeStructure(_))
    ));
}

// ============================================================================
// Estimator behaviour
// ============================================================================

#[test]
fn test_tree_regressor_round_trip() {
    let x = array![[0.0], [1.0], [2.0], [10.0], [11.0], [12.0]];
    let y = array![2.0, 2.0, 2.0, -4.0, -4.0, -4.0];

    let mut model = QuantizedTreeRegressor::new(8).with_max_depth(2);
    model.fit(&x, &y).unwrap();

    let pred = model.predict(&x, ExecutionMode::Clear).unwrap();
    for (p, a) in pred.iter().zip(y.iter()) {
        assert!((p - a).abs() < 0.1, "{} vs {}", p, a);
    }
}

#[test]
fn test_forest_sums_tree_contributions() {
    let x = array![
        [0.0, 0.0],
        [0.1, 0.0],
        [0.0, 0.2],
        [1.0, 1.0],
        [0.9, 1.0],
        [1.0, 0.9]
    ];
    let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];

    let mut model = QuantizedForestClassifier::new(6, 7).with_random_state(29);
    model.fit(&x, &y).unwrap();

    let proba = model.predict_proba(&x, ExecutionMode::Clear).unwrap();
    // averaged distributions stay in [0, 1] up to quantization error
    let slack = 0.05;
    for &p in proba.iter() {
        assert!(p >= -slack && p <= 1.0 + slack, "probability {} out of range", p);
    }

    let predictions = model.predict(&x, ExecutionMode::Clear).unwrap();
    let correct = predictions
        .iter()
        .zip(y.iter())
        .filter(|(p, a)| p == a)
        .count();
    assert!(correct >= 5, "only {}/6 correct", correct);
}

#[test]
fn test_fit_benchmark_pair_agrees_on_easy_data() {
    let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let y = array![0.0, 0.0, 1.0, 1.0];

    let (model, reference) = QuantizedTreeClassifier::new(6)
        .with_max_depth(2)
        .fit_benchmark(&x, &y)
        .unwrap();

    let quantized = model.predict(&x, ExecutionMode::Clear).unwrap();
    let float = reference.predict(&x).unwrap();
    assert_eq!(quantized, float);
}
