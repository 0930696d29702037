//! Post-training affine quantization
//!
//! Turns a trained floating computation graph plus a representative
//! calibration dataset into an integer-only quantized module.

use crate::error::{CipherMlError, Result};
use crate::graph::{FloatGraph, GraphOp};
use crate::quantization::{QuantizedArray, QuantizedGemm, QuantizedModule};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Per-tensor bit widths for inputs, weights and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitWidths {
    /// Any input data to any layer
    pub inputs: u32,
    /// Learned parameters or constants
    pub weights: u32,
    /// Activations and the final model output
    pub outputs: u32,
}

impl BitWidths {
    /// Uniform bit width across inputs, weights and outputs
    pub fn uniform(n_bits: u32) -> Self {
        Self {
            inputs: n_bits,
            weights: n_bits,
            outputs: n_bits,
        }
    }
}

impl From<u32> for BitWidths {
    fn from(n_bits: u32) -> Self {
        Self::uniform(n_bits)
    }
}

impl Default for BitWidths {
    fn default() -> Self {
        Self::uniform(8)
    }
}

/// Post-training quantizer for floating computation graphs.
///
/// Walks the graph in execution order, calibrates a [`QuantizedArray`] per
/// input, weight and activation tensor by running float forward passes over
/// the calibration dataset, and rewrites every floating operator into its
/// integer equivalent.
#[derive(Debug, Clone)]
pub struct PostTrainingAffineQuantizer {
    n_bits: BitWidths,
    graph: FloatGraph,
    is_signed: bool,
}

impl PostTrainingAffineQuantizer {
    /// Create a quantizer for a floating graph.
    ///
    /// `is_signed` selects the integer range for weights and activations;
    /// inputs always quantize to the unsigned range, the affine zero point
    /// absorbs any negative offset.
    pub fn new(n_bits: impl Into<BitWidths>, graph: FloatGraph, is_signed: bool) -> Self {
        Self {
            n_bits: n_bits.into(),
            graph,
            is_signed,
        }
    }

    /// Calibrate on a dataset and produce the integer-only module.
    ///
    /// Ops with no integer equivalent are elided before calibration; the
    /// remaining pipeline must contain at least one integer operator.
    pub fn quantize_module(&self, calibration: &Array2<f64>) -> Result<QuantizedModule> {
        if calibration.nrows() == 0 {
            return Err(CipherMlError::Validation(
                "calibration dataset is empty".to_string(),
            ));
        }
        if calibration.ncols() != self.graph.n_features() {
            return Err(CipherMlError::Shape {
                expected: format!("{} feature columns", self.graph.n_features()),
                actual: format!("{} columns", calibration.ncols()),
            });
        }

        let mut graph = self.graph.clone();
        graph.simplify();

        let q_input = QuantizedArray::new(
            self.n_bits.inputs,
            calibration.to_owned().into_dyn(),
            false,
        );

        let mut activations = calibration.to_owned();
        let mut ops = Vec::new();
        for op in graph.ops() {
            match op {
                GraphOp::Gemm { weights, bias } => {
                    let q_weights = QuantizedArray::new(
                        self.n_bits.weights,
                        weights.to_owned().into_dyn(),
                        self.is_signed,
                    );
                    activations = activations.dot(weights) + bias;
                    let q_out = QuantizedArray::new(
                        self.n_bits.outputs,
                        activations.to_owned().into_dyn(),
                        self.is_signed,
                    );
                    ops.push(QuantizedGemm::new(q_weights, bias.to_owned(), q_out)?);
                }
                // simplify() removed everything else
                _ => {}
            }
        }

        if ops.is_empty() {
            return Err(CipherMlError::Validation(
                "graph has no integer operations after simplification".to_string(),
            ));
        }

        tracing::debug!(
            n_ops = ops.len(),
            n_calibration = calibration.nrows(),
            "calibrated quantized module"
        );
        QuantizedModule::new(vec![q_input], ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn linear_graph() -> FloatGraph {
        let mut graph = FloatGraph::new(2);
        graph
            .push(GraphOp::Gemm {
                weights: array![[2.0], [-1.0]],
                bias: array![0.25],
            })
            .unwrap();
        graph.push(GraphOp::Cast).unwrap();
        graph
    }

    #[test]
    fn test_bit_widths_from_u32() {
        let bits: BitWidths = 6.into();
        assert_eq!(bits.inputs, 6);
        assert_eq!(bits.weights, 6);
        assert_eq!(bits.outputs, 6);
    }

    #[test]
    fn test_quantize_module_matches_float_forward() {
        let calibration = array![[0.0, 0.0], [1.0, 0.5], [0.5, 1.0], [1.0, 1.0]];
        let ptq = PostTrainingAffineQuantizer::new(8, linear_graph(), true);
        let module = ptq.quantize_module(&calibration).unwrap();

        let q_x = module.quantize_input(&calibration).unwrap();
        let quantized_out = module.forward_and_dequant(&q_x).unwrap();

        let mut float_graph = linear_graph();
        float_graph.simplify();
        let float_out = float_graph.forward(&calibration).unwrap();

        let tolerance = 4.0 * module.q_output().quantizer().scale;
        for (q, f) in quantized_out.iter().zip(float_out.iter()) {
            assert!((q - f).abs() <= tolerance, "|{} - {}| > {}", q, f, tolerance);
        }
    }

    #[test]
    fn test_empty_calibration_rejected() {
        let ptq = PostTrainingAffineQuantizer::new(8, linear_graph(), true);
        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(
            ptq.quantize_module(&empty),
            Err(CipherMlError::Validation(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let ptq = PostTrainingAffineQuantizer::new(8, linear_graph(), true);
        let wrong = array![[1.0, 2.0, 3.0]];
        assert!(matches!(
            ptq.quantize_module(&wrong),
            Err(CipherMlError::Shape { .. })
        ));
    }

    #[test]
    fn test_graph_without_integer_ops_rejected() {
        let mut graph = FloatGraph::new(2);
        graph.push(GraphOp::Softmax).unwrap();
        let ptq = PostTrainingAffineQuantizer::new(8, graph, true);
        let calibration = array![[0.0, 1.0]];
        assert!(matches!(
            ptq.quantize_module(&calibration),
            Err(CipherMlError::Validation(_))
        ));
    }
}
