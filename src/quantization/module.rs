//! Quantized module: a model's forward computation as integer operations
//!
//! The module owns the input quantizers, the integer op pipeline, and the
//! compiled-circuit handle once a backend has accepted the program. Exactly
//! one output quantizer defines the dequantization of raw integer results.

use crate::backend::{Circuit, CircuitFn, CompilationBackend, CompileConfig};
use crate::error::{CipherMlError, Result};
use crate::quantization::{QuantizedArray, UniformQuantizer};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Ix2};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One integer affine layer: quantized weights, float bias folded into the
/// requantization step, and the output quantizer calibrated on activations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedGemm {
    q_weights: QuantizedArray,
    bias: Array1<f64>,
    q_out: QuantizedArray,
}

impl QuantizedGemm {
    /// Build a layer, validating that the weights are a 2-D tensor matching
    /// the bias arity.
    pub fn new(q_weights: QuantizedArray, bias: Array1<f64>, q_out: QuantizedArray) -> Result<Self> {
        let shape = q_weights.qvalues().shape().to_vec();
        if shape.len() != 2 {
            return Err(CipherMlError::Shape {
                expected: "2-D weight tensor".to_string(),
                actual: format!("{}-D tensor", shape.len()),
            });
        }
        if bias.len() != shape[1] {
            return Err(CipherMlError::Shape {
                expected: format!("bias of length {}", shape[1]),
                actual: format!("length {}", bias.len()),
            });
        }
        Ok(Self {
            q_weights,
            bias,
            q_out,
        })
    }

    /// Quantized weight tensor
    pub fn q_weights(&self) -> &QuantizedArray {
        &self.q_weights
    }

    /// Output quantizer of this layer
    pub fn q_out(&self) -> &QuantizedArray {
        &self.q_out
    }

    fn weight_matrix(&self) -> Result<ArrayView2<'_, i64>> {
        self.q_weights
            .qvalues()
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| CipherMlError::Computation(format!("weight tensor is not 2-D: {}", e)))
    }
}

/// The executable integer program: input quantizer plus Gemm pipeline.
///
/// Separated from [`QuantizedModule`] so a clone can be captured by the
/// circuit function handed to a compilation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegerPipeline {
    input_quantizer: UniformQuantizer,
    ops: Vec<QuantizedGemm>,
}

impl IntegerPipeline {
    /// Number of output columns produced by the last layer
    pub fn n_outputs(&self) -> usize {
        self.ops.last().map(|op| op.bias.len()).unwrap_or(0)
    }

    /// Integer-only forward pass over a quantized batch.
    ///
    /// Each layer runs an i64 multiply-accumulate over zero-point-centered
    /// operands, then rescales with the accumulated input and weight scales
    /// and requantizes into the layer's output range. Deterministic and
    /// reproducible for identical quantized inputs.
    pub fn forward(&self, q_x: &Array2<i64>) -> Result<Array2<i64>> {
        let mut current = q_x.to_owned();
        let mut in_q = self.input_quantizer;
        for op in &self.ops {
            let w_q = *op.q_weights.quantizer();
            let weights = op.weight_matrix()?;
            if current.ncols() != weights.nrows() {
                return Err(CipherMlError::Shape {
                    expected: format!("{} input columns", weights.nrows()),
                    actual: format!("{} columns", current.ncols()),
                });
            }

            let centered_x = current.mapv(|q| q - in_q.zero_point);
            let centered_w = weights.map(|&q| q - w_q.zero_point);
            let acc = centered_x.dot(&centered_w);

            let out_q = *op.q_out.quantizer();
            let rescale = in_q.scale * w_q.scale;
            let mut next = Array2::<i64>::zeros(acc.dim());
            for ((i, j), &a) in acc.indexed_iter() {
                next[[i, j]] = out_q.quant(rescale * a as f64 + op.bias[j]);
            }
            current = next;
            in_q = out_q;
        }
        Ok(current)
    }

    /// Forward pass over a single quantized sample
    pub fn forward_sample(&self, q_x: ArrayView1<i64>) -> Result<Array1<i64>> {
        let row = q_x
            .to_owned()
            .into_shape_with_order((1, q_x.len()))
            .map_err(|e| CipherMlError::Shape {
                expected: "1-D sample".to_string(),
                actual: e.to_string(),
            })?;
        let out = self.forward(&row)?;
        Ok(out.row(0).to_owned())
    }
}

/// A whole model's forward computation as integer operations, with the
/// quantization parameters needed at its boundary and an optional compiled
/// circuit.
pub struct QuantizedModule {
    q_inputs: Vec<QuantizedArray>,
    pipeline: IntegerPipeline,
    circuit: Option<Box<dyn Circuit>>,
}

impl std::fmt::Debug for QuantizedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedModule")
            .field("n_inputs", &self.q_inputs.len())
            .field("n_ops", &self.pipeline.ops.len())
            .field("is_compiled", &self.circuit.is_some())
            .finish()
    }
}

impl QuantizedModule {
    /// Assemble a module from calibrated input arrays and an integer
    /// pipeline. Requires at least one input and one op.
    pub fn new(q_inputs: Vec<QuantizedArray>, ops: Vec<QuantizedGemm>) -> Result<Self> {
        let first = q_inputs
            .first()
            .ok_or(CipherMlError::UncalibratedModel)?;
        if ops.is_empty() {
            return Err(CipherMlError::UncalibratedModel);
        }
        let pipeline = IntegerPipeline {
            input_quantizer: *first.quantizer(),
            ops,
        };
        Ok(Self {
            q_inputs,
            pipeline,
            circuit: None,
        })
    }

    /// Calibrated input arrays, in input order
    pub fn q_inputs(&self) -> &[QuantizedArray] {
        &self.q_inputs
    }

    /// The single output quantizer defining result dequantization
    pub fn q_output(&self) -> &QuantizedArray {
        // non-empty by construction
        &self.pipeline.ops[self.pipeline.ops.len() - 1].q_out
    }

    /// The executable integer program
    pub fn pipeline(&self) -> &IntegerPipeline {
        &self.pipeline
    }

    /// Quantize raw inputs with the fixed input parameters; never
    /// recalibrates.
    pub fn quantize_input(&self, x: &Array2<f64>) -> Result<Array2<i64>> {
        let expected = self.q_inputs[0]
            .qvalues()
            .shape()
            .get(1)
            .copied()
            .unwrap_or(x.ncols());
        if x.ncols() != expected {
            return Err(CipherMlError::Shape {
                expected: format!("{} feature columns", expected),
                actual: format!("{} columns", x.ncols()),
            });
        }
        Ok(self.pipeline.input_quantizer.quant_array(x))
    }

    /// Dequantize raw integer results through the output quantizer
    pub fn dequantize_output(&self, q_y: &Array2<i64>) -> Array2<f64> {
        self.q_output().quantizer().dequant_array(q_y)
    }

    /// Integer forward pass over a quantized batch
    pub fn forward(&self, q_x: &Array2<i64>) -> Result<Array2<i64>> {
        self.pipeline.forward(q_x)
    }

    /// Forward pass followed by output dequantization
    pub fn forward_and_dequant(&self, q_x: &Array2<i64>) -> Result<Array2<f64>> {
        let q_y = self.pipeline.forward(q_x)?;
        Ok(self.dequantize_output(&q_y))
    }

    /// Hand the integer program and a representative quantized input set to
    /// the backend; store the returned circuit on success.
    pub fn compile(
        &mut self,
        backend: &dyn CompilationBackend,
        q_inputset: &Array2<i64>,
        config: &CompileConfig,
    ) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let function: CircuitFn = Arc::new(move |sample| pipeline.forward_sample(sample));
        let circuit = backend.compile(function, q_inputset, config)?;
        tracing::info!(n_outputs = circuit.n_outputs(), "module compiled");
        self.circuit = Some(circuit);
        Ok(())
    }

    /// Whether a backend has accepted the program
    pub fn is_compiled(&self) -> bool {
        self.circuit.is_some()
    }

    /// Run the compiled circuit over a quantized batch, one blocking backend
    /// call per sample, preserving row order.
    pub fn run_backend(&self, q_x: &Array2<i64>) -> Result<Array2<i64>> {
        let circuit = self.circuit.as_deref().ok_or(CipherMlError::NotCompiled)?;
        let n_outputs = self.pipeline.n_outputs();
        let mut out = Array2::<i64>::zeros((q_x.nrows(), n_outputs));
        for (i, row) in q_x.outer_iter().enumerate() {
            let q_pred = circuit.encrypt_run_decrypt(row)?;
            if q_pred.len() != n_outputs {
                return Err(CipherMlError::BackendCompilation(format!(
                    "circuit returned {} outputs, expected {}",
                    q_pred.len(),
                    n_outputs
                )));
            }
            out.row_mut(i).assign(&q_pred);
        }
        Ok(out)
    }
}
