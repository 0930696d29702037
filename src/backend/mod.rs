//! Compilation backend contract
//!
//! The encrypted-computation backend is an external collaborator: it
//! receives an integer program plus a representative quantized input set and
//! returns a compiled circuit. [`SimulatedBackend`] executes the program in
//! the clear with the same contract, so compilation and backend-execution
//! semantics are testable without a homomorphic engine.

use crate::error::{CipherMlError, Result};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// The integer program handed to a backend, evaluated per single sample
pub type CircuitFn = Arc<dyn Fn(ArrayView1<i64>) -> Result<Array1<i64>> + Send + Sync>;

/// A compiled circuit returned by a backend
pub trait Circuit: Send + Sync {
    /// Run one encrypted inference over a single quantized sample
    fn encrypt_run_decrypt(&self, sample: ArrayView1<i64>) -> Result<Array1<i64>>;

    /// Arity of the single integer output
    fn n_outputs(&self) -> usize;

    /// Widest integer the circuit was observed to produce during compilation
    fn max_bit_width(&self) -> u32;
}

/// A backend that can compile an integer program into a circuit
pub trait CompilationBackend {
    /// Compile `function` against a representative quantized input set.
    ///
    /// Blocks until the backend returns a circuit or an error; callers that
    /// need bounded latency must wrap the call themselves.
    fn compile(
        &self,
        function: CircuitFn,
        inputset: &Array2<i64>,
        config: &CompileConfig,
    ) -> Result<Box<dyn Circuit>>;
}

/// Configuration passed to a compilation backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Maximum integer bit width the backend will accept
    pub bit_width_ceiling: u32,
    /// Error-tolerance knob forwarded to the backend
    pub p_error: f64,
    /// Dump the lowered program representation while compiling
    pub show_mlir: bool,
    /// Directory receiving debug artifacts, none by default
    pub artifacts_dir: Option<PathBuf>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            bit_width_ceiling: 32,
            p_error: 1e-5,
            show_mlir: false,
            artifacts_dir: None,
        }
    }
}

impl CompileConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum accepted integer bit width
    pub fn with_bit_width_ceiling(mut self, bits: u32) -> Self {
        self.bit_width_ceiling = bits;
        self
    }

    /// Set the error-tolerance knob
    pub fn with_p_error(mut self, p_error: f64) -> Self {
        self.p_error = p_error;
        self
    }

    /// Enable dumping the lowered program representation
    pub fn with_show_mlir(mut self, show: bool) -> Self {
        self.show_mlir = show;
        self
    }

    /// Set the debug-artifact sink directory
    pub fn with_artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }
}

/// Clear-execution backend with the real compilation contract.
///
/// Evaluates the program over the whole input set at compile time to bound
/// the integer widths actually reached, and rejects programs that exceed the
/// configured ceiling or do not produce a single fixed-arity integer output.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedBackend;

impl SimulatedBackend {
    /// Create a simulated backend
    pub fn new() -> Self {
        Self
    }
}

fn bit_width_of(value: i64) -> u32 {
    // one sign bit plus magnitude bits
    64 - value.unsigned_abs().leading_zeros() + 1
}

impl CompilationBackend for SimulatedBackend {
    fn compile(
        &self,
        function: CircuitFn,
        inputset: &Array2<i64>,
        config: &CompileConfig,
    ) -> Result<Box<dyn Circuit>> {
        if inputset.nrows() == 0 {
            return Err(CipherMlError::Validation(
                "compilation input set is empty".to_string(),
            ));
        }

        let mut n_outputs = None;
        let mut max_bits = 0u32;
        for row in inputset.outer_iter() {
            let out = function(row)?;
            match n_outputs {
                None => {
                    if out.is_empty() {
                        return Err(CipherMlError::BackendCompilation(
                            "program produced no output".to_string(),
                        ));
                    }
                    n_outputs = Some(out.len());
                }
                Some(arity) if arity != out.len() => {
                    return Err(CipherMlError::BackendCompilation(format!(
                        "output arity varies across samples: {} vs {}",
                        arity,
                        out.len()
                    )));
                }
                _ => {}
            }
            for &v in out.iter() {
                max_bits = max_bits.max(bit_width_of(v));
            }
        }
        let n_outputs = n_outputs.unwrap_or(0);

        if max_bits > config.bit_width_ceiling {
            return Err(CipherMlError::BackendCompilation(format!(
                "program needs {} bits, ceiling is {}",
                max_bits, config.bit_width_ceiling
            )));
        }

        if config.show_mlir {
            tracing::debug!(
                n_outputs,
                max_bits,
                n_samples = inputset.nrows(),
                "simulated circuit lowering"
            );
        }
        if let Some(dir) = &config.artifacts_dir {
            std::fs::create_dir_all(dir)?;
            let summary = format!(
                "simulated circuit\ninputs: {}\noutputs: {}\nmax bit width: {}\np_error: {}\n",
                inputset.ncols(),
                n_outputs,
                max_bits,
                config.p_error
            );
            std::fs::write(dir.join("compilation.txt"), summary)?;
        }

        tracing::info!(n_outputs, max_bits, "simulated compilation accepted");
        Ok(Box::new(SimulatedCircuit {
            function,
            n_outputs,
            max_bits,
        }))
    }
}

/// Circuit produced by [`SimulatedBackend`], executing in the clear
pub struct SimulatedCircuit {
    function: CircuitFn,
    n_outputs: usize,
    max_bits: u32,
}

impl std::fmt::Debug for SimulatedCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedCircuit")
            .field("n_outputs", &self.n_outputs)
            .field("max_bits", &self.max_bits)
            .finish()
    }
}

impl Circuit for SimulatedCircuit {
    fn encrypt_run_decrypt(&self, sample: ArrayView1<i64>) -> Result<Array1<i64>> {
        (self.function)(sample)
    }

    fn n_outputs(&self) -> usize {
        self.n_outputs
    }

    fn max_bit_width(&self) -> u32 {
        self.max_bits
    }
}
