//! Affine quantizer and calibrated quantized arrays
//!
//! `UniformQuantizer` is the stateless math: value <-> integer conversion
//! given scale, zero point and bit width. `QuantizedArray` owns a parameter
//! set derived from a calibration sample and applies it to arrays.

use crate::error::{CipherMlError, Result};
use ndarray::{Array, ArrayBase, ArrayD, Data, Dimension};
use serde::{Deserialize, Serialize};

/// Value <-> integer conversion behind one interface, so callers can hold
/// per-feature quantizers and module quantizers uniformly.
pub trait Quantizable {
    /// Quantize values with the fixed parameters
    fn quant_values(&self, values: &ArrayD<f64>) -> ArrayD<i64>;

    /// Dequantize integers with the fixed parameters
    fn dequant_values(&self, qvalues: &ArrayD<i64>) -> ArrayD<f64>;
}

/// Stateless affine quantizer: `q = round(v / scale) + zero_point`, clamped
/// to the representable range of `n_bits`/`is_signed`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UniformQuantizer {
    /// Bit width of the integer representation
    pub n_bits: u32,
    /// Whether the integer range is signed
    pub is_signed: bool,
    /// Quantization step, strictly positive
    pub scale: f64,
    /// Integer offset such that the calibration minimum maps to `qmin`
    pub zero_point: i64,
}

impl UniformQuantizer {
    /// Representable integer range for a bit width
    pub fn representable_range(n_bits: u32, is_signed: bool) -> (i64, i64) {
        if is_signed {
            let half = 1i64 << (n_bits - 1);
            (-half, half - 1)
        } else {
            (0, (1i64 << n_bits) - 1)
        }
    }

    /// Derive quantization parameters from an observed value range.
    ///
    /// The scale spans the range over `2^n_bits - 1` steps and the zero point
    /// is chosen so that `min` maps to the minimum representable integer.
    pub fn from_range(min: f64, max: f64, n_bits: u32, is_signed: bool) -> Result<Self> {
        if n_bits == 0 || n_bits > 32 {
            return Err(CipherMlError::Validation(format!(
                "bit width {} is outside the supported 1..=32 range",
                n_bits
            )));
        }
        if max == min {
            return Err(CipherMlError::DegenerateRange(min));
        }
        let (qmin, _) = Self::representable_range(n_bits, is_signed);
        let scale = (max - min) / ((1i64 << n_bits) - 1) as f64;
        let zero_point = qmin - (min / scale).round() as i64;
        Ok(Self {
            n_bits,
            is_signed,
            scale,
            zero_point,
        })
    }

    /// Fallback parameters for a degenerate (single-valued) range: a minimal
    /// nonzero scale of 1.0, with the constant still mapping into range.
    pub fn degenerate(value: f64, n_bits: u32, is_signed: bool) -> Self {
        let (qmin, _) = Self::representable_range(n_bits, is_signed);
        Self {
            n_bits,
            is_signed,
            scale: 1.0,
            zero_point: qmin - value.round() as i64,
        }
    }

    /// Minimum representable integer
    pub fn qmin(&self) -> i64 {
        Self::representable_range(self.n_bits, self.is_signed).0
    }

    /// Maximum representable integer
    pub fn qmax(&self) -> i64 {
        Self::representable_range(self.n_bits, self.is_signed).1
    }

    /// Quantize a single value
    pub fn quant(&self, value: f64) -> i64 {
        let q = (value / self.scale).round() as i64 + self.zero_point;
        q.clamp(self.qmin(), self.qmax())
    }

    /// Dequantize a single value, the exact inverse affine map
    pub fn dequant(&self, q: i64) -> f64 {
        (q - self.zero_point) as f64 * self.scale
    }

    /// Quantize an array of any dimensionality
    pub fn quant_array<S, D>(&self, values: &ArrayBase<S, D>) -> Array<i64, D>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        values.map(|&v| self.quant(v))
    }

    /// Dequantize an array of any dimensionality
    pub fn dequant_array<S, D>(&self, qvalues: &ArrayBase<S, D>) -> Array<f64, D>
    where
        S: Data<Elem = i64>,
        D: Dimension,
    {
        qvalues.map(|&q| self.dequant(q))
    }
}

impl Quantizable for UniformQuantizer {
    fn quant_values(&self, values: &ArrayD<f64>) -> ArrayD<i64> {
        self.quant_array(values)
    }

    fn dequant_values(&self, qvalues: &ArrayD<i64>) -> ArrayD<f64> {
        self.dequant_array(qvalues)
    }
}

/// A calibrated array: quantization parameters derived once from a
/// calibration sample, applied to that sample and to any later inputs.
///
/// The original values are kept so a compilation input set can be rebuilt
/// from a snapshot; the parameters are never re-derived after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizedArray {
    quantizer: UniformQuantizer,
    values: ArrayD<f64>,
    qvalues: ArrayD<i64>,
}

impl QuantizedArray {
    /// Calibrate a quantizer from `values` and quantize them.
    ///
    /// A degenerate range (all values equal) substitutes the minimal nonzero
    /// scale instead of failing; `UniformQuantizer::from_range` stays the
    /// strict variant for callers that must observe the error.
    pub fn new(n_bits: u32, values: ArrayD<f64>, is_signed: bool) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let quantizer = if values.is_empty() {
            UniformQuantizer::degenerate(0.0, n_bits, is_signed)
        } else {
            match UniformQuantizer::from_range(min, max, n_bits, is_signed) {
                Ok(q) => q,
                Err(_) => {
                    tracing::debug!(value = min, "degenerate calibration range, substituting unit scale");
                    UniformQuantizer::degenerate(min, n_bits, is_signed)
                }
            }
        };
        let qvalues = quantizer.quant_array(&values);
        Self {
            quantizer,
            values,
            qvalues,
        }
    }

    /// The fixed quantization parameters
    pub fn quantizer(&self) -> &UniformQuantizer {
        &self.quantizer
    }

    /// Original calibration values
    pub fn values(&self) -> &ArrayD<f64> {
        &self.values
    }

    /// Quantized integer values
    pub fn qvalues(&self) -> &ArrayD<i64> {
        &self.qvalues
    }

    /// Bit width of the underlying quantizer
    pub fn n_bits(&self) -> u32 {
        self.quantizer.n_bits
    }

    /// Re-quantize new data using the existing parameters.
    ///
    /// Never recalibrates: the scale and zero point stay fixed, so repeated
    /// calls with the same input yield identical qvalues.
    pub fn update_values(&mut self, new_values: ArrayD<f64>) -> &ArrayD<i64> {
        self.qvalues = self.quantizer.quant_array(&new_values);
        self.values = new_values;
        &self.qvalues
    }

    /// Replace the integer values with raw results from an integer
    /// computation and dequantize them through the fixed parameters.
    pub fn update_quantized_values(&mut self, qvalues: ArrayD<i64>) -> &ArrayD<f64> {
        self.values = self.quantizer.dequant_array(&qvalues);
        self.qvalues = qvalues;
        &self.values
    }

    /// Dequantize the currently held integer values
    pub fn dequant(&self) -> ArrayD<f64> {
        self.quantizer.dequant_array(&self.qvalues)
    }
}

impl Quantizable for QuantizedArray {
    fn quant_values(&self, values: &ArrayD<f64>) -> ArrayD<i64> {
        self.quantizer.quant_array(values)
    }

    fn dequant_values(&self, qvalues: &ArrayD<i64>) -> ArrayD<f64> {
        self.quantizer.dequant_array(qvalues)
    }
}
