//! Quantization Module
//!
//! Affine quantization of continuous values into fixed-bit integers with
//! exact, invertible round-trip semantics, plus post-training quantization
//! of floating computation graphs into integer-only modules.

mod module;
mod post_training;
mod quantizer;

pub use module::{IntegerPipeline, QuantizedGemm, QuantizedModule};
pub use post_training::{BitWidths, PostTrainingAffineQuantizer};
pub use quantizer::{Quantizable, QuantizedArray, UniformQuantizer};
