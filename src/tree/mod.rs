//! Tree-ensemble to tensor conversion
//!
//! Compiles fitted decision trees into fixed-shape integer tensor programs
//! that evaluate every branch and select leaves arithmetically, so a backend
//! without data-dependent control flow can run them.

mod tensor;

pub use tensor::{TensorTree, TensorTreeEnsemble, MAX_TENSOR_DEPTH};
