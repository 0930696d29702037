//! Base floating-point trainers
//!
//! Plain float models standing in for the external estimator: the
//! quantization layers consume their fitted parameters and decision
//! structures, and `fit_benchmark` trains them on raw floats as unquantized
//! references.

pub mod decision_tree;
pub mod linear;
pub mod random_forest;

pub use decision_tree::{Criterion, DecisionTree, TreeNode};
pub use linear::{LinearRegression, LogisticRegression};
pub use random_forest::RandomForest;
