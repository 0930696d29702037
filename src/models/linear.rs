//! Linear model trainers

use crate::error::{CipherMlError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Solve the symmetric positive-definite system `A x = b` by Cholesky
/// decomposition, retrying once with a small ridge on the diagonal when the
/// matrix is not positive definite.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>> {
    match try_cholesky(a, b) {
        Some(x) => Ok(x),
        None => {
            let n = a.nrows();
            let ridge = 1e-8 * a.diag().iter().map(|v| v.abs()).sum::<f64>().max(1.0) / n as f64;
            let mut a_reg = a.clone();
            for k in 0..n {
                a_reg[[k, k]] += ridge;
            }
            try_cholesky(&a_reg, b).ok_or_else(|| {
                CipherMlError::Computation(
                    "normal equations are singular even with ridge regularization".to_string(),
                )
            })
        }
    }
}

fn try_cholesky(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // forward substitution: L y = b
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // backward substitution: L^T x = y
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Some(x)
}

/// Linear regression fitted by normal equations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRegression {
    coefficients: Option<Array1<f64>>,
    intercept: Option<f64>,
    /// Whether to fit an intercept
    pub fit_intercept: bool,
    /// L2 regularization strength
    pub alpha: f64,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearRegression {
    /// Create a new linear regression model
    pub fn new() -> Self {
        Self {
            coefficients: None,
            intercept: None,
            fit_intercept: true,
            alpha: 0.0,
        }
    }

    /// Enable/disable fitting the intercept
    pub fn with_fit_intercept(mut self, fit_intercept: bool) -> Self {
        self.fit_intercept = fit_intercept;
        self
    }

    /// Set L2 regularization strength (ridge regression)
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// A fresh untrained model with the same hyperparameters
    pub fn fresh(&self) -> Self {
        Self::new()
            .with_fit_intercept(self.fit_intercept)
            .with_alpha(self.alpha)
    }

    /// Fit by solving `(X^T X + alpha I) w = X^T y`
    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<&mut Self> {
        let n_samples = x.nrows();
        let n_features = x.ncols();
        if n_samples != y.len() {
            return Err(CipherMlError::Shape {
                expected: format!("y length = {}", n_samples),
                actual: format!("y length = {}", y.len()),
            });
        }
        if n_samples == 0 {
            return Err(CipherMlError::Validation(
                "cannot fit on an empty dataset".to_string(),
            ));
        }

        let (x_centered, y_centered, x_mean, y_mean) = if self.fit_intercept {
            let x_mean = x.mean_axis(Axis(0)).ok_or_else(|| {
                CipherMlError::Computation("mean of empty axis".to_string())
            })?;
            let y_mean = y.mean().unwrap_or(0.0);
            let x_centered = x - &x_mean.clone().insert_axis(Axis(0));
            let y_centered = y - y_mean;
            (x_centered, y_centered, Some(x_mean), Some(y_mean))
        } else {
            (x.clone(), y.clone(), None, None)
        };

        let mut xtx = x_centered.t().dot(&x_centered);
        if self.alpha > 0.0 {
            for i in 0..n_features {
                xtx[[i, i]] += self.alpha;
            }
        }
        let xty = x_centered.t().dot(&y_centered);
        let coefficients = cholesky_solve(&xtx, &xty)?;

        let intercept = match (x_mean, y_mean) {
            (Some(x_mean), Some(y_mean)) => y_mean - coefficients.dot(&x_mean),
            _ => 0.0,
        };

        self.coefficients = Some(coefficients);
        self.intercept = Some(intercept);
        Ok(self)
    }

    /// Make predictions
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let coefficients = self
            .coefficients
            .as_ref()
            .ok_or(CipherMlError::UncalibratedModel)?;
        let intercept = self.intercept.unwrap_or(0.0);
        Ok(x.dot(coefficients) + intercept)
    }

    /// Fitted coefficients, if the model is trained
    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coefficients.as_ref()
    }

    /// Fitted intercept, if the model is trained
    pub fn intercept(&self) -> Option<f64> {
        self.intercept
    }
}

/// Binary logistic regression fitted by gradient descent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    coefficients: Option<Array1<f64>>,
    intercept: Option<f64>,
    /// L2 regularization strength
    pub alpha: f64,
    /// Maximum gradient-descent iterations
    pub max_iter: usize,
    /// Convergence tolerance on the coefficient update norm
    pub tol: f64,
    /// Learning rate
    pub learning_rate: f64,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LogisticRegression {
    /// Create a new logistic regression model
    pub fn new() -> Self {
        Self {
            coefficients: None,
            intercept: None,
            alpha: 0.01,
            max_iter: 1000,
            tol: 1e-6,
            learning_rate: 0.1,
        }
    }

    /// Set L2 regularization strength
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set maximum iterations
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set learning rate
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// A fresh untrained model with the same hyperparameters
    pub fn fresh(&self) -> Self {
        let mut model = Self::new().with_alpha(self.alpha).with_max_iter(self.max_iter);
        model = model.with_learning_rate(self.learning_rate);
        model.tol = self.tol;
        model
    }

    fn sigmoid(z: &Array1<f64>) -> Array1<f64> {
        z.mapv(|v| 1.0 / (1.0 + (-v).exp()))
    }

    /// Fit on binary targets in `{0, 1}`
    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>) -> Result<&mut Self> {
        let n_samples = x.nrows();
        let n_features = x.ncols();
        if n_samples != y.len() {
            return Err(CipherMlError::Shape {
                expected: format!("y length = {}", n_samples),
                actual: format!("y length = {}", y.len()),
            });
        }
        if y.iter().any(|&t| t != 0.0 && t != 1.0) {
            return Err(CipherMlError::Validation(
                "logistic regression targets must be 0 or 1".to_string(),
            ));
        }

        let mut w = Array1::<f64>::zeros(n_features);
        let mut b = 0.0f64;
        let n = n_samples as f64;

        for _ in 0..self.max_iter {
            let z = x.dot(&w) + b;
            let p = Self::sigmoid(&z);
            let residual = &p - y;

            let grad_w = x.t().dot(&residual) / n + self.alpha * &w;
            let grad_b = residual.sum() / n;

            w = w - self.learning_rate * &grad_w;
            b -= self.learning_rate * grad_b;

            let update_norm = grad_w.mapv(|g| g * g).sum().sqrt() * self.learning_rate;
            if update_norm < self.tol {
                break;
            }
        }

        self.coefficients = Some(w);
        self.intercept = Some(b);
        Ok(self)
    }

    /// Raw decision values `x . w + b`
    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let coefficients = self
            .coefficients
            .as_ref()
            .ok_or(CipherMlError::UncalibratedModel)?;
        Ok(x.dot(coefficients) + self.intercept.unwrap_or(0.0))
    }

    /// Probability of the positive class
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let z = self.decision_function(x)?;
        Ok(Self::sigmoid(&z))
    }

    /// Predict binary labels
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let p = self.predict_proba(x)?;
        Ok(p.mapv(|v| if v >= 0.5 { 1.0 } else { 0.0 }))
    }

    /// Fitted coefficients, if the model is trained
    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coefficients.as_ref()
    }

    /// Fitted intercept, if the model is trained
    pub fn intercept(&self) -> Option<f64> {
        self.intercept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_linear_regression_exact_line() {
        let x = array![[1.0], [2.0], [3.0], [4.0]];
        let y = array![3.0, 5.0, 7.0, 9.0];

        let mut model = LinearRegression::new();
        model.fit(&x, &y).unwrap();

        let coef = model.coefficients().unwrap();
        assert!((coef[0] - 2.0).abs() < 1e-8);
        assert!((model.intercept().unwrap() - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_linear_regression_predict() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [2.0, 2.0]];
        let y = array![1.0, 2.0, 3.0, 6.0];

        let mut model = LinearRegression::new();
        model.fit(&x, &y).unwrap();
        let pred = model.predict(&x).unwrap();
        for (p, a) in pred.iter().zip(y.iter()) {
            assert!((p - a).abs() < 1e-6);
        }
    }

    #[test]
    fn test_logistic_separable() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![0.0, 0.0, 1.0, 1.0];

        let mut model = LogisticRegression::new().with_max_iter(5000);
        model.fit(&x, &y).unwrap();
        let pred = model.predict(&x).unwrap();
        assert_eq!(pred, y);
    }

    #[test]
    fn test_logistic_rejects_non_binary() {
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 2.0];
        let mut model = LogisticRegression::new();
        assert!(matches!(
            model.fit(&x, &y),
            Err(CipherMlError::Validation(_))
        ));
    }

    #[test]
    fn test_unfitted_predict_errors() {
        let model = LinearRegression::new();
        assert!(matches!(
            model.predict(&array![[1.0]]),
            Err(CipherMlError::UncalibratedModel)
        ));
    }

    #[test]
    fn test_fresh_keeps_hyperparameters() {
        let model = LinearRegression::new().with_alpha(0.5).with_fit_intercept(false);
        let fresh = model.fresh();
        assert_eq!(fresh.alpha, 0.5);
        assert!(!fresh.fit_intercept);
        assert!(fresh.coefficients().is_none());
    }
}
