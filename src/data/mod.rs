//! Calibration-table conversion
//!
//! The quantizers consume one uniform numeric array; this module converts
//! the host representations a caller may hold (polars DataFrame, plain row
//! vectors) into `ndarray::Array2<f64>`.

use crate::error::{CipherMlError, Result};
use ndarray::{Array1, Array2};
use polars::prelude::*;

/// Convert a DataFrame into a row-major feature matrix.
///
/// Every column must cast to f64 and contain no nulls.
pub fn dataframe_to_matrix(df: &DataFrame) -> Result<Array2<f64>> {
    let n_rows = df.height();
    let n_cols = df.width();
    if n_rows == 0 || n_cols == 0 {
        return Err(CipherMlError::Validation(
            "calibration table is empty".to_string(),
        ));
    }

    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(n_cols);
    for col in df.get_columns() {
        let casted = col.cast(&DataType::Float64).map_err(|e| {
            CipherMlError::Data(format!("column '{}' is not numeric: {}", col.name(), e))
        })?;
        let ca = casted
            .f64()
            .map_err(|e| CipherMlError::Data(e.to_string()))?;
        if ca.null_count() > 0 {
            return Err(CipherMlError::Data(format!(
                "column '{}' contains {} null values",
                col.name(),
                ca.null_count()
            )));
        }
        columns.push(ca.into_no_null_iter().collect());
    }

    Ok(Array2::from_shape_fn((n_rows, n_cols), |(r, c)| {
        columns[c][r]
    }))
}

/// Convert a single DataFrame column into a target vector
pub fn column_to_vector(df: &DataFrame, name: &str) -> Result<Array1<f64>> {
    let col = df
        .column(name)
        .map_err(|e| CipherMlError::Data(e.to_string()))?;
    let casted = col.cast(&DataType::Float64).map_err(|e| {
        CipherMlError::Data(format!("column '{}' is not numeric: {}", name, e))
    })?;
    let ca = casted
        .f64()
        .map_err(|e| CipherMlError::Data(e.to_string()))?;
    if ca.null_count() > 0 {
        return Err(CipherMlError::Data(format!(
            "column '{}' contains null values",
            name
        )));
    }
    Ok(Array1::from_vec(ca.into_no_null_iter().collect()))
}

/// Convert borrowed row vectors into a feature matrix.
///
/// All rows must share one length.
pub fn rows_to_matrix(rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let n_rows = rows.len();
    if n_rows == 0 {
        return Err(CipherMlError::Validation(
            "calibration table is empty".to_string(),
        ));
    }
    let n_cols = rows[0].len();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != n_cols {
            return Err(CipherMlError::Shape {
                expected: format!("{} columns", n_cols),
                actual: format!("{} columns in row {}", row.len(), i),
            });
        }
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat).map_err(Into::into)
}
