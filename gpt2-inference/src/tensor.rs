#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tests;

use crate::error::{Error, Result};
use rayon::prelude::*;

/// Dense row-major `f32` matrix.
///
/// Storage is already linear, so handing a matrix to the GPU is a borrow of [`Matrix::as_slice`]
/// and reading one back is [`Matrix::from_flat`].
#[derive(Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols] }
    }

    /// Reshapes a linear buffer into `rows x cols`.
    pub fn from_flat(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::DimensionMismatch { op: "from_flat", left: (rows, cols), right: (data.len(), 1) });
        }
        Ok(Self { rows, cols, data })
    }

    /// Builds a matrix from equally sized rows.
    pub fn from_rows<R: AsRef<[f32]>>(rows: &[R]) -> Result<Self> {
        let cols = rows.first().map_or(0, |r| r.as_ref().len());
        let mut data = Vec::with_capacity(rows.len() * cols);

        for (i, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.len() != cols {
                return Err(Error::DimensionMismatch { op: "from_rows", left: (i, row.len()), right: (0, cols) });
            }
            data.extend_from_slice(row);
        }

        Ok(Self { rows: rows.len(), cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        &mut self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// Row-major linear view.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Iterates rows in order. Yields nothing for a matrix without columns.
    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks(self.cols.max(1)).take(self.rows)
    }

    pub fn transpose(&self) -> Matrix {
        let mut out = Matrix::zeros(self.cols, self.rows);
        for i in 0..self.rows {
            for j in 0..self.cols {
                out.data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        out
    }

    /// Element-wise sum of two matrices of identical shape.
    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        if self.shape() != other.shape() {
            return Err(Error::DimensionMismatch { op: "add", left: self.shape(), right: other.shape() });
        }

        let data = self.data.iter().zip(&other.data).map(|(a, b)| a + b).collect();
        Ok(Matrix { rows: self.rows, cols: self.cols, data })
    }

    /// Adds `bias` to every row.
    pub fn add_row_broadcast(&mut self, bias: &[f32]) -> Result<()> {
        if bias.len() != self.cols {
            return Err(Error::DimensionMismatch {
                op: "add_row_broadcast",
                left: self.shape(),
                right: (1, bias.len()),
            });
        }

        if self.cols > 0 {
            self.data.chunks_mut(self.cols).for_each(|row| {
                row.iter_mut().zip(bias).for_each(|(val, &b)| *val += b);
            });
        }
        Ok(())
    }

    /// Applies `f` to every element.
    pub fn map<F: Fn(f32) -> f32>(&self, f: F) -> Matrix {
        Matrix { rows: self.rows, cols: self.cols, data: self.data.iter().map(|&v| f(v)).collect() }
    }

    /// Returns columns `start..end` of every row.
    pub fn column_slice(&self, start: usize, end: usize) -> Matrix {
        debug_assert!(start <= end && end <= self.cols);

        let width = end - start;
        let mut data = Vec::with_capacity(self.rows * width);
        for row in self.iter_rows() {
            data.extend_from_slice(&row[start..end]);
        }
        Matrix { rows: self.rows, cols: width, data }
    }
}

impl std::fmt::Debug for Matrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matrix").field("rows", &self.rows).field("cols", &self.cols).finish()
    }
}

/// CPU matrix multiplication.
///
/// Rows of the output are computed in parallel, but every output element is accumulated
/// sequentially over the inner dimension starting from zero, so the result matches a plain
/// triple loop exactly.
pub fn cpu_matmul(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    if a.cols != b.rows {
        return Err(Error::DimensionMismatch { op: "multiply", left: a.shape(), right: b.shape() });
    }

    let (n, k) = (b.cols, a.cols);
    let mut out = Matrix::zeros(a.rows, n);
    if out.is_empty() {
        return Ok(out);
    }

    out.data.par_chunks_mut(n).enumerate().for_each(|(i, out_row)| {
        let a_row = &a.data[i * k..(i + 1) * k];
        for (kk, &a_val) in a_row.iter().enumerate() {
            let b_row = &b.data[kk * n..(kk + 1) * n];
            out_row.iter_mut().zip(b_row).for_each(|(acc, &b_val)| *acc += a_val * b_val);
        }
    });

    Ok(out)
}
