//! Sparse matrices with dense nonzero storage.
//!
//! A [`Matrix`] stores one value per structural nonzero of its declared
//! [`Sparsity`]. The element type is generic: `f64` for numeric work slots
//! and I/O buffers, `u64` for bit-parallel dependency masks, and scalar
//! expressions for symbolic evaluation.

use num_traits::Zero;

use crate::sparsity::Sparsity;

/// A matrix of declared sparsity with one stored value per nonzero.
#[derive(Debug, Clone)]
pub struct Matrix<T> {
    sparsity: Sparsity,
    data: Vec<T>,
}

impl<T: Clone + Zero> Matrix<T> {
    /// All-zero matrix of the given pattern.
    pub fn zeros(sparsity: Sparsity) -> Self {
        let n = sparsity.nnz();
        Matrix {
            sparsity,
            data: vec![T::zero(); n],
        }
    }

    /// Matrix with the given pattern and nonzero values.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != sparsity.nnz()`.
    pub fn new(sparsity: Sparsity, data: Vec<T>) -> Self {
        assert_eq!(data.len(), sparsity.nnz(), "nonzero count mismatch");
        Matrix { sparsity, data }
    }

    /// Dense matrix from column-major values.
    pub fn from_dense(nrow: usize, ncol: usize, values: Vec<T>) -> Self {
        assert_eq!(values.len(), nrow * ncol, "dense value count mismatch");
        Matrix {
            sparsity: Sparsity::dense(nrow, ncol),
            data: values,
        }
    }

    /// Dense 1x1 matrix.
    pub fn scalar(value: T) -> Self {
        Matrix {
            sparsity: Sparsity::scalar(),
            data: vec![value],
        }
    }

    /// Declared pattern.
    pub fn sparsity(&self) -> &Sparsity {
        &self.sparsity
    }

    /// `(nrow, ncol)`.
    pub fn shape(&self) -> (usize, usize) {
        self.sparsity.shape()
    }

    /// Number of stored values.
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Stored values in column-major nonzero order.
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable stored values.
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Value at entry `(r, c)`; zero where structurally absent.
    pub fn get(&self, r: usize, c: usize) -> T {
        match self.sparsity.find(r, c) {
            Some(k) => self.data[k].clone(),
            None => T::zero(),
        }
    }

    /// Copy `src` into `self`, projecting between patterns.
    ///
    /// Patterns need not match: entries of `self` that are structurally
    /// absent in `src` become zero. The shapes must agree. With identical
    /// patterns this is a plain copy.
    pub fn project_from(&mut self, src: &Matrix<T>) {
        debug_assert_eq!(self.shape(), src.shape(), "projection shape mismatch");
        if Sparsity::same(&self.sparsity, &src.sparsity) {
            self.data.clone_from_slice(&src.data);
            return;
        }
        for (k, (r, c)) in self.sparsity.coords().into_iter().enumerate() {
            self.data[k] = src.get(r, c);
        }
    }

    /// Set every stored value to zero.
    pub fn fill_zero(&mut self) {
        for v in &mut self.data {
            *v = T::zero();
        }
    }

    /// Dense column-major rendering, zeros filled in.
    pub fn to_dense(&self) -> Vec<T> {
        let (nrow, ncol) = self.shape();
        let mut out = vec![T::zero(); nrow * ncol];
        for (k, (r, c)) in self.sparsity.coords().into_iter().enumerate() {
            out[r + c * nrow] = self.data[k].clone();
        }
        out
    }
}

impl<T: Clone + Zero> Default for Matrix<T> {
    /// Empty 0x0 matrix. Used as a placeholder when work slots are
    /// temporarily moved out during evaluation.
    fn default() -> Self {
        Matrix::zeros(Sparsity::empty(0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_fills_missing_with_zero() {
        let sub = Sparsity::unit(2, 2, 0, 0);
        let full = Sparsity::dense(2, 2);
        let src = Matrix::new(sub, vec![7.0]);
        let mut dst = Matrix::<f64>::zeros(full);
        dst.data_mut().fill(1.0);
        dst.project_from(&src);
        assert_eq!(dst.data(), &[7.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn dense_round_trip() {
        let m = Matrix::from_dense(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(m.get(1, 0), 2.0);
        assert_eq!(m.to_dense(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
