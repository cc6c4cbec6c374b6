//! Scalar expression layer: elementary scalar nodes and the register-machine
//! function compiled from them.

pub mod function;
pub mod node;
pub mod ops;

pub use function::SxFunction;
pub use node::SxElem;

use crate::matrix::Matrix;
use crate::sparsity::Sparsity;

/// A matrix of fresh scalar symbols with the given pattern.
///
/// Element `k` is named `name_k`; a 1x1 matrix uses `name` alone.
pub fn sym_matrix(name: &str, sparsity: Sparsity) -> Matrix<SxElem> {
    let n = sparsity.nnz();
    let data = if n == 1 {
        vec![SxElem::sym(name)]
    } else {
        (0..n).map(|k| SxElem::sym(format!("{}_{}", name, k))).collect()
    };
    Matrix::new(sparsity, data)
}
