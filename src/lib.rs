//! Symbolic expression graphs compiled to a tape virtual machine, with
//! forward and adjoint algorithmic differentiation on the compiled tape.
//!
//! Two parallel expression layers share the same compilation pipeline:
//!
//! - [`Mx`]: matrix-valued nodes carrying sparsity patterns, possibly with
//!   multiple outputs (embedded function calls).
//! - [`SxElem`]: elementary scalar operations, fully linearised.
//!
//! For each layer, [`MxFunction`] / [`SxFunction`] topologically order the
//! shared-subexpression DAG, assign a minimal work array by live-variable
//! reuse keyed on sparsity, and emit an instruction tape. The tape is then
//! replayed numerically, over dependency bit-masks, or symbolically with
//! derivative directions; the reverse symbolic sweep recovers overwritten
//! intermediates from a spill tape.
//!
//! ```
//! use colugo::{Matrix, Mx, MxFunction};
//!
//! let x = Mx::sym_dense("x", 2, 1);
//! let y = (&x.sin() + &Mx::scalar(1.0)).sum_nz();
//! let mut f = MxFunction::new(vec![x], vec![y]).unwrap();
//! f.init().unwrap();
//! f.set_input(0, &Matrix::from_dense(2, 1, vec![0.0, 0.0])).unwrap();
//! f.evaluate().unwrap();
//! assert_eq!(f.get_output(0).unwrap().data(), &[2.0]);
//! ```

pub mod codegen;
pub mod error;
pub mod matrix;
pub mod mx;
pub mod options;
pub mod sparsity;
pub mod sx;

pub use error::{FunctionError, Result};
pub use matrix::Matrix;
pub use mx::{FunctionRef, Mx, MxFunction, OpKernel, OpTag};
pub use options::FunctionOptions;
pub use sparsity::Sparsity;
pub use sx::{sym_matrix, SxElem, SxFunction};

/// Numeric matrix type used for function inputs and outputs.
pub type DMatrix = Matrix<f64>;
