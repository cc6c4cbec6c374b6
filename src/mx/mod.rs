//! Matrix expression layer: sparsity-carrying operator nodes and the tape
//! virtual machine compiled from them.

pub mod expr;
pub mod function;
pub mod node;

mod derivative;
mod emit;
mod eval;

pub use expr::Mx;
pub use function::{FunctionRef, MxFunction};
pub use node::{OpKernel, OpTag};
