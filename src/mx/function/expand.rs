//! Expansion of a matrix function into an equivalent scalar function.

use std::mem;

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::mx::function::{MxFunction, UNUSED};
use crate::mx::node::OpTag;
use crate::options::FunctionOptions;
use crate::sx::function::SxFunction;
use crate::sx::node::SxElem;

impl MxFunction {
    /// Traverse the tape with scalar symbols, producing an equivalent
    /// scalar function (already compiled).
    ///
    /// The traversal runs with no derivative directions; free variables
    /// must have been resolved. Embedded function calls do not expand.
    pub fn expand(&self) -> Result<SxFunction> {
        assert!(self.initialized, "function not initialized");
        if !self.free_vars.is_empty() {
            return Err(FunctionError::FreeVariable {
                names: self.free_var_names(),
            });
        }

        // Scalar inputs with the same names and patterns as the matrix
        // inputs.
        let sx_inputs: Vec<Matrix<SxElem>> = self
            .inputs
            .iter()
            .map(|x| crate::sx::sym_matrix(x.name().unwrap_or("x"), x.sparsity().clone()))
            .collect();

        let mut swork: Vec<Matrix<SxElem>> = self
            .slot_sparsity
            .iter()
            .map(|sp| Matrix::zeros(sp.clone()))
            .collect();
        let mut res: Vec<Matrix<SxElem>> = self
            .outputs
            .iter()
            .map(|o| Matrix::zeros(o.sparsity().clone()))
            .collect();

        for el in &self.algorithm {
            match el.op {
                OpTag::Input => {
                    swork[el.res[0] as usize].project_from(&sx_inputs[el.arg[0] as usize]);
                }
                OpTag::Output => {
                    res[el.res[0] as usize].project_from(&swork[el.arg[0] as usize]);
                }
                OpTag::Parameter => unreachable!("free variables checked above"),
                _ => {
                    let node = el.node.as_ref().unwrap();
                    let n_inplace = node.node().n_inplace();

                    let mut taken: Vec<Option<Matrix<SxElem>>> = el
                        .res
                        .iter()
                        .map(|&r| {
                            if r == UNUSED {
                                None
                            } else {
                                Some(mem::take(&mut swork[r as usize]))
                            }
                        })
                        .collect();
                    let ins: Vec<Option<&Matrix<SxElem>>> = el
                        .arg
                        .iter()
                        .enumerate()
                        .map(|(c, &a)| {
                            if a == UNUSED {
                                None
                            } else if el.res.contains(&a) {
                                debug_assert!(c < n_inplace, "unexpected slot aliasing");
                                None
                            } else {
                                Some(&swork[a as usize])
                            }
                        })
                        .collect();
                    let mut outs: Vec<Option<&mut Matrix<SxElem>>> =
                        taken.iter_mut().map(|o| o.as_mut()).collect();

                    node.node().eval_sx(&ins, &mut outs)?;
                    drop(outs);
                    drop(ins);

                    for (c, &r) in el.res.iter().enumerate() {
                        if r != UNUSED {
                            swork[r as usize] = taken[c].take().unwrap();
                        }
                    }
                }
            }
        }

        let mut options = self.options.clone();
        options.name = format!("expand_{}", self.options.name);
        let mut f = SxFunction::with_options(sx_inputs, res, options)?;
        f.init()?;
        Ok(f)
    }
}
