//! Jacobian construction by the seed-matrix recipe.

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::mx::expr::Mx;
use crate::mx::function::MxFunction;
use crate::options::FunctionOptions;
use crate::sparsity::Sparsity;

impl MxFunction {
    /// Build a function computing the Jacobian of output `oind` with
    /// respect to input `iind`, by seeding unit derivative directions and
    /// replaying the tape symbolically.
    ///
    /// With `compact`, Jacobian rows and columns correspond to the
    /// structural nonzeros of the output and input; otherwise to their
    /// dense elements. `symmetric` promises a symmetric Jacobian (as for
    /// gradients of scalar objectives), which forces the cheaper forward
    /// recipe. The returned function produces the Jacobian followed by the
    /// original outputs, and is already compiled.
    pub fn jacobian(
        &self,
        iind: usize,
        oind: usize,
        compact: bool,
        symmetric: bool,
    ) -> Result<MxFunction> {
        assert!(self.initialized, "function not initialized");
        if iind >= self.inputs.len() {
            return Err(FunctionError::WrongArity {
                what: "input index",
                expected: self.inputs.len(),
                got: iind,
            });
        }
        if oind >= self.outputs.len() {
            return Err(FunctionError::WrongArity {
                what: "output index",
                expected: self.outputs.len(),
                got: oind,
            });
        }

        let in_sp = self.inputs[iind].sparsity().clone();
        let out_sp = self.outputs[oind].sparsity().clone();
        let (in_nrow, in_ncol) = in_sp.shape();
        let (out_nrow, out_ncol) = out_sp.shape();

        let (jrows, jcols) = if compact {
            (out_sp.nnz(), in_sp.nnz())
        } else {
            (out_nrow * out_ncol, in_nrow * in_ncol)
        };
        let jsp = Sparsity::dense(jrows.max(1), jcols.max(1));

        // Row/column of a Jacobian entry for the d-th seeded nonzero.
        let in_coords = in_sp.coords();
        let out_coords = out_sp.coords();
        let in_pos = |k: usize| {
            if compact {
                k
            } else {
                let (r, c) = in_coords[k];
                r + c * in_nrow
            }
        };
        let out_pos = |k: usize| {
            if compact {
                k
            } else {
                let (r, c) = out_coords[k];
                r + c * out_nrow
            }
        };

        let forward = symmetric || in_sp.nnz() <= out_sp.nnz();
        let mut jac = Mx::constant(Matrix::zeros(jsp));

        if forward {
            // One forward direction per input nonzero; each sensitivity is
            // one Jacobian column.
            let mut fseed: Vec<Vec<Mx>> = Vec::with_capacity(in_sp.nnz());
            for d in 0..in_sp.nnz() {
                let (r, c) = in_coords[d];
                let dir: Vec<Mx> = self
                    .inputs
                    .iter()
                    .enumerate()
                    .map(|(i, x)| {
                        if i == iind {
                            Mx::constant(Matrix::new(
                                Sparsity::unit(in_nrow, in_ncol, r, c),
                                vec![1.0],
                            ))
                        } else {
                            Mx::zero(x.shape().0, x.shape().1)
                        }
                    })
                    .collect();
                fseed.push(dir);
            }
            let (_, fsens, _) = self.eval_symbolic(&self.inputs, &fseed, &[])?;
            for (d, dir) in fsens.iter().enumerate() {
                let sens = dir[oind].project(out_sp.clone());
                let col = in_pos(d);
                let positions: Vec<u32> = (0..out_sp.nnz())
                    .map(|k| (out_pos(k) + col * jrows) as u32)
                    .collect();
                jac = jac.set_nonzeros(&sens, positions);
            }
        } else {
            // One adjoint direction per output nonzero; each sensitivity
            // is one Jacobian row.
            let mut aseed: Vec<Vec<Mx>> = Vec::with_capacity(out_sp.nnz());
            for d in 0..out_sp.nnz() {
                let (r, c) = out_coords[d];
                let dir: Vec<Mx> = self
                    .outputs
                    .iter()
                    .enumerate()
                    .map(|(k, o)| {
                        if k == oind {
                            Mx::constant(Matrix::new(
                                Sparsity::unit(out_nrow, out_ncol, r, c),
                                vec![1.0],
                            ))
                        } else {
                            Mx::zero(o.shape().0, o.shape().1)
                        }
                    })
                    .collect();
                aseed.push(dir);
            }
            let (_, _, asens) = self.eval_symbolic(&self.inputs, &[], &aseed)?;
            for (d, dir) in asens.iter().enumerate() {
                let sens = dir[iind].project(in_sp.clone());
                let row = out_pos(d);
                let positions: Vec<u32> = (0..in_sp.nnz())
                    .map(|k| (row + in_pos(k) * jrows) as u32)
                    .collect();
                jac = jac.set_nonzeros(&sens, positions);
            }
        }

        let mut ret_out = Vec::with_capacity(1 + self.outputs.len());
        ret_out.push(jac);
        ret_out.extend(self.outputs.iter().cloned());

        let mut options = self.options.clone();
        options.name = format!("jacobian_{}", self.options.name);
        let mut ret = MxFunction::with_options(self.inputs.clone(), ret_out, options)?;
        ret.init()?;
        Ok(ret)
    }
}
