//! Forward numeric tape interpreter.

use std::mem;

use log::trace;

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::mx::function::{MxFunction, UNUSED};
use crate::mx::node::OpTag;

impl MxFunction {
    /// Run the tape forward over the numeric work array, reading the input
    /// buffers and writing the output buffers.
    ///
    /// Fails with [`FunctionError::FreeVariable`] while any parameter
    /// remains unresolved. Strictly sequential; operator kernels may
    /// synchronously invoke embedded functions.
    pub fn evaluate(&mut self) -> Result<()> {
        assert!(self.initialized, "function not initialized");
        trace!("evaluate \"{}\": begin", self.options.name);

        if !self.free_vars.is_empty() {
            return Err(FunctionError::FreeVariable {
                names: self.free_var_names(),
            });
        }

        for el in &self.algorithm {
            match el.op {
                OpTag::Input => {
                    let i = el.arg[0] as usize;
                    let r = el.res[0] as usize;
                    // The slot's pattern may be a structural superset of
                    // the user's buffer; projection fills the difference
                    // with zeros.
                    self.work[r].project_from(&self.input_buf[i]);
                }
                OpTag::Output => {
                    let r = el.res[0] as usize;
                    let a = el.arg[0] as usize;
                    self.output_buf[r].project_from(&self.work[a]);
                }
                OpTag::Parameter => unreachable!("free variables checked above"),
                _ => {
                    let node = el.node.as_ref().unwrap();
                    let n_inplace = node.node().n_inplace();

                    // Move result matrices out of the work array so the
                    // kernel can write them while reading its arguments.
                    let mut taken: Vec<Option<Matrix<f64>>> = el
                        .res
                        .iter()
                        .map(|&r| {
                            if r == UNUSED {
                                None
                            } else {
                                Some(mem::take(&mut self.work[r as usize]))
                            }
                        })
                        .collect();

                    // An argument aliased with a result (in-place
                    // operators only) is passed as None: the result buffer
                    // already holds its value.
                    let ins: Vec<Option<&Matrix<f64>>> = el
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
                                Some(&self.work[a as usize])
                            }
                        })
                        .collect();

                    let mut outs: Vec<Option<&mut Matrix<f64>>> =
                        taken.iter_mut().map(|o| o.as_mut()).collect();

                    node.node()
                        .eval_numeric(&ins, &mut outs, &mut self.itmp, &mut self.rtmp)?;
                    drop(outs);
                    drop(ins);

                    for (c, &r) in el.res.iter().enumerate() {
                        if r != UNUSED {
                            self.work[r as usize] = taken[c].take().unwrap();
                        }
                    }
                }
            }
        }

        trace!("evaluate \"{}\": end", self.options.name);
        Ok(())
    }
}
