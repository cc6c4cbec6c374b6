//! Forward numeric interpretation of the scalar tape.

use log::trace;

use crate::error::{FunctionError, Result};
use crate::sx::function::SxFunction;
use crate::sx::ops::{self, ScalarOp};

impl SxFunction {
    /// Run the tape forward over the scalar work array.
    ///
    /// Fails with [`FunctionError::FreeVariable`] while any symbol remains
    /// unresolved.
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
                ScalarOp::Const => self.work[el.i0 as usize] = el.d,
                ScalarOp::Input => {
                    self.work[el.i0 as usize] =
                        self.input_buf[el.i1 as usize].data()[el.i2 as usize];
                }
                ScalarOp::Output => {
                    self.output_buf[el.i0 as usize].data_mut()[el.i2 as usize] =
                        self.work[el.i1 as usize];
                }
                ScalarOp::Parameter => unreachable!("free variables checked above"),
                op => {
                    self.work[el.i0 as usize] = ops::eval_num(
                        op,
                        self.work[el.i1 as usize],
                        self.work[el.i2 as usize],
                    );
                }
            }
        }

        trace!("evaluate \"{}\": end", self.options.name);
        Ok(())
    }
}
