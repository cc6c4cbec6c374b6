//! Bit-parallel sparsity propagation over the scalar tape.
//!
//! Any arithmetic operation simply or-combines its operand masks; constants
//! and parameters contribute nothing.

use crate::error::Result;
use crate::sx::function::SxFunction;
use crate::sx::ops::ScalarOp;

impl SxFunction {
    /// Seed the dependency mask of input `i` (forward pass).
    pub fn set_input_mask(&mut self, i: usize, mask: &[u64]) {
        assert!(self.initialized, "function not initialized");
        self.input_mask[i].copy_from_slice(mask);
    }

    /// Seed the adjoint mask of output `k` (reverse pass).
    pub fn set_output_mask(&mut self, k: usize, mask: &[u64]) {
        assert!(self.initialized, "function not initialized");
        self.output_mask[k].copy_from_slice(mask);
    }

    /// Dependency mask of output `k` after a forward pass.
    pub fn get_output_mask(&self, k: usize) -> &[u64] {
        &self.output_mask[k]
    }

    /// Dependency mask of input `i` after a reverse pass.
    pub fn get_input_mask(&self, i: usize) -> &[u64] {
        &self.input_mask[i]
    }

    /// Run the bit-parallel dataflow pass over the tape.
    pub fn eval_sparsity(&mut self, forward: bool) -> Result<()> {
        assert!(self.initialized, "function not initialized");

        if forward {
            for el in &self.algorithm {
                match el.op {
                    ScalarOp::Const | ScalarOp::Parameter => {
                        self.mask_work[el.i0 as usize] = 0;
                    }
                    ScalarOp::Input => {
                        self.mask_work[el.i0 as usize] =
                            self.input_mask[el.i1 as usize][el.i2 as usize];
                    }
                    ScalarOp::Output => {
                        self.output_mask[el.i0 as usize][el.i2 as usize] =
                            self.mask_work[el.i1 as usize];
                    }
                    _ => {
                        self.mask_work[el.i0 as usize] = self.mask_work[el.i1 as usize]
                            | self.mask_work[el.i2 as usize];
                    }
                }
            }
        } else {
            // The reverse entry starts from a clean work array.
            self.mask_work.iter_mut().for_each(|b| *b = 0);
            for el in self.algorithm.iter().rev() {
                match el.op {
                    ScalarOp::Const | ScalarOp::Parameter => {
                        self.mask_work[el.i0 as usize] = 0;
                    }
                    ScalarOp::Input => {
                        self.input_mask[el.i1 as usize][el.i2 as usize] =
                            self.mask_work[el.i0 as usize];
                        self.mask_work[el.i0 as usize] = 0;
                    }
                    ScalarOp::Output => {
                        self.mask_work[el.i1 as usize] |=
                            self.output_mask[el.i0 as usize][el.i2 as usize];
                    }
                    _ => {
                        let seed = self.mask_work[el.i0 as usize];
                        self.mask_work[el.i0 as usize] = 0;
                        self.mask_work[el.i1 as usize] |= seed;
                        self.mask_work[el.i2 as usize] |= seed;
                    }
                }
            }
        }
        Ok(())
    }
}
