//! Bit-parallel sparsity propagation over the tape.
//!
//! The mask work array is a parallel allocation of the numeric one: one
//! machine word per slot nonzero, each bit position an independent
//! dependency thread.

use std::mem;

use crate::error::Result;
use crate::mx::function::{MxFunction, UNUSED};
use crate::mx::node::OpTag;

impl MxFunction {
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
    ///
    /// Forward propagates input masks to output masks in emission order;
    /// reverse walks the tape backwards, moving accumulated bits from the
    /// work array out to the input masks.
    pub fn eval_sparsity(&mut self, forward: bool) -> Result<()> {
        assert!(self.initialized, "function not initialized");

        // Pre-pass: a clean work array.
        for w in &mut self.mask_work {
            w.iter_mut().for_each(|b| *b = 0);
        }

        if forward {
            for idx in 0..self.algorithm.len() {
                self.sp_step(idx, true)?;
            }
        } else {
            for idx in (0..self.algorithm.len()).rev() {
                self.sp_step(idx, false)?;
            }
        }
        Ok(())
    }

    fn sp_step(&mut self, idx: usize, forward: bool) -> Result<()> {
        let el = &self.algorithm[idx];
        match el.op {
            OpTag::Input => {
                let i = el.arg[0] as usize;
                let r = el.res[0] as usize;
                if forward {
                    // Pass input seeds.
                    self.mask_work[r].copy_from_slice(&self.input_mask[i]);
                } else {
                    // Move the accumulated bits out, clearing the slot.
                    for (dst, src) in self.input_mask[i]
                        .iter_mut()
                        .zip(self.mask_work[r].iter_mut())
                    {
                        *dst = *src;
                        *src = 0;
                    }
                }
            }
            OpTag::Output => {
                let k = el.res[0] as usize;
                let a = el.arg[0] as usize;
                if forward {
                    self.output_mask[k].copy_from_slice(&self.mask_work[a]);
                } else {
                    // Adjoint masks compose across consumers.
                    for (dst, src) in self.mask_work[a].iter_mut().zip(self.output_mask[k].iter())
                    {
                        *dst |= *src;
                    }
                }
            }
            OpTag::Parameter | OpTag::Const => {
                let r = el.res[0] as usize;
                self.mask_work[r].iter_mut().for_each(|b| *b = 0);
            }
            _ => {
                let node = el.node.as_ref().unwrap().clone();
                let n_inplace = node.node().n_inplace();

                let mut outs: Vec<Option<Vec<u64>>> = el
                    .res
                    .iter()
                    .map(|&r| {
                        if r == UNUSED {
                            None
                        } else {
                            Some(mem::take(&mut self.mask_work[r as usize]))
                        }
                    })
                    .collect();

                // Argument masks are cloned in; contributions are merged
                // back by OR, which also handles repeated arguments.
                let mut ins: Vec<Option<Vec<u64>>> = el
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
                            Some(self.mask_work[a as usize].clone())
                        }
                    })
                    .collect();

                node.node().eval_sparsity(&mut ins, &mut outs, forward)?;

                for (c, &a) in el.arg.iter().enumerate() {
                    if a != UNUSED {
                        if let Some(m) = ins[c].take() {
                            if forward {
                                continue;
                            }
                            for (dst, src) in
                                self.mask_work[a as usize].iter_mut().zip(m.iter())
                            {
                                *dst |= *src;
                            }
                        }
                    }
                }
                for (c, &r) in el.res.iter().enumerate() {
                    if r != UNUSED {
                        self.mask_work[r as usize] = outs[c].take().unwrap();
                    }
                }
            }
        }
        Ok(())
    }
}
