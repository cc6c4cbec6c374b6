//! Numeric, sparsity-propagation and scalar-matrix kernels of the built-in
//! operators.
//!
//! Calling conventions shared with [`OpKernel`](crate::mx::node::OpKernel):
//! a `None` among the first `n_inplace()` inputs means the corresponding
//! result buffer already holds that argument's value. In the sparsity
//! kernels, input masks are owned copies; reverse-mode contributions are
//! merged back by the evaluator with bitwise or.

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::mx::node::{MxKind, MxNode};
use crate::sparsity::Sparsity;
use crate::sx::node::SxElem;
use crate::sx::ops;

fn scalar_val(m: &Matrix<f64>) -> f64 {
    m.data().first().copied().unwrap_or(0.0)
}

/// Gather table from `src` pattern into `dst` pattern: for every nonzero of
/// `dst`, the source nonzero index, if structurally present.
fn gather_map(dst: &Sparsity, src: &Sparsity) -> Vec<Option<usize>> {
    dst.coords()
        .into_iter()
        .map(|(r, c)| src.find(r, c))
        .collect()
}

impl MxNode {
    /// Numeric kernel. `itmp`/`rtmp` are shared scratch buffers sized to
    /// the tape-wide maxima.
    pub(crate) fn eval_numeric(
        &self,
        inputs: &[Option<&Matrix<f64>>],
        outputs: &mut [Option<&mut Matrix<f64>>],
        itmp: &mut [i64],
        rtmp: &mut [f64],
    ) -> Result<()> {
        match &self.kind {
            MxKind::Const { value } => {
                if let Some(out) = outputs[0].as_deref_mut() {
                    out.project_from(value);
                }
                Ok(())
            }
            MxKind::Unary { op, .. } => {
                let x = inputs[0].expect("unary input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    for (o, &v) in out.data_mut().iter_mut().zip(x.data()) {
                        *o = ops::eval_num(*op, v, 0.0);
                    }
                }
                Ok(())
            }
            MxKind::Binary { op, deps } => {
                let x = inputs[0].expect("binary input");
                let y = inputs[1].expect("binary input");
                let xs = deps[0].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let ys = deps[1].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                if let Some(out) = outputs[0].as_deref_mut() {
                    let n = out.nnz();
                    for k in 0..n {
                        let a = if xs { scalar_val(x) } else { x.data()[k] };
                        let b = if ys { scalar_val(y) } else { y.data()[k] };
                        out.data_mut()[k] = ops::eval_num(*op, a, b);
                    }
                }
                Ok(())
            }
            MxKind::Project { dep } => {
                let x = inputs[0].expect("projection input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    let map = gather_map(&self.sp[0], dep.sparsity());
                    for (o, j) in out.data_mut().iter_mut().zip(map) {
                        *o = j.map_or(0.0, |j| x.data()[j]);
                    }
                }
                Ok(())
            }
            MxKind::GetNonzeros { nz, .. } => {
                let x = inputs[0].expect("gather input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    for (o, &j) in out.data_mut().iter_mut().zip(nz.iter()) {
                        *o = x.data()[j as usize];
                    }
                }
                Ok(())
            }
            MxKind::SetNonzeros { nz, .. } | MxKind::AddNonzeros { nz, .. } => {
                let adding = matches!(self.kind, MxKind::AddNonzeros { .. });
                let src = inputs[1].expect("scatter source");
                if let Some(out) = outputs[0].as_deref_mut() {
                    if let Some(dest) = inputs[0] {
                        out.data_mut().clone_from_slice(dest.data());
                    }
                    for (k, &j) in nz.iter().enumerate() {
                        if adding {
                            out.data_mut()[j as usize] += src.data()[k];
                        } else {
                            out.data_mut()[j as usize] = src.data()[k];
                        }
                    }
                }
                Ok(())
            }
            MxKind::SumNz { .. } => {
                let x = inputs[0].expect("sum input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    out.data_mut()[0] = x.data().iter().sum();
                }
                Ok(())
            }
            MxKind::Lift { .. } => {
                let x = inputs[0].expect("lifted value");
                if let Some(out) = outputs[0].as_deref_mut() {
                    out.project_from(x);
                }
                Ok(())
            }
            MxKind::Call { fref, .. } => {
                let mut f = fref.lock();
                for (i, x) in inputs.iter().enumerate() {
                    f.set_input(i, x.as_ref().expect("call argument"))?;
                }
                f.evaluate()?;
                for (k, out) in outputs.iter_mut().enumerate() {
                    if let Some(out) = out.as_deref_mut() {
                        out.project_from(f.get_output(k)?);
                    }
                }
                Ok(())
            }
            MxKind::External { kernel, .. } => kernel.eval_numeric(inputs, outputs, itmp, rtmp),
            MxKind::Parameter { .. } | MxKind::FunctionOutput { .. } => {
                unreachable!("handled at tape level")
            }
        }
    }

    /// Bit-parallel sparsity kernel; `forward` selects the direction.
    pub(crate) fn eval_sparsity(
        &self,
        inputs: &mut [Option<Vec<u64>>],
        outputs: &mut [Option<Vec<u64>>],
        forward: bool,
    ) -> Result<()> {
        match &self.kind {
            MxKind::Const { .. } => {
                if forward {
                    if let Some(out) = outputs[0].as_mut() {
                        out.iter_mut().for_each(|b| *b = 0);
                    }
                }
                Ok(())
            }
            MxKind::Unary { .. } | MxKind::Lift { .. } => {
                if forward {
                    if let (Some(x), Some(out)) = (inputs[0].as_ref(), outputs[0].as_mut()) {
                        out.copy_from_slice(x);
                    }
                } else if let (Some(x), Some(out)) = (inputs[0].as_mut(), outputs[0].as_mut()) {
                    for (i, o) in x.iter_mut().zip(out.iter_mut()) {
                        *i |= *o;
                        *o = 0;
                    }
                }
                Ok(())
            }
            MxKind::Binary { deps, .. } => {
                // A broadcast scalar may itself be structurally empty, in
                // which case it has no mask word to read or write.
                let xs = deps[0].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let ys = deps[1].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let out = outputs[0].as_mut().expect("binary result");
                let x = inputs[0].as_mut().expect("binary input");
                if forward {
                    for (k, o) in out.iter_mut().enumerate() {
                        let j = if xs { 0 } else { k };
                        *o = x.get(j).copied().unwrap_or(0);
                    }
                } else {
                    for (k, o) in out.iter_mut().enumerate() {
                        let j = if xs { 0 } else { k };
                        if let Some(b) = x.get_mut(j) {
                            *b |= *o;
                        }
                    }
                }
                let y = inputs[1].as_mut().expect("binary input");
                for (k, o) in out.iter_mut().enumerate() {
                    let j = if ys { 0 } else { k };
                    if forward {
                        *o |= y.get(j).copied().unwrap_or(0);
                    } else {
                        if let Some(b) = y.get_mut(j) {
                            *b |= *o;
                        }
                        *o = 0;
                    }
                }
                Ok(())
            }
            MxKind::Project { dep } => {
                let map = gather_map(&self.sp[0], dep.sparsity());
                let x = inputs[0].as_mut().expect("projection input");
                let out = outputs[0].as_mut().expect("projection result");
                for (k, j) in map.into_iter().enumerate() {
                    if forward {
                        out[k] = j.map_or(0, |j| x[j]);
                    } else {
                        if let Some(j) = j {
                            x[j] |= out[k];
                        }
                        out[k] = 0;
                    }
                }
                Ok(())
            }
            MxKind::GetNonzeros { nz, .. } => {
                let x = inputs[0].as_mut().expect("gather input");
                let out = outputs[0].as_mut().expect("gather result");
                for (k, &j) in nz.iter().enumerate() {
                    if forward {
                        out[k] = x[j as usize];
                    } else {
                        x[j as usize] |= out[k];
                        out[k] = 0;
                    }
                }
                Ok(())
            }
            MxKind::SetNonzeros { nz, .. } | MxKind::AddNonzeros { nz, .. } => {
                let adding = matches!(self.kind, MxKind::AddNonzeros { .. });
                let out = outputs[0].as_mut().expect("scatter result");
                if forward {
                    if let Some(dest) = inputs[0].as_ref() {
                        out.copy_from_slice(dest);
                    }
                    let src = inputs[1].as_ref().expect("scatter source");
                    for (k, &j) in nz.iter().enumerate() {
                        if adding {
                            out[j as usize] |= src[k];
                        } else {
                            out[j as usize] = src[k];
                        }
                    }
                } else {
                    let src = inputs[1].as_mut().expect("scatter source");
                    for (k, &j) in nz.iter().enumerate() {
                        src[k] |= out[j as usize];
                    }
                    let mut overwritten = vec![false; out.len()];
                    if !adding {
                        for &j in nz.iter() {
                            overwritten[j as usize] = true;
                        }
                    }
                    match inputs[0].as_mut() {
                        Some(dest) => {
                            // Distinct destination slot: move the remaining
                            // bits over and clear the result.
                            for (j, o) in out.iter_mut().enumerate() {
                                if !overwritten[j] {
                                    dest[j] |= *o;
                                }
                                *o = 0;
                            }
                        }
                        None => {
                            // Result aliases the destination: its mask is
                            // already in place, clear only the overwritten
                            // positions.
                            for (j, o) in out.iter_mut().enumerate() {
                                if overwritten[j] {
                                    *o = 0;
                                }
                            }
                        }
                    }
                }
                Ok(())
            }
            MxKind::SumNz { .. } => {
                let x = inputs[0].as_mut().expect("sum input");
                let out = outputs[0].as_mut().expect("sum result");
                if forward {
                    out[0] = x.iter().fold(0, |acc, &b| acc | b);
                } else {
                    for b in x.iter_mut() {
                        *b |= out[0];
                    }
                    out[0] = 0;
                }
                Ok(())
            }
            MxKind::Call { fref, .. } => {
                let mut f = fref.lock();
                if forward {
                    for (i, m) in inputs.iter().enumerate() {
                        f.set_input_mask(i, m.as_ref().expect("call argument mask"));
                    }
                    f.eval_sparsity(true)?;
                    for (k, out) in outputs.iter_mut().enumerate() {
                        if let Some(out) = out.as_mut() {
                            out.copy_from_slice(f.get_output_mask(k));
                        }
                    }
                } else {
                    for (k, out) in outputs.iter_mut().enumerate() {
                        match out.as_mut() {
                            Some(out) => {
                                f.set_output_mask(k, out);
                                out.iter_mut().for_each(|b| *b = 0);
                            }
                            None => {
                                let zeros = vec![0u64; f.output_sparsity(k).nnz()];
                                f.set_output_mask(k, &zeros);
                            }
                        }
                    }
                    f.eval_sparsity(false)?;
                    for (i, m) in inputs.iter_mut().enumerate() {
                        if let Some(m) = m.as_mut() {
                            for (dst, src) in m.iter_mut().zip(f.get_input_mask(i)) {
                                *dst |= *src;
                            }
                        }
                    }
                }
                Ok(())
            }
            MxKind::External { kernel, .. } => kernel.eval_sparsity(inputs, outputs, forward),
            MxKind::Parameter { .. } | MxKind::FunctionOutput { .. } => {
                unreachable!("handled at tape level")
            }
        }
    }

    /// Scalar-matrix kernel, used when expanding a matrix function into a
    /// scalar one.
    pub(crate) fn eval_sx(
        &self,
        inputs: &[Option<&Matrix<SxElem>>],
        outputs: &mut [Option<&mut Matrix<SxElem>>],
    ) -> Result<()> {
        match &self.kind {
            MxKind::Const { value } => {
                if let Some(out) = outputs[0].as_deref_mut() {
                    for (o, &v) in out.data_mut().iter_mut().zip(value.data()) {
                        *o = SxElem::constant(v);
                    }
                }
                Ok(())
            }
            MxKind::Unary { op, .. } => {
                let x = inputs[0].expect("unary input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    for (o, v) in out.data_mut().iter_mut().zip(x.data()) {
                        *o = SxElem::unary(*op, v.clone());
                    }
                }
                Ok(())
            }
            MxKind::Binary { op, deps } => {
                let x = inputs[0].expect("binary input");
                let y = inputs[1].expect("binary input");
                let xs = deps[0].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let ys = deps[1].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let sx_scalar = |m: &Matrix<SxElem>| {
                    m.data().first().cloned().unwrap_or_else(SxElem::zero)
                };
                if let Some(out) = outputs[0].as_deref_mut() {
                    let n = out.nnz();
                    for k in 0..n {
                        let a = if xs { sx_scalar(x) } else { x.data()[k].clone() };
                        let b = if ys { sx_scalar(y) } else { y.data()[k].clone() };
                        out.data_mut()[k] = SxElem::binary(*op, a, b);
                    }
                }
                Ok(())
            }
            MxKind::Project { dep } => {
                let x = inputs[0].expect("projection input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    let map = gather_map(&self.sp[0], dep.sparsity());
                    for (o, j) in out.data_mut().iter_mut().zip(map) {
                        *o = j.map_or_else(SxElem::zero, |j| x.data()[j].clone());
                    }
                }
                Ok(())
            }
            MxKind::GetNonzeros { nz, .. } => {
                let x = inputs[0].expect("gather input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    for (o, &j) in out.data_mut().iter_mut().zip(nz.iter()) {
                        *o = x.data()[j as usize].clone();
                    }
                }
                Ok(())
            }
            MxKind::SetNonzeros { nz, .. } | MxKind::AddNonzeros { nz, .. } => {
                let adding = matches!(self.kind, MxKind::AddNonzeros { .. });
                let src = inputs[1].expect("scatter source");
                if let Some(out) = outputs[0].as_deref_mut() {
                    if let Some(dest) = inputs[0] {
                        out.data_mut().clone_from_slice(dest.data());
                    }
                    for (k, &j) in nz.iter().enumerate() {
                        let j = j as usize;
                        if adding {
                            let sum = out.data()[j].clone() + src.data()[k].clone();
                            out.data_mut()[j] = sum;
                        } else {
                            out.data_mut()[j] = src.data()[k].clone();
                        }
                    }
                }
                Ok(())
            }
            MxKind::SumNz { .. } => {
                let x = inputs[0].expect("sum input");
                if let Some(out) = outputs[0].as_deref_mut() {
                    out.data_mut()[0] = x
                        .data()
                        .iter()
                        .cloned()
                        .fold(SxElem::zero(), |acc, v| acc + v);
                }
                Ok(())
            }
            MxKind::Lift { .. } => {
                let x = inputs[0].expect("lifted value");
                if let Some(out) = outputs[0].as_deref_mut() {
                    out.project_from(x);
                }
                Ok(())
            }
            MxKind::Call { .. } => Err(FunctionError::UnsupportedOperation(
                "scalar expansion of an embedded function call",
            )),
            MxKind::External { kernel, .. } => kernel.eval_sx(inputs, outputs),
            MxKind::Parameter { .. } | MxKind::FunctionOutput { .. } => {
                unreachable!("handled at tape level")
            }
        }
    }
}
