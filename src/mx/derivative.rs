//! Symbolic-evaluation kernels of the built-in operators: output
//! expressions, forward sensitivities and adjoint contributions.

use crate::error::Result;
use crate::matrix::Matrix;
use crate::mx::expr::Mx;
use crate::mx::node::{MxKind, MxNode};
use crate::sx::ops::ScalarOp;

fn zero_of(shape: (usize, usize)) -> Mx {
    Mx::zero(shape.0, shape.1)
}

/// Project a seed onto an expected pattern, passing structural zeros
/// through untouched.
fn fit_seed(seed: &Option<Mx>, expected: &crate::sparsity::Sparsity) -> Option<Mx> {
    let s = seed.as_ref()?;
    if s.nnz() == 0 {
        return None;
    }
    Some(s.project(expected.clone()))
}

/// Sum a contribution down to 1x1 when the argument it belongs to is a
/// broadcast scalar.
fn reduce_to(contrib: Mx, arg: &Mx) -> Mx {
    if arg.shape() == (1, 1) && contrib.shape() != (1, 1) {
        contrib.sum_nz()
    } else {
        contrib
    }
}

/// Replicate a broadcast-scalar sensitivity over the result shape.
fn broadcast_to(v: Mx, shape: (usize, usize)) -> Mx {
    if v.shape() == shape {
        v
    } else {
        &Mx::ones(crate::sparsity::Sparsity::dense(shape.0, shape.1)) * &v
    }
}

/// Symbolic partial derivatives of an elementary operation, as matrix
/// expressions. `y` is ignored for unary operations. `None` stands for the
/// constant partials: one for `Add`/`Sub`/`Neg` (handled directly by the
/// callers), zero for the step-function operations.
fn mx_partials(op: ScalarOp, x: &Mx, y: &Mx, f: &Mx) -> (Option<Mx>, Option<Mx>) {
    use ScalarOp::*;
    let one = || Mx::scalar(1.0);
    let two = || Mx::scalar(2.0);
    match op {
        Add | Sub | Neg => (None, None),
        Mul => (Some(y.clone()), Some(x.clone())),
        Div => (Some(&one() / y), Some(-&(f / y))),
        Pow => {
            let e1 = y - &one();
            (Some(y * &x.pow(&e1)), Some(f * &x.log()))
        }
        Atan2 => {
            let den = &x.sq() + &y.sq();
            (Some(y / &den), Some(-&(x / &den)))
        }
        Fmin => {
            let s = (x - y).sign();
            (Some(&(&one() - &s) / &two()), Some(&(&one() + &s) / &two()))
        }
        Fmax => {
            let s = (x - y).sign();
            (Some(&(&one() + &s) / &two()), Some(&(&one() - &s) / &two()))
        }
        Sin => (Some(x.cos()), None),
        Cos => (Some(-&x.sin()), None),
        Tan => (Some(&one() + &f.sq()), None),
        Asin => (Some(&one() / &(&one() - &x.sq()).sqrt()), None),
        Acos => (Some(-&(&one() / &(&one() - &x.sq()).sqrt())), None),
        Atan => (Some(&one() / &(&one() + &x.sq())), None),
        Sinh => (Some(x.cosh()), None),
        Cosh => (Some(x.sinh()), None),
        Tanh => (Some(&one() - &f.sq()), None),
        Exp => (Some(f.clone()), None),
        Log => (Some(&one() / x), None),
        Sqrt => (Some(&one() / &(&two() * f)), None),
        Sq => (Some(&two() * x), None),
        Fabs => (Some(x.sign()), None),
        Sign | Floor | Ceil => (None, None),
        Input | Output | Const | Parameter => unreachable!("sentinel has no derivative"),
    }
}

impl MxNode {
    /// Symbolic kernel.
    ///
    /// Fills `outputs` (unless `output_given`), writes forward
    /// sensitivities into `fsens` and adjoint *contributions* into `asens`;
    /// the evaluator accumulates contributions and clears consumed result
    /// seeds.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn eval_symbolic(
        &self,
        inputs: &[Option<Mx>],
        outputs: &mut [Option<Mx>],
        fseed: &[Vec<Option<Mx>>],
        fsens: &mut [Vec<Option<Mx>>],
        aseed: &[Vec<Option<Mx>>],
        asens: &mut [Vec<Option<Mx>>],
        output_given: bool,
    ) -> Result<()> {
        match &self.kind {
            MxKind::Const { value } => {
                if !output_given {
                    outputs[0] = Some(Mx::constant(value.clone()));
                }
                Ok(())
            }
            MxKind::Unary { op, .. } => {
                let x = inputs[0].as_ref().expect("unary input");
                if !output_given {
                    outputs[0] = Some(Mx::unary(*op, x));
                }
                let f = outputs[0].as_ref().expect("unary result");
                let neg = *op == ScalarOp::Neg;
                let (d0, _) = mx_partials(*op, x, x, f);
                for (d, dir) in fseed.iter().enumerate() {
                    let s = dir[0].as_ref().filter(|s| s.nnz() > 0);
                    fsens[d][0] = Some(match (neg, &d0, s) {
                        (true, _, Some(s)) => -s,
                        (false, Some(d0), Some(s)) => d0 * s,
                        _ => zero_of(f.shape()),
                    });
                }
                for (d, dir) in aseed.iter().enumerate() {
                    if let Some(s) = dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        if neg {
                            asens[d][0] = Some(-s);
                        } else if let Some(d0) = &d0 {
                            asens[d][0] = Some(d0 * s);
                        }
                    }
                }
                Ok(())
            }
            MxKind::Binary { op, deps } => {
                let x = inputs[0].as_ref().expect("binary input");
                let y = inputs[1].as_ref().expect("binary input");
                if !output_given {
                    outputs[0] = Some(Mx::binary(*op, x, y));
                }
                let f = outputs[0].as_ref().expect("binary result").clone();

                for (d, dir) in fseed.iter().enumerate() {
                    let s0 = dir[0].as_ref().filter(|s| s.nnz() > 0);
                    let s1 = dir[1].as_ref().filter(|s| s.nnz() > 0);
                    fsens[d][0] = Some(match op {
                        ScalarOp::Add => match (s0, s1) {
                            (Some(a), Some(b)) => a + b,
                            (Some(a), None) => broadcast_to(a.clone(), f.shape()),
                            (None, Some(b)) => broadcast_to(b.clone(), f.shape()),
                            (None, None) => zero_of(f.shape()),
                        },
                        ScalarOp::Sub => match (s0, s1) {
                            (Some(a), Some(b)) => a - b,
                            (Some(a), None) => broadcast_to(a.clone(), f.shape()),
                            (None, Some(b)) => broadcast_to(-b, f.shape()),
                            (None, None) => zero_of(f.shape()),
                        },
                        _ => {
                            let (d0, d1) = mx_partials(*op, x, y, &f);
                            let mut acc: Option<Mx> = None;
                            if let (Some(d0), Some(s)) = (&d0, s0) {
                                acc = Some(d0 * s);
                            }
                            if let (Some(d1), Some(s)) = (&d1, s1) {
                                let term = d1 * s;
                                acc = Some(match acc {
                                    Some(v) => &v + &term,
                                    None => term,
                                });
                            }
                            acc.unwrap_or_else(|| zero_of(f.shape()))
                        }
                    });
                }

                for (d, dir) in aseed.iter().enumerate() {
                    let seed = match dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        Some(s) => s,
                        None => continue,
                    };
                    match op {
                        ScalarOp::Add => {
                            asens[d][0] = Some(reduce_to(seed.clone(), &deps[0]));
                            asens[d][1] = Some(reduce_to(seed.clone(), &deps[1]));
                        }
                        ScalarOp::Sub => {
                            asens[d][0] = Some(reduce_to(seed.clone(), &deps[0]));
                            asens[d][1] = Some(reduce_to(-seed, &deps[1]));
                        }
                        _ => {
                            let (d0, d1) = mx_partials(*op, x, y, &f);
                            if let Some(d0) = d0 {
                                asens[d][0] = Some(reduce_to(&d0 * seed, &deps[0]));
                            }
                            if let Some(d1) = d1 {
                                asens[d][1] = Some(reduce_to(&d1 * seed, &deps[1]));
                            }
                        }
                    }
                }
                Ok(())
            }
            MxKind::Project { dep } => {
                let x = inputs[0].as_ref().expect("projection input");
                if !output_given {
                    outputs[0] = Some(x.project(self.sp[0].clone()));
                }
                for (d, dir) in fseed.iter().enumerate() {
                    fsens[d][0] = Some(match dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        Some(s) => s.project(self.sp[0].clone()),
                        None => zero_of(self.sp[0].shape()),
                    });
                }
                for (d, dir) in aseed.iter().enumerate() {
                    if let Some(s) = dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        asens[d][0] = Some(s.project(dep.sparsity().clone()));
                    }
                }
                Ok(())
            }
            MxKind::GetNonzeros { dep, nz } => {
                let x = inputs[0].as_ref().expect("gather input");
                if !output_given {
                    outputs[0] = Some(
                        x.project(dep.sparsity().clone())
                            .get_nonzeros(self.sp[0].clone(), nz.clone()),
                    );
                }
                for (d, dir) in fseed.iter().enumerate() {
                    fsens[d][0] = Some(match fit_seed(&dir[0], dep.sparsity()) {
                        Some(s) => s.get_nonzeros(self.sp[0].clone(), nz.clone()),
                        None => zero_of(self.sp[0].shape()),
                    });
                }
                for (d, dir) in aseed.iter().enumerate() {
                    if let Some(s) = fit_seed(&dir[0], &self.sp[0]) {
                        let base = Mx::constant(Matrix::zeros(dep.sparsity().clone()));
                        asens[d][0] = Some(base.add_nonzeros(&s, nz.clone()));
                    }
                }
                Ok(())
            }
            MxKind::SetNonzeros { deps, nz } | MxKind::AddNonzeros { deps, nz } => {
                let adding = matches!(self.kind, MxKind::AddNonzeros { .. });
                let dest = inputs[0].as_ref().expect("scatter destination");
                let src = inputs[1].as_ref().expect("scatter source");
                let dest_sp = deps[0].sparsity();
                let src_sp = deps[1].sparsity();
                if !output_given {
                    let dest = dest.project(dest_sp.clone());
                    let src = src.project(src_sp.clone());
                    outputs[0] = Some(if adding {
                        dest.add_nonzeros(&src, nz.clone())
                    } else {
                        dest.set_nonzeros(&src, nz.clone())
                    });
                }
                for (d, dir) in fseed.iter().enumerate() {
                    let sd = fit_seed(&dir[0], dest_sp);
                    let ss = fit_seed(&dir[1], src_sp);
                    fsens[d][0] = Some(match (sd, ss) {
                        (None, None) => zero_of(self.sp[0].shape()),
                        (sd, ss) => {
                            let sd = sd
                                .unwrap_or_else(|| Mx::constant(Matrix::zeros(dest_sp.clone())));
                            let ss = ss
                                .unwrap_or_else(|| Mx::constant(Matrix::zeros(src_sp.clone())));
                            if adding {
                                sd.add_nonzeros(&ss, nz.clone())
                            } else {
                                sd.set_nonzeros(&ss, nz.clone())
                            }
                        }
                    });
                }
                for (d, dir) in aseed.iter().enumerate() {
                    if let Some(s) = fit_seed(&dir[0], dest_sp) {
                        asens[d][1] = Some(s.get_nonzeros(src_sp.clone(), nz.clone()));
                        asens[d][0] = Some(if adding {
                            s
                        } else {
                            // The overwritten entries carry no adjoint for
                            // the destination.
                            let zeros = Mx::constant(Matrix::zeros(src_sp.clone()));
                            s.set_nonzeros(&zeros, nz.clone())
                        });
                    }
                }
                Ok(())
            }
            MxKind::SumNz { dep } => {
                let x = inputs[0].as_ref().expect("sum input");
                if !output_given {
                    outputs[0] = Some(x.project(dep.sparsity().clone()).sum_nz());
                }
                for (d, dir) in fseed.iter().enumerate() {
                    fsens[d][0] = Some(match fit_seed(&dir[0], dep.sparsity()) {
                        Some(s) => s.sum_nz(),
                        None => Mx::zero(1, 1),
                    });
                }
                for (d, dir) in aseed.iter().enumerate() {
                    if let Some(s) = dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        asens[d][0] = Some(&Mx::ones(dep.sparsity().clone()) * s);
                    }
                }
                Ok(())
            }
            MxKind::Lift { .. } => {
                let x = inputs[0].as_ref().expect("lifted value");
                if !output_given {
                    outputs[0] = Some(x.clone());
                }
                for (d, dir) in fseed.iter().enumerate() {
                    fsens[d][0] = Some(match dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        Some(s) => s.clone(),
                        None => zero_of(x.shape()),
                    });
                }
                for (d, dir) in aseed.iter().enumerate() {
                    if let Some(s) = dir[0].as_ref().filter(|s| s.nnz() > 0) {
                        asens[d][0] = Some(s.clone());
                    }
                }
                Ok(())
            }
            MxKind::Call { fref, .. } => {
                let sub = fref.lock();
                let args: Vec<Mx> = inputs
                    .iter()
                    .map(|x| x.as_ref().expect("call argument").clone())
                    .collect();
                let sub_fseed: Vec<Vec<Mx>> = fseed
                    .iter()
                    .map(|dir| {
                        dir.iter()
                            .enumerate()
                            .map(|(i, s)| match s {
                                Some(s) => s.clone(),
                                None => zero_of(args[i].shape()),
                            })
                            .collect()
                    })
                    .collect();
                let sub_aseed: Vec<Vec<Mx>> = aseed
                    .iter()
                    .map(|dir| {
                        dir.iter()
                            .enumerate()
                            .map(|(k, s)| match s {
                                Some(s) => s.clone(),
                                None => zero_of(sub.output_sparsity(k).shape()),
                            })
                            .collect()
                    })
                    .collect();
                let (res, fs, asn) = sub.eval_symbolic(&args, &sub_fseed, &sub_aseed)?;
                if !output_given {
                    for (k, r) in res.into_iter().enumerate() {
                        outputs[k] = Some(r);
                    }
                }
                for (d, dir) in fs.into_iter().enumerate() {
                    for (k, s) in dir.into_iter().enumerate() {
                        fsens[d][k] = Some(s);
                    }
                }
                for (d, dir) in asn.into_iter().enumerate() {
                    for (i, s) in dir.into_iter().enumerate() {
                        asens[d][i] = Some(s);
                    }
                }
                Ok(())
            }
            MxKind::External { kernel, .. } => kernel.eval_symbolic(
                inputs,
                outputs,
                fseed,
                fsens,
                aseed,
                asens,
                output_given,
            ),
            MxKind::Parameter { .. } | MxKind::FunctionOutput { .. } => {
                unreachable!("handled at tape level")
            }
        }
    }

}
