//! Symbolic replay of the scalar tape with forward and adjoint directions.
//!
//! When derivatives are requested, the forward value pass records one
//! partial-derivative pair per operation in a parallel tape; the derivative
//! sweeps then run over that tape alone, never revisiting the operations.

use log::trace;

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::sx::function::SxFunction;
use crate::sx::node::SxElem;
use crate::sx::ops::{self, ScalarOp};

impl SxFunction {
    /// Replay the tape with symbolic operands.
    ///
    /// `args` are the call arguments (one matrix per input), `fseed` and
    /// `aseed` the forward and adjoint seed sets, one per direction.
    /// Returns outputs, forward sensitivities and adjoint sensitivities.
    pub fn eval_symbolic(
        &self,
        args: &[Matrix<SxElem>],
        fseed: &[Vec<Matrix<SxElem>>],
        aseed: &[Vec<Matrix<SxElem>>],
    ) -> Result<(
        Vec<Matrix<SxElem>>,
        Vec<Vec<Matrix<SxElem>>>,
        Vec<Vec<Matrix<SxElem>>>,
    )> {
        assert!(self.initialized, "function not initialized");
        trace!("eval_symbolic \"{}\": begin", self.options.name);

        self.check_symbolic_args(args, fseed, aseed)?;

        if !aseed.is_empty() && self.options.assert_smooth && !self.is_smooth() {
            let bad = self
                .algorithm
                .iter()
                .map(|el| el.op)
                .find(|&op| {
                    super::tape_ndeps(op) > 0 && op != ScalarOp::Output && !ops::is_smooth(op)
                })
                .unwrap();
            return Err(FunctionError::NonSmoothAdjoint(
                ops::print_pre(bad).trim_end_matches('('),
            ));
        }

        // Fast path: arguments equal to the declared inputs to a bounded
        // depth mean the outputs are the stored expressions.
        const CHECKING_DEPTH: usize = 2;
        let output_given = args.iter().zip(self.inputs.iter()).all(|(a, b)| {
            a.data()
                .iter()
                .zip(b.data().iter())
                .all(|(x, y)| x.is_equal(y, CHECKING_DEPTH))
        });

        let arg_used: &[Matrix<SxElem>] = if output_given { &self.inputs } else { args };

        let mut res: Vec<Matrix<SxElem>> = self
            .outputs
            .iter()
            .map(|o| Matrix::zeros(o.sparsity().clone()))
            .collect();
        if output_given {
            for (r, o) in res.iter_mut().zip(self.outputs.iter()) {
                r.data_mut().clone_from_slice(o.data());
            }
        }

        let nfdir = fseed.len();
        let nadir = aseed.len();
        let taping = nfdir > 0 || nadir > 0;

        let mut fsens: Vec<Vec<Matrix<SxElem>>> = (0..nfdir)
            .map(|_| {
                self.outputs
                    .iter()
                    .map(|o| Matrix::zeros(o.sparsity().clone()))
                    .collect()
            })
            .collect();
        let mut asens: Vec<Vec<Matrix<SxElem>>> = (0..nadir)
            .map(|_| {
                self.inputs
                    .iter()
                    .map(|i| Matrix::zeros(i.sparsity().clone()))
                    .collect()
            })
            .collect();

        // Iterators replaying constants, free variables and operations in
        // tape order.
        let mut c_it = self.constants.iter();
        let mut p_it = self.free_vars.iter();
        let mut b_it = self.operations.iter();

        // Partial-derivative tape, one pair per operation.
        let mut pdwork: Vec<[SxElem; 2]> = Vec::new();
        if taping {
            pdwork.reserve(self.operations.len());
        }

        let mut s_work: Vec<SxElem> = vec![SxElem::zero(); self.worksize];

        // ── Forward value pass ──

        for el in &self.algorithm {
            match el.op {
                ScalarOp::Input => {
                    s_work[el.i0 as usize] =
                        arg_used[el.i1 as usize].data()[el.i2 as usize].clone();
                }
                ScalarOp::Output => {
                    res[el.i0 as usize].data_mut()[el.i2 as usize] =
                        s_work[el.i1 as usize].clone();
                }
                ScalarOp::Const => {
                    s_work[el.i0 as usize] = c_it.next().expect("constant replay").clone();
                }
                ScalarOp::Parameter => {
                    s_work[el.i0 as usize] = p_it.next().expect("parameter replay").clone();
                }
                op => {
                    let recorded = b_it.next().expect("operation replay");
                    // Evaluate to a temporary: the result may overwrite an
                    // operand in the work array.
                    let f = if output_given {
                        recorded.clone()
                    } else {
                        let mut f = SxElem::binary_or_unary(
                            op,
                            s_work[el.i1 as usize].clone(),
                            s_work[el.i2 as usize].clone(),
                        );
                        // Reuse the recorded expression when the rebuilt one
                        // is equivalent, keeping expression growth bounded.
                        f.assign_if_duplicate(recorded, 2);
                        f
                    };
                    if taping {
                        pdwork.push(ops::der(
                            op,
                            &s_work[el.i1 as usize],
                            &s_work[el.i2 as usize],
                            &f,
                        ));
                    }
                    s_work[el.i0 as usize] = f;
                }
            }
        }

        if !taping {
            trace!("eval_symbolic \"{}\": end (values only)", self.options.name);
            return Ok((res, fsens, asens));
        }

        // ── Forward derivative sweeps ──

        for (dir, fsens_dir) in fsens.iter_mut().enumerate() {
            let mut it2 = pdwork.iter();
            for el in &self.algorithm {
                match el.op {
                    ScalarOp::Input => {
                        s_work[el.i0 as usize] =
                            fseed[dir][el.i1 as usize].data()[el.i2 as usize].clone();
                    }
                    ScalarOp::Output => {
                        fsens_dir[el.i0 as usize].data_mut()[el.i2 as usize] =
                            s_work[el.i1 as usize].clone();
                    }
                    ScalarOp::Const | ScalarOp::Parameter => {
                        s_work[el.i0 as usize] = SxElem::zero();
                    }
                    op => {
                        let d = it2.next().expect("partial replay");
                        let mut v =
                            d[0].clone() * s_work[el.i1 as usize].clone();
                        if ops::n_deps(op) > 1 {
                            v = v + d[1].clone() * s_work[el.i2 as usize].clone();
                        }
                        s_work[el.i0 as usize] = v;
                    }
                }
            }
        }

        // ── Adjoint derivative sweeps ──

        if nadir > 0 {
            for v in s_work.iter_mut() {
                *v = SxElem::zero();
            }
        }
        for (dir, asens_dir) in asens.iter_mut().enumerate() {
            let mut it2 = pdwork.iter().rev();
            for el in self.algorithm.iter().rev() {
                match el.op {
                    ScalarOp::Input => {
                        asens_dir[el.i1 as usize].data_mut()[el.i2 as usize] =
                            s_work[el.i0 as usize].clone();
                        s_work[el.i0 as usize] = SxElem::zero();
                    }
                    ScalarOp::Output => {
                        let seed = aseed[dir][el.i0 as usize].data()[el.i2 as usize].clone();
                        s_work[el.i1 as usize] = s_work[el.i1 as usize].clone() + seed;
                    }
                    ScalarOp::Const | ScalarOp::Parameter => {
                        s_work[el.i0 as usize] = SxElem::zero();
                    }
                    op => {
                        let d = it2.next().expect("partial replay");
                        let seed = s_work[el.i0 as usize].clone();
                        s_work[el.i0 as usize] = SxElem::zero();
                        s_work[el.i1 as usize] =
                            s_work[el.i1 as usize].clone() + d[0].clone() * seed.clone();
                        if ops::n_deps(op) > 1 {
                            s_work[el.i2 as usize] =
                                s_work[el.i2 as usize].clone() + d[1].clone() * seed;
                        }
                    }
                }
            }
        }

        trace!("eval_symbolic \"{}\": end", self.options.name);
        Ok((res, fsens, asens))
    }

    fn check_symbolic_args(
        &self,
        args: &[Matrix<SxElem>],
        fseed: &[Vec<Matrix<SxElem>>],
        aseed: &[Vec<Matrix<SxElem>>],
    ) -> Result<()> {
        if args.len() != self.inputs.len() {
            return Err(FunctionError::WrongArity {
                what: "arguments",
                expected: self.inputs.len(),
                got: args.len(),
            });
        }
        for (a, i) in args.iter().zip(self.inputs.iter()) {
            if !crate::sparsity::Sparsity::same(a.sparsity(), i.sparsity()) {
                return Err(FunctionError::ShapeMismatch {
                    what: "argument",
                    expected: i.sparsity().describe(),
                    got: a.sparsity().describe(),
                });
            }
        }
        for (d, dir) in fseed.iter().enumerate() {
            if dir.len() != self.inputs.len() {
                return Err(FunctionError::WrongArity {
                    what: "forward seeds",
                    expected: self.inputs.len(),
                    got: dir.len(),
                });
            }
            for (index, (s, i)) in dir.iter().zip(self.inputs.iter()).enumerate() {
                if !crate::sparsity::Sparsity::same(s.sparsity(), i.sparsity()) {
                    return Err(FunctionError::SeedShape {
                        direction: d,
                        index,
                        got: s.sparsity().describe(),
                    });
                }
            }
        }
        for (d, dir) in aseed.iter().enumerate() {
            if dir.len() != self.outputs.len() {
                return Err(FunctionError::WrongArity {
                    what: "adjoint seeds",
                    expected: self.outputs.len(),
                    got: dir.len(),
                });
            }
            for (index, (s, o)) in dir.iter().zip(self.outputs.iter()).enumerate() {
                if !crate::sparsity::Sparsity::same(s.sparsity(), o.sparsity()) {
                    return Err(FunctionError::SeedShape {
                        direction: d,
                        index,
                        got: s.sparsity().describe(),
                    });
                }
            }
        }
        Ok(())
    }
}
