//! Symbolic tape replay with forward and adjoint derivative directions.
//!
//! The forward sweep overwrites work slots for reuse, but the reverse
//! sweep needs the forward-time value of an input at the moment of its
//! consumption. A spill tape, computed by a pre-pass, captures exactly the
//! slot values that get overwritten while still needed; the reverse sweep
//! restores them around each operator.

use log::trace;

use crate::error::{FunctionError, Result};
use crate::mx::expr::Mx;
use crate::mx::function::{MxFunction, UNUSED};
use crate::mx::node::{MxKind, OpTag};
use crate::sx::ops;

fn zero_of(shape: (usize, usize)) -> Mx {
    Mx::zero(shape.0, shape.1)
}

fn is_empty_seed(s: &Option<Mx>) -> bool {
    s.as_ref().map_or(true, |m| m.nnz() == 0)
}

/// The stored expression for output `i` of a tape node.
fn stored_output(node: &Mx, i: usize) -> Mx {
    if !node.node().is_multiple_output() {
        node.clone()
    } else {
        let sp = node.node().output_sparsity(i).clone();
        Mx::mk(
            MxKind::FunctionOutput {
                dep: node.clone(),
                oind: i,
            },
            vec![sp],
        )
    }
}

/// Directions with at least one structurally nonempty seed.
fn live_directions(seeds: &[Vec<Option<Mx>>]) -> Vec<usize> {
    seeds
        .iter()
        .enumerate()
        .filter(|(_, dir)| dir.iter().any(|s| !is_empty_seed(s)))
        .map(|(d, _)| d)
        .collect()
}

impl MxFunction {
    /// Replay the tape with symbolic operands.
    ///
    /// `args` are the call arguments (one per input), `fseed` the forward
    /// seed matrices (one set per direction), `aseed` the adjoint seeds
    /// (one set per direction). Returns the symbolic outputs, the forward
    /// sensitivities and the adjoint sensitivities.
    ///
    /// If the arguments equal the declared inputs to a bounded depth, the
    /// outputs are the stored output expressions verbatim. Directions whose
    /// seeds are all structurally empty are skipped and produce
    /// structurally-zero sensitivities.
    pub fn eval_symbolic(
        &self,
        args: &[Mx],
        fseed: &[Vec<Mx>],
        aseed: &[Vec<Mx>],
    ) -> Result<(Vec<Mx>, Vec<Vec<Mx>>, Vec<Vec<Mx>>)> {
        assert!(self.initialized, "function not initialized");
        trace!("eval_symbolic \"{}\": begin", self.options.name);

        self.check_symbolic_args(args, fseed, aseed)?;

        // Fast path: arguments equal to the declared inputs mean the
        // outputs are known.
        const CHECKING_DEPTH: usize = 2;
        let output_given = args
            .iter()
            .zip(self.inputs.iter())
            .all(|(a, b)| a.is_equal(b, CHECKING_DEPTH));

        // Use the declared inputs when possible, avoiding problems with
        // equivalent but distinct expressions.
        let arg_used: &[Mx] = if output_given { &self.inputs } else { args };

        // Skip derivative passes whose seeds are all structurally empty.
        let skip_fwd = fseed
            .iter()
            .all(|dir| dir.iter().all(|s| s.nnz() == 0));
        let skip_adj = aseed
            .iter()
            .all(|dir| dir.iter().all(|s| s.nnz() == 0));

        let nfdir = if skip_fwd { 0 } else { fseed.len() };
        let nadir = if skip_adj { 0 } else { aseed.len() };

        let mut res: Vec<Mx> = if output_given {
            self.outputs.clone()
        } else {
            self.outputs
                .iter()
                .map(|o| zero_of(o.shape()))
                .collect()
        };

        let mut fsens: Vec<Vec<Mx>> = (0..fseed.len())
            .map(|_| self.outputs.iter().map(|o| zero_of(o.shape())).collect())
            .collect();
        let mut asens: Vec<Vec<Mx>> = (0..aseed.len())
            .map(|_| self.inputs.iter().map(|i| zero_of(i.shape())).collect())
            .collect();

        if output_given && nfdir == 0 && nadir == 0 {
            trace!("eval_symbolic \"{}\": quick return", self.options.name);
            return Ok((res, fsens, asens));
        }

        // Symbolic work array, non-differentiated.
        let mut swork: Vec<Mx> = vec![Mx::zero(0, 0); self.work.len()];

        // Spill tape for values overwritten while still needed in reverse.
        let mut tape: Vec<((usize, u32), Option<Mx>)> = if nadir > 0 {
            self.alloc_spill_tape()
        } else {
            Vec::new()
        };
        let mut tt: usize = 0;

        // Derivative work array, forward mode first.
        let ndir_max = nfdir.max(nadir);
        let mut dwork: Vec<Vec<Option<Mx>>> = vec![vec![None; ndir_max]; self.work.len()];

        // ── Forward sweep ──

        for (alg_counter, el) in self.algorithm.iter().enumerate() {
            // Capture values about to be overwritten while still needed on
            // the reverse sweep.
            if nadir > 0 && el.op != OpTag::Output {
                for &r in &el.res {
                    if r != UNUSED && tt < tape.len() && tape[tt].0 == (alg_counter, r) {
                        tape[tt].1 = Some(swork[r as usize].clone());
                        tt += 1;
                    }
                }
            }

            match el.op {
                OpTag::Input => {
                    let ind = el.arg[0] as usize;
                    let r = el.res[0] as usize;
                    let sp_input = self.inputs[ind].sparsity().clone();
                    swork[r] = arg_used[ind].project(sp_input.clone());
                    for d in 0..nfdir {
                        let s = &fseed[d][ind];
                        dwork[r][d] = if s.nnz() == 0 {
                            Some(zero_of(s.shape()))
                        } else {
                            Some(s.project(sp_input.clone()))
                        };
                    }
                }
                OpTag::Output => {
                    let k = el.res[0] as usize;
                    let a = el.arg[0] as usize;
                    if !output_given {
                        res[k] = swork[a].clone();
                    }
                    for d in 0..nfdir {
                        fsens[d][k] = match &dwork[a][d] {
                            Some(v) => v.clone(),
                            None => zero_of(self.outputs[k].shape()),
                        };
                    }
                }
                OpTag::Parameter => {
                    let r = el.res[0] as usize;
                    swork[r] = el.node.as_ref().unwrap().clone();
                    for d in 0..nfdir {
                        dwork[r][d] = None;
                    }
                }
                _ => {
                    let node = el.node.as_ref().unwrap();

                    // Expressions for the operation results, if known.
                    let mut outputs: Vec<Option<Mx>> = el
                        .res
                        .iter()
                        .enumerate()
                        .map(|(i, &r)| {
                            if r != UNUSED && output_given {
                                Some(stored_output(node, i))
                            } else {
                                None
                            }
                        })
                        .collect();

                    let inputs: Vec<Option<Mx>> = el
                        .arg
                        .iter()
                        .map(|&a| {
                            if a == UNUSED {
                                None
                            } else {
                                Some(swork[a as usize].clone())
                            }
                        })
                        .collect();

                    // Forward seeds, lazily replacing absent entries by
                    // structural zeros. Direction zero's allocation is
                    // shared by later directions.
                    let mut fseed_p: Vec<Vec<Option<Mx>>> = vec![Vec::new(); nfdir];
                    for d in 0..nfdir {
                        fseed_p[d] = el
                            .arg
                            .iter()
                            .enumerate()
                            .map(|(iind, &a)| {
                                if a == UNUSED {
                                    return None;
                                }
                                let a = a as usize;
                                if is_empty_seed(&dwork[a][d]) {
                                    let z = if d > 0 && is_empty_seed(&dwork[a][0]) {
                                        dwork[a][0].clone()
                                    } else {
                                        None
                                    };
                                    dwork[a][d] = Some(z.unwrap_or_else(|| {
                                        zero_of(inputs[iind].as_ref().unwrap().shape())
                                    }));
                                }
                                dwork[a][d].clone()
                            })
                            .collect();
                    }
                    let mut fsens_p: Vec<Vec<Option<Mx>>> =
                        vec![vec![None; el.res.len()]; nfdir];

                    if !output_given || nfdir > 0 {
                        let no_adj: Vec<Vec<Option<Mx>>> = Vec::new();
                        let mut no_asens: Vec<Vec<Option<Mx>>> = Vec::new();
                        if node.node().is_call_class() {
                            // Drop directions whose seeds are all empty
                            // before delegating.
                            let retained = live_directions(&fseed_p);
                            if retained.is_empty() {
                                node.node().eval_symbolic(
                                    &inputs,
                                    &mut outputs,
                                    &[],
                                    &mut [],
                                    &no_adj,
                                    &mut no_asens,
                                    output_given,
                                )?;
                            } else if self.options.purge_seeds {
                                let seed_sub: Vec<Vec<Option<Mx>>> = retained
                                    .iter()
                                    .map(|&d| fseed_p[d].clone())
                                    .collect();
                                let mut sens_sub: Vec<Vec<Option<Mx>>> =
                                    vec![vec![None; el.res.len()]; retained.len()];
                                node.node().eval_symbolic(
                                    &inputs,
                                    &mut outputs,
                                    &seed_sub,
                                    &mut sens_sub,
                                    &no_adj,
                                    &mut no_asens,
                                    output_given,
                                )?;
                                for (j, &d) in retained.iter().enumerate() {
                                    fsens_p[d] = std::mem::take(&mut sens_sub[j]);
                                }
                            } else {
                                node.node().eval_symbolic(
                                    &inputs,
                                    &mut outputs,
                                    &fseed_p,
                                    &mut fsens_p,
                                    &no_adj,
                                    &mut no_asens,
                                    output_given,
                                )?;
                            }
                        } else {
                            node.node().eval_symbolic(
                                &inputs,
                                &mut outputs,
                                &fseed_p,
                                &mut fsens_p,
                                &no_adj,
                                &mut no_asens,
                                output_given,
                            )?;
                        }
                    }

                    // Save results to the work array only now, permitting
                    // in-place operator behaviour.
                    for (i, &r) in el.res.iter().enumerate() {
                        if r != UNUSED {
                            if let Some(v) = outputs[i].take() {
                                swork[r as usize] = v;
                            }
                        }
                    }
                    for d in 0..nfdir {
                        for (i, &r) in el.res.iter().enumerate() {
                            if r != UNUSED {
                                dwork[r as usize][d] = fsens_p[d][i].take();
                            }
                        }
                    }
                }
            }
        }

        // ── Reverse sweep ──

        if nadir > 0 {
            for slot in dwork.iter_mut() {
                for d in slot.iter_mut() {
                    *d = None;
                }
            }

            // Marker per slot: nonzero means the value must be read from
            // the spill tape entry `marker - 1` instead of the work array.
            let mut spill_ref: Vec<usize> = vec![0; self.work.len()];
            let mut tt: isize = tape.len() as isize - 1;

            for (alg_counter, el) in self.algorithm.iter().enumerate().rev() {
                // Mark spilled slots so operator inputs read the
                // forward-time value while outputs still see the current
                // one (the distinction matters for in-place operators).
                if el.op != OpTag::Output {
                    for &r in el.res.iter().rev() {
                        if r != UNUSED
                            && tt >= 0
                            && tape[tt as usize].0 == (alg_counter, r)
                        {
                            spill_ref[r as usize] = (tt + 1) as usize;
                            tt -= 1;
                        }
                    }
                }

                match el.op {
                    OpTag::Input => {
                        let ind = el.arg[0] as usize;
                        let r = el.res[0] as usize;
                        for (d, asens_d) in asens.iter_mut().enumerate().take(nadir) {
                            asens_d[ind] = match dwork[r][d].take() {
                                Some(v) if v.nnz() > 0 => v,
                                _ => zero_of(self.inputs[ind].shape()),
                            };
                        }
                    }
                    OpTag::Output => {
                        let k = el.res[0] as usize;
                        let a = el.arg[0] as usize;
                        for (d, aseed_d) in aseed.iter().enumerate().take(nadir) {
                            let seed = &aseed_d[k];
                            if seed.nnz() == 0 {
                                continue;
                            }
                            let seed = seed.project(self.outputs[k].sparsity().clone());
                            // Structural addition composes adjoints that
                            // flow through multiple consumers.
                            dwork[a][d] = Some(match dwork[a][d].take() {
                                Some(v) => &v + &seed,
                                None => seed,
                            });
                        }
                    }
                    OpTag::Parameter => {
                        let r = el.res[0] as usize;
                        for d in 0..nadir {
                            dwork[r][d] = None;
                        }
                    }
                    _ => {
                        let node = el.node.as_ref().unwrap();

                        if self.options.assert_smooth {
                            if let MxKind::Unary { op, .. } | MxKind::Binary { op, .. } =
                                &node.node().kind
                            {
                                if !ops::is_smooth(*op) {
                                    return Err(FunctionError::NonSmoothAdjoint(
                                        ops::print_pre(*op).trim_end_matches('('),
                                    ));
                                }
                            }
                        }

                        // Arguments, reading spilled values where marked.
                        let inputs: Vec<Option<Mx>> = el
                            .arg
                            .iter()
                            .map(|&a| {
                                if a == UNUSED {
                                    return None;
                                }
                                let a = a as usize;
                                Some(if spill_ref[a] != 0 {
                                    tape[spill_ref[a] - 1]
                                        .1
                                        .clone()
                                        .expect("spill entry not captured")
                                } else {
                                    swork[a].clone()
                                })
                            })
                            .collect();

                        let mut outputs: Vec<Option<Mx>> = el
                            .res
                            .iter()
                            .map(|&r| {
                                if r == UNUSED {
                                    None
                                } else {
                                    Some(swork[r as usize].clone())
                                }
                            })
                            .collect();

                        // Adjoint seeds, with lazy structural zeros.
                        let mut aseed_p: Vec<Vec<Option<Mx>>> = vec![Vec::new(); nadir];
                        for d in 0..nadir {
                            aseed_p[d] = el
                                .res
                                .iter()
                                .map(|&r| {
                                    if r == UNUSED {
                                        return None;
                                    }
                                    let r = r as usize;
                                    if is_empty_seed(&dwork[r][d]) {
                                        dwork[r][d] = Some(zero_of(swork[r].shape()));
                                    }
                                    dwork[r][d].clone()
                                })
                                .collect();
                        }
                        let mut asens_p: Vec<Vec<Option<Mx>>> =
                            vec![vec![None; el.arg.len()]; nadir];

                        let no_fwd: Vec<Vec<Option<Mx>>> = Vec::new();
                        let mut no_fsens: Vec<Vec<Option<Mx>>> = Vec::new();

                        if node.node().is_call_class() {
                            let retained = live_directions(&aseed_p);
                            if retained.is_empty() {
                                // Nothing to propagate.
                            } else if self.options.purge_seeds {
                                let seed_sub: Vec<Vec<Option<Mx>>> = retained
                                    .iter()
                                    .map(|&d| aseed_p[d].clone())
                                    .collect();
                                let mut sens_sub: Vec<Vec<Option<Mx>>> =
                                    vec![vec![None; el.arg.len()]; retained.len()];
                                node.node().eval_symbolic(
                                    &inputs,
                                    &mut outputs,
                                    &no_fwd,
                                    &mut no_fsens,
                                    &seed_sub,
                                    &mut sens_sub,
                                    true,
                                )?;
                                for (j, &d) in retained.iter().enumerate() {
                                    asens_p[d] = std::mem::take(&mut sens_sub[j]);
                                }
                            } else {
                                node.node().eval_symbolic(
                                    &inputs,
                                    &mut outputs,
                                    &no_fwd,
                                    &mut no_fsens,
                                    &aseed_p,
                                    &mut asens_p,
                                    true,
                                )?;
                            }
                        } else {
                            node.node().eval_symbolic(
                                &inputs,
                                &mut outputs,
                                &no_fwd,
                                &mut no_fsens,
                                &aseed_p,
                                &mut asens_p,
                                true,
                            )?;
                        }

                        // Consume the result seeds, then accumulate the
                        // argument contributions (ordering matters when a
                        // result slot aliases an argument slot).
                        for d in 0..nadir {
                            for &r in &el.res {
                                if r != UNUSED {
                                    dwork[r as usize][d] = None;
                                }
                            }
                        }
                        for (d, asens_pd) in asens_p.iter_mut().enumerate() {
                            for (c, contrib) in asens_pd.iter_mut().enumerate() {
                                let a = el.arg[c];
                                if a == UNUSED {
                                    continue;
                                }
                                if let Some(contrib) = contrib.take() {
                                    if contrib.nnz() == 0 {
                                        continue;
                                    }
                                    let slot = &mut dwork[a as usize][d];
                                    *slot = Some(match slot.take() {
                                        Some(v) => &v + &contrib,
                                        None => contrib,
                                    });
                                }
                            }
                        }
                    }
                }

                // Recover spilled values for records further up the tape
                // (delayed past the kernel for in-place operators).
                if el.op != OpTag::Output {
                    for &r in el.res.iter().rev() {
                        if r != UNUSED && spill_ref[r as usize] != 0 {
                            swork[r as usize] = tape[spill_ref[r as usize] - 1]
                                .1
                                .clone()
                                .expect("spill entry not captured");
                            spill_ref[r as usize] = 0;
                        }
                    }
                }
            }
        }

        trace!("eval_symbolic \"{}\": end", self.options.name);
        Ok((res, fsens, asens))
    }

    /// Pre-pass computing the spill tape: one entry per result slot that
    /// is overwritten while already in use.
    fn alloc_spill_tape(&self) -> Vec<((usize, u32), Option<Mx>)> {
        let mut in_use = vec![false; self.work.len()];
        let mut tape = Vec::new();
        for (alg_counter, el) in self.algorithm.iter().enumerate() {
            if el.op == OpTag::Output {
                continue;
            }
            for &r in &el.res {
                if r != UNUSED {
                    if in_use[r as usize] {
                        tape.push(((alg_counter, r), None));
                    } else {
                        in_use[r as usize] = true;
                    }
                }
            }
        }
        tape
    }

    fn check_symbolic_args(
        &self,
        args: &[Mx],
        fseed: &[Vec<Mx>],
        aseed: &[Vec<Mx>],
    ) -> Result<()> {
        if args.len() != self.inputs.len() {
            return Err(FunctionError::WrongArity {
                what: "arguments",
                expected: self.inputs.len(),
                got: args.len(),
            });
        }
        for (a, i) in args.iter().zip(self.inputs.iter()) {
            if a.shape() != i.shape() {
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
                if s.shape() != i.shape() {
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
                if s.shape() != o.shape() {
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
