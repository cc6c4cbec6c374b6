//! Compiled scalar expression functions.
//!
//! The scalar tape is fully linearised: every record is a flat
//! `(op, i0, i1, i2)` quadruple plus a literal, since every scalar
//! operation is at most binary with one output. The same depth-first sort
//! and live-variable allocation as the matrix layer apply, with a single
//! free-slot stack because all scalar slots are interchangeable.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::options::FunctionOptions;
use crate::sx::node::SxElem;
use crate::sx::ops::{self, ScalarOp};

// Submodules add impl blocks to SxFunction.
mod codegen;
mod numeric;
mod sparsity;
mod symbolic;

/// One scalar tape record.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SxAlgEl {
    /// Operation.
    pub op: ScalarOp,
    /// Result work index; for output sentinels, the output position.
    pub i0: u32,
    /// First argument work index; for I/O sentinels, the input or output
    /// position context (see the builder).
    pub i1: u32,
    /// Second argument work index (equal to `i1` for unary operations);
    /// for I/O sentinels, the nonzero offset.
    pub i2: u32,
    /// Literal value of constant records.
    pub d: f64,
}

/// Number of work-array dependencies of a tape record.
fn tape_ndeps(op: ScalarOp) -> usize {
    match op {
        ScalarOp::Input | ScalarOp::Const | ScalarOp::Parameter => 0,
        ScalarOp::Output => 1,
        _ => ops::n_deps(op),
    }
}

/// A compiled scalar expression function.
#[derive(Clone)]
pub struct SxFunction {
    pub(crate) inputs: Vec<Matrix<SxElem>>,
    pub(crate) outputs: Vec<Matrix<SxElem>>,
    pub(crate) options: FunctionOptions,

    pub(crate) algorithm: Vec<SxAlgEl>,
    pub(crate) worksize: usize,
    pub(crate) work: Vec<f64>,
    /// Bit-mask work array, a parallel allocation of the numeric one.
    pub(crate) mask_work: Vec<u64>,

    /// Constant nodes in tape order, replayed during symbolic evaluation.
    pub(crate) constants: Vec<SxElem>,
    /// Operation nodes in tape order, replayed during symbolic evaluation.
    pub(crate) operations: Vec<SxElem>,
    pub(crate) free_vars: Vec<SxElem>,

    pub(crate) input_buf: Vec<Matrix<f64>>,
    pub(crate) output_buf: Vec<Matrix<f64>>,
    pub(crate) input_mask: Vec<Vec<u64>>,
    pub(crate) output_mask: Vec<Vec<u64>>,

    pub(crate) initialized: bool,
}

impl SxFunction {
    /// Construct a function from declared inputs and output expressions.
    ///
    /// Every nonzero of every input must be a scalar symbol, and no symbol
    /// may appear twice across the inputs.
    pub fn new(inputs: Vec<Matrix<SxElem>>, outputs: Vec<Matrix<SxElem>>) -> Result<Self> {
        SxFunction::with_options(inputs, outputs, FunctionOptions::default())
    }

    /// Construct with explicit options.
    pub fn with_options(
        inputs: Vec<Matrix<SxElem>>,
        outputs: Vec<Matrix<SxElem>>,
        options: FunctionOptions,
    ) -> Result<Self> {
        if outputs.is_empty() {
            return Err(FunctionError::EmptyOutputList);
        }
        for (index, m) in inputs.iter().enumerate() {
            if m.data().iter().any(|e| !e.is_symbol()) {
                return Err(FunctionError::NonSymbolicInput { index });
            }
        }
        let mut seen = HashSet::new();
        for m in &inputs {
            for e in m.data() {
                if !seen.insert(e.id()) {
                    return Err(FunctionError::DuplicateInput);
                }
            }
        }
        Ok(SxFunction {
            inputs,
            outputs,
            options,
            algorithm: Vec::new(),
            worksize: 0,
            work: Vec::new(),
            mask_work: Vec::new(),
            constants: Vec::new(),
            operations: Vec::new(),
            free_vars: Vec::new(),
            input_buf: Vec::new(),
            output_buf: Vec::new(),
            input_mask: Vec::new(),
            output_mask: Vec::new(),
            initialized: false,
        })
    }

    /// Compile the tape. Idempotent after success.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        debug!("init \"{}\": begin", self.options.name);

        // Depth-first sort, one sentinel per output nonzero.
        let mut visited: HashSet<u64> = HashSet::new();
        let mut nodes: Vec<Option<SxElem>> = Vec::new();
        for out in &self.outputs {
            for e in out.data() {
                sort_depth_first(e, &mut visited, &mut nodes);
                nodes.push(None);
            }
        }
        for inp in &self.inputs {
            for e in inp.data() {
                if visited.insert(e.id()) {
                    nodes.push(Some(e.clone()));
                }
            }
        }

        let mut temp: HashMap<u64, usize> = HashMap::new();
        for (i, n) in nodes.iter().enumerate() {
            if let Some(n) = n {
                temp.insert(n.id(), i);
            }
        }

        // Constants and operations in tape order, for symbolic replay.
        self.constants.clear();
        self.operations.clear();
        for n in nodes.iter().flatten() {
            if n.is_const() {
                self.constants.push(n.clone());
            } else if !n.is_symbol() {
                self.operations.push(n.clone());
            }
        }

        let live = self.options.live_variables;
        let mut symb_loc: Vec<(usize, SxElem)> = Vec::new();
        let mut refcount: Vec<usize> = vec![0; nodes.len()];

        // Current output and nonzero, skipping empty outputs.
        let mut curr_oind = 0usize;
        let mut curr_nz = 0usize;
        while curr_oind < self.outputs.len() && self.outputs[curr_oind].nnz() == 0 {
            curr_oind += 1;
        }

        self.algorithm.clear();
        self.algorithm.reserve(nodes.len());
        for n in &nodes {
            let mut el = SxAlgEl {
                op: ScalarOp::Const,
                i0: 0,
                i1: 0,
                i2: 0,
                d: 0.0,
            };
            match n {
                None => {
                    el.op = ScalarOp::Output;
                    el.i0 = curr_oind as u32;
                    el.i1 = temp[&self.outputs[curr_oind].data()[curr_nz].id()] as u32;
                    el.i2 = curr_nz as u32;
                    curr_nz += 1;
                    if curr_nz >= self.outputs[curr_oind].nnz() {
                        curr_nz = 0;
                        curr_oind += 1;
                        while curr_oind < self.outputs.len()
                            && self.outputs[curr_oind].nnz() == 0
                        {
                            curr_oind += 1;
                        }
                    }
                }
                Some(n) if n.is_const() => {
                    el.op = ScalarOp::Const;
                    el.d = n.const_value().unwrap();
                    el.i0 = temp[&n.id()] as u32;
                }
                Some(n) if n.is_symbol() => {
                    el.op = ScalarOp::Parameter;
                    symb_loc.push((self.algorithm.len(), n.clone()));
                    el.i0 = temp[&n.id()] as u32;
                }
                Some(n) => {
                    el.op = n.op_tag();
                    el.i0 = temp[&n.id()] as u32;
                    el.i1 = temp[&n.dep(0).id()] as u32;
                    el.i2 = if n.n_deps() > 1 {
                        temp[&n.dep(1).id()] as u32
                    } else {
                        el.i1
                    };
                }
            }
            for c in 0..tape_ndeps(el.op) {
                let ch = if c == 0 { el.i1 } else { el.i2 };
                refcount[ch as usize] += 1;
            }
            self.algorithm.push(el);
        }

        // Live-variable allocation over a single free stack.
        let mut place: Vec<u32> = vec![u32::MAX; nodes.len()];
        let mut unused: Vec<u32> = Vec::new();
        let mut worksize: u32 = 0;
        for el in &mut self.algorithm {
            let ndeps = tape_ndeps(el.op);
            // Reverse order so the first argument ends up on top.
            for c in (0..ndeps).rev() {
                let ch = if c == 0 { el.i1 } else { el.i2 } as usize;
                refcount[ch] -= 1;
                if refcount[ch] == 0 && live {
                    unused.push(place[ch]);
                }
            }
            if el.op != ScalarOp::Output {
                let slot = if live {
                    unused.pop()
                } else {
                    None
                };
                let slot = match slot {
                    Some(s) => s,
                    None => {
                        let s = worksize;
                        worksize += 1;
                        s
                    }
                };
                place[el.i0 as usize] = slot;
                el.i0 = slot;
            }
            for c in 0..ndeps {
                if c == 0 {
                    el.i1 = place[el.i1 as usize];
                } else {
                    el.i2 = place[el.i2 as usize];
                }
            }
            // Unary operations repeat the first argument so every
            // operation can be dispatched as binary.
            if ndeps == 1 && el.op != ScalarOp::Output {
                el.i2 = el.i1;
            }
        }
        self.worksize = worksize as usize;

        if live {
            debug!(
                "init \"{}\": live variables, work array {} instead of {}",
                self.options.name,
                worksize,
                nodes.len()
            );
        } else {
            debug!("init \"{}\": live variables disabled", self.options.name);
        }

        self.work = vec![f64::NAN; self.worksize];
        self.mask_work = vec![0; self.worksize];

        // Match parameter records against the declared input nonzeros; the
        // rest are free variables.
        let mut marker: HashMap<u64, usize> = HashMap::new();
        for (alg_idx, node) in &symb_loc {
            marker.insert(node.id(), *alg_idx);
        }
        for (ind, inp) in self.inputs.iter().enumerate() {
            for (nz, e) in inp.data().iter().enumerate() {
                if let Some(alg_idx) = marker.remove(&e.id()) {
                    let el = &mut self.algorithm[alg_idx];
                    el.op = ScalarOp::Input;
                    el.i1 = ind as u32;
                    el.i2 = nz as u32;
                }
            }
        }
        self.free_vars = symb_loc
            .iter()
            .filter(|(_, n)| marker.contains_key(&n.id()))
            .map(|(_, n)| n.clone())
            .collect();

        self.input_buf = self
            .inputs
            .iter()
            .map(|m| Matrix::zeros(m.sparsity().clone()))
            .collect();
        self.output_buf = self
            .outputs
            .iter()
            .map(|m| Matrix::zeros(m.sparsity().clone()))
            .collect();
        self.input_mask = self.inputs.iter().map(|m| vec![0u64; m.nnz()]).collect();
        self.output_mask = self.outputs.iter().map(|m| vec![0u64; m.nnz()]).collect();

        self.initialized = true;
        debug!(
            "init \"{}\": {} elementary operations",
            self.options.name,
            self.algorithm.len()
        );
        Ok(())
    }

    /// Number of declared inputs.
    pub fn n_in(&self) -> usize {
        self.inputs.len()
    }

    /// Number of declared outputs.
    pub fn n_out(&self) -> usize {
        self.outputs.len()
    }

    /// Declared input matrices.
    pub fn input_exprs(&self) -> &[Matrix<SxElem>] {
        &self.inputs
    }

    /// Declared output matrices.
    pub fn output_exprs(&self) -> &[Matrix<SxElem>] {
        &self.outputs
    }

    /// Function name, from the options.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Whether `init` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Scalar symbols reachable from the outputs but not declared as
    /// inputs.
    pub fn free_variables(&self) -> &[SxElem] {
        &self.free_vars
    }

    /// Size of the work array after compilation.
    pub fn work_size(&self) -> usize {
        self.worksize
    }

    /// Number of tape records, sentinels included.
    pub fn n_instructions(&self) -> usize {
        self.algorithm.len()
    }

    /// Whether every operation on the tape is differentiable everywhere.
    pub fn is_smooth(&self) -> bool {
        assert!(self.initialized, "function not initialized");
        self.algorithm
            .iter()
            .all(|el| tape_ndeps(el.op) == 0 || el.op == ScalarOp::Output || ops::is_smooth(el.op))
    }

    /// Populate input buffer `i`, projecting between patterns of equal
    /// shape.
    pub fn set_input(&mut self, i: usize, value: &Matrix<f64>) -> Result<()> {
        assert!(self.initialized, "function not initialized");
        if i >= self.inputs.len() {
            return Err(FunctionError::WrongArity {
                what: "input index",
                expected: self.inputs.len(),
                got: i,
            });
        }
        if value.shape() != self.input_buf[i].shape() {
            return Err(FunctionError::ShapeMismatch {
                what: "input buffer",
                expected: self.input_buf[i].sparsity().describe(),
                got: value.sparsity().describe(),
            });
        }
        self.input_buf[i].project_from(value);
        Ok(())
    }

    /// Read output buffer `k` after a successful `evaluate`.
    pub fn get_output(&self, k: usize) -> Result<&Matrix<f64>> {
        assert!(self.initialized, "function not initialized");
        if k >= self.outputs.len() {
            return Err(FunctionError::WrongArity {
                what: "output index",
                expected: self.outputs.len(),
                got: k,
            });
        }
        Ok(&self.output_buf[k])
    }

    pub(crate) fn free_var_names(&self) -> Vec<String> {
        self.free_vars
            .iter()
            .map(|v| v.name().unwrap_or("?").to_string())
            .collect()
    }
}

/// Post-order depth-first sort with an explicit stack, guarded by the
/// visited set.
fn sort_depth_first(start: &SxElem, visited: &mut HashSet<u64>, nodes: &mut Vec<Option<SxElem>>) {
    if !visited.insert(start.id()) {
        return;
    }
    let mut stack: Vec<(SxElem, usize)> = vec![(start.clone(), 0)];
    while let Some((node, child)) = stack.pop() {
        if child < node.n_deps() {
            stack.push((node.clone(), child + 1));
            let d = node.dep(child).clone();
            if visited.insert(d.id()) {
                stack.push((d, 0));
            }
        } else {
            nodes.push(Some(node));
        }
    }
}
