//! Compiled matrix expression functions.
//!
//! An [`MxFunction`] compiles a set of output expressions over declared
//! symbolic inputs into a linear instruction tape for a small virtual
//! machine, then replays that tape numerically, over dependency bit-masks,
//! or symbolically with forward and adjoint derivative directions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::mx::expr::Mx;
use crate::mx::node::{MxKind, OpTag};
use crate::options::FunctionOptions;
use crate::sparsity::Sparsity;

// Submodules add impl blocks to MxFunction.
mod codegen;
mod expand;
mod jacobian;
mod numeric;
mod sparsity;
mod symbolic;

/// Null sentinel in tape `arg`/`res` vectors.
pub(crate) const UNUSED: u32 = u32::MAX;

/// One instruction tape record.
#[derive(Clone)]
pub(crate) struct AlgEl {
    /// Operator tag.
    pub op: OpTag,
    /// Owning handle to the node, for kernels and metadata. `None` for
    /// output sentinels.
    pub node: Option<Mx>,
    /// Work-slot indices of the inputs ([`UNUSED`] = null). For input
    /// sentinels, the single entry is the declared input position.
    pub arg: Vec<u32>,
    /// Work-slot indices of the results ([`UNUSED`] = ignored output). For
    /// output sentinels, the single entry is the declared output position.
    pub res: Vec<u32>,
}

/// A shareable, lockable handle to a compiled function, used by embedded
/// call operators.
///
/// A compiled function instance is not concurrent-safe: it owns its work
/// array. The mutex makes the single-caller discipline explicit; distinct
/// clones of the underlying function may run in parallel.
#[derive(Clone)]
pub struct FunctionRef {
    inner: Arc<Mutex<MxFunction>>,
    name: String,
    in_sp: Vec<Sparsity>,
    out_sp: Vec<Sparsity>,
}

impl FunctionRef {
    /// Wrap a function for embedding. The function need not be compiled
    /// yet; compilation of a caller fails if it still is not.
    pub fn new(f: MxFunction) -> Self {
        let name = f.options.name.clone();
        let in_sp = f.inputs.iter().map(|x| x.sparsity().clone()).collect();
        let out_sp = f.outputs.iter().map(|x| x.sparsity().clone()).collect();
        FunctionRef {
            inner: Arc::new(Mutex::new(f)),
            name,
            in_sp,
            out_sp,
        }
    }

    /// Name of the wrapped function.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of inputs.
    pub fn n_in(&self) -> usize {
        self.in_sp.len()
    }

    /// Number of outputs.
    pub fn n_out(&self) -> usize {
        self.out_sp.len()
    }

    /// Pattern of input `i`.
    pub fn sparsity_in(&self, i: usize) -> &Sparsity {
        &self.in_sp[i]
    }

    /// Pattern of output `k`.
    pub fn sparsity_out(&self, k: usize) -> &Sparsity {
        &self.out_sp[k]
    }

    /// Whether the wrapped function has been compiled.
    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, MxFunction> {
        self.inner.lock().expect("embedded function mutex poisoned")
    }

    /// Stable identity of the shared function, usable as a map key.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn same(a: &FunctionRef, b: &FunctionRef) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

/// A compiled matrix expression function.
#[derive(Clone)]
pub struct MxFunction {
    pub(crate) inputs: Vec<Mx>,
    pub(crate) outputs: Vec<Mx>,
    pub(crate) options: FunctionOptions,

    pub(crate) algorithm: Vec<AlgEl>,
    /// Declared pattern of every work slot, fixed for the compilation.
    pub(crate) slot_sparsity: Vec<Sparsity>,
    pub(crate) work: Vec<Matrix<f64>>,
    /// Bit-mask work array, one word per slot nonzero. A parallel
    /// allocation of the numeric work array.
    pub(crate) mask_work: Vec<Vec<u64>>,
    pub(crate) free_vars: Vec<Mx>,

    pub(crate) input_buf: Vec<Matrix<f64>>,
    pub(crate) output_buf: Vec<Matrix<f64>>,
    pub(crate) input_mask: Vec<Vec<u64>>,
    pub(crate) output_mask: Vec<Vec<u64>>,

    pub(crate) itmp: Vec<i64>,
    pub(crate) rtmp: Vec<f64>,

    pub(crate) initialized: bool,
}

impl MxFunction {
    /// Construct a function from declared inputs and output expressions.
    ///
    /// Every input must be a matrix-valued symbolic primitive, and the
    /// inputs must be pairwise independent (no primitive listed twice).
    pub fn new(inputs: Vec<Mx>, outputs: Vec<Mx>) -> Result<Self> {
        MxFunction::with_options(inputs, outputs, FunctionOptions::default())
    }

    /// Construct with explicit options.
    pub fn with_options(
        inputs: Vec<Mx>,
        outputs: Vec<Mx>,
        options: FunctionOptions,
    ) -> Result<Self> {
        if outputs.is_empty() {
            return Err(FunctionError::EmptyOutputList);
        }
        for (index, x) in inputs.iter().enumerate() {
            if !x.is_symbolic() {
                return Err(FunctionError::NonSymbolicInput { index });
            }
        }
        let mut seen = HashSet::new();
        for x in &inputs {
            if !seen.insert(x.id()) {
                return Err(FunctionError::DuplicateInput);
            }
        }
        Ok(MxFunction {
            inputs,
            outputs,
            options,
            algorithm: Vec::new(),
            slot_sparsity: Vec::new(),
            work: Vec::new(),
            mask_work: Vec::new(),
            free_vars: Vec::new(),
            input_buf: Vec::new(),
            output_buf: Vec::new(),
            input_mask: Vec::new(),
            output_mask: Vec::new(),
            itmp: Vec::new(),
            rtmp: Vec::new(),
            initialized: false,
        })
    }

    /// Compile the tape. Idempotent after success.
    ///
    /// Sorts the expression DAG depth first, assigns work-array slots with
    /// live-variable reuse keyed on sparsity identity, and records the
    /// free-variable list.
    pub fn init(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        debug!("init \"{}\": begin", self.options.name);

        // Sort the computational graph, with a sentinel after each output.
        let mut visited: HashSet<u64> = HashSet::new();
        let mut nodes: Vec<Option<Mx>> = Vec::new();
        for out in &self.outputs {
            sort_depth_first(out, &mut visited, &mut nodes);
            nodes.push(None);
        }

        // Inputs unreachable from the outputs still get tape records.
        for inp in &self.inputs {
            if visited.insert(inp.id()) {
                nodes.push(Some(inp.clone()));
            }
        }

        // Place of every node in the sorted list. This map takes the role
        // of a per-node scratch field; keeping it per-compilation makes
        // compilation reentrant.
        let mut temp: HashMap<u64, usize> = HashMap::new();
        for (i, n) in nodes.iter().enumerate() {
            if let Some(n) = n {
                temp.insert(n.id(), i);
            }
        }

        const NOWHERE: usize = usize::MAX;
        let mut place_in_alg: Vec<usize> = Vec::with_capacity(nodes.len());
        let mut symb_loc: Vec<(usize, Mx)> = Vec::new();
        let mut refcount: Vec<usize> = vec![0; nodes.len()];
        let mut curr_oind = 0usize;

        self.algorithm.clear();
        self.algorithm.reserve(nodes.len());

        for (flat, n) in nodes.iter().enumerate() {
            match n {
                None => {
                    // Output sentinel.
                    let arg = temp[&self.outputs[curr_oind].id()] as u32;
                    refcount[arg as usize] += 1;
                    place_in_alg.push(self.algorithm.len());
                    self.algorithm.push(AlgEl {
                        op: OpTag::Output,
                        node: None,
                        arg: vec![arg],
                        res: vec![curr_oind as u32],
                    });
                    curr_oind += 1;
                }
                Some(n) if matches!(n.node().kind, MxKind::FunctionOutput { .. }) => {
                    // Not a record of its own: forward the slot assignment
                    // to the producing node's result vector.
                    let (dep, oind) = match &n.node().kind {
                        MxKind::FunctionOutput { dep, oind } => (dep, *oind),
                        _ => unreachable!(),
                    };
                    let pind = place_in_alg[temp[&dep.id()]];
                    let slot = &mut self.algorithm[pind].res[oind];
                    if *slot == UNUSED {
                        *slot = flat as u32;
                    } else {
                        // Duplicate accessor: share the first one's place.
                        temp.insert(n.id(), *slot as usize);
                    }
                    place_in_alg.push(NOWHERE);
                }
                Some(n) => {
                    let op = n.node().op_tag();
                    if op == OpTag::Parameter {
                        symb_loc.push((self.algorithm.len(), n.clone()));
                    }
                    if let MxKind::Call { fref, .. } = &n.node().kind {
                        if !fref.is_initialized() {
                            return Err(FunctionError::UninitializedDependency {
                                name: fref.name().to_string(),
                            });
                        }
                    }
                    let nd = n.node().n_deps();
                    let mut arg = Vec::with_capacity(nd);
                    for i in 0..nd {
                        let a = temp[&n.node().dep(i).id()] as u32;
                        refcount[a as usize] += 1;
                        arg.push(a);
                    }
                    let mut res = vec![UNUSED; n.node().n_outputs()];
                    if !n.node().is_multiple_output() {
                        res[0] = flat as u32;
                    }
                    place_in_alg.push(self.algorithm.len());
                    self.algorithm.push(AlgEl {
                        op,
                        node: Some(n.clone()),
                        arg,
                        res,
                    });
                }
            }
        }

        // Assign work-array slots, reusing freed slots of identical
        // sparsity (last in, first out). For operators declaring in-place
        // arguments, those arguments are freed before result allocation so
        // a result may alias them.
        let live = self.options.live_variables;
        let mut place: Vec<u32> = vec![UNUSED; nodes.len()];
        let mut unused_all: HashMap<usize, Vec<u32>> = HashMap::new();
        let mut worksize: u32 = 0;

        for el in &mut self.algorithm {
            let mut first_to_free = 0usize;
            let mut last_to_free = if el.op == OpTag::Output {
                1
            } else {
                el.node.as_ref().map_or(0, |n| n.node().n_inplace())
            };
            for task in 0..2 {
                // Reverse order so the first argument ends up on top of
                // the free stack.
                for c in (first_to_free..last_to_free).rev() {
                    let flat = el.arg[c] as usize;
                    if el.arg[c] != UNUSED {
                        refcount[flat] -= 1;
                        if live && refcount[flat] == 0 {
                            let key = nodes[flat]
                                .as_ref()
                                .expect("sentinel cannot be an argument")
                                .sparsity()
                                .key();
                            unused_all.entry(key).or_default().push(place[flat]);
                        }
                        el.arg[c] = place[flat];
                    }
                }

                if el.op == OpTag::Output || task == 1 {
                    break;
                }
                first_to_free = last_to_free;
                last_to_free = el.arg.len();

                for c in 0..el.res.len() {
                    if el.res[c] != UNUSED {
                        let flat = el.res[c] as usize;
                        let node = el.node.as_ref().expect("result without node");
                        let key = node.node().output_sparsity(c).key();
                        let reused = if live {
                            unused_all.get_mut(&key).and_then(Vec::pop)
                        } else {
                            None
                        };
                        let slot = match reused {
                            Some(s) => s,
                            None => {
                                let s = worksize;
                                worksize += 1;
                                s
                            }
                        };
                        el.res[c] = slot;
                        place[flat] = slot;
                    }
                }
            }
        }

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

        // Fix the pattern of every slot and collect scratch maxima.
        let mut slot_sp: Vec<Option<Sparsity>> = vec![None; worksize as usize];
        let mut nitmp = 0usize;
        let mut nrtmp = 0usize;
        for el in &self.algorithm {
            if el.op == OpTag::Output {
                continue;
            }
            let node = el.node.as_ref().unwrap();
            let (ni, nr) = node.node().scratch_need();
            nitmp = nitmp.max(ni);
            nrtmp = nrtmp.max(nr);
            for (c, &r) in el.res.iter().enumerate() {
                if r != UNUSED && slot_sp[r as usize].is_none() {
                    slot_sp[r as usize] = Some(node.node().output_sparsity(c).clone());
                }
            }
        }
        self.slot_sparsity = slot_sp
            .into_iter()
            .map(|sp| sp.expect("slot never written"))
            .collect();
        self.work = self
            .slot_sparsity
            .iter()
            .map(|sp| Matrix::zeros(sp.clone()))
            .collect();
        self.mask_work = self
            .slot_sparsity
            .iter()
            .map(|sp| vec![0u64; sp.nnz()])
            .collect();
        self.itmp = vec![0; nitmp];
        self.rtmp = vec![0.0; nrtmp];

        // Match parameter records against the declared inputs; the rest
        // are free variables.
        let mut marker: HashMap<u64, usize> = HashMap::new();
        for (alg_idx, node) in &symb_loc {
            marker.insert(node.id(), *alg_idx);
        }
        for (ind, inp) in self.inputs.iter().enumerate() {
            if let Some(alg_idx) = marker.remove(&inp.id()) {
                let el = &mut self.algorithm[alg_idx];
                el.op = OpTag::Input;
                el.arg = vec![ind as u32];
            }
        }
        self.free_vars = symb_loc
            .iter()
            .filter(|(_, n)| marker.contains_key(&n.id()))
            .map(|(_, n)| n.clone())
            .collect();

        // I/O buffers, numeric and mask.
        self.input_buf = self
            .inputs
            .iter()
            .map(|x| Matrix::zeros(x.sparsity().clone()))
            .collect();
        self.output_buf = self
            .outputs
            .iter()
            .map(|x| Matrix::zeros(x.sparsity().clone()))
            .collect();
        self.input_mask = self.inputs.iter().map(|x| vec![0u64; x.nnz()]).collect();
        self.output_mask = self.outputs.iter().map(|x| vec![0u64; x.nnz()]).collect();

        self.initialized = true;
        debug!("init \"{}\": end", self.options.name);
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

    /// Declared input expressions.
    pub fn input_exprs(&self) -> &[Mx] {
        &self.inputs
    }

    /// Declared output expressions.
    pub fn output_exprs(&self) -> &[Mx] {
        &self.outputs
    }

    /// Pattern of input `i`.
    pub fn input_sparsity(&self, i: usize) -> &Sparsity {
        self.inputs[i].sparsity()
    }

    /// Pattern of output `k`.
    pub fn output_sparsity(&self, k: usize) -> &Sparsity {
        self.outputs[k].sparsity()
    }

    /// Function name, from the options.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Whether `init` has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Parameters reachable from the outputs but not declared as inputs.
    /// Numeric evaluation fails while this list is nonempty.
    pub fn free_variables(&self) -> &[Mx] {
        &self.free_vars
    }

    /// Size of the work array after compilation.
    pub fn work_size(&self) -> usize {
        self.work.len()
    }

    /// Number of tape records, sentinels included.
    pub fn n_instructions(&self) -> usize {
        self.algorithm.len()
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

    /// Names of the free variables, for error reporting.
    pub(crate) fn free_var_names(&self) -> Vec<String> {
        self.free_vars
            .iter()
            .map(|v| v.name().unwrap_or("?").to_string())
            .collect()
    }
}

/// Post-order depth-first sort with an explicit stack, guarded by the
/// visited set so shared subexpressions appear once.
fn sort_depth_first(start: &Mx, visited: &mut HashSet<u64>, nodes: &mut Vec<Option<Mx>>) {
    if !visited.insert(start.id()) {
        return;
    }
    let mut stack: Vec<(Mx, usize)> = vec![(start.clone(), 0)];
    while let Some((node, child)) = stack.pop() {
        if child < node.node().n_deps() {
            stack.push((node.clone(), child + 1));
            let d = node.node().dep(child).clone();
            if visited.insert(d.id()) {
                stack.push((d, 0));
            }
        } else {
            nodes.push(Some(node));
        }
    }
}
