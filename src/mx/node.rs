//! Matrix expression nodes.
//!
//! The closed operator set is a sum type with per-variant data; open-ended
//! operators (linear solves, user-defined kernels) enter through the
//! [`OpKernel`] trait object. Multi-output operators are single nodes
//! producing a tuple; per-output access goes through lightweight
//! function-output wrappers that never reach the instruction tape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::matrix::Matrix;
use crate::mx::expr::Mx;
use crate::mx::function::FunctionRef;
use crate::sparsity::Sparsity;
use crate::sx::node::SxElem;
use crate::sx::ops::ScalarOp;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Operator tags, the dispatch currency of the instruction tape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpTag {
    /// Read a function input into a work slot.
    Input,
    /// Write a work slot to a function output.
    Output,
    /// Free symbolic parameter.
    Parameter,
    /// Constant matrix.
    Const,
    /// Elementwise unary operation.
    Unary,
    /// Elementwise binary operation (equal patterns or scalar broadcast).
    Binary,
    /// Pattern change: gather into a new sparsity, zero fill.
    Project,
    /// Gather selected nonzeros.
    GetNonzeros,
    /// Overwrite selected nonzeros of the first argument.
    SetNonzeros,
    /// Add into selected nonzeros of the first argument.
    AddNonzeros,
    /// Sum of all nonzeros, 1x1 result.
    SumNz,
    /// Marked intermediate: identity on its first argument.
    Lift,
    /// Embedded function call (multi-output).
    Call,
    /// Open-ended operator behind an [`OpKernel`] trait object.
    External,
}

/// Contract for open-ended operators (linear solves, user-defined kernels).
///
/// An external operator declares its output patterns at construction and
/// supplies the same kernels the built-in operators have. The `inputs`
/// slices follow the in-place convention: for operators declaring
/// `n_inplace() == m`, a `None` among the first `m` inputs means the
/// corresponding result buffer already holds that argument's value.
pub trait OpKernel: Send + Sync {
    /// Operator name, used in dumps and error messages.
    fn name(&self) -> &'static str;

    /// Number of outputs.
    fn n_outputs(&self) -> usize {
        1
    }

    /// Sparsity of output `k`, given the argument patterns.
    fn output_sparsity(&self, k: usize, inputs: &[Sparsity]) -> Sparsity;

    /// How many leading arguments may share storage with results.
    fn n_inplace(&self) -> usize {
        0
    }

    /// `(integer, real)` scratch requirements of the numeric kernel.
    fn scratch_need(&self) -> (usize, usize) {
        (0, 0)
    }

    /// Numeric evaluation.
    fn eval_numeric(
        &self,
        inputs: &[Option<&Matrix<f64>>],
        outputs: &mut [Option<&mut Matrix<f64>>],
        itmp: &mut [i64],
        rtmp: &mut [f64],
    ) -> Result<()>;

    /// Bit-parallel sparsity propagation; `forward` selects the direction.
    ///
    /// Input masks are owned copies of the argument slots (`None` when
    /// aliased with a result); reverse-mode contributions or-ed into them
    /// are merged back by the evaluator.
    fn eval_sparsity(
        &self,
        inputs: &mut [Option<Vec<u64>>],
        outputs: &mut [Option<Vec<u64>>],
        forward: bool,
    ) -> Result<()>;

    /// Symbolic evaluation with forward and adjoint directions.
    ///
    /// `asens` entries are *contributions*; the evaluator accumulates them
    /// into the adjoint work array and clears consumed result seeds.
    #[allow(clippy::too_many_arguments)]
    fn eval_symbolic(
        &self,
        inputs: &[Option<Mx>],
        outputs: &mut [Option<Mx>],
        fseed: &[Vec<Option<Mx>>],
        fsens: &mut [Vec<Option<Mx>>],
        aseed: &[Vec<Option<Mx>>],
        asens: &mut [Vec<Option<Mx>>],
        output_given: bool,
    ) -> Result<()>;

    /// Scalar-matrix evaluation, used when a matrix function is expanded
    /// into a scalar one. Optional.
    fn eval_sx(
        &self,
        _inputs: &[Option<&Matrix<SxElem>>],
        _outputs: &mut [Option<&mut Matrix<SxElem>>],
    ) -> Result<()> {
        Err(crate::error::FunctionError::UnsupportedOperation(
            "scalar expansion of external operator",
        ))
    }

    /// Emit one C statement block computing this operator. Optional.
    fn emit_code(
        &self,
        _out: &mut String,
        _arg_names: &[String],
        _res_names: &[String],
        _gen: &mut crate::codegen::CodeGenerator,
    ) -> Result<()> {
        Err(crate::error::FunctionError::UnsupportedOperation(
            "code emission for external operator",
        ))
    }
}

#[derive(Clone)]
pub(crate) enum MxKind {
    /// Free matrix-valued symbolic primitive.
    Parameter { name: String },
    /// Constant matrix.
    Const { value: Matrix<f64> },
    /// Elementwise unary operation on the nonzeros.
    Unary { op: ScalarOp, dep: Mx },
    /// Elementwise binary operation. Operands have equal patterns, or one
    /// is a dense scalar (broadcast).
    Binary { op: ScalarOp, deps: [Mx; 2] },
    /// Gather into a target pattern, zero where absent in the source.
    Project { dep: Mx },
    /// Gather `nz[k]` from the argument's nonzeros.
    GetNonzeros { dep: Mx, nz: Vec<u32> },
    /// `dest` with nonzeros at `nz` replaced by `src` (deps = [dest, src]).
    SetNonzeros { deps: [Mx; 2], nz: Vec<u32> },
    /// `dest` with `src` added into nonzeros at `nz` (deps = [dest, src]).
    AddNonzeros { deps: [Mx; 2], nz: Vec<u32> },
    /// Sum of all nonzeros.
    SumNz { dep: Mx },
    /// Identity on `deps[0]`; `deps[1]` carries the initial guess.
    Lift { deps: [Mx; 2] },
    /// Embedded function call.
    Call { fref: FunctionRef, deps: Vec<Mx> },
    /// Open-ended operator.
    External {
        kernel: Arc<dyn OpKernel>,
        deps: Vec<Mx>,
    },
    /// Accessor for output `oind` of a multi-output node. Never emitted as
    /// a tape record; its slot assignment is forwarded to the producer.
    FunctionOutput { dep: Mx, oind: usize },
}

pub(crate) struct MxNode {
    pub(crate) id: u64,
    pub(crate) kind: MxKind,
    /// One pattern per output.
    pub(crate) sp: Vec<Sparsity>,
}

impl MxNode {
    pub(crate) fn new(kind: MxKind, sp: Vec<Sparsity>) -> Self {
        MxNode {
            id: fresh_id(),
            kind,
            sp,
        }
    }

    pub(crate) fn op_tag(&self) -> OpTag {
        match &self.kind {
            MxKind::Parameter { .. } => OpTag::Parameter,
            MxKind::Const { .. } => OpTag::Const,
            MxKind::Unary { .. } => OpTag::Unary,
            MxKind::Binary { .. } => OpTag::Binary,
            MxKind::Project { .. } => OpTag::Project,
            MxKind::GetNonzeros { .. } => OpTag::GetNonzeros,
            MxKind::SetNonzeros { .. } => OpTag::SetNonzeros,
            MxKind::AddNonzeros { .. } => OpTag::AddNonzeros,
            MxKind::SumNz { .. } => OpTag::SumNz,
            MxKind::Lift { .. } => OpTag::Lift,
            MxKind::Call { .. } => OpTag::Call,
            MxKind::External { .. } => OpTag::External,
            MxKind::FunctionOutput { .. } => unreachable!("wrapper has no tape tag"),
        }
    }

    pub(crate) fn n_deps(&self) -> usize {
        match &self.kind {
            MxKind::Parameter { .. } | MxKind::Const { .. } => 0,
            MxKind::Unary { .. }
            | MxKind::Project { .. }
            | MxKind::GetNonzeros { .. }
            | MxKind::SumNz { .. }
            | MxKind::FunctionOutput { .. } => 1,
            MxKind::Binary { .. }
            | MxKind::SetNonzeros { .. }
            | MxKind::AddNonzeros { .. }
            | MxKind::Lift { .. } => 2,
            MxKind::Call { deps, .. } | MxKind::External { deps, .. } => deps.len(),
        }
    }

    pub(crate) fn dep(&self, i: usize) -> &Mx {
        match (&self.kind, i) {
            (MxKind::Unary { dep, .. }, 0)
            | (MxKind::Project { dep }, 0)
            | (MxKind::GetNonzeros { dep, .. }, 0)
            | (MxKind::SumNz { dep }, 0)
            | (MxKind::FunctionOutput { dep, .. }, 0) => dep,
            (MxKind::Binary { deps, .. }, _)
            | (MxKind::SetNonzeros { deps, .. }, _)
            | (MxKind::AddNonzeros { deps, .. }, _)
            | (MxKind::Lift { deps }, _) => &deps[i],
            (MxKind::Call { deps, .. }, _) | (MxKind::External { deps, .. }, _) => &deps[i],
            _ => panic!("dependency index out of range"),
        }
    }

    pub(crate) fn n_outputs(&self) -> usize {
        self.sp.len()
    }

    pub(crate) fn output_sparsity(&self, k: usize) -> &Sparsity {
        &self.sp[k]
    }

    pub(crate) fn is_multiple_output(&self) -> bool {
        self.sp.len() > 1
    }

    /// How many leading arguments may share storage with results.
    pub(crate) fn n_inplace(&self) -> usize {
        match &self.kind {
            MxKind::SetNonzeros { .. } | MxKind::AddNonzeros { .. } => 1,
            MxKind::External { kernel, .. } => kernel.n_inplace(),
            _ => 0,
        }
    }

    /// `(integer, real)` scratch needed by the numeric kernel.
    pub(crate) fn scratch_need(&self) -> (usize, usize) {
        match &self.kind {
            MxKind::External { kernel, .. } => kernel.scratch_need(),
            _ => (0, 0),
        }
    }

    /// Whether this operator delegates to an embedded function or kernel.
    /// These are the operators whose derivative directions are purged.
    pub(crate) fn is_call_class(&self) -> bool {
        matches!(self.kind, MxKind::Call { .. } | MxKind::External { .. })
    }

    /// Text fragment printed before argument `k` in tape dumps; fragment
    /// `n_deps()` closes the expression.
    pub(crate) fn print_part(&self, k: usize) -> String {
        match &self.kind {
            MxKind::Parameter { name } => name.clone(),
            MxKind::Const { value } => format!("const<{}>", value.sparsity().describe()),
            MxKind::Unary { op, .. } => {
                if k == 0 {
                    crate::sx::ops::print_pre(*op).to_string()
                } else {
                    crate::sx::ops::print_post(*op).to_string()
                }
            }
            MxKind::Binary { op, .. } => match k {
                0 => crate::sx::ops::print_pre(*op).to_string(),
                1 => crate::sx::ops::print_sep(*op).to_string(),
                _ => crate::sx::ops::print_post(*op).to_string(),
            },
            MxKind::Project { .. } => match k {
                0 => "project(".to_string(),
                _ => format!(", {})", self.sp[0].describe()),
            },
            MxKind::GetNonzeros { nz, .. } => match k {
                0 => String::new(),
                _ => format!("[{}]", fmt_indices(nz)),
            },
            MxKind::SetNonzeros { nz, .. } | MxKind::AddNonzeros { nz, .. } => {
                // Printed specially by the tape dump; part 1 separates
                // destination and source.
                let assign = if matches!(self.kind, MxKind::AddNonzeros { .. }) {
                    "+="
                } else {
                    "="
                };
                match k {
                    1 => format!("[{}] {} ", fmt_indices(nz), assign),
                    _ => String::new(),
                }
            }
            MxKind::SumNz { .. } => {
                if k == 0 {
                    "sumnz(".to_string()
                } else {
                    ")".to_string()
                }
            }
            MxKind::Lift { .. } => match k {
                0 => "lift(".to_string(),
                1 => ", ".to_string(),
                _ => ")".to_string(),
            },
            MxKind::Call { fref, .. } => {
                if k == 0 {
                    format!("{}(", fref.name())
                } else if k == self.n_deps() {
                    ")".to_string()
                } else {
                    ", ".to_string()
                }
            }
            MxKind::External { kernel, .. } => {
                if k == 0 {
                    format!("{}(", kernel.name())
                } else if k == self.n_deps() {
                    ")".to_string()
                } else {
                    ", ".to_string()
                }
            }
            MxKind::FunctionOutput { oind, .. } => format!(".{}", oind),
        }
    }
}

fn fmt_indices(nz: &[u32]) -> String {
    let mut s = String::new();
    for (i, k) in nz.iter().enumerate() {
        if i > 0 {
            s.push(',');
        }
        if i >= 6 {
            s.push_str("...");
            break;
        }
        s.push_str(&k.to_string());
    }
    s
}
