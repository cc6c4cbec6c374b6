//! Matrix expression handles.
//!
//! An [`Mx`] is a shared handle to an operator node. Construction applies
//! pattern normalization: elementwise binary operations are built over
//! operands of identical sparsity or a dense scalar, with explicit
//! projection nodes inserted when patterns differ.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

use crate::error::{FunctionError, Result};
use crate::matrix::Matrix;
use crate::mx::function::FunctionRef;
use crate::mx::node::{MxKind, MxNode, OpKernel, OpTag};
use crate::sparsity::Sparsity;
use crate::sx::ops::ScalarOp;

/// A matrix-valued symbolic expression.
///
/// Cheap to clone (a shared handle). Expressions form a DAG with exact
/// sharing; dependencies are strictly older than dependents, so cycles
/// cannot be constructed.
#[derive(Clone)]
pub struct Mx(pub(crate) Arc<MxNode>);

impl Mx {
    pub(crate) fn mk(kind: MxKind, sp: Vec<Sparsity>) -> Self {
        Mx(Arc::new(MxNode::new(kind, sp)))
    }

    /// A fresh matrix-valued symbolic primitive with the given pattern.
    pub fn sym(name: impl Into<String>, sparsity: Sparsity) -> Self {
        Mx::mk(MxKind::Parameter { name: name.into() }, vec![sparsity])
    }

    /// A fresh dense symbolic primitive.
    pub fn sym_dense(name: impl Into<String>, nrow: usize, ncol: usize) -> Self {
        Mx::sym(name, Sparsity::dense(nrow, ncol))
    }

    /// A constant matrix.
    pub fn constant(value: Matrix<f64>) -> Self {
        let sp = value.sparsity().clone();
        Mx::mk(MxKind::Const { value }, vec![sp])
    }

    /// A dense 1x1 constant.
    pub fn scalar(value: f64) -> Self {
        Mx::constant(Matrix::scalar(value))
    }

    /// A structurally-zero matrix of the given shape (no nonzeros).
    pub fn zero(nrow: usize, ncol: usize) -> Self {
        Mx::constant(Matrix::zeros(Sparsity::empty(nrow, ncol)))
    }

    /// A matrix of ones with the given pattern.
    pub fn ones(sparsity: Sparsity) -> Self {
        let n = sparsity.nnz();
        Mx::constant(Matrix::new(sparsity, vec![1.0; n]))
    }

    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    pub(crate) fn node(&self) -> &MxNode {
        &self.0
    }

    /// Pattern of this expression (first output for multi-output nodes).
    pub fn sparsity(&self) -> &Sparsity {
        self.0.output_sparsity(self.output_index())
    }

    /// `(nrow, ncol)`.
    pub fn shape(&self) -> (usize, usize) {
        self.sparsity().shape()
    }

    /// Number of structural nonzeros.
    pub fn nnz(&self) -> usize {
        self.sparsity().nnz()
    }

    /// Whether this expression has no structural nonzeros.
    pub fn is_structural_zero(&self) -> bool {
        self.nnz() == 0
    }

    /// Whether this is a symbolic primitive.
    pub fn is_symbolic(&self) -> bool {
        matches!(self.0.kind, MxKind::Parameter { .. })
    }

    /// Whether this is a constant matrix.
    pub fn is_const(&self) -> bool {
        matches!(self.0.kind, MxKind::Const { .. })
    }

    /// Name of the primitive, if this is one.
    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            MxKind::Parameter { name } => Some(name),
            _ => None,
        }
    }

    /// Which output of the underlying node this handle selects.
    pub(crate) fn output_index(&self) -> usize {
        match &self.0.kind {
            MxKind::FunctionOutput { oind, .. } => *oind,
            _ => 0,
        }
    }

    /// Structural equality to a bounded depth.
    ///
    /// Depth 0 compares node identity and constant values; depth `d`
    /// additionally compares operations and children to depth `d - 1`.
    pub fn is_equal(&self, other: &Mx, depth: usize) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (&self.0.kind, &other.0.kind) {
            (MxKind::Const { value: a }, MxKind::Const { value: b }) => {
                Sparsity::same(a.sparsity(), b.sparsity()) && a.data() == b.data()
            }
            _ if depth == 0 => false,
            (MxKind::Unary { op: oa, dep: a }, MxKind::Unary { op: ob, dep: b }) => {
                oa == ob && a.is_equal(b, depth - 1)
            }
            (MxKind::Binary { op: oa, deps: a }, MxKind::Binary { op: ob, deps: b }) => {
                oa == ob && a[0].is_equal(&b[0], depth - 1) && a[1].is_equal(&b[1], depth - 1)
            }
            (MxKind::Project { dep: a }, MxKind::Project { dep: b }) => {
                Sparsity::same(self.sparsity(), other.sparsity()) && a.is_equal(b, depth - 1)
            }
            (
                MxKind::GetNonzeros { dep: a, nz: na },
                MxKind::GetNonzeros { dep: b, nz: nb },
            ) => na == nb && a.is_equal(b, depth - 1),
            (
                MxKind::SetNonzeros { deps: a, nz: na },
                MxKind::SetNonzeros { deps: b, nz: nb },
            )
            | (
                MxKind::AddNonzeros { deps: a, nz: na },
                MxKind::AddNonzeros { deps: b, nz: nb },
            ) => {
                na == nb && a[0].is_equal(&b[0], depth - 1) && a[1].is_equal(&b[1], depth - 1)
            }
            (MxKind::SumNz { dep: a }, MxKind::SumNz { dep: b }) => a.is_equal(b, depth - 1),
            (MxKind::Lift { deps: a }, MxKind::Lift { deps: b }) => {
                a[0].is_equal(&b[0], depth - 1) && a[1].is_equal(&b[1], depth - 1)
            }
            (
                MxKind::Call { fref: fa, deps: a },
                MxKind::Call { fref: fb, deps: b },
            ) => {
                FunctionRef::same(fa, fb)
                    && a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.is_equal(y, depth - 1))
            }
            (
                MxKind::FunctionOutput { dep: a, oind: ia },
                MxKind::FunctionOutput { dep: b, oind: ib },
            ) => ia == ib && a.is_equal(b, depth - 1),
            _ => false,
        }
    }

    // ── Construction helpers ──

    /// Gather this expression into a new pattern, zero where absent.
    pub fn project(&self, sparsity: Sparsity) -> Mx {
        assert_eq!(self.shape(), sparsity.shape(), "projection changes shape");
        if Sparsity::same(self.sparsity(), &sparsity) {
            return self.clone();
        }
        Mx::mk(
            MxKind::Project { dep: self.clone() },
            vec![sparsity],
        )
    }

    /// Gather nonzeros `nz` of this expression into the pattern `sparsity`.
    pub fn get_nonzeros(&self, sparsity: Sparsity, nz: Vec<u32>) -> Mx {
        assert_eq!(sparsity.nnz(), nz.len(), "index count mismatch");
        for &k in &nz {
            assert!((k as usize) < self.nnz(), "nonzero index out of range");
        }
        Mx::mk(
            MxKind::GetNonzeros {
                dep: self.clone(),
                nz,
            },
            vec![sparsity],
        )
    }

    /// Replace nonzeros `nz` of this expression with the nonzeros of `src`.
    pub fn set_nonzeros(&self, src: &Mx, nz: Vec<u32>) -> Mx {
        assert_eq!(src.nnz(), nz.len(), "index count mismatch");
        for &k in &nz {
            assert!((k as usize) < self.nnz(), "nonzero index out of range");
        }
        let sp = self.sparsity().clone();
        Mx::mk(
            MxKind::SetNonzeros {
                deps: [self.clone(), src.clone()],
                nz,
            },
            vec![sp],
        )
    }

    /// Add the nonzeros of `src` into nonzeros `nz` of this expression.
    pub fn add_nonzeros(&self, src: &Mx, nz: Vec<u32>) -> Mx {
        assert_eq!(src.nnz(), nz.len(), "index count mismatch");
        for &k in &nz {
            assert!((k as usize) < self.nnz(), "nonzero index out of range");
        }
        let sp = self.sparsity().clone();
        Mx::mk(
            MxKind::AddNonzeros {
                deps: [self.clone(), src.clone()],
                nz,
            },
            vec![sp],
        )
    }

    /// Sum of all nonzeros, as a 1x1 expression.
    pub fn sum_nz(&self) -> Mx {
        if self.sparsity().is_scalar() {
            return self.clone();
        }
        Mx::mk(MxKind::SumNz { dep: self.clone() }, vec![Sparsity::scalar()])
    }

    /// Mark this expression as a lifted intermediate with an initial guess.
    pub fn lift(&self, init: &Mx) -> Mx {
        assert_eq!(self.shape(), init.shape(), "guess shape mismatch");
        let sp = self.sparsity().clone();
        Mx::mk(
            MxKind::Lift {
                deps: [self.clone(), init.project(sp.clone())],
            },
            vec![sp],
        )
    }

    /// Call an embedded function on `args`, returning one expression per
    /// function output.
    pub fn call(fref: &FunctionRef, args: Vec<Mx>) -> Result<Vec<Mx>> {
        if args.len() != fref.n_in() {
            return Err(FunctionError::WrongArity {
                what: "call arguments",
                expected: fref.n_in(),
                got: args.len(),
            });
        }
        let mut deps = Vec::with_capacity(args.len());
        for (i, a) in args.into_iter().enumerate() {
            let want = fref.sparsity_in(i);
            if a.shape() != want.shape() {
                return Err(FunctionError::ShapeMismatch {
                    what: "call argument",
                    expected: want.describe(),
                    got: a.sparsity().describe(),
                });
            }
            deps.push(a.project(want.clone()));
        }
        let sp: Vec<Sparsity> = (0..fref.n_out()).map(|k| fref.sparsity_out(k).clone()).collect();
        let node = Mx::mk(
            MxKind::Call {
                fref: fref.clone(),
                deps,
            },
            sp,
        );
        Ok(node.split_outputs())
    }

    /// Apply an open-ended operator to `args`, returning one expression per
    /// kernel output.
    pub fn external(kernel: Arc<dyn OpKernel>, args: Vec<Mx>) -> Vec<Mx> {
        let in_sp: Vec<Sparsity> = args.iter().map(|a| a.sparsity().clone()).collect();
        let sp: Vec<Sparsity> = (0..kernel.n_outputs())
            .map(|k| kernel.output_sparsity(k, &in_sp))
            .collect();
        let node = Mx::mk(MxKind::External { kernel, deps: args }, sp);
        node.split_outputs()
    }

    /// Wrap each output of a (possibly multi-output) node.
    fn split_outputs(self) -> Vec<Mx> {
        if !self.0.is_multiple_output() {
            return vec![self];
        }
        (0..self.0.n_outputs())
            .map(|oind| {
                let sp = self.0.output_sparsity(oind).clone();
                Mx::mk(
                    MxKind::FunctionOutput {
                        dep: self.clone(),
                        oind,
                    },
                    vec![sp],
                )
            })
            .collect()
    }

    /// Build an elementwise unary operation. The pattern is preserved: the
    /// operation applies to structural nonzeros only.
    pub(crate) fn unary(op: ScalarOp, x: &Mx) -> Mx {
        let sp = x.sparsity().clone();
        // Fold away no-op layers on structural zeros.
        if x.is_structural_zero() && matches!(op, ScalarOp::Neg) {
            return x.clone();
        }
        Mx::mk(
            MxKind::Unary {
                op,
                dep: x.clone(),
            },
            vec![sp],
        )
    }

    /// Build an elementwise binary operation, normalizing patterns.
    pub(crate) fn binary(op: ScalarOp, x: &Mx, y: &Mx) -> Mx {
        // 1x1 operands broadcast against the other operand's shape.
        let xs = x.shape() == (1, 1);
        let ys = y.shape() == (1, 1);
        let result_shape = if xs { y.shape() } else { x.shape() };

        // Structural-zero short circuits keep derivative graphs sparse.
        match op {
            ScalarOp::Add => {
                if x.is_structural_zero() && (xs || x.shape() == y.shape()) {
                    return y.clone();
                }
                if y.is_structural_zero() && (ys || x.shape() == y.shape()) {
                    return x.clone();
                }
            }
            ScalarOp::Sub => {
                if y.is_structural_zero() && (ys || x.shape() == y.shape()) {
                    return x.clone();
                }
                if x.is_structural_zero() && (xs || x.shape() == y.shape()) {
                    return Mx::unary(ScalarOp::Neg, y);
                }
            }
            ScalarOp::Mul | ScalarOp::Div => {
                // A structurally-zero factor or numerator zeroes the result.
                if x.is_structural_zero() {
                    return Mx::zero(result_shape.0, result_shape.1);
                }
                if op == ScalarOp::Mul && y.is_structural_zero() {
                    return Mx::zero(result_shape.0, result_shape.1);
                }
            }
            _ => {}
        }

        if xs && ys {
            // A structurally-empty 1x1 operand is promoted to a stored
            // zero so the kernels always have a value to read.
            let a = if x.nnz() == 0 {
                x.project(Sparsity::scalar())
            } else {
                x.clone()
            };
            let b = if y.nnz() == 0 {
                y.project(Sparsity::scalar())
            } else {
                y.clone()
            };
            return Mx::mk(
                MxKind::Binary { op, deps: [a, b] },
                vec![Sparsity::scalar()],
            );
        }
        if xs || ys {
            // Scalar broadcast. The result keeps the matrix operand's
            // pattern only where f(0, s) stays zero; otherwise the matrix
            // operand is densified first.
            let other = if xs { y } else { x };
            let keeps_zeros = match op {
                ScalarOp::Mul => true,
                ScalarOp::Div => ys,
                _ => false,
            };
            let pattern = if keeps_zeros || other.sparsity().is_dense() {
                other.sparsity().clone()
            } else {
                Sparsity::dense(other.shape().0, other.shape().1)
            };
            let (a, b) = if xs {
                (x.clone(), y.project(pattern.clone()))
            } else {
                (x.project(pattern.clone()), y.clone())
            };
            return Mx::mk(MxKind::Binary { op, deps: [a, b] }, vec![pattern]);
        }

        assert_eq!(x.shape(), y.shape(), "elementwise operands differ in shape");
        let pattern = if Sparsity::same(x.sparsity(), y.sparsity()) {
            x.sparsity().clone()
        } else {
            x.sparsity().union(y.sparsity())
        };
        let a = x.project(pattern.clone());
        let b = y.project(pattern.clone());
        Mx::mk(MxKind::Binary { op, deps: [a, b] }, vec![pattern])
    }

    // ── Elementary functions ──

    /// Elementwise sine.
    pub fn sin(&self) -> Mx {
        Mx::unary(ScalarOp::Sin, self)
    }

    /// Elementwise cosine.
    pub fn cos(&self) -> Mx {
        Mx::unary(ScalarOp::Cos, self)
    }

    /// Elementwise tangent.
    pub fn tan(&self) -> Mx {
        Mx::unary(ScalarOp::Tan, self)
    }

    /// Elementwise hyperbolic sine.
    pub fn sinh(&self) -> Mx {
        Mx::unary(ScalarOp::Sinh, self)
    }

    /// Elementwise hyperbolic cosine.
    pub fn cosh(&self) -> Mx {
        Mx::unary(ScalarOp::Cosh, self)
    }

    /// Elementwise hyperbolic tangent.
    pub fn tanh(&self) -> Mx {
        Mx::unary(ScalarOp::Tanh, self)
    }

    /// Elementwise exponential.
    pub fn exp(&self) -> Mx {
        Mx::unary(ScalarOp::Exp, self)
    }

    /// Elementwise natural logarithm.
    pub fn log(&self) -> Mx {
        Mx::unary(ScalarOp::Log, self)
    }

    /// Elementwise square root.
    pub fn sqrt(&self) -> Mx {
        Mx::unary(ScalarOp::Sqrt, self)
    }

    /// Elementwise square.
    pub fn sq(&self) -> Mx {
        Mx::unary(ScalarOp::Sq, self)
    }

    /// Elementwise absolute value.
    pub fn abs(&self) -> Mx {
        Mx::unary(ScalarOp::Fabs, self)
    }

    /// Elementwise sign.
    pub fn sign(&self) -> Mx {
        Mx::unary(ScalarOp::Sign, self)
    }

    /// Elementwise power.
    pub fn pow(&self, e: &Mx) -> Mx {
        Mx::binary(ScalarOp::Pow, self, e)
    }

    /// Elementwise minimum.
    pub fn fmin(&self, other: &Mx) -> Mx {
        Mx::binary(ScalarOp::Fmin, self, other)
    }

    /// Elementwise maximum.
    pub fn fmax(&self, other: &Mx) -> Mx {
        Mx::binary(ScalarOp::Fmax, self, other)
    }
}

// Arithmetic on handles, for every owned/borrowed combination.
macro_rules! mx_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait for &Mx {
            type Output = Mx;
            fn $method(self, rhs: &Mx) -> Mx {
                Mx::binary($op, self, rhs)
            }
        }
        impl $trait for Mx {
            type Output = Mx;
            fn $method(self, rhs: Mx) -> Mx {
                Mx::binary($op, &self, &rhs)
            }
        }
        impl $trait<&Mx> for Mx {
            type Output = Mx;
            fn $method(self, rhs: &Mx) -> Mx {
                Mx::binary($op, &self, rhs)
            }
        }
        impl $trait<Mx> for &Mx {
            type Output = Mx;
            fn $method(self, rhs: Mx) -> Mx {
                Mx::binary($op, self, &rhs)
            }
        }
    };
}

mx_binary_op!(Add, add, ScalarOp::Add);
mx_binary_op!(Sub, sub, ScalarOp::Sub);
mx_binary_op!(Mul, mul, ScalarOp::Mul);
mx_binary_op!(Div, div, ScalarOp::Div);

impl Neg for &Mx {
    type Output = Mx;
    fn neg(self) -> Mx {
        Mx::unary(ScalarOp::Neg, self)
    }
}

impl Neg for Mx {
    type Output = Mx;
    fn neg(self) -> Mx {
        -&self
    }
}

impl fmt::Debug for Mx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mx({})", self)
    }
}

impl fmt::Display for Mx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_expr(self, f, 4)
    }
}

fn fmt_expr(e: &Mx, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    let node = e.node();
    match &node.kind {
        MxKind::Parameter { name } => f.write_str(name),
        MxKind::Const { value } => {
            if value.sparsity().is_scalar() {
                write!(f, "{}", value.data()[0])
            } else {
                write!(f, "const<{}>", value.sparsity().describe())
            }
        }
        _ if depth == 0 => f.write_str("..."),
        MxKind::FunctionOutput { dep, oind } => {
            fmt_expr(dep, f, depth - 1)?;
            write!(f, ".{}", oind)
        }
        _ => {
            let n = node.n_deps();
            f.write_str(&node.print_part(0))?;
            for i in 0..n {
                if i > 0 {
                    f.write_str(&node.print_part(i))?;
                }
                fmt_expr(node.dep(i), f, depth - 1)?;
            }
            f.write_str(&node.print_part(n))?;
            Ok(())
        }
    }
}

/// `OpTag` display names, used in dumps and logs.
impl fmt::Display for OpTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpTag::Input => "input",
            OpTag::Output => "output",
            OpTag::Parameter => "parameter",
            OpTag::Const => "const",
            OpTag::Unary => "unary",
            OpTag::Binary => "binary",
            OpTag::Project => "project",
            OpTag::GetNonzeros => "getnz",
            OpTag::SetNonzeros => "setnz",
            OpTag::AddNonzeros => "addnz",
            OpTag::SumNz => "sumnz",
            OpTag::Lift => "lift",
            OpTag::Call => "call",
            OpTag::External => "external",
        };
        f.write_str(s)
    }
}
