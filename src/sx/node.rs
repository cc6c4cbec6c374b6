//! Reference-counted scalar expression nodes.
//!
//! Expressions form a DAG with exact sharing: a node is owned by every
//! expression that references it, and dependencies are strictly older than
//! dependents, so plain strong counting suffices. Construction applies the
//! usual constant folding and identity simplifications so that derivative
//! graphs stay small.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use num_traits::{One, Zero};

use crate::sx::ops::{self, ScalarOp};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub(crate) enum SxKind {
    /// Free symbolic variable.
    Symbol(String),
    /// Numeric literal.
    Const(f64),
    /// Elementary unary operation.
    Unary(ScalarOp, SxElem),
    /// Elementary binary operation.
    Binary(ScalarOp, SxElem, SxElem),
}

#[derive(Debug)]
pub(crate) struct SxNode {
    pub(crate) id: u64,
    pub(crate) kind: SxKind,
}

/// A scalar symbolic expression.
///
/// Cheap to clone (a shared handle). Two handles compare structurally equal
/// to a bounded depth via [`is_equal`](SxElem::is_equal); full `==` is not
/// provided because deep structural comparison is unbounded.
#[derive(Clone, Debug)]
pub struct SxElem(pub(crate) Arc<SxNode>);

impl SxElem {
    fn mk(kind: SxKind) -> Self {
        SxElem(Arc::new(SxNode {
            id: fresh_id(),
            kind,
        }))
    }

    /// A fresh symbolic primitive with the given name.
    pub fn sym(name: impl Into<String>) -> Self {
        SxElem::mk(SxKind::Symbol(name.into()))
    }

    /// A numeric literal.
    pub fn constant(value: f64) -> Self {
        SxElem::mk(SxKind::Const(value))
    }

    /// The literal zero.
    pub fn zero() -> Self {
        SxElem::constant(0.0)
    }

    /// The literal one.
    pub fn one() -> Self {
        SxElem::constant(1.0)
    }

    /// Unique node identifier. Dependencies have smaller ids than dependents.
    pub(crate) fn id(&self) -> u64 {
        self.0.id
    }

    /// Whether this is a symbolic primitive.
    pub fn is_symbol(&self) -> bool {
        matches!(self.0.kind, SxKind::Symbol(_))
    }

    /// Whether this is a numeric literal.
    pub fn is_const(&self) -> bool {
        matches!(self.0.kind, SxKind::Const(_))
    }

    /// Literal value, if this is a constant.
    pub fn const_value(&self) -> Option<f64> {
        match self.0.kind {
            SxKind::Const(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this is the literal zero.
    pub fn is_zero_const(&self) -> bool {
        self.const_value() == Some(0.0)
    }

    /// Name of the primitive, if this is a symbol.
    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            SxKind::Symbol(n) => Some(n),
            _ => None,
        }
    }

    /// Operation tag: `Parameter` for symbols, `Const` for literals,
    /// the elementary op otherwise.
    pub(crate) fn op_tag(&self) -> ScalarOp {
        match &self.0.kind {
            SxKind::Symbol(_) => ScalarOp::Parameter,
            SxKind::Const(_) => ScalarOp::Const,
            SxKind::Unary(op, _) | SxKind::Binary(op, _, _) => *op,
        }
    }

    /// Number of dependencies.
    pub(crate) fn n_deps(&self) -> usize {
        match &self.0.kind {
            SxKind::Symbol(_) | SxKind::Const(_) => 0,
            SxKind::Unary(..) => 1,
            SxKind::Binary(..) => 2,
        }
    }

    /// Dependency `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= n_deps()`.
    pub(crate) fn dep(&self, i: usize) -> &SxElem {
        match (&self.0.kind, i) {
            (SxKind::Unary(_, a), 0) => a,
            (SxKind::Binary(_, a, _), 0) => a,
            (SxKind::Binary(_, _, b), 1) => b,
            _ => panic!("dependency index out of range"),
        }
    }

    /// Structural equality to a bounded depth.
    ///
    /// Depth 0 compares node identity (and literal values) only; depth `d`
    /// additionally compares operation tags and children to depth `d - 1`.
    pub fn is_equal(&self, other: &SxElem, depth: usize) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if let (Some(a), Some(b)) = (self.const_value(), other.const_value()) {
            return a == b;
        }
        if depth == 0 {
            return false;
        }
        match (&self.0.kind, &other.0.kind) {
            (SxKind::Unary(op_a, a), SxKind::Unary(op_b, b)) => {
                op_a == op_b && a.is_equal(b, depth - 1)
            }
            (SxKind::Binary(op_a, a0, a1), SxKind::Binary(op_b, b0, b1)) => {
                op_a == op_b && a0.is_equal(b0, depth - 1) && a1.is_equal(b1, depth - 1)
            }
            _ => false,
        }
    }

    /// Replace `self` with `recorded` if the two are structurally equal to
    /// `depth`. Reusing the recorded expression keeps shared subexpressions
    /// shared instead of growing equivalent-but-distinct graphs.
    pub(crate) fn assign_if_duplicate(&mut self, recorded: &SxElem, depth: usize) {
        if self.is_equal(recorded, depth) {
            *self = recorded.clone();
        }
    }

    /// Build a unary operation, folding constants.
    pub(crate) fn unary(op: ScalarOp, x: SxElem) -> SxElem {
        if let Some(v) = x.const_value() {
            return SxElem::constant(ops::eval_num(op, v, 0.0));
        }
        SxElem::mk(SxKind::Unary(op, x))
    }

    /// Build a binary operation, folding constants and short-circuiting
    /// identity patterns (`x + 0`, `x * 1`, `x * 0`, `x / 1`).
    pub(crate) fn binary(op: ScalarOp, x: SxElem, y: SxElem) -> SxElem {
        if let (Some(a), Some(b)) = (x.const_value(), y.const_value()) {
            return SxElem::constant(ops::eval_num(op, a, b));
        }
        match op {
            ScalarOp::Add => {
                if x.is_zero_const() {
                    return y;
                }
                if y.is_zero_const() {
                    return x;
                }
            }
            ScalarOp::Sub => {
                if y.is_zero_const() {
                    return x;
                }
            }
            ScalarOp::Mul => {
                if x.const_value() == Some(1.0) || y.is_zero_const() {
                    return y;
                }
                if y.const_value() == Some(1.0) || x.is_zero_const() {
                    return x;
                }
            }
            ScalarOp::Div => {
                if y.const_value() == Some(1.0) {
                    return x;
                }
            }
            _ => {}
        }
        SxElem::mk(SxKind::Binary(op, x, y))
    }

    /// Dispatch a tape operation: unary ops ignore `y`.
    pub(crate) fn binary_or_unary(op: ScalarOp, x: SxElem, y: SxElem) -> SxElem {
        if ops::n_deps(op) == 1 {
            SxElem::unary(op, x)
        } else {
            SxElem::binary(op, x, y)
        }
    }

    // ── Elementary functions ──

    /// Sine.
    pub fn sin(self) -> SxElem {
        SxElem::unary(ScalarOp::Sin, self)
    }

    /// Cosine.
    pub fn cos(self) -> SxElem {
        SxElem::unary(ScalarOp::Cos, self)
    }

    /// Tangent.
    pub fn tan(self) -> SxElem {
        SxElem::unary(ScalarOp::Tan, self)
    }

    /// Inverse sine.
    pub fn asin(self) -> SxElem {
        SxElem::unary(ScalarOp::Asin, self)
    }

    /// Inverse cosine.
    pub fn acos(self) -> SxElem {
        SxElem::unary(ScalarOp::Acos, self)
    }

    /// Inverse tangent.
    pub fn atan(self) -> SxElem {
        SxElem::unary(ScalarOp::Atan, self)
    }

    /// Hyperbolic sine.
    pub fn sinh(self) -> SxElem {
        SxElem::unary(ScalarOp::Sinh, self)
    }

    /// Hyperbolic cosine.
    pub fn cosh(self) -> SxElem {
        SxElem::unary(ScalarOp::Cosh, self)
    }

    /// Hyperbolic tangent.
    pub fn tanh(self) -> SxElem {
        SxElem::unary(ScalarOp::Tanh, self)
    }

    /// Exponential.
    pub fn exp(self) -> SxElem {
        SxElem::unary(ScalarOp::Exp, self)
    }

    /// Natural logarithm.
    pub fn log(self) -> SxElem {
        SxElem::unary(ScalarOp::Log, self)
    }

    /// Square root.
    pub fn sqrt(self) -> SxElem {
        SxElem::unary(ScalarOp::Sqrt, self)
    }

    /// Square.
    pub fn sq(self) -> SxElem {
        SxElem::unary(ScalarOp::Sq, self)
    }

    /// Absolute value.
    pub fn abs(self) -> SxElem {
        SxElem::unary(ScalarOp::Fabs, self)
    }

    /// Sign (-1, 0 or 1).
    pub fn sign(self) -> SxElem {
        SxElem::unary(ScalarOp::Sign, self)
    }

    /// Floor.
    pub fn floor(self) -> SxElem {
        SxElem::unary(ScalarOp::Floor, self)
    }

    /// Ceiling.
    pub fn ceil(self) -> SxElem {
        SxElem::unary(ScalarOp::Ceil, self)
    }

    /// Power `self ^ e`.
    pub fn pow(self, e: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Pow, self, e)
    }

    /// Two-argument arctangent `atan2(self, other)`.
    pub fn atan2(self, other: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Atan2, self, other)
    }

    /// Elementwise minimum.
    pub fn fmin(self, other: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Fmin, self, other)
    }

    /// Elementwise maximum.
    pub fn fmax(self, other: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Fmax, self, other)
    }
}

impl Default for SxElem {
    fn default() -> Self {
        SxElem::zero()
    }
}

impl Add for SxElem {
    type Output = SxElem;
    fn add(self, rhs: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Add, self, rhs)
    }
}

impl Sub for SxElem {
    type Output = SxElem;
    fn sub(self, rhs: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Sub, self, rhs)
    }
}

impl Mul for SxElem {
    type Output = SxElem;
    fn mul(self, rhs: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Mul, self, rhs)
    }
}

impl Div for SxElem {
    type Output = SxElem;
    fn div(self, rhs: SxElem) -> SxElem {
        SxElem::binary(ScalarOp::Div, self, rhs)
    }
}

impl Neg for SxElem {
    type Output = SxElem;
    fn neg(self) -> SxElem {
        SxElem::unary(ScalarOp::Neg, self)
    }
}

impl Zero for SxElem {
    fn zero() -> Self {
        SxElem::zero()
    }

    fn is_zero(&self) -> bool {
        self.is_zero_const()
    }
}

impl One for SxElem {
    fn one() -> Self {
        SxElem::one()
    }
}

impl fmt::Display for SxElem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.kind {
            SxKind::Symbol(name) => f.write_str(name),
            SxKind::Const(v) => write!(f, "{}", v),
            SxKind::Unary(op, a) => {
                write!(f, "{}{}{}", ops::print_pre(*op), a, ops::print_post(*op))
            }
            SxKind::Binary(op, a, b) => write!(
                f,
                "{}{}{}{}{}",
                ops::print_pre(*op),
                a,
                ops::print_sep(*op),
                b,
                ops::print_post(*op)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_folding() {
        let e = SxElem::constant(2.0) + SxElem::constant(3.0);
        assert_eq!(e.const_value(), Some(5.0));
    }

    #[test]
    fn identity_simplification() {
        let x = SxElem::sym("x");
        let e = x.clone() + SxElem::zero();
        assert!(Arc::ptr_eq(&e.0, &x.0));
        let p = x.clone() * SxElem::one();
        assert!(Arc::ptr_eq(&p.0, &x.0));
    }

    #[test]
    fn bounded_depth_equality() {
        let x = SxElem::sym("x");
        let a = x.clone().sin() + SxElem::constant(1.0);
        let b = x.clone().sin() + SxElem::constant(1.0);
        assert!(!a.is_equal(&b, 1));
        assert!(a.is_equal(&b, 2));
    }

    #[test]
    fn display() {
        let x = SxElem::sym("x");
        let e = x.clone().sin() * x;
        assert_eq!(e.to_string(), "(sin(x)*x)");
    }
}
