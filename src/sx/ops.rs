//! Scalar operator set: numeric kernels, symbolic partials, printing.
//!
//! Every scalar operation is at most binary with one output, so the whole
//! set fits one flat enum. [`eval_num`] evaluates a single operation,
//! [`der`] produces its symbolic partial derivatives.

use crate::sx::node::SxElem;

/// Scalar operation codes.
///
/// The first four are tape sentinels; the rest are elementary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarOp {
    // ── Sentinels ──
    /// Read a function input nonzero into the work array.
    Input,
    /// Write a work entry to a function output nonzero.
    Output,
    /// Literal constant.
    Const,
    /// Free symbolic parameter.
    Parameter,

    // ── Binary ──
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Fmin,
    Fmax,

    // ── Unary ──
    Neg,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Log,
    Sqrt,
    /// Square. Cheaper than `Pow` with exponent 2.
    Sq,
    Fabs,
    Sign,
    Floor,
    Ceil,
}

/// Number of dependencies of an operation (0 for sentinels).
pub fn n_deps(op: ScalarOp) -> usize {
    use ScalarOp::*;
    match op {
        Input | Output | Const | Parameter => 0,
        Add | Sub | Mul | Div | Pow | Atan2 | Fmin | Fmax => 2,
        _ => 1,
    }
}

/// Whether the operation is differentiable everywhere.
pub fn is_smooth(op: ScalarOp) -> bool {
    use ScalarOp::*;
    !matches!(op, Fmin | Fmax | Fabs | Sign | Floor | Ceil)
}

/// Evaluate one operation numerically. `y` is ignored for unary ops.
pub fn eval_num(op: ScalarOp, x: f64, y: f64) -> f64 {
    use ScalarOp::*;
    match op {
        Add => x + y,
        Sub => x - y,
        Mul => x * y,
        Div => x / y,
        Pow => x.powf(y),
        Atan2 => x.atan2(y),
        Fmin => x.min(y),
        Fmax => x.max(y),
        Neg => -x,
        Sin => x.sin(),
        Cos => x.cos(),
        Tan => x.tan(),
        Asin => x.asin(),
        Acos => x.acos(),
        Atan => x.atan(),
        Sinh => x.sinh(),
        Cosh => x.cosh(),
        Tanh => x.tanh(),
        Exp => x.exp(),
        Log => x.ln(),
        Sqrt => x.sqrt(),
        Sq => x * x,
        Fabs => x.abs(),
        Sign => {
            if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Floor => x.floor(),
        Ceil => x.ceil(),
        Input | Output | Const | Parameter => unreachable!("sentinel has no kernel"),
    }
}

/// Symbolic partial derivatives `(∂f/∂x, ∂f/∂y)` of one operation.
///
/// `f` is the (already constructed) result expression; several rules reuse
/// it to keep the derivative graph small, e.g. `exp' = f` and
/// `sqrt' = 1/(2 f)`.
pub fn der(op: ScalarOp, x: &SxElem, y: &SxElem, f: &SxElem) -> [SxElem; 2] {
    use ScalarOp::*;
    let zero = SxElem::zero;
    let one = SxElem::one;
    let c = SxElem::constant;
    match op {
        Add => [one(), one()],
        Sub => [one(), -one()],
        Mul => [y.clone(), x.clone()],
        Div => [one() / y.clone(), -(f.clone() / y.clone())],
        Pow => [
            y.clone() * x.clone().pow(y.clone() - one()),
            f.clone() * x.clone().log(),
        ],
        Atan2 => {
            let den = x.clone().sq() + y.clone().sq();
            [y.clone() / den.clone(), -(x.clone() / den)]
        }
        // Kink partials are expressed through sign(), which picks the
        // active branch and gives 1/2 at ties.
        Fmin => {
            let s = (x.clone() - y.clone()).sign();
            [
                (one() - s.clone()) / c(2.0),
                (one() + s) / c(2.0),
            ]
        }
        Fmax => {
            let s = (x.clone() - y.clone()).sign();
            [
                (one() + s.clone()) / c(2.0),
                (one() - s) / c(2.0),
            ]
        }
        Neg => [-one(), zero()],
        Sin => [x.clone().cos(), zero()],
        Cos => [-x.clone().sin(), zero()],
        Tan => [one() + f.clone().sq(), zero()],
        Asin => [one() / (one() - x.clone().sq()).sqrt(), zero()],
        Acos => [-(one() / (one() - x.clone().sq()).sqrt()), zero()],
        Atan => [one() / (one() + x.clone().sq()), zero()],
        Sinh => [x.clone().cosh(), zero()],
        Cosh => [x.clone().sinh(), zero()],
        Tanh => [one() - f.clone().sq(), zero()],
        Exp => [f.clone(), zero()],
        Log => [one() / x.clone(), zero()],
        Sqrt => [one() / (c(2.0) * f.clone()), zero()],
        Sq => [c(2.0) * x.clone(), zero()],
        Fabs => [x.clone().sign(), zero()],
        Sign | Floor | Ceil => [zero(), zero()],
        Input | Output | Const | Parameter => unreachable!("sentinel has no derivative"),
    }
}

/// Text printed before the first argument, e.g. `"sin("`.
pub fn print_pre(op: ScalarOp) -> &'static str {
    use ScalarOp::*;
    match op {
        Add | Sub | Mul | Div => "(",
        Pow => "pow(",
        Atan2 => "atan2(",
        Fmin => "fmin(",
        Fmax => "fmax(",
        Neg => "(-",
        Sin => "sin(",
        Cos => "cos(",
        Tan => "tan(",
        Asin => "asin(",
        Acos => "acos(",
        Atan => "atan(",
        Sinh => "sinh(",
        Cosh => "cosh(",
        Tanh => "tanh(",
        Exp => "exp(",
        Log => "log(",
        Sqrt => "sqrt(",
        Sq => "sq(",
        Fabs => "fabs(",
        Sign => "sign(",
        Floor => "floor(",
        Ceil => "ceil(",
        Input | Output | Const | Parameter => "",
    }
}

/// Text printed between the two arguments of a binary operation.
pub fn print_sep(op: ScalarOp) -> &'static str {
    use ScalarOp::*;
    match op {
        Add => "+",
        Sub => "-",
        Mul => "*",
        Div => "/",
        Pow | Atan2 | Fmin | Fmax => ",",
        _ => "",
    }
}

/// Text printed after the last argument.
pub fn print_post(op: ScalarOp) -> &'static str {
    use ScalarOp::*;
    match op {
        Input | Output | Const | Parameter => "",
        _ => ")",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity() {
        assert_eq!(n_deps(ScalarOp::Add), 2);
        assert_eq!(n_deps(ScalarOp::Sin), 1);
        assert_eq!(n_deps(ScalarOp::Const), 0);
    }

    #[test]
    fn numeric_kernels() {
        assert_eq!(eval_num(ScalarOp::Add, 2.0, 3.0), 5.0);
        assert_eq!(eval_num(ScalarOp::Sq, 4.0, 0.0), 16.0);
        assert_eq!(eval_num(ScalarOp::Sign, -2.5, 0.0), -1.0);
        assert_eq!(eval_num(ScalarOp::Fmin, 2.0, 3.0), 2.0);
    }

    #[test]
    fn smoothness_classification() {
        assert!(is_smooth(ScalarOp::Sin));
        assert!(!is_smooth(ScalarOp::Fabs));
        assert!(!is_smooth(ScalarOp::Floor));
    }
}
