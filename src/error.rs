//! Error types for function construction, compilation and evaluation.

use thiserror::Error;

/// Errors surfaced by expression functions.
///
/// Failures before the evaluation loop abort compilation. Failures during
/// evaluation leave outputs unspecified; the function's internal state must
/// be considered poisoned until the next successful `evaluate`.
#[derive(Debug, Clone, Error)]
pub enum FunctionError {
    /// An input expression is not a symbolic primitive.
    #[error("input {index} is not a symbolic primitive")]
    NonSymbolicInput {
        /// Position of the offending input.
        index: usize,
    },

    /// The input expressions are not independent (a primitive appears twice).
    #[error("the input expressions are not independent")]
    DuplicateInput,

    /// A function must have at least one output.
    #[error("the output list is empty")]
    EmptyOutputList,

    /// An embedded function has not been compiled yet.
    #[error("dependency \"{name}\" has not been initialized")]
    UninitializedDependency {
        /// Name of the embedded function.
        name: String,
    },

    /// The requested operation is not available for this operator.
    #[error("operation not supported: {0}")]
    UnsupportedOperation(&'static str),

    /// Numeric evaluation was attempted while parameters remain unresolved.
    #[error("cannot evaluate: variables {} are free", .names.join(", "))]
    FreeVariable {
        /// Names of the unresolved parameters.
        names: Vec<String>,
    },

    /// An argument list has the wrong length, or an index is out of range.
    #[error("wrong number of {what}: expected {expected}, got {got}")]
    WrongArity {
        /// What was being counted.
        what: &'static str,
        /// Expected count.
        expected: usize,
        /// Actual count.
        got: usize,
    },

    /// A buffer or expression has a shape incompatible with its destination.
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// What was being matched.
        what: &'static str,
        /// Expected shape, formatted as `nrow x ncol (nnz)`.
        expected: String,
        /// Actual shape.
        got: String,
    },

    /// A reverse sweep hit a non-smooth operation under a smoothness demand.
    #[error("adjoint of non-smooth operation \"{0}\"")]
    NonSmoothAdjoint(&'static str),

    /// A derivative seed has a shape incompatible with its input or output.
    #[error("seed for direction {direction}, position {index} has wrong shape: {got}")]
    SeedShape {
        /// Derivative direction.
        direction: usize,
        /// Input or output position.
        index: usize,
        /// Actual shape of the offending seed.
        got: String,
    },

    /// Code emission was attempted while parameters remain unresolved.
    #[error("cannot generate code: variables {} are free", .names.join(", "))]
    FreeVariableInCodegen {
        /// Names of the unresolved parameters.
        names: Vec<String>,
    },
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FunctionError>;
