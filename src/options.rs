//! Compilation and evaluation options.

/// Options controlling how an expression function is compiled and evaluated.
///
/// The defaults match the common case: live-variable slot reuse on,
/// seed purging on, no smoothness demand.
#[derive(Debug, Clone)]
pub struct FunctionOptions {
    /// Name used in log messages, error messages and generated code.
    pub name: String,
    /// Reuse work-array slots whose last reader has passed. When disabled,
    /// every algorithm result gets its own slot.
    pub live_variables: bool,
    /// Drop derivative directions whose seeds are all structurally empty
    /// before delegating to an embedded function. Disable for operators
    /// whose sparsity kernels have side effects.
    pub purge_seeds: bool,
    /// Fail the reverse sweep when it encounters a non-smooth operation.
    pub assert_smooth: bool,
}

impl Default for FunctionOptions {
    fn default() -> Self {
        FunctionOptions {
            name: "unnamed".to_string(),
            live_variables: true,
            purge_seeds: true,
            assert_smooth: false,
        }
    }
}

impl FunctionOptions {
    /// Options with a given function name and defaults otherwise.
    pub fn named(name: impl Into<String>) -> Self {
        FunctionOptions {
            name: name.into(),
            ..Default::default()
        }
    }
}
