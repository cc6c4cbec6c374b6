//! Shared helpers for emitting self-contained C routines.
//!
//! The emitters guarantee stable names: `aN` (scalar) or `wN` (matrix) for
//! work entry `N`, `xI` for input `I` and `rK` for output `K`. Per-operator
//! emission is delegated to the operator nodes; this module collects what
//! they need: constant formatting, auxiliary helpers and embedded-function
//! dependencies.

use std::collections::HashMap;

use crate::error::Result;

/// Collects auxiliary requirements and embedded dependencies during code
/// emission, and formats constants so they round-trip.
#[derive(Default)]
pub struct CodeGenerator {
    need_sq: bool,
    need_sign: bool,
    dependencies: Vec<String>,
    dep_symbols: HashMap<usize, String>,
}

impl CodeGenerator {
    /// Fresh generator.
    pub fn new() -> Self {
        CodeGenerator::default()
    }

    /// Format a floating-point constant for C source.
    pub fn constant(&self, v: f64) -> String {
        if v.is_nan() {
            "NAN".to_string()
        } else if v.is_infinite() {
            if v > 0.0 {
                "INFINITY".to_string()
            } else {
                "-INFINITY".to_string()
            }
        } else {
            // Shortest round-trip representation; always contains a dot or
            // exponent, so the literal stays a double.
            format!("{:?}", v)
        }
    }

    /// Request the `sq` auxiliary function.
    pub fn require_sq(&mut self) {
        self.need_sq = true;
    }

    /// Request the `sign` auxiliary function.
    pub fn require_sign(&mut self) {
        self.need_sign = true;
    }

    /// Register an embedded function, generating its definition once.
    ///
    /// `key` identifies the dependency (the address of the shared function
    /// handle); `make` is called with the assigned symbol on first
    /// registration. Returns the symbol.
    pub fn add_dependency(
        &mut self,
        key: usize,
        make: impl FnOnce(&str) -> Result<String>,
    ) -> Result<String> {
        if let Some(sym) = self.dep_symbols.get(&key) {
            return Ok(sym.clone());
        }
        let sym = format!("f{}", self.dependencies.len());
        let code = make(&sym)?;
        self.dependencies.push(code);
        self.dep_symbols.insert(key, sym.clone());
        Ok(sym)
    }

    /// Symbol of a previously registered dependency.
    pub fn dependency_symbol(&self, key: usize) -> Option<&str> {
        self.dep_symbols.get(&key).map(String::as_str)
    }

    /// Everything that must precede the generated function: includes,
    /// auxiliary helpers and embedded-function definitions.
    pub fn preamble(&self) -> String {
        let mut s = String::from("#include <math.h>\n\n");
        if self.need_sq {
            // Guarded so embedded dependencies can carry their own copy.
            s.push_str("#ifndef AUX_SQ\n#define AUX_SQ\nstatic double sq(double x) { return x*x; }\n#endif\n");
        }
        if self.need_sign {
            s.push_str(
                "#ifndef AUX_SIGN\n#define AUX_SIGN\nstatic double sign(double x) { return x<0 ? -1 : (x>0 ? 1 : 0); }\n#endif\n",
            );
        }
        if self.need_sq || self.need_sign {
            s.push('\n');
        }
        for dep in &self.dependencies {
            s.push_str(dep);
            s.push('\n');
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_round_trip() {
        let gen = CodeGenerator::new();
        assert_eq!(gen.constant(1.5), "1.5");
        assert_eq!(gen.constant(1.0), "1.0");
        assert_eq!(gen.constant(f64::NAN), "NAN");
    }

    #[test]
    fn dependencies_registered_once() {
        let mut gen = CodeGenerator::new();
        let a = gen.add_dependency(7, |sym| Ok(format!("void {}(void);", sym))).unwrap();
        let b = gen.add_dependency(7, |_| unreachable!()).unwrap();
        assert_eq!(a, b);
        assert_eq!(gen.dependency_symbol(7), Some("f0"));
    }
}
