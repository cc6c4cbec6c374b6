//! Tape disassembly and C code emission for scalar functions.

use std::fmt;
use std::fmt::Write as _;

use crate::codegen::CodeGenerator;
use crate::error::{FunctionError, Result};
use crate::sx::function::SxFunction;
use crate::sx::ops::{self, ScalarOp};

impl SxFunction {
    /// Generate a self-contained C routine evaluating the tape.
    ///
    /// One `const double*` parameter per input, one `double*` per output;
    /// null output pointers are skipped. Work entries are declared on
    /// first assignment.
    pub fn generate_code(&self, fname: &str) -> Result<String> {
        assert!(self.initialized, "function not initialized");
        if !self.free_vars.is_empty() {
            return Err(FunctionError::FreeVariableInCodegen {
                names: self.free_var_names(),
            });
        }

        let mut gen = CodeGenerator::new();
        let mut declared = vec![false; self.worksize];
        let mut body = String::new();

        for el in &self.algorithm {
            body.push_str("  ");
            if el.op == ScalarOp::Output {
                write!(
                    body,
                    "if (r{0}!=0) r{0}[{1}]=a{2}",
                    el.i0, el.i2, el.i1
                )
                .unwrap();
            } else {
                if !declared[el.i0 as usize] {
                    body.push_str("double ");
                    declared[el.i0 as usize] = true;
                }
                write!(body, "a{}=", el.i0).unwrap();
                match el.op {
                    ScalarOp::Const => body.push_str(&gen.constant(el.d)),
                    ScalarOp::Input => {
                        write!(body, "x{}[{}]", el.i1, el.i2).unwrap();
                    }
                    ScalarOp::Parameter => unreachable!("free variables checked above"),
                    op => {
                        match op {
                            ScalarOp::Sq => gen.require_sq(),
                            ScalarOp::Sign => gen.require_sign(),
                            _ => {}
                        }
                        write!(body, "{}a{}", ops::print_pre(op), el.i1).unwrap();
                        if ops::n_deps(op) > 1 {
                            write!(body, "{}a{}", ops::print_sep(op), el.i2).unwrap();
                        }
                        body.push_str(ops::print_post(op));
                    }
                }
            }
            body.push_str(";\n");
        }

        let mut signature = format!("void {}(", fname);
        for i in 0..self.inputs.len() {
            if i > 0 {
                signature.push_str(", ");
            }
            write!(signature, "const double* x{}", i).unwrap();
        }
        for k in 0..self.outputs.len() {
            if !self.inputs.is_empty() || k > 0 {
                signature.push_str(", ");
            }
            write!(signature, "double* r{}", k).unwrap();
        }
        signature.push(')');

        let mut code = gen.preamble();
        code.push_str(&signature);
        code.push_str(" {\n");
        code.push_str(&body);
        code.push_str("}\n");
        Ok(code)
    }
}

impl fmt::Display for SxFunction {
    /// Readable dump of the compiled tape, one record per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.initialized {
            return writeln!(f, "{}: not initialized", self.options.name);
        }
        let mut p_it = self.free_vars.iter();
        for el in &self.algorithm {
            if el.op == ScalarOp::Output {
                write!(f, "output[{}][{}] = @{}", el.i0, el.i2, el.i1)?;
            } else {
                write!(f, "@{} = ", el.i0)?;
                match el.op {
                    ScalarOp::Input => write!(f, "input[{}][{}]", el.i1, el.i2)?,
                    ScalarOp::Const => write!(f, "{}", el.d)?,
                    ScalarOp::Parameter => {
                        write!(f, "{}", p_it.next().expect("free variable replay"))?
                    }
                    op => {
                        write!(f, "{}@{}", ops::print_pre(op), el.i1)?;
                        if ops::n_deps(op) > 1 {
                            write!(f, "{}@{}", ops::print_sep(op), el.i2)?;
                        }
                        write!(f, "{}", ops::print_post(op))?;
                    }
                }
            }
            writeln!(f, ";")?;
        }
        Ok(())
    }
}
