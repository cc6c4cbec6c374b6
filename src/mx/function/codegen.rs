//! Tape disassembly and C code emission for matrix functions.

use std::fmt;
use std::fmt::Write as _;

use crate::codegen::CodeGenerator;
use crate::error::{FunctionError, Result};
use crate::mx::function::{AlgEl, MxFunction, UNUSED};
use crate::mx::node::{MxKind, OpTag};

impl MxFunction {
    /// Render one tape record in the `@slot` notation.
    fn fmt_el(&self, f: &mut fmt::Formatter<'_>, el: &AlgEl) -> fmt::Result {
        match el.op {
            OpTag::Output => {
                writeln!(f, "output[{}] = @{}", el.res[0], el.arg[0])
            }
            OpTag::SetNonzeros | OpTag::AddNonzeros => {
                let node = el.node.as_ref().unwrap();
                if el.res[0] != el.arg[0] {
                    write!(f, "@{} = @{}; ", el.res[0], el.arg[0])?;
                }
                writeln!(
                    f,
                    "@{}{}@{}",
                    el.res[0],
                    node.node().print_part(1),
                    el.arg[1]
                )
            }
            _ => {
                if el.res.len() == 1 {
                    write!(f, "@{} = ", el.res[0])?;
                } else {
                    write!(f, "{{")?;
                    for (i, &r) in el.res.iter().enumerate() {
                        if i != 0 {
                            write!(f, ", ")?;
                        }
                        if r != UNUSED {
                            write!(f, "@{}", r)?;
                        } else {
                            write!(f, "NULL")?;
                        }
                    }
                    write!(f, "}} = ")?;
                }
                if el.op == OpTag::Input {
                    writeln!(f, "input[{}]", el.arg[0])
                } else {
                    let node = el.node.as_ref().unwrap();
                    write!(f, "{}", node.node().print_part(0))?;
                    for (i, &a) in el.arg.iter().enumerate() {
                        if i != 0 {
                            write!(f, "{}", node.node().print_part(i))?;
                        }
                        if a != UNUSED {
                            write!(f, "@{}", a)?;
                        } else {
                            write!(f, "NULL")?;
                        }
                    }
                    if node.node().n_deps() > 0 {
                        write!(f, "{}", node.node().print_part(node.node().n_deps()))?;
                    }
                    writeln!(f)
                }
            }
        }
    }

    /// Generate a self-contained C routine evaluating the tape.
    ///
    /// The routine has one `const double*` parameter per input and one
    /// `double*` per output; null output pointers are skipped. Embedded
    /// functions are emitted as static dependencies ahead of the main
    /// routine.
    pub fn generate_code(&self, fname: &str) -> Result<String> {
        assert!(self.initialized, "function not initialized");
        if !self.free_vars.is_empty() {
            return Err(FunctionError::FreeVariableInCodegen {
                names: self.free_var_names(),
            });
        }

        let mut gen = CodeGenerator::new();

        // First pass: declare storage and import operator dependencies.
        for el in &self.algorithm {
            if let Some(node) = &el.node {
                if let MxKind::Call { fref, .. } = &node.node().kind {
                    let sub = fref.lock();
                    gen.add_dependency(fref.key(), |sym| {
                        let code = sub.generate_code(sym)?;
                        // Strip the duplicated include from the embedded
                        // definition; the preamble supplies it once.
                        Ok(code.replacen("#include <math.h>\n\n", "", 1))
                    })?;
                }
            }
        }

        // Second pass: one statement block per record.
        let mut body = String::new();
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

        for (slot, sp) in self.slot_sparsity.iter().enumerate() {
            writeln!(body, "  double w{}[{}] = {{0}};", slot, sp.nnz().max(1)).unwrap();
        }
        body.push_str("  int i;\n  (void)i;\n");

        for (counter, el) in self.algorithm.iter().enumerate() {
            writeln!(body, "  /* {} : {} */", counter, el.op).unwrap();
            match el.op {
                OpTag::Input => {
                    writeln!(
                        body,
                        "  for (i=0; i<{}; ++i) w{}[i] = x{}[i];",
                        self.inputs[el.arg[0] as usize].nnz(),
                        el.res[0],
                        el.arg[0]
                    )
                    .unwrap();
                }
                OpTag::Output => {
                    writeln!(
                        body,
                        "  if (r{0}) for (i=0; i<{1}; ++i) r{0}[i] = w{2}[i];",
                        el.res[0],
                        self.outputs[el.res[0] as usize].nnz(),
                        el.arg[0]
                    )
                    .unwrap();
                }
                _ => {
                    let node = el.node.as_ref().unwrap();
                    let arg_names: Vec<String> = el
                        .arg
                        .iter()
                        .map(|&a| {
                            if a == UNUSED {
                                "0".to_string()
                            } else {
                                format!("w{}", a)
                            }
                        })
                        .collect();
                    let res_names: Vec<String> = el
                        .res
                        .iter()
                        .map(|&r| {
                            if r == UNUSED {
                                "0".to_string()
                            } else {
                                format!("w{}", r)
                            }
                        })
                        .collect();
                    node.node().emit_code(&mut body, &arg_names, &res_names, &mut gen)?;
                }
            }
        }

        let mut code = gen.preamble();
        code.push_str(&signature);
        code.push_str(" {\n");
        code.push_str(&body);
        code.push_str("}\n");
        Ok(code)
    }
}

impl fmt::Display for MxFunction {
    /// Readable dump of the compiled tape, one record per line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.initialized {
            return writeln!(f, "{}: not initialized", self.options.name);
        }
        for el in &self.algorithm {
            self.fmt_el(f, el)?;
        }
        Ok(())
    }
}
