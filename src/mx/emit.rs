//! Per-operator C emission for the built-in matrix operators.
//!
//! Gather and scatter indices are known at generation time, so pattern
//! changes emit straight-line assignments instead of index tables.

use std::fmt::Write as _;

use crate::codegen::CodeGenerator;
use crate::error::Result;
use crate::mx::node::{MxKind, MxNode};
use crate::sx::ops::{self, ScalarOp};

fn aux_for(op: ScalarOp, gen: &mut CodeGenerator) {
    match op {
        ScalarOp::Sq => gen.require_sq(),
        ScalarOp::Sign => gen.require_sign(),
        ScalarOp::Fabs => {}
        _ => {}
    }
}

impl MxNode {
    /// Emit C statements computing this operator. `arg_names`/`res_names`
    /// are array expressions (`"w3"`, or `"0"` for null results); a loop
    /// variable `i` is in scope.
    pub(crate) fn emit_code(
        &self,
        out: &mut String,
        arg_names: &[String],
        res_names: &[String],
        gen: &mut CodeGenerator,
    ) -> Result<()> {
        let r = &res_names[0];
        match &self.kind {
            MxKind::Const { value } => {
                for (k, &v) in value.data().iter().enumerate() {
                    writeln!(out, "  {}[{}] = {};", r, k, gen.constant(v)).unwrap();
                }
                Ok(())
            }
            MxKind::Unary { op, .. } => {
                aux_for(*op, gen);
                writeln!(
                    out,
                    "  for (i=0; i<{}; ++i) {}[i] = {}{}[i]{};",
                    self.sp[0].nnz(),
                    r,
                    ops::print_pre(*op),
                    arg_names[0],
                    ops::print_post(*op)
                )
                .unwrap();
                Ok(())
            }
            MxKind::Binary { op, deps } => {
                aux_for(*op, gen);
                let xs = deps[0].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let ys = deps[1].shape() == (1, 1) && self.sp[0].shape() != (1, 1);
                let a = format!("{}[{}]", arg_names[0], if xs { "0" } else { "i" });
                let b = format!("{}[{}]", arg_names[1], if ys { "0" } else { "i" });
                writeln!(
                    out,
                    "  for (i=0; i<{}; ++i) {}[i] = {}{}{}{}{};",
                    self.sp[0].nnz(),
                    r,
                    ops::print_pre(*op),
                    a,
                    ops::print_sep(*op),
                    if ops::n_deps(*op) == 2 { b.as_str() } else { "" },
                    ops::print_post(*op)
                )
                .unwrap();
                Ok(())
            }
            MxKind::Project { dep } => {
                for (k, (row, col)) in self.sp[0].coords().into_iter().enumerate() {
                    match dep.sparsity().find(row, col) {
                        Some(j) => {
                            writeln!(out, "  {}[{}] = {}[{}];", r, k, arg_names[0], j).unwrap()
                        }
                        None => writeln!(out, "  {}[{}] = 0.0;", r, k).unwrap(),
                    }
                }
                Ok(())
            }
            MxKind::GetNonzeros { nz, .. } => {
                for (k, &j) in nz.iter().enumerate() {
                    writeln!(out, "  {}[{}] = {}[{}];", r, k, arg_names[0], j).unwrap();
                }
                Ok(())
            }
            MxKind::SetNonzeros { nz, .. } | MxKind::AddNonzeros { nz, .. } => {
                let adding = matches!(self.kind, MxKind::AddNonzeros { .. });
                if res_names[0] != arg_names[0] {
                    writeln!(
                        out,
                        "  for (i=0; i<{}; ++i) {}[i] = {}[i];",
                        self.sp[0].nnz(),
                        r,
                        arg_names[0]
                    )
                    .unwrap();
                }
                for (k, &j) in nz.iter().enumerate() {
                    writeln!(
                        out,
                        "  {}[{}] {}= {}[{}];",
                        r,
                        j,
                        if adding { "+" } else { "" },
                        arg_names[1],
                        k
                    )
                    .unwrap();
                }
                Ok(())
            }
            MxKind::SumNz { dep } => {
                writeln!(out, "  {}[0] = 0.0;", r).unwrap();
                writeln!(
                    out,
                    "  for (i=0; i<{}; ++i) {}[0] += {}[i];",
                    dep.nnz(),
                    r,
                    arg_names[0]
                )
                .unwrap();
                Ok(())
            }
            MxKind::Lift { .. } => {
                writeln!(
                    out,
                    "  for (i=0; i<{}; ++i) {}[i] = {}[i];",
                    self.sp[0].nnz(),
                    r,
                    arg_names[0]
                )
                .unwrap();
                Ok(())
            }
            MxKind::Call { fref, .. } => {
                let sym = gen
                    .dependency_symbol(fref.key())
                    .expect("dependency registered by the declarations pass")
                    .to_string();
                let mut call = format!("  {}(", sym);
                for (i, a) in arg_names.iter().enumerate() {
                    if i > 0 {
                        call.push_str(", ");
                    }
                    call.push_str(a);
                }
                for rn in res_names {
                    call.push_str(", ");
                    call.push_str(rn);
                }
                call.push_str(");");
                writeln!(out, "{}", call).unwrap();
                Ok(())
            }
            MxKind::External { kernel, .. } => kernel.emit_code(out, arg_names, res_names, gen),
            MxKind::Parameter { .. } | MxKind::FunctionOutput { .. } => {
                unreachable!("handled at tape level")
            }
        }
    }
}
