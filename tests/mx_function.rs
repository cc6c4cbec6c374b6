//! Compilation and numeric evaluation of matrix expression functions.

use approx::assert_relative_eq;
use colugo::{FunctionError, FunctionOptions, FunctionRef, Matrix, Mx, MxFunction, Sparsity};

/// Compile `outputs` over `inputs`, evaluate at `vals`, return dense
/// output vectors.
fn num_eval(inputs: Vec<Mx>, outputs: Vec<Mx>, vals: &[Matrix<f64>]) -> Vec<Vec<f64>> {
    let mut f = MxFunction::new(inputs, outputs).unwrap();
    f.init().unwrap();
    for (i, v) in vals.iter().enumerate() {
        f.set_input(i, v).unwrap();
    }
    f.evaluate().unwrap();
    (0..f.n_out())
        .map(|k| f.get_output(k).unwrap().to_dense())
        .collect()
}

// ── Construction ──

#[test]
fn empty_output_list_rejected() {
    let x = Mx::sym_dense("x", 1, 1);
    match MxFunction::new(vec![x], vec![]) {
        Err(FunctionError::EmptyOutputList) => {}
        other => panic!("expected EmptyOutputList, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn non_symbolic_input_rejected() {
    let x = Mx::sym_dense("x", 1, 1);
    let c = Mx::scalar(3.0);
    let y = &x + &c;
    match MxFunction::new(vec![x, c], vec![y]) {
        Err(FunctionError::NonSymbolicInput { index: 1 }) => {}
        other => panic!("expected NonSymbolicInput, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn duplicate_input_rejected() {
    let x = Mx::sym_dense("x", 1, 1);
    let y = x.sin();
    match MxFunction::new(vec![x.clone(), x], vec![y]) {
        Err(FunctionError::DuplicateInput) => {}
        other => panic!("expected DuplicateInput, got {:?}", other.map(|_| ())),
    }
}

// ── Identity ──

#[test]
fn identity_function() {
    let x = Mx::sym_dense("x", 2, 1);
    let mut f = MxFunction::new(vec![x.clone()], vec![x]).unwrap();
    f.init().unwrap();
    assert_eq!(f.work_size(), 1);

    f.set_input(0, &Matrix::from_dense(2, 1, vec![3.0, 5.0])).unwrap();
    f.evaluate().unwrap();
    assert_eq!(f.get_output(0).unwrap().to_dense(), vec![3.0, 5.0]);
}

#[test]
fn init_is_idempotent() {
    let x = Mx::sym_dense("x", 2, 1);
    let y = x.sin();
    let mut f = MxFunction::new(vec![x], vec![y]).unwrap();
    f.init().unwrap();
    let w = f.work_size();
    let n = f.n_instructions();
    f.init().unwrap();
    assert_eq!(f.work_size(), w);
    assert_eq!(f.n_instructions(), n);
}

// ── Slot reuse ──

#[test]
fn live_variables_reuse_slots() {
    let a = Mx::sym_dense("a", 3, 1);
    let b = Mx::sym_dense("b", 3, 1);
    let t = &a + &b;
    let y = &t * &t;

    // The sum cannot alias its arguments (results allocate before the
    // argument free phase), so three slots stay live; the product then
    // reuses the freed slot of `a`.
    let mut live = MxFunction::new(vec![a.clone(), b.clone()], vec![y.clone()]).unwrap();
    live.init().unwrap();
    assert_eq!(live.work_size(), 3);

    let mut dead = MxFunction::with_options(
        vec![a, b],
        vec![y],
        FunctionOptions {
            live_variables: false,
            ..Default::default()
        },
    )
    .unwrap();
    dead.init().unwrap();
    // a, b, a+b and the product each get their own slot.
    assert_eq!(dead.work_size(), 4);
    assert!(live.work_size() <= dead.work_size());
}

#[test]
fn slot_reuse_only_pairs_identical_sparsity() {
    // A 2x1 intermediate dies, but the next allocation is 3x1: no reuse.
    let x = Mx::sym_dense("x", 2, 1);
    let z = Mx::sym_dense("z", 3, 1);
    let t = x.sin().sum_nz();
    let y = &z + &(&z * &t);
    let mut f = MxFunction::new(vec![x, z], vec![y]).unwrap();
    f.init().unwrap();

    f.set_input(0, &Matrix::from_dense(2, 1, vec![0.0, 0.0])).unwrap();
    f.set_input(1, &Matrix::from_dense(3, 1, vec![1.0, 2.0, 3.0])).unwrap();
    f.evaluate().unwrap();
    assert_eq!(f.get_output(0).unwrap().to_dense(), vec![1.0, 2.0, 3.0]);
}

// ── Shared subexpressions ──

#[test]
fn shared_subexpression_evaluated_once() {
    let x = Mx::sym_dense("x", 1, 1);
    let u = x.sin();
    let y1 = &u + &Mx::scalar(1.0);
    let y2 = &u * &Mx::scalar(2.0);
    let mut f = MxFunction::new(vec![x], vec![y1, y2]).unwrap();
    f.init().unwrap();

    // input, sin, two constants, two ops, two output sentinels.
    assert_eq!(f.n_instructions(), 8);

    f.set_input(0, &Matrix::scalar(0.5)).unwrap();
    f.evaluate().unwrap();
    let s = 0.5f64.sin();
    assert_relative_eq!(f.get_output(0).unwrap().data()[0], s + 1.0, max_relative = 1e-15);
    assert_relative_eq!(f.get_output(1).unwrap().data()[0], s * 2.0, max_relative = 1e-15);
}

// ── Free variables ──

#[test]
fn free_variable_blocks_numeric_evaluation() {
    let x = Mx::sym_dense("x", 1, 1);
    let p = Mx::sym_dense("p", 1, 1);
    let y = &x + &p;
    let mut f = MxFunction::new(vec![x.clone()], vec![y]).unwrap();
    f.init().unwrap();
    assert_eq!(f.free_variables().len(), 1);
    assert_eq!(f.free_variables()[0].name(), Some("p"));

    f.set_input(0, &Matrix::scalar(1.0)).unwrap();
    match f.evaluate() {
        Err(FunctionError::FreeVariable { names }) => assert_eq!(names, vec!["p"]),
        other => panic!("expected FreeVariable, got {:?}", other),
    }

    // Symbolic replay succeeds: the free parameter stays symbolic.
    let (res, _, _) = f.eval_symbolic(&[x], &[], &[]).unwrap();
    assert_eq!(res.len(), 1);
}

#[test]
fn free_variable_set_is_permutation_invariant() {
    let x = Mx::sym_dense("x", 1, 1);
    let p = Mx::sym_dense("p", 1, 1);
    let q = Mx::sym_dense("q", 1, 1);
    let y1 = &x + &p;
    let y2 = &x * &q;

    let mut f = MxFunction::new(vec![x.clone()], vec![y1.clone(), y2.clone()]).unwrap();
    f.init().unwrap();
    let mut g = MxFunction::new(vec![x], vec![y2, y1]).unwrap();
    g.init().unwrap();

    let mut names_f: Vec<_> = f.free_variables().iter().map(|v| v.name().unwrap().to_string()).collect();
    let mut names_g: Vec<_> = g.free_variables().iter().map(|v| v.name().unwrap().to_string()).collect();
    names_f.sort();
    names_g.sort();
    assert_eq!(names_f, names_g);
}

// ── Nonzero scatter and in-place aliasing ──

#[test]
fn set_and_add_nonzeros() {
    let x = Mx::sym_dense("x", 3, 1);
    let s = Mx::sym_dense("s", 2, 1);
    let set = x.set_nonzeros(&s, vec![0, 2]);
    let add = x.add_nonzeros(&s, vec![0, 2]);
    let out = num_eval(
        vec![x, s],
        vec![set, add],
        &[
            Matrix::from_dense(3, 1, vec![1.0, 2.0, 3.0]),
            Matrix::from_dense(2, 1, vec![10.0, 30.0]),
        ],
    );
    assert_eq!(out[0], vec![10.0, 2.0, 30.0]);
    assert_eq!(out[1], vec![11.0, 2.0, 33.0]);
}

#[test]
fn inplace_scatter_chain() {
    // A chain of scatters over the same base exercises the split free
    // phase: each result may alias its destination argument.
    let x = Mx::sym_dense("x", 4, 1);
    let a = Mx::sym_dense("a", 1, 1);
    let b = Mx::sym_dense("b", 1, 1);
    let t = x.set_nonzeros(&a, vec![0]);
    let y = t.set_nonzeros(&b, vec![3]);
    let out = num_eval(
        vec![x, a, b],
        vec![y],
        &[
            Matrix::from_dense(4, 1, vec![1.0, 2.0, 3.0, 4.0]),
            Matrix::scalar(-1.0),
            Matrix::scalar(-4.0),
        ],
    );
    assert_eq!(out[0], vec![-1.0, 2.0, 3.0, -4.0]);
}

#[test]
fn gather_nonzeros() {
    let x = Mx::sym_dense("x", 4, 1);
    let y = x.get_nonzeros(Sparsity::dense(2, 1), vec![3, 1]);
    let out = num_eval(
        vec![x],
        vec![y],
        &[Matrix::from_dense(4, 1, vec![1.0, 2.0, 3.0, 4.0])],
    );
    assert_eq!(out[0], vec![4.0, 2.0]);
}

// ── Multi-output calls ──

#[test]
fn multi_output_call_with_ignored_output() {
    // Inner function with two outputs.
    let u = Mx::sym_dense("u", 2, 1);
    let q = u.sin();
    let r = u.cos();
    let mut inner = MxFunction::with_options(
        vec![u],
        vec![q, r],
        FunctionOptions::named("inner"),
    )
    .unwrap();
    inner.init().unwrap();
    let fref = FunctionRef::new(inner);

    let x = Mx::sym_dense("x", 2, 1);
    let outs = Mx::call(&fref, vec![x.clone()]).unwrap();
    assert_eq!(outs.len(), 2);

    // Only the first output is consumed.
    let y = &outs[0] + &Mx::scalar(1.0);
    let mut f = MxFunction::new(vec![x], vec![y]).unwrap();
    f.init().unwrap();

    let dump = f.to_string();
    assert!(dump.contains("NULL"), "ignored output prints NULL:\n{}", dump);
    assert!(dump.contains("inner("), "call prints its name:\n{}", dump);

    f.set_input(0, &Matrix::from_dense(2, 1, vec![0.1, 0.2])).unwrap();
    f.evaluate().unwrap();
    let got = f.get_output(0).unwrap().to_dense();
    assert_relative_eq!(got[0], 0.1f64.sin() + 1.0, max_relative = 1e-15);
    assert_relative_eq!(got[1], 0.2f64.sin() + 1.0, max_relative = 1e-15);
}

#[test]
fn call_of_uninitialized_function_fails_at_init() {
    let u = Mx::sym_dense("u", 1, 1);
    let inner = MxFunction::new(vec![u.clone()], vec![u.sin()]).unwrap();
    let fref = FunctionRef::new(inner); // not initialized

    let x = Mx::sym_dense("x", 1, 1);
    let outs = Mx::call(&fref, vec![x.clone()]).unwrap();
    let mut f = MxFunction::new(vec![x], vec![outs[0].clone()]).unwrap();
    match f.init() {
        Err(FunctionError::UninitializedDependency { .. }) => {}
        other => panic!("expected UninitializedDependency, got {:?}", other),
    }
}

// ── Sparsity propagation ──

#[test]
fn sparsity_forward_tracks_dependencies() {
    // y0 depends on x nonzero 0 only; y1 on nonzero 1 only.
    let x = Mx::sym_dense("x", 2, 1);
    let y0 = x.get_nonzeros(Sparsity::dense(1, 1), vec![0]);
    let y1 = x.get_nonzeros(Sparsity::dense(1, 1), vec![1]).sin();
    let mut f = MxFunction::new(vec![x], vec![y0, y1]).unwrap();
    f.init().unwrap();

    f.set_input_mask(0, &[0b01, 0b10]);
    f.eval_sparsity(true).unwrap();
    assert_eq!(f.get_output_mask(0), &[0b01]);
    assert_eq!(f.get_output_mask(1), &[0b10]);
}

#[test]
fn sparsity_reverse_moves_bits_to_inputs() {
    let x = Mx::sym_dense("x", 2, 1);
    let y = x.sin().sum_nz();
    let mut f = MxFunction::new(vec![x], vec![y]).unwrap();
    f.init().unwrap();

    f.set_output_mask(0, &[0b1]);
    f.eval_sparsity(false).unwrap();
    assert_eq!(f.get_input_mask(0), &[0b1, 0b1]);
}

// ── Code emission ──

#[test]
fn generated_code_shape() {
    let x = Mx::sym_dense("x", 2, 1);
    let y = &x.sin() * &x;
    let mut f = MxFunction::new(vec![x], vec![y]).unwrap();
    f.init().unwrap();
    let code = f.generate_code("eval").unwrap();
    assert!(code.contains("void eval(const double* x0, double* r0)"));
    assert!(code.contains("sin("));
    assert!(code.contains("if (r0)"));
}

#[test]
fn codegen_rejects_free_variables() {
    let x = Mx::sym_dense("x", 1, 1);
    let p = Mx::sym_dense("p", 1, 1);
    let mut f = MxFunction::new(vec![x], vec![p.sin()]).unwrap();
    f.init().unwrap();
    match f.generate_code("eval") {
        Err(FunctionError::FreeVariableInCodegen { .. }) => {}
        other => panic!("expected FreeVariableInCodegen, got {:?}", other.map(|_| ())),
    }
}
