//! Compilation, evaluation and differentiation of scalar expression
//! functions.

use approx::assert_relative_eq;
use colugo::{sym_matrix, FunctionError, FunctionOptions, Matrix, Sparsity, SxElem, SxFunction};

fn scalar_in(v: f64) -> Matrix<f64> {
    Matrix::scalar(v)
}

// ── Construction ──

#[test]
fn empty_output_list_rejected() {
    let x = sym_matrix("x", Sparsity::scalar());
    match SxFunction::new(vec![x], vec![]) {
        Err(FunctionError::EmptyOutputList) => {}
        other => panic!("expected EmptyOutputList, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn non_symbolic_input_rejected() {
    let x = sym_matrix("x", Sparsity::scalar());
    let c = Matrix::new(Sparsity::scalar(), vec![SxElem::constant(1.0)]);
    let y = x.clone();
    match SxFunction::new(vec![x, c], vec![y]) {
        Err(FunctionError::NonSymbolicInput { index: 1 }) => {}
        other => panic!("expected NonSymbolicInput, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn duplicate_input_rejected() {
    let x = sym_matrix("x", Sparsity::scalar());
    let y = x.clone();
    match SxFunction::new(vec![x.clone(), x], vec![y]) {
        Err(FunctionError::DuplicateInput) => {}
        other => panic!("expected DuplicateInput, got {:?}", other.map(|_| ())),
    }
}

// ── Numeric evaluation ──

#[test]
fn identity_function() {
    let x = sym_matrix("x", Sparsity::dense(2, 1));
    let mut f = SxFunction::new(vec![x.clone()], vec![x]).unwrap();
    f.init().unwrap();
    assert_eq!(f.work_size(), 1);

    f.set_input(0, &Matrix::from_dense(2, 1, vec![3.0, 5.0])).unwrap();
    f.evaluate().unwrap();
    assert_eq!(f.get_output(0).unwrap().to_dense(), vec![3.0, 5.0]);
}

#[test]
fn elementary_chain() {
    let x = sym_matrix("x", Sparsity::scalar());
    let e = x.data()[0].clone();
    let y = e.clone().sin() * e.clone() + e.exp();
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::new(vec![x], vec![out]).unwrap();
    f.init().unwrap();

    f.set_input(0, &scalar_in(0.7)).unwrap();
    f.evaluate().unwrap();
    let expected = 0.7f64.sin() * 0.7 + 0.7f64.exp();
    assert_relative_eq!(f.get_output(0).unwrap().data()[0], expected, max_relative = 1e-15);
}

#[test]
fn live_variables_reuse_slots() {
    let a = sym_matrix("a", Sparsity::scalar());
    let b = sym_matrix("b", Sparsity::scalar());
    let t = a.data()[0].clone() + b.data()[0].clone();
    let y = t.clone() * t;
    let out = Matrix::new(Sparsity::scalar(), vec![y]);

    let mut live = SxFunction::new(vec![a.clone(), b.clone()], vec![out.clone()]).unwrap();
    live.init().unwrap();
    // The scalar allocator frees arguments before placing the result, so
    // the sum lands in a freed input slot and the square in the sum's.
    assert_eq!(live.work_size(), 2);

    let mut dead = SxFunction::with_options(
        vec![a, b],
        vec![out],
        FunctionOptions {
            live_variables: false,
            ..Default::default()
        },
    )
    .unwrap();
    dead.init().unwrap();
    assert_eq!(dead.work_size(), 4);
    assert!(live.work_size() <= dead.work_size());
}

#[test]
fn shared_subexpression_single_record() {
    let x = sym_matrix("x", Sparsity::scalar());
    let u = x.data()[0].clone().sin();
    let y1 = u.clone() + SxElem::one();
    let y2 = u * SxElem::constant(2.0);
    let o1 = Matrix::new(Sparsity::scalar(), vec![y1]);
    let o2 = Matrix::new(Sparsity::scalar(), vec![y2]);
    let mut f = SxFunction::new(vec![x], vec![o1, o2]).unwrap();
    f.init().unwrap();

    // input, sin, two constants, two binary ops, two output sentinels.
    assert_eq!(f.n_instructions(), 8);

    f.set_input(0, &scalar_in(0.5)).unwrap();
    f.evaluate().unwrap();
    let s = 0.5f64.sin();
    assert_relative_eq!(f.get_output(0).unwrap().data()[0], s + 1.0, max_relative = 1e-15);
    assert_relative_eq!(f.get_output(1).unwrap().data()[0], s * 2.0, max_relative = 1e-15);
}

#[test]
fn free_variable_blocks_numeric_evaluation() {
    let x = sym_matrix("x", Sparsity::scalar());
    let p = SxElem::sym("p");
    let y = x.data()[0].clone() + p;
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::new(vec![x.clone()], vec![out]).unwrap();
    f.init().unwrap();
    assert_eq!(f.free_variables().len(), 1);

    f.set_input(0, &scalar_in(1.0)).unwrap();
    match f.evaluate() {
        Err(FunctionError::FreeVariable { names }) => assert_eq!(names, vec!["p"]),
        other => panic!("expected FreeVariable, got {:?}", other),
    }

    // The symbolic path keeps the parameter as an expression.
    let (res, _, _) = f.eval_symbolic(&[x], &[], &[]).unwrap();
    assert_eq!(res.len(), 1);
}

// ── Derivatives ──

/// Forward and adjoint directional derivatives of a scalar chain, checked
/// against the analytic value.
fn check_scalar_derivative(
    build: impl Fn(SxElem) -> SxElem,
    reference: impl Fn(f64) -> f64,
    at: f64,
    tol: f64,
) {
    let x = sym_matrix("x", Sparsity::scalar());
    let y = build(x.data()[0].clone());
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::new(vec![x.clone()], vec![out]).unwrap();
    f.init().unwrap();

    let one = Matrix::new(Sparsity::scalar(), vec![SxElem::one()]);
    let (_, fsens, asens) = f
        .eval_symbolic(&[x.clone()], &[vec![one.clone()]], &[vec![one]])
        .unwrap();

    // Evaluate both sensitivity expressions at the point.
    let gf = Matrix::new(Sparsity::scalar(), vec![fsens[0][0].data()[0].clone()]);
    let ga = Matrix::new(Sparsity::scalar(), vec![asens[0][0].data()[0].clone()]);
    let mut df = SxFunction::new(vec![x], vec![gf, ga]).unwrap();
    df.init().unwrap();
    df.set_input(0, &scalar_in(at)).unwrap();
    df.evaluate().unwrap();

    let expected = reference(at);
    assert_relative_eq!(df.get_output(0).unwrap().data()[0], expected, max_relative = tol);
    assert_relative_eq!(df.get_output(1).unwrap().data()[0], expected, max_relative = tol);
}

#[test]
fn derivative_of_product_chain() {
    check_scalar_derivative(
        |x| x.clone().sin() * x,
        |v| v.cos() * v + v.sin(),
        0.7,
        1e-12,
    );
}

#[test]
fn derivative_of_nested_functions() {
    check_scalar_derivative(
        |x| x.sq().exp(),
        |v| (v * v).exp() * 2.0 * v,
        0.35,
        1e-12,
    );
}

#[test]
fn derivative_of_quotient() {
    check_scalar_derivative(
        |x| (x.clone() + SxElem::one()) / x.sq(),
        |v| (v * v - (v + 1.0) * 2.0 * v) / (v * v * v * v),
        1.3,
        1e-12,
    );
}

#[test]
fn multi_input_gradient() {
    let a = sym_matrix("a", Sparsity::scalar());
    let b = sym_matrix("b", Sparsity::scalar());
    let y = a.data()[0].clone() * b.data()[0].clone().sin();
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::new(vec![a.clone(), b.clone()], vec![out]).unwrap();
    f.init().unwrap();

    let one = Matrix::new(Sparsity::scalar(), vec![SxElem::one()]);
    let (_, _, asens) = f
        .eval_symbolic(&[a.clone(), b.clone()], &[], &[vec![one]])
        .unwrap();

    let ga = Matrix::new(Sparsity::scalar(), vec![asens[0][0].data()[0].clone()]);
    let gb = Matrix::new(Sparsity::scalar(), vec![asens[0][1].data()[0].clone()]);
    let mut g = SxFunction::new(vec![a, b], vec![ga, gb]).unwrap();
    g.init().unwrap();
    g.set_input(0, &scalar_in(2.0)).unwrap();
    g.set_input(1, &scalar_in(0.6)).unwrap();
    g.evaluate().unwrap();

    assert_relative_eq!(g.get_output(0).unwrap().data()[0], 0.6f64.sin(), max_relative = 1e-12);
    assert_relative_eq!(
        g.get_output(1).unwrap().data()[0],
        2.0 * 0.6f64.cos(),
        max_relative = 1e-12
    );
}

#[test]
fn output_given_reuses_recorded_expressions() {
    let x = sym_matrix("x", Sparsity::scalar());
    let y = x.data()[0].clone().sin() + x.data()[0].clone();
    let out = Matrix::new(Sparsity::scalar(), vec![y.clone()]);
    let mut f = SxFunction::new(vec![x.clone()], vec![out]).unwrap();
    f.init().unwrap();

    let (res, _, _) = f.eval_symbolic(&[x], &[], &[]).unwrap();
    assert!(res[0].data()[0].is_equal(&y, 0), "stored expression returned");
}

#[test]
fn smoothness_demand_rejects_kinks() {
    let x = sym_matrix("x", Sparsity::scalar());
    let y = x.data()[0].clone().abs();
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::with_options(
        vec![x.clone()],
        vec![out],
        FunctionOptions {
            assert_smooth: true,
            ..Default::default()
        },
    )
    .unwrap();
    f.init().unwrap();
    assert!(!f.is_smooth());

    let one = Matrix::new(Sparsity::scalar(), vec![SxElem::one()]);
    match f.eval_symbolic(&[x], &[], &[vec![one]]) {
        Err(FunctionError::NonSmoothAdjoint(_)) => {}
        other => panic!("expected NonSmoothAdjoint, got {:?}", other.map(|_| ())),
    }
}

// ── Sparsity propagation ──

#[test]
fn sparsity_forward_and_reverse() {
    // y0 = x0 * x1, y1 = x2
    let x = sym_matrix("x", Sparsity::dense(3, 1));
    let y0 = x.data()[0].clone() * x.data()[1].clone();
    let y1 = x.data()[2].clone();
    let o0 = Matrix::new(Sparsity::scalar(), vec![y0]);
    let o1 = Matrix::new(Sparsity::scalar(), vec![y1]);
    let mut f = SxFunction::new(vec![x], vec![o0, o1]).unwrap();
    f.init().unwrap();

    f.set_input_mask(0, &[0b001, 0b010, 0b100]);
    f.eval_sparsity(true).unwrap();
    assert_eq!(f.get_output_mask(0), &[0b011]);
    assert_eq!(f.get_output_mask(1), &[0b100]);

    f.set_output_mask(0, &[0b1]);
    f.set_output_mask(1, &[0b10]);
    f.eval_sparsity(false).unwrap();
    assert_eq!(f.get_input_mask(0), &[0b1, 0b1, 0b10]);
}

// ── Dump and code emission ──

#[test]
fn tape_dump_format() {
    let x = sym_matrix("x", Sparsity::scalar());
    let y = x.data()[0].clone().sin();
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::new(vec![x], vec![out]).unwrap();
    f.init().unwrap();

    let dump = f.to_string();
    assert!(dump.contains("@0 = input[0][0];"), "dump:\n{}", dump);
    assert!(dump.contains("sin(@0)"), "dump:\n{}", dump);
    assert!(dump.contains("output[0][0]"), "dump:\n{}", dump);
}

#[test]
fn generated_code_shape() {
    let x = sym_matrix("x", Sparsity::dense(2, 1));
    let s = x.data()[0].clone().sq() + x.data()[1].clone().sq();
    let out = Matrix::new(Sparsity::scalar(), vec![s]);
    let mut f = SxFunction::new(vec![x], vec![out]).unwrap();
    f.init().unwrap();

    let code = f.generate_code("eval").unwrap();
    assert!(code.contains("void eval(const double* x0, double* r0)"));
    assert!(code.contains("static double sq("));
    assert!(code.contains("if (r0!=0)"));
}

#[test]
fn init_is_idempotent() {
    let x = sym_matrix("x", Sparsity::scalar());
    let y = x.data()[0].clone().exp();
    let out = Matrix::new(Sparsity::scalar(), vec![y]);
    let mut f = SxFunction::new(vec![x], vec![out]).unwrap();
    f.init().unwrap();
    let n = f.n_instructions();
    f.init().unwrap();
    assert_eq!(f.n_instructions(), n);
}
