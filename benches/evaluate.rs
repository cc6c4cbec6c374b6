use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use colugo::{Matrix, Mx, MxFunction};

/// A chain of elementwise operations over an n-vector, summed to a scalar.
fn build_chain(n: usize, depth: usize) -> (MxFunction, Matrix<f64>) {
    let x = Mx::sym_dense("x", n, 1);
    let mut t = x.clone();
    for _ in 0..depth {
        t = &t.sin() * &x + &t.sq();
    }
    let y = t.sum_nz();
    let mut f = MxFunction::new(vec![x], vec![y]).unwrap();
    f.init().unwrap();
    let at = Matrix::from_dense(n, 1, (0..n).map(|i| 0.1 + i as f64 * 0.01).collect());
    (f, at)
}

fn bench_numeric(c: &mut Criterion) {
    let mut group = c.benchmark_group("numeric_evaluate");
    for &n in &[8usize, 64, 256] {
        let (mut f, at) = build_chain(n, 8);
        f.set_input(0, &at).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                f.evaluate().unwrap();
                black_box(f.get_output(0).unwrap().data()[0])
            })
        });
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_chain", |b| {
        b.iter(|| {
            let (f, _) = build_chain(black_box(32), 8);
            black_box(f.work_size())
        })
    });
}

fn bench_adjoint_replay(c: &mut Criterion) {
    let (f, _) = build_chain(16, 4);
    let x = f.input_exprs()[0].clone();
    let seed = Mx::constant(Matrix::scalar(1.0));
    c.bench_function("symbolic_adjoint", |b| {
        b.iter(|| {
            let (_, _, asens) = f
                .eval_symbolic(&[x.clone()], &[], &[vec![seed.clone()]])
                .unwrap();
            black_box(asens[0][0].nnz())
        })
    });
}

criterion_group!(benches, bench_numeric, bench_compile, bench_adjoint_replay);
criterion_main!(benches);
