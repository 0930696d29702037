use cipherml::estimator::{Estimator, ExecutionMode, QuantizedForestClassifier};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

fn create_classification_data(n_rows: usize, n_features: usize) -> (Array2<f64>, Array1<f64>) {
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let x = Array2::from_shape_fn((n_rows, n_features), |_| rng.gen::<f64>());
    // label by a noisy half-space so trees have structure to learn
    let y = Array1::from_shape_fn(n_rows, |i| {
        let row_sum: f64 = (0..n_features).map(|j| x[[i, j]]).sum();
        if row_sum > n_features as f64 / 2.0 {
            1.0
        } else {
            0.0
        }
    });
    (x, y)
}

fn bench_clear_inference(c: &mut Criterion) {
    let mut group = c.benchmark_group("clear_inference");
    group.sample_size(20);

    for n_rows in [100, 500, 1000].iter() {
        let (x, y) = create_classification_data(*n_rows, 8);
        let mut model = QuantizedForestClassifier::new(6, 10)
            .with_max_depth(6)
            .with_random_state(7);
        model.fit(&x, &y).unwrap();

        group.bench_with_input(BenchmarkId::new("predict", n_rows), &x, |b, x| {
            b.iter(|| model.predict(black_box(x), ExecutionMode::Clear).unwrap())
        });
    }
    group.finish();
}

fn bench_fit(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit");
    group.sample_size(10);

    let (x, y) = create_classification_data(500, 8);
    group.bench_function("forest_fit_500x8", |b| {
        b.iter(|| {
            let mut model = QuantizedForestClassifier::new(6, 10)
                .with_max_depth(6)
                .with_random_state(7);
            model.fit(black_box(&x), black_box(&y)).unwrap()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_clear_inference, bench_fit);
criterion_main!(benches);
