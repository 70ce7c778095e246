use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use replrs::data::ReplicationDataBuilder;
use replrs::metadata::Metadata;
use replrs::{CovarianceType, OlsOptions, ReplicationRequest, Replicator};

fn request(n: usize, clusters: usize, cov_type: CovarianceType) -> ReplicationRequest {
    let mut rng = SmallRng::seed_from_u64(7);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x = DMatrix::from_fn(n, 5, |_, j| {
        if j == 0 {
            1.0
        } else {
            normal.sample(&mut rng)
        }
    });
    let y = DVector::from_fn(n, |i, _| {
        (0.2 + 0.5 * x[(i, 1)] - 0.1 * x[(i, 2)] + 0.1 * normal.sample(&mut rng)).exp()
    });
    let mut builder = ReplicationDataBuilder::new(y, x);
    if clusters > 0 {
        builder = builder.cluster((0..n).map(|i| i % clusters));
    }
    let data = builder.build().unwrap();
    ReplicationRequest::new(Metadata::new().paper_id("bench"), data, 1usize)
        .ols_options(OlsOptions::default().with_cov_type(cov_type))
}

fn bench_ols(c: &mut Criterion) {
    let mut group = c.benchmark_group("ols_fit");
    for &n in &[500usize, 5_000] {
        for (name, clusters, cov_type) in [
            ("hc3", 0, CovarianceType::HC3),
            ("cluster", 50, CovarianceType::Cluster),
        ] {
            let request = request(n, clusters, cov_type);
            group.bench_with_input(BenchmarkId::new(name, n), &request, |b, request| {
                b.iter(|| {
                    let mut replicator = Replicator::new(black_box(request.clone())).unwrap();
                    let _ = replicator.fit_ols().unwrap();
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_ols);
criterion_main!(benches);
