use criterion::{Criterion, black_box, criterion_group, criterion_main};
use trustmesh_reputation::{IterationParams, Prior, TrustMatrix, power_iteration};
use uuid::Uuid;

fn bench_power_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("power_iteration");

    for size in [10, 100, 1000] {
        group.bench_with_input(
            criterion::BenchmarkId::new("sparse", size),
            &size,
            |b, &n| {
                let mut agents: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
                agents.sort();
                // Each agent trusts a handful of neighbours; every 7th is dangling.
                let mut local = TrustMatrix::new();
                for i in (0..n).filter(|i| i % 7 != 0) {
                    for k in 1..=5 {
                        let j = (i * 31 + k * 17) % n;
                        local.set(agents[i], agents[j], (k as f64) / 5.0);
                    }
                }

                b.iter(|| {
                    black_box(power_iteration(
                        &agents,
                        &local,
                        &Prior::Uniform,
                        IterationParams::default(),
                    ));
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_power_iteration);
criterion_main!(benches);
