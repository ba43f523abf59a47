//! Optimizer benchmarks: proposal latency as the history grows.
//!
//! A proposal runs inside one loop iteration (100ms at the default 10 Hz),
//! so the surrogate fit plus acquisition search must stay far below that.

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shooter_tuner::config::CoefficientSpec;
use shooter_tuner::{SequentialOptimizer, ShotObservation, TunerConfig};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config() -> TunerConfig {
    let mut cfg = TunerConfig::empty();
    cfg.coefficients = vec![CoefficientSpec::new("kExitVelocity", 15.0, 0.0, 30.0, 0.5)];
    cfg.tuning_order = vec!["kExitVelocity".into()];
    cfg.optimizer.n_calls_per_coefficient = u32::MAX;
    cfg
}

/// An optimizer whose active campaign holds `shots` evaluations spread over
/// `shots / 3` distinct values.
fn seeded(shots: usize) -> SequentialOptimizer {
    let mut opt = SequentialOptimizer::new(&config());
    for i in 0..shots {
        let value = 12.0 + 0.25 * (i / 3) as f64;
        let hit = (i * 7) % 5 < 3;
        let coefficients = BTreeMap::from([("kExitVelocity".to_string(), value)]);
        opt.record_shot(&ShotObservation::manual(hit, coefficients, i as f64));
    }
    opt
}

// ---------------------------------------------------------------------------
// Bench: propose_next_value: history size sweep
// ---------------------------------------------------------------------------

fn bench_propose_next_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("propose_next_value");

    for shots in [10usize, 60, 240] {
        group.bench_with_input(BenchmarkId::new("shots", shots), &shots, |b, &shots| {
            b.iter_batched(
                || seeded(shots),
                |mut opt| black_box(opt.propose_next_value()),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: record_shot: validation plus journal append
// ---------------------------------------------------------------------------

fn bench_record_shot(c: &mut Criterion) {
    let mut opt = seeded(30);
    let coefficients = BTreeMap::from([("kExitVelocity".to_string(), 15.0)]);
    let mut ts = 1_000.0;

    c.bench_function("record_shot", |b| {
        b.iter(|| {
            ts += 1.0;
            let shot = ShotObservation::manual(true, coefficients.clone(), ts);
            black_box(opt.record_shot(black_box(&shot)))
        })
    });
}

criterion_group!(benches, bench_propose_next_value, bench_record_shot);
criterion_main!(benches);
