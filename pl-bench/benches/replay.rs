use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;

use pl_core::config::NStepConfig;
use pl_core::NonGreedyWindows;
use pl_replay::{build_transitions, ReplayBuffer};

fn bench_nstep(c: &mut Criterion) {
    let mut g = c.benchmark_group("pl_replay_nstep");
    for mode in [NonGreedyWindows::Keep, NonGreedyWindows::Drop, NonGreedyWindows::Truncate] {
        let cfg = NStepConfig {
            non_greedy: mode,
            ..NStepConfig::default()
        };
        let rollout = pl_bench::rollout(400, 11);
        g.bench_with_input(
            BenchmarkId::new("build_transitions_400", format!("{mode:?}")),
            &rollout,
            |b, r| b.iter(|| black_box(build_transitions(black_box(r), &cfg))),
        );
    }
    g.finish();
}

fn bench_sample(c: &mut Criterion) {
    let mut g = c.benchmark_group("pl_replay_sample");
    let mut buf = ReplayBuffer::new(50_000).unwrap();
    let cfg = NStepConfig::default();
    for seed in 0..100 {
        let (transitions, _) = build_transitions(&pl_bench::rollout(500, seed), &cfg);
        for t in transitions {
            buf.push(t);
        }
    }
    for &batch in &[64usize, 512usize] {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        g.bench_with_input(BenchmarkId::new("uniform", batch), &batch, |b, &n| {
            b.iter(|| black_box(buf.sample(n, &mut rng)))
        });
    }
    g.finish();
}

criterion_group!(benches, bench_nstep, bench_sample);
criterion_main!(benches);
