use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::SeedableRng;
use strainfacts::{
    estimate_parameters, simulate_world, Data, DType, Device, EstimationSettings,
    ParameterizedModel, Program, SimulationSizes, Values, SIMPLE,
};

fn conditioned_model(strain: usize, sample: usize, position: usize) -> ParameterizedModel {
    let sizes = SimulationSizes {
        strain,
        sample,
        position,
    };
    let (model, world) = simulate_world(
        SIMPLE,
        sizes,
        BTreeMap::new(),
        Some(42),
        Data::new(),
        DType::Float64,
        Device::Cpu,
        true,
    )
    .unwrap();
    let metagenotype = world.metagenotype().unwrap();
    model.condition(metagenotype.to_counts_and_totals())
}

fn logp_benchmark(c: &mut Criterion, strain: usize, sample: usize, position: usize) {
    let model = conditioned_model(strain, sample, position);
    let mut program = model.program().unwrap();
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
    let mut position_vec = vec![0.; program.dim()];
    program
        .init_position(&Values::new(), &mut rng, &mut position_vec)
        .unwrap();
    let mut grad = vec![0.; program.dim()];

    c.bench_function(
        &format!("logp s={} n={} l={}", strain, sample, position),
        |b| b.iter(|| program.logp(black_box(&position_vec), &mut grad).unwrap()),
    );
}

fn criterion_benchmark(c: &mut Criterion) {
    logp_benchmark(c, 3, 10, 100);
    logp_benchmark(c, 10, 50, 1000);

    let model = conditioned_model(3, 10, 100);
    let settings = EstimationSettings {
        maxiter: 200,
        quiet: true,
        seed: Some(42),
        ..Default::default()
    };
    c.bench_function("estimate 200 steps s=3 n=10 l=100", |b| {
        b.iter_batched(
            || settings.clone(),
            |settings| estimate_parameters(&model, &Values::new(), &settings).unwrap(),
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
