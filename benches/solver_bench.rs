use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use openhank::engines::{HjbSolver, KfeSolver};
use openhank::grid::{AssetGrid, StateSpace};
use openhank::income::IncomeProcess;
use openhank::model::{PolicyEngine, TransitionBuilder, TwoAssetModel};
use openhank::params::ModelParams;
use std::hint::black_box;

// Performance goals (guideline, measured on target hardware):
// - policy update, 1500 states: < 1 ms
// - generator assembly, 1500 states: < 1 ms
// - full HJB solve, 480 states: < 250 ms

fn benchmark_model(nb: usize, na: usize) -> TwoAssetModel {
    let space = StateSpace::new(
        AssetGrid::power_spaced(nb, 0.0, 25.0, 1.6).expect("liquid grid should be valid"),
        AssetGrid::power_spaced(na, 0.0, 40.0, 1.6).expect("illiquid grid should be valid"),
        1,
        2,
    )
    .expect("state space should be valid");
    let income = IncomeProcess::two_state(0.75, 1.3, 0.25, 0.25)
        .expect("income process should be valid");
    let params = ModelParams::builder()
        .discount_rate(0.055)
        .liquid_return(0.02)
        .illiquid_return(0.055)
        .build()
        .expect("parameters should be valid");
    TwoAssetModel::new(space, income, params).expect("model should be valid")
}

fn bench_policy_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy_update");
    for nb in [20_usize, 50] {
        let model = benchmark_model(nb, 15);
        let value = model.initial_value().expect("initial value should exist");
        let engine = PolicyEngine::new();
        group.bench_with_input(BenchmarkId::from_parameter(nb), &nb, |b, _| {
            b.iter(|| {
                let policies = engine
                    .update(black_box(&model), black_box(&value))
                    .expect("policy update should succeed");
                black_box(policies)
            })
        });
    }
    group.finish();
}

fn bench_generator_assembly(c: &mut Criterion) {
    let model = benchmark_model(50, 15);
    let value = model.initial_value().expect("initial value should exist");
    let policies = PolicyEngine::new()
        .update(&model, &value)
        .expect("policy update should succeed");
    let drifts = model.asset_drifts(&policies);
    let builder = TransitionBuilder::new(&model);

    c.bench_function("generator_assembly_1500_states", |b| {
        b.iter(|| {
            let op = builder
                .build(black_box(&drifts), None)
                .expect("generator assembly should succeed");
            black_box(op)
        })
    });
}

fn bench_hjb_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("hjb_solve");
    group.sample_size(10);
    for nb in [15_usize, 30] {
        let model = benchmark_model(nb, 8);
        let solver = HjbSolver::new();
        group.bench_with_input(BenchmarkId::from_parameter(nb), &nb, |b, _| {
            b.iter(|| {
                let solution = solver.solve(black_box(&model)).expect("solve should succeed");
                black_box(solution.iterations)
            })
        });
    }
    group.finish();
}

fn bench_stationary_distribution(c: &mut Criterion) {
    let model = benchmark_model(30, 8);
    let solution = HjbSolver::new().solve(&model).expect("solve should succeed");
    let solver = KfeSolver::new();
    let mut group = c.benchmark_group("stationary_distribution");
    group.sample_size(10);

    group.bench_function("iterative_480_states", |b| {
        b.iter(|| {
            let dist = solver
                .solve(black_box(&model), black_box(&solution))
                .expect("distribution should solve");
            black_box(dist.iterations)
        })
    });
    group.finish();
}

criterion_group!(
    solver_benches,
    bench_policy_update,
    bench_generator_assembly,
    bench_hjb_solve,
    bench_stationary_distribution
);
criterion_main!(solver_benches);
