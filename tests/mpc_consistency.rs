//! MPC Consistency Tests
//!
//! The Feynman-Kac forecaster and the Monte Carlo simulator measure the same
//! object through entirely different discretizations, so their agreement is
//! the strongest end-to-end check the crate has: policies, generator,
//! stationary distribution, forecast march, interpolation, and simulation
//! all sit inside the comparison. Also covers shock-sign asymmetry at the
//! borrowing constraint and the snapshot JSON path into the news simulator.

use openhank::engines::{FeynmanKacMpc, HjbSolver, KfeSolver, McMpcSimulator};
use openhank::grid::{AssetGrid, StateSpace};
use openhank::income::IncomeProcess;
use openhank::model::TwoAssetModel;
use openhank::params::ModelParams;
use openhank::snapshots::{PolicySnapshots, SnapshotStore};

fn benchmark_model() -> TwoAssetModel {
    let space = StateSpace::new(
        AssetGrid::power_spaced(30, 0.0, 25.0, 1.6).unwrap(),
        AssetGrid::power_spaced(8, 0.0, 40.0, 1.6).unwrap(),
        1,
        2,
    )
    .unwrap();
    let income = IncomeProcess::two_state(0.75, 1.3, 0.25, 0.25).unwrap();
    let params = ModelParams::builder()
        .discount_rate(0.055)
        .liquid_return(0.02)
        .illiquid_return(0.055)
        .build()
        .unwrap();
    TwoAssetModel::new(space, income, params).unwrap()
}

#[test]
fn forecast_and_simulation_agree_on_the_annual_mpc() {
    let model = benchmark_model();
    let solution = HjbSolver::new().solve(&model).unwrap();
    let dist = KfeSolver::new().solve(&model, &solution).unwrap();

    let fk = FeynmanKacMpc::new()
        .with_shock("windfall", 0.1)
        .compute(&model, &solution, &dist)
        .unwrap();
    let mc = McMpcSimulator::new()
        .with_households(8000)
        .with_shock("windfall", 0.1)
        .compute(&model, &solution, &dist)
        .unwrap();

    let fk_annual = fk.get("windfall").unwrap().annual;
    let mc_annual = mc.get("windfall").unwrap().annual;
    assert!(fk_annual > 0.0 && fk_annual < 1.1, "forecast {fk_annual}");
    assert!(mc_annual > 0.0 && mc_annual < 1.1, "simulated {mc_annual}");
    let gap = (mc_annual - fk_annual).abs();
    let gate = (0.08 * fk_annual.abs()).max(0.02);
    assert!(
        gap <= gate,
        "forecast {fk_annual} vs simulated {mc_annual} (gap {gap}, gate {gate})"
    );
}

#[test]
fn losses_move_consumption_at_least_as_much_as_gains() {
    let model = benchmark_model();
    let solution = HjbSolver::new().solve(&model).unwrap();
    let dist = KfeSolver::new().solve(&model, &solution).unwrap();
    let table = FeynmanKacMpc::new()
        .with_shock("gain", 0.1)
        .with_shock("loss", -0.1)
        .compute(&model, &solution, &dist)
        .unwrap();
    let gain = table.get("gain").unwrap().annual;
    let loss = table.get("loss").unwrap().annual;
    assert!(gain > 0.0 && gain < 1.05);
    assert!(loss > 0.0 && loss < 1.05);
    // consumption forecasts are concave in liquid wealth near the
    // constraint, so the response to a loss is at least as strong
    assert!(loss + 0.005 >= gain, "loss {loss} vs gain {gain}");
}

#[test]
fn snapshot_json_feeds_the_news_simulation() {
    let space = StateSpace::new(
        AssetGrid::power_spaced(10, 0.0, 15.0, 1.5).unwrap(),
        AssetGrid::singleton(0.0).unwrap(),
        1,
        2,
    )
    .unwrap();
    let income = IncomeProcess::two_state(0.7, 1.2, 0.3, 0.3).unwrap();
    let params = ModelParams::builder()
        .discount_rate(0.08)
        .liquid_return(0.01)
        .illiquid_return(0.0)
        .build()
        .unwrap();
    let model = TwoAssetModel::new(space, income, params).unwrap();
    let solution = HjbSolver::new().solve(&model).unwrap();
    let dist = KfeSolver::new().solve(&model, &solution).unwrap();

    let path = PolicySnapshots::new(
        vec![0.0, 1.0],
        vec![solution.policies.clone(), solution.policies.clone()],
    )
    .unwrap();
    let store = SnapshotStore::single("announced", path);
    let parsed = SnapshotStore::from_json(&store.to_json().unwrap()).unwrap();
    assert_eq!(store, parsed);

    let table = McMpcSimulator::new()
        .with_households(500)
        .with_news(parsed, 0.5)
        .with_shock("announced", 0.1)
        .compute(&model, &solution, &dist)
        .unwrap();
    let record = table.get("announced").unwrap();
    assert!(record.quarterly[0].abs() < 1e-14);
    assert!(record.quarterly[1].abs() < 1e-14);
    assert!(record.quarterly[2] > 0.005, "arrival quarter {}", record.quarterly[2]);
    assert!(record.annual > 0.0);
}
