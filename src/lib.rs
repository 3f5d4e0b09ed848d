//! OpenHank solves continuous-time heterogeneous-agent consumption-saving
//! models with a liquid and an illiquid asset, from the household
//! Hamilton-Jacobi-Bellman equation down to simulated consumption responses.
//!
//! The crate combines an upwind finite-difference HJB solver, a stationary
//! Kolmogorov-forward solver sharing the same sparse generator, a
//! Feynman-Kac forecaster for quarterly marginal propensities to consume,
//! and a Monte Carlo simulator that cross-checks the forecasts and handles
//! pre-announced transfers.
//!
//! References used across modules include:
//! - Achdou, Han, Lasry, Lions, and Moll (2022) for the finite-difference
//!   treatment of heterogeneous-agent models in continuous time.
//! - Kaplan, Moll, and Violante (2018) for the two-asset household block and
//!   the kinked adjustment-cost technology.
//! - Barles and Souganidis (1991) for convergence of monotone schemes.
//! - Duffie and Epstein (1992) for stochastic differential utility.
//!
//! Numerical considerations:
//! - Policies are upwinded so the discrete generator is monotone; rows sum
//!   to zero exactly, which the distribution stage relies on.
//! - HJB updates are implicit in the asset transitions (banded solves per
//!   income block) and explicit in the income coupling; a large pseudo-time
//!   step turns each update into a near policy evaluation.
//! - The simulator restarts every household with identical random draws, so
//!   shocked-minus-baseline differences are measured under common random
//!   numbers.
//!
//! When to use this crate vs alternatives:
//! - Use `openhank` when you want the household block of a HANK-style model
//!   as one Rust-native pipeline with reusable pieces.
//! - Use a generic PDE or optimization crate if your problem does not have
//!   the drift-control-transition structure these solvers exploit.
//!
//! # Feature Flags
//! - `parallel`: enables Rayon-powered per-income-block solves and chunked
//!   Monte Carlo simulation.
//!
//! # Quick Start
//! Solve a small two-asset model:
//! ```rust
//! use openhank::engines::HjbSolver;
//! use openhank::grid::{AssetGrid, StateSpace};
//! use openhank::income::IncomeProcess;
//! use openhank::model::TwoAssetModel;
//! use openhank::params::ModelParams;
//!
//! let space = StateSpace::new(
//!     AssetGrid::power_spaced(6, 0.0, 25.0, 1.6).unwrap(),
//!     AssetGrid::power_spaced(4, 0.0, 30.0, 1.6).unwrap(),
//!     1,
//!     2,
//! )
//! .unwrap();
//! let income = IncomeProcess::two_state(0.8, 1.3, 0.25, 0.25).unwrap();
//! let model = TwoAssetModel::new(space, income, ModelParams::default()).unwrap();
//! let solution = HjbSolver::new().solve(&model).unwrap();
//! assert!(solution.policies.c.iter().all(|&c| c > 0.0));
//! ```
//!
//! Find the stationary distribution and aggregate wealth:
//! ```rust
//! use openhank::core::KfeMode;
//! use openhank::engines::{HjbSolver, KfeSolver};
//! use openhank::grid::{AssetGrid, StateSpace};
//! use openhank::income::IncomeProcess;
//! use openhank::model::TwoAssetModel;
//! use openhank::params::ModelParams;
//!
//! let space = StateSpace::new(
//!     AssetGrid::power_spaced(6, 0.0, 25.0, 1.6).unwrap(),
//!     AssetGrid::power_spaced(4, 0.0, 30.0, 1.6).unwrap(),
//!     1,
//!     2,
//! )
//! .unwrap();
//! let income = IncomeProcess::two_state(0.8, 1.3, 0.25, 0.25).unwrap();
//! let model = TwoAssetModel::new(space, income, ModelParams::default()).unwrap();
//! let solution = HjbSolver::new().solve(&model).unwrap();
//! let dist = KfeSolver::new()
//!     .with_mode(KfeMode::Direct)
//!     .solve(&model, &solution)
//!     .unwrap();
//! assert!((dist.mass() - 1.0).abs() < 1e-8);
//! assert!(dist.liquid_wealth() >= 0.0);
//! ```
//!
//! Price the consumption response to a windfall:
//! ```rust
//! use openhank::core::KfeMode;
//! use openhank::engines::{FeynmanKacMpc, HjbSolver, KfeSolver};
//! use openhank::grid::{AssetGrid, StateSpace};
//! use openhank::income::IncomeProcess;
//! use openhank::model::TwoAssetModel;
//! use openhank::params::ModelParams;
//!
//! let space = StateSpace::new(
//!     AssetGrid::power_spaced(6, 0.0, 25.0, 1.6).unwrap(),
//!     AssetGrid::power_spaced(4, 0.0, 30.0, 1.6).unwrap(),
//!     1,
//!     2,
//! )
//! .unwrap();
//! let income = IncomeProcess::two_state(0.8, 1.3, 0.25, 0.25).unwrap();
//! let model = TwoAssetModel::new(space, income, ModelParams::default()).unwrap();
//! let solution = HjbSolver::new().solve(&model).unwrap();
//! let dist = KfeSolver::new()
//!     .with_mode(KfeMode::Direct)
//!     .solve(&model, &solution)
//!     .unwrap();
//! let table = FeynmanKacMpc::new()
//!     .with_shock("transfer", 0.1)
//!     .compute(&model, &solution, &dist)
//!     .unwrap();
//! let record = table.get("transfer").unwrap();
//! assert!(record.annual > 0.0 && record.annual < 1.2);
//! ```
//!
//! Configure parameters fluently:
//! ```rust
//! use openhank::params::ModelParams;
//!
//! let params = ModelParams::builder()
//!     .discount_rates(vec![0.05, 0.06])
//!     .type_shares(vec![0.5, 0.5])
//!     .liquid_return(0.02)
//!     .illiquid_return(0.055)
//!     .death_rate(0.02)
//!     .build()
//!     .unwrap();
//! assert_eq!(params.n_types(), 2);
//! ```

pub mod core;
pub mod engines;
pub mod grid;
pub mod income;
pub mod math;
pub mod model;
pub mod params;
pub mod snapshots;

/// Common imports for ergonomic usage.
#[allow(ambiguous_glob_reexports)]
pub mod prelude {
    pub use crate::core::*;
    pub use crate::engines::*;
    pub use crate::grid::*;
    pub use crate::income::*;
    pub use crate::model::*;
    pub use crate::params::*;
    pub use crate::snapshots::*;
}
