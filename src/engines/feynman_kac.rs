//! Module `engines::feynman_kac`.
//!
//! Marginal propensities to consume by forward expectation. Cumulative
//! expected consumption `W(x, t)` solves a linear forecast equation driven by
//! the converged policies and generator; marching it with implicit Euler
//! steps and reading it off at quarter marks prices the consumption response
//! to a liquid windfall without simulating a single household. The shocked
//! household is the same household started at a shifted liquid position, so
//! one factorization serves every shock size.

use log::debug;
use nalgebra::DVector;

use crate::core::{MpcRecord, MpcTable, ShockSpec, SolveError};
use crate::engines::hjb::HjbSolution;
use crate::engines::kfe::StationaryDistribution;
use crate::grid::StateSpace;
use crate::model::TwoAssetModel;

const QUARTER: f64 = 0.25;

/// Evaluates a per-state field at a liquid position shifted by `eps`,
/// holding every other coordinate fixed. Inside the grid this is linear
/// interpolation along the liquid axis; above it the top slope extrapolates;
/// below it the shortfall is charged one for one.
pub(crate) fn shift_along_liquid(space: &StateSpace, field: &[f64], eps: f64) -> Vec<f64> {
    let nb = space.nb();
    let grid = &space.liquid;
    let bottom = grid.node(0);
    let top = grid.node(nb - 1);
    let mut out = vec![0.0; field.len()];
    for (idx, slot) in out.iter_mut().enumerate() {
        let (ib, ia, iz, iy) = space.unflatten(idx);
        let x = grid.node(ib) + eps;
        *slot = if x < bottom {
            field[space.flatten(0, ia, iz, iy)] + (x - bottom)
        } else if x > top {
            let hi = space.flatten(nb - 1, ia, iz, iy);
            let lo = space.flatten(nb - 2, ia, iz, iy);
            let slope = (field[hi] - field[lo]) / (top - grid.node(nb - 2));
            (x - top).mul_add(slope, field[hi])
        } else {
            let (lo, t) = grid.locate(x);
            let hi = (lo + 1).min(nb - 1);
            let f0 = field[space.flatten(lo, ia, iz, iy)];
            let f1 = field[space.flatten(hi, ia, iz, iy)];
            f0.mul_add(1.0 - t, f1 * t)
        };
    }
    out
}

/// Feynman-Kac MPC calculator.
#[derive(Debug, Clone)]
pub struct FeynmanKacMpc {
    step: f64,
    shocks: Vec<ShockSpec>,
}

impl Default for FeynmanKacMpc {
    fn default() -> Self {
        Self {
            step: 0.025,
            shocks: Vec::new(),
        }
    }
}

impl FeynmanKacMpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Implicit Euler step length in years. Must divide a quarter evenly.
    pub fn with_step(mut self, step: f64) -> Self {
        self.step = step;
        self
    }

    pub fn with_shock(mut self, label: impl Into<String>, size: f64) -> Self {
        self.shocks.push(ShockSpec::new(label, size));
        self
    }

    pub fn with_shocks(mut self, shocks: Vec<ShockSpec>) -> Self {
        self.shocks = shocks;
        self
    }

    fn steps_per_quarter(&self) -> Result<usize, SolveError> {
        if !(self.step > 0.0) || !self.step.is_finite() {
            return Err(SolveError::InvalidInput(
                "forecast step must be positive and finite".to_string(),
            ));
        }
        let per = (QUARTER / self.step).round();
        if per < 1.0 || (per * self.step - QUARTER).abs() > 1e-9 {
            return Err(SolveError::InvalidInput(format!(
                "forecast step {} does not divide a quarter evenly",
                self.step
            )));
        }
        Ok(per as usize)
    }

    fn validate(
        &self,
        model: &TwoAssetModel,
        solution: &HjbSolution,
        dist: &StationaryDistribution,
    ) -> Result<usize, SolveError> {
        let per = self.steps_per_quarter()?;
        if self.shocks.is_empty() {
            return Err(SolveError::InvalidInput(
                "at least one shock is required".to_string(),
            ));
        }
        for shock in &self.shocks {
            if shock.size == 0.0 || !shock.size.is_finite() {
                return Err(SolveError::InvalidInput(format!(
                    "shock '{}' must have a non-zero finite size",
                    shock.label
                )));
            }
        }
        let n = model.space().n_states();
        if solution.generator.n() != n || solution.policies.c.len() != n {
            return Err(SolveError::InvalidInput(
                "solution does not match the model's state space".to_string(),
            ));
        }
        if dist.space.n_types != model.space().n_types
            || dist.space.n_income != model.space().n_income
        {
            return Err(SolveError::InvalidInput(
                "distribution lives on an incompatible state space".to_string(),
            ));
        }
        Ok(per)
    }

    /// Computes quarterly and annual MPCs for every configured shock.
    pub fn compute(
        &self,
        model: &TwoAssetModel,
        solution: &HjbSolution,
        dist: &StationaryDistribution,
    ) -> Result<MpcTable, SolveError> {
        let per_quarter = self.validate(model, solution, dist)?;
        let space = model.space();
        let n = space.n_states();
        let m = space.per_income();
        let ny = space.n_income;
        let h = self.step;
        let death = model.params().death_rate;

        // (1/h + death) I - A - income coupling, factored once
        let mut divisor = solution.generator.to_dense();
        for k in 0..ny {
            for j in 0..ny {
                let rate = model.income().rate(k, j);
                if rate != 0.0 {
                    for l in 0..m {
                        divisor[(k * m + l, j * m + l)] += rate;
                    }
                }
            }
        }
        divisor *= -1.0;
        for i in 0..n {
            divisor[(i, i)] += 1.0 / h + death;
        }
        let lu = divisor.lu();

        // march cumulative expected consumption to the four quarter marks
        let mut w = DVector::<f64>::zeros(n);
        let mut stages: Vec<Vec<f64>> = Vec::with_capacity(4);
        for quarter in 1..=4usize {
            for _ in 0..per_quarter {
                let mut rhs = DVector::<f64>::zeros(n);
                for i in 0..n {
                    rhs[i] = solution.policies.c[i] + w[i] / h;
                }
                w = lu.solve(&rhs).ok_or_else(|| {
                    SolveError::NumericalError(
                        "consumption forecast system is singular".to_string(),
                    )
                })?;
            }
            debug!("consumption forecast advanced to quarter {quarter}");
            stages.push(w.iter().copied().collect());
        }

        let mut records = Vec::with_capacity(self.shocks.len());
        for shock in &self.shocks {
            let eps = shock.size;
            let mut quarterly = [0.0; 4];
            let mut prev_base = vec![0.0; n];
            let mut prev_shift = vec![0.0; n];
            for (q, stage) in stages.iter().enumerate() {
                let shifted = shift_along_liquid(space, stage, eps);
                let mut field = vec![0.0; n];
                for i in 0..n {
                    field[i] = ((shifted[i] - prev_shift[i]) - (stage[i] - prev_base[i])) / eps;
                }
                quarterly[q] = if dist.space == *space {
                    dist.average(&field)?
                } else {
                    let fine = model.interpolate_value(&field, &dist.space)?;
                    dist.average(&fine)?
                };
                prev_base.copy_from_slice(stage);
                prev_shift.copy_from_slice(&shifted);
            }
            let annual = quarterly.iter().sum();
            records.push(MpcRecord {
                shock: shock.clone(),
                quarterly,
                annual,
            });
        }
        Ok(MpcTable { records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::hjb::HjbSolver;
    use crate::grid::AssetGrid;
    use crate::income::IncomeProcess;
    use crate::params::ModelParams;

    fn uniform_distribution(space: &StateSpace) -> StationaryDistribution {
        let w = space.state_weights();
        let total: f64 = w.iter().sum();
        StationaryDistribution {
            g: vec![1.0 / total; space.n_states()],
            space: space.clone(),
            iterations: 1,
            distance: 0.0,
        }
    }

    fn patient_one_asset() -> TwoAssetModel {
        let space = StateSpace::new(
            AssetGrid::uniform(6, 0.0, 20.0).unwrap(),
            AssetGrid::singleton(0.0).unwrap(),
            1,
            1,
        )
        .unwrap();
        let income = IncomeProcess::new(vec![1.0], nalgebra::DMatrix::zeros(1, 1)).unwrap();
        let params = ModelParams::builder()
            .discount_rate(0.05)
            .liquid_return(0.05)
            .illiquid_return(0.0)
            .build()
            .unwrap();
        TwoAssetModel::new(space, income, params).unwrap()
    }

    #[test]
    fn patient_household_consumes_the_annuity_of_the_windfall() {
        let model = patient_one_asset();
        let solution = HjbSolver::new().solve(&model).unwrap();
        let dist = uniform_distribution(model.space());
        let table = FeynmanKacMpc::new()
            .with_shock("transfer", 0.1)
            .compute(&model, &solution, &dist)
            .unwrap();
        let record = table.get("transfer").unwrap();
        // c = y + r b, so a windfall raises consumption by its annuity value
        for q in record.quarterly {
            assert!((q - 0.25 * 0.05).abs() < 1e-5, "quarterly {q}");
        }
        assert!((record.annual - 0.05).abs() < 4e-5);
    }

    #[test]
    fn constrained_households_respond_early() {
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
        let dist = crate::engines::kfe::KfeSolver::new()
            .with_mode(crate::core::KfeMode::Direct)
            .solve(&model, &solution)
            .unwrap();
        let table = FeynmanKacMpc::new()
            .with_step(0.05)
            .with_shock("small", 0.05)
            .compute(&model, &solution, &dist)
            .unwrap();
        let record = table.get("small").unwrap();
        assert!(record.annual > 0.2 && record.annual < 1.1, "annual {}", record.annual);
        assert!(record.quarterly[0] > record.quarterly[3]);
        assert!((record.annual - record.quarterly.iter().sum::<f64>()).abs() < 1e-12);
    }

    #[test]
    fn shift_reproduces_a_linear_field_in_both_tails() {
        let space = StateSpace::new(
            AssetGrid::uniform(3, 0.0, 2.0).unwrap(),
            AssetGrid::singleton(0.0).unwrap(),
            1,
            1,
        )
        .unwrap();
        let field: Vec<f64> = (0..3).map(|ib| space.liquid.node(ib)).collect();
        for eps in [0.5, -0.5] {
            let shifted = shift_along_liquid(&space, &field, eps);
            for ib in 0..3 {
                let expected = space.liquid.node(ib) + eps;
                assert!((shifted[ib] - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn rejects_misaligned_steps_and_empty_shocks() {
        let model = patient_one_asset();
        let solution = HjbSolver::new().solve(&model).unwrap();
        let dist = uniform_distribution(model.space());
        let misaligned = FeynmanKacMpc::new()
            .with_step(0.3)
            .with_shock("transfer", 0.1)
            .compute(&model, &solution, &dist);
        assert!(matches!(misaligned, Err(SolveError::InvalidInput(_))));
        let empty = FeynmanKacMpc::new().compute(&model, &solution, &dist);
        assert!(matches!(empty, Err(SolveError::InvalidInput(_))));
        let zero = FeynmanKacMpc::new()
            .with_shock("null", 0.0)
            .compute(&model, &solution, &dist);
        assert!(matches!(zero, Err(SolveError::InvalidInput(_))));
    }
}
