//! Module `model`.
//!
//! The household problem: validated combination of state space, income
//! process, and structural parameters, plus the policy and transition
//! machinery the solvers drive.

pub mod policy;
pub mod preferences;
pub mod transition;

use crate::core::{LaborSupply, Preference, SolveError};
use crate::grid::StateSpace;
use crate::income::IncomeProcess;
use crate::math::newton_raphson;
use crate::params::ModelParams;

pub use policy::{PolicyBundle, PolicyEngine};
pub use transition::{RiskCorrection, TransitionBuilder, TransitionOperator};

const ZERO_DRIFT_TOL: f64 = 1e-12;
const ZERO_DRIFT_MAX_ITER: usize = 100;

/// Policy-implied deterministic drift of each asset, flattened per state.
#[derive(Debug, Clone, PartialEq)]
pub struct DriftFields {
    /// Liquid drift net of deposits and transaction costs.
    pub liquid: Vec<f64>,
    /// Illiquid drift `ra * a + d`.
    pub illiquid: Vec<f64>,
}

/// A validated two-asset household model.
#[derive(Debug, Clone)]
pub struct TwoAssetModel {
    space: StateSpace,
    income: IncomeProcess,
    params: ModelParams,
}

impl TwoAssetModel {
    pub fn new(
        space: StateSpace,
        income: IncomeProcess,
        params: ModelParams,
    ) -> Result<Self, SolveError> {
        params.validate()?;
        if space.n_types != params.n_types() {
            return Err(SolveError::InvalidInput(format!(
                "state space has {} preference types but params define {}",
                space.n_types,
                params.n_types()
            )));
        }
        if space.n_income != income.n_states() {
            return Err(SolveError::InvalidInput(format!(
                "state space has {} income states but the process defines {}",
                space.n_income,
                income.n_states()
            )));
        }
        if space.illiquid.min() < 0.0 {
            return Err(SolveError::InvalidInput(
                "illiquid holdings cannot be negative".to_string(),
            ));
        }
        if params.return_vol > 0.0 && space.na() < 3 {
            return Err(SolveError::InvalidInput(
                "return diffusion needs at least three illiquid grid nodes".to_string(),
            ));
        }
        let model = Self {
            space,
            income,
            params,
        };
        if !model.params.labor.is_endogenous() {
            // The zero-drift fallback consumes the full inflow, which must
            // stay positive everywhere for utility to be defined.
            for iy in 0..model.space.n_income {
                let worst = model.liquid_inflow(0, iy, 1.0);
                if worst <= 0.0 {
                    return Err(SolveError::InvalidInput(format!(
                        "liquid inflow at the borrowing limit is {worst:.4} for income state \
                         {iy}; raise the transfer or tighten the limit"
                    )));
                }
            }
        }
        Ok(model)
    }

    #[inline]
    pub fn space(&self) -> &StateSpace {
        &self.space
    }

    #[inline]
    pub fn income(&self) -> &IncomeProcess {
        &self.income
    }

    #[inline]
    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Discount rate of preference type `iz`.
    #[inline]
    pub fn discount_rate(&self, iz: usize) -> f64 {
        self.params.discount_rates[iz]
    }

    /// Return diffusion switched on (positive volatility on a real grid).
    #[inline]
    pub fn diffusion_active(&self) -> bool {
        self.params.return_vol > 0.0 && self.space.na() >= 3
    }

    /// Liquid resource inflow at node `ib`, income state `iy`, and hours
    /// worked (`1.0` under exogenous labor).
    pub fn liquid_inflow(&self, ib: usize, iy: usize, hours: f64) -> f64 {
        let b = self.space.liquid.node(ib);
        self.params.wage * self.income.level(iy) * hours
            + self.params.liquid_return_at(b) * b
            + self.params.transfer
    }

    /// Consumption with zero liquid drift and zero deposits. Under
    /// endogenous labor this solves the intratemporal fixed point
    /// `c = wage*y*l(c) + rb(b)*b + transfer` with
    /// `l(c) = (wage*y*c^-gamma / disutility)^frisch`.
    pub fn zero_drift_consumption(&self, ib: usize, iy: usize) -> Result<(f64, f64), SolveError> {
        match self.params.labor {
            LaborSupply::Exogenous => Ok((self.liquid_inflow(ib, iy, 1.0), 1.0)),
            LaborSupply::Endogenous { frisch, disutility } => {
                let gamma = match self.params.preference {
                    Preference::Crra { gamma } => gamma,
                    // rejected at validation
                    Preference::Sdu { .. } => {
                        return Err(SolveError::InvalidInput(
                            "endogenous labor requires CRRA preferences".to_string(),
                        ));
                    }
                };
                let earnings = self.params.wage * self.income.level(iy);
                let b = self.space.liquid.node(ib);
                let other = self.params.liquid_return_at(b) * b + self.params.transfer;
                let hours_at = |c: f64| {
                    preferences::labor_from_marginal(
                        earnings * preferences::crra_marginal(c, gamma),
                        frisch,
                        disutility,
                    )
                };
                let f = |c: f64| c - earnings * hours_at(c) - other;
                let df = |c: f64| 1.0 + earnings * gamma * frisch * hours_at(c) / c;
                let guess = (earnings + other).max(0.1 * earnings);
                let c = newton_raphson(f, df, guess, ZERO_DRIFT_TOL, ZERO_DRIFT_MAX_ITER)?;
                if !(c > 0.0) {
                    return Err(SolveError::NumericalError(format!(
                        "zero-drift consumption is non-positive at node {ib}, income {iy}"
                    )));
                }
                Ok((c, hours_at(c)))
            }
        }
    }

    /// Stationary-consumption initial guess for the value function.
    pub fn initial_value(&self) -> Result<Vec<f64>, SolveError> {
        let n = self.space.n_states();
        let mut value = vec![0.0; n];
        for iy in 0..self.space.n_income {
            for iz in 0..self.space.n_types {
                let effective_rho = self.discount_rate(iz) + self.params.death_rate;
                for ib in 0..self.space.nb() {
                    let (c0, _) = self.zero_drift_consumption(ib, iy)?;
                    let v = preferences::stationary_value(c0, self.params.preference, effective_rho);
                    for ia in 0..self.space.na() {
                        value[self.space.flatten(ib, ia, iz, iy)] = v;
                    }
                }
            }
        }
        Ok(value)
    }

    /// Deterministic drift fields implied by a policy bundle.
    pub fn asset_drifts(&self, policies: &PolicyBundle) -> DriftFields {
        let n = self.space.n_states();
        let mut liquid = vec![0.0; n];
        let mut illiquid = vec![0.0; n];
        for idx in 0..n {
            let (_, ia, _, _) = self.space.unflatten(idx);
            let a = self.space.illiquid.node(ia);
            let d = policies.d[idx];
            liquid[idx] = policies.s[idx] - d - self.params.adjustment.cost(d, a);
            illiquid[idx] = self.params.illiquid_return * a + d;
        }
        DriftFields { liquid, illiquid }
    }

    /// Grid cell receiving the estates of the dying, when settlement targets
    /// a fixed cell (`None` for proportional redistribution).
    pub fn settlement_cell(&self) -> Option<(usize, usize)> {
        let s = &self.params.settlement;
        if s.bequests {
            Some((
                self.space.liquid.nearest_index(s.bequest_liquid),
                self.space.illiquid.nearest_index(s.bequest_illiquid),
            ))
        } else if s.rebirth_at_zero {
            Some((
                self.space.liquid.nearest_index(0.0),
                self.space.illiquid.nearest_index(0.0),
            ))
        } else {
            None
        }
    }

    /// Re-interpolates a converged value function onto a refined asset grid
    /// (bilinear per type/income pair), for distribution-stage resolution.
    pub fn interpolate_value(
        &self,
        value: &[f64],
        fine: &StateSpace,
    ) -> Result<Vec<f64>, SolveError> {
        if fine.n_types != self.space.n_types || fine.n_income != self.space.n_income {
            return Err(SolveError::InvalidInput(
                "refined state space must keep the type and income dimensions".to_string(),
            ));
        }
        if value.len() != self.space.n_states() {
            return Err(SolveError::InvalidInput(
                "value length does not match the coarse state space".to_string(),
            ));
        }
        let mut out = vec![0.0; fine.n_states()];
        for iy in 0..fine.n_income {
            for iz in 0..fine.n_types {
                for ia in 0..fine.na() {
                    let (ja, ta) = self.space.illiquid.locate(fine.illiquid.node(ia));
                    let ja_hi = (ja + 1).min(self.space.na() - 1);
                    for ib in 0..fine.nb() {
                        let (jb, tb) = self.space.liquid.locate(fine.liquid.node(ib));
                        let jb_hi = (jb + 1).min(self.space.nb() - 1);
                        let v00 = value[self.space.flatten(jb, ja, iz, iy)];
                        let v10 = value[self.space.flatten(jb_hi, ja, iz, iy)];
                        let v01 = value[self.space.flatten(jb, ja_hi, iz, iy)];
                        let v11 = value[self.space.flatten(jb_hi, ja_hi, iz, iy)];
                        let low = v00.mul_add(1.0 - tb, v10 * tb);
                        let high = v01.mul_add(1.0 - tb, v11 * tb);
                        out[fine.flatten(ib, ia, iz, iy)] = low.mul_add(1.0 - ta, high * ta);
                    }
                }
            }
        }
        Ok(out)
    }
}
