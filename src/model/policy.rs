//! Module `model::policy`.
//!
//! One sweep of the upwind policy update: consumption/saving from the liquid
//! derivative pair, then deposits from the liquid/illiquid pairs. Regime
//! selection follows the usual upwind discipline: a candidate is admissible
//! only if its implied drift points in the direction of the derivative it was
//! built from, ties are resolved by Hamiltonian comparison with a fixed
//! priority order, and the chosen indicators must partition every state
//! exactly once. A partition failure is a logic defect and aborts the solve.

use serde::{Deserialize, Serialize};

use crate::core::{LaborSupply, Preference, SolveError};
use crate::model::preferences::{
    crra_inverse_marginal, crra_marginal, crra_utility, labor_disutility, labor_from_marginal,
    sdu_aggregator, sdu_consumption,
};
use crate::model::TwoAssetModel;

/// Default floor for one-sided value derivatives.
pub const DERIVATIVE_FLOOR: f64 = 1e-8;

/// Household controls and flow utility at every state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyBundle {
    /// Consumption.
    pub c: Vec<f64>,
    /// Net liquid saving before deposits and transaction costs.
    pub s: Vec<f64>,
    /// Deposit rate into the illiquid account (negative for withdrawals).
    pub d: Vec<f64>,
    /// Flow utility at the chosen controls (aggregator value under
    /// recursive preferences).
    pub u: Vec<f64>,
}

impl PolicyBundle {
    pub fn zeros(n: usize) -> Self {
        Self {
            c: vec![0.0; n],
            s: vec![0.0; n],
            d: vec![0.0; n],
            u: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.c.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c.is_empty()
    }
}

/// Stateless policy-update engine; one instance per solve.
#[derive(Debug, Clone, Copy)]
pub struct PolicyEngine {
    derivative_floor: f64,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            derivative_floor: DERIVATIVE_FLOOR,
        }
    }
}

struct Candidate {
    valid: bool,
    hamiltonian: f64,
    deposit: f64,
}

impl Candidate {
    const INVALID: Self = Self {
        valid: false,
        hamiltonian: f64::NEG_INFINITY,
        deposit: 0.0,
    };
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_derivative_floor(mut self, floor: f64) -> Self {
        self.derivative_floor = floor;
        self
    }

    /// Computes the policy bundle implied by `value`.
    pub fn update(
        &self,
        model: &TwoAssetModel,
        value: &[f64],
    ) -> Result<PolicyBundle, SolveError> {
        let space = model.space();
        let n = space.n_states();
        if value.len() != n {
            return Err(SolveError::InvalidInput(format!(
                "value has {} entries for {} states",
                value.len(),
                n
            )));
        }
        let params = model.params();
        let (nb, na) = (space.nb(), space.na());
        let floor = self.derivative_floor;

        // Zero-drift consumption and hours, shared by every (type, illiquid)
        // slice of a given (liquid, income) pair.
        let mut zero_drift = Vec::with_capacity(nb * space.n_income);
        for iy in 0..space.n_income {
            for ib in 0..nb {
                zero_drift.push(model.zero_drift_consumption(ib, iy)?);
            }
        }

        let mut bundle = PolicyBundle::zeros(n);

        for iy in 0..space.n_income {
            let y = model.income().level(iy);
            for iz in 0..space.n_types {
                let rho_z = model.discount_rate(iz);
                for ia in 0..na {
                    let a = space.illiquid.node(ia);
                    for ib in 0..nb {
                        let idx = space.flatten(ib, ia, iz, iy);
                        let v = value[idx];
                        let (c0, h0) = zero_drift[iy * nb + ib];

                        let flow = |c: f64, hours: f64| -> f64 {
                            match params.preference {
                                Preference::Crra { gamma } => {
                                    let base = crra_utility(c, gamma);
                                    match params.labor {
                                        LaborSupply::Exogenous => base,
                                        LaborSupply::Endogenous { frisch, disutility } => {
                                            base - labor_disutility(hours, frisch, disutility)
                                        }
                                    }
                                }
                                Preference::Sdu { risk_aversion } => {
                                    sdu_aggregator(c, v, rho_z, risk_aversion)
                                }
                            }
                        };
                        let invert = |vb: f64| -> f64 {
                            match params.preference {
                                Preference::Crra { gamma } => crra_inverse_marginal(vb, gamma),
                                Preference::Sdu { risk_aversion } => {
                                    sdu_consumption(vb, v, rho_z, risk_aversion)
                                }
                            }
                        };
                        let hours_at = |vb: f64| -> f64 {
                            match params.labor {
                                LaborSupply::Exogenous => 1.0,
                                LaborSupply::Endogenous { frisch, disutility } => {
                                    labor_from_marginal(
                                        params.wage * y * vb,
                                        frisch,
                                        disutility,
                                    )
                                }
                            }
                        };
                        // Marginal utility pinned at the liquid lower bound:
                        // the state-constraint boundary condition.
                        let pinned_vb = match params.preference {
                            Preference::Crra { gamma } => crra_marginal(c0, gamma),
                            Preference::Sdu { risk_aversion } => {
                                rho_z * ((1.0 - risk_aversion) * v).max(1e-12) / c0
                            }
                        };

                        let vbf = if ib + 1 < nb {
                            ((value[idx + 1] - v) / space.liquid.forward_spacing(ib)).max(floor)
                        } else {
                            floor
                        };
                        let vbb = if ib > 0 {
                            ((v - value[idx - 1]) / space.liquid.backward_spacing(ib)).max(floor)
                        } else {
                            pinned_vb.max(floor)
                        };

                        // --- consumption/saving upwind ---
                        let (c_f, h_f) = {
                            let hours = hours_at(vbf);
                            (invert(vbf), hours)
                        };
                        let s_f = model.liquid_inflow(ib, iy, h_f) - c_f;
                        let valid_f = ib + 1 < nb && c_f > 0.0 && s_f > 0.0;
                        let h_ham_f = if valid_f {
                            flow(c_f, h_f) + vbf * s_f
                        } else {
                            f64::NEG_INFINITY
                        };

                        let (c_b, h_b, s_b, valid_b) = if ib > 0 {
                            let hours = hours_at(vbb);
                            let c = invert(vbb);
                            let s = model.liquid_inflow(ib, iy, hours) - c;
                            (c, hours, s, c > 0.0 && s < 0.0)
                        } else {
                            // pinned: consuming the full inflow, zero drift
                            (c0, h0, 0.0, false)
                        };
                        let h_ham_b = if valid_b {
                            flow(c_b, h_b) + vbb * s_b
                        } else {
                            f64::NEG_INFINITY
                        };

                        let valid_0 = c0 > 0.0;
                        let h_ham_0 = if valid_0 {
                            flow(c0, h0)
                        } else {
                            f64::NEG_INFINITY
                        };

                        let take_f = valid_f
                            && (!valid_b || h_ham_f >= h_ham_b)
                            && (!valid_0 || h_ham_f >= h_ham_0);
                        let take_b = valid_b
                            && (!valid_f || h_ham_b > h_ham_f)
                            && (!valid_0 || h_ham_b >= h_ham_0);
                        let take_0 = !take_f && !take_b;
                        let picked = usize::from(take_f) + usize::from(take_b) + usize::from(take_0);
                        if picked != 1 {
                            return Err(SolveError::InvariantViolation(format!(
                                "consumption regimes selected {picked} times at state \
                                 (b {ib}, a {ia}, z {iz}, y {iy})"
                            )));
                        }

                        let (mut c, mut s, hours) = if take_f {
                            (c_f, s_f, h_f)
                        } else if take_b {
                            (c_b, s_b, h_b)
                        } else {
                            (c0, 0.0, h0)
                        };

                        // --- deposit upwind (skipped for a degenerate
                        // illiquid dimension) ---
                        let mut deposit = 0.0;
                        if na > 1 {
                            let vaf = if ia + 1 < na {
                                ((value[idx + nb] - v) / space.illiquid.forward_spacing(ia))
                                    .max(floor)
                            } else {
                                floor
                            };
                            let vab = if ia > 0 {
                                ((v - value[idx - nb]) / space.illiquid.backward_spacing(ia))
                                    .max(floor)
                            } else {
                                floor
                            };
                            let adj = &params.adjustment;
                            let gate = |va: f64, vb: f64, d: f64| -> f64 {
                                va * d - vb * (d + adj.cost(d, a))
                            };

                            let fb = if ia + 1 < na {
                                let d = adj.first_order_deposit(vaf / vbb, a);
                                let h = gate(vaf, vbb, d);
                                Candidate {
                                    valid: d > 0.0 && h > 0.0,
                                    hamiltonian: h,
                                    deposit: d,
                                }
                            } else {
                                Candidate::INVALID
                            };
                            let bf = if ia > 0 {
                                let d = adj.first_order_deposit(vab / vbf, a);
                                let h = gate(vab, vbf, d);
                                Candidate {
                                    valid: d <= -adj.cost(d, a) && h > 0.0,
                                    hamiltonian: h,
                                    deposit: d,
                                }
                            } else {
                                Candidate::INVALID
                            };
                            let bb = if ia > 0 && ib > 0 {
                                let d = adj.first_order_deposit(vab / vbb, a);
                                let h = gate(vab, vbb, d);
                                Candidate {
                                    valid: -adj.cost(d, a) < d && d <= 0.0 && h > 0.0,
                                    hamiltonian: h,
                                    deposit: d,
                                }
                            } else {
                                Candidate::INVALID
                            };
                            // Withdrawals consumed on the spot at the liquid
                            // lower bound; only competes when the consumption
                            // scheme picked the zero-drift regime.
                            let bx = if params.boundary_withdrawal && ib == 0 && ia > 0 && take_0
                            {
                                match boundary_withdrawal_candidate(model, vab, a, c0) {
                                    Some((d, c_x)) => {
                                        let h = gate(vab, pinned_vb.max(floor), d);
                                        Candidate {
                                            valid: d <= -adj.cost(d, a) && h > 0.0 && c_x > 0.0,
                                            hamiltonian: h,
                                            deposit: d,
                                        }
                                    }
                                    None => Candidate::INVALID,
                                }
                            } else {
                                Candidate::INVALID
                            };

                            let beats = |lhs: &Candidate, rhs: &Candidate| -> bool {
                                !rhs.valid || lhs.hamiltonian >= rhs.hamiltonian
                            };
                            let strictly_beats = |lhs: &Candidate, rhs: &Candidate| -> bool {
                                !rhs.valid || lhs.hamiltonian > rhs.hamiltonian
                            };

                            let take_fb =
                                fb.valid && beats(&fb, &bf) && beats(&fb, &bb) && beats(&fb, &bx);
                            let take_bf = bf.valid
                                && strictly_beats(&bf, &fb)
                                && beats(&bf, &bb)
                                && beats(&bf, &bx);
                            let take_bb = bb.valid
                                && strictly_beats(&bb, &fb)
                                && strictly_beats(&bb, &bf)
                                && beats(&bb, &bx);
                            let take_bx = bx.valid
                                && strictly_beats(&bx, &fb)
                                && strictly_beats(&bx, &bf)
                                && strictly_beats(&bx, &bb);
                            let take_none = !fb.valid && !bf.valid && !bb.valid && !bx.valid;

                            let picked = usize::from(take_fb)
                                + usize::from(take_bf)
                                + usize::from(take_bb)
                                + usize::from(take_bx)
                                + usize::from(take_none);
                            if picked != 1 {
                                return Err(SolveError::InvariantViolation(format!(
                                    "deposit regimes selected {picked} times at state \
                                     (b {ib}, a {ia}, z {iz}, y {iy})"
                                )));
                            }

                            deposit = if take_fb {
                                fb.deposit
                            } else if take_bf {
                                bf.deposit
                            } else if take_bb {
                                bb.deposit
                            } else if take_bx {
                                bx.deposit
                            } else {
                                0.0
                            };
                            if take_bx {
                                // withdrawal proceeds net of cost are eaten,
                                // keeping the liquid drift at zero
                                c = c0 - deposit - adj.cost(deposit, a);
                                s = model.liquid_inflow(ib, iy, h0) - c;
                            }
                        }

                        bundle.c[idx] = c;
                        bundle.s[idx] = s;
                        bundle.d[idx] = deposit;
                        bundle.u[idx] = flow(c, hours);
                    }
                }
            }
        }
        Ok(bundle)
    }
}

/// Joint consumption/withdrawal at the liquid lower bound: fixed point of
/// `d = foc(va / u'(c))`, `c = c0 - d - cost(d)`. CRRA only.
fn boundary_withdrawal_candidate(
    model: &TwoAssetModel,
    vab: f64,
    a: f64,
    c0: f64,
) -> Option<(f64, f64)> {
    let params = model.params();
    let gamma = match params.preference {
        crate::core::Preference::Crra { gamma } => gamma,
        crate::core::Preference::Sdu { .. } => return None,
    };
    let adj = &params.adjustment;
    let mut c = c0;
    for _ in 0..50 {
        let d = adj.first_order_deposit(vab / crra_marginal(c, gamma), a);
        if d >= 0.0 {
            return None;
        }
        let c_next = c0 - d - adj.cost(d, a);
        if (c_next - c).abs() < 1e-10 {
            return Some((d, c_next));
        }
        c = 0.5 * (c + c_next);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{AssetGrid, StateSpace};
    use crate::income::IncomeProcess;
    use crate::params::ModelParams;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn test_model() -> TwoAssetModel {
        let space = StateSpace::new(
            AssetGrid::power_spaced(8, 0.0, 30.0, 1.6).unwrap(),
            AssetGrid::power_spaced(6, 0.0, 40.0, 1.6).unwrap(),
            1,
            2,
        )
        .unwrap();
        let income = IncomeProcess::two_state(0.8, 1.3, 0.25, 0.25).unwrap();
        TwoAssetModel::new(space, income, ModelParams::default()).unwrap()
    }

    #[test]
    fn partition_holds_for_random_value_functions() {
        let model = test_model();
        let engine = PolicyEngine::new();
        let n = model.space().n_states();
        let mut rng = StdRng::seed_from_u64(2024);
        for _ in 0..64 {
            let value: Vec<f64> = (0..n).map(|_| 10.0 * rng.random::<f64>() - 5.0).collect();
            let bundle = engine.update(&model, &value).unwrap();
            assert!(bundle.c.iter().all(|&c| c > 0.0));
            assert!(bundle.c.iter().all(|&c| c.is_finite()));
        }
    }

    #[test]
    fn partition_holds_under_recursive_preferences() {
        let space = StateSpace::new(
            AssetGrid::power_spaced(8, 0.0, 30.0, 1.6).unwrap(),
            AssetGrid::power_spaced(6, 0.0, 40.0, 1.6).unwrap(),
            1,
            2,
        )
        .unwrap();
        let income = IncomeProcess::two_state(0.8, 1.3, 0.25, 0.25).unwrap();
        let params = ModelParams::builder()
            .preference(crate::core::Preference::Sdu { risk_aversion: 3.0 })
            .build()
            .unwrap();
        let model = TwoAssetModel::new(space, income, params).unwrap();
        let engine = PolicyEngine::new();
        let n = model.space().n_states();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..64 {
            // negative values keep (1 - ra) V positive for ra > 1
            let value: Vec<f64> = (0..n).map(|_| -3.0 * rng.random::<f64>() - 0.1).collect();
            let bundle = engine.update(&model, &value).unwrap();
            assert!(bundle.c.iter().all(|&c| c > 0.0 && c.is_finite()));
        }
    }

    #[test]
    fn steep_illiquid_gradient_triggers_deposits() {
        let model = test_model();
        let engine = PolicyEngine::new();
        let space = model.space();
        let mut value = vec![0.0; space.n_states()];
        // value strongly increasing in a, gently in b
        for idx in 0..space.n_states() {
            let (ib, ia, _, _) = space.unflatten(idx);
            value[idx] = 5.0 * space.illiquid.node(ia).sqrt() + 0.05 * space.liquid.node(ib);
        }
        let bundle = engine.update(&model, &value).unwrap();
        assert!(bundle.d.iter().any(|&d| d > 0.0));
    }

    #[test]
    fn steep_liquid_gradient_triggers_withdrawals() {
        let model = test_model();
        let engine = PolicyEngine::new();
        let space = model.space();
        let mut value = vec![0.0; space.n_states()];
        for idx in 0..space.n_states() {
            let (ib, ia, _, _) = space.unflatten(idx);
            value[idx] =
                5.0 * (space.liquid.node(ib) + 1.0).sqrt() + 0.02 * space.illiquid.node(ia);
        }
        let bundle = engine.update(&model, &value).unwrap();
        assert!(bundle.d.iter().any(|&d| d < 0.0));
    }

    #[test]
    fn degenerate_illiquid_grid_disables_deposits() {
        let space = StateSpace::new(
            AssetGrid::uniform(6, 0.0, 20.0).unwrap(),
            AssetGrid::singleton(0.0).unwrap(),
            1,
            1,
        )
        .unwrap();
        let income = IncomeProcess::new(vec![1.0], nalgebra::DMatrix::zeros(1, 1)).unwrap();
        let model = TwoAssetModel::new(space, income, ModelParams::default()).unwrap();
        let value = model.initial_value().unwrap();
        let bundle = PolicyEngine::new().update(&model, &value).unwrap();
        assert!(bundle.d.iter().all(|&d| d == 0.0));
    }

    #[test]
    fn bottom_liquid_row_never_saves_backward() {
        let model = test_model();
        let engine = PolicyEngine::new();
        let value = model.initial_value().unwrap();
        let bundle = engine.update(&model, &value).unwrap();
        let space = model.space();
        for iy in 0..space.n_income {
            for ia in 0..space.na() {
                let idx = space.flatten(0, ia, 0, iy);
                // liquid drift net of costs cannot point below the limit
                let drift =
                    bundle.s[idx] - bundle.d[idx] - model.params().adjustment.cost(bundle.d[idx], space.illiquid.node(ia));
                assert!(drift >= -1e-12, "state {idx} drifts below the liquid limit");
            }
        }
    }
}
