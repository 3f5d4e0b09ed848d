//! Module `model::transition`.
//!
//! Assembles the sparse generator of the controlled asset process. Drifts are
//! upwinded into the band structure (liquid neighbors at offsets -1/+1,
//! illiquid neighbors at -nb/+nb); flux that would leave the grid is dropped
//! together with its diagonal share, so every row sums to zero exactly and
//! the distribution solvers conserve mass without correction terms. The
//! income dimension is coupled by direct sum in the solvers, never here.

use crate::core::{Preference, SolveError};
use crate::math::banded::BandedMatrix;
use crate::model::preferences::sdu_penalty_drift;
use crate::model::{DriftFields, TwoAssetModel};

/// Sparse asset-transition generator over the flattened state space.
pub type TransitionOperator = BandedMatrix;

/// Variance-penalty data produced under recursive preferences with return
/// diffusion: a right-hand-side term for states with no first-order illiquid
/// drift, plus the flags marking them.
#[derive(Debug, Clone, PartialEq)]
pub struct RiskCorrection {
    /// Penalty value to add to the HJB right-hand side at flagged states.
    pub rhs: Vec<f64>,
    /// States whose penalty could not be upwinded into the generator.
    pub stationary: Vec<bool>,
}

const DRIFT_TOL: f64 = 1e-14;

/// Builds [`TransitionOperator`]s for one model.
#[derive(Debug, Clone, Copy)]
pub struct TransitionBuilder<'a> {
    model: &'a TwoAssetModel,
}

impl<'a> TransitionBuilder<'a> {
    pub fn new(model: &'a TwoAssetModel) -> Self {
        Self { model }
    }

    /// Assembles the generator for the given drift fields. `value` is
    /// required exactly when the model combines recursive preferences with
    /// return diffusion; the variance penalty then either becomes extra
    /// upwinded drift or, at states with no first-order illiquid drift, a
    /// right-hand-side entry.
    pub fn build(
        &self,
        drifts: &DriftFields,
        value: Option<&[f64]>,
    ) -> Result<(TransitionOperator, Option<RiskCorrection>), SolveError> {
        let space = self.model.space();
        let n = space.n_states();
        if drifts.liquid.len() != n || drifts.illiquid.len() != n {
            return Err(SolveError::InvalidInput(
                "drift fields do not match the state space".to_string(),
            ));
        }
        let (nb, na) = (space.nb(), space.na());
        let stride = space.illiquid_stride() as isize;
        let mut op = BandedMatrix::zeros(n, vec![-stride, -1, 0, 1, stride]);
        // offsets are sorted ascending: [-nb, -1, 0, 1, nb]
        let (low_a, low_b, diag, up_b, up_a) = (0, 1, 2, 3, 4);

        let needs_penalty =
            self.model.params().preference.is_recursive() && self.model.diffusion_active();
        let value = match (needs_penalty, value) {
            (true, None) => {
                return Err(SolveError::InvalidInput(
                    "the variance penalty requires the current value function".to_string(),
                ));
            }
            (true, Some(v)) if v.len() != n => {
                return Err(SolveError::InvalidInput(
                    "value length does not match the state space".to_string(),
                ));
            }
            (_, v) => v,
        };
        let mut correction = if needs_penalty {
            Some(RiskCorrection {
                rhs: vec![0.0; n],
                stationary: vec![false; n],
            })
        } else {
            None
        };

        let params = self.model.params();
        let sigma = params.return_vol;
        let diffusion_on = self.model.diffusion_active();

        for iy in 0..space.n_income {
            for iz in 0..space.n_types {
                for ia in 0..na {
                    let a = space.illiquid.node(ia);
                    let daf = space.illiquid.forward_spacing(ia);
                    let dab = space.illiquid.backward_spacing(ia);
                    for ib in 0..nb {
                        let idx = space.flatten(ib, ia, iz, iy);

                        // liquid drift
                        let drift_b = drifts.liquid[idx];
                        if drift_b > 0.0 && ib + 1 < nb {
                            let up = drift_b / space.liquid.forward_spacing(ib);
                            op.add_at(up_b, idx, up);
                            op.add_at(diag, idx, -up);
                        } else if drift_b < 0.0 && ib > 0 {
                            let low = -drift_b / space.liquid.backward_spacing(ib);
                            op.add_at(low_b, idx, low);
                            op.add_at(diag, idx, -low);
                        }

                        // first-order illiquid drift
                        let drift_a = drifts.illiquid[idx];
                        if drift_a > 0.0 && ia + 1 < na {
                            let up = drift_a / daf;
                            op.add_at(up_a, idx, up);
                            op.add_at(diag, idx, -up);
                        } else if drift_a < 0.0 && ia > 0 {
                            let low = -drift_a / dab;
                            op.add_at(low_a, idx, low);
                            op.add_at(diag, idx, -low);
                        }

                        // return diffusion, second order in a
                        if diffusion_on {
                            let variance = 0.5 * (sigma * a).powi(2);
                            if variance > 0.0 {
                                let span = dab + daf;
                                if ia > 0 {
                                    let low = 2.0 * variance / (dab * span);
                                    op.add_at(low_a, idx, low);
                                    op.add_at(diag, idx, -low);
                                }
                                if ia + 1 < na {
                                    let up = 2.0 * variance / (daf * span);
                                    op.add_at(up_a, idx, up);
                                    op.add_at(diag, idx, -up);
                                }
                            }
                        }

                        // variance penalty under recursive preferences
                        if let (Some(corr), Some(value)) = (correction.as_mut(), value) {
                            let risk_aversion = match params.preference {
                                Preference::Sdu { risk_aversion } => risk_aversion,
                                Preference::Crra { .. } => unreachable!(),
                            };
                            let diffusion = (sigma * a).powi(2);
                            if diffusion > 0.0 {
                                let v = value[idx];
                                let va_forward = if ia + 1 < na {
                                    Some((value[idx + nb] - v) / daf)
                                } else {
                                    None
                                };
                                let va_backward = if ia > 0 {
                                    Some((v - value[idx - nb]) / dab)
                                } else {
                                    None
                                };
                                if drift_a.abs() > DRIFT_TOL {
                                    let va = if drift_a > 0.0 {
                                        va_forward.or(va_backward)
                                    } else {
                                        va_backward.or(va_forward)
                                    }
                                    .unwrap_or(0.0);
                                    let mu = sdu_penalty_drift(va, v, risk_aversion, diffusion);
                                    if mu > 0.0 && ia + 1 < na {
                                        let up = mu / daf;
                                        op.add_at(up_a, idx, up);
                                        op.add_at(diag, idx, -up);
                                    } else if mu < 0.0 && ia > 0 {
                                        let low = -mu / dab;
                                        op.add_at(low_a, idx, low);
                                        op.add_at(diag, idx, -low);
                                    }
                                } else {
                                    // no first-order transport to ride on;
                                    // hand the whole penalty to the solver
                                    corr.stationary[idx] = true;
                                    let va = if ia > 0 && ia + 1 < na {
                                        (value[idx + nb] - value[idx - nb]) / (dab + daf)
                                    } else {
                                        va_backward.or(va_forward).unwrap_or(0.0)
                                    };
                                    corr.rhs[idx] =
                                        sdu_penalty_drift(va, v, risk_aversion, diffusion) * va;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok((op, correction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{AssetGrid, StateSpace};
    use crate::income::IncomeProcess;
    use crate::params::ModelParams;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn build_model(sigma: f64, preference: crate::core::Preference) -> TwoAssetModel {
        let space = StateSpace::new(
            AssetGrid::power_spaced(6, 0.0, 20.0, 1.5).unwrap(),
            AssetGrid::power_spaced(5, 0.0, 30.0, 1.5).unwrap(),
            1,
            2,
        )
        .unwrap();
        let income = IncomeProcess::two_state(0.8, 1.3, 0.25, 0.25).unwrap();
        let params = ModelParams::builder()
            .return_volatility(sigma)
            .preference(preference)
            .build()
            .unwrap();
        TwoAssetModel::new(space, income, params).unwrap()
    }

    fn random_drifts(n: usize, seed: u64) -> DriftFields {
        let mut rng = StdRng::seed_from_u64(seed);
        DriftFields {
            liquid: (0..n).map(|_| 4.0 * rng.random::<f64>() - 2.0).collect(),
            illiquid: (0..n).map(|_| 4.0 * rng.random::<f64>() - 2.0).collect(),
        }
    }

    fn assert_generator_invariants(op: &TransitionOperator) {
        let n = op.n();
        let diag = op.offset_index(0).unwrap();
        for k in 0..op.offsets().len() {
            if k == diag {
                continue;
            }
            assert!(
                op.band(k).iter().all(|&x| x >= 0.0),
                "negative off-diagonal in band {k}"
            );
        }
        for row in 0..n {
            assert!(
                op.row_sum(row).abs() < 1e-12,
                "row {row} sums to {}",
                op.row_sum(row)
            );
        }
    }

    #[test]
    fn random_drift_fields_yield_a_proper_generator() {
        let model = build_model(0.0, crate::core::Preference::Crra { gamma: 2.0 });
        let builder = TransitionBuilder::new(&model);
        for seed in 0..8 {
            let drifts = random_drifts(model.space().n_states(), seed);
            let (op, corr) = builder.build(&drifts, None).unwrap();
            assert!(corr.is_none());
            assert_generator_invariants(&op);
        }
    }

    #[test]
    fn diffusion_keeps_rows_conservative() {
        let model = build_model(0.2, crate::core::Preference::Crra { gamma: 2.0 });
        let builder = TransitionBuilder::new(&model);
        let drifts = random_drifts(model.space().n_states(), 42);
        let (op, _) = builder.build(&drifts, None).unwrap();
        assert_generator_invariants(&op);
    }

    #[test]
    fn variance_penalty_flags_states_without_transport() {
        let model = build_model(0.2, crate::core::Preference::Sdu { risk_aversion: 4.0 });
        let n = model.space().n_states();
        let drifts = DriftFields {
            liquid: vec![0.0; n],
            illiquid: vec![0.0; n],
        };
        let value: Vec<f64> = (0..n).map(|i| -1.0 - 0.01 * i as f64).collect();
        let builder = TransitionBuilder::new(&model);
        let (op, corr) = builder.build(&drifts, Some(&value)).unwrap();
        let corr = corr.unwrap();
        assert_generator_invariants(&op);
        // all states have zero first-order drift; those with positive a are flagged
        let space = model.space();
        for idx in 0..n {
            let (_, ia, _, _) = space.unflatten(idx);
            let active = space.illiquid.node(ia) > 0.0;
            assert_eq!(corr.stationary[idx], active);
            if active {
                assert!(corr.rhs[idx] <= 0.0);
            }
        }
    }

    #[test]
    fn penalty_requires_the_value_function() {
        let model = build_model(0.2, crate::core::Preference::Sdu { risk_aversion: 4.0 });
        let n = model.space().n_states();
        let drifts = DriftFields {
            liquid: vec![0.0; n],
            illiquid: vec![0.0; n],
        };
        let err = TransitionBuilder::new(&model).build(&drifts, None).unwrap_err();
        assert!(matches!(err, SolveError::InvalidInput(_)));
    }

    #[test]
    fn single_liquid_drift_places_one_band_entry() {
        let space = StateSpace::new(
            AssetGrid::uniform(3, 0.0, 2.0).unwrap(),
            AssetGrid::singleton(0.0).unwrap(),
            1,
            1,
        )
        .unwrap();
        let income = IncomeProcess::new(vec![1.0], nalgebra::DMatrix::zeros(1, 1)).unwrap();
        let model = TwoAssetModel::new(space, income, ModelParams::default()).unwrap();
        let drifts = DriftFields {
            liquid: vec![0.5, -0.5, 0.0],
            illiquid: vec![0.0; 3],
        };
        let (op, _) = TransitionBuilder::new(&model).build(&drifts, None).unwrap();
        // spacing is 1.0
        assert_relative_eq!(op.get(0, 1), 0.5);
        assert_relative_eq!(op.get(0, 0), -0.5);
        assert_relative_eq!(op.get(1, 0), 0.5);
        assert_relative_eq!(op.get(1, 1), -0.5);
        assert_relative_eq!(op.get(2, 2), 0.0);
        assert_generator_invariants(&op);
    }
}
