//! Module `engines::kfe`.
//!
//! Stationary distribution of the household state. The Kolmogorov forward
//! equation transposes the HJB generator, adds the transposed income coupling
//! and the death settlement flow, and looks for the mass vector the combined
//! operator leaves unchanged. Preference-type blocks never exchange mass, so
//! each solves separately and is pinned to its population share.
//!
//! Two strategies are available: a dense direct solve per type block with a
//! normalization row, and damped implicit sweeps that reuse one banded
//! factorization per income block. Both operate on trapezoid densities, so
//! conservation holds in the weighted sense.

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::core::{KfeMode, SolveError};
use crate::engines::hjb::HjbSolution;
use crate::grid::{AssetGrid, StateSpace};
use crate::math::banded::BandedLu;
use crate::math::sup_norm;
use crate::model::{PolicyEngine, TransitionBuilder, TransitionOperator, TwoAssetModel};

/// Tolerated round-off below zero before a density is declared invalid.
const NEGATIVE_DENSITY_TOL: f64 = 1e-10;

/// Stationary density over a state space, in trapezoid-density units.
#[derive(Debug, Clone)]
pub struct StationaryDistribution {
    /// Density at every flattened state.
    pub g: Vec<f64>,
    /// State space the density lives on (the model's, unless the solver ran
    /// on a refined grid).
    pub space: StateSpace,
    pub iterations: usize,
    pub distance: f64,
}

impl StationaryDistribution {
    /// Total mass, `sum_i g_i w_i`.
    pub fn mass(&self) -> f64 {
        let w = self.space.state_weights();
        self.g
            .iter()
            .zip(&w)
            .fold(0.0, |acc, (&g, &wi)| g.mul_add(wi, acc))
    }

    /// Aggregate liquid holdings.
    pub fn liquid_wealth(&self) -> f64 {
        let w = self.space.state_weights();
        let mut total = 0.0;
        for (idx, (&g, &wi)) in self.g.iter().zip(&w).enumerate() {
            let (ib, _, _, _) = self.space.unflatten(idx);
            total += g * wi * self.space.liquid.node(ib);
        }
        total
    }

    /// Aggregate illiquid holdings.
    pub fn illiquid_wealth(&self) -> f64 {
        let w = self.space.state_weights();
        let mut total = 0.0;
        for (idx, (&g, &wi)) in self.g.iter().zip(&w).enumerate() {
            let (_, ia, _, _) = self.space.unflatten(idx);
            total += g * wi * self.space.illiquid.node(ia);
        }
        total
    }

    /// Population average of a per-state field.
    pub fn average(&self, field: &[f64]) -> Result<f64, SolveError> {
        if field.len() != self.g.len() {
            return Err(SolveError::InvalidInput(format!(
                "field has {} entries for {} states",
                field.len(),
                self.g.len()
            )));
        }
        let w = self.space.state_weights();
        let mut total = 0.0;
        for ((&g, &wi), &f) in self.g.iter().zip(&w).zip(field) {
            total += g * wi * f;
        }
        Ok(total)
    }

    /// Mass held by one preference-type block.
    pub fn type_mass(&self, iz: usize) -> f64 {
        let w = self.space.state_weights();
        let mut total = 0.0;
        for (idx, (&g, &wi)) in self.g.iter().zip(&w).enumerate() {
            let (_, _, z, _) = self.space.unflatten(idx);
            if z == iz {
                total += g * wi;
            }
        }
        total
    }
}

/// Stationary KFE solver configuration.
#[derive(Debug, Clone)]
pub struct KfeSolver {
    mode: KfeMode,
    tolerance: f64,
    max_iterations: usize,
    divergence_threshold: f64,
    divergence_min_iterations: usize,
    grids: Option<(AssetGrid, AssetGrid)>,
}

impl Default for KfeSolver {
    fn default() -> Self {
        Self {
            mode: KfeMode::Iterative { delta: 10.0 },
            tolerance: 1e-8,
            max_iterations: 10_000,
            divergence_threshold: 1.0e8,
            divergence_min_iterations: 10,
            grids: None,
        }
    }
}

impl KfeSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: KfeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_divergence_guard(mut self, threshold: f64, min_iterations: usize) -> Self {
        self.divergence_threshold = threshold;
        self.divergence_min_iterations = min_iterations;
        self
    }

    /// Solves the distribution on refined asset grids instead of the grids
    /// the value function was computed on. Policies are rebuilt from the
    /// interpolated value, so kinks in the saving policy resolve at the
    /// finer resolution.
    pub fn with_grids(mut self, liquid: AssetGrid, illiquid: AssetGrid) -> Self {
        self.grids = Some((liquid, illiquid));
        self
    }

    fn validate(&self) -> Result<(), SolveError> {
        if !(self.tolerance > 0.0) || self.max_iterations == 0 {
            return Err(SolveError::InvalidInput(
                "tolerance must be positive and the iteration budget non-empty".to_string(),
            ));
        }
        if let KfeMode::Iterative { delta } = self.mode {
            if !(delta > 0.0) || !delta.is_finite() {
                return Err(SolveError::InvalidInput(
                    "iterative KFE step must be positive and finite".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Computes the stationary distribution implied by a converged value
    /// function.
    pub fn solve(
        &self,
        model: &TwoAssetModel,
        solution: &HjbSolution,
    ) -> Result<StationaryDistribution, SolveError> {
        self.validate()?;
        if solution.generator.n() != model.space().n_states() {
            return Err(SolveError::InvalidInput(
                "generator does not match the model's state space".to_string(),
            ));
        }
        match &self.grids {
            None => self.solve_on(model, &solution.generator),
            Some((liquid, illiquid)) => {
                let fine = StateSpace::new(
                    liquid.clone(),
                    illiquid.clone(),
                    model.space().n_types,
                    model.space().n_income,
                )?;
                let refined =
                    TwoAssetModel::new(fine.clone(), model.income().clone(), model.params().clone())?;
                let value = model.interpolate_value(&solution.value, &fine)?;
                let policies = PolicyEngine::new().update(&refined, &value)?;
                let drifts = refined.asset_drifts(&policies);
                let needs_value =
                    refined.params().preference.is_recursive() && refined.diffusion_active();
                let (generator, _) = TransitionBuilder::new(&refined)
                    .build(&drifts, needs_value.then_some(value.as_slice()))?;
                self.solve_on(&refined, &generator)
            }
        }
    }

    fn solve_on(
        &self,
        model: &TwoAssetModel,
        generator: &TransitionOperator,
    ) -> Result<StationaryDistribution, SolveError> {
        match self.mode {
            KfeMode::Direct => self.solve_direct(model, generator),
            KfeMode::Iterative { delta } => self.solve_iterative(model, generator, delta),
        }
    }

    /// Dense stationarity solve, one system per preference type. The first
    /// row of each system is replaced by a normalization constraint; the
    /// result is rescaled so every type block carries its population share.
    fn solve_direct(
        &self,
        model: &TwoAssetModel,
        generator: &TransitionOperator,
    ) -> Result<StationaryDistribution, SolveError> {
        let space = model.space();
        let (nb, na) = (space.nb(), space.na());
        let (nz, ny) = (space.n_types, space.n_income);
        let chunk = nb * na;
        let q = chunk * ny;
        let death = model.params().death_rate;
        let cell = model.settlement_cell();
        let death_active = death > 0.0 && cell.is_some();

        let mut g = vec![0.0; space.n_states()];
        for iz in 0..nz {
            // local layout within the type system: liquid fastest, then
            // illiquid, income chunks outermost
            let local = |ib: usize, ia: usize, iy: usize| ib + nb * ia + chunk * iy;
            let mut system = DMatrix::<f64>::zeros(q, q);

            // transposed asset transitions
            for (band, &offset) in generator.offsets().iter().enumerate() {
                let values = generator.band(band);
                for iy in 0..ny {
                    for ia in 0..na {
                        for ib in 0..nb {
                            let row = space.flatten(ib, ia, iz, iy);
                            let col = row as isize + offset;
                            if col < 0 || col as usize >= space.n_states() {
                                continue;
                            }
                            let val = values[row];
                            if val == 0.0 {
                                continue;
                            }
                            let (jb, ja, jz, jy) = space.unflatten(col as usize);
                            debug_assert!(jz == iz && jy == iy);
                            system[(local(jb, ja, jy), local(ib, ia, iy))] += val;
                        }
                    }
                }
            }

            // transposed income switching
            for j in 0..ny {
                for k in 0..ny {
                    let rate = model.income().rate(j, k);
                    if rate != 0.0 {
                        for l in 0..chunk {
                            system[(l + chunk * k, l + chunk * j)] += rate;
                        }
                    }
                }
            }

            // death outflow and settlement inflow, in density units
            if death_active {
                let (cb, ca) = match cell {
                    Some(c) => c,
                    None => unreachable!(),
                };
                let w_cell = space.liquid.weight(cb) * space.illiquid.weight(ca);
                for iy in 0..ny {
                    let target = local(cb, ca, iy);
                    for ia in 0..na {
                        for ib in 0..nb {
                            let source = local(ib, ia, iy);
                            let w = space.liquid.weight(ib) * space.illiquid.weight(ia);
                            system[(source, source)] -= death;
                            system[(target, source)] += death * w / w_cell;
                        }
                    }
                }
            }

            // the stationarity system is rank deficient by one; pin the
            // scale with a normalization row
            for col in 0..q {
                system[(0, col)] = 1.0;
            }
            let mut rhs = DVector::zeros(q);
            rhs[0] = 1.0;

            let solved = system.lu().solve(&rhs).ok_or_else(|| {
                SolveError::NumericalError(format!(
                    "stationary system for type {iz} is singular"
                ))
            })?;

            let mut block = vec![0.0; q];
            for (l, slot) in block.iter_mut().enumerate() {
                let v = solved[l];
                if v < -NEGATIVE_DENSITY_TOL {
                    return Err(SolveError::NumericalError(format!(
                        "stationary density is negative ({v:.3e}) for type {iz}"
                    )));
                }
                *slot = v.max(0.0);
            }
            rescale_block(space, model.params().type_shares[iz], &mut block)?;
            for iy in 0..ny {
                for ia in 0..na {
                    for ib in 0..nb {
                        g[space.flatten(ib, ia, iz, iy)] = block[local(ib, ia, iy)];
                    }
                }
            }
        }

        info!("stationary distribution solved directly ({nz} type systems of size {q})");
        Ok(StationaryDistribution {
            g,
            space: space.clone(),
            iterations: 1,
            distance: 0.0,
        })
    }

    /// Damped implicit sweeps: one banded factorization per income block,
    /// income and settlement inflows taken from the previous iterate,
    /// per-type renormalization after every sweep.
    fn solve_iterative(
        &self,
        model: &TwoAssetModel,
        generator: &TransitionOperator,
        delta: f64,
    ) -> Result<StationaryDistribution, SolveError> {
        let space = model.space();
        let n = space.n_states();
        let m = space.per_income();
        let (nz, ny) = (space.n_types, space.n_income);
        let chunk = space.nb() * space.na();
        let death = model.params().death_rate;
        let cell = model.settlement_cell();
        let death_active = death > 0.0 && cell.is_some();
        let weights = space.state_weights();

        let mut blocks = Vec::with_capacity(ny);
        for k in 0..ny {
            let mut block = generator.block(k * m, m).transpose();
            for band in 0..block.offsets().len() {
                for x in block.band_mut(band) {
                    *x *= -delta;
                }
            }
            let own_rate = model.income().rate(k, k);
            let extra = if death_active { death } else { 0.0 };
            let diag_idx = block.offset_index(0).ok_or_else(|| {
                SolveError::InvariantViolation("generator is missing its diagonal band".to_string())
            })?;
            for x in block.band_mut(diag_idx) {
                *x += 1.0 + delta * (extra - own_rate);
            }
            blocks.push(block);
        }
        let factors: Result<Vec<BandedLu>, SolveError> =
            blocks.iter().map(BandedLu::factor).collect();
        let factors = factors?;

        let mut g = vec![1.0; n];
        for iz in 0..nz {
            renormalize_type(space, model.params().type_shares[iz], iz, &mut g)?;
        }
        let mut next = vec![0.0; n];
        let mut iterations = 0;
        let mut distance = f64::INFINITY;

        for iteration in 1..=self.max_iterations {
            // settlement inflow per (type, income) chunk, in density units
            let mut inflow = vec![0.0; nz * ny];
            if death_active {
                for (idx, &gi) in g.iter().enumerate() {
                    let (_, _, iz, iy) = space.unflatten(idx);
                    inflow[iz + nz * iy] += death * gi * weights[idx];
                }
            }

            for k in 0..ny {
                let start = k * m;
                let chunk_out = &mut next[start..start + m];
                for (l, slot) in chunk_out.iter_mut().enumerate() {
                    let idx = start + l;
                    let mut coupling = 0.0;
                    for j in 0..ny {
                        if j != k {
                            let rate = model.income().rate(j, k);
                            if rate != 0.0 {
                                coupling = rate.mul_add(g[j * m + l], coupling);
                            }
                        }
                    }
                    *slot = delta.mul_add(coupling, g[idx]);
                }
                if death_active {
                    let (cb, ca) = match cell {
                        Some(c) => c,
                        None => unreachable!(),
                    };
                    let w_cell = space.liquid.weight(cb) * space.illiquid.weight(ca);
                    for iz in 0..nz {
                        let target = cb + space.nb() * ca + chunk * iz;
                        chunk_out[target] += delta * inflow[iz + nz * k] / w_cell;
                    }
                }
                factors[k].solve_in_place(chunk_out);
            }

            for iz in 0..nz {
                renormalize_type(space, model.params().type_shares[iz], iz, &mut next)?;
            }

            distance = sup_norm(&next, &g);
            iterations = iteration;
            std::mem::swap(&mut g, &mut next);
            debug!("distribution sweep {iteration}: sup-norm change {distance:.3e}");

            if distance < self.tolerance {
                info!(
                    "stationary distribution converged after {iteration} sweeps (distance {distance:.3e})"
                );
                for (idx, gi) in g.iter_mut().enumerate() {
                    if *gi < -NEGATIVE_DENSITY_TOL {
                        return Err(SolveError::NumericalError(format!(
                            "stationary density is negative ({:.3e}) at state {idx}",
                            *gi
                        )));
                    }
                    *gi = gi.max(0.0);
                }
                return Ok(StationaryDistribution {
                    g,
                    space: space.clone(),
                    iterations,
                    distance,
                });
            }
            if iteration >= self.divergence_min_iterations && distance > self.divergence_threshold
            {
                return Err(SolveError::DivergenceDetected {
                    what: "distribution sweep",
                    iterations,
                    distance,
                });
            }
        }
        Err(SolveError::ConvergenceFailure {
            what: "distribution sweep",
            iterations,
            distance,
        })
    }
}

/// Rescales one type system (local layout) so its weighted mass matches the
/// population share.
fn rescale_block(space: &StateSpace, share: f64, block: &mut [f64]) -> Result<(), SolveError> {
    let (nb, na) = (space.nb(), space.na());
    let mut mass = 0.0;
    for (l, &gl) in block.iter().enumerate() {
        let ib = l % nb;
        let ia = (l / nb) % na;
        mass += gl * space.liquid.weight(ib) * space.illiquid.weight(ia);
    }
    if !(mass > 0.0) {
        return Err(SolveError::NumericalError(
            "stationary mass vanished during rescaling".to_string(),
        ));
    }
    let scale = share / mass;
    for gl in block.iter_mut() {
        *gl *= scale;
    }
    Ok(())
}

/// Rescales the states of one preference type (global layout) to the
/// population share.
fn renormalize_type(
    space: &StateSpace,
    share: f64,
    iz: usize,
    g: &mut [f64],
) -> Result<(), SolveError> {
    let weights = space.state_weights();
    let mut mass = 0.0;
    for (idx, &gi) in g.iter().enumerate() {
        let (_, _, z, _) = space.unflatten(idx);
        if z == iz {
            mass += gi * weights[idx];
        }
    }
    if !(mass > 0.0) {
        return Err(SolveError::NumericalError(
            "stationary mass vanished during renormalization".to_string(),
        ));
    }
    let scale = share / mass;
    for (idx, gi) in g.iter_mut().enumerate() {
        let (_, _, z, _) = space.unflatten(idx);
        if z == iz {
            *gi *= scale;
        }
    }
    Ok(())
}
