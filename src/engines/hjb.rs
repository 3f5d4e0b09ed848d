//! Module `engines::hjb`.
//!
//! Value function iteration for the household HJB equation. Each outer
//! iteration rebuilds policies and the asset generator, then advances the
//! value by one implicit pseudo-time step. The default scheme is implicit in
//! the asset transitions and explicit in the income coupling, one banded
//! solve per income block; the blocks are independent and parallelize under
//! the `parallel` feature. Past a configurable iteration count the solver
//! switches into Howard improvement sweeps, re-applying the frozen block
//! factorizations until the coupled linear system has converged for the
//! current policies.

use log::{debug, info};
use nalgebra::DVector;

use crate::core::{SolveError, UpdateMode};
use crate::math::banded::{BandedLu, BandedMatrix};
use crate::math::sup_norm;
use crate::model::{PolicyBundle, PolicyEngine, RiskCorrection, TransitionBuilder, TransitionOperator, TwoAssetModel};

/// Converged value function with everything the distribution stage needs.
#[derive(Debug, Clone)]
pub struct HjbSolution {
    pub value: Vec<f64>,
    /// Policies at the converged value.
    pub policies: PolicyBundle,
    /// Asset generator at the converged policies.
    pub generator: TransitionOperator,
    /// Variance-penalty data (recursive preferences with diffusion only).
    pub risk: Option<RiskCorrection>,
    pub iterations: usize,
    pub distance: f64,
}

/// HJB solver configuration.
#[derive(Debug, Clone)]
pub struct HjbSolver {
    time_step: f64,
    tolerance: f64,
    max_iterations: usize,
    divergence_threshold: f64,
    divergence_min_iterations: usize,
    howard_start_iteration: usize,
    howard_max_sweeps: usize,
    howard_tolerance: f64,
    update_mode: UpdateMode,
    derivative_floor: f64,
    initial_value: Option<Vec<f64>>,
}

impl Default for HjbSolver {
    fn default() -> Self {
        Self {
            // large pseudo-time step: each update is close to a policy
            // evaluation, the quasi-Newton limit of the scheme
            time_step: 1.0e6,
            tolerance: 1e-6,
            max_iterations: 500,
            divergence_threshold: 1.0e8,
            divergence_min_iterations: 8,
            howard_start_iteration: 20,
            howard_max_sweeps: 20,
            howard_tolerance: 1e-8,
            update_mode: UpdateMode::ImplicitExplicit,
            derivative_floor: crate::model::policy::DERIVATIVE_FLOOR,
            initial_value: None,
        }
    }
}

impl HjbSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_step(mut self, dt: f64) -> Self {
        self.time_step = dt;
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

    pub fn with_howard(mut self, start_iteration: usize, max_sweeps: usize, tol: f64) -> Self {
        self.howard_start_iteration = start_iteration;
        self.howard_max_sweeps = max_sweeps;
        self.howard_tolerance = tol;
        self
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn with_derivative_floor(mut self, floor: f64) -> Self {
        self.derivative_floor = floor;
        self
    }

    /// Starts the iteration from a caller-supplied value function instead of
    /// the stationary-consumption heuristic.
    pub fn with_initial_value(mut self, value: Vec<f64>) -> Self {
        self.initial_value = Some(value);
        self
    }

    fn validate(&self, model: &TwoAssetModel) -> Result<(), SolveError> {
        if !(self.time_step > 0.0) || !self.time_step.is_finite() {
            return Err(SolveError::InvalidInput(
                "time step must be positive and finite".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) || self.max_iterations == 0 {
            return Err(SolveError::InvalidInput(
                "tolerance must be positive and the iteration budget non-empty".to_string(),
            ));
        }
        if self.update_mode == UpdateMode::FullyImplicit && model.params().death_rate > 0.0 {
            return Err(SolveError::InvalidInput(
                "the fully implicit update does not support a positive death rate; \
                 use the implicit-explicit mode"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Runs the value iteration to convergence.
    pub fn solve(&self, model: &TwoAssetModel) -> Result<HjbSolution, SolveError> {
        self.validate(model)?;
        let space = model.space();
        let n = space.n_states();
        let mut value = match &self.initial_value {
            Some(v) => {
                if v.len() != n {
                    return Err(SolveError::InvalidInput(format!(
                        "initial value has {} entries for {} states",
                        v.len(),
                        n
                    )));
                }
                v.clone()
            }
            None => model.initial_value()?,
        };

        let engine = PolicyEngine::new().with_derivative_floor(self.derivative_floor);
        let builder = TransitionBuilder::new(model);
        let needs_value = model.params().preference.is_recursive() && model.diffusion_active();

        let mut previous = vec![0.0; n];
        let mut scratch = vec![0.0; n];
        let mut iterations = 0;
        let mut distance = f64::INFINITY;

        for iteration in 1..=self.max_iterations {
            let policies = engine.update(model, &value)?;
            let drifts = model.asset_drifts(&policies);
            let (generator, risk) =
                builder.build(&drifts, needs_value.then_some(value.as_slice()))?;

            previous.copy_from_slice(&value);
            let u_eff = self.effective_utility(model, &policies, risk.as_ref(), &previous);

            match self.update_mode {
                UpdateMode::FullyImplicit => {
                    self.fully_implicit_update(model, &generator, &u_eff, &previous, &mut value, iteration)?;
                }
                UpdateMode::ImplicitExplicit => {
                    self.block_implicit_update(
                        model, &generator, &u_eff, &previous, &mut value, &mut scratch, iteration,
                    )?;
                }
            }

            distance = sup_norm(&value, &previous);
            iterations = iteration;
            debug!("value iteration {iteration}: sup-norm change {distance:.3e}");

            if distance < self.tolerance {
                info!("value function converged after {iteration} iterations (distance {distance:.3e})");
                let policies = engine.update(model, &value)?;
                let drifts = model.asset_drifts(&policies);
                let (generator, risk) =
                    builder.build(&drifts, needs_value.then_some(value.as_slice()))?;
                return Ok(HjbSolution {
                    value,
                    policies,
                    generator,
                    risk,
                    iterations,
                    distance,
                });
            }
            if iteration >= self.divergence_min_iterations && distance > self.divergence_threshold
            {
                return Err(SolveError::DivergenceDetected {
                    what: "value function iteration",
                    iterations,
                    distance,
                });
            }
        }
        Err(SolveError::ConvergenceFailure {
            what: "value function iteration",
            iterations,
            distance,
        })
    }

    /// Utility right-hand side: flow utility, plus the discount add-back
    /// under recursive preferences (the aggregator carries its own
    /// discounting while the implicit operator keeps the standard term),
    /// plus the variance penalty at flagged states.
    fn effective_utility(
        &self,
        model: &TwoAssetModel,
        policies: &PolicyBundle,
        risk: Option<&RiskCorrection>,
        previous: &[f64],
    ) -> Vec<f64> {
        let space = model.space();
        let recursive = model.params().preference.is_recursive();
        let mut u = policies.u.clone();
        if recursive {
            for (idx, ui) in u.iter_mut().enumerate() {
                let (_, _, iz, _) = space.unflatten(idx);
                *ui += model.discount_rate(iz) * previous[idx];
            }
        }
        if let Some(risk) = risk {
            for (idx, ui) in u.iter_mut().enumerate() {
                *ui += risk.rhs[idx];
            }
        }
        u
    }

    fn block_implicit_update(
        &self,
        model: &TwoAssetModel,
        generator: &BandedMatrix,
        u_eff: &[f64],
        previous: &[f64],
        value: &mut Vec<f64>,
        scratch: &mut Vec<f64>,
        iteration: usize,
    ) -> Result<(), SolveError> {
        let space = model.space();
        let m = space.per_income();
        let ny = space.n_income;
        let dt = self.time_step;
        let death = model.params().death_rate;
        let diag_idx = generator.offset_index(0).ok_or_else(|| {
            SolveError::InvariantViolation("generator is missing its diagonal band".to_string())
        })?;

        let mut blocks = Vec::with_capacity(ny);
        for k in 0..ny {
            let mut block = generator.block(k * m, m);
            for band in 0..block.offsets().len() {
                for x in block.band_mut(band) {
                    *x *= -dt;
                }
            }
            let own_rate = model.income().rate(k, k);
            for local in 0..m {
                let (_, _, iz, _) = space.unflatten(k * m + local);
                let rho = model.discount_rate(iz);
                block.band_mut(diag_idx)[local] += 1.0 + dt * (rho + death - own_rate);
            }
            blocks.push(block);
        }
        let factors = factor_blocks(&blocks)?;

        // implicit step with the income coupling taken from the previous
        // iterate
        apply_blocks(model, &factors, dt, u_eff, previous, previous, value);

        // Howard improvement: iterate the coupling to a fixed point under
        // the frozen factorizations
        if iteration >= self.howard_start_iteration {
            for _ in 0..self.howard_max_sweeps {
                apply_blocks(model, &factors, dt, u_eff, previous, value, scratch);
                let change = sup_norm(scratch, value);
                std::mem::swap(value, scratch);
                if change < self.howard_tolerance {
                    break;
                }
            }
        }
        Ok(())
    }

    fn fully_implicit_update(
        &self,
        model: &TwoAssetModel,
        generator: &BandedMatrix,
        u_eff: &[f64],
        previous: &[f64],
        value: &mut Vec<f64>,
        iteration: usize,
    ) -> Result<(), SolveError> {
        let space = model.space();
        let n = space.n_states();
        let m = space.per_income();
        let ny = space.n_income;
        let dt = self.time_step;

        // I + dt * (rho - A - income coupling)
        let mut system = generator.to_dense();
        for k in 0..ny {
            for j in 0..ny {
                let rate = model.income().rate(k, j);
                if rate != 0.0 {
                    for local in 0..m {
                        system[(k * m + local, j * m + local)] += rate;
                    }
                }
            }
        }
        system *= -dt;
        for idx in 0..n {
            let (_, _, iz, _) = space.unflatten(idx);
            system[(idx, idx)] += 1.0 + dt * model.discount_rate(iz);
        }
        let lu = system.lu();

        let solve_once = |coupling: &[f64]| -> Result<Vec<f64>, SolveError> {
            let mut rhs = DVector::zeros(n);
            for idx in 0..n {
                rhs[idx] = dt.mul_add(u_eff[idx], coupling[idx]);
            }
            lu.solve(&rhs)
                .map(|v| v.iter().copied().collect())
                .ok_or_else(|| {
                    SolveError::NumericalError(
                        "singular fully-implicit value update".to_string(),
                    )
                })
        };

        *value = solve_once(previous)?;
        if iteration >= self.howard_start_iteration {
            for _ in 0..self.howard_max_sweeps {
                let next = solve_once(value)?;
                let change = sup_norm(&next, value);
                *value = next;
                if change < self.howard_tolerance {
                    break;
                }
            }
        }
        Ok(())
    }
}

fn factor_blocks(blocks: &[BandedMatrix]) -> Result<Vec<BandedLu>, SolveError> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        blocks.par_iter().map(BandedLu::factor).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        blocks.iter().map(BandedLu::factor).collect()
    }
}

/// One application of the frozen per-block operators:
/// `out_k = B_k^{-1} (dt * u + previous_k + dt * sum_{j != k} rate(k,j) coupling_j)`.
fn apply_blocks(
    model: &TwoAssetModel,
    factors: &[BandedLu],
    dt: f64,
    u_eff: &[f64],
    previous: &[f64],
    coupling: &[f64],
    out: &mut [f64],
) {
    let space = model.space();
    let m = space.per_income();
    let ny = space.n_income;
    let assemble = |k: usize, chunk: &mut [f64]| {
        let start = k * m;
        for (local, slot) in chunk.iter_mut().enumerate() {
            let idx = start + local;
            let mut inflow = 0.0;
            for j in 0..ny {
                if j != k {
                    let rate = model.income().rate(k, j);
                    if rate != 0.0 {
                        inflow = rate.mul_add(coupling[j * m + local], inflow);
                    }
                }
            }
            *slot = dt.mul_add(u_eff[idx] + inflow, previous[idx]);
        }
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        out.par_chunks_mut(m)
            .enumerate()
            .for_each(|(k, chunk)| {
                assemble(k, chunk);
                factors[k].solve_in_place(chunk);
            });
    }
    #[cfg(not(feature = "parallel"))]
    {
        for (k, chunk) in out.chunks_mut(m).enumerate() {
            assemble(k, chunk);
            factors[k].solve_in_place(chunk);
        }
    }
}
