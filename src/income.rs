//! Markov-modulated labor income.
//!
//! Income follows a continuous-time Markov chain with intensity matrix
//! `generator`: `generator[(j, k)]` is the instantaneous switching rate from
//! state `j` to state `k`. Rows sum to zero with non-negative off-diagonals.

use nalgebra::{DMatrix, DVector};

use crate::core::SolveError;

const ROW_SUM_TOL: f64 = 1e-10;

/// Validated income process: productivity levels plus switching intensities.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomeProcess {
    levels: Vec<f64>,
    generator: DMatrix<f64>,
}

impl IncomeProcess {
    pub fn new(levels: Vec<f64>, generator: DMatrix<f64>) -> Result<Self, SolveError> {
        let n = levels.len();
        if n == 0 {
            return Err(SolveError::InvalidInput(
                "income process needs at least one state".to_string(),
            ));
        }
        if levels.iter().any(|&y| !(y > 0.0) || !y.is_finite()) {
            return Err(SolveError::InvalidInput(
                "income levels must be positive and finite".to_string(),
            ));
        }
        if generator.nrows() != n || generator.ncols() != n {
            return Err(SolveError::InvalidInput(format!(
                "income generator must be {n}x{n}, got {}x{}",
                generator.nrows(),
                generator.ncols()
            )));
        }
        for j in 0..n {
            let mut row_sum = 0.0;
            for k in 0..n {
                let rate = generator[(j, k)];
                if !rate.is_finite() {
                    return Err(SolveError::InvalidInput(
                        "income generator entries must be finite".to_string(),
                    ));
                }
                if j != k && rate < 0.0 {
                    return Err(SolveError::InvalidInput(format!(
                        "income switching rate ({j} -> {k}) is negative: {rate}"
                    )));
                }
                row_sum += rate;
            }
            if row_sum.abs() > ROW_SUM_TOL {
                return Err(SolveError::InvalidInput(format!(
                    "income generator row {j} sums to {row_sum:.3e}, expected zero"
                )));
            }
        }
        Ok(Self { levels, generator })
    }

    /// Classic two-state calibration: low and high productivity with
    /// switching rates `rate_up` (low to high) and `rate_down`.
    pub fn two_state(
        y_low: f64,
        y_high: f64,
        rate_up: f64,
        rate_down: f64,
    ) -> Result<Self, SolveError> {
        if rate_up < 0.0 || rate_down < 0.0 {
            return Err(SolveError::InvalidInput(
                "income switching rates must be non-negative".to_string(),
            ));
        }
        let generator =
            DMatrix::from_row_slice(2, 2, &[-rate_up, rate_up, rate_down, -rate_down]);
        Self::new(vec![y_low, y_high], generator)
    }

    #[inline]
    pub fn n_states(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn level(&self, k: usize) -> f64 {
        self.levels[k]
    }

    #[inline]
    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    /// Switching intensity from state `j` to state `k`.
    #[inline]
    pub fn rate(&self, j: usize, k: usize) -> f64 {
        self.generator[(j, k)]
    }

    #[inline]
    pub fn generator(&self) -> &DMatrix<f64> {
        &self.generator
    }

    /// Ergodic distribution of the chain, solved from the transposed
    /// generator with a normalization row.
    pub fn stationary_distribution(&self) -> Result<Vec<f64>, SolveError> {
        let n = self.n_states();
        if n == 1 {
            return Ok(vec![1.0]);
        }
        let mut system = self.generator.transpose();
        for k in 0..n {
            system[(0, k)] = 1.0;
        }
        let mut rhs = DVector::zeros(n);
        rhs[0] = 1.0;
        let solution = system.lu().solve(&rhs).ok_or_else(|| {
            SolveError::NumericalError("income generator is not ergodic".to_string())
        })?;
        Ok(solution.iter().copied().collect())
    }
}
