//! Library-wide error and shared domain types.

pub mod types;

pub use types::{
    DeathSettlement, KfeMode, LaborSupply, MpcRecord, MpcTable, Preference, ShockSpec, UpdateMode,
};

/// Unified error type for model construction and every solver stage.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveError {
    /// Input validation error, raised before any iteration starts.
    InvalidInput(String),
    /// A scheme invariant failed (e.g. an upwind regime partition); indicates
    /// a logic defect, never a tolerance issue.
    InvariantViolation(String),
    /// An iterative solver exhausted its iteration budget.
    ConvergenceFailure {
        what: &'static str,
        iterations: usize,
        distance: f64,
    },
    /// An iterative solver's distance blew past the divergence threshold.
    DivergenceDetected {
        what: &'static str,
        iterations: usize,
        distance: f64,
    },
    /// Numerical issue (singular factorization, invalid density, etc.).
    NumericalError(String),
}

impl std::fmt::Display for SolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::ConvergenceFailure {
                what,
                iterations,
                distance,
            } => write!(
                f,
                "{what} failed to converge after {iterations} iterations (distance {distance:.3e})"
            ),
            Self::DivergenceDetected {
                what,
                iterations,
                distance,
            } => write!(
                f,
                "{what} diverged at iteration {iterations} (distance {distance:.3e})"
            ),
            Self::NumericalError(msg) => write!(f, "numerical error: {msg}"),
        }
    }
}

impl std::error::Error for SolveError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_are_stable() {
        let err = SolveError::ConvergenceFailure {
            what: "value function iteration",
            iterations: 500,
            distance: 2.5e-3,
        };
        let text = err.to_string();
        assert!(text.contains("value function iteration"));
        assert!(text.contains("500"));

        let err = SolveError::InvalidInput("liquid grid must be ascending".into());
        assert_eq!(
            err.to_string(),
            "invalid input: liquid grid must be ascending"
        );
    }
}
