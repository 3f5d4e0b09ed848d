//! Small numerical utilities shared by the solver stages.

pub mod banded;

use crate::core::SolveError;

/// Largest absolute componentwise difference between two equally long slices.
pub fn sup_norm(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .fold(0.0_f64, |acc, (x, y)| acc.max((x - y).abs()))
}

/// Scalar Newton-Raphson root finder.
pub fn newton_raphson<F, G>(
    f: F,
    df: G,
    x0: f64,
    tol: f64,
    max_iter: usize,
) -> Result<f64, SolveError>
where
    F: Fn(f64) -> f64,
    G: Fn(f64) -> f64,
{
    let mut x = x0;
    for _ in 0..max_iter {
        let fx = f(x);
        if fx.abs() <= tol {
            return Ok(x);
        }
        let dfx = df(x);
        if dfx.abs() <= 1e-14 {
            return Err(SolveError::NumericalError(
                "zero derivative in Newton iteration".to_string(),
            ));
        }
        let x_next = x - fx / dfx;
        if (x_next - x).abs() <= tol {
            return Ok(x_next);
        }
        x = x_next;
    }
    Err(SolveError::ConvergenceFailure {
        what: "Newton iteration",
        iterations: max_iter,
        distance: f(x).abs(),
    })
}

/// Piecewise-linear interpolation on an ascending grid, clamped to the
/// endpoint values outside the range.
pub fn lerp_clamped(nodes: &[f64], values: &[f64], x: f64) -> f64 {
    debug_assert_eq!(nodes.len(), values.len());
    let n = nodes.len();
    if n == 1 || x <= nodes[0] {
        return values[0];
    }
    if x >= nodes[n - 1] {
        return values[n - 1];
    }
    let hi = nodes.partition_point(|&node| node <= x);
    let lo = hi - 1;
    let w = (x - nodes[lo]) / (nodes[hi] - nodes[lo]);
    values[lo].mul_add(1.0 - w, values[hi] * w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sup_norm_picks_largest_gap() {
        let a = [1.0, 2.0, 3.0];
        let b = [1.5, 2.0, 1.0];
        assert_relative_eq!(sup_norm(&a, &b), 2.0);
    }

    #[test]
    fn newton_finds_square_root() {
        let root = newton_raphson(|x| x * x - 2.0, |x| 2.0 * x, 1.0, 1e-12, 64).unwrap();
        assert_relative_eq!(root, 2.0_f64.sqrt(), epsilon = 1e-10);
    }

    #[test]
    fn newton_reports_flat_derivative() {
        let err = newton_raphson(|_| 1.0, |_| 0.0, 0.0, 1e-12, 8).unwrap_err();
        assert!(matches!(err, SolveError::NumericalError(_)));
    }

    #[test]
    fn lerp_clamps_outside_the_grid() {
        let nodes = [0.0, 1.0, 3.0];
        let values = [10.0, 20.0, 40.0];
        assert_relative_eq!(lerp_clamped(&nodes, &values, -5.0), 10.0);
        assert_relative_eq!(lerp_clamped(&nodes, &values, 9.0), 40.0);
        assert_relative_eq!(lerp_clamped(&nodes, &values, 2.0), 30.0);
    }
}
