//! Asset grids and the flattened household state space.
//!
//! Grids are ascending and may be nonuniform (power-spaced grids concentrate
//! nodes near the borrowing constraint, where policies have the most
//! curvature). Each grid carries its one-sided spacings and trapezoid
//! integration weights so the upwind scheme and the distribution solvers
//! share a single source of truth.

use crate::core::SolveError;

/// One asset dimension: nodes, one-sided spacings, integration weights.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetGrid {
    nodes: Vec<f64>,
    /// `forward[i] = nodes[i+1] - nodes[i]`; the last entry repeats the
    /// previous one and is never consumed by an interior stencil.
    forward: Vec<f64>,
    /// `backward[i] = nodes[i] - nodes[i-1]`; the first entry repeats the
    /// next one.
    backward: Vec<f64>,
    /// Trapezoid weights; integrate a density by `sum(g[i] * w[i])`.
    weights: Vec<f64>,
}

impl AssetGrid {
    /// Builds a grid from explicit nodes. Nodes must be strictly ascending;
    /// a single node is allowed and denotes a degenerate (switched-off)
    /// dimension.
    pub fn from_nodes(nodes: Vec<f64>) -> Result<Self, SolveError> {
        if nodes.is_empty() {
            return Err(SolveError::InvalidInput(
                "asset grid needs at least one node".to_string(),
            ));
        }
        if !nodes.iter().all(|x| x.is_finite()) {
            return Err(SolveError::InvalidInput(
                "asset grid nodes must be finite".to_string(),
            ));
        }
        if nodes.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SolveError::InvalidInput(
                "asset grid nodes must be strictly ascending".to_string(),
            ));
        }
        let n = nodes.len();
        let (forward, backward, weights) = if n == 1 {
            (vec![1.0], vec![1.0], vec![1.0])
        } else {
            let mut forward = vec![0.0; n];
            let mut backward = vec![0.0; n];
            for i in 0..n - 1 {
                forward[i] = nodes[i + 1] - nodes[i];
                backward[i + 1] = forward[i];
            }
            forward[n - 1] = forward[n - 2];
            backward[0] = backward[1];
            let mut weights = vec![0.0; n];
            weights[0] = 0.5 * (nodes[1] - nodes[0]);
            weights[n - 1] = 0.5 * (nodes[n - 1] - nodes[n - 2]);
            for i in 1..n - 1 {
                weights[i] = 0.5 * (nodes[i + 1] - nodes[i - 1]);
            }
            (forward, backward, weights)
        };
        Ok(Self {
            nodes,
            forward,
            backward,
            weights,
        })
    }

    /// Evenly spaced grid on `[min, max]`.
    pub fn uniform(n: usize, min: f64, max: f64) -> Result<Self, SolveError> {
        Self::power_spaced(n, min, max, 1.0)
    }

    /// Power-spaced grid: `min + (max - min) * (i / (n-1))^curvature`.
    /// Curvature above one clusters nodes near `min`.
    pub fn power_spaced(n: usize, min: f64, max: f64, curvature: f64) -> Result<Self, SolveError> {
        if n < 2 {
            return Err(SolveError::InvalidInput(
                "spaced grids need at least two nodes".to_string(),
            ));
        }
        if !(max > min) {
            return Err(SolveError::InvalidInput(format!(
                "grid upper bound {max} must exceed lower bound {min}"
            )));
        }
        if !(curvature > 0.0) {
            return Err(SolveError::InvalidInput(
                "grid curvature must be positive".to_string(),
            ));
        }
        let span = max - min;
        let nodes = (0..n)
            .map(|i| min + span * (i as f64 / (n - 1) as f64).powf(curvature))
            .collect();
        Self::from_nodes(nodes)
    }

    /// Degenerate single-node grid pinning the dimension at `value`.
    pub fn singleton(value: f64) -> Result<Self, SolveError> {
        Self::from_nodes(vec![value])
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Dimension collapsed to a single point.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.nodes.len() == 1
    }

    #[inline]
    pub fn node(&self, i: usize) -> f64 {
        self.nodes[i]
    }

    #[inline]
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    #[inline]
    pub fn min(&self) -> f64 {
        self.nodes[0]
    }

    #[inline]
    pub fn max(&self) -> f64 {
        self.nodes[self.nodes.len() - 1]
    }

    #[inline]
    pub fn forward_spacing(&self, i: usize) -> f64 {
        self.forward[i]
    }

    #[inline]
    pub fn backward_spacing(&self, i: usize) -> f64 {
        self.backward[i]
    }

    #[inline]
    pub fn weight(&self, i: usize) -> f64 {
        self.weights[i]
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Bracketing cell and interpolation fraction for `x`, clamped to the
    /// grid range.
    pub fn locate(&self, x: f64) -> (usize, f64) {
        let n = self.nodes.len();
        if n == 1 || x <= self.nodes[0] {
            return (0, 0.0);
        }
        if x >= self.nodes[n - 1] {
            return (n - 2, 1.0);
        }
        let hi = self.nodes.partition_point(|&node| node <= x);
        let lo = hi - 1;
        let t = (x - self.nodes[lo]) / (self.nodes[hi] - self.nodes[lo]);
        (lo, t)
    }

    /// Index of the node closest to `x`.
    pub fn nearest_index(&self, x: f64) -> usize {
        let (lo, t) = self.locate(x);
        if self.nodes.len() == 1 {
            0
        } else if t <= 0.5 {
            lo
        } else {
            lo + 1
        }
    }
}

/// Full household state space: liquid x illiquid x preference type x income,
/// flattened with the liquid index varying fastest and income outermost.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpace {
    pub liquid: AssetGrid,
    pub illiquid: AssetGrid,
    pub n_types: usize,
    pub n_income: usize,
}

impl StateSpace {
    pub fn new(
        liquid: AssetGrid,
        illiquid: AssetGrid,
        n_types: usize,
        n_income: usize,
    ) -> Result<Self, SolveError> {
        if liquid.len() < 2 {
            return Err(SolveError::InvalidInput(
                "liquid grid needs at least two nodes".to_string(),
            ));
        }
        if n_types == 0 || n_income == 0 {
            return Err(SolveError::InvalidInput(
                "state space needs at least one preference type and one income state".to_string(),
            ));
        }
        Ok(Self {
            liquid,
            illiquid,
            n_types,
            n_income,
        })
    }

    #[inline]
    pub fn nb(&self) -> usize {
        self.liquid.len()
    }

    #[inline]
    pub fn na(&self) -> usize {
        self.illiquid.len()
    }

    /// Total number of flattened states.
    #[inline]
    pub fn n_states(&self) -> usize {
        self.nb() * self.na() * self.n_types * self.n_income
    }

    /// States per income block (`nb * na * n_types`).
    #[inline]
    pub fn per_income(&self) -> usize {
        self.nb() * self.na() * self.n_types
    }

    /// Stride of one step in the illiquid dimension.
    #[inline]
    pub fn illiquid_stride(&self) -> usize {
        self.nb()
    }

    #[inline]
    pub fn flatten(&self, ib: usize, ia: usize, iz: usize, iy: usize) -> usize {
        debug_assert!(ib < self.nb() && ia < self.na());
        debug_assert!(iz < self.n_types && iy < self.n_income);
        ib + self.nb() * (ia + self.na() * (iz + self.n_types * iy))
    }

    /// Inverse of [`flatten`](Self::flatten): `(ib, ia, iz, iy)`.
    #[inline]
    pub fn unflatten(&self, idx: usize) -> (usize, usize, usize, usize) {
        let ib = idx % self.nb();
        let rest = idx / self.nb();
        let ia = rest % self.na();
        let rest = rest / self.na();
        let iz = rest % self.n_types;
        let iy = rest / self.n_types;
        (ib, ia, iz, iy)
    }

    /// Joint trapezoid weight of every flattened state (asset measure only;
    /// type and income dimensions are counting measures).
    pub fn state_weights(&self) -> Vec<f64> {
        let mut w = vec![0.0; self.n_states()];
        for (idx, wi) in w.iter_mut().enumerate() {
            let (ib, ia, _, _) = self.unflatten(idx);
            *wi = self.liquid.weight(ib) * self.illiquid.weight(ia);
        }
        w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn trapezoid_weights_integrate_constants_exactly() {
        let grid = AssetGrid::power_spaced(30, 0.0, 50.0, 1.8).unwrap();
        let total: f64 = grid.weights().iter().sum();
        assert_relative_eq!(total, 50.0, epsilon = 1e-12);
    }

    #[test]
    fn spacings_are_consistent_with_nodes() {
        let grid = AssetGrid::from_nodes(vec![0.0, 0.5, 1.5, 4.0]).unwrap();
        assert_relative_eq!(grid.forward_spacing(0), 0.5);
        assert_relative_eq!(grid.backward_spacing(3), 2.5);
        assert_relative_eq!(grid.forward_spacing(3), grid.forward_spacing(2));
        assert_relative_eq!(grid.backward_spacing(0), grid.backward_spacing(1));
    }

    #[test]
    fn rejects_non_ascending_nodes() {
        let err = AssetGrid::from_nodes(vec![0.0, 0.0, 1.0]).unwrap_err();
        assert!(matches!(err, SolveError::InvalidInput(_)));
    }

    #[test]
    fn locate_clamps_and_brackets() {
        let grid = AssetGrid::uniform(5, 0.0, 4.0).unwrap();
        assert_eq!(grid.locate(-1.0), (0, 0.0));
        assert_eq!(grid.locate(9.0), (3, 1.0));
        let (lo, t) = grid.locate(2.25);
        assert_eq!(lo, 2);
        assert_relative_eq!(t, 0.25);
        assert_eq!(grid.nearest_index(2.6), 3);
    }

    #[test]
    fn flatten_unflatten_round_trip() {
        let space = StateSpace::new(
            AssetGrid::uniform(4, 0.0, 1.0).unwrap(),
            AssetGrid::uniform(3, 0.0, 1.0).unwrap(),
            2,
            5,
        )
        .unwrap();
        for idx in 0..space.n_states() {
            let (ib, ia, iz, iy) = space.unflatten(idx);
            assert_eq!(space.flatten(ib, ia, iz, iy), idx);
        }
        assert_eq!(space.per_income(), 4 * 3 * 2);
        assert_eq!(space.illiquid_stride(), 4);
    }

    #[test]
    fn degenerate_illiquid_dimension_is_supported() {
        let space = StateSpace::new(
            AssetGrid::uniform(3, 0.0, 1.0).unwrap(),
            AssetGrid::singleton(0.0).unwrap(),
            1,
            1,
        )
        .unwrap();
        assert_eq!(space.n_states(), 3);
        assert!(space.illiquid.is_degenerate());
        let w = space.state_weights();
        assert_relative_eq!(w.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }
}
