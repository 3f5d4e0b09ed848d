//! Module `snapshots`.
//!
//! Time-stamped policy functions along a deterministic transition path.
//! A news experiment needs the policies households follow between learning
//! about a shock and its arrival; storing a handful of snapshots and
//! blending linearly in time keeps the simulator independent of however the
//! path was produced. Paths are keyed by shock label, since each announced
//! shock size induces its own transition. Serialization goes through JSON so
//! paths can be computed once and replayed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::SolveError;
use crate::model::PolicyBundle;

/// Policies at increasing times, linearly interpolated in between and
/// clamped outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshots {
    times: Vec<f64>,
    bundles: Vec<PolicyBundle>,
}

impl PolicySnapshots {
    pub fn new(times: Vec<f64>, bundles: Vec<PolicyBundle>) -> Result<Self, SolveError> {
        if times.is_empty() || times.len() != bundles.len() {
            return Err(SolveError::InvalidInput(format!(
                "{} snapshot times for {} policy bundles",
                times.len(),
                bundles.len()
            )));
        }
        if times.iter().any(|t| !t.is_finite()) {
            return Err(SolveError::InvalidInput(
                "snapshot times must be finite".to_string(),
            ));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(SolveError::InvalidInput(
                "snapshot times must be strictly increasing".to_string(),
            ));
        }
        let n = bundles[0].c.len();
        for bundle in &bundles {
            if bundle.c.len() != n
                || bundle.s.len() != n
                || bundle.d.len() != n
                || bundle.u.len() != n
            {
                return Err(SolveError::InvalidInput(
                    "snapshot bundles must share one state space".to_string(),
                ));
            }
        }
        Ok(Self { times, bundles })
    }

    /// A constant path: the same policies at every time.
    pub fn stationary(bundle: PolicyBundle) -> Self {
        Self {
            times: vec![0.0],
            bundles: vec![bundle],
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn bundles(&self) -> &[PolicyBundle] {
        &self.bundles
    }

    /// Number of states each snapshot covers.
    pub fn n_states(&self) -> usize {
        self.bundles[0].c.len()
    }

    /// Bracketing snapshot indices and the interpolation weight at `t`.
    /// Outside the covered interval the nearest snapshot is returned with a
    /// zero weight.
    pub fn bracket(&self, t: f64) -> (usize, usize, f64) {
        let times = &self.times;
        let last = times.len() - 1;
        if t <= times[0] {
            return (0, 0, 0.0);
        }
        if t >= times[last] {
            return (last, last, 0.0);
        }
        let hi = times.partition_point(|&s| s <= t);
        let lo = hi - 1;
        let theta = (t - times[lo]) / (times[hi] - times[lo]);
        (lo, hi, theta)
    }

    /// Policies at time `t`, blended from the bracketing snapshots.
    pub fn blend(&self, t: f64) -> PolicyBundle {
        let (lo, hi, theta) = self.bracket(t);
        if lo == hi || theta == 0.0 {
            return self.bundles[lo].clone();
        }
        let mix = |x: &[f64], y: &[f64]| -> Vec<f64> {
            x.iter()
                .zip(y)
                .map(|(&a, &b)| a.mul_add(1.0 - theta, b * theta))
                .collect()
        };
        let (a, b) = (&self.bundles[lo], &self.bundles[hi]);
        PolicyBundle {
            c: mix(&a.c, &b.c),
            s: mix(&a.s, &b.s),
            d: mix(&a.d, &b.d),
            u: mix(&a.u, &b.u),
        }
    }

    pub fn to_json(&self) -> Result<String, SolveError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SolveError::InvalidInput(format!("snapshot serialization failed: {e}")))
    }

    pub fn from_json(text: &str) -> Result<Self, SolveError> {
        let raw: Self = serde_json::from_str(text)
            .map_err(|e| SolveError::InvalidInput(format!("snapshot parsing failed: {e}")))?;
        Self::new(raw.times, raw.bundles)
    }
}

/// Snapshot paths keyed by shock label.
///
/// Every path must cover the same state space; the simulator looks up each
/// configured shock's own path when it runs a news experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotStore {
    entries: BTreeMap<String, PolicySnapshots>,
}

impl SnapshotStore {
    pub fn new(entries: BTreeMap<String, PolicySnapshots>) -> Result<Self, SolveError> {
        if entries.is_empty() {
            return Err(SolveError::InvalidInput(
                "at least one snapshot path is required".to_string(),
            ));
        }
        let mut states: Option<usize> = None;
        for (label, path) in &entries {
            match states {
                None => states = Some(path.n_states()),
                Some(n) if n != path.n_states() => {
                    return Err(SolveError::InvalidInput(format!(
                        "snapshot path '{label}' covers {} states, expected {n}",
                        path.n_states()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(Self { entries })
    }

    /// A store holding one labelled path.
    pub fn single(label: impl Into<String>, path: PolicySnapshots) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(label.into(), path);
        Self { entries }
    }

    pub fn get(&self, label: &str) -> Option<&PolicySnapshots> {
        self.entries.get(label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of states every stored path covers.
    pub fn n_states(&self) -> usize {
        self.entries
            .values()
            .next()
            .map_or(0, PolicySnapshots::n_states)
    }

    pub fn to_json(&self) -> Result<String, SolveError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SolveError::InvalidInput(format!("snapshot serialization failed: {e}")))
    }

    pub fn from_json(text: &str) -> Result<Self, SolveError> {
        let raw: Self = serde_json::from_str(text)
            .map_err(|e| SolveError::InvalidInput(format!("snapshot parsing failed: {e}")))?;
        let mut entries = BTreeMap::new();
        for (label, path) in raw.entries {
            entries.insert(label, PolicySnapshots::new(path.times, path.bundles)?);
        }
        Self::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(level: f64, n: usize) -> PolicyBundle {
        PolicyBundle {
            c: vec![level; n],
            s: vec![0.0; n],
            d: vec![0.0; n],
            u: vec![-level; n],
        }
    }

    #[test]
    fn blend_interpolates_between_snapshots_and_clamps_outside() {
        let snaps =
            PolicySnapshots::new(vec![0.0, 1.0], vec![bundle(1.0, 3), bundle(3.0, 3)]).unwrap();
        assert_eq!(snaps.blend(-0.5).c[0], 1.0);
        assert_eq!(snaps.blend(2.0).c[0], 3.0);
        let mid = snaps.blend(0.25);
        assert!((mid.c[1] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn constructor_rejects_bad_inputs() {
        assert!(PolicySnapshots::new(vec![], vec![]).is_err());
        assert!(PolicySnapshots::new(vec![0.0, 0.0], vec![bundle(1.0, 2), bundle(1.0, 2)]).is_err());
        assert!(PolicySnapshots::new(vec![0.0], vec![bundle(1.0, 2), bundle(1.0, 2)]).is_err());
        let mut short = bundle(1.0, 2);
        short.d.pop();
        assert!(PolicySnapshots::new(vec![0.0], vec![short]).is_err());
    }

    #[test]
    fn json_round_trip_preserves_the_path() {
        let snaps =
            PolicySnapshots::new(vec![0.0, 0.5, 2.0], vec![bundle(1.0, 4), bundle(2.0, 4), bundle(0.5, 4)])
                .unwrap();
        let text = snaps.to_json().unwrap();
        let back = PolicySnapshots::from_json(&text).unwrap();
        assert_eq!(snaps, back);
    }

    #[test]
    fn stationary_path_is_constant() {
        let snaps = PolicySnapshots::stationary(bundle(2.0, 3));
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps.blend(0.0).c, snaps.blend(10.0).c);
    }

    #[test]
    fn store_keys_paths_by_shock_label() {
        let path =
            PolicySnapshots::new(vec![0.0, 1.0], vec![bundle(1.0, 3), bundle(2.0, 3)]).unwrap();
        let store = SnapshotStore::single("rebate", path);
        assert_eq!(store.len(), 1);
        assert!(store.get("rebate").is_some());
        assert!(store.get("other").is_none());
        assert_eq!(store.n_states(), 3);
        assert_eq!(store.labels().collect::<Vec<_>>(), vec!["rebate"]);

        let text = store.to_json().unwrap();
        let back = SnapshotStore::from_json(&text).unwrap();
        assert_eq!(store, back);
    }

    #[test]
    fn store_rejects_mismatched_state_spaces() {
        let mut entries = BTreeMap::new();
        entries.insert("a".to_string(), PolicySnapshots::stationary(bundle(1.0, 3)));
        entries.insert("b".to_string(), PolicySnapshots::stationary(bundle(1.0, 4)));
        assert!(SnapshotStore::new(entries).is_err());
        assert!(SnapshotStore::new(BTreeMap::new()).is_err());
    }
}
