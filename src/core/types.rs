use serde::{Deserialize, Serialize};

/// Preference specification resolved at model construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Preference {
    /// Time-additive constant-relative-risk-aversion utility.
    Crra { gamma: f64 },
    /// Recursive Duffie-Epstein utility with unit elasticity of
    /// intertemporal substitution and separate risk aversion.
    Sdu { risk_aversion: f64 },
}

impl Preference {
    /// Curvature parameter used for marginal-utility inversion.
    pub fn curvature(self) -> f64 {
        match self {
            Self::Crra { gamma } => gamma,
            Self::Sdu { risk_aversion } => risk_aversion,
        }
    }

    pub fn is_recursive(self) -> bool {
        matches!(self, Self::Sdu { .. })
    }
}

/// Labor-supply margin of the household problem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaborSupply {
    /// Hours fixed at one; labor income is `wage * y`.
    Exogenous,
    /// Hours chosen each instant from the intratemporal first-order
    /// condition `disutility * l^(1/frisch) = wage * y * marginal_value`.
    Endogenous { frisch: f64, disutility: f64 },
}

impl LaborSupply {
    pub fn is_endogenous(self) -> bool {
        matches!(self, Self::Endogenous { .. })
    }
}

/// Time discretization of the HJB update step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// One dense linear solve over the whole state space per iteration.
    /// Requires a zero death rate.
    FullyImplicit,
    /// Implicit in the asset transitions, explicit in the income coupling;
    /// one banded solve per income block per iteration.
    ImplicitExplicit,
}

/// Strategy for the stationary Kolmogorov forward equation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KfeMode {
    /// Dense solve of the stationarity system with a normalization row.
    Direct,
    /// Damped implicit sweeps of the transposed generator with step `delta`.
    Iterative { delta: f64 },
}

/// Destination of a household's assets at death.
///
/// `bequests` takes precedence over `rebirth_at_zero`; with both flags off,
/// the dying mass is redistributed proportionally to the surviving mass of
/// the same preference-type/income block. Death never moves mass across
/// blocks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeathSettlement {
    /// Newborns inherit the estate at a fixed (liquid, illiquid) position.
    pub bequests: bool,
    /// Newborns restart from the designated reset cell.
    pub rebirth_at_zero: bool,
    /// Liquid coordinate of the bequest cell (nearest grid node is used).
    pub bequest_liquid: f64,
    /// Illiquid coordinate of the bequest cell.
    pub bequest_illiquid: f64,
}

impl Default for DeathSettlement {
    fn default() -> Self {
        Self {
            bequests: false,
            rebirth_at_zero: true,
            bequest_liquid: 0.0,
            bequest_illiquid: 0.0,
        }
    }
}

/// A one-off addition to liquid balances whose consumption response is
/// being measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShockSpec {
    /// Human-readable identifier carried through to the result record.
    pub label: String,
    /// Signed shock size in units of the liquid asset.
    pub size: f64,
}

impl ShockSpec {
    pub fn new(label: impl Into<String>, size: f64) -> Self {
        Self {
            label: label.into(),
            size,
        }
    }
}

/// Consumption response to one shock, aggregated over the distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpcRecord {
    pub shock: ShockSpec,
    /// Within-quarter marginal propensities for the first four quarters.
    pub quarterly: [f64; 4],
    /// Four-quarter cumulative marginal propensity.
    pub annual: f64,
}

/// Ordered shock-to-record results of one MPC computation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MpcTable {
    pub records: Vec<MpcRecord>,
}

impl MpcTable {
    /// Looks a record up by its shock label.
    pub fn get(&self, label: &str) -> Option<&MpcRecord> {
        self.records.iter().find(|r| r.shock.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settlement_defaults_to_rebirth_at_reset() {
        let settlement = DeathSettlement::default();
        assert!(!settlement.bequests);
        assert!(settlement.rebirth_at_zero);
    }

    #[test]
    fn mpc_table_lookup_by_label() {
        let table = MpcTable {
            records: vec![MpcRecord {
                shock: ShockSpec::new("small", 0.01),
                quarterly: [0.2, 0.1, 0.05, 0.02],
                annual: 0.37,
            }],
        };
        assert!(table.get("small").is_some());
        assert!(table.get("large").is_none());
    }

    #[test]
    fn preference_curvature_matches_variant() {
        assert_eq!(Preference::Crra { gamma: 2.0 }.curvature(), 2.0);
        assert!(Preference::Sdu { risk_aversion: 5.0 }.is_recursive());
    }
}
