//! Module `params`.
//!
//! Structural and preference parameters of the household problem, validated
//! once at construction. Rates are annual; a quarter is 0.25 model years.

use serde::{Deserialize, Serialize};

use crate::core::{DeathSettlement, LaborSupply, Preference, SolveError};

/// Kinked convex cost of moving `d` units per year between the liquid and
/// the illiquid account: `chi0*|d| + chi1/chi2 * |d/abar|^chi2 * abar` with
/// `abar = max(a, a_floor)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentCost {
    /// Linear (kink) component; creates an inaction region.
    pub chi0: f64,
    /// Convex component scale.
    pub chi1: f64,
    /// Convex component exponent, strictly above one.
    pub chi2: f64,
    /// Lower bound on the scaling stock, keeps the cost finite at `a = 0`.
    pub a_floor: f64,
}

impl Default for AdjustmentCost {
    fn default() -> Self {
        Self {
            chi0: 0.044,
            chi1: 0.956,
            chi2: 1.5,
            a_floor: 0.01,
        }
    }
}

impl AdjustmentCost {
    #[inline]
    fn stock_scale(&self, a: f64) -> f64 {
        a.max(self.a_floor)
    }

    /// Flow cost of transacting at rate `d` with illiquid stock `a`.
    pub fn cost(&self, d: f64, a: f64) -> f64 {
        let abar = self.stock_scale(a);
        self.chi0 * d.abs() + self.chi1 / self.chi2 * (d / abar).abs().powf(self.chi2) * abar
    }

    /// Marginal cost `d(chi)/d(d)`; undefined at `d = 0` (kink).
    pub fn marginal(&self, d: f64, a: f64) -> f64 {
        let abar = self.stock_scale(a);
        (self.chi0 + self.chi1 * (d.abs() / abar).powf(self.chi2 - 1.0)) * d.signum()
    }

    /// Deposit rate equating the marginal illiquid-to-liquid value ratio to
    /// the marginal transaction cost. Returns zero inside the kink.
    pub fn first_order_deposit(&self, va_over_vb: f64, a: f64) -> f64 {
        let abar = self.stock_scale(a);
        let inv_exponent = 1.0 / (self.chi2 - 1.0);
        let gap_up = va_over_vb - 1.0 - self.chi0;
        if gap_up > 0.0 {
            return abar * (gap_up / self.chi1).powf(inv_exponent);
        }
        let gap_down = 1.0 - self.chi0 - va_over_vb;
        if gap_down > 0.0 {
            return -abar * (gap_down / self.chi1).powf(inv_exponent);
        }
        0.0
    }
}

/// Household-problem parameters shared by every solver stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Subjective discount rate per preference type; the vector length sets
    /// the number of types.
    pub discount_rates: Vec<f64>,
    /// Fixed population share per preference type; sums to one.
    pub type_shares: Vec<f64>,
    /// Return on liquid balances (`b >= 0`).
    pub liquid_return: f64,
    /// Spread added to the liquid return while borrowing (`b < 0`).
    pub borrow_wedge: f64,
    /// Deterministic return on the illiquid asset.
    pub illiquid_return: f64,
    /// Diffusion volatility of the illiquid return; zero disables diffusion.
    pub return_vol: f64,
    /// Poisson death intensity; estates settle per `settlement`.
    pub death_rate: f64,
    pub wage: f64,
    /// Lump-sum transfer added to liquid income.
    pub transfer: f64,
    pub preference: Preference,
    pub labor: LaborSupply,
    pub adjustment: AdjustmentCost,
    pub settlement: DeathSettlement,
    /// Enables the extra deposit regime financing withdrawals out of
    /// consumption at the liquid lower bound.
    pub boundary_withdrawal: bool,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            discount_rates: vec![0.05],
            type_shares: vec![1.0],
            liquid_return: 0.02,
            borrow_wedge: 0.06,
            illiquid_return: 0.05,
            return_vol: 0.0,
            death_rate: 0.0,
            wage: 1.0,
            transfer: 0.0,
            preference: Preference::Crra { gamma: 2.0 },
            labor: LaborSupply::Exogenous,
            adjustment: AdjustmentCost::default(),
            settlement: DeathSettlement::default(),
            boundary_withdrawal: false,
        }
    }
}

impl ModelParams {
    pub fn builder() -> ModelParamsBuilder {
        ModelParamsBuilder::default()
    }

    /// Number of permanent preference types.
    #[inline]
    pub fn n_types(&self) -> usize {
        self.discount_rates.len()
    }

    /// Liquid return inclusive of the borrowing wedge.
    #[inline]
    pub fn liquid_return_at(&self, b: f64) -> f64 {
        if b < 0.0 {
            self.liquid_return + self.borrow_wedge
        } else {
            self.liquid_return
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SolveError> {
        if self.discount_rates.is_empty() {
            return Err(SolveError::InvalidInput(
                "at least one discount rate is required".to_string(),
            ));
        }
        if self.discount_rates.iter().any(|&r| !(r > 0.0)) {
            return Err(SolveError::InvalidInput(
                "discount rates must be positive".to_string(),
            ));
        }
        if self.type_shares.len() != self.discount_rates.len() {
            return Err(SolveError::InvalidInput(format!(
                "{} type shares for {} discount rates",
                self.type_shares.len(),
                self.discount_rates.len()
            )));
        }
        if self.type_shares.iter().any(|&s| !(s > 0.0)) {
            return Err(SolveError::InvalidInput(
                "type shares must be positive".to_string(),
            ));
        }
        let share_sum: f64 = self.type_shares.iter().sum();
        if (share_sum - 1.0).abs() > 1e-8 {
            return Err(SolveError::InvalidInput(format!(
                "type shares sum to {share_sum}, expected 1"
            )));
        }
        if !(self.wage > 0.0) {
            return Err(SolveError::InvalidInput(
                "wage must be positive".to_string(),
            ));
        }
        if self.borrow_wedge < 0.0 || self.death_rate < 0.0 || self.return_vol < 0.0 {
            return Err(SolveError::InvalidInput(
                "borrow wedge, death rate and return volatility must be non-negative".to_string(),
            ));
        }
        let adj = &self.adjustment;
        if adj.chi0 < 0.0 || !(adj.chi1 > 0.0) || !(adj.chi2 > 1.0) || !(adj.a_floor > 0.0) {
            return Err(SolveError::InvalidInput(
                "adjustment cost requires chi0 >= 0, chi1 > 0, chi2 > 1, a_floor > 0".to_string(),
            ));
        }
        match self.preference {
            Preference::Crra { gamma } => {
                if !(gamma > 0.0) {
                    return Err(SolveError::InvalidInput(
                        "risk aversion must be positive".to_string(),
                    ));
                }
            }
            Preference::Sdu { risk_aversion } => {
                if !(risk_aversion > 0.0) || (risk_aversion - 1.0).abs() < 1e-12 {
                    return Err(SolveError::InvalidInput(
                        "recursive utility requires positive risk aversion different from one"
                            .to_string(),
                    ));
                }
                if self.labor.is_endogenous() {
                    return Err(SolveError::InvalidInput(
                        "endogenous labor is only supported with CRRA preferences".to_string(),
                    ));
                }
            }
        }
        if let LaborSupply::Endogenous { frisch, disutility } = self.labor {
            if !(frisch > 0.0) || !(disutility > 0.0) {
                return Err(SolveError::InvalidInput(
                    "labor supply requires positive Frisch elasticity and disutility".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Fluent construction of [`ModelParams`] with validation on `build`.
#[derive(Debug, Clone, Default)]
pub struct ModelParamsBuilder {
    params: ModelParams,
}

impl ModelParamsBuilder {
    /// Single preference type with the given discount rate.
    #[inline]
    pub fn discount_rate(mut self, rho: f64) -> Self {
        self.params.discount_rates = vec![rho];
        self.params.type_shares = vec![1.0];
        self
    }

    /// Heterogeneous discount rates; shares default to equal weights.
    pub fn discount_rates(mut self, rates: Vec<f64>) -> Self {
        let n = rates.len().max(1);
        self.params.discount_rates = rates;
        self.params.type_shares = vec![1.0 / n as f64; n];
        self
    }

    pub fn type_shares(mut self, shares: Vec<f64>) -> Self {
        self.params.type_shares = shares;
        self
    }

    #[inline]
    pub fn liquid_return(mut self, rb: f64) -> Self {
        self.params.liquid_return = rb;
        self
    }

    #[inline]
    pub fn borrow_wedge(mut self, wedge: f64) -> Self {
        self.params.borrow_wedge = wedge;
        self
    }

    #[inline]
    pub fn illiquid_return(mut self, ra: f64) -> Self {
        self.params.illiquid_return = ra;
        self
    }

    #[inline]
    pub fn return_volatility(mut self, sigma: f64) -> Self {
        self.params.return_vol = sigma;
        self
    }

    #[inline]
    pub fn death_rate(mut self, eta: f64) -> Self {
        self.params.death_rate = eta;
        self
    }

    #[inline]
    pub fn wage(mut self, wage: f64) -> Self {
        self.params.wage = wage;
        self
    }

    #[inline]
    pub fn transfer(mut self, transfer: f64) -> Self {
        self.params.transfer = transfer;
        self
    }

    #[inline]
    pub fn preference(mut self, preference: Preference) -> Self {
        self.params.preference = preference;
        self
    }

    #[inline]
    pub fn labor(mut self, labor: LaborSupply) -> Self {
        self.params.labor = labor;
        self
    }

    #[inline]
    pub fn adjustment(mut self, adjustment: AdjustmentCost) -> Self {
        self.params.adjustment = adjustment;
        self
    }

    #[inline]
    pub fn settlement(mut self, settlement: DeathSettlement) -> Self {
        self.params.settlement = settlement;
        self
    }

    #[inline]
    pub fn boundary_withdrawal(mut self, enabled: bool) -> Self {
        self.params.boundary_withdrawal = enabled;
        self
    }

    /// Validates and returns the parameter set.
    pub fn build(self) -> Result<ModelParams, SolveError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn builder_validates_type_shares() {
        let err = ModelParams::builder()
            .discount_rates(vec![0.04, 0.06])
            .type_shares(vec![0.9, 0.2])
            .build()
            .unwrap_err();
        assert!(matches!(err, SolveError::InvalidInput(_)));

        let params = ModelParams::builder()
            .discount_rates(vec![0.04, 0.06])
            .build()
            .unwrap();
        assert_eq!(params.n_types(), 2);
        assert_relative_eq!(params.type_shares[0], 0.5);
    }

    #[test]
    fn rejects_unit_risk_aversion_under_recursive_utility() {
        let err = ModelParams::builder()
            .preference(Preference::Sdu { risk_aversion: 1.0 })
            .build()
            .unwrap_err();
        assert!(matches!(err, SolveError::InvalidInput(_)));
    }

    #[test]
    fn rejects_labor_choice_under_recursive_utility() {
        let err = ModelParams::builder()
            .preference(Preference::Sdu { risk_aversion: 4.0 })
            .labor(LaborSupply::Endogenous {
                frisch: 0.5,
                disutility: 2.0,
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, SolveError::InvalidInput(_)));
    }

    #[test]
    fn borrowing_wedge_applies_below_zero() {
        let params = ModelParams::default();
        assert_relative_eq!(params.liquid_return_at(1.0), 0.02);
        assert_relative_eq!(params.liquid_return_at(-1.0), 0.08);
    }

    #[test]
    fn adjustment_cost_kink_produces_inaction() {
        let adj = AdjustmentCost::default();
        // ratio inside [1 - chi0, 1 + chi0] sits in the kink
        assert_eq!(adj.first_order_deposit(1.0, 2.0), 0.0);
        assert!(adj.first_order_deposit(1.2, 2.0) > 0.0);
        assert!(adj.first_order_deposit(0.8, 2.0) < 0.0);
    }

    #[test]
    fn first_order_deposit_inverts_marginal_cost() {
        let adj = AdjustmentCost::default();
        for &ratio in &[0.7, 0.9, 1.1, 1.6] {
            let d = adj.first_order_deposit(ratio, 3.0);
            if d != 0.0 {
                assert_relative_eq!(1.0 + adj.marginal(d, 3.0), ratio, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn cost_is_even_in_the_deposit() {
        let adj = AdjustmentCost::default();
        assert_relative_eq!(adj.cost(0.3, 2.0), adj.cost(-0.3, 2.0), epsilon = 1e-14);
        assert_eq!(adj.cost(0.0, 2.0), 0.0);
    }
}
