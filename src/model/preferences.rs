//! Flow utility, marginal-utility inversion, and the labor first-order
//! condition.
//!
//! Everything here is a pure function of scalars so the upwind scheme can
//! evaluate candidates without touching solver state. The recursive
//! (Duffie-Epstein) specification uses the unit-EIS normalized aggregator;
//! its consumption first-order condition needs the current value level, which
//! is why these helpers take `v` explicitly where relevant.

const LOG_UTILITY_TOL: f64 = 1e-12;

/// Positive floor applied to `(1 - risk_aversion) * v` so the aggregator and
/// its first-order condition stay defined while the value function is still
/// far from converged.
const SDU_VALUE_FLOOR: f64 = 1e-12;

/// CRRA flow utility; logarithmic at `gamma == 1`.
pub fn crra_utility(c: f64, gamma: f64) -> f64 {
    if (gamma - 1.0).abs() < LOG_UTILITY_TOL {
        c.ln()
    } else {
        c.powf(1.0 - gamma) / (1.0 - gamma)
    }
}

#[inline]
pub fn crra_marginal(c: f64, gamma: f64) -> f64 {
    c.powf(-gamma)
}

/// Consumption with marginal utility `m`.
#[inline]
pub fn crra_inverse_marginal(m: f64, gamma: f64) -> f64 {
    m.powf(-1.0 / gamma)
}

/// Convex disutility of hours: `disutility * l^(1 + 1/frisch) / (1 + 1/frisch)`.
pub fn labor_disutility(hours: f64, frisch: f64, disutility: f64) -> f64 {
    let exponent = 1.0 + 1.0 / frisch;
    disutility * hours.powf(exponent) / exponent
}

/// Hours satisfying `disutility * l^(1/frisch) = marginal_earnings`
/// (the intratemporal condition; `marginal_earnings = wage * y * Vb`).
#[inline]
pub fn labor_from_marginal(marginal_earnings: f64, frisch: f64, disutility: f64) -> f64 {
    (marginal_earnings / disutility).powf(frisch)
}

#[inline]
fn sdu_scale(v: f64, risk_aversion: f64) -> f64 {
    ((1.0 - risk_aversion) * v).max(SDU_VALUE_FLOOR)
}

/// Normalized Duffie-Epstein aggregator with unit elasticity of
/// intertemporal substitution:
/// `f(c, v) = rho * (1-ra) * v * [ln c - ln((1-ra) v) / (1-ra)]`.
pub fn sdu_aggregator(c: f64, v: f64, rho: f64, risk_aversion: f64) -> f64 {
    let scale = sdu_scale(v, risk_aversion);
    rho * scale * (c.ln() - scale.ln() / (1.0 - risk_aversion))
}

/// Consumption from the aggregator first-order condition `f_c = vb`:
/// `c = rho * (1-ra) * v / vb`.
#[inline]
pub fn sdu_consumption(vb: f64, v: f64, rho: f64, risk_aversion: f64) -> f64 {
    rho * sdu_scale(v, risk_aversion) / vb
}

/// Coefficient of the variance penalty `-(ra/2) sigma^2 a^2 Va^2 / ((1-ra) v)`
/// divided by `Va`, i.e. the pseudo-drift the penalty contributes per unit of
/// the first illiquid derivative.
#[inline]
pub fn sdu_penalty_drift(va: f64, v: f64, risk_aversion: f64, diffusion: f64) -> f64 {
    -(0.5 * risk_aversion) * diffusion * va / sdu_scale(v, risk_aversion)
}

/// Stationary value of consuming `c` forever, used as the initial guess.
pub fn stationary_value(c: f64, preference: crate::core::Preference, effective_rho: f64) -> f64 {
    match preference {
        crate::core::Preference::Crra { gamma } => crra_utility(c, gamma) / effective_rho,
        crate::core::Preference::Sdu { risk_aversion } => {
            c.powf(1.0 - risk_aversion) / (1.0 - risk_aversion)
        }
    }
}
