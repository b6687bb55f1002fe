//! Parametric uncertainty distributions.
//!
//! A [`Distribution`] row is validated into a [`ResolvedDistribution`] once,
//! after which sampling cannot fail. Sampling algorithms:
//! - normal draws use Box-Muller (one normal per two uniforms, no caching)
//! - Gamma(k >= 1) uses Marsaglia-Tsang squeeze-free acceptance in log space
//! - Beta(a, b) is `X / (X + Y)` with `X ~ Gamma(a)`, `Y ~ Gamma(b)`
//!
//! The number and order of uniform draws per family is fixed; see `rng`.

use crate::rng::unit_f64;
use crate::{DistType, Distribution, Error, Result};
use rand::RngCore;
use std::f64::consts::PI;

/// PERT shape weight on the mode
const PERT_LAMBDA: f64 = 4.0;

/// Lower bound substituted for a zero uniform before taking a logarithm
const LOG_FLOOR: f64 = 1e-12;

/// A distribution whose parameters have been checked
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResolvedDistribution {
    Point(f64),
    Uniform {
        min: f64,
        max: f64,
    },
    Triangular {
        min: f64,
        mode: f64,
        max: f64,
    },
    BetaPert {
        min: f64,
        mode: f64,
        max: f64,
    },
    Lognormal {
        median: f64,
        log_sigma: f64,
        floor: Option<f64>,
        ceiling: Option<f64>,
    },
}

impl TryFrom<&Distribution> for ResolvedDistribution {
    type Error = Error;

    fn try_from(dist: &Distribution) -> Result<Self> {
        let id = dist.id.as_str();
        for (name, value) in [
            ("p1", dist.p1),
            ("p2", dist.p2),
            ("p3", dist.p3),
            ("min_value", dist.min_value),
            ("max_value", dist.max_value),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(Error::Distribution(format!(
                        "{}: {} must be finite (got {})",
                        id, name, v
                    )));
                }
            }
        }

        let resolved = match dist.dist_type {
            DistType::Point => ResolvedDistribution::Point(require(id, "point", "p1", dist.p1)?),
            DistType::Uniform => {
                let min = require(id, "uniform", "min_value", dist.min_value)?;
                let max = require(id, "uniform", "max_value", dist.max_value)?;
                if min > max {
                    return Err(Error::Distribution(format!(
                        "{}: uniform requires min_value <= max_value",
                        id
                    )));
                }
                ResolvedDistribution::Uniform { min, max }
            }
            DistType::Triangular | DistType::BetaPert => {
                let family = if dist.dist_type == DistType::Triangular {
                    "triangular"
                } else {
                    "beta_pert"
                };
                let min = require(id, family, "p1", dist.p1)?;
                let mode = require(id, family, "p2", dist.p2)?;
                let max = require(id, family, "p3", dist.p3)?;
                if !(min <= mode && mode <= max) {
                    return Err(Error::Distribution(format!(
                        "{}: {} parameters must satisfy min <= mode <= max",
                        id, family
                    )));
                }
                if dist.dist_type == DistType::Triangular {
                    ResolvedDistribution::Triangular { min, mode, max }
                } else {
                    ResolvedDistribution::BetaPert { min, mode, max }
                }
            }
            DistType::Lognormal => {
                let median = require(id, "lognormal", "p1 (median)", dist.p1)?;
                let log_sigma = require(id, "lognormal", "p2 (log_sigma)", dist.p2)?;
                if median <= 0.0 {
                    return Err(Error::Distribution(format!(
                        "{}: lognormal median must be > 0",
                        id
                    )));
                }
                if log_sigma < 0.0 {
                    return Err(Error::Distribution(format!(
                        "{}: lognormal log_sigma must be >= 0",
                        id
                    )));
                }
                if let (Some(lo), Some(hi)) = (dist.min_value, dist.max_value) {
                    if lo > hi {
                        return Err(Error::Distribution(format!(
                            "{}: lognormal clamp requires min_value <= max_value",
                            id
                        )));
                    }
                }
                ResolvedDistribution::Lognormal {
                    median,
                    log_sigma,
                    floor: dist.min_value,
                    ceiling: dist.max_value,
                }
            }
        };

        Ok(resolved)
    }
}

fn require(id: &str, family: &str, name: &str, value: Option<f64>) -> Result<f64> {
    value.ok_or_else(|| Error::Distribution(format!("{}: {} requires {}", id, family, name)))
}

impl ResolvedDistribution {
    /// Draw one value
    pub fn sample<R: RngCore + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            ResolvedDistribution::Point(v) => v,

            ResolvedDistribution::Uniform { min, max } => min + unit_f64(rng) * (max - min),

            ResolvedDistribution::Triangular { min, mode, max } => {
                let u = unit_f64(rng);
                if max == min {
                    return min;
                }
                let c = (mode - min) / (max - min);
                if u < c {
                    min + (u * (max - min) * (mode - min)).sqrt()
                } else {
                    max - ((1.0 - u) * (max - min) * (max - mode)).sqrt()
                }
            }

            ResolvedDistribution::BetaPert { min, mode, max } => {
                if max == min {
                    return min;
                }
                let range = max - min;
                let alpha = 1.0 + PERT_LAMBDA * (mode - min) / range;
                let beta = 1.0 + PERT_LAMBDA * (max - mode) / range;
                min + beta_draw(alpha, beta, rng) * range
            }

            ResolvedDistribution::Lognormal {
                median,
                log_sigma,
                floor,
                ceiling,
            } => {
                let z = standard_normal(rng);
                let mut v = (median.ln() + log_sigma * z).exp();
                if let Some(lo) = floor {
                    v = v.max(lo);
                }
                if let Some(hi) = ceiling {
                    v = v.min(hi);
                }
                v
            }
        }
    }

    /// Closed-form mean (ignores any lognormal clamp)
    pub fn mean(&self) -> f64 {
        match *self {
            ResolvedDistribution::Point(v) => v,
            ResolvedDistribution::Uniform { min, max } => (min + max) / 2.0,
            ResolvedDistribution::Triangular { min, mode, max } => (min + mode + max) / 3.0,
            ResolvedDistribution::BetaPert { min, mode, max } => {
                (min + PERT_LAMBDA * mode + max) / (PERT_LAMBDA + 2.0)
            }
            ResolvedDistribution::Lognormal {
                median, log_sigma, ..
            } => median * (0.5 * log_sigma * log_sigma).exp(),
        }
    }
}

/// Validate a distribution's parameters without sampling
pub fn validate(dist: &Distribution) -> Result<()> {
    ResolvedDistribution::try_from(dist).map(|_| ())
}

/// Draw one value from `dist`
pub fn sample<R: RngCore + ?Sized>(dist: &Distribution, rng: &mut R) -> Result<f64> {
    Ok(ResolvedDistribution::try_from(dist)?.sample(rng))
}

/// Closed-form mean of `dist`
pub fn mean(dist: &Distribution) -> Result<f64> {
    Ok(ResolvedDistribution::try_from(dist)?.mean())
}

fn standard_normal<R: RngCore + ?Sized>(rng: &mut R) -> f64 {
    let mut u1 = unit_f64(rng);
    if u1 <= 0.0 {
        u1 = LOG_FLOOR;
    }
    let u2 = unit_f64(rng);
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Gamma(shape, 1) for shape >= 1
fn gamma_draw<R: RngCore + ?Sized>(shape: f64, rng: &mut R) -> f64 {
    debug_assert!(shape >= 1.0);
    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        let z = standard_normal(rng);
        let v = (1.0 + c * z).powi(3);
        if v <= 0.0 {
            continue;
        }

        let mut u = unit_f64(rng);
        if u <= 0.0 {
            u = LOG_FLOOR;
        }

        if u.ln() < 0.5 * z * z + d - d * v + d * v.ln() {
            return d * v;
        }
    }
}

/// Beta(alpha, beta) for alpha, beta >= 1 (always true for PERT shapes)
fn beta_draw<R: RngCore + ?Sized>(alpha: f64, beta: f64, rng: &mut R) -> f64 {
    let x = gamma_draw(alpha, rng);
    let y = gamma_draw(beta, rng);
    x / (x + y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::SplitMix64;
    use crate::ValueType;

    fn sample_mean(dist: &Distribution, n: usize, seed: u64) -> f64 {
        let resolved = ResolvedDistribution::try_from(dist).unwrap();
        let mut rng = SplitMix64::new(seed);
        (0..n).map(|_| resolved.sample(&mut rng)).sum::<f64>() / n as f64
    }

    #[test]
    fn test_point_consumes_no_randomness() {
        let dist = Distribution::point("p", ValueType::Fraction, 0.42);
        let mut rng = SplitMix64::new(5);
        let before = rng.clone();
        assert_eq!(sample(&dist, &mut rng).unwrap(), 0.42);
        assert_eq!(rng, before);
    }

    #[test]
    fn test_closed_form_means() {
        let pert = Distribution::three_point("b", ValueType::Fraction, DistType::BetaPert, 0.1, 0.2, 0.7);
        assert!((mean(&pert).unwrap() - (0.1 + 4.0 * 0.2 + 0.7) / 6.0).abs() < 1e-12);

        let tri = Distribution::three_point("t", ValueType::Fraction, DistType::Triangular, 0.0, 0.3, 0.9);
        assert!((mean(&tri).unwrap() - 0.4).abs() < 1e-12);

        let uni = Distribution::uniform("u", ValueType::Multiplier, 0.8, 1.2);
        assert!((mean(&uni).unwrap() - 1.0).abs() < 1e-12);

        let logn = Distribution::lognormal("l", ValueType::Multiplier, 2.0, 0.5);
        assert!((mean(&logn).unwrap() - 2.0 * (0.125f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_stays_in_bounds() {
        let dist = Distribution::uniform("u", ValueType::Multiplier, 0.8, 1.2);
        let mut rng = SplitMix64::new(11);
        for _ in 0..5_000 {
            let v = sample(&dist, &mut rng).unwrap();
            assert!((0.8..=1.2).contains(&v));
        }
    }

    #[test]
    fn test_triangular_bounds_and_mean() {
        let dist = Distribution::three_point("t", ValueType::Fraction, DistType::Triangular, 0.1, 0.2, 0.6);
        let resolved = ResolvedDistribution::try_from(&dist).unwrap();
        let mut rng = SplitMix64::new(3);
        for _ in 0..5_000 {
            let v = resolved.sample(&mut rng);
            assert!((0.1..=0.6).contains(&v));
        }
        let m = sample_mean(&dist, 40_000, 17);
        assert!((m - resolved.mean()).abs() < 0.01, "mean {}", m);
    }

    #[test]
    fn test_beta_pert_bounds_and_mean() {
        let dist = Distribution::three_point("b", ValueType::Fraction, DistType::BetaPert, 0.1, 0.3, 0.6);
        let resolved = ResolvedDistribution::try_from(&dist).unwrap();
        let mut rng = SplitMix64::new(8);
        for _ in 0..5_000 {
            let v = resolved.sample(&mut rng);
            assert!((0.1..=0.6).contains(&v));
        }
        let m = sample_mean(&dist, 40_000, 23);
        assert!((m - resolved.mean()).abs() < 0.01, "mean {}", m);
    }

    #[test]
    fn test_beta_pert_degenerate_returns_min() {
        let dist = Distribution::three_point("b", ValueType::Fraction, DistType::BetaPert, 0.5, 0.5, 0.5);
        let mut rng = SplitMix64::new(1);
        assert_eq!(sample(&dist, &mut rng).unwrap(), 0.5);
    }

    #[test]
    fn test_lognormal_median_and_clamp() {
        let dist = Distribution::lognormal("l", ValueType::Multiplier, 1.0, 0.25);
        let resolved = ResolvedDistribution::try_from(&dist).unwrap();
        let mut rng = SplitMix64::new(31);
        let mut draws: Vec<f64> = (0..20_001).map(|_| resolved.sample(&mut rng)).collect();
        draws.sort_by(|a, b| a.total_cmp(b));
        assert!((draws[10_000] - 1.0).abs() < 0.02);

        let mut clamped = dist.clone();
        clamped.min_value = Some(0.9);
        clamped.max_value = Some(1.1);
        let mut rng = SplitMix64::new(31);
        for _ in 0..2_000 {
            let v = sample(&clamped, &mut rng).unwrap();
            assert!((0.9..=1.1).contains(&v));
        }
    }

    #[test]
    fn test_zero_sigma_lognormal_is_constant() {
        let dist = Distribution::lognormal("l", ValueType::Multiplier, 1.5, 0.0);
        let mut rng = SplitMix64::new(2);
        for _ in 0..10 {
            assert!((sample(&dist, &mut rng).unwrap() - 1.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_invalid_parameters_fail() {
        let bad_order = Distribution::three_point("t", ValueType::Fraction, DistType::Triangular, 0.5, 0.2, 0.9);
        assert!(matches!(validate(&bad_order), Err(Error::Distribution(_))));

        let mut missing = Distribution::point("p", ValueType::Fraction, 1.0);
        missing.p1 = None;
        assert!(matches!(validate(&missing), Err(Error::Distribution(_))));

        let bad_uniform = Distribution::uniform("u", ValueType::Multiplier, 2.0, 1.0);
        assert!(matches!(validate(&bad_uniform), Err(Error::Distribution(_))));

        let bad_median = Distribution::lognormal("l", ValueType::Multiplier, 0.0, 0.1);
        assert!(matches!(validate(&bad_median), Err(Error::Distribution(_))));

        let bad_sigma = Distribution::lognormal("l", ValueType::Multiplier, 1.0, -0.1);
        assert!(matches!(mean(&bad_sigma), Err(Error::Distribution(_))));

        let nan = Distribution::point("p", ValueType::Fraction, f64::NAN);
        assert!(matches!(validate(&nan), Err(Error::Distribution(_))));
    }

    #[test]
    fn test_same_seed_same_draws() {
        let dist = Distribution::three_point("b", ValueType::Fraction, DistType::BetaPert, 0.1, 0.2, 0.3);
        let mut a = SplitMix64::new(123_456_789);
        let mut b = SplitMix64::new(123_456_789);
        for _ in 0..100 {
            assert_eq!(
                sample(&dist, &mut a).unwrap().to_bits(),
                sample(&dist, &mut b).unwrap().to_bits()
            );
        }
    }
}
