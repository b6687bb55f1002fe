//! Monte Carlo estimate of effective dose.
//!
//! Each draw samples the base fraction, then every multiplier in id order,
//! from one SplitMix64 stream seeded with the caller's seed. The effective
//! fraction `base * product(multipliers)` is clamped to `[0, 1]` and scaled by
//! the dose.

use crate::distribution::ResolvedDistribution;
use crate::rng::SplitMix64;
use crate::snapshot::CompartmentModel;
use crate::{Distribution, Error, Percentiles, Result};

/// Compose a bioavailability fraction from a base draw and multiplier draws
pub fn compose_bioavailability(base: f64, multipliers: &[f64]) -> f64 {
    let product = multipliers.iter().fold(base, |acc, m| acc * m);
    product.clamp(0.0, 1.0)
}

/// Linearly interpolated order statistic at index `p * (n - 1)`.
///
/// `sorted` must be non-empty and ascending.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    let last = sorted.len() - 1;
    let idx = p.clamp(0.0, 1.0) * last as f64;
    let lo = idx.floor() as usize;
    let hi = idx.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = idx - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Simulate the effective dose distribution.
///
/// Returns `Ok(None)` when the dose or base distribution is unknown. Malformed
/// distributions are [`Error::Distribution`]; callers treat that compartment
/// as unresolved.
pub fn simulate_effective_dose(
    dose_mg: Option<f64>,
    base: Option<&Distribution>,
    multipliers: &[Distribution],
    n: u32,
    seed: u64,
) -> Result<Option<Percentiles>> {
    let (dose_mg, base) = match (dose_mg, base) {
        (Some(d), Some(b)) => (d, b),
        _ => return Ok(None),
    };

    if n == 0 {
        return Err(Error::Simulation("Sample count must be at least 1.".into()));
    }
    if !dose_mg.is_finite() || dose_mg < 0.0 {
        return Err(Error::Simulation(format!(
            "Dose must be a finite non-negative number (got {})",
            dose_mg
        )));
    }

    let base = ResolvedDistribution::try_from(base)?;

    let mut ordered: Vec<&Distribution> = multipliers.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    let resolved = ordered
        .into_iter()
        .map(ResolvedDistribution::try_from)
        .collect::<Result<Vec<_>>>()?;

    let mut rng = SplitMix64::new(seed);
    let mut draws = vec![0.0f64; resolved.len()];
    let mut samples = Vec::with_capacity(n as usize);

    for _ in 0..n {
        let b = base.sample(&mut rng);
        for (slot, dist) in draws.iter_mut().zip(&resolved) {
            *slot = dist.sample(&mut rng);
        }
        samples.push(dose_mg * compose_bioavailability(b, &draws));
    }

    samples.sort_by(|a, b| a.total_cmp(b));

    Ok(Some(Percentiles {
        p05: percentile(&samples, 0.05),
        p50: percentile(&samples, 0.50),
        p95: percentile(&samples, 0.95),
    }))
}

/// Simulate one snapshot compartment, honouring its value-type gating
pub fn simulate_compartment(
    dose_mg: Option<f64>,
    model: &CompartmentModel,
    n: u32,
    seed: u64,
) -> Result<Option<Percentiles>> {
    let multipliers = model.simulation_multipliers();
    simulate_effective_dose(dose_mg, model.simulation_base(), &multipliers, n, seed)
}
