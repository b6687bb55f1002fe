//! Canonical dose computation.
//!
//! Combines a parsed quantity with the active vial and device calibration to
//! produce a canonical mass (mg) and volume (mL). Either output may be unset
//! when the inputs do not determine it.

use crate::units::{to_canonical_mass_mg, to_canonical_volume_ml};
use crate::{Error, ParsedQuantity, QuantityKind, Result, Vial};
use serde::{Deserialize, Serialize};

/// Active-vial facts relevant to dose conversion, already in mg / mL
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VialDoseContext {
    pub content_mass_mg: Option<f64>,
    pub total_volume_ml: Option<f64>,
    pub concentration_mg_per_ml: Option<f64>,
}

impl VialDoseContext {
    /// Explicit concentration, or content mass over total volume when the
    /// volume is positive. Non-positive concentrations count as unknown.
    pub fn effective_concentration(&self) -> Option<f64> {
        let c = match self.concentration_mg_per_ml {
            Some(c) => Some(c),
            None => match (self.content_mass_mg, self.total_volume_ml) {
                (Some(mass), Some(vol)) if vol > 0.0 => Some(mass / vol),
                _ => None,
            },
        };
        c.filter(|c| c.is_finite() && *c > 0.0)
    }
}

impl Vial {
    /// Canonicalize the vial's stored amounts.
    ///
    /// Unparseable units leave the corresponding field unset rather than
    /// failing the event.
    pub fn dose_context(&self) -> VialDoseContext {
        let content_mass_mg = to_canonical_mass_mg(self.content_mass_value, &self.content_mass_unit)
            .map_err(|e| tracing::debug!("Vial {} content mass ignored: {}", self.id, e))
            .ok();

        let total_volume_ml = match (self.total_volume_value, self.total_volume_unit.as_deref()) {
            (Some(v), Some(unit)) => to_canonical_volume_ml(v, unit)
                .map_err(|e| tracing::debug!("Vial {} total volume ignored: {}", self.id, e))
                .ok(),
            _ => None,
        };

        VialDoseContext {
            content_mass_mg,
            total_volume_ml,
            concentration_mg_per_ml: self.concentration_mg_per_ml,
        }
    }
}

/// Canonical dose outputs
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDose {
    pub dose_mass_mg: Option<f64>,
    pub dose_volume_ml: Option<f64>,
}

/// Compute the canonical dose for a parsed quantity
///
/// - mass: mg from the unit, mL via concentration when known
/// - volume: mL from the unit, mg via concentration when known
/// - device units: mL = value x mean calibration volume; both unset without calibration
/// - IU / other: stored as typed, no canonical mass or volume
pub fn compute_dose(
    quantity: &ParsedQuantity,
    vial: Option<&VialDoseContext>,
    volume_ml_per_device_unit: Option<f64>,
) -> Result<CanonicalDose> {
    let value = quantity.value;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Dose(
            "Dose value must be a finite non-negative number.".into(),
        ));
    }

    let concentration = vial.and_then(VialDoseContext::effective_concentration);

    let dose = match quantity.kind {
        QuantityKind::Mass => {
            let mass = to_canonical_mass_mg(value, &quantity.normalized_unit)?;
            CanonicalDose {
                dose_mass_mg: Some(mass),
                dose_volume_ml: concentration.map(|c| mass / c),
            }
        }
        QuantityKind::Volume => {
            let volume = to_canonical_volume_ml(value, &quantity.normalized_unit)?;
            CanonicalDose {
                dose_mass_mg: concentration.map(|c| volume * c),
                dose_volume_ml: Some(volume),
            }
        }
        QuantityKind::DeviceUnits => match volume_ml_per_device_unit {
            Some(per_unit) if per_unit.is_finite() && per_unit > 0.0 => {
                let volume = value * per_unit;
                CanonicalDose {
                    dose_mass_mg: concentration.map(|c| volume * c),
                    dose_volume_ml: Some(volume),
                }
            }
            _ => CanonicalDose::default(),
        },
        QuantityKind::Iu | QuantityKind::Other => CanonicalDose::default(),
    };

    Ok(dose)
}

/// Share of the vial's cost consumed by one dose.
///
/// Prefers the mass fraction and falls back to the volume fraction. Unset when
/// the vial has no cost or neither fraction is computable.
pub fn event_cost_from_vial(
    dose: &CanonicalDose,
    vial: &VialDoseContext,
    vial_cost_usd: Option<f64>,
) -> Option<f64> {
    let cost = vial_cost_usd.filter(|c| c.is_finite() && *c >= 0.0)?;

    let mass_fraction = match (dose.dose_mass_mg, vial.content_mass_mg) {
        (Some(d), Some(total)) if d.is_finite() && d >= 0.0 && total > 0.0 => Some(d / total),
        _ => None,
    };
    let fraction = mass_fraction.or_else(|| match (dose.dose_volume_ml, vial.total_volume_ml) {
        (Some(d), Some(total)) if d.is_finite() && d >= 0.0 && total > 0.0 => Some(d / total),
        _ => None,
    })?;

    fraction.is_finite().then_some(cost * fraction)
}
