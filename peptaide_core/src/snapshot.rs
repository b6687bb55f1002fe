//! Canonical model snapshots.
//!
//! A snapshot records every distribution that feeds one event's simulation,
//! embedded by value. Multipliers are sorted by distribution id, missing flags
//! are a sorted set and compartments live in an ordered map, so the JSON
//! encoding (and therefore the seed) does not depend on lookup order.

use crate::distribution;
use crate::repository::{Inventory, ReferenceData};
use crate::{
    Compartment, Distribution, Error, FormulationContext, ParsedQuantity, QuantityKind, Result,
    ValueType, Vial,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Snapshot Types
// ============================================================================

/// Why a compartment cannot be simulated.
///
/// Declaration order matches the lexical order of the serialized names so the
/// derived `Ord` sorts them the same way as their strings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MissingFlag {
    MissingBaseBioavailabilityDistribution,
    MissingBaseBioavailabilitySpec,
    MissingMultiplierDistribution,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    VialOverride,
    DeviceCalibration,
}

/// Calibration used to convert device units to millilitres
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationRecord {
    pub source: CalibrationSource,
    pub unit_label: String,
    pub dist: Distribution,
    pub mean_volume_ml_per_unit: f64,
}

/// Resolved model for one compartment
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CompartmentModel {
    pub base_fraction: Option<Distribution>,
    /// Sorted by distribution id
    pub multipliers: Vec<Distribution>,
    pub missing: BTreeSet<MissingFlag>,
}

impl CompartmentModel {
    /// Base distribution usable for simulation (present and a `fraction`)
    pub fn simulation_base(&self) -> Option<&Distribution> {
        self.base_fraction
            .as_ref()
            .filter(|d| d.value_type == ValueType::Fraction)
    }

    /// Multipliers usable for simulation, in snapshot order
    pub fn simulation_multipliers(&self) -> Vec<Distribution> {
        self.multipliers
            .iter()
            .filter(|d| d.value_type == ValueType::Multiplier)
            .cloned()
            .collect()
    }
}

/// Everything that fed one event's simulation
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CanonicalModelSnapshot {
    pub version: u32,
    pub formulation_id: String,
    pub substance_id: Option<String>,
    pub route_id: Option<String>,
    pub device_id: Option<String>,
    pub calibration: Option<CalibrationRecord>,
    pub compartments: BTreeMap<Compartment, CompartmentModel>,
}

impl CanonicalModelSnapshot {
    /// Snapshot header with no compartments resolved
    pub fn bare(ctx: &FormulationContext) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            formulation_id: ctx.formulation.id.clone(),
            substance_id: ctx.substance.as_ref().map(|s| s.id.clone()),
            route_id: ctx.route.as_ref().map(|r| r.id.clone()),
            device_id: ctx.device.as_ref().map(|d| d.id.clone()),
            calibration: None,
            compartments: BTreeMap::new(),
        }
    }

    /// Deterministic JSON encoding used for seeding
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn compartment(&self, compartment: Compartment) -> Option<&CompartmentModel> {
        self.compartments.get(&compartment)
    }
}

// ============================================================================
// Calibration
// ============================================================================

/// Resolve the calibration for a device-units quantity.
///
/// Returns `Ok(None)` for any other kind of quantity. A per-vial override wins
/// over the device calibration. Anything that leaves a device-units dose
/// unconvertible is [`Error::CalibrationMissing`].
pub fn resolve_calibration<R, I>(
    reference: &R,
    inventory: &I,
    ctx: &FormulationContext,
    vial: Option<&Vial>,
    quantity: &ParsedQuantity,
) -> Result<Option<CalibrationRecord>>
where
    R: ReferenceData + ?Sized,
    I: Inventory + ?Sized,
{
    if quantity.kind != QuantityKind::DeviceUnits {
        return Ok(None);
    }

    let unit_label = quantity.normalized_unit.clone();
    let override_id = vial.and_then(|v| v.volume_ml_per_unit_override_dist_id.clone());

    let (dist_id, source) = match override_id {
        Some(id) => (id, CalibrationSource::VialOverride),
        None => {
            let device_id = ctx.formulation.device_id.as_deref().ok_or_else(|| {
                Error::CalibrationMissing(format!(
                    "formulation {} has no device; device-units input \"{}\" needs a per-vial override",
                    ctx.formulation.id, quantity.unit
                ))
            })?;
            let calibration = inventory
                .device_calibration(device_id, &ctx.formulation.route_id, &unit_label)?
                .ok_or_else(|| {
                    Error::CalibrationMissing(format!(
                        "no calibration for device {} on route {} with unit \"{}\"",
                        device_id, ctx.formulation.route_id, unit_label
                    ))
                })?;
            (
                calibration.volume_ml_per_unit_dist_id,
                CalibrationSource::DeviceCalibration,
            )
        }
    };

    let dist = reference
        .distributions_by_id(std::slice::from_ref(&dist_id))?
        .remove(&dist_id)
        .ok_or_else(|| {
            Error::CalibrationMissing(format!("calibration distribution {} not found", dist_id))
        })?;

    if dist.value_type != ValueType::VolumeMlPerUnit {
        return Err(Error::CalibrationMissing(format!(
            "calibration distribution {} is not volume_ml_per_unit",
            dist_id
        )));
    }

    let mean = distribution::mean(&dist).map_err(|e| {
        Error::CalibrationMissing(format!("calibration distribution {} is invalid: {}", dist_id, e))
    })?;

    tracing::debug!(
        "Calibration {} ({:?}) resolves {} to {} mL",
        dist_id,
        source,
        unit_label,
        mean
    );

    Ok(Some(CalibrationRecord {
        source,
        unit_label,
        dist,
        mean_volume_ml_per_unit: mean,
    }))
}

// ============================================================================
// Builder
// ============================================================================

struct PendingCompartment {
    compartment: Compartment,
    base_id: Option<String>,
    multiplier_ids: Vec<String>,
    missing: BTreeSet<MissingFlag>,
}

/// Build the snapshot for a formulation.
///
/// Missing reference data never fails the build: it is recorded as flags on
/// the affected compartment. Only collaborator errors propagate.
pub fn build_snapshot<R>(
    reference: &R,
    ctx: &FormulationContext,
    calibration: Option<CalibrationRecord>,
) -> Result<CanonicalModelSnapshot>
where
    R: ReferenceData + ?Sized,
{
    let formulation_id = ctx.formulation.id.as_str();
    let components = reference.formulation_components(formulation_id)?;
    let component_ids: Vec<String> = components.iter().map(|c| c.id.clone()).collect();

    let mut pending = Vec::new();
    for compartment in ctx.compartments() {
        let mut missing = BTreeSet::new();

        let base_spec = match (&ctx.substance, &ctx.route) {
            (Some(substance), Some(route)) => {
                reference.bioavailability_spec(&substance.id, &route.id, compartment)?
            }
            _ => None,
        };
        let base_id = base_spec.map(|s| s.base_fraction_dist_id);
        if base_id.is_none() {
            missing.insert(MissingFlag::MissingBaseBioavailabilitySpec);
        }

        let mut multiplier_ids: Vec<String> = reference
            .formulation_modifier_specs(formulation_id, compartment)?
            .into_iter()
            .filter(|s| s.compartment.applies_to(compartment))
            .map(|s| s.multiplier_dist_id)
            .collect();

        let component_specs = if component_ids.is_empty() {
            Vec::new()
        } else {
            reference.component_modifier_specs(&component_ids, compartment)?
        };

        for component in &components {
            let specific: Vec<String> = component_specs
                .iter()
                .filter(|s| {
                    s.formulation_component_id == component.id
                        && s.compartment.applies_to(compartment)
                })
                .map(|s| s.multiplier_dist_id.clone())
                .collect();

            if !specific.is_empty() {
                multiplier_ids.extend(specific);
            } else if let Some(default_id) = &component.modifier_dist_id {
                multiplier_ids.push(default_id.clone());
            }
        }

        pending.push(PendingCompartment {
            compartment,
            base_id,
            multiplier_ids,
            missing,
        });
    }

    let mut wanted: Vec<String> = pending
        .iter()
        .flat_map(|p| p.base_id.iter().chain(p.multiplier_ids.iter()).cloned())
        .collect();
    wanted.sort();
    wanted.dedup();
    let dists: HashMap<String, Distribution> = if wanted.is_empty() {
        HashMap::new()
    } else {
        reference.distributions_by_id(&wanted)?
    };

    let mut snapshot = CanonicalModelSnapshot::bare(ctx);
    snapshot.calibration = calibration;

    for p in pending {
        let mut missing = p.missing;

        let base_fraction = match &p.base_id {
            Some(id) => {
                let found = dists.get(id).cloned();
                if found.is_none() {
                    missing.insert(MissingFlag::MissingBaseBioavailabilityDistribution);
                }
                found
            }
            None => None,
        };

        let mut multipliers = Vec::with_capacity(p.multiplier_ids.len());
        for id in &p.multiplier_ids {
            match dists.get(id) {
                Some(d) => multipliers.push(d.clone()),
                None => {
                    missing.insert(MissingFlag::MissingMultiplierDistribution);
                }
            }
        }
        multipliers.sort_by(|a, b| a.id.cmp(&b.id));

        if !missing.is_empty() {
            tracing::debug!(
                "Formulation {} compartment {} missing {:?}",
                formulation_id,
                p.compartment,
                missing
            );
        }

        snapshot.compartments.insert(
            p.compartment,
            CompartmentModel {
                base_fraction,
                multipliers,
                missing,
            },
        );
    }

    Ok(snapshot)
}
