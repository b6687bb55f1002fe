//! Core domain types for the dose-estimation core.
//!
//! This module defines the fundamental types used throughout the system:
//! - Uncertainty distributions and their parameter families
//! - Compartments and parsed dose quantities
//! - Reference data (substances, formulations, modifier specs, vials)
//! - Cycle instances and administration events

use crate::snapshot::CanonicalModelSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Distribution Types
// ============================================================================

/// What quantity a distribution describes
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Fraction,
    Multiplier,
    VolumeMlPerUnit,
    Other,
}

/// Parametric family of a distribution
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DistType {
    Point,
    Uniform,
    Triangular,
    BetaPert,
    Lognormal,
}

/// An uncertainty distribution.
///
/// Parameter meaning depends on `dist_type`:
/// - `point`: `p1` is the value
/// - `uniform`: `min_value..=max_value`
/// - `triangular` / `beta_pert`: `p1` = min, `p2` = mode, `p3` = max
/// - `lognormal`: `p1` = median, `p2` = log-sigma, optional `min_value`/`max_value` clamp
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Distribution {
    pub id: String,
    pub value_type: ValueType,
    pub dist_type: DistType,
    #[serde(default)]
    pub p1: Option<f64>,
    #[serde(default)]
    pub p2: Option<f64>,
    #[serde(default)]
    pub p3: Option<f64>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub units: Option<String>,
}

impl Distribution {
    /// A `point` distribution with a single value
    pub fn point(id: impl Into<String>, value_type: ValueType, value: f64) -> Self {
        Self {
            id: id.into(),
            value_type,
            dist_type: DistType::Point,
            p1: Some(value),
            p2: None,
            p3: None,
            min_value: None,
            max_value: None,
            units: None,
        }
    }

    /// A three-point distribution (`triangular` or `beta_pert`)
    pub fn three_point(
        id: impl Into<String>,
        value_type: ValueType,
        dist_type: DistType,
        min: f64,
        mode: f64,
        max: f64,
    ) -> Self {
        Self {
            id: id.into(),
            value_type,
            dist_type,
            p1: Some(min),
            p2: Some(mode),
            p3: Some(max),
            min_value: None,
            max_value: None,
            units: None,
        }
    }

    /// A `uniform` distribution on `[min, max]`
    pub fn uniform(id: impl Into<String>, value_type: ValueType, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            value_type,
            dist_type: DistType::Uniform,
            p1: None,
            p2: None,
            p3: None,
            min_value: Some(min),
            max_value: Some(max),
            units: None,
        }
    }

    /// A `lognormal` distribution given its median and log-sigma
    pub fn lognormal(
        id: impl Into<String>,
        value_type: ValueType,
        median: f64,
        log_sigma: f64,
    ) -> Self {
        Self {
            id: id.into(),
            value_type,
            dist_type: DistType::Lognormal,
            p1: Some(median),
            p2: Some(log_sigma),
            p3: None,
            min_value: None,
            max_value: None,
            units: None,
        }
    }
}

// ============================================================================
// Compartments
// ============================================================================

/// A physiological target with its own uncertainty model
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Compartment {
    Systemic,
    Cns,
}

impl Compartment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compartment::Systemic => "systemic",
            Compartment::Cns => "cns",
        }
    }
}

impl fmt::Display for Compartment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compartment selector used by substances and modifier specs
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompartmentScope {
    #[default]
    Systemic,
    Cns,
    Both,
}

impl CompartmentScope {
    /// Compartments implied by a substance's default target, in simulation order
    pub fn compartments(&self) -> Vec<Compartment> {
        match self {
            CompartmentScope::Systemic => vec![Compartment::Systemic],
            CompartmentScope::Cns => vec![Compartment::Cns],
            CompartmentScope::Both => vec![Compartment::Systemic, Compartment::Cns],
        }
    }

    /// Whether a spec scoped to `self` applies to `compartment`
    pub fn applies_to(&self, compartment: Compartment) -> bool {
        match self {
            CompartmentScope::Both => true,
            CompartmentScope::Systemic => compartment == Compartment::Systemic,
            CompartmentScope::Cns => compartment == Compartment::Cns,
        }
    }
}

// ============================================================================
// Parsed Quantities
// ============================================================================

/// Kind of quantity recognized in free-text dose input
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuantityKind {
    Mass,
    Volume,
    DeviceUnits,
    Iu,
    Other,
}

/// A typed quantity parsed from text like `"0.3mL"` or `"2 sprays"`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ParsedQuantity {
    pub kind: QuantityKind,
    pub value: f64,
    /// Unit token exactly as typed
    pub unit: String,
    pub normalized_unit: String,
}

/// 5th/50th/95th percentile of simulated effective dose (mg)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Percentiles {
    pub p05: f64,
    pub p50: f64,
    pub p95: f64,
}

// ============================================================================
// Reference Data
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Substance {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub target_compartment_default: CompartmentScope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Formulation {
    pub id: String,
    pub substance_id: String,
    pub route_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub name: String,
}

/// A formulation resolved together with its substance, route and device
#[derive(Clone, Debug)]
pub struct FormulationContext {
    pub formulation: Formulation,
    pub substance: Option<Substance>,
    pub route: Option<Route>,
    pub device: Option<Device>,
}

impl FormulationContext {
    /// Compartments to simulate; substances with no record default to systemic
    pub fn compartments(&self) -> Vec<Compartment> {
        self.substance
            .as_ref()
            .map(|s| s.target_compartment_default)
            .unwrap_or_default()
            .compartments()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormulationComponent {
    pub id: String,
    pub formulation_id: String,
    pub name: String,
    /// Fallback multiplier when no component-specific spec matches
    #[serde(default)]
    pub modifier_dist_id: Option<String>,
}

/// Base bioavailability for a substance, route and compartment
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BioavailabilitySpec {
    pub substance_id: String,
    pub route_id: String,
    pub compartment: Compartment,
    pub base_fraction_dist_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FormulationModifierSpec {
    pub formulation_id: String,
    pub compartment: CompartmentScope,
    pub multiplier_dist_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentModifierSpec {
    pub formulation_component_id: String,
    pub compartment: CompartmentScope,
    pub multiplier_dist_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceCalibration {
    pub device_id: String,
    pub route_id: String,
    /// Normalized device-unit label, e.g. `spray`
    pub unit_label: String,
    pub volume_ml_per_unit_dist_id: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VialStatus {
    Planned,
    #[default]
    Active,
    Closed,
    Discarded,
}

/// A physical vial of a formulation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vial {
    pub id: String,
    pub formulation_id: String,
    #[serde(default)]
    pub status: VialStatus,
    pub content_mass_value: f64,
    pub content_mass_unit: String,
    #[serde(default)]
    pub total_volume_value: Option<f64>,
    #[serde(default)]
    pub total_volume_unit: Option<String>,
    #[serde(default)]
    pub concentration_mg_per_ml: Option<f64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub volume_ml_per_unit_override_dist_id: Option<String>,
}

/// Per-substance override of the profile's cycle defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CycleRule {
    pub substance_id: String,
    pub gap_days_to_suggest_new_cycle: f64,
    #[serde(default = "default_true")]
    pub auto_start_first_cycle: bool,
}

fn default_true() -> bool {
    true
}

/// Profile-level defaults consumed by the recorder
#[derive(Clone, Debug, PartialEq)]
pub struct ProfileDefaults {
    pub default_simulation_n: u32,
    pub cycle_gap_default_days: f64,
}

impl Default for ProfileDefaults {
    fn default() -> Self {
        Self {
            default_simulation_n: 2048,
            cycle_gap_default_days: 7.0,
        }
    }
}

// ============================================================================
// Cycles and Events
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Active,
    Completed,
    Abandoned,
}

/// An on/off administration period for one substance
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CycleInstance {
    pub id: Uuid,
    pub substance_id: String,
    /// 1-based, strictly increasing per substance, never reused
    pub cycle_number: u32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub status: CycleStatus,
}

/// One append-only administration record
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdministrationEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub formulation_id: String,
    pub substance_id: Option<String>,
    pub vial_id: Option<String>,
    pub cycle_instance_id: Option<Uuid>,
    pub input_text: String,
    pub input_value: f64,
    pub input_unit: String,
    pub input_kind: QuantityKind,
    pub dose_mass_mg: Option<f64>,
    pub dose_volume_ml: Option<f64>,
    pub eff_systemic_p05_mg: Option<f64>,
    pub eff_systemic_p50_mg: Option<f64>,
    pub eff_systemic_p95_mg: Option<f64>,
    pub eff_cns_p05_mg: Option<f64>,
    pub eff_cns_p50_mg: Option<f64>,
    pub eff_cns_p95_mg: Option<f64>,
    pub mc_n: Option<u32>,
    pub mc_seed: Option<u64>,
    pub model_snapshot: CanonicalModelSnapshot,
    pub cost_usd: Option<f64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AdministrationEvent {
    /// Simulated percentiles for a compartment, if that compartment was simulated
    pub fn percentiles(&self, compartment: Compartment) -> Option<Percentiles> {
        let (p05, p50, p95) = match compartment {
            Compartment::Systemic => (
                self.eff_systemic_p05_mg,
                self.eff_systemic_p50_mg,
                self.eff_systemic_p95_mg,
            ),
            Compartment::Cns => (self.eff_cns_p05_mg, self.eff_cns_p50_mg, self.eff_cns_p95_mg),
        };
        Some(Percentiles {
            p05: p05?,
            p50: p50?,
            p95: p95?,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
