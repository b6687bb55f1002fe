//! Reference catalog of substances, formulations, distributions and vials.
//!
//! The catalog is a TOML document backing the reference-data and inventory
//! collaborators. A small demo catalog is built in for first runs and tests.

use crate::distribution;
use crate::repository::{Inventory, ReferenceData};
use crate::types::*;
use crate::units::{normalize_device_unit_label, to_canonical_mass_mg, to_canonical_volume_ml};
use crate::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Cached demo catalog, built once
static DEMO_CATALOG: Lazy<ReferenceCatalog> = Lazy::new(build_demo_catalog_internal);

/// All reference data and inventory rows
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceCatalog {
    pub substances: Vec<Substance>,
    pub routes: Vec<Route>,
    pub devices: Vec<Device>,
    pub formulations: Vec<Formulation>,
    pub components: Vec<FormulationComponent>,
    pub distributions: Vec<Distribution>,
    pub bioavailability: Vec<BioavailabilitySpec>,
    pub formulation_modifiers: Vec<FormulationModifierSpec>,
    pub component_modifiers: Vec<ComponentModifierSpec>,
    pub device_calibrations: Vec<DeviceCalibration>,
    pub vials: Vec<Vial>,
    pub cycle_rules: Vec<CycleRule>,
}

/// Get a reference to the cached demo catalog
pub fn get_demo_catalog() -> &'static ReferenceCatalog {
    &DEMO_CATALOG
}

/// Build a fresh, owned copy of the demo catalog
pub fn build_demo_catalog() -> ReferenceCatalog {
    build_demo_catalog_internal()
}

fn build_demo_catalog_internal() -> ReferenceCatalog {
    // ========================================================================
    // Substances, routes and devices
    // ========================================================================

    let substances = vec![Substance {
        id: "demo_peptide".into(),
        display_name: "Demo Peptide".into(),
        target_compartment_default: CompartmentScope::Systemic,
    }];

    let routes = vec![
        Route {
            id: "subq".into(),
            name: "Subcutaneous".into(),
        },
        Route {
            id: "intranasal".into(),
            name: "Intranasal".into(),
        },
    ];

    let devices = vec![Device {
        id: "nasal_spray".into(),
        name: "Metered nasal spray".into(),
    }];

    // ========================================================================
    // Formulations
    // ========================================================================

    let formulations = vec![
        Formulation {
            id: "demo_peptide_subq".into(),
            substance_id: "demo_peptide".into(),
            route_id: "subq".into(),
            device_id: None,
            name: "Demo Peptide (reconstituted, SubQ)".into(),
        },
        Formulation {
            id: "demo_peptide_nasal".into(),
            substance_id: "demo_peptide".into(),
            route_id: "intranasal".into(),
            device_id: Some("nasal_spray".into()),
            name: "Demo Peptide nasal spray".into(),
        },
    ];

    let components = vec![FormulationComponent {
        id: "demo_peptide_subq_bac_water".into(),
        formulation_id: "demo_peptide_subq".into(),
        name: "Bacteriostatic water".into(),
        modifier_dist_id: Some("mult_reconstitution".into()),
    }];

    // ========================================================================
    // Distributions
    // ========================================================================

    let distributions = vec![
        Distribution::three_point(
            "ba_demo_subq_systemic",
            ValueType::Fraction,
            DistType::BetaPert,
            0.1,
            0.3,
            0.6,
        ),
        Distribution::three_point(
            "ba_demo_nasal_systemic",
            ValueType::Fraction,
            DistType::BetaPert,
            0.02,
            0.05,
            0.1,
        ),
        Distribution::uniform("mult_reconstitution", ValueType::Multiplier, 0.95, 1.05),
        Distribution::lognormal("mult_nasal_device", ValueType::Multiplier, 1.0, 0.1),
        Distribution::three_point(
            "cal_nasal_spray_ml",
            ValueType::VolumeMlPerUnit,
            DistType::Triangular,
            0.09,
            0.1,
            0.11,
        ),
    ];

    let bioavailability = vec![
        BioavailabilitySpec {
            substance_id: "demo_peptide".into(),
            route_id: "subq".into(),
            compartment: Compartment::Systemic,
            base_fraction_dist_id: "ba_demo_subq_systemic".into(),
        },
        BioavailabilitySpec {
            substance_id: "demo_peptide".into(),
            route_id: "intranasal".into(),
            compartment: Compartment::Systemic,
            base_fraction_dist_id: "ba_demo_nasal_systemic".into(),
        },
    ];

    let formulation_modifiers = vec![FormulationModifierSpec {
        formulation_id: "demo_peptide_nasal".into(),
        compartment: CompartmentScope::Both,
        multiplier_dist_id: "mult_nasal_device".into(),
    }];

    let device_calibrations = vec![DeviceCalibration {
        device_id: "nasal_spray".into(),
        route_id: "intranasal".into(),
        unit_label: "spray".into(),
        volume_ml_per_unit_dist_id: "cal_nasal_spray_ml".into(),
    }];

    // ========================================================================
    // Inventory
    // ========================================================================

    let vials = vec![
        Vial {
            id: "demo_vial_subq".into(),
            formulation_id: "demo_peptide_subq".into(),
            status: VialStatus::Active,
            content_mass_value: 10.0,
            content_mass_unit: "mg".into(),
            total_volume_value: Some(10.0),
            total_volume_unit: Some("mL".into()),
            concentration_mg_per_ml: None,
            cost_usd: Some(100.0),
            volume_ml_per_unit_override_dist_id: None,
        },
        Vial {
            id: "demo_vial_nasal".into(),
            formulation_id: "demo_peptide_nasal".into(),
            status: VialStatus::Active,
            content_mass_value: 10.0,
            content_mass_unit: "mg".into(),
            total_volume_value: Some(10.0),
            total_volume_unit: Some("mL".into()),
            concentration_mg_per_ml: Some(1.0),
            cost_usd: Some(60.0),
            volume_ml_per_unit_override_dist_id: None,
        },
    ];

    ReferenceCatalog {
        substances,
        routes,
        devices,
        formulations,
        components,
        distributions,
        bioavailability,
        formulation_modifiers,
        component_modifiers: Vec::new(),
        device_calibrations,
        vials,
        cycle_rules: Vec::new(),
    }
}

impl ReferenceCatalog {
    /// Load a catalog from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let catalog: ReferenceCatalog = toml::from_str(&contents)?;
        tracing::info!(
            "Loaded catalog from {:?} ({} formulations, {} distributions)",
            path,
            catalog.formulations.len(),
            catalog.distributions.len()
        );
        Ok(catalog)
    }

    /// Load a catalog, falling back to the demo catalog when the file is absent
    pub fn load_or_demo(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No catalog found at {:?}, using demo catalog", path);
            Ok(get_demo_catalog().clone())
        }
    }

    /// Save the catalog as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::CatalogValidation(format!("Failed to serialize catalog: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved catalog to {:?}", path);
        Ok(())
    }

    fn distribution(&self, id: &str) -> Option<&Distribution> {
        self.distributions.iter().find(|d| d.id == id)
    }

    /// Validate the catalog for consistency and completeness
    ///
    /// Returns a list of validation errors, or empty Vec if valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        check_unique(&mut errors, "substance", self.substances.iter().map(|s| &s.id));
        check_unique(&mut errors, "route", self.routes.iter().map(|r| &r.id));
        check_unique(&mut errors, "device", self.devices.iter().map(|d| &d.id));
        check_unique(&mut errors, "formulation", self.formulations.iter().map(|f| &f.id));
        check_unique(&mut errors, "component", self.components.iter().map(|c| &c.id));
        check_unique(&mut errors, "distribution", self.distributions.iter().map(|d| &d.id));
        check_unique(&mut errors, "vial", self.vials.iter().map(|v| &v.id));

        let substances: HashSet<&str> = self.substances.iter().map(|s| s.id.as_str()).collect();
        let routes: HashSet<&str> = self.routes.iter().map(|r| r.id.as_str()).collect();
        let devices: HashSet<&str> = self.devices.iter().map(|d| d.id.as_str()).collect();
        let formulations: HashSet<&str> =
            self.formulations.iter().map(|f| f.id.as_str()).collect();
        let components: HashSet<&str> = self.components.iter().map(|c| c.id.as_str()).collect();

        // Distribution parameters
        for dist in &self.distributions {
            if let Err(e) = distribution::validate(dist) {
                errors.push(e.to_string());
            }
        }

        let check_dist = |errors: &mut Vec<String>, owner: String, id: &str, want: ValueType| {
            match self.distribution(id) {
                None => errors.push(format!("{} references non-existent distribution '{}'", owner, id)),
                Some(d) if d.value_type != want => errors.push(format!(
                    "{} references distribution '{}' with value_type {:?}, expected {:?}",
                    owner, id, d.value_type, want
                )),
                Some(_) => {}
            }
        };

        for f in &self.formulations {
            if !substances.contains(f.substance_id.as_str()) {
                errors.push(format!(
                    "Formulation '{}' references non-existent substance '{}'",
                    f.id, f.substance_id
                ));
            }
            if !routes.contains(f.route_id.as_str()) {
                errors.push(format!(
                    "Formulation '{}' references non-existent route '{}'",
                    f.id, f.route_id
                ));
            }
            if let Some(device_id) = &f.device_id {
                if !devices.contains(device_id.as_str()) {
                    errors.push(format!(
                        "Formulation '{}' references non-existent device '{}'",
                        f.id, device_id
                    ));
                }
            }
        }

        for c in &self.components {
            if !formulations.contains(c.formulation_id.as_str()) {
                errors.push(format!(
                    "Component '{}' references non-existent formulation '{}'",
                    c.id, c.formulation_id
                ));
            }
            if let Some(id) = &c.modifier_dist_id {
                check_dist(&mut errors, format!("Component '{}'", c.id), id, ValueType::Multiplier);
            }
        }

        for spec in &self.bioavailability {
            let owner = format!(
                "Bioavailability spec {}/{}/{}",
                spec.substance_id, spec.route_id, spec.compartment
            );
            if !substances.contains(spec.substance_id.as_str()) {
                errors.push(format!("{} references non-existent substance", owner));
            }
            if !routes.contains(spec.route_id.as_str()) {
                errors.push(format!("{} references non-existent route", owner));
            }
            check_dist(&mut errors, owner, &spec.base_fraction_dist_id, ValueType::Fraction);
        }

        for spec in &self.formulation_modifiers {
            let owner = format!("Formulation modifier for '{}'", spec.formulation_id);
            if !formulations.contains(spec.formulation_id.as_str()) {
                errors.push(format!("{} references non-existent formulation", owner));
            }
            check_dist(&mut errors, owner, &spec.multiplier_dist_id, ValueType::Multiplier);
        }

        for spec in &self.component_modifiers {
            let owner = format!("Component modifier for '{}'", spec.formulation_component_id);
            if !components.contains(spec.formulation_component_id.as_str()) {
                errors.push(format!("{} references non-existent component", owner));
            }
            check_dist(&mut errors, owner, &spec.multiplier_dist_id, ValueType::Multiplier);
        }

        for cal in &self.device_calibrations {
            let owner = format!(
                "Device calibration {}/{}/{}",
                cal.device_id, cal.route_id, cal.unit_label
            );
            if !devices.contains(cal.device_id.as_str()) {
                errors.push(format!("{} references non-existent device", owner));
            }
            if !routes.contains(cal.route_id.as_str()) {
                errors.push(format!("{} references non-existent route", owner));
            }
            if normalize_device_unit_label(&cal.unit_label).is_empty() {
                errors.push(format!("{} has an empty unit label", owner));
            }
            check_dist(
                &mut errors,
                owner,
                &cal.volume_ml_per_unit_dist_id,
                ValueType::VolumeMlPerUnit,
            );
        }

        for v in &self.vials {
            if !formulations.contains(v.formulation_id.as_str()) {
                errors.push(format!(
                    "Vial '{}' references non-existent formulation '{}'",
                    v.id, v.formulation_id
                ));
            }
            if let Err(e) = to_canonical_mass_mg(v.content_mass_value, &v.content_mass_unit) {
                errors.push(format!("Vial '{}': {}", v.id, e));
            }
            if let (Some(value), Some(unit)) = (v.total_volume_value, v.total_volume_unit.as_deref()) {
                if let Err(e) = to_canonical_volume_ml(value, unit) {
                    errors.push(format!("Vial '{}': {}", v.id, e));
                }
            }
            if let Some(id) = &v.volume_ml_per_unit_override_dist_id {
                check_dist(
                    &mut errors,
                    format!("Vial '{}'", v.id),
                    id,
                    ValueType::VolumeMlPerUnit,
                );
            }
        }

        let mut active_per_formulation: HashMap<&str, usize> = HashMap::new();
        for v in self.vials.iter().filter(|v| v.status == VialStatus::Active) {
            *active_per_formulation.entry(v.formulation_id.as_str()).or_default() += 1;
        }
        let mut multi: Vec<_> = active_per_formulation
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .collect();
        multi.sort();
        for (formulation_id, n) in multi {
            errors.push(format!(
                "Formulation '{}' has {} active vials",
                formulation_id, n
            ));
        }

        for rule in &self.cycle_rules {
            if !substances.contains(rule.substance_id.as_str()) {
                errors.push(format!(
                    "Cycle rule references non-existent substance '{}'",
                    rule.substance_id
                ));
            }
            if let Err(e) = crate::cycles::validate_gap_days(rule.gap_days_to_suggest_new_cycle) {
                errors.push(format!("Cycle rule for '{}': {}", rule.substance_id, e));
            }
        }

        errors
    }

    /// [`validate`](Self::validate) as a single error
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::CatalogValidation(errors.join("; ")))
        }
    }
}

fn check_unique<'a>(
    errors: &mut Vec<String>,
    kind: &str,
    ids: impl Iterator<Item = &'a String>,
) {
    let mut seen = HashSet::new();
    for id in ids {
        if id.is_empty() {
            errors.push(format!("A {} has an empty ID", kind));
        } else if !seen.insert(id.as_str()) {
            errors.push(format!("Duplicate {} ID '{}'", kind, id));
        }
    }
}

// ============================================================================
// Collaborator impls
// ============================================================================

impl ReferenceData for ReferenceCatalog {
    fn formulation_context(&self, formulation_id: &str) -> Result<Option<FormulationContext>> {
        let Some(formulation) = self.formulations.iter().find(|f| f.id == formulation_id) else {
            return Ok(None);
        };

        Ok(Some(FormulationContext {
            substance: self
                .substances
                .iter()
                .find(|s| s.id == formulation.substance_id)
                .cloned(),
            route: self
                .routes
                .iter()
                .find(|r| r.id == formulation.route_id)
                .cloned(),
            device: formulation
                .device_id
                .as_ref()
                .and_then(|id| self.devices.iter().find(|d| &d.id == id))
                .cloned(),
            formulation: formulation.clone(),
        }))
    }

    fn bioavailability_spec(
        &self,
        substance_id: &str,
        route_id: &str,
        compartment: Compartment,
    ) -> Result<Option<BioavailabilitySpec>> {
        Ok(self
            .bioavailability
            .iter()
            .find(|s| {
                s.substance_id == substance_id
                    && s.route_id == route_id
                    && s.compartment == compartment
            })
            .cloned())
    }

    fn formulation_modifier_specs(
        &self,
        formulation_id: &str,
        compartment: Compartment,
    ) -> Result<Vec<FormulationModifierSpec>> {
        Ok(self
            .formulation_modifiers
            .iter()
            .filter(|s| s.formulation_id == formulation_id && s.compartment.applies_to(compartment))
            .cloned()
            .collect())
    }

    fn formulation_components(&self, formulation_id: &str) -> Result<Vec<FormulationComponent>> {
        Ok(self
            .components
            .iter()
            .filter(|c| c.formulation_id == formulation_id)
            .cloned()
            .collect())
    }

    fn component_modifier_specs(
        &self,
        component_ids: &[String],
        compartment: Compartment,
    ) -> Result<Vec<ComponentModifierSpec>> {
        Ok(self
            .component_modifiers
            .iter()
            .filter(|s| {
                component_ids.contains(&s.formulation_component_id)
                    && s.compartment.applies_to(compartment)
            })
            .cloned()
            .collect())
    }

    fn distributions_by_id(&self, ids: &[String]) -> Result<HashMap<String, Distribution>> {
        Ok(self
            .distributions
            .iter()
            .filter(|d| ids.contains(&d.id))
            .map(|d| (d.id.clone(), d.clone()))
            .collect())
    }

    fn cycle_rule(&self, substance_id: &str) -> Result<Option<CycleRule>> {
        Ok(self
            .cycle_rules
            .iter()
            .find(|r| r.substance_id == substance_id)
            .cloned())
    }
}

impl Inventory for ReferenceCatalog {
    fn active_vial(&self, formulation_id: &str) -> Result<Option<Vial>> {
        Ok(self
            .vials
            .iter()
            .find(|v| v.formulation_id == formulation_id && v.status == VialStatus::Active)
            .cloned())
    }

    fn device_calibration(
        &self,
        device_id: &str,
        route_id: &str,
        unit_label: &str,
    ) -> Result<Option<DeviceCalibration>> {
        Ok(self
            .device_calibrations
            .iter()
            .find(|c| {
                c.device_id == device_id
                    && c.route_id == route_id
                    && normalize_device_unit_label(&c.unit_label) == unit_label
            })
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_catalog_is_valid() {
        let catalog = build_demo_catalog();
        let errors = catalog.validate();
        assert!(errors.is_empty(), "Validation errors: {:?}", errors);
        assert!(catalog.ensure_valid().is_ok());
    }

    #[test]
    fn test_cached_catalog_matches_built() {
        let cached = get_demo_catalog();
        let built = build_demo_catalog();
        assert_eq!(cached.formulations.len(), built.formulations.len());
        assert_eq!(cached.distributions, built.distributions);
    }

    #[test]
    fn test_demo_vial_and_base_fraction() {
        let catalog = build_demo_catalog();
        let vial = catalog.active_vial("demo_peptide_subq").unwrap().unwrap();
        assert_eq!(vial.cost_usd, Some(100.0));
        assert_eq!(vial.dose_context().effective_concentration(), Some(1.0));

        let spec = catalog
            .bioavailability_spec("demo_peptide", "subq", Compartment::Systemic)
            .unwrap()
            .unwrap();
        let dists = catalog
            .distributions_by_id(&[spec.base_fraction_dist_id.clone()])
            .unwrap();
        let base = &dists[&spec.base_fraction_dist_id];
        assert_eq!(base.dist_type, DistType::BetaPert);
        assert_eq!((base.p1, base.p2, base.p3), (Some(0.1), Some(0.3), Some(0.6)));
    }

    #[test]
    fn test_validate_reports_dangling_ids_and_bad_distributions() {
        let mut catalog = build_demo_catalog();
        catalog.formulations[0].substance_id = "ghost".into();
        catalog.bioavailability[0].base_fraction_dist_id = "mult_reconstitution".into();
        catalog.distributions.push(Distribution::three_point(
            "bad_tri",
            ValueType::Multiplier,
            DistType::Triangular,
            2.0,
            1.0,
            3.0,
        ));
        catalog.distributions.push(Distribution::point("bad_tri", ValueType::Multiplier, 1.0));

        let errors = catalog.validate();
        assert!(errors.iter().any(|e| e.contains("non-existent substance 'ghost'")));
        assert!(errors.iter().any(|e| e.contains("expected Fraction")));
        assert!(errors.iter().any(|e| e.contains("bad_tri") && e.contains("min <= mode <= max")));
        assert!(errors.iter().any(|e| e.contains("Duplicate distribution ID 'bad_tri'")));
        assert!(matches!(
            catalog.ensure_valid(),
            Err(Error::CatalogValidation(_))
        ));
    }

    #[test]
    fn test_two_active_vials_flagged() {
        let mut catalog = build_demo_catalog();
        let mut extra = catalog.vials[0].clone();
        extra.id = "second".into();
        catalog.vials.push(extra);
        let errors = catalog.validate();
        assert!(errors.iter().any(|e| e.contains("has 2 active vials")));
    }

    #[test]
    fn test_toml_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("catalog.toml");

        let catalog = build_demo_catalog();
        catalog.save(&path).unwrap();
        let loaded = ReferenceCatalog::load(&path).unwrap();
        assert_eq!(loaded.distributions, catalog.distributions);
        assert_eq!(loaded.vials.len(), catalog.vials.len());
        assert!(loaded.validate().is_empty());
    }

    #[test]
    fn test_partial_toml_defaults_missing_tables() {
        let toml_str = r#"
[[substances]]
id = "x"
display_name = "X"
target_compartment_default = "both"

[[cycle_rules]]
substance_id = "x"
gap_days_to_suggest_new_cycle = 3.5
"#;
        let catalog: ReferenceCatalog = toml::from_str(toml_str).unwrap();
        assert_eq!(catalog.substances[0].target_compartment_default, CompartmentScope::Both);
        assert!(catalog.cycle_rules[0].auto_start_first_cycle);
        assert!(catalog.formulations.is_empty());
        assert_eq!(
            catalog.cycle_rule("x").unwrap().unwrap().gap_days_to_suggest_new_cycle,
            3.5
        );
    }

    #[test]
    fn test_load_or_demo_when_missing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let catalog = ReferenceCatalog::load_or_demo(&temp_dir.path().join("none.toml")).unwrap();
        assert!(!catalog.formulations.is_empty());
    }

    #[test]
    fn test_device_calibration_matches_normalized_label() {
        let mut catalog = build_demo_catalog();
        catalog.device_calibrations[0].unit_label = "Sprays".into();
        let cal = catalog
            .device_calibration("nasal_spray", "intranasal", "spray")
            .unwrap();
        assert!(cal.is_some());
        assert!(catalog
            .device_calibration("nasal_spray", "subq", "spray")
            .unwrap()
            .is_none());
    }
}
