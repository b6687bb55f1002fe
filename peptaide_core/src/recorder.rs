//! Event recording.
//!
//! [`EventRecorder::prepare`] runs every computation for one administration
//! (parse, canonical dose, snapshot, seed, simulation, cycle plan) and touches
//! storage only to read. [`EventRecorder::commit`] then applies the cycle plan
//! and appends the finished event. A failure anywhere in `prepare` leaves
//! storage untouched.

use crate::cycles::{plan_cycle, suggest_cycle_action, CycleAction, CyclePlan, CycleSettings};
use crate::dose::{compute_dose, event_cost_from_vial};
use crate::repository::{CycleStore, EventStore, Inventory, ReferenceData};
use crate::seed::{compartment_seed, derive_seed};
use crate::simulation::simulate_compartment;
use crate::snapshot::{build_snapshot, resolve_calibration};
use crate::units::parse_quantity;
use crate::{
    AdministrationEvent, Compartment, CycleInstance, Error, ProfileDefaults, QuantityKind,
    Result,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One administration to record
#[derive(Clone, Debug)]
pub struct LogRequest {
    pub formulation_id: String,
    pub input_text: String,
    pub ts: DateTime<Utc>,
    /// Fixed event id; a random one is generated when unset
    pub event_id: Option<Uuid>,
}

impl LogRequest {
    pub fn new(formulation_id: impl Into<String>, input_text: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            formulation_id: formulation_id.into(),
            input_text: input_text.into(),
            ts,
            event_id: None,
        }
    }

    pub fn with_event_id(mut self, id: Uuid) -> Self {
        self.event_id = Some(id);
        self
    }
}

/// Fully computed event, not yet written
#[derive(Clone, Debug)]
pub struct PreparedEvent {
    pub event: AdministrationEvent,
    pub cycle_action: CycleAction,
    pub plan: CyclePlan,
    /// Active cycle seen while planning
    pub active_cycle: Option<CycleInstance>,
    /// Compartments left unsimulated because a distribution was malformed
    pub failed_compartments: Vec<Compartment>,
}

/// Outcome of a committed event
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub event: AdministrationEvent,
    pub cycle_action: CycleAction,
    /// Cycle the event was attached to
    pub cycle: Option<CycleInstance>,
    /// Cycle completed because the gap threshold was reached
    pub completed_cycle: Option<CycleInstance>,
}

/// Records administrations against injected collaborators
pub struct EventRecorder<'a> {
    reference: &'a dyn ReferenceData,
    inventory: &'a dyn Inventory,
    cycles: &'a dyn CycleStore,
    events: &'a dyn EventStore,
    user_id: String,
    defaults: ProfileDefaults,
}

impl<'a> EventRecorder<'a> {
    pub fn new(
        reference: &'a dyn ReferenceData,
        inventory: &'a dyn Inventory,
        cycles: &'a dyn CycleStore,
        events: &'a dyn EventStore,
        user_id: impl Into<String>,
        defaults: ProfileDefaults,
    ) -> Self {
        Self {
            reference,
            inventory,
            cycles,
            events,
            user_id: user_id.into(),
            defaults,
        }
    }

    /// Prepare and commit one event
    pub fn record(&self, request: &LogRequest) -> Result<RecordedEvent> {
        let prepared = self.prepare(request)?;
        self.commit(prepared)
    }

    /// Compute everything for an event without writing anything
    pub fn prepare(&self, request: &LogRequest) -> Result<PreparedEvent> {
        let quantity = parse_quantity(&request.input_text)?;

        let ctx = self
            .reference
            .formulation_context(&request.formulation_id)?
            .ok_or_else(|| Error::NotFound(format!("formulation {}", request.formulation_id)))?;
        let substance_id = ctx.formulation.substance_id.clone();

        let vial = self.inventory.active_vial(&ctx.formulation.id)?;
        let vial_ctx = vial.as_ref().map(|v| v.dose_context());

        let calibration =
            resolve_calibration(self.reference, self.inventory, &ctx, vial.as_ref(), &quantity)?;
        let per_unit = calibration.as_ref().map(|c| c.mean_volume_ml_per_unit);

        let dose = compute_dose(&quantity, vial_ctx.as_ref(), per_unit)?;
        if quantity.kind == QuantityKind::DeviceUnits && dose.dose_volume_ml.is_none() {
            return Err(Error::CalibrationMissing(format!(
                "cannot convert \"{}\" to a volume",
                request.input_text.trim()
            )));
        }

        let cost_usd = match (&vial, &vial_ctx) {
            (Some(v), Some(vc)) => event_cost_from_vial(&dose, vc, v.cost_usd),
            _ => None,
        };

        let snapshot = build_snapshot(self.reference, &ctx, calibration)?;
        let event_id = request.event_id.unwrap_or_else(Uuid::new_v4);
        let seed = derive_seed(&self.user_id, event_id, &snapshot)?;
        let n = self.defaults.default_simulation_n;

        let mut systemic = None;
        let mut cns = None;
        let mut failed_compartments = Vec::new();
        for (&compartment, model) in &snapshot.compartments {
            let result = simulate_compartment(
                dose.dose_mass_mg,
                model,
                n,
                compartment_seed(seed, compartment),
            );
            let percentiles = match result {
                Ok(p) => p,
                Err(Error::Distribution(msg)) => {
                    tracing::warn!(
                        "Leaving {} unresolved for {}: {}",
                        compartment,
                        ctx.formulation.id,
                        msg
                    );
                    failed_compartments.push(compartment);
                    None
                }
                Err(e) => return Err(e),
            };
            match compartment {
                Compartment::Systemic => systemic = percentiles,
                Compartment::Cns => cns = percentiles,
            }
        }

        // Simulation parameters are only recorded when draws were taken
        let simulated = systemic.is_some() || cns.is_some();

        let rule = self.reference.cycle_rule(&substance_id)?;
        let settings = CycleSettings::resolve(rule.as_ref(), &self.defaults)?;
        let last_event_ts = self.events.last_event_ts(&substance_id)?;
        let active_cycle = self.cycles.active_cycle(&substance_id)?;
        let last_cycle = self.cycles.last_cycle(&substance_id)?;

        let cycle_action = suggest_cycle_action(
            last_event_ts,
            request.ts,
            settings.gap_days,
            settings.auto_start_first_cycle,
            active_cycle.is_some(),
        );
        let plan = plan_cycle(
            cycle_action,
            &substance_id,
            active_cycle.as_ref(),
            last_cycle.as_ref(),
            last_event_ts,
            request.ts,
            Uuid::new_v4(),
        );

        let event = AdministrationEvent {
            id: event_id,
            ts: request.ts,
            formulation_id: ctx.formulation.id.clone(),
            substance_id: Some(substance_id),
            vial_id: vial.map(|v| v.id),
            cycle_instance_id: plan.cycle_id(),
            input_text: request.input_text.clone(),
            input_value: quantity.value,
            input_unit: quantity.unit,
            input_kind: quantity.kind,
            dose_mass_mg: dose.dose_mass_mg,
            dose_volume_ml: dose.dose_volume_ml,
            eff_systemic_p05_mg: systemic.map(|p| p.p05),
            eff_systemic_p50_mg: systemic.map(|p| p.p50),
            eff_systemic_p95_mg: systemic.map(|p| p.p95),
            eff_cns_p05_mg: cns.map(|p| p.p05),
            eff_cns_p50_mg: cns.map(|p| p.p50),
            eff_cns_p95_mg: cns.map(|p| p.p95),
            mc_n: simulated.then_some(n),
            mc_seed: simulated.then_some(seed),
            model_snapshot: snapshot,
            cost_usd,
            deleted_at: None,
        };

        tracing::debug!(
            "Prepared event {} ({:?}, {:?})",
            event.id,
            cycle_action,
            event.dose_mass_mg
        );

        Ok(PreparedEvent {
            event,
            cycle_action,
            plan,
            active_cycle,
            failed_compartments,
        })
    }

    /// Apply the cycle plan, then append the event
    pub fn commit(&self, prepared: PreparedEvent) -> Result<RecordedEvent> {
        let PreparedEvent {
            mut event,
            cycle_action,
            plan,
            active_cycle,
            ..
        } = prepared;
        let substance_id = event.substance_id.clone().unwrap_or_default();

        let mut completed_cycle = None;
        let cycle = match plan {
            CyclePlan::Unassigned => None,
            CyclePlan::Attach(id) => active_cycle.filter(|c| c.id == id),
            CyclePlan::Create(cycle) => Some(self.create_or_attach(&substance_id, cycle)?),
            CyclePlan::CompleteAndCreate {
                complete_id,
                end_ts,
                cycle,
            } => {
                match self.cycles.complete_cycle(complete_id, end_ts) {
                    Ok(closed) => {
                        tracing::info!(
                            "Completed cycle #{} for {}",
                            closed.cycle_number,
                            substance_id
                        );
                        completed_cycle = Some(closed);
                    }
                    // Another writer already closed it
                    Err(Error::Cycle(msg)) => tracing::debug!("{}", msg),
                    Err(e) => return Err(e),
                }
                Some(self.create_or_attach(&substance_id, cycle)?)
            }
        };

        if let Some(c) = &cycle {
            event.cycle_instance_id = Some(c.id);
        }

        self.events.append_event(&event)?;
        tracing::info!(
            "Recorded event {} for {} ({})",
            event.id,
            event.formulation_id,
            event.input_text
        );

        Ok(RecordedEvent {
            event,
            cycle_action,
            cycle,
            completed_cycle,
        })
    }

    fn create_or_attach(&self, substance_id: &str, cycle: CycleInstance) -> Result<CycleInstance> {
        match self.cycles.create_cycle(&cycle) {
            Ok(()) => {
                tracing::info!("Started cycle #{} for {}", cycle.cycle_number, substance_id);
                Ok(cycle)
            }
            Err(Error::StorageConflict(msg)) => match self.cycles.active_cycle(substance_id)? {
                Some(active) => {
                    tracing::info!(
                        "Cycle create raced ({}); attaching to cycle #{}",
                        msg,
                        active.cycle_number
                    );
                    Ok(active)
                }
                None => Err(Error::StorageConflict(msg)),
            },
            Err(e) => Err(e),
        }
    }

    /// Soft-delete an event
    pub fn delete_event(&self, event_id: Uuid, now: DateTime<Utc>) -> Result<AdministrationEvent> {
        self.events.set_deleted(event_id, Some(now))
    }

    /// Undo a soft delete
    pub fn restore_event(&self, event_id: Uuid) -> Result<AdministrationEvent> {
        self.events.set_deleted(event_id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{build_demo_catalog, ReferenceCatalog};
    use crate::repository::MemoryStore;
    use crate::CycleStatus;
    use chrono::{Duration, TimeZone};

    fn day(d: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap() + Duration::days(d)
    }

    fn recorder<'a>(catalog: &'a ReferenceCatalog, store: &'a MemoryStore) -> EventRecorder<'a> {
        EventRecorder::new(catalog, catalog, store, store, "tester", ProfileDefaults::default())
    }

    #[test]
    fn test_volume_dose_via_concentration() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let out = rec
            .record(&LogRequest::new("demo_peptide_subq", "0.3mL", day(0)))
            .unwrap();
        let e = &out.event;
        assert!((e.dose_mass_mg.unwrap() - 0.3).abs() < 1e-12);
        assert!((e.dose_volume_ml.unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(e.input_kind, QuantityKind::Volume);
        assert_eq!(e.vial_id.as_deref(), Some("demo_vial_subq"));
        assert!((e.cost_usd.unwrap() - 3.0).abs() < 1e-9);

        let p = e.percentiles(Compartment::Systemic).unwrap();
        assert!(p.p05 <= p.p50 && p.p50 <= p.p95);
        assert!(p.p95 <= 0.3);
        assert_eq!(e.mc_n, Some(2048));
        assert!(e.percentiles(Compartment::Cns).is_none());

        assert_eq!(out.cycle_action, CycleAction::StartFirstCycle);
        let cycle = out.cycle.unwrap();
        assert_eq!(cycle.cycle_number, 1);
        assert_eq!(e.cycle_instance_id, Some(cycle.id));
        assert_eq!(store.list_events().unwrap().len(), 1);
    }

    #[test]
    fn test_device_units_via_calibration() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let out = rec
            .record(&LogRequest::new("demo_peptide_nasal", "2 sprays", day(0)))
            .unwrap();
        let e = &out.event;
        assert_eq!(e.input_kind, QuantityKind::DeviceUnits);
        assert!((e.dose_volume_ml.unwrap() - 0.2).abs() < 1e-12);
        assert!((e.dose_mass_mg.unwrap() - 0.2).abs() < 1e-12);
        let cal = e.model_snapshot.calibration.as_ref().unwrap();
        assert_eq!(cal.unit_label, "spray");
    }

    #[test]
    fn test_missing_bioavailability_spec_still_saves() {
        let mut catalog = build_demo_catalog();
        catalog.bioavailability.clear();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let out = rec
            .record(&LogRequest::new("demo_peptide_subq", "0.3mL", day(0)))
            .unwrap();
        assert!(out.event.dose_mass_mg.is_some());
        assert!(out.event.eff_systemic_p50_mg.is_none());
        assert_eq!(out.event.mc_n, None);
        assert_eq!(out.event.mc_seed, None);
        assert_eq!(store.list_events().unwrap().len(), 1);
    }

    #[test]
    fn test_iu_dose_records_without_simulation() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let out = rec
            .record(&LogRequest::new("demo_peptide_subq", "5 IU", day(0)))
            .unwrap();
        assert_eq!(out.event.input_kind, QuantityKind::Iu);
        assert!(out.event.dose_mass_mg.is_none());
        assert!(out.event.eff_systemic_p50_mg.is_none());
        assert!(out.event.eff_cns_p50_mg.is_none());
        assert_eq!(out.event.mc_n, None);
        assert_eq!(out.event.mc_seed, None);
        // Still a real administration for cycle purposes
        assert!(out.event.cycle_instance_id.is_some());
    }

    #[test]
    fn test_errors_leave_storage_untouched() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        assert!(matches!(
            rec.record(&LogRequest::new("demo_peptide_subq", "abc", day(0))),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            rec.record(&LogRequest::new("demo_peptide_subq", "-1mg", day(0))),
            Err(Error::Dose(_))
        ));
        assert!(matches!(
            rec.record(&LogRequest::new("nope", "1mg", day(0))),
            Err(Error::NotFound(_))
        ));
        // The subq formulation has no device, so sprays cannot be converted
        assert!(matches!(
            rec.record(&LogRequest::new("demo_peptide_subq", "2 sprays", day(0))),
            Err(Error::CalibrationMissing(_))
        ));

        assert!(store.list_events().unwrap().is_empty());
        assert!(store.list_cycles(None).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_distribution_fails_closed_per_compartment() {
        crate::logging::init_test();
        let mut catalog = build_demo_catalog();
        for d in catalog.distributions.iter_mut() {
            if d.id == "ba_demo_subq_systemic" {
                d.p1 = Some(0.9);
            }
        }
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let prepared = rec
            .prepare(&LogRequest::new("demo_peptide_subq", "1mg", day(0)))
            .unwrap();
        assert_eq!(prepared.failed_compartments, vec![Compartment::Systemic]);
        assert!(prepared.event.eff_systemic_p50_mg.is_none());
        assert_eq!(prepared.event.dose_mass_mg, Some(1.0));
    }

    #[test]
    fn test_prepare_writes_nothing_and_is_deterministic() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);
        let id = Uuid::new_v4();
        let request = LogRequest::new("demo_peptide_subq", "250mcg", day(0)).with_event_id(id);

        let a = rec.prepare(&request).unwrap();
        let b = rec.prepare(&request).unwrap();
        assert_eq!(a.event.mc_seed, b.event.mc_seed);
        assert_eq!(a.event.eff_systemic_p50_mg, b.event.eff_systemic_p50_mg);
        assert!(store.list_events().unwrap().is_empty());
        assert!(store.list_cycles(None).unwrap().is_empty());
    }

    #[test]
    fn test_gap_completes_cycle_and_starts_next() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let first = rec
            .record(&LogRequest::new("demo_peptide_subq", "1mg", day(0)))
            .unwrap();
        let second = rec
            .record(&LogRequest::new("demo_peptide_subq", "1mg", day(3)))
            .unwrap();
        assert_eq!(second.cycle_action, CycleAction::ContinueActiveCycle);
        assert_eq!(second.event.cycle_instance_id, first.event.cycle_instance_id);

        let third = rec
            .record(&LogRequest::new("demo_peptide_subq", "1mg", day(20)))
            .unwrap();
        assert_eq!(third.cycle_action, CycleAction::SuggestNewCycle);
        let closed = third.completed_cycle.unwrap();
        assert_eq!(closed.status, CycleStatus::Completed);
        assert_eq!(closed.end_ts, Some(day(3)));
        assert_eq!(third.cycle.unwrap().cycle_number, 2);
    }

    #[test]
    fn test_numbering_survives_soft_delete() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let first = rec
            .record(&LogRequest::new("demo_peptide_subq", "1mg", day(0)))
            .unwrap();
        rec.record(&LogRequest::new("demo_peptide_subq", "1mg", day(10)))
            .unwrap();
        rec.delete_event(first.event.id, day(11)).unwrap();
        rec.record(&LogRequest::new("demo_peptide_subq", "1mg", day(30)))
            .unwrap();

        let numbers: Vec<u32> = store
            .list_cycles(Some("demo_peptide"))
            .unwrap()
            .iter()
            .map(|c| c.cycle_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let restored = rec.restore_event(first.event.id).unwrap();
        assert!(!restored.is_deleted());
    }

    #[test]
    fn test_storage_conflict_attaches_to_winner() {
        let catalog = build_demo_catalog();
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let winner = CycleInstance {
            id: Uuid::new_v4(),
            substance_id: "demo_peptide".into(),
            cycle_number: 1,
            start_ts: day(0),
            end_ts: None,
            status: CycleStatus::Active,
        };
        store.inject_racing_cycle(winner.clone());

        let out = rec
            .record(&LogRequest::new("demo_peptide_subq", "1mg", day(0)))
            .unwrap();
        assert_eq!(out.cycle.as_ref().map(|c| c.id), Some(winner.id));
        assert_eq!(out.event.cycle_instance_id, Some(winner.id));
        assert_eq!(store.list_cycles(None).unwrap().len(), 1);
    }

    #[test]
    fn test_auto_start_disabled_leaves_event_unassigned() {
        let mut catalog = build_demo_catalog();
        catalog.cycle_rules.push(crate::CycleRule {
            substance_id: "demo_peptide".into(),
            gap_days_to_suggest_new_cycle: 7.0,
            auto_start_first_cycle: false,
        });
        let store = MemoryStore::new();
        let rec = recorder(&catalog, &store);

        let out = rec
            .record(&LogRequest::new("demo_peptide_subq", "1mg", day(0)))
            .unwrap();
        assert_eq!(out.cycle_action, CycleAction::NoAction);
        assert!(out.cycle.is_none());
        assert!(out.event.cycle_instance_id.is_none());
    }
}
