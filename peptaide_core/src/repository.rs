//! Collaborator interfaces consumed by the recorder.
//!
//! Reference data, inventory, cycle state and the event log sit behind these
//! traits so the core can run against the TOML catalog and file stores in the
//! CLI, or against [`MemoryStore`] in tests.

use crate::{
    AdministrationEvent, BioavailabilitySpec, Compartment, ComponentModifierSpec, CycleInstance,
    CycleRule, CycleStatus, DeviceCalibration, Distribution, Error, FormulationComponent,
    FormulationContext, FormulationModifierSpec, Result, Vial,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

// ============================================================================
// Traits
// ============================================================================

/// Reference-data lookups
pub trait ReferenceData {
    /// Formulation joined with its substance, route and device
    fn formulation_context(&self, formulation_id: &str) -> Result<Option<FormulationContext>>;

    fn bioavailability_spec(
        &self,
        substance_id: &str,
        route_id: &str,
        compartment: Compartment,
    ) -> Result<Option<BioavailabilitySpec>>;

    /// Formulation-level specs scoped to `compartment` or `both`
    fn formulation_modifier_specs(
        &self,
        formulation_id: &str,
        compartment: Compartment,
    ) -> Result<Vec<FormulationModifierSpec>>;

    fn formulation_components(&self, formulation_id: &str) -> Result<Vec<FormulationComponent>>;

    /// Component-level specs for any of `component_ids`, scoped to `compartment` or `both`
    fn component_modifier_specs(
        &self,
        component_ids: &[String],
        compartment: Compartment,
    ) -> Result<Vec<ComponentModifierSpec>>;

    /// Batch lookup; ids with no row are simply absent from the map
    fn distributions_by_id(&self, ids: &[String]) -> Result<HashMap<String, Distribution>>;

    fn cycle_rule(&self, substance_id: &str) -> Result<Option<CycleRule>>;
}

/// Vial and calibration lookups
pub trait Inventory {
    fn active_vial(&self, formulation_id: &str) -> Result<Option<Vial>>;

    /// Calibration keyed by device, route and normalized unit label
    fn device_calibration(
        &self,
        device_id: &str,
        route_id: &str,
        unit_label: &str,
    ) -> Result<Option<DeviceCalibration>>;
}

/// Cycle instance storage.
///
/// Implementations enforce at most one active cycle per substance and
/// strictly increasing cycle numbers, reporting violations as
/// [`Error::StorageConflict`].
pub trait CycleStore {
    fn active_cycle(&self, substance_id: &str) -> Result<Option<CycleInstance>>;

    /// Highest-numbered cycle of any status
    fn last_cycle(&self, substance_id: &str) -> Result<Option<CycleInstance>>;

    /// All cycles ordered by substance then number
    fn list_cycles(&self, substance_id: Option<&str>) -> Result<Vec<CycleInstance>>;

    fn create_cycle(&self, cycle: &CycleInstance) -> Result<()>;

    fn create_cycles(&self, cycles: &[CycleInstance]) -> Result<()> {
        for cycle in cycles {
            self.create_cycle(cycle)?;
        }
        Ok(())
    }

    /// Mark an active cycle completed at `max(end_ts, start_ts)`
    fn complete_cycle(&self, cycle_id: Uuid, end_ts: DateTime<Utc>) -> Result<CycleInstance>;

    /// Mark an active cycle abandoned at `max(end_ts, start_ts)`
    fn abandon_cycle(&self, cycle_id: Uuid, end_ts: DateTime<Utc>) -> Result<CycleInstance>;
}

/// Append-only administration event storage
pub trait EventStore {
    fn append_event(&self, event: &AdministrationEvent) -> Result<()>;

    fn append_events(&self, events: &[AdministrationEvent]) -> Result<()> {
        for event in events {
            self.append_event(event)?;
        }
        Ok(())
    }

    /// Every event with soft-delete state applied
    fn list_events(&self) -> Result<Vec<AdministrationEvent>>;

    /// Timestamp of the substance's latest non-deleted event
    fn last_event_ts(&self, substance_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .list_events()?
            .iter()
            .filter(|e| !e.is_deleted() && e.substance_id.as_deref() == Some(substance_id))
            .map(|e| e.ts)
            .max())
    }

    /// Set (`Some`) or clear (`None`) an event's `deleted_at`
    fn set_deleted(
        &self,
        event_id: Uuid,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Result<AdministrationEvent>;
}

// ============================================================================
// Shared cycle invariants
// ============================================================================

/// Check that `cycle` may be inserted next to `existing`
pub(crate) fn check_new_cycle(existing: &[CycleInstance], cycle: &CycleInstance) -> Result<()> {
    if cycle.cycle_number == 0 {
        return Err(Error::Cycle("Cycle numbers start at 1.".into()));
    }

    let same_substance = existing
        .iter()
        .filter(|c| c.substance_id == cycle.substance_id);

    for other in same_substance {
        if cycle.status == CycleStatus::Active && other.status == CycleStatus::Active {
            return Err(Error::StorageConflict(format!(
                "substance {} already has active cycle #{}",
                cycle.substance_id, other.cycle_number
            )));
        }
        if other.cycle_number >= cycle.cycle_number {
            return Err(Error::StorageConflict(format!(
                "cycle #{} for substance {} is not after existing cycle #{}",
                cycle.cycle_number, cycle.substance_id, other.cycle_number
            )));
        }
    }

    Ok(())
}

/// Close an active cycle in place and return the updated copy
pub(crate) fn close_cycle(
    cycles: &mut [CycleInstance],
    cycle_id: Uuid,
    status: CycleStatus,
    end_ts: DateTime<Utc>,
) -> Result<CycleInstance> {
    let cycle = cycles
        .iter_mut()
        .find(|c| c.id == cycle_id)
        .ok_or_else(|| Error::NotFound(format!("cycle {}", cycle_id)))?;

    if cycle.status != CycleStatus::Active {
        return Err(Error::Cycle(format!(
            "cycle #{} for {} is not active",
            cycle.cycle_number, cycle.substance_id
        )));
    }

    cycle.status = status;
    cycle.end_ts = Some(end_ts.max(cycle.start_ts));
    Ok(cycle.clone())
}

pub(crate) fn sort_cycles(cycles: &mut [CycleInstance]) {
    cycles.sort_by(|a, b| {
        a.substance_id
            .cmp(&b.substance_id)
            .then(a.cycle_number.cmp(&b.cycle_number))
    });
}

// ============================================================================
// In-memory store
// ============================================================================

/// Cycle and event storage held in memory.
///
/// Backs the recorder, cycle and import unit tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cycles: Mutex<Vec<CycleInstance>>,
    events: Mutex<Vec<AdministrationEvent>>,
    racing_cycle: Mutex<Option<CycleInstance>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing cycles
    pub fn with_cycles(cycles: Vec<CycleInstance>) -> Self {
        Self {
            cycles: Mutex::new(cycles),
            ..Self::default()
        }
    }

    /// Test hook: make the next `create_cycle` lose a race against `winner`.
    /// The winner is stored first and the caller's insert reports a conflict.
    #[cfg(test)]
    pub(crate) fn inject_racing_cycle(&self, winner: CycleInstance) {
        *lock(&self.racing_cycle) = Some(winner);
    }
}

impl CycleStore for MemoryStore {
    fn active_cycle(&self, substance_id: &str) -> Result<Option<CycleInstance>> {
        Ok(lock(&self.cycles)
            .iter()
            .find(|c| c.substance_id == substance_id && c.status == CycleStatus::Active)
            .cloned())
    }

    fn last_cycle(&self, substance_id: &str) -> Result<Option<CycleInstance>> {
        Ok(lock(&self.cycles)
            .iter()
            .filter(|c| c.substance_id == substance_id)
            .max_by_key(|c| c.cycle_number)
            .cloned())
    }

    fn list_cycles(&self, substance_id: Option<&str>) -> Result<Vec<CycleInstance>> {
        let mut cycles: Vec<CycleInstance> = lock(&self.cycles)
            .iter()
            .filter(|c| substance_id.map_or(true, |s| c.substance_id == s))
            .cloned()
            .collect();
        sort_cycles(&mut cycles);
        Ok(cycles)
    }

    fn create_cycle(&self, cycle: &CycleInstance) -> Result<()> {
        let mut cycles = lock(&self.cycles);
        if let Some(winner) = lock(&self.racing_cycle).take() {
            cycles.push(winner);
        }
        check_new_cycle(&cycles, cycle)?;
        cycles.push(cycle.clone());
        Ok(())
    }

    fn complete_cycle(&self, cycle_id: Uuid, end_ts: DateTime<Utc>) -> Result<CycleInstance> {
        close_cycle(
            &mut lock(&self.cycles),
            cycle_id,
            CycleStatus::Completed,
            end_ts,
        )
    }

    fn abandon_cycle(&self, cycle_id: Uuid, end_ts: DateTime<Utc>) -> Result<CycleInstance> {
        close_cycle(
            &mut lock(&self.cycles),
            cycle_id,
            CycleStatus::Abandoned,
            end_ts,
        )
    }
}

impl EventStore for MemoryStore {
    fn append_event(&self, event: &AdministrationEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }

    fn list_events(&self) -> Result<Vec<AdministrationEvent>> {
        Ok(lock(&self.events).clone())
    }

    fn set_deleted(
        &self,
        event_id: Uuid,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Result<AdministrationEvent> {
        let mut events = lock(&self.events);
        let event = events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| Error::NotFound(format!("event {}", event_id)))?;
        event.deleted_at = deleted_at;
        Ok(event.clone())
    }
}
