//! Historical import.
//!
//! Reads `ts,formulation_id,dose` rows, canonicalizes each dose the same way
//! live logging does (without simulation), infers cycles per substance with
//! the batch partition, and writes cycles and events in one pass. Every row is
//! validated before anything is written.

use crate::cycles::{partition_cycles, CycleSettings};
use crate::dose::{compute_dose, event_cost_from_vial};
use crate::repository::{CycleStore, EventStore, Inventory, ReferenceData};
use crate::snapshot::{build_snapshot, resolve_calibration};
use crate::units::parse_quantity;
use crate::{AdministrationEvent, CycleInstance, Error, ProfileDefaults, QuantityKind, Result};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Trim};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

/// CSV row format for historical import
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportRow {
    pub ts: String,
    pub formulation_id: String,
    pub dose: String,
}

/// Where one imported row ended up
#[derive(Clone, Debug, PartialEq)]
pub struct ImportedRow {
    /// 1-based line in the CSV, header included
    pub line: usize,
    pub event_id: Uuid,
    pub substance_id: String,
    pub cycle_number: u32,
}

#[derive(Clone, Debug, Default)]
pub struct ImportReport {
    /// In input order
    pub rows: Vec<ImportedRow>,
    pub cycles: Vec<CycleInstance>,
}

/// Read import rows from a CSV file with a header line
pub fn read_import_csv(path: &Path) -> Result<Vec<ImportRow>> {
    let file = std::fs::File::open(path)?;
    read_import_rows(file)
}

pub fn read_import_rows<R: Read>(reader: R) -> Result<Vec<ImportRow>> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for result in reader.deserialize() {
        let row: ImportRow = result?;
        rows.push(row);
    }
    tracing::debug!("Read {} import rows", rows.len());
    Ok(rows)
}

/// Collaborators an import writes through
pub struct ImportTarget<'a> {
    pub reference: &'a dyn ReferenceData,
    pub inventory: &'a dyn Inventory,
    pub cycles: &'a dyn CycleStore,
    pub events: &'a dyn EventStore,
}

/// Import a batch of historical administrations
pub fn import_history(
    target: &ImportTarget<'_>,
    rows: &[ImportRow],
    defaults: &ProfileDefaults,
    now: DateTime<Utc>,
) -> Result<ImportReport> {
    let mut events = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let line = i + 2;
        let event = canonicalize_row(target, row)
            .map_err(|e| Error::Import(format!("line {}: {}", line, e)))?;
        events.push(event);
    }

    // Row indices grouped per substance, ordered by timestamp then input order
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, event) in events.iter().enumerate() {
        let substance = event.substance_id.clone().unwrap_or_default();
        groups.entry(substance).or_default().push(i);
    }

    let mut report = ImportReport::default();
    let mut assigned: Vec<Option<(String, u32)>> = vec![None; events.len()];

    for (substance_id, mut indices) in groups {
        if let Some(existing) = target.cycles.last_cycle(&substance_id)? {
            return Err(Error::Import(format!(
                "{} already has cycles (latest #{}); import needs a fresh history",
                substance_id, existing.cycle_number
            )));
        }

        indices.sort_by_key(|&i| (events[i].ts, i));
        let timestamps: Vec<DateTime<Utc>> = indices.iter().map(|&i| events[i].ts).collect();

        let rule = target.reference.cycle_rule(&substance_id)?;
        let settings = CycleSettings::resolve(rule.as_ref(), defaults)?;

        for segment in partition_cycles(&timestamps, settings.gap_days, now)? {
            let cycle = CycleInstance {
                id: Uuid::new_v4(),
                substance_id: substance_id.clone(),
                cycle_number: segment.cycle_number,
                start_ts: segment.start_ts,
                end_ts: segment.end_ts,
                status: segment.status,
            };
            for &i in &indices[segment.events.clone()] {
                events[i].cycle_instance_id = Some(cycle.id);
                assigned[i] = Some((substance_id.clone(), cycle.cycle_number));
            }
            report.cycles.push(cycle);
        }
    }

    for (i, (event, slot)) in events.iter().zip(assigned).enumerate() {
        if let Some((substance_id, cycle_number)) = slot {
            report.rows.push(ImportedRow {
                line: i + 2,
                event_id: event.id,
                substance_id,
                cycle_number,
            });
        }
    }

    events.sort_by_key(|e| e.ts);
    target.cycles.create_cycles(&report.cycles)?;
    target.events.append_events(&events)?;

    tracing::info!(
        "Imported {} events into {} cycles",
        events.len(),
        report.cycles.len()
    );
    Ok(report)
}

fn canonicalize_row(target: &ImportTarget<'_>, row: &ImportRow) -> Result<AdministrationEvent> {
    let ts = DateTime::parse_from_rfc3339(&row.ts)
        .map_err(|e| Error::Parse(format!("Invalid timestamp \"{}\": {}", row.ts, e)))?
        .with_timezone(&Utc);

    let quantity = parse_quantity(&row.dose)?;
    let ctx = target
        .reference
        .formulation_context(&row.formulation_id)?
        .ok_or_else(|| Error::NotFound(format!("formulation {}", row.formulation_id)))?;

    let vial = target.inventory.active_vial(&ctx.formulation.id)?;
    let vial_ctx = vial.as_ref().map(|v| v.dose_context());
    let calibration = resolve_calibration(
        target.reference,
        target.inventory,
        &ctx,
        vial.as_ref(),
        &quantity,
    )?;
    let per_unit = calibration.as_ref().map(|c| c.mean_volume_ml_per_unit);

    let dose = compute_dose(&quantity, vial_ctx.as_ref(), per_unit)?;
    if quantity.kind == QuantityKind::DeviceUnits && dose.dose_volume_ml.is_none() {
        return Err(Error::CalibrationMissing(format!(
            "cannot convert \"{}\" to a volume",
            row.dose
        )));
    }
    let cost_usd = match (&vial, &vial_ctx) {
        (Some(v), Some(vc)) => event_cost_from_vial(&dose, vc, v.cost_usd),
        _ => None,
    };

    let snapshot = build_snapshot(target.reference, &ctx, calibration)?;

    Ok(AdministrationEvent {
        id: Uuid::new_v4(),
        ts,
        formulation_id: ctx.formulation.id.clone(),
        substance_id: Some(ctx.formulation.substance_id.clone()),
        vial_id: vial.map(|v| v.id),
        cycle_instance_id: None,
        input_text: row.dose.clone(),
        input_value: quantity.value,
        input_unit: quantity.unit,
        input_kind: quantity.kind,
        dose_mass_mg: dose.dose_mass_mg,
        dose_volume_ml: dose.dose_volume_ml,
        eff_systemic_p05_mg: None,
        eff_systemic_p50_mg: None,
        eff_systemic_p95_mg: None,
        eff_cns_p05_mg: None,
        eff_cns_p50_mg: None,
        eff_cns_p95_mg: None,
        mc_n: None,
        mc_seed: None,
        model_snapshot: snapshot,
        cost_usd,
        deleted_at: None,
    })
}
