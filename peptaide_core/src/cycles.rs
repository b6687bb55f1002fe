//! Cycle segmentation.
//!
//! A substance's administration history is split into cycles wherever two
//! consecutive events are at least `gap_days` apart. The online rule
//! ([`suggest_cycle_action`] + [`plan_cycle`]) assigns one event at a time;
//! [`partition_cycles`] does the same for a sorted history in one pass. Both
//! produce the same `(start_ts, end_ts, status)` tuples once the online side
//! settles its final cycle with [`settle_end_ts`].

use crate::repository::CycleStore;
use crate::{CycleInstance, CycleRule, CycleStatus, Error, ProfileDefaults, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use uuid::Uuid;

const MS_PER_DAY: f64 = 86_400_000.0;

// ============================================================================
// Settings
// ============================================================================

/// Effective cycle settings for one substance
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CycleSettings {
    pub gap_days: f64,
    pub auto_start_first_cycle: bool,
}

impl CycleSettings {
    /// Substance rule if present, otherwise profile defaults
    pub fn resolve(rule: Option<&CycleRule>, defaults: &ProfileDefaults) -> Result<Self> {
        let settings = match rule {
            Some(r) => CycleSettings {
                gap_days: r.gap_days_to_suggest_new_cycle,
                auto_start_first_cycle: r.auto_start_first_cycle,
            },
            None => CycleSettings {
                gap_days: defaults.cycle_gap_default_days,
                auto_start_first_cycle: true,
            },
        };
        validate_gap_days(settings.gap_days)?;
        Ok(settings)
    }
}

pub fn validate_gap_days(gap_days: f64) -> Result<()> {
    if !gap_days.is_finite() || gap_days < 0.0 {
        return Err(Error::Cycle(format!(
            "Gap threshold must be a finite non-negative number of days (got {})",
            gap_days
        )));
    }
    Ok(())
}

fn gap_reached(earlier: DateTime<Utc>, later: DateTime<Utc>, gap_days: f64) -> bool {
    (later - earlier).num_milliseconds() as f64 >= gap_days * MS_PER_DAY
}

// ============================================================================
// Online Rule
// ============================================================================

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleAction {
    StartFirstCycle,
    SuggestNewCycle,
    ContinueActiveCycle,
    NoAction,
}

/// Decide what a new event means for the substance's cycles
pub fn suggest_cycle_action(
    last_event_ts: Option<DateTime<Utc>>,
    new_event_ts: DateTime<Utc>,
    gap_days: f64,
    auto_start_first_cycle: bool,
    has_active_cycle: bool,
) -> CycleAction {
    let last = match last_event_ts {
        None if auto_start_first_cycle => return CycleAction::StartFirstCycle,
        None => return CycleAction::NoAction,
        Some(ts) => ts,
    };

    if gap_reached(last, new_event_ts, gap_days) {
        CycleAction::SuggestNewCycle
    } else if has_active_cycle {
        CycleAction::ContinueActiveCycle
    } else {
        CycleAction::StartFirstCycle
    }
}

/// Storage changes implied by a [`CycleAction`]
#[derive(Clone, Debug, PartialEq)]
pub enum CyclePlan {
    /// Event is not assigned to a cycle
    Unassigned,
    /// Attach to an existing active cycle
    Attach(Uuid),
    /// Open a new cycle and attach to it
    Create(CycleInstance),
    /// Complete the active cycle, then open a new one
    CompleteAndCreate {
        complete_id: Uuid,
        end_ts: DateTime<Utc>,
        cycle: CycleInstance,
    },
}

impl CyclePlan {
    /// Cycle the event ends up attached to
    pub fn cycle_id(&self) -> Option<Uuid> {
        match self {
            CyclePlan::Unassigned => None,
            CyclePlan::Attach(id) => Some(*id),
            CyclePlan::Create(c) | CyclePlan::CompleteAndCreate { cycle: c, .. } => Some(c.id),
        }
    }
}

/// The cycle a new event would open
pub fn next_cycle(
    substance_id: &str,
    last_cycle: Option<&CycleInstance>,
    start_ts: DateTime<Utc>,
    id: Uuid,
) -> CycleInstance {
    CycleInstance {
        id,
        substance_id: substance_id.to_string(),
        cycle_number: last_cycle.map_or(1, |c| c.cycle_number + 1),
        start_ts,
        end_ts: None,
        status: CycleStatus::Active,
    }
}

/// Turn an action into a concrete plan.
///
/// `new_cycle_id` is used only if a cycle is created.
pub fn plan_cycle(
    action: CycleAction,
    substance_id: &str,
    active: Option<&CycleInstance>,
    last_cycle: Option<&CycleInstance>,
    last_event_ts: Option<DateTime<Utc>>,
    new_event_ts: DateTime<Utc>,
    new_cycle_id: Uuid,
) -> CyclePlan {
    match (action, active) {
        (CycleAction::SuggestNewCycle, Some(active)) => {
            let end_ts = last_event_ts.map_or(active.start_ts, |ts| ts.max(active.start_ts));
            CyclePlan::CompleteAndCreate {
                complete_id: active.id,
                end_ts,
                cycle: next_cycle(substance_id, last_cycle, new_event_ts, new_cycle_id),
            }
        }
        (CycleAction::SuggestNewCycle, None) | (CycleAction::StartFirstCycle, None) => {
            CyclePlan::Create(next_cycle(
                substance_id,
                last_cycle,
                new_event_ts,
                new_cycle_id,
            ))
        }
        (_, Some(active)) => CyclePlan::Attach(active.id),
        (CycleAction::ContinueActiveCycle, None) | (CycleAction::NoAction, None) => {
            CyclePlan::Unassigned
        }
    }
}

/// End timestamp for an active cycle that has gone quiet for at least the
/// gap threshold, measured from its last event (or its start when it has
/// none since starting).
pub fn settle_end_ts(
    active: &CycleInstance,
    last_event_ts: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    gap_days: f64,
) -> Option<DateTime<Utc>> {
    let reference = last_event_ts.map_or(active.start_ts, |ts| ts.max(active.start_ts));
    gap_reached(reference, now, gap_days).then_some(reference)
}

// ============================================================================
// Batch Partition
// ============================================================================

/// One cycle inferred from a sorted history
#[derive(Clone, Debug, PartialEq)]
pub struct CycleSegment {
    pub cycle_number: u32,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub status: CycleStatus,
    /// Indices into the input slice
    pub events: Range<usize>,
}

/// Split ascending timestamps into maximal runs with consecutive gaps below
/// `gap_days`. Every run but the last is completed; the last is active while
/// `now` is still within the gap of its final event.
pub fn partition_cycles(
    sorted_ts: &[DateTime<Utc>],
    gap_days: f64,
    now: DateTime<Utc>,
) -> Result<Vec<CycleSegment>> {
    validate_gap_days(gap_days)?;
    if sorted_ts.windows(2).any(|w| w[1] < w[0]) {
        return Err(Error::Cycle("Timestamps must be sorted ascending.".into()));
    }

    let mut segments = Vec::new();
    let mut run_start = 0;

    for i in 1..=sorted_ts.len() {
        let boundary = i == sorted_ts.len() || gap_reached(sorted_ts[i - 1], sorted_ts[i], gap_days);
        if !boundary {
            continue;
        }

        let start_ts = sorted_ts[run_start];
        let last_ts = sorted_ts[i - 1];
        let is_final = i == sorted_ts.len();
        let (status, end_ts) = if is_final && !gap_reached(last_ts, now, gap_days) {
            (CycleStatus::Active, None)
        } else {
            (CycleStatus::Completed, Some(last_ts))
        };

        segments.push(CycleSegment {
            cycle_number: segments.len() as u32 + 1,
            start_ts,
            end_ts,
            status,
            events: run_start..i,
        });
        run_start = i;
    }

    Ok(segments)
}

/// Replay the online rule over ascending timestamps, then settle the final
/// cycle at `now`. Used to check the online path against [`partition_cycles`].
pub fn replay_online(
    substance_id: &str,
    sorted_ts: &[DateTime<Utc>],
    gap_days: f64,
    now: DateTime<Utc>,
) -> Result<Vec<CycleInstance>> {
    validate_gap_days(gap_days)?;

    let mut cycles: Vec<CycleInstance> = Vec::new();
    let mut last_event: Option<DateTime<Utc>> = None;

    for &ts in sorted_ts {
        let active_idx = cycles.iter().position(|c| c.status == CycleStatus::Active);
        let action = suggest_cycle_action(last_event, ts, gap_days, true, active_idx.is_some());
        let plan = plan_cycle(
            action,
            substance_id,
            active_idx.map(|i| &cycles[i]),
            cycles.last(),
            last_event,
            ts,
            Uuid::new_v4(),
        );

        match plan {
            CyclePlan::CompleteAndCreate { end_ts, cycle, .. } => {
                if let Some(i) = active_idx {
                    cycles[i].status = CycleStatus::Completed;
                    cycles[i].end_ts = Some(end_ts);
                }
                cycles.push(cycle);
            }
            CyclePlan::Create(cycle) => cycles.push(cycle),
            CyclePlan::Attach(_) | CyclePlan::Unassigned => {}
        }
        last_event = Some(ts);
    }

    if let Some(active) = cycles.iter_mut().find(|c| c.status == CycleStatus::Active) {
        if let Some(end_ts) = settle_end_ts(active, last_event, now, gap_days) {
            active.status = CycleStatus::Completed;
            active.end_ts = Some(end_ts);
        }
    }

    Ok(cycles)
}

// ============================================================================
// Manual Operations
// ============================================================================

/// Open a new cycle now; fails if one is already active
pub fn start_cycle_now<S>(store: &S, substance_id: &str, now: DateTime<Utc>) -> Result<CycleInstance>
where
    S: CycleStore + ?Sized,
{
    if let Some(active) = store.active_cycle(substance_id)? {
        return Err(Error::Cycle(format!(
            "{} already has active cycle #{}",
            substance_id, active.cycle_number
        )));
    }
    let last = store.last_cycle(substance_id)?;
    let cycle = next_cycle(substance_id, last.as_ref(), now, Uuid::new_v4());
    store.create_cycle(&cycle)?;
    tracing::info!("Started cycle #{} for {}", cycle.cycle_number, substance_id);
    Ok(cycle)
}

/// Complete the active cycle at `max(now, start_ts)`
pub fn end_cycle_now<S>(store: &S, substance_id: &str, now: DateTime<Utc>) -> Result<CycleInstance>
where
    S: CycleStore + ?Sized,
{
    let active = store
        .active_cycle(substance_id)?
        .ok_or_else(|| Error::Cycle(format!("{} has no active cycle", substance_id)))?;
    let closed = store.complete_cycle(active.id, now)?;
    tracing::info!("Completed cycle #{} for {}", closed.cycle_number, substance_id);
    Ok(closed)
}

/// Mark the active cycle abandoned; its number is not reused
pub fn abandon_cycle<S>(store: &S, substance_id: &str, now: DateTime<Utc>) -> Result<CycleInstance>
where
    S: CycleStore + ?Sized,
{
    let active = store
        .active_cycle(substance_id)?
        .ok_or_else(|| Error::Cycle(format!("{} has no active cycle", substance_id)))?;
    let closed = store.abandon_cycle(active.id, now)?;
    tracing::info!("Abandoned cycle #{} for {}", closed.cycle_number, substance_id);
    Ok(closed)
}

/// Complete the active cycle if it has been quiet for the gap threshold
pub fn settle_active_cycle<S>(
    store: &S,
    substance_id: &str,
    last_event_ts: Option<DateTime<Utc>>,
    gap_days: f64,
    now: DateTime<Utc>,
) -> Result<Option<CycleInstance>>
where
    S: CycleStore + ?Sized,
{
    validate_gap_days(gap_days)?;
    let Some(active) = store.active_cycle(substance_id)? else {
        return Ok(None);
    };
    match settle_end_ts(&active, last_event_ts, now, gap_days) {
        Some(end_ts) => {
            let closed = store.complete_cycle(active.id, end_ts)?;
            tracing::info!(
                "Settled quiet cycle #{} for {} at {}",
                closed.cycle_number,
                substance_id,
                end_ts
            );
            Ok(Some(closed))
        }
        None => Ok(None),
    }
}
