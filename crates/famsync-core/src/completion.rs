//! Event-sourced completion state.
//!
//! A step is done for a day iff the last event in canonical order for that
//! (child, routine, step, day) is a completion. Nothing here caches state;
//! callers replay the log each time.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::entity::CompletionRule;
use crate::{ChildId, DayKey, DeviceId, EventId, FamilyId, RoutineId, StepId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionEventType {
    Complete,
    Undo,
}

impl CompletionEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Undo => "UNDO",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "COMPLETE" => Some(Self::Complete),
            "UNDO" => Some(Self::Undo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionEvent {
    pub id: EventId,
    pub family_id: FamilyId,
    pub child_id: ChildId,
    pub routine_id: RoutineId,
    pub step_id: StepId,
    pub event_type: CompletionEventType,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    /// Fixed when the event is recorded; a later time zone change does not
    /// move it to another day.
    pub local_day: DayKey,
    pub device_id: DeviceId,
    /// Local bookkeeping only, never replicated.
    #[serde(skip)]
    pub synced: bool,
}

impl CompletionEvent {
    #[must_use]
    pub fn step_key(&self) -> StepDayKey {
        StepDayKey {
            child_id: self.child_id,
            routine_id: self.routine_id,
            step_id: self.step_id,
            day: self.local_day.clone(),
        }
    }
}

/// The four keys that scope one step's completion history.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StepDayKey {
    pub child_id: ChildId,
    pub routine_id: RoutineId,
    pub step_id: StepId,
    pub day: DayKey,
}

#[must_use]
pub fn canonical_cmp(left: &CompletionEvent, right: &CompletionEvent) -> Ordering {
    left.occurred_at
        .cmp(&right.occurred_at)
        .then_with(|| left.id.cmp(&right.id))
}

pub fn canonical_order(events: &mut [CompletionEvent]) {
    events.sort_by(canonical_cmp);
}

/// `events` MUST already be scoped to a single [`StepDayKey`]. Input order
/// does not matter.
#[must_use]
pub fn derive_step_complete(events: &[CompletionEvent]) -> bool {
    events
        .iter()
        .max_by(|left, right| canonical_cmp(left, right))
        .is_some_and(|last| last.event_type == CompletionEventType::Complete)
}

/// `events` MUST be scoped to one child, routine and day; events of steps
/// outside `step_ids` are ignored.
#[must_use]
pub fn derive_routine_complete(
    rule: CompletionRule,
    step_ids: &[StepId],
    events: &[CompletionEvent],
) -> bool {
    match rule {
        CompletionRule::AllStepsRequired => {
            if step_ids.is_empty() {
                return false;
            }
            step_ids.iter().all(|step_id| {
                let scoped: Vec<CompletionEvent> = events
                    .iter()
                    .filter(|event| event.step_id == *step_id)
                    .cloned()
                    .collect();
                derive_step_complete(&scoped)
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutineProgress {
    pub steps: BTreeMap<StepId, bool>,
    pub completed: usize,
    pub total: usize,
    pub complete: bool,
}

/// Per-routine view of one child's day, rebuilt from the log on every call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DayProgress {
    pub child_id: ChildId,
    pub day: DayKey,
    pub event_count: usize,
    pub routines: BTreeMap<RoutineId, RoutineProgress>,
}

/// Projects a child's day. `routine_steps` lists the live steps of every
/// routine to report; events of unlisted routines are counted but otherwise
/// ignored.
#[must_use]
pub fn project_day(
    child_id: ChildId,
    day: &DayKey,
    events: &[CompletionEvent],
    routine_steps: &BTreeMap<RoutineId, Vec<StepId>>,
) -> DayProgress {
    let mut scoped: Vec<&CompletionEvent> = events
        .iter()
        .filter(|event| event.child_id == child_id && event.local_day == *day)
        .collect();
    scoped.sort_by(|left, right| canonical_cmp(left, right));

    let mut last_by_step: BTreeMap<(RoutineId, StepId), CompletionEventType> = BTreeMap::new();
    for event in &scoped {
        last_by_step.insert((event.routine_id, event.step_id), event.event_type);
    }

    let mut routines = BTreeMap::new();
    for (routine_id, step_ids) in routine_steps {
        let unique: BTreeSet<StepId> = step_ids.iter().copied().collect();
        let steps: BTreeMap<StepId, bool> = unique
            .iter()
            .map(|step_id| {
                let done = last_by_step.get(&(*routine_id, *step_id))
                    == Some(&CompletionEventType::Complete);
                (*step_id, done)
            })
            .collect();
        let completed = steps.values().filter(|done| **done).count();
        let total = steps.len();
        routines.insert(
            *routine_id,
            RoutineProgress {
                steps,
                completed,
                total,
                complete: total > 0 && completed == total,
            },
        );
    }

    DayProgress {
        child_id,
        day: day.clone(),
        event_count: scoped.len(),
        routines,
    }
}
