//! Recording and querying step completions against the local event log.

use std::collections::BTreeMap;

use famsync_core::{
    day_key_for, derive_routine_complete, derive_step_complete, project_day, truncate_to_millis,
    ChildId, ChildProfile, Clock, CompletionEvent, CompletionEventType, CompletionRule, DayKey,
    DayProgress, DeviceId, EventIdGenerator, Family, FamilyId, FamsyncError, Routine, RoutineId,
    RoutineStep, StepDayKey, StepId,
};
use tracing::info;

use crate::{EntityStore, LocalStore, SyncResult};

pub struct CompletionTracker<'a, L: LocalStore + ?Sized> {
    local: &'a L,
    clock: &'a dyn Clock,
    device_id: DeviceId,
    ids: EventIdGenerator,
}

impl<'a, L: LocalStore + ?Sized> CompletionTracker<'a, L> {
    /// Resumes id generation after the newest event this device wrote, so ids
    /// stay monotonic across restarts.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn new(local: &'a L, clock: &'a dyn Clock) -> SyncResult<Self> {
        let device_id = local.device_id()?;
        let last = local.latest_event_id_for_device(&device_id)?;
        Ok(Self {
            local,
            clock,
            device_id,
            ids: EventIdGenerator::resume_after(last),
        })
    }

    fn entities(&self) -> EntityStore<'a, L> {
        EntityStore::new(self.local, self.clock)
    }

    /// # Errors
    /// Returns [`FamsyncError::NotFound`] when the child, routine or step is
    /// missing, tombstoned or not related.
    pub fn complete_step(
        &self,
        child_id: ChildId,
        routine_id: RoutineId,
        step_id: StepId,
    ) -> SyncResult<CompletionEvent> {
        self.record(child_id, routine_id, step_id, CompletionEventType::Complete)
    }

    /// # Errors
    /// Same as [`CompletionTracker::complete_step`].
    pub fn undo_step(
        &self,
        child_id: ChildId,
        routine_id: RoutineId,
        step_id: StepId,
    ) -> SyncResult<CompletionEvent> {
        self.record(child_id, routine_id, step_id, CompletionEventType::Undo)
    }

    fn record(
        &self,
        child_id: ChildId,
        routine_id: RoutineId,
        step_id: StepId,
        event_type: CompletionEventType,
    ) -> SyncResult<CompletionEvent> {
        let entities = self.entities();
        let routine: Routine = entities.require(&routine_id.to_string())?;
        if routine.deleted_at.is_some() {
            return Err(FamsyncError::NotFound(format!("routine {routine_id} was deleted")));
        }
        let step: RoutineStep = entities.require(&step_id.to_string())?;
        if step.deleted_at.is_some() || step.routine_id != routine_id {
            return Err(FamsyncError::NotFound(format!(
                "step {step_id} in routine {routine_id}"
            )));
        }
        let child: ChildProfile = entities.require(&child_id.to_string())?;
        if child.family_id != routine.family_id {
            return Err(FamsyncError::NotFound(format!(
                "child {child_id} in family {}",
                routine.family_id
            )));
        }
        let family: Family = entities.require(&routine.family_id.to_string())?;

        let occurred_at = truncate_to_millis(self.clock.now());
        let event = CompletionEvent {
            id: self.ids.next_id(occurred_at)?,
            family_id: family.id,
            child_id,
            routine_id,
            step_id,
            event_type,
            occurred_at,
            local_day: day_key_for(occurred_at, &family.time_zone)?,
            device_id: self.device_id.clone(),
            synced: false,
        };
        self.local.append_event(&event)?;
        info!(
            event_id = %event.id,
            event_type = event_type.as_str(),
            child_id = %child_id,
            step_id = %step_id,
            day = %event.local_day,
            "recorded completion event"
        );
        Ok(event)
    }

    /// # Errors
    /// Propagates storage failures.
    pub fn is_step_complete(
        &self,
        child_id: ChildId,
        routine_id: RoutineId,
        step_id: StepId,
        day: &DayKey,
    ) -> SyncResult<bool> {
        let events = self.local.events_for_step_day(&StepDayKey {
            child_id,
            routine_id,
            step_id,
            day: day.clone(),
        })?;
        Ok(derive_step_complete(&events))
    }

    /// `false` when `step_ids` is empty.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn is_routine_complete(
        &self,
        routine_id: RoutineId,
        child_id: ChildId,
        step_ids: &[StepId],
        day: &DayKey,
    ) -> SyncResult<bool> {
        let rule = self
            .entities()
            .get::<Routine>(&routine_id.to_string())?
            .map_or(CompletionRule::AllStepsRequired, |routine| routine.completion_rule);
        let events: Vec<CompletionEvent> = self
            .local
            .events_for_child_day(child_id, day)?
            .into_iter()
            .filter(|event| event.routine_id == routine_id)
            .collect();
        Ok(derive_routine_complete(rule, step_ids, &events))
    }

    /// Replays the child's day over every routine currently assigned to them.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn day_progress(&self, child_id: ChildId, day: &DayKey) -> SyncResult<DayProgress> {
        let entities = self.entities();
        let mut routine_steps = BTreeMap::new();
        for routine in entities.routines_for_child(child_id)? {
            let steps = entities
                .live_steps(routine.id)?
                .into_iter()
                .map(|step| step.id)
                .collect();
            routine_steps.insert(routine.id, steps);
        }
        let events = self.local.events_for_child_day(child_id, day)?;
        Ok(project_day(child_id, day, &events, &routine_steps))
    }

    /// Today's day key in the family's time zone.
    ///
    /// # Errors
    /// Returns [`FamsyncError::NotFound`] for an unknown family.
    pub fn today(&self, family_id: FamilyId) -> SyncResult<DayKey> {
        let family: Family = self.entities().require(&family_id.to_string())?;
        day_key_for(self.clock.now(), &family.time_zone)
    }
}
