//! Typed create/read/update/soft-delete over the row contract.

use famsync_core::{
    next_update_stamp, truncate_to_millis, ChildId, ChildProfile, Clock, EntityRow, Family,
    FamilyId, FamsyncError, Replicated, Routine, RoutineAssignment, RoutineId, RoutineStep,
    Tombstoned,
};
use tracing::debug;

use crate::{LocalStore, SyncResult};

const UPDATE_ATTEMPTS: usize = 3;

pub struct EntityStore<'a, L: LocalStore + ?Sized> {
    local: &'a L,
    clock: &'a dyn Clock,
}

impl<'a, L: LocalStore + ?Sized> EntityStore<'a, L> {
    #[must_use]
    pub fn new(local: &'a L, clock: &'a dyn Clock) -> Self {
        Self { local, clock }
    }

    /// Inserts a new record; refuses to overwrite an existing id.
    ///
    /// # Errors
    /// Returns [`FamsyncError::InvalidState`] when the id is taken and
    /// propagates storage failures.
    pub fn create<T: Replicated>(&self, record: &T) -> SyncResult<T> {
        let row = record.to_row()?;
        if !self.local.put_row_if(&row, None, false)? {
            return Err(FamsyncError::InvalidState(format!(
                "{} {} already exists",
                T::COLLECTION,
                row.id
            )));
        }
        debug!(collection = %T::COLLECTION, row_id = %row.id, "created row");
        Ok(record.clone())
    }

    /// # Errors
    /// Propagates storage failures and undecodable rows.
    pub fn get<T: Replicated>(&self, id: &str) -> SyncResult<Option<T>> {
        self.local
            .get_row(T::COLLECTION, id)?
            .map(|row| T::from_row(&row))
            .transpose()
    }

    /// # Errors
    /// Returns [`FamsyncError::NotFound`] when the row is missing.
    pub fn require<T: Replicated>(&self, id: &str) -> SyncResult<T> {
        self.get(id)?
            .ok_or_else(|| FamsyncError::NotFound(format!("{} {id}", T::COLLECTION)))
    }

    /// Read-modify-write. `updated_at` is bumped strictly past the stored
    /// value; a write that races with a sync merge is retried from a fresh
    /// read.
    ///
    /// # Errors
    /// Returns [`FamsyncError::NotFound`] for missing rows, whatever `apply`
    /// returns, and [`FamsyncError::InvalidState`] when every attempt loses a
    /// race.
    pub fn update<T, F>(&self, id: &str, mut apply: F) -> SyncResult<T>
    where
        T: Replicated,
        F: FnMut(&mut T) -> SyncResult<()>,
    {
        for _ in 0..UPDATE_ATTEMPTS {
            let current: T = self.require(id)?;
            let previous = current.updated_at();
            let mut next = current;
            apply(&mut next)?;
            next.set_updated_at(next_update_stamp(previous, self.clock.now()));

            let row = next.to_row()?;
            if self.local.put_row_if(&row, Some(previous), false)? {
                return Ok(next);
            }
            debug!(
                collection = %T::COLLECTION,
                row_id = %id,
                "update raced with another write; retrying"
            );
        }
        Err(FamsyncError::InvalidState(format!(
            "{} {id} kept changing during update",
            T::COLLECTION
        )))
    }

    /// Sets the tombstone; a row that already carries one is returned as is.
    ///
    /// # Errors
    /// Same as [`EntityStore::update`].
    pub fn soft_delete<T: Tombstoned>(&self, id: &str) -> SyncResult<T> {
        let current: T = self.require(id)?;
        if current.deleted_at().is_some() {
            return Ok(current);
        }
        let at = truncate_to_millis(self.clock.now());
        self.update(id, |record: &mut T| {
            record.set_deleted_at(Some(at));
            Ok(())
        })
    }

    /// # Errors
    /// Propagates storage failures and undecodable rows.
    pub fn list_by_parent<T: Replicated>(
        &self,
        parent_id: &str,
        include_deleted: bool,
    ) -> SyncResult<Vec<T>> {
        decode_rows(self.local.rows_by_parent(T::COLLECTION, parent_id)?, include_deleted)
    }

    /// # Errors
    /// Propagates storage failures and undecodable rows.
    pub fn list_by_family<T: Replicated>(
        &self,
        family_id: FamilyId,
        include_deleted: bool,
    ) -> SyncResult<Vec<T>> {
        decode_rows(self.local.rows_by_family(T::COLLECTION, family_id)?, include_deleted)
    }

    /// # Errors
    /// Propagates storage failures and undecodable rows.
    pub fn find_by_secondary_key<T: Replicated>(&self, key: &str) -> SyncResult<Option<T>> {
        self.local
            .row_by_secondary_key(T::COLLECTION, key)?
            .map(|row| T::from_row(&row))
            .transpose()
    }

    /// Creates a routine and its steps in display order.
    ///
    /// # Errors
    /// Returns [`FamsyncError::Validation`] for a blank title or step label,
    /// [`FamsyncError::NotFound`] for an unknown family.
    pub fn create_routine(
        &self,
        family_id: FamilyId,
        title: &str,
        icon: Option<String>,
        step_labels: &[&str],
    ) -> SyncResult<(Routine, Vec<RoutineStep>)> {
        if title.trim().is_empty() {
            return Err(FamsyncError::Validation(
                "routine title MUST be provided".to_string(),
            ));
        }
        if step_labels.iter().any(|label| label.trim().is_empty()) {
            return Err(FamsyncError::Validation(
                "step labels MUST NOT be blank".to_string(),
            ));
        }
        self.require::<Family>(&family_id.to_string())?;

        let now = self.clock.now();
        let routine = self.create(&Routine::new(family_id, title, icon, now))?;
        let mut steps = Vec::with_capacity(step_labels.len());
        for (position, label) in step_labels.iter().enumerate() {
            let position = u32::try_from(position).map_err(|_| {
                FamsyncError::Validation("too many steps in one routine".to_string())
            })?;
            steps.push(self.create(&RoutineStep::new(&routine, label, position, now))?);
        }
        Ok((routine, steps))
    }

    /// Live steps ordered by position.
    ///
    /// # Errors
    /// Propagates storage failures and undecodable rows.
    pub fn live_steps(&self, routine_id: RoutineId) -> SyncResult<Vec<RoutineStep>> {
        let mut steps: Vec<RoutineStep> = self.list_by_parent(&routine_id.to_string(), false)?;
        steps.sort_by(|left, right| {
            left.position
                .cmp(&right.position)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(steps)
    }

    /// Assigns `routine` to a child, reusing a live assignment when one exists.
    ///
    /// # Errors
    /// Returns [`FamsyncError::InvalidState`] when the child and routine
    /// belong to different families.
    pub fn assign(&self, routine: &Routine, child_id: ChildId) -> SyncResult<RoutineAssignment> {
        let child: ChildProfile = self.require(&child_id.to_string())?;
        if child.family_id != routine.family_id {
            return Err(FamsyncError::InvalidState(format!(
                "child {child_id} is not in family {}",
                routine.family_id
            )));
        }

        let existing: Vec<RoutineAssignment> = self.list_by_parent(&child_id.to_string(), false)?;
        if let Some(live) = existing
            .into_iter()
            .find(|assignment| assignment.routine_id == routine.id)
        {
            if live.is_active {
                return Ok(live);
            }
            return self.update(&live.id.to_string(), |assignment: &mut RoutineAssignment| {
                assignment.is_active = true;
                Ok(())
            });
        }
        self.create(&RoutineAssignment::new(routine, child_id, self.clock.now()))
    }

    /// Live routines with an active assignment for the child.
    ///
    /// # Errors
    /// Propagates storage failures and undecodable rows.
    pub fn routines_for_child(&self, child_id: ChildId) -> SyncResult<Vec<Routine>> {
        let assignments: Vec<RoutineAssignment> =
            self.list_by_parent(&child_id.to_string(), false)?;
        let mut routines = Vec::new();
        for assignment in assignments.iter().filter(|assignment| assignment.is_active) {
            if let Some(routine) = self.get::<Routine>(&assignment.routine_id.to_string())? {
                if routine.deleted_at.is_none() {
                    routines.push(routine);
                }
            }
        }
        Ok(routines)
    }
}

fn decode_rows<T: Replicated>(rows: Vec<EntityRow>, include_deleted: bool) -> SyncResult<Vec<T>> {
    rows.iter()
        .filter(|row| include_deleted || !row.is_deleted())
        .map(T::from_row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLocalStore;
    use famsync_core::{parse_rfc3339_utc, ManualClock};
    use time::{Duration, OffsetDateTime};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn start() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-02-07T07:00:00Z"))
    }

    #[test]
    fn update_bumps_updated_at_even_when_clock_stalls() {
        let local = MemoryLocalStore::new("device-a");
        let clock = ManualClock::new(start());
        let store = EntityStore::new(&local, &clock);
        let family = must_ok(store.create(&must_ok(Family::new("Rivera", "UTC", start()))));

        let renamed: Family = must_ok(store.update(&family.id.to_string(), |family: &mut Family| {
            family.name = "Rivera-Lopez".to_string();
            Ok(())
        }));
        assert!(renamed.updated_at > family.updated_at);
        assert_eq!(renamed.created_at, family.created_at);

        let again: Family = must_ok(store.update(&family.id.to_string(), |_: &mut Family| Ok(())));
        assert!(again.updated_at > renamed.updated_at);
    }

    #[test]
    fn create_refuses_duplicate_ids() {
        let local = MemoryLocalStore::new("device-a");
        let clock = ManualClock::new(start());
        let store = EntityStore::new(&local, &clock);
        let family = must_ok(Family::new("Rivera", "UTC", start()));
        must_ok(store.create(&family));
        assert!(matches!(store.create(&family), Err(FamsyncError::InvalidState(_))));
    }

    #[test]
    fn soft_delete_hides_rows_but_keeps_them() {
        let local = MemoryLocalStore::new("device-a");
        let clock = ManualClock::new(start());
        let store = EntityStore::new(&local, &clock);
        let family = must_ok(store.create(&must_ok(Family::new("Rivera", "UTC", start()))));
        let (routine, steps) =
            must_ok(store.create_routine(family.id, "Morning", None, &["A", "B"]));

        clock.advance(Duration::minutes(1));
        let deleted: RoutineStep = must_ok(store.soft_delete(&steps[0].id.to_string()));
        assert_eq!(deleted.deleted_at, Some(start() + Duration::minutes(1)));
        assert_eq!(deleted.updated_at, start() + Duration::minutes(1));

        let live = must_ok(store.live_steps(routine.id));
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].label, "B");
        let all: Vec<RoutineStep> = must_ok(store.list_by_parent(&routine.id.to_string(), true));
        assert_eq!(all.len(), 2);

        let twice: RoutineStep = must_ok(store.soft_delete(&steps[0].id.to_string()));
        assert_eq!(twice.updated_at, deleted.updated_at);
    }

    #[test]
    fn update_missing_row_is_not_found() {
        let local = MemoryLocalStore::new("device-a");
        let clock = ManualClock::new(start());
        let store = EntityStore::new(&local, &clock);
        let result = store.update("01J0000000000000000000000A", |_: &mut Routine| Ok(()));
        assert!(matches!(result, Err(FamsyncError::NotFound(_))));
    }

    #[test]
    fn assignments_are_reused_and_drive_child_routines() {
        let local = MemoryLocalStore::new("device-a");
        let clock = ManualClock::new(start());
        let store = EntityStore::new(&local, &clock);
        let family = must_ok(store.create(&must_ok(Family::new("Rivera", "UTC", start()))));
        let child = must_ok(store.create(&ChildProfile::new(family.id, "Ana", None, start())));
        let (morning, _) = must_ok(store.create_routine(family.id, "Morning", None, &["A"]));
        let (bedtime, _) = must_ok(store.create_routine(family.id, "Bedtime", None, &["B"]));

        let first = must_ok(store.assign(&morning, child.id));
        let second = must_ok(store.assign(&morning, child.id));
        assert_eq!(first.id, second.id);
        must_ok(store.assign(&bedtime, child.id));

        clock.advance(Duration::seconds(1));
        must_ok(store.soft_delete::<Routine>(&bedtime.id.to_string()));
        let routines = must_ok(store.routines_for_child(child.id));
        assert_eq!(routines.len(), 1);
        assert_eq!(routines[0].id, morning.id);
    }

    #[test]
    fn create_routine_validates_input() {
        let local = MemoryLocalStore::new("device-a");
        let clock = ManualClock::new(start());
        let store = EntityStore::new(&local, &clock);
        assert!(matches!(
            store.create_routine(FamilyId::new(), "Morning", None, &["A"]),
            Err(FamsyncError::NotFound(_))
        ));
        assert!(matches!(
            store.create_routine(FamilyId::new(), " ", None, &["A"]),
            Err(FamsyncError::Validation(_))
        ));
    }
}
