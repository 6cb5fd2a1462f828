//! In-process stores for tests and embedders that bring their own persistence.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use famsync_core::{
    canonical_cmp, ChildId, Collection, CompletionEvent, CursorField, DayKey, DeviceId,
    EntityRow, EventId, FamilyId, FamsyncError, StepDayKey,
};
use time::OffsetDateTime;

use crate::{LocalStore, RemoteDocument, RemotePath, RemoteStore, SyncResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    row: EntityRow,
    pushed_updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
struct LocalState {
    events: BTreeMap<EventId, CompletionEvent>,
    rows: BTreeMap<(Collection, String), StoredRow>,
    cursors: BTreeMap<(Collection, String), OffsetDateTime>,
}

#[derive(Debug)]
pub struct MemoryLocalStore {
    device_id: DeviceId,
    state: Mutex<LocalState>,
}

impl MemoryLocalStore {
    #[must_use]
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: DeviceId(device_id.to_string()),
            state: Mutex::new(LocalState::default()),
        }
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        lock(&self.state).events.len()
    }

    #[must_use]
    pub fn row_count(&self, collection: Collection) -> usize {
        lock(&self.state)
            .rows
            .keys()
            .filter(|(stored, _)| *stored == collection)
            .count()
    }
}

fn sorted_rows<'a>(rows: impl Iterator<Item = &'a StoredRow>) -> Vec<EntityRow> {
    let mut rows: Vec<EntityRow> = rows.map(|stored| stored.row.clone()).collect();
    rows.sort_by(|left, right| {
        left.created_at
            .cmp(&right.created_at)
            .then_with(|| left.id.cmp(&right.id))
    });
    rows
}

impl LocalStore for MemoryLocalStore {
    fn device_id(&self) -> SyncResult<DeviceId> {
        Ok(self.device_id.clone())
    }

    fn append_event(&self, event: &CompletionEvent) -> SyncResult<bool> {
        let mut state = lock(&self.state);
        if state.events.contains_key(&event.id) {
            return Ok(false);
        }
        state.events.insert(event.id, event.clone());
        Ok(true)
    }

    fn events_for_step_day(&self, key: &StepDayKey) -> SyncResult<Vec<CompletionEvent>> {
        let state = lock(&self.state);
        let mut events: Vec<CompletionEvent> = state
            .events
            .values()
            .filter(|event| event.step_key() == *key)
            .cloned()
            .collect();
        events.sort_by(canonical_cmp);
        Ok(events)
    }

    fn events_for_child_day(
        &self,
        child_id: ChildId,
        day: &DayKey,
    ) -> SyncResult<Vec<CompletionEvent>> {
        let state = lock(&self.state);
        let mut events: Vec<CompletionEvent> = state
            .events
            .values()
            .filter(|event| event.child_id == child_id && event.local_day == *day)
            .cloned()
            .collect();
        events.sort_by(canonical_cmp);
        Ok(events)
    }

    fn unsynced_events(
        &self,
        family_id: FamilyId,
        limit: usize,
    ) -> SyncResult<Vec<CompletionEvent>> {
        let state = lock(&self.state);
        Ok(state
            .events
            .values()
            .filter(|event| event.family_id == family_id && !event.synced)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_events_synced(&self, ids: &[EventId]) -> SyncResult<usize> {
        let mut state = lock(&self.state);
        let mut marked = 0;
        for id in ids {
            if let Some(event) = state.events.get_mut(id) {
                if !event.synced {
                    event.synced = true;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    fn latest_event_id_for_device(&self, device_id: &DeviceId) -> SyncResult<Option<EventId>> {
        let state = lock(&self.state);
        Ok(state
            .events
            .values()
            .filter(|event| event.device_id == *device_id)
            .map(|event| event.id)
            .max())
    }

    fn get_row(&self, collection: Collection, id: &str) -> SyncResult<Option<EntityRow>> {
        let state = lock(&self.state);
        Ok(state
            .rows
            .get(&(collection, id.to_string()))
            .map(|stored| stored.row.clone()))
    }

    fn put_row_if(
        &self,
        row: &EntityRow,
        expected_updated_at: Option<OffsetDateTime>,
        pushed: bool,
    ) -> SyncResult<bool> {
        let mut state = lock(&self.state);
        let key = (row.collection, row.id.clone());
        let current = state.rows.get(&key);
        let previous_push = match (current, expected_updated_at) {
            (None, None) => None,
            (Some(stored), Some(expected)) if stored.row.updated_at == expected => {
                stored.pushed_updated_at
            }
            _ => return Ok(false),
        };
        state.rows.insert(
            key,
            StoredRow {
                row: row.clone(),
                pushed_updated_at: if pushed {
                    Some(row.updated_at)
                } else {
                    previous_push
                },
            },
        );
        Ok(true)
    }

    fn rows_by_family(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<Vec<EntityRow>> {
        let state = lock(&self.state);
        Ok(sorted_rows(state.rows.values().filter(|stored| {
            stored.row.collection == collection && stored.row.family_id == family_id
        })))
    }

    fn rows_by_parent(
        &self,
        collection: Collection,
        parent_id: &str,
    ) -> SyncResult<Vec<EntityRow>> {
        let state = lock(&self.state);
        Ok(sorted_rows(state.rows.values().filter(|stored| {
            stored.row.collection == collection
                && stored.row.parent_id.as_deref() == Some(parent_id)
        })))
    }

    fn row_by_secondary_key(
        &self,
        collection: Collection,
        key: &str,
    ) -> SyncResult<Option<EntityRow>> {
        let state = lock(&self.state);
        Ok(sorted_rows(state.rows.values().filter(|stored| {
            stored.row.collection == collection
                && stored.row.secondary_key.as_deref() == Some(key)
        }))
        .into_iter()
        .next())
    }

    fn dirty_rows(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<Vec<EntityRow>> {
        let state = lock(&self.state);
        Ok(sorted_rows(state.rows.values().filter(|stored| {
            stored.row.collection == collection
                && stored.row.family_id == family_id
                && stored.pushed_updated_at != Some(stored.row.updated_at)
        })))
    }

    fn mark_row_pushed(
        &self,
        collection: Collection,
        id: &str,
        updated_at: OffsetDateTime,
    ) -> SyncResult<bool> {
        let mut state = lock(&self.state);
        match state.rows.get_mut(&(collection, id.to_string())) {
            Some(stored) if stored.row.updated_at == updated_at => {
                stored.pushed_updated_at = Some(updated_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_row(&self, collection: Collection, id: &str) -> SyncResult<bool> {
        if !collection.allows_physical_delete() {
            return Err(FamsyncError::InvalidState(format!(
                "{collection} rows are tombstoned, never deleted"
            )));
        }
        let mut state = lock(&self.state);
        Ok(state.rows.remove(&(collection, id.to_string())).is_some())
    }

    fn sync_cursor(
        &self,
        collection: Collection,
        scope: &str,
    ) -> SyncResult<Option<OffsetDateTime>> {
        let state = lock(&self.state);
        Ok(state.cursors.get(&(collection, scope.to_string())).copied())
    }

    fn advance_sync_cursor(
        &self,
        collection: Collection,
        scope: &str,
        at: OffsetDateTime,
    ) -> SyncResult<OffsetDateTime> {
        let mut state = lock(&self.state);
        let cursor = state
            .cursors
            .entry((collection, scope.to_string()))
            .or_insert(at);
        if at > *cursor {
            *cursor = at;
        }
        Ok(*cursor)
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    documents: BTreeMap<RemotePath, BTreeMap<String, RemoteDocument>>,
    offline: bool,
    writes_before_failure: Option<usize>,
    rejected_ids: BTreeSet<String>,
    write_count: usize,
}

/// Shared document store held in memory, with switches for simulating an
/// unreachable or flaky backend.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
}

impl MemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    /// Lets `writes` more writes through, then fails every write until
    /// [`MemoryRemoteStore::clear_write_failures`] is called.
    pub fn fail_writes_after(&self, writes: usize) {
        lock(&self.state).writes_before_failure = Some(writes);
    }

    /// Refuses every write of the document with this id, as a backend
    /// rule rejecting one bad payload would.
    pub fn reject_document(&self, id: &str) {
        lock(&self.state).rejected_ids.insert(id.to_string());
    }

    pub fn clear_write_failures(&self) {
        let mut state = lock(&self.state);
        state.writes_before_failure = None;
        state.rejected_ids.clear();
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.state).write_count
    }

    #[must_use]
    pub fn documents(&self, path: &RemotePath) -> Vec<RemoteDocument> {
        lock(&self.state)
            .documents
            .get(path)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn document(&self, path: &RemotePath, id: &str) -> Option<RemoteDocument> {
        lock(&self.state)
            .documents
            .get(path)
            .and_then(|documents| documents.get(id).cloned())
    }

    /// Writes a document directly, bypassing failure injection and counters.
    pub fn seed(&self, path: &RemotePath, document: RemoteDocument) {
        lock(&self.state)
            .documents
            .entry(*path)
            .or_default()
            .insert(document.id.clone(), document);
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn set_document(&self, path: &RemotePath, document: &RemoteDocument) -> SyncResult<()> {
        let mut state = lock(&self.state);
        if state.offline {
            return Err(FamsyncError::SyncFailure("remote store is offline".to_string()));
        }
        if state.rejected_ids.contains(&document.id) {
            return Err(FamsyncError::SyncFailure(format!(
                "remote rejected {path}/{}",
                document.id
            )));
        }
        if let Some(remaining) = state.writes_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(FamsyncError::SyncFailure(format!(
                    "injected write failure for {path}/{}",
                    document.id
                )));
            }
            *remaining -= 1;
        }

        state
            .documents
            .entry(*path)
            .or_default()
            .insert(document.id.clone(), document.clone());
        state.write_count += 1;
        Ok(())
    }

    fn query_after(
        &self,
        path: &RemotePath,
        field: CursorField,
        after: OffsetDateTime,
    ) -> SyncResult<Vec<RemoteDocument>> {
        let state = lock(&self.state);
        if state.offline {
            return Err(FamsyncError::SyncFailure("remote store is offline".to_string()));
        }

        let mut documents: Vec<RemoteDocument> = state
            .documents
            .get(path)
            .map(|documents| {
                documents
                    .values()
                    .filter(|document| document.stamp(field) > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        documents.sort_by(|left, right| {
            left.stamp(field)
                .cmp(&right.stamp(field))
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(documents)
    }
}
