//! Composite synchronizer: pushes local writes, pulls remote changes and
//! merges them row by row.

use famsync_core::{
    merge_by_recency, row_from_body, Clock, Collection, CompletionEvent, EntityRow, FamilyId,
    FamsyncError, UNIX_EPOCH,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::{LocalStore, RemoteDocument, RemotePath, RemoteStore, SyncResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    pub upload_batch_size: usize,
    /// Widens every pull window backwards so documents uploaded late with an
    /// older timestamp are still seen.
    pub pull_lookback_ms: u64,
    pub max_conflict_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            upload_batch_size: 200,
            pull_lookback_ms: 0,
            max_conflict_retries: 3,
        }
    }
}

impl SyncConfig {
    /// # Errors
    /// Returns [`FamsyncError::Configuration`] for out-of-range values.
    pub fn validate(&self) -> SyncResult<()> {
        if self.upload_batch_size == 0 {
            return Err(FamsyncError::Configuration(
                "upload_batch_size MUST be >= 1".to_string(),
            ));
        }
        if self.upload_batch_size > 10_000 {
            return Err(FamsyncError::Configuration(
                "upload_batch_size MUST be <= 10000".to_string(),
            ));
        }
        if self.pull_lookback_ms > 7 * 24 * 60 * 60 * 1000 {
            return Err(FamsyncError::Configuration(
                "pull_lookback_ms MUST NOT exceed 7 days".to_string(),
            ));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`FamsyncError::Configuration`] for malformed or invalid
    /// payloads.
    pub fn from_json(value: &Value) -> SyncResult<Self> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            FamsyncError::Configuration(format!("invalid sync config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn lookback(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.pull_lookback_ms).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullReport {
    pub fetched: usize,
    pub applied: usize,
    pub skipped: usize,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cursor: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionReport {
    pub collection: Collection,
    pub uploaded: usize,
    pub fetched: usize,
    pub applied: usize,
    pub upload_error: Option<String>,
    pub pull_error: Option<String>,
}

impl CollectionReport {
    fn new(collection: Collection) -> Self {
        Self {
            collection,
            uploaded: 0,
            fetched: 0,
            applied: 0,
            upload_error: None,
            pull_error: None,
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.upload_error.is_none() && self.pull_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub family_id: FamilyId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub collections: Vec<CollectionReport>,
}

impl SyncReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.collections.iter().all(CollectionReport::is_clean)
    }

    #[must_use]
    pub fn collection(&self, collection: Collection) -> Option<&CollectionReport> {
        self.collections
            .iter()
            .find(|report| report.collection == collection)
    }
}

pub struct Synchronizer<'a, L: LocalStore + ?Sized, R: RemoteStore + ?Sized> {
    local: &'a L,
    remote: &'a R,
    clock: &'a dyn Clock,
    config: SyncConfig,
}

impl<'a, L: LocalStore + ?Sized, R: RemoteStore + ?Sized> Synchronizer<'a, L, R> {
    #[must_use]
    pub fn new(local: &'a L, remote: &'a R, clock: &'a dyn Clock, config: SyncConfig) -> Self {
        Self {
            local,
            remote,
            clock,
            config,
        }
    }

    /// Upload then pull every collection, parents first. Never fails: a
    /// failed upload does not skip the pull, and each error is logged and
    /// carried in the collection's report.
    pub fn sync_family(&self, family_id: FamilyId) -> SyncReport {
        let started_at = self.clock.now();
        let mut collections = Vec::with_capacity(Collection::SYNC_ORDER.len());

        for collection in Collection::SYNC_ORDER {
            let mut report = CollectionReport::new(collection);

            match self.upload_unsynced(collection, family_id) {
                Ok(uploaded) => report.uploaded = uploaded,
                Err(err) => {
                    warn!(
                        family_id = %family_id,
                        collection = %collection,
                        error = %err,
                        "collection upload failed"
                    );
                    report.upload_error = Some(err.to_string());
                }
            }

            match self.pull_remote(collection, family_id) {
                Ok(pull) => {
                    report.fetched = pull.fetched;
                    report.applied = pull.applied;
                }
                Err(err) => {
                    warn!(
                        family_id = %family_id,
                        collection = %collection,
                        error = %err,
                        "collection pull failed"
                    );
                    report.pull_error = Some(err.to_string());
                }
            }
            collections.push(report);
        }

        let report = SyncReport {
            family_id,
            started_at,
            finished_at: self.clock.now(),
            collections,
        };
        info!(
            family_id = %family_id,
            clean = report.is_clean(),
            uploaded = report.collections.iter().map(|c| c.uploaded).sum::<usize>(),
            applied = report.collections.iter().map(|c| c.applied).sum::<usize>(),
            "family sync finished"
        );
        report
    }

    /// Pushes every dirty row of `collection`. A rejected document stays
    /// dirty and does not hold back the rows after it.
    ///
    /// # Errors
    /// Returns the first remote failure once every other row has been tried,
    /// or a local storage failure straight away.
    pub fn upload_unsynced(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<usize> {
        let path = RemotePath::new(family_id, collection);
        if collection.is_append_only() {
            return self.upload_events(&path);
        }

        let mut failures = UploadFailures::default();
        let mut uploaded = 0;
        for row in self.local.dirty_rows(collection, family_id)? {
            let document = RemoteDocument::from_row(&row);
            if let Err(err) = self.remote.set_document(&path, &document) {
                failures.record(&path, &row.id, err);
                continue;
            }
            uploaded += 1;

            if !self.local.mark_row_pushed(collection, &row.id, row.updated_at)? {
                debug!(
                    collection = %collection,
                    row_id = %row.id,
                    "row changed during upload; stays dirty"
                );
            }
        }
        failures.into_result(&path, uploaded)
    }

    fn upload_events(&self, path: &RemotePath) -> SyncResult<usize> {
        let mut failures = UploadFailures::default();
        let mut uploaded = 0;
        loop {
            let batch = self
                .local
                .unsynced_events(path.family_id, self.config.upload_batch_size)?;
            let batch_len = batch.len();
            let mut marked = 0;

            for event in batch {
                let document = RemoteDocument::from_event(&event, self.clock.now())?;
                if let Err(err) = self.remote.set_document(path, &document) {
                    failures.record(path, &document.id, err);
                    continue;
                }
                uploaded += 1;
                marked += self.local.mark_events_synced(&[event.id])?;
            }

            // Rejected events stay at the head of the unsynced list; a batch
            // that confirms nothing would be fetched again unchanged.
            if batch_len < self.config.upload_batch_size || marked == 0 {
                return failures.into_result(path, uploaded);
            }
        }
    }

    /// Fetches everything changed since the cursor and merges it locally,
    /// then advances the cursor to the newest stamp seen.
    ///
    /// # Errors
    /// Propagates remote query failures and local storage failures.
    pub fn pull_remote(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<PullReport> {
        let path = RemotePath::new(family_id, collection);
        let scope = family_id.to_string();
        let field = collection.cursor_field();
        let cursor = self
            .local
            .sync_cursor(collection, &scope)?
            .unwrap_or(UNIX_EPOCH);
        let after = cursor
            .checked_sub(self.config.lookback())
            .unwrap_or(UNIX_EPOCH);

        let documents = self.remote.query_after(&path, field, after)?;
        let mut report = PullReport {
            fetched: documents.len(),
            ..PullReport::default()
        };

        let mut newest = cursor;
        for document in &documents {
            newest = newest.max(document.stamp(field));
            let applied = if collection.is_append_only() {
                self.apply_event(&path, document)?
            } else {
                self.apply_row(&path, document)?
            };
            match applied {
                Some(true) => report.applied += 1,
                Some(false) => {}
                None => report.skipped += 1,
            }
        }

        if newest > cursor {
            report.cursor = Some(self.local.advance_sync_cursor(collection, &scope, newest)?);
        } else {
            report.cursor = self.local.sync_cursor(collection, &scope)?;
        }

        debug!(
            path = %path,
            fetched = report.fetched,
            applied = report.applied,
            skipped = report.skipped,
            "pull finished"
        );
        Ok(report)
    }

    /// `None` when the document is malformed or belongs elsewhere.
    fn apply_event(
        &self,
        path: &RemotePath,
        document: &RemoteDocument,
    ) -> SyncResult<Option<bool>> {
        let mut event: CompletionEvent = match serde_json::from_value(document.body.clone()) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    path = %path,
                    document_id = %document.id,
                    error = %err,
                    "skipping malformed event document"
                );
                return Ok(None);
            }
        };
        if event.family_id != path.family_id || event.id.to_string() != document.id {
            warn!(
                path = %path,
                document_id = %document.id,
                "skipping event document with mismatched keys"
            );
            return Ok(None);
        }

        event.synced = true;
        let inserted = self.local.append_event(&event)?;
        if !inserted {
            self.local.mark_events_synced(&[event.id])?;
        }
        Ok(Some(inserted))
    }

    fn apply_row(
        &self,
        path: &RemotePath,
        document: &RemoteDocument,
    ) -> SyncResult<Option<bool>> {
        let row = match row_from_body(path.collection, &document.body) {
            Ok(row) => row,
            Err(err) => {
                warn!(
                    path = %path,
                    document_id = %document.id,
                    error = %err,
                    "skipping malformed document"
                );
                return Ok(None);
            }
        };
        if row.family_id != path.family_id || row.id != document.id {
            warn!(
                path = %path,
                document_id = %document.id,
                "skipping document with mismatched keys"
            );
            return Ok(None);
        }

        self.merge_row(&row).map(Some)
    }

    /// Last-write-wins merge guarded by compare-and-set, so a local write
    /// that lands between the read and the write is never overwritten blindly.
    fn merge_row(&self, remote: &EntityRow) -> SyncResult<bool> {
        for attempt in 0..=self.config.max_conflict_retries {
            let local = self.local.get_row(remote.collection, &remote.id)?;
            let expected = local.as_ref().map(|row| row.updated_at);
            let decision = merge_by_recency(expected, remote.updated_at);
            if !decision.applies_remote() {
                return Ok(false);
            }
            if self.local.put_row_if(remote, expected, true)? {
                debug!(
                    collection = %remote.collection,
                    row_id = %remote.id,
                    ?decision,
                    "merged remote row"
                );
                return Ok(true);
            }
            debug!(
                collection = %remote.collection,
                row_id = %remote.id,
                attempt,
                "merge lost a race with a local write"
            );
        }
        Err(FamsyncError::SyncFailure(format!(
            "gave up merging {} {} after {} conflicts",
            remote.collection,
            remote.id,
            self.config.max_conflict_retries + 1
        )))
    }
}

/// Remote write failures of one upload pass; the first one is reported.
#[derive(Default)]
struct UploadFailures {
    first: Option<(String, FamsyncError)>,
    count: usize,
}

impl UploadFailures {
    fn record(&mut self, path: &RemotePath, id: &str, err: FamsyncError) {
        warn!(path = %path, document_id = %id, error = %err, "document upload failed");
        self.count += 1;
        if self.first.is_none() {
            self.first = Some((id.to_string(), err));
        }
    }

    fn into_result(self, path: &RemotePath, uploaded: usize) -> SyncResult<usize> {
        match self.first {
            None => Ok(uploaded),
            Some((id, err)) => Err(FamsyncError::SyncFailure(format!(
                "upload to {path} failed for {} of {} documents, first {id}: {err}",
                self.count,
                self.count + uploaded
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLocalStore, MemoryRemoteStore};
    use crate::{CompletionTracker, EntityStore};
    use famsync_core::{
        parse_rfc3339_utc, ChildProfile, CompletionEventType, CursorField, DayKey, DeviceId,
        EventIdGenerator, Family, ManualClock, Replicated, Routine, RoutineStep, Tombstoned,
    };

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(value) => value,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn start() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-02-07T07:00:00Z"))
    }

    struct Device {
        local: MemoryLocalStore,
        clock: ManualClock,
    }

    impl Device {
        fn new(name: &str) -> Self {
            Self {
                local: MemoryLocalStore::new(name),
                clock: ManualClock::new(start()),
            }
        }

        fn entities(&self) -> EntityStore<'_, MemoryLocalStore> {
            EntityStore::new(&self.local, &self.clock)
        }

        fn sync(&self, remote: &MemoryRemoteStore, family_id: FamilyId) -> SyncReport {
            Synchronizer::new(&self.local, remote, &self.clock, SyncConfig::default())
                .sync_family(family_id)
        }

        fn synchronizer<'a>(
            &'a self,
            remote: &'a MemoryRemoteStore,
        ) -> Synchronizer<'a, MemoryLocalStore, MemoryRemoteStore> {
            Synchronizer::new(&self.local, remote, &self.clock, SyncConfig::default())
        }
    }

    fn seeded_family(device: &Device) -> Family {
        let family = must_ok(Family::new("Rivera", "America/Chicago", device.clock.now()));
        must_ok(device.entities().create(&family))
    }

    #[test]
    fn offline_routine_uploads_once_after_retry() {
        let device = Device::new("device-a");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        let (routine, steps) = must_ok(device.entities().create_routine(
            family.id,
            "Morning",
            None,
            &["Brush teeth", "Get dressed", "Breakfast", "Pack bag", "Shoes"],
        ));
        assert_eq!(steps.len(), 5);

        remote.set_offline(true);
        let offline = device.sync(&remote, family.id);
        assert!(!offline.is_clean());
        assert_eq!(remote.write_count(), 0);

        remote.set_offline(false);
        remote.fail_writes_after(3);
        let partial = device.synchronizer(&remote);
        assert!(partial.upload_unsynced(Collection::Family, family.id).is_ok());
        assert!(partial.upload_unsynced(Collection::Routine, family.id).is_ok());
        let err = partial.upload_unsynced(Collection::RoutineStep, family.id);
        assert!(err.is_err());
        assert_eq!(
            must_ok(device.local.dirty_rows(Collection::RoutineStep, family.id)).len(),
            4
        );

        remote.clear_write_failures();
        let report = device.sync(&remote, family.id);
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(must_some(report.collection(Collection::RoutineStep)).uploaded, 4);

        let step_path = RemotePath::new(family.id, Collection::RoutineStep);
        assert_eq!(remote.documents(&step_path).len(), 5);
        let routine_path = RemotePath::new(family.id, Collection::Routine);
        assert_eq!(remote.documents(&routine_path).len(), 1);
        assert!(remote.document(&routine_path, &routine.id.to_string()).is_some());

        let again = device.sync(&remote, family.id);
        assert!(again.collections.iter().all(|c| c.uploaded == 0 && c.applied == 0));
    }

    #[test]
    fn pull_twice_is_a_no_op() {
        let writer = Device::new("device-a");
        let reader = Device::new("device-b");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&writer);
        must_ok(writer.entities().create_routine(family.id, "Bedtime", None, &["Bath", "Book"]));
        assert!(writer.sync(&remote, family.id).is_clean());

        let sync = reader.synchronizer(&remote);
        let first = must_ok(sync.pull_remote(Collection::RoutineStep, family.id));
        assert_eq!(first.applied, 2);
        let cursor = first.cursor;
        let second = must_ok(sync.pull_remote(Collection::RoutineStep, family.id));
        assert_eq!(second.fetched, 0);
        assert_eq!(second.applied, 0);
        assert_eq!(second.cursor, cursor);
    }

    #[test]
    fn equal_timestamps_keep_local_row() {
        let device = Device::new("device-a");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        let routine = must_ok(
            device
                .entities()
                .create(&Routine::new(family.id, "Local title", None, start())),
        );

        let mut remote_copy = routine.clone();
        remote_copy.title = "Remote title".to_string();
        let path = RemotePath::new(family.id, Collection::Routine);
        remote.seed(&path, RemoteDocument::from_row(&must_ok(remote_copy.to_row())));

        let report = must_ok(
            device
                .synchronizer(&remote)
                .pull_remote(Collection::Routine, family.id),
        );
        assert_eq!(report.fetched, 1);
        assert_eq!(report.applied, 0);
        let stored: Routine = must_some(must_ok(device.entities().get(&routine.id.to_string())));
        assert_eq!(stored.title, "Local title");
    }

    #[test]
    fn newer_remote_tombstone_wins_and_older_remote_loses() {
        let device = Device::new("device-a");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        let routine = must_ok(
            device
                .entities()
                .create(&Routine::new(family.id, "Chores", None, start())),
        );
        let path = RemotePath::new(family.id, Collection::Routine);

        let mut deleted = routine.clone();
        deleted.set_deleted_at(Some(start() + Duration::minutes(5)));
        deleted.updated_at = start() + Duration::minutes(5);
        remote.seed(&path, RemoteDocument::from_row(&must_ok(deleted.to_row())));
        must_ok(
            device
                .synchronizer(&remote)
                .pull_remote(Collection::Routine, family.id),
        );
        let stored: Routine = must_some(must_ok(device.entities().get(&routine.id.to_string())));
        assert!(stored.deleted_at.is_some());

        let other = must_ok(
            device
                .entities()
                .create(&Routine::new(family.id, "Homework", None, start())),
        );
        device.clock.advance(Duration::minutes(10));
        let tombstoned: Routine = must_ok(device.entities().soft_delete(&other.id.to_string()));

        let mut stale = other.clone();
        stale.title = "Homework (edited offline)".to_string();
        stale.updated_at = start() + Duration::minutes(6);
        remote.seed(&path, RemoteDocument::from_row(&must_ok(stale.to_row())));
        must_ok(
            device
                .synchronizer(&remote)
                .pull_remote(Collection::Routine, family.id),
        );
        let stored: Routine = must_some(must_ok(device.entities().get(&other.id.to_string())));
        assert_eq!(stored.deleted_at, tombstoned.deleted_at);
        assert_eq!(stored.title, "Homework");
    }

    #[test]
    fn cursor_advances_to_newest_observed_stamp_not_now() {
        let device = Device::new("device-a");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        let path = RemotePath::new(family.id, Collection::ChildProfile);
        let child = ChildProfile::new(family.id, "Ana", None, start() + Duration::seconds(42));
        remote.seed(&path, RemoteDocument::from_row(&must_ok(child.to_row())));

        device.clock.advance(Duration::hours(3));
        let report = must_ok(
            device
                .synchronizer(&remote)
                .pull_remote(Collection::ChildProfile, family.id),
        );
        assert_eq!(report.cursor, Some(start() + Duration::seconds(42)));
    }

    #[test]
    fn malformed_and_foreign_documents_are_skipped() {
        let device = Device::new("device-a");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        let path = RemotePath::new(family.id, Collection::Routine);

        remote.seed(
            &path,
            RemoteDocument {
                id: "broken".to_string(),
                created_at: start(),
                updated_at: start() + Duration::seconds(1),
                deleted_at: None,
                body: serde_json::json!({ "title": 12 }),
            },
        );
        let foreign = Routine::new(
            FamilyId::new(),
            "Elsewhere",
            None,
            start() + Duration::seconds(2),
        );
        remote.seed(&path, RemoteDocument::from_row(&must_ok(foreign.to_row())));

        let report = must_ok(
            device
                .synchronizer(&remote)
                .pull_remote(Collection::Routine, family.id),
        );
        assert_eq!(report.fetched, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.cursor, Some(start() + Duration::seconds(2)));
        assert_eq!(device.local.row_count(Collection::Routine), 0);
    }

    #[test]
    fn stale_compare_and_set_loses_and_merge_rereads() {
        let device = Device::new("device-a");
        let family = seeded_family(&device);
        let routine = must_ok(
            device
                .entities()
                .create(&Routine::new(family.id, "Morning", None, start())),
        );
        let mut remote_copy = routine.clone();
        remote_copy.title = "Remote".to_string();
        remote_copy.updated_at = start() + Duration::seconds(1);
        let remote_row = must_ok(remote_copy.to_row());

        // Stale expectation loses the compare-and-set.
        assert!(!must_ok(device.local.put_row_if(
            &remote_row,
            Some(start() - Duration::seconds(1)),
            true
        )));

        let remote = MemoryRemoteStore::new();
        let sync = device.synchronizer(&remote);
        assert!(must_ok(sync.merge_row(&remote_row)));
        assert!(must_ok(device.local.dirty_rows(Collection::Routine, family.id)).is_empty());
    }

    #[test]
    fn events_replicate_between_devices() {
        let phone = Device::new("phone");
        let tablet = Device::new("tablet");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&phone);
        let routine = Routine::new(family.id, "Morning", None, start());
        let step = RoutineStep::new(&routine, "Brush teeth", 0, start());
        let ids = EventIdGenerator::new();
        let event = CompletionEvent {
            id: must_ok(ids.next_id(start())),
            family_id: family.id,
            child_id: famsync_core::ChildId::new(),
            routine_id: routine.id,
            step_id: step.id,
            event_type: CompletionEventType::Complete,
            occurred_at: start(),
            local_day: must_ok(DayKey::parse("2026-02-07")),
            device_id: DeviceId("phone".to_string()),
            synced: false,
        };
        assert!(must_ok(phone.local.append_event(&event)));
        assert!(!must_ok(phone.local.append_event(&event)));

        let report = phone.sync(&remote, family.id);
        assert_eq!(must_some(report.collection(Collection::CompletionEvent)).uploaded, 1);
        assert!(must_ok(phone.local.unsynced_events(family.id, 10)).is_empty());

        let pulled = tablet.sync(&remote, family.id);
        assert_eq!(must_some(pulled.collection(Collection::CompletionEvent)).applied, 1);
        let replicated = must_ok(tablet.local.events_for_step_day(&event.step_key()));
        assert_eq!(replicated.len(), 1);
        assert!(replicated[0].synced);

        let again = must_ok(
            tablet
                .synchronizer(&remote)
                .pull_remote(Collection::CompletionEvent, family.id),
        );
        assert_eq!(again.fetched, 0);
        let path = RemotePath::new(family.id, Collection::CompletionEvent);
        assert_eq!(
            must_ok(remote.query_after(&path, CursorField::CreatedAt, UNIX_EPOCH)).len(),
            1
        );
    }

    #[test]
    fn event_uploaded_late_reaches_a_device_whose_cursor_passed_it() {
        let phone = Device::new("phone");
        let tablet = Device::new("tablet");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&phone);
        let child = must_ok(
            phone
                .entities()
                .create(&ChildProfile::new(family.id, "Ana", None, start())),
        );
        let (routine, steps) = must_ok(phone.entities().create_routine(
            family.id,
            "Morning",
            None,
            &["Brush teeth", "Get dressed"],
        ));
        let step_ids: Vec<_> = steps.iter().map(|step| step.id).collect();
        assert!(phone.sync(&remote, family.id).is_clean());
        assert!(tablet.sync(&remote, family.id).is_clean());

        // The phone records its step at 07:10 but stays offline until 08:00.
        phone.clock.set(start() + Duration::minutes(10));
        let phone_tracker = must_ok(CompletionTracker::new(&phone.local, &phone.clock));
        let offline = must_ok(phone_tracker.complete_step(child.id, routine.id, step_ids[0]));

        tablet.clock.set(start() + Duration::minutes(20));
        let tablet_tracker = must_ok(CompletionTracker::new(&tablet.local, &tablet.clock));
        must_ok(tablet_tracker.complete_step(child.id, routine.id, step_ids[1]));
        assert!(tablet.sync(&remote, family.id).is_clean());

        phone.clock.set(start() + Duration::hours(1));
        let late = phone.sync(&remote, family.id);
        assert!(late.is_clean(), "{late:?}");
        let path = RemotePath::new(family.id, Collection::CompletionEvent);
        let uploaded = must_some(remote.document(&path, &offline.id.to_string()));
        assert_eq!(uploaded.created_at, start() + Duration::hours(1));

        tablet.clock.set(start() + Duration::minutes(65));
        let caught_up = tablet.sync(&remote, family.id);
        let events = must_some(caught_up.collection(Collection::CompletionEvent));
        assert_eq!(events.applied, 1);

        let day = offline.local_day.clone();
        let replicated = must_ok(tablet.local.events_for_step_day(&offline.step_key()));
        assert_eq!(replicated.len(), 1);
        assert_eq!(replicated[0].occurred_at, offline.occurred_at);
        assert!(must_ok(tablet_tracker.is_routine_complete(routine.id, child.id, &step_ids, &day)));
        assert!(must_ok(phone_tracker.is_routine_complete(routine.id, child.id, &step_ids, &day)));
    }

    #[test]
    fn rejected_row_does_not_block_other_rows_or_the_pull() {
        let device = Device::new("device-a");
        let other = Device::new("device-b");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        assert!(device.sync(&remote, family.id).is_clean());
        assert!(other.sync(&remote, family.id).is_clean());

        let rejected = must_ok(
            device
                .entities()
                .create(&Routine::new(family.id, "Chores", None, start())),
        );
        let accepted = must_ok(
            device
                .entities()
                .create(&Routine::new(family.id, "Homework", None, start())),
        );
        remote.reject_document(&rejected.id.to_string());

        other.clock.advance(Duration::minutes(1));
        let incoming = must_ok(
            other
                .entities()
                .create(&Routine::new(family.id, "Bedtime", None, other.clock.now())),
        );
        assert!(other.sync(&remote, family.id).is_clean());

        device.clock.advance(Duration::minutes(2));
        let report = device.sync(&remote, family.id);
        assert!(!report.is_clean());
        let routines = must_some(report.collection(Collection::Routine));
        let upload_error = must_some(routines.upload_error.clone());
        assert!(upload_error.contains(&rejected.id.to_string()), "{upload_error}");
        assert!(routines.pull_error.is_none());
        assert_eq!(routines.uploaded, 1);
        assert_eq!(routines.applied, 1);

        let path = RemotePath::new(family.id, Collection::Routine);
        assert!(remote.document(&path, &accepted.id.to_string()).is_some());
        assert!(remote.document(&path, &rejected.id.to_string()).is_none());
        let pulled: Option<Routine> = must_ok(device.entities().get(&incoming.id.to_string()));
        assert_eq!(must_some(pulled).title, "Bedtime");
        let dirty = must_ok(device.local.dirty_rows(Collection::Routine, family.id));
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].id, rejected.id.to_string());

        remote.clear_write_failures();
        assert!(device.sync(&remote, family.id).is_clean());
        assert!(remote.document(&path, &rejected.id.to_string()).is_some());
    }

    #[test]
    fn lookback_refetches_without_reapplying() {
        let device = Device::new("device-a");
        let remote = MemoryRemoteStore::new();
        let family = seeded_family(&device);
        let path = RemotePath::new(family.id, Collection::ChildProfile);
        let child = ChildProfile::new(family.id, "Ana", None, start());
        remote.seed(&path, RemoteDocument::from_row(&must_ok(child.to_row())));

        let config = SyncConfig {
            pull_lookback_ms: 60_000,
            ..SyncConfig::default()
        };
        let sync = Synchronizer::new(&device.local, &remote, &device.clock, config);
        assert_eq!(must_ok(sync.pull_remote(Collection::ChildProfile, family.id)).applied, 1);
        let second = must_ok(sync.pull_remote(Collection::ChildProfile, family.id));
        assert_eq!(second.fetched, 1);
        assert_eq!(second.applied, 0);
    }

    #[test]
    fn config_validation() {
        assert!(SyncConfig::default().validate().is_ok());
        let parsed = must_ok(SyncConfig::from_json(
            &serde_json::json!({ "upload_batch_size": 50 }),
        ));
        assert_eq!(parsed.upload_batch_size, 50);
        assert_eq!(parsed.max_conflict_retries, 3);
        assert!(matches!(
            SyncConfig::from_json(&serde_json::json!({ "upload_batch_size": 0 })),
            Err(FamsyncError::Configuration(_))
        ));
        assert!(
            SyncConfig::from_json(&serde_json::json!({ "upload_batch_size": "many" })).is_err()
        );
    }
}
