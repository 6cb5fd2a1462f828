#![forbid(unsafe_code)]

//! Store contracts and the engines that run on top of them: the composite
//! synchronizer, the typed entity facade, the completion tracker and the
//! invite lifecycle.

use std::fmt::{Display, Formatter};

use famsync_core::{
    truncate_to_millis, ChildId, Collection, CompletionEvent, CursorField, DayKey, DeviceId,
    EntityRow, EventId, FamilyId, FamsyncError, StepDayKey,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub mod entities;
pub mod invites;
pub mod memory;
pub mod sync;
pub mod tracker;

pub use entities::EntityStore;
pub use invites::InviteLifecycle;
pub use memory::{MemoryLocalStore, MemoryRemoteStore};
pub use sync::{CollectionReport, PullReport, SyncConfig, SyncReport, Synchronizer};
pub use tracker::CompletionTracker;

pub type SyncResult<T> = Result<T, FamsyncError>;

/// The device-local authoritative store.
///
/// Lookups return `Ok(None)` for missing rows. Event lists come back in
/// canonical order (`occurred_at`, then id). Every write is single-row atomic.
pub trait LocalStore {
    #[allow(clippy::missing_errors_doc)]
    fn device_id(&self) -> SyncResult<DeviceId>;

    /// Idempotent on event id; returns whether a new row was written.
    #[allow(clippy::missing_errors_doc)]
    fn append_event(&self, event: &CompletionEvent) -> SyncResult<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn events_for_step_day(&self, key: &StepDayKey) -> SyncResult<Vec<CompletionEvent>>;

    #[allow(clippy::missing_errors_doc)]
    fn events_for_child_day(
        &self,
        child_id: ChildId,
        day: &DayKey,
    ) -> SyncResult<Vec<CompletionEvent>>;

    /// Oldest ids first.
    #[allow(clippy::missing_errors_doc)]
    fn unsynced_events(
        &self,
        family_id: FamilyId,
        limit: usize,
    ) -> SyncResult<Vec<CompletionEvent>>;

    #[allow(clippy::missing_errors_doc)]
    fn mark_events_synced(&self, ids: &[EventId]) -> SyncResult<usize>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_event_id_for_device(&self, device_id: &DeviceId) -> SyncResult<Option<EventId>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_row(&self, collection: Collection, id: &str) -> SyncResult<Option<EntityRow>>;

    /// The only row write. Compare-and-set on `updated_at`: with
    /// `expected = None` the row is only inserted when absent, otherwise it
    /// only replaces a stored row whose `updated_at` equals `expected`. `pushed` records the new
    /// `updated_at` as already present remotely; otherwise the row stays
    /// dirty until [`LocalStore::mark_row_pushed`] confirms it.
    #[allow(clippy::missing_errors_doc)]
    fn put_row_if(
        &self,
        row: &EntityRow,
        expected_updated_at: Option<OffsetDateTime>,
        pushed: bool,
    ) -> SyncResult<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn rows_by_family(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<Vec<EntityRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn rows_by_parent(
        &self,
        collection: Collection,
        parent_id: &str,
    ) -> SyncResult<Vec<EntityRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn row_by_secondary_key(
        &self,
        collection: Collection,
        key: &str,
    ) -> SyncResult<Option<EntityRow>>;

    /// Rows whose `updated_at` differs from the last confirmed push.
    #[allow(clippy::missing_errors_doc)]
    fn dirty_rows(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<Vec<EntityRow>>;

    /// Records `updated_at` as pushed iff the row still carries it; returns
    /// false when a newer local write landed in the meantime.
    #[allow(clippy::missing_errors_doc)]
    fn mark_row_pushed(
        &self,
        collection: Collection,
        id: &str,
        updated_at: OffsetDateTime,
    ) -> SyncResult<bool>;

    /// Physical removal; refused for collections that keep tombstones.
    #[allow(clippy::missing_errors_doc)]
    fn delete_row(&self, collection: Collection, id: &str) -> SyncResult<bool>;

    #[allow(clippy::missing_errors_doc)]
    fn sync_cursor(
        &self,
        collection: Collection,
        scope: &str,
    ) -> SyncResult<Option<OffsetDateTime>>;

    /// Moves the cursor to `max(current, at)` and returns the stored value.
    #[allow(clippy::missing_errors_doc)]
    fn advance_sync_cursor(
        &self,
        collection: Collection,
        scope: &str,
        at: OffsetDateTime,
    ) -> SyncResult<OffsetDateTime>;
}

/// The shared document store every device converges through.
pub trait RemoteStore {
    /// Upsert keyed by `document.id`.
    #[allow(clippy::missing_errors_doc)]
    fn set_document(&self, path: &RemotePath, document: &RemoteDocument) -> SyncResult<()>;

    /// Documents whose `field` is strictly greater than `after`.
    #[allow(clippy::missing_errors_doc)]
    fn query_after(
        &self,
        path: &RemotePath,
        field: CursorField,
        after: OffsetDateTime,
    ) -> SyncResult<Vec<RemoteDocument>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemotePath {
    pub family_id: FamilyId,
    pub collection: Collection,
}

impl RemotePath {
    #[must_use]
    pub fn new(family_id: FamilyId, collection: Collection) -> Self {
        Self {
            family_id,
            collection,
        }
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "families/{}/{}", self.family_id, self.collection)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    pub body: Value,
}

impl RemoteDocument {
    #[must_use]
    pub fn from_row(row: &EntityRow) -> Self {
        Self {
            id: row.id.clone(),
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
            body: row.body.clone(),
        }
    }

    /// Events are stamped with the upload instant, never earlier than the
    /// event itself, so an event recorded offline still lands after every
    /// cursor other devices already hold. The body keeps `occurred_at`.
    ///
    /// # Errors
    /// Returns [`FamsyncError::Validation`] when the event cannot be encoded.
    pub fn from_event(event: &CompletionEvent, uploaded_at: OffsetDateTime) -> SyncResult<Self> {
        let body = serde_json::to_value(event).map_err(|err| {
            FamsyncError::Validation(format!("failed to encode event {}: {err}", event.id))
        })?;
        let stamp = truncate_to_millis(uploaded_at).max(event.occurred_at);
        Ok(Self {
            id: event.id.to_string(),
            created_at: stamp,
            updated_at: stamp,
            deleted_at: None,
            body,
        })
    }

    #[must_use]
    pub fn stamp(&self, field: CursorField) -> OffsetDateTime {
        match field {
            CursorField::CreatedAt => self.created_at,
            CursorField::UpdatedAt => self.updated_at,
        }
    }
}
