#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use famsync_core::{
    canonical_cmp, format_rfc3339, now_utc, parse_rfc3339_utc, ChildId, Collection,
    CompletionEvent, CompletionEventType, DayKey, DeviceId, EntityRow, EventId, FamilyId,
    FamsyncError, RoutineId, StepDayKey, StepId,
};
use famsync_sync::{LocalStore, SyncResult};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const SYNC_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SYNC_V1: &str = r"
CREATE TABLE IF NOT EXISTS device_identity (
  singleton INTEGER PRIMARY KEY CHECK (singleton = 1),
  device_id TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS completion_events (
  event_id TEXT PRIMARY KEY,
  family_id TEXT NOT NULL,
  child_id TEXT NOT NULL,
  routine_id TEXT NOT NULL,
  step_id TEXT NOT NULL,
  event_type TEXT NOT NULL CHECK (event_type IN ('COMPLETE', 'UNDO')),
  occurred_at TEXT NOT NULL,
  local_day TEXT NOT NULL,
  device_id TEXT NOT NULL,
  synced INTEGER NOT NULL DEFAULT 0 CHECK (synced IN (0, 1))
);

CREATE TRIGGER IF NOT EXISTS trg_completion_events_no_update
BEFORE UPDATE OF event_id, family_id, child_id, routine_id, step_id, event_type,
                 occurred_at, local_day, device_id
ON completion_events
BEGIN
  SELECT RAISE(FAIL, 'completion_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_completion_events_no_delete
BEFORE DELETE ON completion_events
BEGIN
  SELECT RAISE(FAIL, 'completion_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_completion_events_step_day
  ON completion_events(child_id, routine_id, step_id, local_day);
CREATE INDEX IF NOT EXISTS idx_completion_events_child_day
  ON completion_events(child_id, local_day);
CREATE INDEX IF NOT EXISTS idx_completion_events_unsynced
  ON completion_events(family_id, synced, event_id);
CREATE INDEX IF NOT EXISTS idx_completion_events_device
  ON completion_events(device_id, event_id);

CREATE TABLE IF NOT EXISTS entity_rows (
  collection TEXT NOT NULL CHECK (
    collection IN (
      'family',
      'user',
      'child_profile',
      'routine',
      'routine_step',
      'assignment',
      'invite'
    )
  ),
  row_id TEXT NOT NULL,
  family_id TEXT NOT NULL,
  parent_id TEXT,
  secondary_key TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  deleted_at TEXT,
  pushed_updated_at TEXT,
  body_json TEXT NOT NULL,
  PRIMARY KEY (collection, row_id)
);

CREATE TRIGGER IF NOT EXISTS trg_entity_rows_no_delete
BEFORE DELETE ON entity_rows
WHEN OLD.collection <> 'invite'
BEGIN
  SELECT RAISE(FAIL, 'entity rows are tombstoned, never deleted');
END;

CREATE INDEX IF NOT EXISTS idx_entity_rows_family
  ON entity_rows(collection, family_id);
CREATE INDEX IF NOT EXISTS idx_entity_rows_parent
  ON entity_rows(collection, parent_id);
CREATE INDEX IF NOT EXISTS idx_entity_rows_secondary
  ON entity_rows(collection, secondary_key);

CREATE TABLE IF NOT EXISTS sync_cursors (
  collection TEXT NOT NULL,
  scope TEXT NOT NULL,
  last_synced_at TEXT NOT NULL,
  PRIMARY KEY (collection, scope)
);
";

const EVENT_COLUMNS: &str = "event_id, family_id, child_id, routine_id, step_id, event_type,
     occurred_at, local_day, device_id, synced";

const ROW_COLUMNS: &str = "collection, row_id, family_id, parent_id, secondary_key,
     created_at, updated_at, deleted_at, body_json";

pub struct SqliteLocalStore {
    conn: Connection,
}

impl SqliteLocalStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Opens and migrates in one step; the usual entry point for hosts.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SYNC_V1)
            .context("failed to apply sync schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SYNC_MIGRATION_VERSION, now],
            )
            .context("failed to register sync schema migration")?;

        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO device_identity(singleton, device_id, created_at)
                 VALUES (1, ?1, ?2)",
                params![Ulid::new().to_string(), now],
            )
            .context("failed to initialize device identity")?;
        if inserted > 0 {
            debug!("generated new device identity");
        }

        Ok(())
    }

    pub fn schema_versions(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        collect_rows(rows)
    }

    fn load_device_id(&self) -> Result<DeviceId> {
        let device_id: Option<String> = self
            .conn
            .query_row(
                "SELECT device_id FROM device_identity WHERE singleton = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read device identity")?;
        device_id
            .map(DeviceId)
            .ok_or_else(|| anyhow!("device identity missing; run migrate first"))
    }

    fn insert_event(&self, event: &CompletionEvent) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO completion_events(
                    event_id, family_id, child_id, routine_id, step_id, event_type,
                    occurred_at, local_day, device_id, synced
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(event_id) DO NOTHING",
                params![
                    event.id.to_string(),
                    event.family_id.to_string(),
                    event.child_id.to_string(),
                    event.routine_id.to_string(),
                    event.step_id.to_string(),
                    event.event_type.as_str(),
                    format_rfc3339(event.occurred_at)?,
                    event.local_day.as_str(),
                    event.device_id.0,
                    bool_to_sql(event.synced),
                ],
            )
            .with_context(|| format!("failed to append completion event {}", event.id))?;
        Ok(changed > 0)
    }

    fn query_events(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<CompletionEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM completion_events WHERE {where_clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, parse_event_row)?;
        let mut events = collect_rows(rows)?;
        events.sort_by(canonical_cmp);
        Ok(events)
    }

    fn select_unsynced(&self, family_id: FamilyId, limit: usize) -> Result<Vec<CompletionEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM completion_events
             WHERE family_id = ?1 AND synced = 0
             ORDER BY event_id ASC
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![family_id.to_string(), limit], parse_event_row)?;
        collect_rows(rows)
    }

    fn update_synced(&self, ids: &[EventId]) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin mark-synced transaction")?;
        let mut marked = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE completion_events SET synced = 1 WHERE event_id = ?1 AND synced = 0",
            )?;
            for id in ids {
                marked += stmt.execute(params![id.to_string()])?;
            }
        }
        tx.commit().context("failed to commit mark-synced transaction")?;
        Ok(marked)
    }

    fn select_latest_event_id(&self, device_id: &DeviceId) -> Result<Option<EventId>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT event_id FROM completion_events
                 WHERE device_id = ?1
                 ORDER BY event_id DESC
                 LIMIT 1",
                params![device_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|raw| EventId::parse(&raw)).transpose()?)
    }

    fn select_row(&self, collection: Collection, id: &str) -> Result<Option<EntityRow>> {
        let sql = format!(
            "SELECT {ROW_COLUMNS} FROM entity_rows WHERE collection = ?1 AND row_id = ?2"
        );
        self.conn
            .query_row(&sql, params![collection.as_str(), id], parse_entity_row)
            .optional()
            .with_context(|| format!("failed to read {collection} row {id}"))
    }

    fn query_rows(
        &self,
        where_clause: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<EntityRow>> {
        let sql = format!("SELECT {ROW_COLUMNS} FROM entity_rows WHERE {where_clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(args, parse_entity_row)?;
        let mut rows = collect_rows(rows)?;
        rows.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(rows)
    }

    fn compare_and_set_row(
        &self,
        row: &EntityRow,
        expected_updated_at: Option<OffsetDateTime>,
        pushed: bool,
    ) -> Result<bool> {
        let columns = RowColumns::from_row(row)?;
        let pushed_updated_at = if pushed {
            Some(columns.updated_at.clone())
        } else {
            None
        };

        let changed = match expected_updated_at {
            None => self.conn.execute(
                "INSERT INTO entity_rows(
                    collection, row_id, family_id, parent_id, secondary_key,
                    created_at, updated_at, deleted_at, pushed_updated_at, body_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(collection, row_id) DO NOTHING",
                params![
                    row.collection.as_str(),
                    row.id,
                    columns.family_id,
                    row.parent_id,
                    row.secondary_key,
                    columns.created_at,
                    columns.updated_at,
                    columns.deleted_at,
                    pushed_updated_at,
                    columns.body_json,
                ],
            ),
            Some(expected) => {
                let expected = format_rfc3339(expected)?;
                self.conn.execute(
                    "UPDATE entity_rows SET
                       family_id = ?3,
                       parent_id = ?4,
                       secondary_key = ?5,
                       created_at = ?6,
                       updated_at = ?7,
                       deleted_at = ?8,
                       pushed_updated_at = COALESCE(?9, pushed_updated_at),
                       body_json = ?10
                     WHERE collection = ?1 AND row_id = ?2 AND updated_at = ?11",
                    params![
                        row.collection.as_str(),
                        row.id,
                        columns.family_id,
                        row.parent_id,
                        row.secondary_key,
                        columns.created_at,
                        columns.updated_at,
                        columns.deleted_at,
                        pushed_updated_at,
                        columns.body_json,
                        expected,
                    ],
                )
            }
        }
        .with_context(|| format!("failed to write {} row {}", row.collection, row.id))?;

        Ok(changed > 0)
    }

    fn confirm_pushed(
        &self,
        collection: Collection,
        id: &str,
        updated_at: OffsetDateTime,
    ) -> Result<bool> {
        let updated_at = format_rfc3339(updated_at)?;
        let changed = self
            .conn
            .execute(
                "UPDATE entity_rows SET pushed_updated_at = ?3
                 WHERE collection = ?1 AND row_id = ?2 AND updated_at = ?3",
                params![collection.as_str(), id, updated_at],
            )
            .with_context(|| format!("failed to mark {collection} row {id} pushed"))?;
        Ok(changed > 0)
    }

    fn remove_row(&self, collection: Collection, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM entity_rows WHERE collection = ?1 AND row_id = ?2",
                params![collection.as_str(), id],
            )
            .with_context(|| format!("failed to delete {collection} row {id}"))?;
        Ok(changed > 0)
    }

    fn select_cursor(&self, collection: Collection, scope: &str) -> Result<Option<OffsetDateTime>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT last_synced_at FROM sync_cursors WHERE collection = ?1 AND scope = ?2",
                params![collection.as_str(), scope],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {collection} cursor for {scope}"))?;
        Ok(raw.map(|raw| parse_rfc3339_utc(&raw)).transpose()?)
    }

    fn store_cursor(
        &self,
        collection: Collection,
        scope: &str,
        at: OffsetDateTime,
    ) -> Result<OffsetDateTime> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("failed to begin cursor transaction")?;
        let current: Option<String> = tx
            .query_row(
                "SELECT last_synced_at FROM sync_cursors WHERE collection = ?1 AND scope = ?2",
                params![collection.as_str(), scope],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.map(|raw| parse_rfc3339_utc(&raw)).transpose()?;

        let next = current.map_or(at, |current| current.max(at));
        if current != Some(next) {
            let formatted = format_rfc3339(next)?;
            tx.execute(
                "INSERT INTO sync_cursors(collection, scope, last_synced_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, scope)
                 DO UPDATE SET last_synced_at = excluded.last_synced_at",
                params![collection.as_str(), scope, formatted],
            )?;
        }
        tx.commit().context("failed to commit cursor transaction")?;
        Ok(next)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LocalStore for SqliteLocalStore {
    fn device_id(&self) -> SyncResult<DeviceId> {
        self.load_device_id().map_err(storage_failure)
    }

    fn append_event(&self, event: &CompletionEvent) -> SyncResult<bool> {
        self.insert_event(event).map_err(storage_failure)
    }

    fn events_for_step_day(&self, key: &StepDayKey) -> SyncResult<Vec<CompletionEvent>> {
        self.query_events(
            "child_id = ?1 AND routine_id = ?2 AND step_id = ?3 AND local_day = ?4",
            params![
                key.child_id.to_string(),
                key.routine_id.to_string(),
                key.step_id.to_string(),
                key.day.as_str(),
            ],
        )
        .map_err(storage_failure)
    }

    fn events_for_child_day(
        &self,
        child_id: ChildId,
        day: &DayKey,
    ) -> SyncResult<Vec<CompletionEvent>> {
        self.query_events(
            "child_id = ?1 AND local_day = ?2",
            params![child_id.to_string(), day.as_str()],
        )
        .map_err(storage_failure)
    }

    fn unsynced_events(
        &self,
        family_id: FamilyId,
        limit: usize,
    ) -> SyncResult<Vec<CompletionEvent>> {
        self.select_unsynced(family_id, limit).map_err(storage_failure)
    }

    fn mark_events_synced(&self, ids: &[EventId]) -> SyncResult<usize> {
        self.update_synced(ids).map_err(storage_failure)
    }

    fn latest_event_id_for_device(&self, device_id: &DeviceId) -> SyncResult<Option<EventId>> {
        self.select_latest_event_id(device_id).map_err(storage_failure)
    }

    fn get_row(&self, collection: Collection, id: &str) -> SyncResult<Option<EntityRow>> {
        self.select_row(collection, id).map_err(storage_failure)
    }

    fn put_row_if(
        &self,
        row: &EntityRow,
        expected_updated_at: Option<OffsetDateTime>,
        pushed: bool,
    ) -> SyncResult<bool> {
        self.compare_and_set_row(row, expected_updated_at, pushed)
            .map_err(storage_failure)
    }

    fn rows_by_family(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<Vec<EntityRow>> {
        self.query_rows(
            "collection = ?1 AND family_id = ?2",
            params![collection.as_str(), family_id.to_string()],
        )
        .map_err(storage_failure)
    }

    fn rows_by_parent(
        &self,
        collection: Collection,
        parent_id: &str,
    ) -> SyncResult<Vec<EntityRow>> {
        self.query_rows(
            "collection = ?1 AND parent_id = ?2",
            params![collection.as_str(), parent_id],
        )
        .map_err(storage_failure)
    }

    fn row_by_secondary_key(
        &self,
        collection: Collection,
        key: &str,
    ) -> SyncResult<Option<EntityRow>> {
        self.query_rows(
            "collection = ?1 AND secondary_key = ?2",
            params![collection.as_str(), key],
        )
        .map(|rows| rows.into_iter().next())
        .map_err(storage_failure)
    }

    fn dirty_rows(
        &self,
        collection: Collection,
        family_id: FamilyId,
    ) -> SyncResult<Vec<EntityRow>> {
        self.query_rows(
            "collection = ?1 AND family_id = ?2
             AND (pushed_updated_at IS NULL OR pushed_updated_at <> updated_at)",
            params![collection.as_str(), family_id.to_string()],
        )
        .map_err(storage_failure)
    }

    fn mark_row_pushed(
        &self,
        collection: Collection,
        id: &str,
        updated_at: OffsetDateTime,
    ) -> SyncResult<bool> {
        self.confirm_pushed(collection, id, updated_at)
            .map_err(storage_failure)
    }

    fn delete_row(&self, collection: Collection, id: &str) -> SyncResult<bool> {
        if !collection.allows_physical_delete() {
            return Err(FamsyncError::InvalidState(format!(
                "{collection} rows are tombstoned, never deleted"
            )));
        }
        self.remove_row(collection, id).map_err(storage_failure)
    }

    fn sync_cursor(
        &self,
        collection: Collection,
        scope: &str,
    ) -> SyncResult<Option<OffsetDateTime>> {
        self.select_cursor(collection, scope).map_err(storage_failure)
    }

    fn advance_sync_cursor(
        &self,
        collection: Collection,
        scope: &str,
        at: OffsetDateTime,
    ) -> SyncResult<OffsetDateTime> {
        self.store_cursor(collection, scope, at).map_err(storage_failure)
    }
}

struct RowColumns {
    family_id: String,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    body_json: String,
}

impl RowColumns {
    fn from_row(row: &EntityRow) -> Result<Self> {
        if row.collection.is_append_only() {
            return Err(anyhow!("{} is not stored as entity rows", row.collection));
        }
        Ok(Self {
            family_id: row.family_id.to_string(),
            created_at: format_rfc3339(row.created_at)?,
            updated_at: format_rfc3339(row.updated_at)?,
            deleted_at: row.deleted_at.map(format_rfc3339).transpose()?,
            body_json: serde_json::to_string(&row.body)
                .with_context(|| format!("failed to serialize {} row {}", row.collection, row.id))?,
        })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn storage_failure(err: anyhow::Error) -> FamsyncError {
    FamsyncError::StorageFailure(format!("{err:#}"))
}

fn invalid_column(index: usize, kind: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(index: usize, err: FamsyncError) -> rusqlite::Error {
    invalid_column(index, Type::Text, err.to_string())
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CompletionEvent> {
    let event_type_raw: String = row.get(5)?;
    let event_type = CompletionEventType::parse(&event_type_raw).ok_or_else(|| {
        invalid_column(5, Type::Text, format!("invalid event_type: {event_type_raw}"))
    })?;

    Ok(CompletionEvent {
        id: EventId::parse(&row.get::<_, String>(0)?).map_err(|err| to_sql_error(0, err))?,
        family_id: FamilyId::parse(&row.get::<_, String>(1)?).map_err(|err| to_sql_error(1, err))?,
        child_id: ChildId::parse(&row.get::<_, String>(2)?).map_err(|err| to_sql_error(2, err))?,
        routine_id: RoutineId::parse(&row.get::<_, String>(3)?)
            .map_err(|err| to_sql_error(3, err))?,
        step_id: StepId::parse(&row.get::<_, String>(4)?).map_err(|err| to_sql_error(4, err))?,
        event_type,
        occurred_at: parse_rfc3339_utc(&row.get::<_, String>(6)?)
            .map_err(|err| to_sql_error(6, err))?,
        local_day: DayKey::parse(&row.get::<_, String>(7)?).map_err(|err| to_sql_error(7, err))?,
        device_id: DeviceId(row.get(8)?),
        synced: row.get::<_, i64>(9)? == 1,
    })
}

fn parse_entity_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRow> {
    let collection_raw: String = row.get(0)?;
    let collection = Collection::parse(&collection_raw).ok_or_else(|| {
        invalid_column(0, Type::Text, format!("invalid collection: {collection_raw}"))
    })?;
    let body_json: String = row.get(8)?;
    let body = serde_json::from_str(&body_json)
        .map_err(|err| invalid_column(8, Type::Text, format!("invalid body_json: {err}")))?;
    let deleted_at = row
        .get::<_, Option<String>>(7)?
        .map(|raw| parse_rfc3339_utc(&raw).map_err(|err| to_sql_error(7, err)))
        .transpose()?;

    Ok(EntityRow {
        collection,
        id: row.get(1)?,
        family_id: FamilyId::parse(&row.get::<_, String>(2)?).map_err(|err| to_sql_error(2, err))?,
        parent_id: row.get(3)?,
        secondary_key: row.get(4)?,
        created_at: parse_rfc3339_utc(&row.get::<_, String>(5)?)
            .map_err(|err| to_sql_error(5, err))?,
        updated_at: parse_rfc3339_utc(&row.get::<_, String>(6)?)
            .map_err(|err| to_sql_error(6, err))?,
        deleted_at,
        body,
    })
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
