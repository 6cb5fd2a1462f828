use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

use famsync_core::{
    parse_rfc3339_utc, ChildProfile, Collection, Family, FamsyncError, ManualClock, StepId,
    SystemClock, User, UserRole,
};
use famsync_store_sqlite::SqliteLocalStore;
use famsync_sync::{
    CompletionTracker, EntityStore, InviteLifecycle, LocalStore, MemoryRemoteStore, SyncConfig,
    Synchronizer,
};
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

fn start() -> OffsetDateTime {
    must(parse_rfc3339_utc("2026-02-07T12:00:00Z"))
}

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(label: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(format!("famsync-{label}-{}.sqlite3", Ulid::new())),
        }
    }

    fn open(&self) -> SqliteLocalStore {
        must(SqliteLocalStore::open_migrated(&self.path))
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = self.path.clone().into_os_string();
            raw.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(raw));
        }
    }
}

#[test]
fn two_devices_converge_through_the_remote() {
    let clock = ManualClock::new(start());
    let remote = MemoryRemoteStore::new();
    let phone = must(SqliteLocalStore::open_migrated(Path::new(":memory:")));
    let tablet = must(SqliteLocalStore::open_migrated(Path::new(":memory:")));
    assert_ne!(must(phone.device_id()), must(tablet.device_id()));

    let entities = EntityStore::new(&phone, &clock);
    let family = must(entities.create(&must(Family::new("Rivera", "America/Chicago", start()))));
    must(entities.create(&User::new(family.id, "Maria", UserRole::Parent, start())));
    let child = must(entities.create(&ChildProfile::new(family.id, "Ana", None, start())));
    let (routine, steps) = must(entities.create_routine(
        family.id,
        "Morning",
        None,
        &["Brush teeth", "Get dressed", "Pack bag"],
    ));
    must(entities.assign(&routine, child.id));
    let step_ids: Vec<StepId> = steps.iter().map(|step| step.id).collect();

    remote.set_offline(true);
    let tracker = must(CompletionTracker::new(&phone, &clock));
    for step_id in &step_ids {
        clock.advance(Duration::seconds(30));
        must(tracker.complete_step(child.id, routine.id, *step_id));
    }
    let day = must(tracker.today(family.id));

    let phone_sync = Synchronizer::new(&phone, &remote, &clock, SyncConfig::default());
    let offline = phone_sync.sync_family(family.id);
    assert!(!offline.is_clean());
    assert_eq!(must(phone.unsynced_events(family.id, 100)).len(), 3);

    remote.set_offline(false);
    clock.advance(Duration::minutes(1));
    let online = phone_sync.sync_family(family.id);
    assert!(online.is_clean(), "{online:?}");
    assert_eq!(
        online
            .collection(Collection::CompletionEvent)
            .map(|report| report.uploaded),
        Some(3)
    );
    assert!(must(phone.unsynced_events(family.id, 100)).is_empty());

    let tablet_sync = Synchronizer::new(&tablet, &remote, &clock, SyncConfig::default());
    let pulled = tablet_sync.sync_family(family.id);
    assert!(pulled.is_clean(), "{pulled:?}");
    assert!(must(tablet.unsynced_events(family.id, 100)).is_empty());

    let tablet_tracker = must(CompletionTracker::new(&tablet, &clock));
    assert!(must(tablet_tracker.is_routine_complete(routine.id, child.id, &step_ids, &day)));

    clock.advance(Duration::minutes(1));
    must(tablet_tracker.undo_step(child.id, routine.id, step_ids[1]));
    assert!(tablet_sync.sync_family(family.id).is_clean());
    assert!(phone_sync.sync_family(family.id).is_clean());

    assert!(!must(tracker.is_step_complete(child.id, routine.id, step_ids[1], &day)));
    assert!(!must(tracker.is_routine_complete(routine.id, child.id, &step_ids, &day)));
    let progress = must(tracker.day_progress(child.id, &day));
    assert_eq!(progress.event_count, 4);

    let again = phone_sync.sync_family(family.id);
    assert_eq!(
        again.collections.iter().map(|report| report.applied).sum::<usize>(),
        0
    );
}

#[test]
fn tombstones_replicate_between_sqlite_stores() {
    let clock = ManualClock::new(start());
    let remote = MemoryRemoteStore::new();
    let phone = must(SqliteLocalStore::open_migrated(Path::new(":memory:")));
    let tablet = must(SqliteLocalStore::open_migrated(Path::new(":memory:")));

    let entities = EntityStore::new(&phone, &clock);
    let family = must(entities.create(&must(Family::new("Rivera", "UTC", start()))));
    let (routine, _) = must(entities.create_routine(family.id, "Bedtime", None, &["Bath"]));
    assert!(Synchronizer::new(&phone, &remote, &clock, SyncConfig::default())
        .sync_family(family.id)
        .is_clean());
    assert!(Synchronizer::new(&tablet, &remote, &clock, SyncConfig::default())
        .sync_family(family.id)
        .is_clean());

    clock.advance(Duration::seconds(5));
    let deleted: famsync_core::Routine =
        must(EntityStore::new(&tablet, &clock).soft_delete(&routine.id.to_string()));
    assert!(deleted.deleted_at.is_some());
    assert!(Synchronizer::new(&tablet, &remote, &clock, SyncConfig::default())
        .sync_family(family.id)
        .is_clean());
    assert!(Synchronizer::new(&phone, &remote, &clock, SyncConfig::default())
        .sync_family(family.id)
        .is_clean());

    let on_phone = must(phone.get_row(Collection::Routine, &routine.id.to_string()));
    assert_eq!(on_phone.and_then(|row| row.deleted_at), deleted.deleted_at);
    let live: Vec<famsync_core::Routine> = must(entities.list_by_family(family.id, false));
    assert!(live.is_empty());
}

#[test]
fn concurrent_redeemers_share_a_single_use_invite_once() {
    let db = TempDb::new("invite-race");
    let store = db.open();
    let clock = SystemClock;
    let entities = EntityStore::new(&store, &clock);
    let family = must(entities.create(&must(Family::new("Rivera", "UTC", clock_now()))));
    let parent = User::new(family.id, "Maria", UserRole::Parent, clock_now());
    let parent = must(entities.create(&parent));
    let invite = must(InviteLifecycle::new(&store, &clock).create(
        family.id,
        parent.id,
        Duration::days(1),
        Some(1),
    ));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let path = db.path.clone();
            let code = invite.code.clone();
            std::thread::spawn(move || {
                let store = must(SqliteLocalStore::open_migrated(&path));
                let clock = SystemClock;
                barrier.wait();
                InviteLifecycle::new(&store, &clock).redeem(&code)
            })
        })
        .collect();

    let outcomes: Vec<_> = handles
        .into_iter()
        .map(|handle| match handle.join() {
            Ok(outcome) => outcome,
            Err(_) => panic!("redeemer thread panicked"),
        })
        .collect();

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|outcome| matches!(outcome, Err(FamsyncError::InvalidState(_)))));

    let stored = must(InviteLifecycle::new(&store, &clock).find(&invite.token));
    assert_eq!(stored.map(|invite| invite.used_count), Some(1));
}

fn clock_now() -> OffsetDateTime {
    famsync_core::truncate_to_millis(famsync_core::now_utc())
}
