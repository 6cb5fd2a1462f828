//! Domain model and pure engines for offline-first family routine tracking.
//!
//! Everything in this crate is side-effect free apart from [`Clock`] and the
//! random generators in [`invite`]: completion derivation, merge arbitration
//! and invite state evaluation are plain functions over values so they can be
//! replayed and tested without a store.

use std::fmt::{Display, Formatter};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod completion;
pub mod entity;
pub mod invite;
pub mod merge;

pub use completion::{
    canonical_cmp, canonical_order, derive_routine_complete, derive_step_complete, project_day,
    CompletionEvent, CompletionEventType, DayProgress, RoutineProgress, StepDayKey,
};
pub use entity::{
    row_from_body, ChildProfile, CompletionRule, EntityRow, Family, Replicated, Routine,
    RoutineAssignment, RoutineStep, Tombstoned, User, UserRole,
};
pub use invite::{FamilyInvite, InviteLink, InviteState};
pub use merge::{merge_by_recency, MergeDecision};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FamsyncError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("sync failure: {0}")]
    SyncFailure(String),
}

impl FamsyncError {
    /// True for failures that a later sync attempt may clear on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SyncFailure(_) | Self::StorageFailure(_))
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses the canonical 26-character ULID form.
            ///
            /// # Errors
            /// Returns [`FamsyncError::Validation`] when `raw` is not a ULID.
            pub fn parse(raw: &str) -> Result<Self, FamsyncError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    FamsyncError::Validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(FamilyId, "family id");
ulid_id!(UserId, "user id");
ulid_id!(ChildId, "child id");
ulid_id!(RoutineId, "routine id");
ulid_id!(StepId, "step id");
ulid_id!(AssignmentId, "assignment id");
ulid_id!(
    /// Completion event id. Ordered by creation time, then by the monotonic
    /// increment applied within one millisecond.
    EventId,
    "event id"
);

/// Stable identifier of one app install.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl Display for DeviceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calendar date (`YYYY-MM-DD`) in a family's time zone.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct DayKey(String);

impl DayKey {
    /// Parses a canonical `YYYY-MM-DD` day key.
    ///
    /// # Errors
    /// Returns [`FamsyncError::Validation`] when `raw` is not a real calendar
    /// date in canonical zero-padded form.
    pub fn parse(raw: &str) -> Result<Self, FamsyncError> {
        let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|err| FamsyncError::Validation(format!("invalid day key `{raw}`: {err}")))?;
        let canonical = date.format("%Y-%m-%d").to_string();
        if canonical != raw {
            return Err(FamsyncError::Validation(format!(
                "day key `{raw}` MUST be zero-padded YYYY-MM-DD"
            )));
        }
        Ok(Self(canonical))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DayKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DayKey {
    type Error = FamsyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DayKey> for String {
    fn from(value: DayKey) -> Self {
        value.0
    }
}

/// Derives the calendar date of `instant` in the IANA zone `time_zone`.
///
/// # Errors
/// Returns [`FamsyncError::Validation`] for unknown zones or instants outside
/// the representable range.
pub fn day_key_for(instant: OffsetDateTime, time_zone: &str) -> Result<DayKey, FamsyncError> {
    let zone: chrono_tz::Tz = time_zone.parse().map_err(|err| {
        FamsyncError::Validation(format!("unknown time zone `{time_zone}`: {err}"))
    })?;
    let utc = chrono::DateTime::<chrono::Utc>::from_timestamp(
        instant.unix_timestamp(),
        instant.nanosecond(),
    )
    .ok_or_else(|| FamsyncError::Validation(format!("instant out of range: {instant}")))?;

    Ok(DayKey(
        utc.with_timezone(&zone)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string(),
    ))
}

/// Checks that `time_zone` names a known IANA zone.
///
/// # Errors
/// Returns [`FamsyncError::Validation`] for unknown zones.
pub fn validate_time_zone(time_zone: &str) -> Result<(), FamsyncError> {
    time_zone
        .parse::<chrono_tz::Tz>()
        .map(|_| ())
        .map_err(|err| FamsyncError::Validation(format!("unknown time zone `{time_zone}`: {err}")))
}

/// Logical replicated collections, in the order a full sync visits them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Family,
    User,
    ChildProfile,
    Routine,
    RoutineStep,
    Assignment,
    Invite,
    CompletionEvent,
}

impl Collection {
    /// Parents before children so a pulled step never precedes its routine.
    pub const SYNC_ORDER: [Self; 8] = [
        Self::Family,
        Self::User,
        Self::ChildProfile,
        Self::Routine,
        Self::RoutineStep,
        Self::Assignment,
        Self::Invite,
        Self::CompletionEvent,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Family => "family",
            Self::User => "user",
            Self::ChildProfile => "child_profile",
            Self::Routine => "routine",
            Self::RoutineStep => "routine_step",
            Self::Assignment => "assignment",
            Self::Invite => "invite",
            Self::CompletionEvent => "completion_event",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "family" => Some(Self::Family),
            "user" => Some(Self::User),
            "child_profile" => Some(Self::ChildProfile),
            "routine" => Some(Self::Routine),
            "routine_step" => Some(Self::RoutineStep),
            "assignment" => Some(Self::Assignment),
            "invite" => Some(Self::Invite),
            "completion_event" => Some(Self::CompletionEvent),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_append_only(self) -> bool {
        matches!(self, Self::CompletionEvent)
    }

    /// Collections whose rows are soft-deleted and never physically removed.
    #[must_use]
    pub fn uses_tombstones(self) -> bool {
        matches!(self, Self::Routine | Self::RoutineStep | Self::Assignment)
    }

    /// Only invites are ever removed outright, and only by local maintenance.
    #[must_use]
    pub fn allows_physical_delete(self) -> bool {
        matches!(self, Self::Invite)
    }

    #[must_use]
    pub fn cursor_field(self) -> CursorField {
        if self.is_append_only() {
            CursorField::CreatedAt
        } else {
            CursorField::UpdatedAt
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp field bounding an incremental pull.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CursorField {
    UpdatedAt,
    CreatedAt,
}

impl CursorField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpdatedAt => "updated_at",
            Self::CreatedAt => "created_at",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "updated_at" => Some(Self::UpdatedAt),
            "created_at" => Some(Self::CreatedAt),
            _ => None,
        }
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        match self.now.lock() {
            Ok(mut guard) => *guard = at,
            Err(poisoned) => *poisoned.into_inner() = at,
        }
    }

    pub fn advance(&self, by: Duration) {
        match self.now.lock() {
            Ok(mut guard) => *guard += by,
            Err(poisoned) => *poisoned.into_inner() += by,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Hands out event ids that strictly increase for this device even when the
/// wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct EventIdGenerator {
    last: Mutex<Option<Ulid>>,
}

impl EventIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues after the newest id this device has already written.
    #[must_use]
    pub fn resume_after(last: Option<EventId>) -> Self {
        Self {
            last: Mutex::new(last.map(|id| id.0)),
        }
    }

    /// # Errors
    /// Returns [`FamsyncError::InvalidState`] when the random component of
    /// the previous id cannot be incremented any further.
    pub fn next_id(&self, at: OffsetDateTime) -> Result<EventId, FamsyncError> {
        let candidate = Ulid::from_datetime(SystemTime::from(at));
        let mut guard = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let next = match *guard {
            Some(previous) if candidate <= previous => previous.increment().ok_or_else(|| {
                FamsyncError::InvalidState("event id space exhausted for this millisecond".into())
            })?,
            _ => candidate,
        };
        *guard = Some(next);
        Ok(EventId(next))
    }
}

pub const UNIX_EPOCH: OffsetDateTime = OffsetDateTime::UNIX_EPOCH;

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Drops sub-millisecond precision so stamps survive JSON and remote stores
/// that only keep milliseconds.
#[must_use]
pub fn truncate_to_millis(at: OffsetDateTime) -> OffsetDateTime {
    let at = at.to_offset(UtcOffset::UTC);
    at.replace_nanosecond(at.nanosecond() / 1_000_000 * 1_000_000)
        .unwrap_or(at)
}

/// Next `updated_at` for a row last stamped at `previous`; always strictly
/// greater than `previous`.
#[must_use]
pub fn next_update_stamp(previous: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
    let now = truncate_to_millis(now);
    if now > previous {
        now
    } else {
        truncate_to_millis(previous) + Duration::MILLISECOND
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FamsyncError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FamsyncError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FamsyncError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FamsyncError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FamsyncError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FamsyncError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            FamsyncError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    #[test]
    fn day_key_follows_family_time_zone() {
        let instant = must_utc("2026-03-01T03:30:00Z");

        let utc = must_ok(day_key_for(instant, "UTC"));
        let los_angeles = must_ok(day_key_for(instant, "America/Los_Angeles"));
        let tokyo = must_ok(day_key_for(instant, "Asia/Tokyo"));

        assert_eq!(utc.as_str(), "2026-03-01");
        assert_eq!(los_angeles.as_str(), "2026-02-28");
        assert_eq!(tokyo.as_str(), "2026-03-01");
    }

    #[test]
    fn day_key_rejects_unknown_zone() {
        let err = match day_key_for(must_utc("2026-03-01T00:00:00Z"), "Mars/Olympus") {
            Ok(value) => panic!("expected error, got {value}"),
            Err(err) => err,
        };
        assert!(matches!(err, FamsyncError::Validation(_)));
    }

    #[test]
    fn day_key_parse_requires_canonical_form() {
        assert!(DayKey::parse("2026-02-07").is_ok());
        assert!(DayKey::parse("2026-2-7").is_err());
        assert!(DayKey::parse("2026-02-30").is_err());
        assert!(DayKey::parse("yesterday").is_err());
    }

    #[test]
    fn event_ids_stay_monotonic_when_clock_stalls() {
        let generator = EventIdGenerator::new();
        let at = must_utc("2026-02-07T12:00:00Z");

        let mut previous = must_ok(generator.next_id(at));
        for _ in 0..64 {
            let next = must_ok(generator.next_id(at));
            assert!(next > previous);
            assert!(next.to_string() > previous.to_string());
            previous = next;
        }
    }

    #[test]
    fn event_ids_stay_monotonic_when_clock_steps_back() {
        let generator = EventIdGenerator::new();
        let first = must_ok(generator.next_id(must_utc("2026-02-07T12:00:05Z")));
        let second = must_ok(generator.next_id(must_utc("2026-02-07T12:00:00Z")));
        assert!(second > first);
    }

    #[test]
    fn resumed_generator_continues_after_previous_id() {
        let at = must_utc("2026-02-07T12:00:00Z");
        let first = must_ok(EventIdGenerator::new().next_id(at));
        let resumed = EventIdGenerator::resume_after(Some(first));
        let second = must_ok(resumed.next_id(at));
        assert!(second > first);
    }

    #[test]
    fn update_stamp_strictly_increases() {
        let previous = must_utc("2026-02-07T12:00:00.250Z");
        let stalled = next_update_stamp(previous, previous);
        assert!(stalled > previous);

        let behind = next_update_stamp(previous, must_utc("2026-02-07T11:00:00Z"));
        assert!(behind > previous);

        let ahead = must_utc("2026-02-07T13:00:00.123456Z");
        assert_eq!(
            next_update_stamp(previous, ahead),
            must_utc("2026-02-07T13:00:00.123Z")
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(must_utc("2026-02-07T12:00:00Z"));
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), must_utc("2026-02-07T12:05:00Z"));
    }

    #[test]
    fn collection_names_round_trip() {
        for collection in Collection::SYNC_ORDER {
            assert_eq!(Collection::parse(collection.as_str()), Some(collection));
        }
        assert_eq!(
            Collection::CompletionEvent.cursor_field(),
            CursorField::CreatedAt
        );
        assert_eq!(Collection::Routine.cursor_field(), CursorField::UpdatedAt);
    }
}
