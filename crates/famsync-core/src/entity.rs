//! Mutable shared entities and their row representation.
//!
//! Every entity is stored and replicated as an [`EntityRow`]: a JSON body plus
//! the handful of keys stores index on. `updated_at` is the only signal used to
//! arbitrate between two copies of the same row.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::invite::FamilyInvite;
use crate::{
    truncate_to_millis, validate_time_zone, AssignmentId, ChildId, Collection, FamilyId,
    FamsyncError, RoutineId, StepId, UserId,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityRow {
    pub collection: Collection,
    pub id: String,
    pub family_id: FamilyId,
    pub parent_id: Option<String>,
    pub secondary_key: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    pub body: Value,
}

impl EntityRow {
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Decodes the body into `T`.
    ///
    /// # Errors
    /// Returns [`FamsyncError::Validation`] when the row belongs to another
    /// collection or the body does not decode.
    pub fn decode<T: Replicated>(&self) -> Result<T, FamsyncError> {
        T::from_row(self)
    }
}

/// A record that lives in one replicated collection.
pub trait Replicated: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;

    fn record_id(&self) -> String;
    fn family_id(&self) -> FamilyId;
    fn parent_id(&self) -> Option<String>;
    fn secondary_key(&self) -> Option<String> {
        None
    }
    fn created_at(&self) -> OffsetDateTime;
    fn updated_at(&self) -> OffsetDateTime;
    fn set_updated_at(&mut self, at: OffsetDateTime);
    fn deleted_at(&self) -> Option<OffsetDateTime> {
        None
    }

    /// # Errors
    /// Returns [`FamsyncError::Validation`] when the record cannot be encoded.
    fn to_row(&self) -> Result<EntityRow, FamsyncError> {
        let body = serde_json::to_value(self).map_err(|err| {
            FamsyncError::Validation(format!(
                "failed to encode {} row: {err}",
                Self::COLLECTION
            ))
        })?;
        Ok(EntityRow {
            collection: Self::COLLECTION,
            id: self.record_id(),
            family_id: self.family_id(),
            parent_id: self.parent_id(),
            secondary_key: self.secondary_key(),
            created_at: self.created_at(),
            updated_at: self.updated_at(),
            deleted_at: self.deleted_at(),
            body,
        })
    }

    /// # Errors
    /// Returns [`FamsyncError::Validation`] when the row belongs to another
    /// collection or the body does not decode.
    fn from_row(row: &EntityRow) -> Result<Self, FamsyncError> {
        if row.collection != Self::COLLECTION {
            return Err(FamsyncError::Validation(format!(
                "row {} belongs to {}, expected {}",
                row.id,
                row.collection,
                Self::COLLECTION
            )));
        }
        serde_json::from_value(row.body.clone()).map_err(|err| {
            FamsyncError::Validation(format!(
                "invalid {} row {}: {err}",
                Self::COLLECTION,
                row.id
            ))
        })
    }
}

/// Records that are soft-deleted instead of removed.
pub trait Tombstoned: Replicated {
    fn set_deleted_at(&mut self, at: Option<OffsetDateTime>);
}

/// Rebuilds a row from a replicated JSON body, validating it against the
/// typed schema of `collection`.
///
/// # Errors
/// Returns [`FamsyncError::Validation`] for malformed bodies and for the
/// append-only event collection, which is not row-shaped.
pub fn row_from_body(collection: Collection, body: &Value) -> Result<EntityRow, FamsyncError> {
    fn decode<T: Replicated>(body: &Value) -> Result<EntityRow, FamsyncError> {
        let record: T = serde_json::from_value(body.clone()).map_err(|err| {
            FamsyncError::Validation(format!("invalid {} document: {err}", T::COLLECTION))
        })?;
        record.to_row()
    }

    match collection {
        Collection::Family => decode::<Family>(body),
        Collection::User => decode::<User>(body),
        Collection::ChildProfile => decode::<ChildProfile>(body),
        Collection::Routine => decode::<Routine>(body),
        Collection::RoutineStep => decode::<RoutineStep>(body),
        Collection::Assignment => decode::<RoutineAssignment>(body),
        Collection::Invite => decode::<FamilyInvite>(body),
        Collection::CompletionEvent => Err(FamsyncError::Validation(
            "completion events are not stored as entity rows".to_string(),
        )),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Parent,
    Caregiver,
}

impl UserRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Caregiver => "caregiver",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(Self::Parent),
            "caregiver" => Some(Self::Caregiver),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionRule {
    #[default]
    AllStepsRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Family {
    pub id: FamilyId,
    pub name: String,
    pub time_zone: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Family {
    /// # Errors
    /// Returns [`FamsyncError::Validation`] for an empty name or an unknown
    /// time zone.
    pub fn new(name: &str, time_zone: &str, now: OffsetDateTime) -> Result<Self, FamsyncError> {
        if name.trim().is_empty() {
            return Err(FamsyncError::Validation(
                "family name MUST be provided".to_string(),
            ));
        }
        validate_time_zone(time_zone)?;
        let now = truncate_to_millis(now);
        Ok(Self {
            id: FamilyId::new(),
            name: name.trim().to_string(),
            time_zone: time_zone.to_string(),
            created_at: now,
            updated_at: now,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: UserId,
    pub family_id: FamilyId,
    pub display_name: String,
    pub role: UserRole,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    #[must_use]
    pub fn new(
        family_id: FamilyId,
        display_name: &str,
        role: UserRole,
        now: OffsetDateTime,
    ) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: UserId::new(),
            family_id,
            display_name: display_name.trim().to_string(),
            role,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildProfile {
    pub id: ChildId,
    pub family_id: FamilyId,
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ChildProfile {
    #[must_use]
    pub fn new(
        family_id: FamilyId,
        display_name: &str,
        avatar: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: ChildId::new(),
            family_id,
            display_name: display_name.trim().to_string(),
            avatar,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Routine {
    pub id: RoutineId,
    pub family_id: FamilyId,
    pub title: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub completion_rule: CompletionRule,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Routine {
    #[must_use]
    pub fn new(
        family_id: FamilyId,
        title: &str,
        icon: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: RoutineId::new(),
            family_id,
            title: title.trim().to_string(),
            icon,
            completion_rule: CompletionRule::AllStepsRequired,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineStep {
    pub id: StepId,
    pub family_id: FamilyId,
    pub routine_id: RoutineId,
    pub label: String,
    pub position: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl RoutineStep {
    #[must_use]
    pub fn new(routine: &Routine, label: &str, position: u32, now: OffsetDateTime) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: StepId::new(),
            family_id: routine.family_id,
            routine_id: routine.id,
            label: label.trim().to_string(),
            position,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutineAssignment {
    pub id: AssignmentId,
    pub family_id: FamilyId,
    pub routine_id: RoutineId,
    pub child_id: ChildId,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl RoutineAssignment {
    #[must_use]
    pub fn new(routine: &Routine, child_id: ChildId, now: OffsetDateTime) -> Self {
        let now = truncate_to_millis(now);
        Self {
            id: AssignmentId::new(),
            family_id: routine.family_id,
            routine_id: routine.id,
            child_id,
            is_active: true,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Replicated for Family {
    const COLLECTION: Collection = Collection::Family;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn family_id(&self) -> FamilyId {
        self.id
    }
    fn parent_id(&self) -> Option<String> {
        None
    }
    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
}

impl Replicated for User {
    const COLLECTION: Collection = Collection::User;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn family_id(&self) -> FamilyId {
        self.family_id
    }
    fn parent_id(&self) -> Option<String> {
        Some(self.family_id.to_string())
    }
    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
}

impl Replicated for ChildProfile {
    const COLLECTION: Collection = Collection::ChildProfile;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn family_id(&self) -> FamilyId {
        self.family_id
    }
    fn parent_id(&self) -> Option<String> {
        Some(self.family_id.to_string())
    }
    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
}

impl Replicated for Routine {
    const COLLECTION: Collection = Collection::Routine;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn family_id(&self) -> FamilyId {
        self.family_id
    }
    fn parent_id(&self) -> Option<String> {
        Some(self.family_id.to_string())
    }
    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
    fn deleted_at(&self) -> Option<OffsetDateTime> {
        self.deleted_at
    }
}

impl Tombstoned for Routine {
    fn set_deleted_at(&mut self, at: Option<OffsetDateTime>) {
        self.deleted_at = at;
    }
}

impl Replicated for RoutineStep {
    const COLLECTION: Collection = Collection::RoutineStep;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn family_id(&self) -> FamilyId {
        self.family_id
    }
    fn parent_id(&self) -> Option<String> {
        Some(self.routine_id.to_string())
    }
    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
    fn deleted_at(&self) -> Option<OffsetDateTime> {
        self.deleted_at
    }
}

impl Tombstoned for RoutineStep {
    fn set_deleted_at(&mut self, at: Option<OffsetDateTime>) {
        self.deleted_at = at;
    }
}

impl Replicated for RoutineAssignment {
    const COLLECTION: Collection = Collection::Assignment;

    fn record_id(&self) -> String {
        self.id.to_string()
    }
    fn family_id(&self) -> FamilyId {
        self.family_id
    }
    fn parent_id(&self) -> Option<String> {
        Some(self.child_id.to_string())
    }
    fn secondary_key(&self) -> Option<String> {
        Some(self.routine_id.to_string())
    }
    fn created_at(&self) -> OffsetDateTime {
        self.created_at
    }
    fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: OffsetDateTime) {
        self.updated_at = at;
    }
    fn deleted_at(&self) -> Option<OffsetDateTime> {
        self.deleted_at
    }
}

impl Tombstoned for RoutineAssignment {
    fn set_deleted_at(&mut self, at: Option<OffsetDateTime>) {
        self.deleted_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_rfc3339_utc;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixed_now() -> OffsetDateTime {
        must_ok(parse_rfc3339_utc("2026-02-07T07:00:00.123456Z"))
    }

    #[test]
    fn family_rejects_unknown_time_zone() {
        assert!(Family::new("Rivera", "Not/AZone", fixed_now()).is_err());
        assert!(Family::new("  ", "UTC", fixed_now()).is_err());
    }

    #[test]
    fn new_records_truncate_to_millis() {
        let family = must_ok(Family::new("Rivera", "America/Chicago", fixed_now()));
        assert_eq!(family.created_at.nanosecond(), 123_000_000);
        assert_eq!(family.created_at, family.updated_at);
    }

    #[test]
    fn assignment_row_carries_child_parent_and_routine_secondary_key() {
        let family = must_ok(Family::new("Rivera", "UTC", fixed_now()));
        let routine = Routine::new(family.id, "Morning", None, fixed_now());
        let child = ChildProfile::new(family.id, "Ana", None, fixed_now());
        let assignment = RoutineAssignment::new(&routine, child.id, fixed_now());

        let row = must_ok(assignment.to_row());
        assert_eq!(row.collection, Collection::Assignment);
        assert_eq!(row.parent_id, Some(child.id.to_string()));
        assert_eq!(row.secondary_key, Some(routine.id.to_string()));
        assert_eq!(row.family_id, family.id);

        let decoded: RoutineAssignment = must_ok(row.decode());
        assert_eq!(decoded, assignment);
    }

    #[test]
    fn decode_rejects_row_from_other_collection() {
        let family = must_ok(Family::new("Rivera", "UTC", fixed_now()));
        let routine = Routine::new(family.id, "Morning", None, fixed_now());
        let row = must_ok(routine.to_row());
        assert!(row.decode::<RoutineStep>().is_err());
    }

    #[test]
    fn row_from_body_keeps_tombstone() {
        let family = must_ok(Family::new("Rivera", "UTC", fixed_now()));
        let mut routine = Routine::new(family.id, "Bedtime", Some("moon".into()), fixed_now());
        routine.set_deleted_at(Some(fixed_now()));

        let body = must_ok(serde_json::to_value(&routine));
        let row = must_ok(row_from_body(Collection::Routine, &body));
        assert!(row.is_deleted());
        assert_eq!(row.id, routine.id.to_string());
    }

    #[test]
    fn row_from_body_rejects_malformed_documents() {
        let body = serde_json::json!({ "id": "not-a-ulid", "title": 7 });
        assert!(row_from_body(Collection::Routine, &body).is_err());
        assert!(row_from_body(Collection::CompletionEvent, &body).is_err());
    }
}
