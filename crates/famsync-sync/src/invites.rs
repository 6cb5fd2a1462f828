use famsync_core::invite::{generate_code, is_token, normalize_invite_code};
use famsync_core::{
    next_update_stamp, Clock, Collection, Family, FamilyId, FamilyInvite, FamsyncError,
    InviteState, Replicated, User, UserId, UserRole,
};
use time::Duration;
use tracing::{debug, info};

use crate::{EntityStore, LocalStore, SyncResult};

const CODE_ATTEMPTS: usize = 16;
const REDEEM_ATTEMPTS: usize = 5;

pub struct InviteLifecycle<'a, L: LocalStore + ?Sized> {
    local: &'a L,
    clock: &'a dyn Clock,
}

impl<'a, L: LocalStore + ?Sized> InviteLifecycle<'a, L> {
    #[must_use]
    pub fn new(local: &'a L, clock: &'a dyn Clock) -> Self {
        Self { local, clock }
    }

    fn entities(&self) -> EntityStore<'a, L> {
        EntityStore::new(self.local, self.clock)
    }

    /// Issues an invite on behalf of a parent of `family_id`.
    ///
    /// # Errors
    /// Returns [`FamsyncError::NotFound`] for an unknown family or user,
    /// [`FamsyncError::InvalidState`] when the user is not a parent of the
    /// family, and [`FamsyncError::Validation`] for bad TTL or `max_uses`.
    pub fn create(
        &self,
        family_id: FamilyId,
        created_by: UserId,
        ttl: Duration,
        max_uses: Option<u32>,
    ) -> SyncResult<FamilyInvite> {
        let entities = self.entities();
        entities.require::<Family>(&family_id.to_string())?;
        let user: User = entities.require(&created_by.to_string())?;
        if user.family_id != family_id || user.role != UserRole::Parent {
            return Err(FamsyncError::InvalidState(format!(
                "user {created_by} is not a parent of family {family_id}"
            )));
        }

        let mut invite = FamilyInvite::new(family_id, created_by, ttl, max_uses, self.clock.now())?;
        let mut attempts = 1;
        while self
            .local
            .row_by_secondary_key(Collection::Invite, &invite.code)?
            .is_some()
        {
            if attempts >= CODE_ATTEMPTS {
                return Err(FamsyncError::InvalidState(
                    "could not find a free invite code".to_string(),
                ));
            }
            debug!(code = %invite.code, "invite code collision; regenerating");
            invite.code = generate_code();
            attempts += 1;
        }

        let invite = entities.create(&invite)?;
        info!(family_id = %family_id, code = %invite.code, "created invite");
        Ok(invite)
    }

    /// Looks an invite up by its 64-hex token or its short code.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn find(&self, code_or_token: &str) -> SyncResult<Option<FamilyInvite>> {
        let raw = code_or_token.trim();
        let row = if is_token(raw) {
            self.local
                .get_row(Collection::Invite, &raw.to_ascii_lowercase())?
        } else if let Some(code) = normalize_invite_code(raw) {
            self.local.row_by_secondary_key(Collection::Invite, &code)?
        } else {
            None
        };
        row.map(|row| FamilyInvite::from_row(&row)).transpose()
    }

    /// Consumes one use of a valid invite. The check and the increment are a
    /// single compare-and-set on the row, so two redeemers can never both
    /// take the last use.
    ///
    /// # Errors
    /// Returns [`FamsyncError::NotFound`] for unknown invites and
    /// [`FamsyncError::InvalidState`] when the invite is not valid, has no
    /// uses left to count, or stays contended.
    pub fn redeem(&self, code_or_token: &str) -> SyncResult<FamilyInvite> {
        for attempt in 0..REDEEM_ATTEMPTS {
            let invite = self.require(code_or_token)?;
            let now = self.clock.now();
            let state = invite.state(now);
            if state != InviteState::Valid {
                return Err(FamsyncError::InvalidState(format!(
                    "invite {} is {}",
                    invite.code,
                    state.as_str()
                )));
            }

            let mut redeemed = invite.clone();
            redeemed.used_count = invite.used_count.checked_add(1).ok_or_else(|| {
                FamsyncError::InvalidState(format!("invite {} has no uses left", invite.code))
            })?;
            redeemed.updated_at = next_update_stamp(invite.updated_at, now);
            if self
                .local
                .put_row_if(&redeemed.to_row()?, Some(invite.updated_at), false)?
            {
                info!(
                    family_id = %redeemed.family_id,
                    code = %redeemed.code,
                    used_count = redeemed.used_count,
                    "redeemed invite"
                );
                return Ok(redeemed);
            }
            debug!(code = %invite.code, attempt, "invite redemption raced; re-reading");
        }
        Err(FamsyncError::InvalidState(format!(
            "invite {} is contended; try again",
            code_or_token.trim()
        )))
    }

    /// Redeems an invite and adds the joining user to its family.
    ///
    /// The name and the invite's family are checked before the use is
    /// consumed. Only a storage failure while inserting the user can leave a
    /// use spent without a member to show for it.
    ///
    /// # Errors
    /// Returns [`FamsyncError::Validation`] for a blank name,
    /// [`FamsyncError::NotFound`] when the invite's family is not stored
    /// locally, and otherwise the same as [`InviteLifecycle::redeem`].
    pub fn join(
        &self,
        code_or_token: &str,
        display_name: &str,
        role: UserRole,
    ) -> SyncResult<(FamilyInvite, User)> {
        if display_name.trim().is_empty() {
            return Err(FamsyncError::Validation(
                "display name MUST be provided".to_string(),
            ));
        }
        let pending = self.require(code_or_token)?;
        let entities = self.entities();
        entities.require::<Family>(&pending.family_id.to_string())?;
        let user = User::new(pending.family_id, display_name, role, self.clock.now());

        let invite = self.redeem(code_or_token)?;
        let user = entities.create(&user)?;
        Ok((invite, user))
    }

    fn require(&self, code_or_token: &str) -> SyncResult<FamilyInvite> {
        self.find(code_or_token)?
            .ok_or_else(|| FamsyncError::NotFound(format!("invite {}", code_or_token.trim())))
    }

    /// # Errors
    /// Returns [`FamsyncError::NotFound`] for unknown tokens.
    pub fn deactivate(&self, token: &str) -> SyncResult<FamilyInvite> {
        let current = self.require(token)?;
        if !current.is_active {
            return Ok(current);
        }
        self.entities()
            .update(&current.token, |invite: &mut FamilyInvite| {
                invite.is_active = false;
                Ok(())
            })
    }

    /// Physically removes this family's expired invites from the local store.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn delete_expired(&self, family_id: FamilyId) -> SyncResult<usize> {
        let now = self.clock.now();
        let mut deleted = 0;
        for invite in self.list(family_id)? {
            if invite.is_expired(now) && self.local.delete_row(Collection::Invite, &invite.token)? {
                deleted += 1;
            }
        }
        if deleted > 0 {
            info!(family_id = %family_id, deleted, "deleted expired invites");
        }
        Ok(deleted)
    }

    /// # Errors
    /// Propagates storage failures.
    pub fn list(&self, family_id: FamilyId) -> SyncResult<Vec<FamilyInvite>> {
        self.entities().list_by_family(family_id, true)
    }
}
