//! Family invites: secret tokens, short human codes and join links.

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::entity::Replicated;
use crate::{truncate_to_millis, Collection, FamilyId, FamsyncError, UserId};

const CODE_LETTERS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ";
const CODE_DIGITS: &[u8] = b"23456789";
const CODE_LETTER_COUNT: usize = 3;
const CODE_DIGIT_COUNT: usize = 4;
const TOKEN_BYTES: usize = 32;

pub const DEFAULT_INVITE_TTL: Duration = Duration::days(7);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InviteState {
    Valid,
    Expired,
    Exhausted,
    Inactive,
}

impl InviteState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FamilyInvite {
    /// Also the document id.
    pub token: String,
    pub code: String,
    pub family_id: FamilyId,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub max_uses: Option<u32>,
    pub used_count: u32,
    pub is_active: bool,
}

impl FamilyInvite {
    /// # Errors
    /// Returns [`FamsyncError::Validation`] for a non-positive TTL or
    /// `max_uses == 0`.
    pub fn new(
        family_id: FamilyId,
        created_by: UserId,
        ttl: Duration,
        max_uses: Option<u32>,
        now: OffsetDateTime,
    ) -> Result<Self, FamsyncError> {
        if ttl <= Duration::ZERO {
            return Err(FamsyncError::Validation(
                "invite ttl MUST be positive".to_string(),
            ));
        }
        if max_uses == Some(0) {
            return Err(FamsyncError::Validation(
                "invite max_uses MUST be >= 1 when provided".to_string(),
            ));
        }

        let now = truncate_to_millis(now);
        Ok(Self {
            token: generate_token(),
            code: generate_code(),
            family_id,
            created_by,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            max_uses,
            used_count: 0,
            is_active: true,
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    #[must_use]
    pub fn is_max_uses_reached(&self) -> bool {
        self.max_uses
            .is_some_and(|max_uses| self.used_count >= max_uses)
    }

    #[must_use]
    pub fn is_valid(&self, now: OffsetDateTime) -> bool {
        self.state(now) == InviteState::Valid
    }

    #[must_use]
    pub fn state(&self, now: OffsetDateTime) -> InviteState {
        if !self.is_active {
            InviteState::Inactive
        } else if self.is_expired(now) {
            InviteState::Expired
        } else if self.is_max_uses_reached() {
            InviteState::Exhausted
        } else {
            InviteState::Valid
        }
    }
}

impl Replicated for FamilyInvite {
    const COLLECTION: Collection = Collection::Invite;

    fn record_id(&self) -> String {
        self.token.clone()
    }
    fn family_id(&self) -> FamilyId {
        self.family_id
    }
    fn parent_id(&self) -> Option<String> {
        Some(self.family_id.to_string())
    }
    fn secondary_key(&self) -> Option<String> {
        Some(self.code.clone())
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

/// 32 random bytes, lowercase hex.
#[must_use]
pub fn generate_token() -> String {
    let mut bytes = [0_u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Three letters then four digits, skipping glyphs that read alike
/// (`I`, `L`, `O`, `0`, `1`).
#[must_use]
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(CODE_LETTER_COUNT + CODE_DIGIT_COUNT);
    for _ in 0..CODE_LETTER_COUNT {
        code.push(char::from(CODE_LETTERS[rng.random_range(0..CODE_LETTERS.len())]));
    }
    for _ in 0..CODE_DIGIT_COUNT {
        code.push(char::from(CODE_DIGITS[rng.random_range(0..CODE_DIGITS.len())]));
    }
    code
}

#[must_use]
pub fn is_token(raw: &str) -> bool {
    raw.len() == TOKEN_BYTES * 2 && raw.bytes().all(|byte| byte.is_ascii_hexdigit())
}

/// Accepts user-typed codes such as `abc-2345` or ` ABC 2345 ` and returns
/// the canonical form, or `None` when the input cannot be a code.
#[must_use]
pub fn normalize_invite_code(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(|ch| !ch.is_whitespace() && *ch != '-')
        .map(|ch| ch.to_ascii_uppercase())
        .collect();
    if code.len() != CODE_LETTER_COUNT + CODE_DIGIT_COUNT {
        return None;
    }

    let bytes = code.as_bytes();
    let letters_ok = bytes[..CODE_LETTER_COUNT]
        .iter()
        .all(|byte| CODE_LETTERS.contains(byte));
    let digits_ok = bytes[CODE_LETTER_COUNT..]
        .iter()
        .all(|byte| CODE_DIGITS.contains(byte));
    (letters_ok && digits_ok).then_some(code)
}

/// Deep link that carries everything a new device needs to join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InviteLink {
    pub scheme: String,
    pub family_id: FamilyId,
    pub token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl InviteLink {
    #[must_use]
    pub fn for_invite(scheme: &str, invite: &FamilyInvite) -> Self {
        Self {
            scheme: scheme.to_string(),
            family_id: invite.family_id,
            token: invite.token.clone(),
            expires_at: invite.expires_at,
        }
    }

    #[must_use]
    pub fn to_url(&self) -> String {
        format!(
            "{}://join?familyId={}&token={}&expires={}",
            self.scheme,
            self.family_id,
            self.token,
            unix_millis(self.expires_at)
        )
    }

    /// # Errors
    /// Returns [`FamsyncError::Validation`] when the URL is not a join link or
    /// any parameter is missing or malformed.
    pub fn parse(url: &str) -> Result<Self, FamsyncError> {
        let invalid =
            |reason: &str| FamsyncError::Validation(format!("invalid invite link: {reason}"));

        let (scheme, rest) = url
            .trim()
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;
        if !is_valid_scheme(scheme) {
            return Err(invalid("malformed scheme"));
        }
        let (host, query) = rest.split_once('?').ok_or_else(|| invalid("missing query"))?;
        if host.trim_end_matches('/') != "join" {
            return Err(invalid("expected join host"));
        }

        let mut family_id = None;
        let mut token = None;
        let mut expires = None;
        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| invalid("malformed parameter"))?;
            match key {
                "familyId" => family_id = Some(FamilyId::parse(value)?),
                "token" => token = Some(value.to_ascii_lowercase()),
                "expires" => {
                    expires = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| invalid("expires MUST be unix milliseconds"))?,
                    );
                }
                _ => {}
            }
        }

        let token = token.ok_or_else(|| invalid("missing token"))?;
        if !is_token(&token) {
            return Err(invalid("token MUST be 64 hex characters"));
        }
        let expires = expires.ok_or_else(|| invalid("missing expires"))?;
        let expires_at = OffsetDateTime::from_unix_timestamp_nanos(i128::from(expires) * 1_000_000)
            .map_err(|_| invalid("expires out of range"))?;

        Ok(Self {
            scheme: scheme.to_string(),
            family_id: family_id.ok_or_else(|| invalid("missing familyId"))?,
            token,
            expires_at,
        })
    }
}

fn unix_millis(at: OffsetDateTime) -> i128 {
    at.unix_timestamp_nanos() / 1_000_000
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
}
