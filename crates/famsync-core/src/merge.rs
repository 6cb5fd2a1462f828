use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergeDecision {
    Insert,
    Replace,
    KeepLocal,
}

impl MergeDecision {
    #[must_use]
    pub fn applies_remote(self) -> bool {
        !matches!(self, Self::KeepLocal)
    }
}

/// Row-level last-write-wins. The remote copy wins only when strictly newer,
/// so re-applying the same document is a no-op and an equal-stamp tie keeps
/// the local row. Tombstones are ordinary fields here: a newer `deleted_at`
/// wins exactly like a newer title would.
#[must_use]
pub fn merge_by_recency(
    local_updated_at: Option<OffsetDateTime>,
    remote_updated_at: OffsetDateTime,
) -> MergeDecision {
    match local_updated_at {
        None => MergeDecision::Insert,
        Some(local) if remote_updated_at > local => MergeDecision::Replace,
        Some(_) => MergeDecision::KeepLocal,
    }
}
