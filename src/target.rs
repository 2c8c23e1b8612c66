//! Target entity: a directed edge from one swap to another, carrying a proposal.
use chrono::Utc;

use crate::swap::TimeStamp;
use crate::utils;

/// Status of a targeting edge. `Active` is the only non-terminal state.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    #[n(0)]
    Active,
    #[n(1)]
    Accepted,
    #[n(2)]
    Rejected,
    #[n(3)]
    Withdrawn,
    #[n(4)]
    Expired,
}

impl TargetStatus {
    pub fn is_terminal(&self) -> bool {
        *self != TargetStatus::Active
    }
}

impl std::fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TargetStatus::Active => "active",
            TargetStatus::Accepted => "accepted",
            TargetStatus::Rejected => "rejected",
            TargetStatus::Withdrawn => "withdrawn",
            TargetStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// "My swap proposes against yours": created by the source swap's owner,
/// 1:1 with its proposal, and only ever mutated through status transitions.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Target {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub source_swap_id: String,
    #[n(2)]
    pub target_swap_id: String,
    #[n(3)]
    pub proposal_id: String,
    #[n(4)]
    pub status: TargetStatus,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

impl Target {
    pub fn new(
        source_swap_id: String,
        target_swap_id: String,
        proposal_id: String,
        created_at: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id: utils::target_id(),
            source_swap_id,
            target_swap_id,
            proposal_id,
            status: TargetStatus::Active,
            updated_at: created_at.clone(),
            created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Active
    }
}
