//! Error taxonomy for the targeting and acceptance core.
//!
//! Business rejections (`TargetingRestriction`), lost races (`InvalidState`)
//! and infrastructure faults are distinct kinds so callers can tell
//! "not allowed" from "refresh and re-decide" from "try later".
use crate::gateway::GatewayError;
use crate::ledger::LedgerError;
use crate::swap::SwapStatus;
use crate::target::TargetStatus;

/// Caller-correctable input problems. Never retried automatically.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("a swap cannot target itself")]
    SelfTarget,
    #[error("proposal message is empty")]
    EmptyMessage,
    #[error("proposal message is {0} characters, over the limit")]
    MessageTooLong(usize),
    #[error("compatibility score {0} is out of range (0-100)")]
    ScoreOutOfRange(u8),
    #[error("cash offer amount must be positive")]
    ZeroCashOffer,
    #[error("swap is not an auction")]
    NotAnAuction,
}

/// Business-rule rejection of a targeting act. Not a system fault; not
/// retryable until the underlying condition changes.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetingRestriction {
    #[error("swap is already targeted by an active proposal")]
    AlreadyTargeted,
    #[error("swap already has an outgoing active target")]
    AlreadyTargeting,
    #[error("target swap is already targeting the source swap")]
    CircularTargeting,
    #[error("the auction has ended")]
    AuctionEnded,
    #[error("swap is not open for targeting (status: {status})")]
    SwapUnavailable { status: SwapStatus },
}

/// A race was lost or a terminal transition was re-attempted. The caller
/// should refresh and re-decide, not blindly retry the same call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidState {
    #[error("target {target_id} is not active (status: {status})")]
    TargetNotActive {
        target_id: String,
        status: TargetStatus,
    },
    #[error("proposal was already accepted")]
    AlreadyAccepted,
    #[error("swap {swap_id} is already resolved (status: {status})")]
    SwapResolved { swap_id: String, status: SwapStatus },
    #[error("swap {swap_id} is not in an accepted state (status: {status})")]
    SwapNotAccepted { swap_id: String, status: SwapStatus },
}

#[derive(thiserror::Error, Debug)]
pub enum MarketError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("targeting restricted: {0}")]
    Restriction(#[from] TargetingRestriction),
    #[error("user {user_id} is not authorised to {action}")]
    Authorization {
        user_id: String,
        action: &'static str,
    },
    #[error(transparent)]
    InvalidState(#[from] InvalidState),
    /// The domain transition was NOT committed; the whole acceptance may be
    /// retried once the payment problem is resolved.
    #[error("payment failed: {0}")]
    PaymentFailed(#[source] GatewayError),
    #[error("audit ledger rejected the event: {0}")]
    Ledger(#[from] LedgerError),
    /// Transient infrastructure failure after bounded retries.
    #[error("service unavailable after {attempts} attempts")]
    ServiceUnavailable { attempts: u32 },
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec failure: {0}")]
    Codec(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl MarketError {
    /// Whether the caller may usefully retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MarketError::ServiceUnavailable { .. }
                | MarketError::Storage(_)
                | MarketError::PaymentFailed(GatewayError::Timeout)
                | MarketError::PaymentFailed(GatewayError::Unavailable)
        )
    }
}
