//! Read-side projection and reconciliation.
//!
//! Reads run concurrently with writes and must tolerate transitional or
//! partially missing data. A failed lookup degrades the affected field to an
//! explicit sentinel instead of failing the whole view, and invariant
//! violations are reported in a structured form, never thrown.
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::error::MarketError;
use crate::proposal::Proposal;
use crate::store::MarketStore;
use crate::swap::{AcceptanceStrategy, Swap, SwapStatus, TimeStamp};
use crate::target::{Target, TargetStatus};

/// Sentinel shown when the proposer's profile cannot be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";
/// Sentinel shown when a price cannot be rendered from the stored offer.
pub const PRICE_UNAVAILABLE: &str = "Price not available";

/// Read-side lookup of display names. Deployments without a profile service
/// plug in [`NullUserDirectory`] and every name degrades to the sentinel.
pub trait UserDirectory: Send + Sync {
    fn display_name(&self, user_id: &str) -> Option<String>;
}

pub struct NullUserDirectory;

impl UserDirectory for NullUserDirectory {
    fn display_name(&self, _user_id: &str) -> Option<String> {
        None
    }
}

/// One incoming proposal as shown on a swap card. Every field is present;
/// unavailable data is sentinel-labelled, never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSummary {
    pub target_id: String,
    pub source_swap_id: String,
    pub proposal_id: String,
    pub proposer_name: String,
    pub message: String,
    /// Advisory display value, 0-100. Never used for ordering.
    pub compatibility_score: u8,
    pub price_label: Option<String>,
    pub status: TargetStatus,
    pub created_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone)]
pub struct SwapCard {
    pub swap_id: String,
    pub owner_name: String,
    pub status: SwapStatus,
    pub acceptance_strategy: AcceptanceStrategy,
    pub incoming: Vec<TargetSummary>,
    pub outgoing_target_id: Option<String>,
    /// True when at least one field was replaced with a sentinel.
    pub degraded: bool,
}

/// Raw material for a consistency check, however it was fetched.
#[derive(Debug, Clone)]
pub struct SwapView {
    pub swap: Swap,
    pub incoming: Vec<Target>,
    pub proposals: Vec<Proposal>,
    pub outgoing: Option<Target>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyIssue {
    /// Incoming target count does not match the materialized proposal list.
    CountMismatch { targets: usize, proposals: usize },
    SelfTarget { target_id: String },
    DuplicateTarget { target_id: String },
    /// The swap's outgoing target points back at the source of one of its
    /// active incoming targets.
    CircularReference { with_swap_id: String },
    /// An accepted swap must hold exactly one accepted target.
    AcceptedTargetCount { count: usize },
    InvalidPrice { proposal_id: String },
}

impl std::fmt::Display for ConsistencyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyIssue::CountMismatch { targets, proposals } => {
                write!(f, "{targets} incoming targets but {proposals} proposals")
            }
            ConsistencyIssue::SelfTarget { target_id } => {
                write!(f, "target {target_id} points at its own source swap")
            }
            ConsistencyIssue::DuplicateTarget { target_id } => {
                write!(f, "target {target_id} listed more than once")
            }
            ConsistencyIssue::CircularReference { with_swap_id } => {
                write!(f, "mutual active targeting with swap {with_swap_id}")
            }
            ConsistencyIssue::AcceptedTargetCount { count } => {
                write!(f, "accepted swap holds {count} accepted targets")
            }
            ConsistencyIssue::InvalidPrice { proposal_id } => {
                write!(f, "proposal {proposal_id} carries an unrenderable price")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsistencyReport {
    pub is_consistent: bool,
    pub issues: Vec<ConsistencyIssue>,
}

/// Invariant check over an already-fetched view. Violations are reported for
/// monitoring, not raised; the caller decides whether to degrade the read.
pub fn validate_swap_consistency(view: &SwapView) -> ConsistencyReport {
    let mut issues = Vec::new();

    if view.incoming.len() != view.proposals.len() {
        issues.push(ConsistencyIssue::CountMismatch {
            targets: view.incoming.len(),
            proposals: view.proposals.len(),
        });
    }

    let mut seen = std::collections::HashSet::new();
    for target in &view.incoming {
        if target.source_swap_id == target.target_swap_id {
            issues.push(ConsistencyIssue::SelfTarget {
                target_id: target.id.clone(),
            });
        }
        if !seen.insert(target.id.as_str()) {
            issues.push(ConsistencyIssue::DuplicateTarget {
                target_id: target.id.clone(),
            });
        }
    }

    if let Some(outgoing) = &view.outgoing {
        if outgoing.source_swap_id == outgoing.target_swap_id {
            issues.push(ConsistencyIssue::SelfTarget {
                target_id: outgoing.id.clone(),
            });
        }
        let mutual = view
            .incoming
            .iter()
            .any(|t| t.is_active() && t.source_swap_id == outgoing.target_swap_id);
        if outgoing.is_active() && mutual {
            issues.push(ConsistencyIssue::CircularReference {
                with_swap_id: outgoing.target_swap_id.clone(),
            });
        }
    }

    if matches!(view.swap.status, SwapStatus::Accepted | SwapStatus::Completed) {
        let accepted = view
            .incoming
            .iter()
            .filter(|t| t.status == TargetStatus::Accepted)
            .count();
        // a swap accepted from its own outgoing side holds zero incoming
        // accepted targets, which is fine; two or more never is
        let outgoing_accepted = view
            .outgoing
            .as_ref()
            .is_some_and(|t| t.status == TargetStatus::Accepted);
        if accepted > 1 || (accepted == 0 && !outgoing_accepted) {
            issues.push(ConsistencyIssue::AcceptedTargetCount { count: accepted });
        }
    }

    for proposal in &view.proposals {
        if proposal.cash_offer.as_ref().is_some_and(|o| o.amount == 0) {
            issues.push(ConsistencyIssue::InvalidPrice {
                proposal_id: proposal.id.clone(),
            });
        }
    }

    ConsistencyReport {
        is_consistent: issues.is_empty(),
        issues,
    }
}

#[derive(Clone)]
pub struct ConsistencyService {
    store: MarketStore,
    directory: Arc<dyn UserDirectory>,
}

impl ConsistencyService {
    pub fn new(store: MarketStore, directory: Arc<dyn UserDirectory>) -> Self {
        Self { store, directory }
    }

    /// Fetch everything a consistency check needs for one swap.
    pub fn load_view(&self, swap_id: &str) -> Result<SwapView, MarketError> {
        let swap = self.store.swap(swap_id)?;
        let incoming = self.store.incoming_targets(swap_id)?;
        let mut proposals = Vec::with_capacity(incoming.len());
        for target in &incoming {
            if let Some(proposal) = self.store.try_proposal(&target.proposal_id)? {
                proposals.push(proposal);
            }
        }
        // the active-outgoing pointer is cleared on acceptance, so a swap
        // accepted from its proposing side surfaces its accepted edge here
        let outgoing = match self.store.outgoing_active_target(swap_id)? {
            Some(target) => Some(target),
            None => self
                .store
                .targets_from(swap_id)?
                .into_iter()
                .find(|t| t.status == TargetStatus::Accepted),
        };
        Ok(SwapView {
            swap,
            incoming,
            proposals,
            outgoing,
        })
    }

    pub fn check_swap(&self, swap_id: &str) -> Result<ConsistencyReport, MarketError> {
        let view = self.load_view(swap_id)?;
        let report = validate_swap_consistency(&view);
        if !report.is_consistent {
            warn!(swap_id, issues = report.issues.len(), "swap view failed consistency check");
        }
        Ok(report)
    }

    /// Display projection of a swap and its incoming proposals. The swap row
    /// itself must exist; everything hanging off it degrades field-by-field
    /// to sentinels when unavailable.
    pub fn project_swap_card(&self, swap_id: &str) -> Result<SwapCard, MarketError> {
        let swap = self.store.swap(swap_id)?;
        let mut degraded = false;

        let owner_name = match self.directory.display_name(&swap.owner_id) {
            Some(name) => name,
            None => {
                degraded = true;
                UNKNOWN_USER.to_string()
            }
        };

        let targets = self.store.incoming_targets(swap_id)?;
        let mut incoming = Vec::with_capacity(targets.len());
        for target in targets {
            let summary = match self.store.try_proposal(&target.proposal_id) {
                Ok(Some(proposal)) => self.summarize(&target, &proposal, &mut degraded),
                Ok(None) | Err(_) => {
                    // proposal row missing or unreadable: keep the target,
                    // label everything we cannot show
                    degraded = true;
                    TargetSummary {
                        target_id: target.id.clone(),
                        source_swap_id: target.source_swap_id.clone(),
                        proposal_id: target.proposal_id.clone(),
                        proposer_name: UNKNOWN_USER.to_string(),
                        message: String::new(),
                        compatibility_score: 0,
                        price_label: Some(PRICE_UNAVAILABLE.to_string()),
                        status: target.status,
                        created_at: target.created_at.clone(),
                    }
                }
            };
            incoming.push(summary);
        }

        let outgoing_target_id = self
            .store
            .outgoing_active_target(swap_id)?
            .map(|t| t.id);

        Ok(SwapCard {
            swap_id: swap.id,
            owner_name,
            status: swap.status,
            acceptance_strategy: swap.acceptance_strategy,
            incoming,
            outgoing_target_id,
            degraded,
        })
    }

    fn summarize(
        &self,
        target: &Target,
        proposal: &Proposal,
        degraded: &mut bool,
    ) -> TargetSummary {
        let proposer_name = match self.directory.display_name(&proposal.proposer_id) {
            Some(name) => name,
            None => {
                *degraded = true;
                UNKNOWN_USER.to_string()
            }
        };
        let price_label = proposal.cash_offer.as_ref().map(|offer| {
            if offer.amount == 0 {
                *degraded = true;
                PRICE_UNAVAILABLE.to_string()
            } else {
                offer.label()
            }
        });
        TargetSummary {
            target_id: target.id.clone(),
            source_swap_id: target.source_swap_id.clone(),
            proposal_id: proposal.id.clone(),
            proposer_name,
            message: proposal.message.clone(),
            compatibility_score: proposal.compatibility_score,
            price_label,
            status: target.status,
            created_at: target.created_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;

    fn swap_pair() -> (Swap, Swap) {
        let a = Swap::new_one_for_one(utils::user_id(), utils::booking_id());
        let b = Swap::new_one_for_one(utils::user_id(), utils::booking_id());
        (a, b)
    }

    fn edge(source: &Swap, target: &Swap) -> Target {
        Target::new(
            source.id.clone(),
            target.id.clone(),
            utils::proposal_id(),
            TimeStamp::now(),
        )
    }

    #[test]
    fn missing_proposal_is_a_count_mismatch() {
        let (a, mut b) = swap_pair();
        b.status = SwapStatus::Pending;
        let t = edge(&a, &b);

        let view = SwapView {
            swap: b,
            incoming: vec![t],
            proposals: vec![],
            outgoing: None,
        };
        let report = validate_swap_consistency(&view);
        assert!(!report.is_consistent);
        assert_eq!(
            report.issues,
            vec![ConsistencyIssue::CountMismatch {
                targets: 1,
                proposals: 0
            }]
        );
    }

    #[test]
    fn detects_self_target_and_duplicates() {
        let (a, b) = swap_pair();
        let mut selfie = edge(&a, &b);
        selfie.target_swap_id = selfie.source_swap_id.clone();
        let dup = selfie.clone();

        let view = SwapView {
            swap: b,
            incoming: vec![selfie.clone(), dup],
            proposals: vec![],
            outgoing: None,
        };
        let report = validate_swap_consistency(&view);
        assert!(report.issues.contains(&ConsistencyIssue::SelfTarget {
            target_id: selfie.id.clone()
        }));
        assert!(report.issues.contains(&ConsistencyIssue::DuplicateTarget {
            target_id: selfie.id
        }));
    }

    #[test]
    fn detects_mutual_targeting() {
        let (a, b) = swap_pair();
        let incoming = edge(&a, &b);
        let outgoing = edge(&b, &a);

        let view = SwapView {
            swap: b.clone(),
            incoming: vec![incoming],
            proposals: vec![],
            outgoing: Some(outgoing),
        };
        let report = validate_swap_consistency(&view);
        assert!(report.issues.contains(&ConsistencyIssue::CircularReference {
            with_swap_id: a.id
        }));
    }

    #[test]
    fn accepted_swap_needs_exactly_one_accepted_target() {
        let (a, mut b) = swap_pair();
        b.status = SwapStatus::Accepted;
        let mut t = edge(&a, &b);
        t.status = TargetStatus::Rejected;

        let view = SwapView {
            swap: b,
            incoming: vec![t],
            proposals: vec![],
            outgoing: None,
        };
        let report = validate_swap_consistency(&view);
        assert!(report.issues.contains(&ConsistencyIssue::AcceptedTargetCount {
            count: 0
        }));
    }

    #[test]
    fn null_directory_degrades_names_to_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("consistency_tests.db")).unwrap();
        let store = MarketStore::new(Arc::new(db));
        let swap = Swap::new_one_for_one(utils::user_id(), utils::booking_id());
        store.put_swap(&swap).unwrap();

        let service = ConsistencyService::new(store, Arc::new(NullUserDirectory));
        let card = service.project_swap_card(&swap.id).unwrap();

        assert_eq!(card.owner_name, UNKNOWN_USER);
        assert!(card.degraded);
        assert!(card.incoming.is_empty());
    }
}
