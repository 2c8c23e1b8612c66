//! Targeting state machine: create, retarget and remove targeting edges while
//! preserving the exclusivity and circularity invariants.
//!
//! Every transition validates against the rows it is about to change inside
//! one storage transaction, so two racing requests resolve to one winner and
//! one typed rejection. Ledger notifications happen after commit and are
//! best-effort.
use std::sync::Arc;

use tracing::warn;

use crate::error::{MarketError, TargetingRestriction, ValidationError};
use crate::ledger::{AuditEvent, AuditLedger};
use crate::proposal::{Proposal, ProposalDraft};
use crate::store::{
    ClosedTarget, MarketStore, outgoing_key, proposal_key, swap_key, target_key,
    tx_abort, tx_active_incoming_count, tx_clear_outgoing, tx_get, tx_get_id, tx_incoming_ids,
    tx_push_incoming, tx_put, tx_require, tx_revert_target_swap, close_target,
};
use crate::swap::{AcceptanceStrategy, Swap, SwapStatus, TimeStamp};
use crate::target::{Target, TargetStatus};

/// What the caller wants when the source swap already holds an outgoing
/// active target. The two behaviours existed side by side historically, so
/// the caller must state intent rather than have the service guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetingIntent {
    /// Fail with `AlreadyTargeting` if an outgoing active target exists.
    CreateOnly,
    /// Withdraw the existing outgoing target and create the new one, in the
    /// same transaction.
    AllowRetarget,
}

#[derive(Debug, Clone)]
pub struct TargetRequest {
    pub source_swap_id: String,
    pub target_swap_id: String,
    pub proposer_id: String,
    pub draft: ProposalDraft,
    pub intent: TargetingIntent,
}

#[derive(Debug, Clone)]
pub struct TargetingOutcome {
    pub target: Target,
    pub proposal: Proposal,
    pub target_swap: Swap,
    /// The previous outgoing target, when this call retargeted.
    pub withdrawn: Option<Target>,
}

/// What a swap can currently do in the targeting graph, derived from status,
/// strategy and the active edges around it.
#[derive(Debug, Clone)]
pub struct TargetingCapabilities {
    pub can_receive_targets: bool,
    pub can_target: bool,
    pub restrictions: Vec<TargetingRestriction>,
    pub current_incoming_targets: usize,
    /// `Some(1)` for one-for-one swaps, `None` (unbounded) for auctions.
    pub max_incoming_targets: Option<usize>,
}

#[derive(Clone)]
pub struct TargetingService {
    store: MarketStore,
    ledger: Arc<dyn AuditLedger>,
}

impl TargetingService {
    pub fn new(store: MarketStore, ledger: Arc<dyn AuditLedger>) -> Self {
        Self { store, ledger }
    }

    /// Target another user's swap with a proposal.
    pub fn create_target(&self, req: TargetRequest) -> Result<TargetingOutcome, MarketError> {
        if req.source_swap_id == req.target_swap_id {
            return Err(ValidationError::SelfTarget.into());
        }
        req.draft.validate()?;

        let now = TimeStamp::now();
        let outcome = self.store.tx(|tx| {
            let source: Swap = tx_require(
                tx,
                &swap_key(&req.source_swap_id),
                "swap",
                &req.source_swap_id,
            )?;
            if source.owner_id != req.proposer_id {
                return tx_abort(MarketError::Authorization {
                    user_id: req.proposer_id.clone(),
                    action: "target from this swap",
                });
            }
            if source.is_resolved() || source.expired_by(&now) {
                let status = if source.is_resolved() {
                    source.status
                } else {
                    SwapStatus::Expired
                };
                return tx_abort(TargetingRestriction::SwapUnavailable { status });
            }

            let tgt: Swap = tx_require(
                tx,
                &swap_key(&req.target_swap_id),
                "swap",
                &req.target_swap_id,
            )?;
            if !matches!(tgt.status, SwapStatus::Active | SwapStatus::Pending) {
                return tx_abort(TargetingRestriction::SwapUnavailable { status: tgt.status });
            }
            if tgt.expired_by(&now) {
                return tx_abort(TargetingRestriction::SwapUnavailable {
                    status: SwapStatus::Expired,
                });
            }
            if tgt.auction_ended(&now) {
                return tx_abort(TargetingRestriction::AuctionEnded);
            }

            // outgoing exclusivity: one active target per source swap
            let mut withdrawn: Option<Target> = None;
            if let Some(old_id) = tx_get_id(tx, &outgoing_key(&source.id))? {
                match tx_get::<Target>(tx, &target_key(&old_id))? {
                    Some(mut old) if old.is_active() => match req.intent {
                        TargetingIntent::CreateOnly => {
                            return tx_abort(TargetingRestriction::AlreadyTargeting);
                        }
                        TargetingIntent::AllowRetarget => {
                            old.status = TargetStatus::Withdrawn;
                            old.updated_at = now.clone();
                            tx_put(tx, &target_key(&old.id), &old)?;
                            tx.remove(outgoing_key(&source.id).as_str())?;
                            // same-swap retarget: the active-count below already
                            // excludes the old edge, no reversion needed
                            if old.target_swap_id != tgt.id {
                                tx_revert_target_swap(tx, &old.target_swap_id, &old.id)?;
                            }
                            withdrawn = Some(old);
                        }
                    },
                    _ => {
                        // stale pointer left by an interrupted transition
                        tx.remove(outgoing_key(&source.id).as_str())?;
                    }
                }
            }

            // no 2-cycles: B may not target A while A actively targets B
            if let Some(their_out_id) = tx_get_id(tx, &outgoing_key(&tgt.id))? {
                if let Some(theirs) = tx_get::<Target>(tx, &target_key(&their_out_id))? {
                    if theirs.is_active() && theirs.target_swap_id == source.id {
                        return tx_abort(TargetingRestriction::CircularTargeting);
                    }
                }
            }

            let active_incoming = tx_active_incoming_count(
                tx,
                &tgt.id,
                withdrawn.as_ref().map(|t| t.id.as_str()),
            )?;
            if tgt.acceptance_strategy == AcceptanceStrategy::OneForOne && active_incoming > 0 {
                return tx_abort(TargetingRestriction::AlreadyTargeted);
            }

            let mut target = Target::new(
                source.id.clone(),
                tgt.id.clone(),
                String::new(),
                now.clone(),
            );
            let proposal = req.draft.clone().into_proposal(
                target.id.clone(),
                source.id.clone(),
                tgt.id.clone(),
                source.owner_id.clone(),
                tgt.owner_id.clone(),
                now.clone(),
            );
            target.proposal_id = proposal.id.clone();

            tx_put(tx, &target_key(&target.id), &target)?;
            tx_put(tx, &proposal_key(&proposal.id), &proposal)?;
            tx_push_incoming(tx, &tgt.id, &target.id)?;
            tx.insert(outgoing_key(&source.id).as_str(), target.id.as_bytes())?;

            let mut tgt = tgt;
            if active_incoming == 0 && tgt.status == SwapStatus::Active {
                tgt.status = SwapStatus::Pending;
            }
            // rewrite even when unchanged so a concurrent acceptance on this
            // swap serializes against us
            tx_put(tx, &swap_key(&tgt.id), &tgt)?;

            Ok(TargetingOutcome {
                target,
                proposal,
                target_swap: tgt,
                withdrawn,
            })
        })?;

        if let Some(old) = &outcome.withdrawn {
            self.record_event(&AuditEvent::TargetWithdrawn {
                target_id: old.id.clone(),
                source_swap_id: old.source_swap_id.clone(),
                target_swap_id: old.target_swap_id.clone(),
            });
        }
        self.record_event(&AuditEvent::TargetingCreated {
            target_id: outcome.target.id.clone(),
            source_swap_id: outcome.target.source_swap_id.clone(),
            target_swap_id: outcome.target.target_swap_id.clone(),
            proposal_id: outcome.proposal.id.clone(),
        });

        Ok(outcome)
    }

    /// Move the source swap's outgoing target to a new swap. Withdrawal of
    /// the old edge and creation of the new one are all-or-nothing.
    pub fn retarget(&self, req: TargetRequest) -> Result<TargetingOutcome, MarketError> {
        self.create_target(TargetRequest {
            intent: TargetingIntent::AllowRetarget,
            ..req
        })
    }

    /// Withdraw an active target. Only the source swap's owner may do this.
    pub fn remove_target(
        &self,
        target_id: &str,
        requester_id: &str,
    ) -> Result<ClosedTarget, MarketError> {
        let target = self.store.target(target_id)?;
        let source = self.store.swap(&target.source_swap_id)?;
        if source.owner_id != requester_id {
            return Err(MarketError::Authorization {
                user_id: requester_id.to_string(),
                action: "withdraw this target",
            });
        }

        let closed = close_target(&self.store, target_id, TargetStatus::Withdrawn, &TimeStamp::now())?;

        self.record_event(&AuditEvent::TargetWithdrawn {
            target_id: closed.target.id.clone(),
            source_swap_id: closed.target.source_swap_id.clone(),
            target_swap_id: closed.target.target_swap_id.clone(),
        });

        Ok(closed)
    }

    /// Derive what the swap can currently do in the targeting graph.
    pub fn capabilities(&self, swap_id: &str) -> Result<TargetingCapabilities, MarketError> {
        let swap = self.store.swap(swap_id)?;
        let now = TimeStamp::now();
        let incoming = self.store.active_incoming_targets(swap_id)?;
        let outgoing = self.store.outgoing_active_target(swap_id)?;

        let mut restrictions = Vec::new();
        if !matches!(swap.status, SwapStatus::Active | SwapStatus::Pending) {
            restrictions.push(TargetingRestriction::SwapUnavailable { status: swap.status });
        } else if swap.expired_by(&now) {
            restrictions.push(TargetingRestriction::SwapUnavailable {
                status: SwapStatus::Expired,
            });
        } else if swap.auction_ended(&now) {
            restrictions.push(TargetingRestriction::AuctionEnded);
        } else if swap.acceptance_strategy == AcceptanceStrategy::OneForOne
            && !incoming.is_empty()
        {
            restrictions.push(TargetingRestriction::AlreadyTargeted);
        }
        let can_receive_targets = restrictions.is_empty();

        // an existing outgoing edge restricts create-only calls but not
        // retargeting, so it does not flip can_target on its own
        let can_target = !swap.is_resolved() && !swap.expired_by(&now);
        if outgoing.is_some() {
            restrictions.push(TargetingRestriction::AlreadyTargeting);
        }

        let max_incoming_targets = match swap.acceptance_strategy {
            AcceptanceStrategy::OneForOne => Some(1),
            AcceptanceStrategy::Auction => None,
        };

        Ok(TargetingCapabilities {
            can_receive_targets,
            can_target,
            restrictions,
            current_incoming_targets: incoming.len(),
            max_incoming_targets,
        })
    }

    /// Incoming targets with their proposals, canonical order (first come,
    /// first shown). Scores are display-only and never reorder the list.
    pub fn incoming_proposals(
        &self,
        swap_id: &str,
    ) -> Result<Vec<(Target, Proposal)>, MarketError> {
        let targets = self.store.incoming_targets(swap_id)?;
        let mut listed = Vec::with_capacity(targets.len());
        for target in targets {
            let proposal = self.store.proposal(&target.proposal_id)?;
            listed.push((target, proposal));
        }
        Ok(listed)
    }

    /// Owner-initiated cancellation of a listed swap. Active incoming targets
    /// expire; an outgoing active target is withdrawn.
    pub fn cancel_swap(&self, swap_id: &str, requester_id: &str) -> Result<Swap, MarketError> {
        let now = TimeStamp::now();
        self.store.tx(|tx| {
            let mut swap: Swap = tx_require(tx, &swap_key(swap_id), "swap", swap_id)?;
            if swap.owner_id != requester_id {
                return tx_abort(MarketError::Authorization {
                    user_id: requester_id.to_string(),
                    action: "cancel this swap",
                });
            }
            if swap.is_resolved() {
                return tx_abort(crate::error::InvalidState::SwapResolved {
                    swap_id: swap.id.clone(),
                    status: swap.status,
                });
            }

            for id in tx_incoming_ids(tx, &swap.id)? {
                if let Some(mut incoming) = tx_get::<Target>(tx, &target_key(&id))? {
                    if incoming.is_active() {
                        incoming.status = TargetStatus::Expired;
                        incoming.updated_at = now.clone();
                        tx_put(tx, &target_key(&incoming.id), &incoming)?;
                        tx_clear_outgoing(tx, &incoming.source_swap_id, &incoming.id)?;
                    }
                }
            }

            if let Some(out_id) = tx_get_id(tx, &outgoing_key(&swap.id))? {
                if let Some(mut outgoing) = tx_get::<Target>(tx, &target_key(&out_id))? {
                    if outgoing.is_active() {
                        outgoing.status = TargetStatus::Withdrawn;
                        outgoing.updated_at = now.clone();
                        tx_put(tx, &target_key(&outgoing.id), &outgoing)?;
                        tx_revert_target_swap(tx, &outgoing.target_swap_id, &outgoing.id)?;
                    }
                }
                tx.remove(outgoing_key(&swap.id).as_str())?;
            }

            swap.status = SwapStatus::Cancelled;
            tx_put(tx, &swap_key(&swap.id), &swap)?;
            Ok(swap)
        })
    }

    fn record_event(&self, event: &AuditEvent) {
        if let Err(err) = self.ledger.record(event) {
            warn!(error = %err, "targeting audit event was not recorded");
        }
    }
}
