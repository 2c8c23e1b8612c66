//! Acceptance pipeline: accept, reject or withdraw a proposal, and confirm
//! completion of an accepted swap.
//!
//! Ordering is the heart of this module. Money moves first, against the
//! payment gateway, and only then does the domain transition commit in one
//! storage transaction. A payment failure therefore leaves the domain
//! untouched, and a domain failure after capture triggers a compensating
//! refund. The audit ledger comes last, after commit, with bounded retries;
//! a ledger failure downgrades to `audit_pending`, never to a rollback.
use std::sync::Arc;

use tracing::warn;

use crate::error::{InvalidState, MarketError, TargetingRestriction};
use crate::gateway::{
    FraudDetectionService, PaymentGateway, PaymentTransaction, RetryPolicy, RiskAssessment,
    with_retry,
};
use crate::ledger::{AuditEvent, AuditLedger, LedgerReceipt};
use crate::proposal::Proposal;
use crate::store::{
    MarketStore, close_target, outgoing_key, proposal_key, swap_key, target_key, tx_abort,
    tx_clear_outgoing, tx_get, tx_get_id, tx_incoming_ids, tx_put, tx_require,
    tx_revert_target_swap,
};
use crate::swap::{Swap, SwapStatus, TimeStamp};
use crate::target::{Target, TargetStatus};

/// Everything that happened during a successful acceptance.
#[derive(Debug, Clone)]
pub struct AcceptanceResult {
    pub proposal: Proposal,
    pub target: Target,
    pub source_swap: Swap,
    pub target_swap: Swap,
    /// Competing active targets on either swap, rejected in the same
    /// transaction.
    pub rejected_siblings: Vec<Target>,
    pub payment: Option<PaymentTransaction>,
    pub ledger_receipt: Option<LedgerReceipt>,
    /// True when the acceptance committed but the audit event did not stick.
    pub audit_pending: bool,
    pub risk: Option<RiskAssessment>,
}

#[derive(Debug, Clone)]
pub struct RejectionResult {
    pub proposal: Proposal,
    pub target: Target,
    pub target_swap: Swap,
    /// Owner-supplied reason on rejection; absent on withdrawal.
    pub reason: Option<String>,
    pub refund: Option<PaymentTransaction>,
    /// True when an escrowed offer existed but the refund did not go through.
    pub refund_pending: bool,
}

#[derive(Clone)]
pub struct AcceptanceService {
    store: MarketStore,
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn AuditLedger>,
    fraud: Arc<dyn FraudDetectionService>,
    ledger_retry: RetryPolicy,
}

impl AcceptanceService {
    pub fn new(
        store: MarketStore,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn AuditLedger>,
        fraud: Arc<dyn FraudDetectionService>,
    ) -> Self {
        Self {
            store,
            gateway,
            ledger,
            fraud,
            ledger_retry: RetryPolicy::default(),
        }
    }

    pub fn with_ledger_retry(mut self, policy: RetryPolicy) -> Self {
        self.ledger_retry = policy;
        self
    }

    /// Accept a proposal on a swap the acting user owns.
    ///
    /// Exactly one of two concurrent accepts on the same swap succeeds; the
    /// loser observes `AlreadyAccepted`. When the proposal carries a cash
    /// offer, funds are captured (or released from escrow) before the domain
    /// transition, so an accepted proposal is always a paid one.
    pub fn accept_proposal(
        &self,
        proposal_id: &str,
        acting_user_id: &str,
    ) -> Result<AcceptanceResult, MarketError> {
        let proposal = self.store.proposal(proposal_id)?;
        if proposal.target_owner_id != acting_user_id {
            return Err(MarketError::Authorization {
                user_id: acting_user_id.to_string(),
                action: "accept proposals on this swap",
            });
        }

        let now = TimeStamp::now();

        // friendly pre-checks so an obviously doomed accept never reaches the
        // gateway; the commit below re-validates under the transaction
        let target = self.store.target(&proposal.target_id)?;
        if target.status == TargetStatus::Accepted {
            return Err(InvalidState::AlreadyAccepted.into());
        }
        if !target.is_active() {
            return Err(InvalidState::TargetNotActive {
                target_id: target.id,
                status: target.status,
            }
            .into());
        }
        let target_swap = self.store.swap(&proposal.target_swap_id)?;
        match target_swap.status {
            SwapStatus::Accepted | SwapStatus::Completed => {
                return Err(InvalidState::AlreadyAccepted.into());
            }
            status if status.is_resolved() => {
                return Err(InvalidState::SwapResolved {
                    swap_id: target_swap.id,
                    status,
                }
                .into());
            }
            _ => {}
        }
        if !target_swap.auction_accepting(&now) {
            return Err(TargetingRestriction::AuctionEnded.into());
        }

        // money first
        let mut risk = None;
        let mut payment = None;
        if let Some(offer) = &proposal.cash_offer {
            risk = Some(self.fraud.assess(&proposal, offer));
            let moved = match &offer.escrow_id {
                Some(escrow_id) => self.gateway.release(escrow_id, &proposal.target_owner_id),
                None => self
                    .gateway
                    .authorize(offer.amount, offer.currency, &proposal.proposer_id)
                    .and_then(|token| self.gateway.capture(token)),
            };
            payment = Some(moved.map_err(MarketError::PaymentFailed)?);
        }

        let committed = self.store.tx(|tx| {
            let mut target: Target =
                tx_require(tx, &target_key(&proposal.target_id), "target", &proposal.target_id)?;
            if !target.is_active() {
                let err = if target.status == TargetStatus::Accepted {
                    MarketError::from(InvalidState::AlreadyAccepted)
                } else {
                    MarketError::from(InvalidState::TargetNotActive {
                        target_id: target.id.clone(),
                        status: target.status,
                    })
                };
                return tx_abort(err);
            }

            let mut source_swap: Swap = tx_require(
                tx,
                &swap_key(&target.source_swap_id),
                "swap",
                &target.source_swap_id,
            )?;
            let mut target_swap: Swap = tx_require(
                tx,
                &swap_key(&target.target_swap_id),
                "swap",
                &target.target_swap_id,
            )?;
            if target_swap.is_resolved() {
                let err = match target_swap.status {
                    SwapStatus::Accepted | SwapStatus::Completed => {
                        MarketError::from(InvalidState::AlreadyAccepted)
                    }
                    status => MarketError::from(InvalidState::SwapResolved {
                        swap_id: target_swap.id.clone(),
                        status,
                    }),
                };
                return tx_abort(err);
            }
            if source_swap.is_resolved() {
                return tx_abort(InvalidState::SwapResolved {
                    swap_id: source_swap.id.clone(),
                    status: source_swap.status,
                });
            }
            if !target_swap.auction_accepting(&now) {
                return tx_abort(TargetingRestriction::AuctionEnded);
            }

            target.status = TargetStatus::Accepted;
            target.updated_at = now.clone();
            tx_put(tx, &target_key(&target.id), &target)?;
            tx_clear_outgoing(tx, &target.source_swap_id, &target.id)?;

            source_swap.status = SwapStatus::Accepted;
            target_swap.status = SwapStatus::Accepted;
            tx_put(tx, &swap_key(&source_swap.id), &source_swap)?;
            tx_put(tx, &swap_key(&target_swap.id), &target_swap)?;

            // cascade: every competing active target on either swap loses in
            // the same commit; both swaps are off the market now
            let mut rejected = Vec::new();
            for swap_id in [&target_swap.id, &source_swap.id] {
                for id in tx_incoming_ids(tx, swap_id)? {
                    if id == target.id {
                        continue;
                    }
                    if let Some(mut sibling) = tx_get::<Target>(tx, &target_key(&id))? {
                        if sibling.is_active() {
                            sibling.status = TargetStatus::Rejected;
                            sibling.updated_at = now.clone();
                            tx_put(tx, &target_key(&sibling.id), &sibling)?;
                            tx_clear_outgoing(tx, &sibling.source_swap_id, &sibling.id)?;
                            rejected.push(sibling);
                        }
                    }
                }
            }

            // the target swap's own outgoing targeting attempt, if any, dies
            // with the acceptance
            if let Some(out_id) = tx_get_id(tx, &outgoing_key(&target_swap.id))? {
                if let Some(mut outgoing) = tx_get::<Target>(tx, &target_key(&out_id))? {
                    if outgoing.is_active() {
                        outgoing.status = TargetStatus::Withdrawn;
                        outgoing.updated_at = now.clone();
                        tx_put(tx, &target_key(&outgoing.id), &outgoing)?;
                        tx_revert_target_swap(tx, &outgoing.target_swap_id, &outgoing.id)?;
                    }
                }
                tx.remove(outgoing_key(&target_swap.id).as_str())?;
            }

            let mut proposal = proposal.clone();
            proposal.accepted_at = Some(now.clone());
            proposal.updated_at = now.clone();
            tx_put(tx, &proposal_key(&proposal.id), &proposal)?;

            Ok((proposal, target, source_swap, target_swap, rejected))
        });

        let (mut proposal, target, source_swap, target_swap, rejected_siblings) = match committed {
            Ok(committed) => committed,
            Err(err) => {
                // lost the race after capturing funds: compensate
                if let Some(paid) = &payment {
                    if let Err(refund_err) = self.gateway.refund(&paid.id) {
                        warn!(
                            payment_id = %paid.id,
                            error = %refund_err,
                            "compensating refund failed after aborted acceptance"
                        );
                    }
                }
                return Err(err);
            }
        };

        let event = AuditEvent::ProposalAccepted {
            proposal_id: proposal.id.clone(),
            source_swap_id: source_swap.id.clone(),
            target_swap_id: target_swap.id.clone(),
            amount: proposal.cash_offer.as_ref().map(|offer| offer.amount),
        };
        let (ledger_receipt, audit_pending) =
            match with_retry(&self.ledger_retry, || self.ledger.record(&event)) {
                Ok(receipt) => {
                    proposal.ledger_transaction_id = Some(receipt.transaction_id.clone());
                    if let Err(err) = self.store.put_proposal(&proposal) {
                        warn!(proposal_id = %proposal.id, error = %err,
                            "could not persist ledger reference on proposal");
                    }
                    (Some(receipt), false)
                }
                Err(err) => {
                    warn!(proposal_id = %proposal.id, error = %err,
                        "acceptance committed but audit event was not recorded");
                    (None, true)
                }
            };

        Ok(AcceptanceResult {
            proposal,
            target,
            source_swap,
            target_swap,
            rejected_siblings,
            payment,
            ledger_receipt,
            audit_pending,
            risk,
        })
    }

    /// Reject a proposal on a swap the acting user owns. An escrowed cash
    /// offer is refunded to the proposer, best-effort.
    pub fn reject_proposal(
        &self,
        proposal_id: &str,
        acting_user_id: &str,
        reason: Option<String>,
    ) -> Result<RejectionResult, MarketError> {
        let proposal = self.store.proposal(proposal_id)?;
        if proposal.target_owner_id != acting_user_id {
            return Err(MarketError::Authorization {
                user_id: acting_user_id.to_string(),
                action: "reject proposals on this swap",
            });
        }

        let closed = close_target(
            &self.store,
            &proposal.target_id,
            TargetStatus::Rejected,
            &TimeStamp::now(),
        )?;
        let (refund, refund_pending) = self.refund_escrow(&proposal);

        self.record_event(&AuditEvent::ProposalRejected {
            proposal_id: proposal.id.clone(),
            target_swap_id: proposal.target_swap_id.clone(),
        });

        Ok(RejectionResult {
            proposal,
            target: closed.target,
            target_swap: closed.target_swap,
            reason,
            refund,
            refund_pending,
        })
    }

    /// Withdraw one's own proposal. The proposer gets any escrowed funds back.
    pub fn withdraw_proposal(
        &self,
        proposal_id: &str,
        acting_user_id: &str,
    ) -> Result<RejectionResult, MarketError> {
        let proposal = self.store.proposal(proposal_id)?;
        if proposal.proposer_id != acting_user_id {
            return Err(MarketError::Authorization {
                user_id: acting_user_id.to_string(),
                action: "withdraw this proposal",
            });
        }

        let closed = close_target(
            &self.store,
            &proposal.target_id,
            TargetStatus::Withdrawn,
            &TimeStamp::now(),
        )?;
        let (refund, refund_pending) = self.refund_escrow(&proposal);

        self.record_event(&AuditEvent::TargetWithdrawn {
            target_id: closed.target.id.clone(),
            source_swap_id: closed.target.source_swap_id.clone(),
            target_swap_id: closed.target.target_swap_id.clone(),
        });

        Ok(RejectionResult {
            proposal,
            target: closed.target,
            target_swap: closed.target_swap,
            reason: None,
            refund,
            refund_pending,
        })
    }

    /// Owner confirmation that the accepted exchange actually took place.
    pub fn complete_swap(&self, swap_id: &str, acting_user_id: &str) -> Result<Swap, MarketError> {
        self.store.tx(|tx| {
            let mut swap: Swap = tx_require(tx, &swap_key(swap_id), "swap", swap_id)?;
            if swap.owner_id != acting_user_id {
                return tx_abort(MarketError::Authorization {
                    user_id: acting_user_id.to_string(),
                    action: "complete this swap",
                });
            }
            if swap.status != SwapStatus::Accepted {
                return tx_abort(InvalidState::SwapNotAccepted {
                    swap_id: swap.id.clone(),
                    status: swap.status,
                });
            }
            swap.status = SwapStatus::Completed;
            tx_put(tx, &swap_key(&swap.id), &swap)?;
            Ok(swap)
        })
    }

    fn refund_escrow(&self, proposal: &Proposal) -> (Option<PaymentTransaction>, bool) {
        let Some(escrow_id) = proposal
            .cash_offer
            .as_ref()
            .and_then(|offer| offer.escrow_id.as_deref())
        else {
            return (None, false);
        };
        match self.gateway.refund(escrow_id) {
            Ok(refund) => (Some(refund), false),
            Err(err) => {
                warn!(
                    proposal_id = %proposal.id,
                    escrow_id,
                    error = %err,
                    "escrow refund did not go through"
                );
                (None, true)
            }
        }
    }

    fn record_event(&self, event: &AuditEvent) {
        if let Err(err) = self.ledger.record(event) {
            warn!(error = %err, "acceptance audit event was not recorded");
        }
    }
}
