//! Auction coordination: acceptance windows, owner force-close and the
//! time-driven expiry sweep.
//!
//! The sweep is idempotent. Every swap it touches is re-validated inside its
//! own transaction, so running it twice (or catching up after a missed cycle)
//! expires each auction exactly once.
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{InvalidState, MarketError, ValidationError};
use crate::ledger::{AuditEvent, AuditLedger};
use crate::store::{
    MarketStore, swap_key, target_key, tx_abort, tx_clear_outgoing, tx_get, tx_get_id,
    tx_incoming_ids, tx_put, tx_require, tx_revert_target_swap, outgoing_key,
};
use crate::swap::{AcceptanceStrategy, Swap, SwapStatus, TimeStamp};
use crate::target::{Target, TargetStatus};

/// What happens to an auction swap when its deadline passes unaccepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    /// The swap reverts to `Active` and may be re-listed with a new deadline.
    Relist,
    /// The swap is cancelled outright.
    AutoCancel,
}

/// Point-in-time view of an auction-mode swap.
#[derive(Debug, Clone)]
pub struct AuctionStatus {
    pub proposal_count: usize,
    pub auction_end_at: Option<TimeStamp<Utc>>,
    pub accepting: bool,
}

/// Counts produced by one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub auctions_expired: usize,
    pub swaps_expired: usize,
    pub targets_expired: usize,
}

#[derive(Clone)]
pub struct AuctionCoordinator {
    store: MarketStore,
    ledger: Arc<dyn AuditLedger>,
    policy: ExpiryPolicy,
}

impl AuctionCoordinator {
    pub fn new(store: MarketStore, ledger: Arc<dyn AuditLedger>, policy: ExpiryPolicy) -> Self {
        Self {
            store,
            ledger,
            policy,
        }
    }

    pub fn auction_status(&self, swap_id: &str) -> Result<AuctionStatus, MarketError> {
        let swap = self.store.swap(swap_id)?;
        if swap.acceptance_strategy != AcceptanceStrategy::Auction {
            return Err(ValidationError::NotAnAuction.into());
        }
        let active = self.store.active_incoming_targets(swap_id)?;
        Ok(AuctionStatus {
            proposal_count: active.len(),
            auction_end_at: swap.auction_end_at.clone(),
            accepting: swap.auction_accepting(&TimeStamp::now()),
        })
    }

    /// Whether a proposal on this swap may be accepted right now. One-for-one
    /// swaps always may; auctions only before the deadline or after an
    /// explicit force-close.
    pub fn can_accept_now(&self, swap_id: &str) -> Result<bool, MarketError> {
        let swap = self.store.swap(swap_id)?;
        Ok(swap.auction_accepting(&TimeStamp::now()))
    }

    /// Owner ends the auction early. No new targets afterwards, but the owner
    /// may still accept one of the proposals already in, even past the
    /// original deadline. Never automatic.
    pub fn force_close(&self, swap_id: &str, acting_user_id: &str) -> Result<Swap, MarketError> {
        let now = TimeStamp::now();
        self.store.tx(|tx| {
            let mut swap: Swap = tx_require(tx, &swap_key(swap_id), "swap", swap_id)?;
            if swap.owner_id != acting_user_id {
                return tx_abort(MarketError::Authorization {
                    user_id: acting_user_id.to_string(),
                    action: "close this auction",
                });
            }
            if swap.acceptance_strategy != AcceptanceStrategy::Auction {
                return tx_abort(ValidationError::NotAnAuction);
            }
            if swap.is_resolved() {
                return tx_abort(InvalidState::SwapResolved {
                    swap_id: swap.id.clone(),
                    status: swap.status,
                });
            }
            if swap.auction_closed_at.is_none() {
                swap.auction_closed_at = Some(now.clone());
            }
            tx_put(tx, &swap_key(&swap.id), &swap)?;
            Ok(swap)
        })
    }

    /// One expiry pass at instant `now`.
    ///
    /// Expires auctions whose deadline passed without an acceptance and swaps
    /// whose own `expires_at` passed. Each swap is handled in its own
    /// transaction against a fresh read, so a concurrent acceptance beats the
    /// sweep cleanly and a repeated pass finds nothing left to do.
    pub fn sweep(&self, now: &TimeStamp<Utc>) -> Result<SweepReport, MarketError> {
        let mut report = SweepReport::default();

        for snapshot in self.store.all_swaps()? {
            if let Some(expired) = self.sweep_swap(&snapshot.id, now)? {
                report.targets_expired += expired.targets;
                if expired.auction {
                    report.auctions_expired += 1;
                    self.record_event(&AuditEvent::AuctionExpired {
                        swap_id: snapshot.id.clone(),
                        expired_targets: expired.targets as u32,
                    });
                } else {
                    report.swaps_expired += 1;
                }
            }
        }

        if report != SweepReport::default() {
            info!(
                auctions = report.auctions_expired,
                swaps = report.swaps_expired,
                targets = report.targets_expired,
                "expiry sweep pass"
            );
        }
        Ok(report)
    }

    fn sweep_swap(
        &self,
        swap_id: &str,
        now: &TimeStamp<Utc>,
    ) -> Result<Option<SweptSwap>, MarketError> {
        let policy = self.policy;
        self.store.tx(|tx| {
            // fresh read: the snapshot that nominated this swap may be stale
            let Some(mut swap) = tx_get::<Swap>(tx, &swap_key(swap_id))? else {
                return Ok(None);
            };
            if swap.is_resolved() {
                return Ok(None);
            }

            let auction_lapsed = swap.acceptance_strategy == AcceptanceStrategy::Auction
                && swap.auction_closed_at.is_none()
                && swap.auction_end_at.as_ref().is_some_and(|at| at <= now)
                && matches!(swap.status, SwapStatus::Active | SwapStatus::Pending);
            let swap_lapsed = swap.expired_by(now)
                && matches!(
                    swap.status,
                    SwapStatus::Draft | SwapStatus::Active | SwapStatus::Pending
                );
            if !auction_lapsed && !swap_lapsed {
                return Ok(None);
            }

            let mut targets = 0usize;
            for id in tx_incoming_ids(tx, &swap.id)? {
                if let Some(mut incoming) = tx_get::<Target>(tx, &target_key(&id))? {
                    if incoming.is_active() {
                        incoming.status = TargetStatus::Expired;
                        incoming.updated_at = now.clone();
                        tx_put(tx, &target_key(&incoming.id), &incoming)?;
                        tx_clear_outgoing(tx, &incoming.source_swap_id, &incoming.id)?;
                        targets += 1;
                    }
                }
            }

            if swap_lapsed {
                // the swap itself lapsed; its own outgoing target dies with it
                if let Some(out_id) = tx_get_id(tx, &outgoing_key(&swap.id))? {
                    if let Some(mut outgoing) = tx_get::<Target>(tx, &target_key(&out_id))? {
                        if outgoing.is_active() {
                            outgoing.status = TargetStatus::Expired;
                            outgoing.updated_at = now.clone();
                            tx_put(tx, &target_key(&outgoing.id), &outgoing)?;
                            tx_revert_target_swap(tx, &outgoing.target_swap_id, &outgoing.id)?;
                            targets += 1;
                        }
                    }
                    tx.remove(outgoing_key(&swap.id).as_str())?;
                }
                swap.status = SwapStatus::Expired;
            } else {
                swap.status = match policy {
                    ExpiryPolicy::Relist => SwapStatus::Active,
                    ExpiryPolicy::AutoCancel => SwapStatus::Cancelled,
                };
                // deadline consumed; a relist must set a new one
                swap.auction_end_at = None;
            }
            tx_put(tx, &swap_key(&swap.id), &swap)?;

            Ok(Some(SweptSwap {
                auction: auction_lapsed && !swap_lapsed,
                targets,
            }))
        })
    }

    fn record_event(&self, event: &AuditEvent) {
        if let Err(err) = self.ledger.record(event) {
            warn!(error = %err, "sweep audit event was not recorded");
        }
    }
}

struct SweptSwap {
    auction: bool,
    targets: usize,
}
