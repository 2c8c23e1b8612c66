//! Property-based tests for the targeting state machine.
//!
//! Random sequences of targeting and acceptance operations are applied to a
//! small market of swaps; after every sequence, the structural invariants
//! must hold regardless of which individual operations were rejected.

use std::sync::Arc;

use proptest::prelude::*;

use booking_swap::acceptance::AcceptanceService;
use booking_swap::consistency::{ConsistencyService, NullUserDirectory, validate_swap_consistency};
use booking_swap::gateway::{NullFraudService, NullPaymentGateway};
use booking_swap::ledger::InMemoryLedger;
use booking_swap::proposal::ProposalDraft;
use booking_swap::store::MarketStore;
use booking_swap::swap::{AcceptanceStrategy, Swap, SwapStatus, TimeStamp};
use booking_swap::target::TargetStatus;
use booking_swap::targeting::{TargetRequest, TargetingIntent, TargetingService};
use booking_swap::utils;

const SWAP_COUNT: usize = 4;

/// One randomly chosen market operation between two swaps of the fixture.
#[derive(Debug, Clone, Copy)]
enum Op {
    Create { source: usize, target: usize },
    Retarget { source: usize, target: usize },
    Remove { source: usize },
    Accept { target: usize },
    Reject { target: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let idx = 0usize..SWAP_COUNT;
    prop_oneof![
        (idx.clone(), idx.clone()).prop_map(|(source, target)| Op::Create { source, target }),
        (idx.clone(), idx.clone()).prop_map(|(source, target)| Op::Retarget { source, target }),
        idx.clone().prop_map(|source| Op::Remove { source }),
        idx.clone().prop_map(|target| Op::Accept { target }),
        idx.prop_map(|target| Op::Reject { target }),
    ]
}

struct Market {
    _dir: tempfile::TempDir,
    store: MarketStore,
    swaps: Vec<Swap>,
    targeting: TargetingService,
    acceptance: AcceptanceService,
}

/// Two one-for-one swaps and two auctions, all open for an hour.
fn market() -> Market {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("property.db")).unwrap();
    let store = MarketStore::new(Arc::new(db));
    let ledger = Arc::new(InMemoryLedger::new());

    let mut swaps = Vec::with_capacity(SWAP_COUNT);
    for i in 0..SWAP_COUNT {
        let swap = if i % 2 == 0 {
            Swap::new_one_for_one(utils::user_id(), utils::booking_id())
        } else {
            Swap::new_auction(
                utils::user_id(),
                utils::booking_id(),
                TimeStamp::now().plus_seconds(3_600),
            )
        };
        store.put_swap(&swap).unwrap();
        swaps.push(swap);
    }

    let targeting = TargetingService::new(store.clone(), ledger.clone());
    let acceptance = AcceptanceService::new(
        store.clone(),
        Arc::new(NullPaymentGateway),
        ledger,
        Arc::new(NullFraudService),
    );

    Market {
        _dir: dir,
        store,
        swaps,
        targeting,
        acceptance,
    }
}

fn apply(market: &Market, op: Op) {
    let request = |source: usize, target: usize, intent| TargetRequest {
        source_swap_id: market.swaps[source].id.clone(),
        target_swap_id: market.swaps[target].id.clone(),
        proposer_id: market.swaps[source].owner_id.clone(),
        draft: ProposalDraft::new().set_message("generated offer"),
        intent,
    };

    // individual rejections are expected; panics are not
    match op {
        Op::Create { source, target } => {
            let _ = market
                .targeting
                .create_target(request(source, target, TargetingIntent::CreateOnly));
        }
        Op::Retarget { source, target } => {
            let _ = market
                .targeting
                .retarget(request(source, target, TargetingIntent::AllowRetarget));
        }
        Op::Remove { source } => {
            let swap = &market.swaps[source];
            if let Ok(Some(outgoing)) = market.store.outgoing_active_target(&swap.id) {
                let _ = market.targeting.remove_target(&outgoing.id, &swap.owner_id);
            }
        }
        Op::Accept { target } | Op::Reject { target } => {
            let swap = &market.swaps[target];
            let Ok(active) = market.store.active_incoming_targets(&swap.id) else {
                return;
            };
            let Some(first) = active.first() else {
                return;
            };
            match op {
                Op::Accept { .. } => {
                    let _ = market
                        .acceptance
                        .accept_proposal(&first.proposal_id, &swap.owner_id);
                }
                _ => {
                    let _ = market
                        .acceptance
                        .reject_proposal(&first.proposal_id, &swap.owner_id, None);
                }
            }
        }
    }
}

fn assert_invariants(market: &Market) {
    let projection = ConsistencyService::new(market.store.clone(), Arc::new(NullUserDirectory));

    for swap in &market.swaps {
        let current = market.store.swap(&swap.id).unwrap();
        let active_incoming = market.store.active_incoming_targets(&swap.id).unwrap();

        // exclusivity on the receiving side
        if current.acceptance_strategy == AcceptanceStrategy::OneForOne {
            assert!(active_incoming.len() <= 1, "one_for_one swap with {} active incoming", active_incoming.len());
        }

        // exclusivity on the sending side
        let active_outgoing: Vec<_> = market
            .store
            .targets_from(&swap.id)
            .unwrap()
            .into_iter()
            .filter(|t| t.is_active())
            .collect();
        assert!(active_outgoing.len() <= 1, "swap with {} active outgoing targets", active_outgoing.len());

        // no self edges, ever
        for target in market.store.targets_from(&swap.id).unwrap() {
            assert_ne!(target.source_swap_id, target.target_swap_id);
        }

        // no active 2-cycle
        if let Some(out) = active_outgoing.first() {
            let back = market
                .store
                .active_incoming_targets(&swap.id)
                .unwrap()
                .into_iter()
                .any(|t| t.source_swap_id == out.target_swap_id);
            assert!(!back, "mutual active targeting observed");
        }

        // resolved swaps hold no active edges in either direction
        if current.is_resolved() {
            assert!(active_incoming.is_empty());
            assert!(active_outgoing.is_empty());
        }

        // an accepted swap resolved to exactly one accepted edge
        if matches!(current.status, SwapStatus::Accepted) {
            let accepted_in = market
                .store
                .incoming_targets(&swap.id)
                .unwrap()
                .into_iter()
                .filter(|t| t.status == TargetStatus::Accepted)
                .count();
            let accepted_out = market
                .store
                .targets_from(&swap.id)
                .unwrap()
                .into_iter()
                .filter(|t| t.status == TargetStatus::Accepted)
                .count();
            assert_eq!(accepted_in + accepted_out, 1);
        }

        let view = projection.load_view(&swap.id).unwrap();
        let report = validate_swap_consistency(&view);
        assert!(report.is_consistent, "inconsistent view: {:?}", report.issues);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn invariants_hold_under_random_operation_sequences(
        ops in prop::collection::vec(op_strategy(), 1..16)
    ) {
        let market = market();
        for op in ops {
            apply(&market, op);
        }
        assert_invariants(&market);
    }

    #[test]
    fn pending_swaps_always_hold_an_active_incoming_target(
        ops in prop::collection::vec(op_strategy(), 1..12)
    ) {
        let market = market();
        for op in ops {
            apply(&market, op);
        }
        for swap in &market.swaps {
            let current = market.store.swap(&swap.id).unwrap();
            if current.status == SwapStatus::Pending {
                let active = market.store.active_incoming_targets(&swap.id).unwrap();
                prop_assert!(!active.is_empty());
            }
        }
    }
}
