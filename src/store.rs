//! Persistence for swaps, targets and proposals over a single sled keyspace.
//!
//! Keys are namespaced by entity (`swap/`, `target/`, `proposal/`). Two index
//! keys keep targeting queries cheap and, more importantly, give every
//! compound transition a shared row to serialize on:
//!
//! - `in/<swap_id>`  — ids of every target ever pointed at the swap
//! - `out/<swap_id>` — id of the swap's currently-active outgoing target
//!
//! All multi-row transitions run inside one sled transaction; business-rule
//! violations abort it, so a lost race surfaces as a typed error and never a
//! partial write. Nothing outside this module writes entity rows directly.
use std::sync::Arc;

use chrono::Utc;
use sled::IVec;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};

use crate::error::{InvalidState, MarketError};
use crate::proposal::Proposal;
use crate::swap::{Swap, SwapStatus, TimeStamp};
use crate::target::{Target, TargetStatus};

pub(crate) type TxResult<T> = Result<T, ConflictableTransactionError<MarketError>>;

pub(crate) fn swap_key(id: &str) -> String {
    format!("swap/{id}")
}
pub(crate) fn target_key(id: &str) -> String {
    format!("target/{id}")
}
pub(crate) fn proposal_key(id: &str) -> String {
    format!("proposal/{id}")
}
pub(crate) fn incoming_key(swap_id: &str) -> String {
    format!("in/{swap_id}")
}
pub(crate) fn outgoing_key(swap_id: &str) -> String {
    format!("out/{swap_id}")
}

pub(crate) fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, MarketError> {
    minicbor::to_vec(value).map_err(|e| MarketError::Codec(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, MarketError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    minicbor::decode(bytes).map_err(|e| MarketError::Codec(e.to_string()))
}

fn id_from_bytes(bytes: &IVec) -> Result<String, MarketError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| MarketError::Codec(e.to_string()))
}

/// Abort the surrounding transaction with a typed business error.
pub(crate) fn tx_abort<T>(err: impl Into<MarketError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err.into()))
}

pub(crate) fn tx_get<T>(tx: &TransactionalTree, key: &str) -> TxResult<Option<T>>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tx.get(key)? {
        Some(bytes) => match decode(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(ConflictableTransactionError::Abort(err)),
        },
        None => Ok(None),
    }
}

pub(crate) fn tx_require<T>(
    tx: &TransactionalTree,
    key: &str,
    kind: &'static str,
    id: &str,
) -> TxResult<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tx_get(tx, key)? {
        Some(value) => Ok(value),
        None => tx_abort(MarketError::NotFound {
            kind,
            id: id.to_string(),
        }),
    }
}

pub(crate) fn tx_put<T: minicbor::Encode<()>>(
    tx: &TransactionalTree,
    key: &str,
    value: &T,
) -> TxResult<()> {
    let bytes = encode(value).map_err(ConflictableTransactionError::Abort)?;
    tx.insert(key, bytes)?;
    Ok(())
}

/// Read an index pointer (`out/...`) as a plain id string.
pub(crate) fn tx_get_id(tx: &TransactionalTree, key: &str) -> TxResult<Option<String>> {
    match tx.get(key)? {
        Some(bytes) => match id_from_bytes(&bytes) {
            Ok(id) => Ok(Some(id)),
            Err(err) => Err(ConflictableTransactionError::Abort(err)),
        },
        None => Ok(None),
    }
}

pub(crate) fn tx_incoming_ids(tx: &TransactionalTree, swap_id: &str) -> TxResult<Vec<String>> {
    match tx_get::<Vec<String>>(tx, &incoming_key(swap_id))? {
        Some(ids) => Ok(ids),
        None => Ok(Vec::new()),
    }
}

pub(crate) fn tx_push_incoming(
    tx: &TransactionalTree,
    swap_id: &str,
    target_id: &str,
) -> TxResult<()> {
    let mut ids = tx_incoming_ids(tx, swap_id)?;
    if !ids.iter().any(|id| id == target_id) {
        ids.push(target_id.to_string());
    }
    tx_put(tx, &incoming_key(swap_id), &ids)
}

pub(crate) fn tx_active_incoming_count(
    tx: &TransactionalTree,
    swap_id: &str,
    exclude: Option<&str>,
) -> TxResult<usize> {
    let mut count = 0;
    for id in tx_incoming_ids(tx, swap_id)? {
        if exclude == Some(id.as_str()) {
            continue;
        }
        if let Some(target) = tx_get::<Target>(tx, &target_key(&id))? {
            if target.is_active() {
                count += 1;
            }
        }
    }
    Ok(count)
}

/// Drop the `out/` pointer of `source_swap_id` when it still points at
/// `target_id`. A retarget may already have repointed it.
pub(crate) fn tx_clear_outgoing(
    tx: &TransactionalTree,
    source_swap_id: &str,
    target_id: &str,
) -> TxResult<()> {
    let key = outgoing_key(source_swap_id);
    if let Some(bytes) = tx.get(&key)? {
        if bytes.as_ref() == target_id.as_bytes() {
            tx.remove(key.as_str())?;
        }
    }
    Ok(())
}

/// Pending reverts to Active once the swap loses its last active incoming
/// target. The row is rewritten even when unchanged so concurrent transitions
/// on the same swap serialize on it.
pub(crate) fn tx_revert_target_swap(
    tx: &TransactionalTree,
    swap_id: &str,
    excluding: &str,
) -> TxResult<Swap> {
    let mut swap: Swap = tx_require(tx, &swap_key(swap_id), "swap", swap_id)?;
    if swap.status == SwapStatus::Pending
        && tx_active_incoming_count(tx, swap_id, Some(excluding))? == 0
    {
        swap.status = SwapStatus::Active;
    }
    tx_put(tx, &swap_key(swap_id), &swap)?;
    Ok(swap)
}

/// Result of taking one active target to a terminal status.
#[derive(Debug, Clone)]
pub struct ClosedTarget {
    pub target: Target,
    pub target_swap: Swap,
}

/// Shared terminal transition (withdraw, reject, expire) for a single target:
/// compare-and-set from Active, clear the outgoing pointer, revert the target
/// swap when it was the sole active incoming edge.
pub(crate) fn close_target(
    store: &MarketStore,
    target_id: &str,
    to: TargetStatus,
    now: &TimeStamp<Utc>,
) -> Result<ClosedTarget, MarketError> {
    debug_assert!(to.is_terminal());
    store.tx(|tx| {
        let mut target: Target = tx_require(tx, &target_key(target_id), "target", target_id)?;
        if !target.is_active() {
            let err = if target.status == TargetStatus::Accepted {
                MarketError::from(InvalidState::AlreadyAccepted)
            } else {
                MarketError::from(InvalidState::TargetNotActive {
                    target_id: target.id.clone(),
                    status: target.status,
                })
            };
            return Err(ConflictableTransactionError::Abort(err));
        }

        target.status = to;
        target.updated_at = now.clone();
        tx_put(tx, &target_key(&target.id), &target)?;
        tx_clear_outgoing(tx, &target.source_swap_id, &target.id)?;
        let target_swap = tx_revert_target_swap(tx, &target.target_swap_id, &target.id)?;

        Ok(ClosedTarget {
            target,
            target_swap,
        })
    })
}

/// Handle over the market keyspace. Cheap to clone; all mutation flows
/// through the targeting state machine and the acceptance pipeline.
#[derive(Clone)]
pub struct MarketStore {
    db: Arc<sled::Db>,
}

impl MarketStore {
    pub fn new(db: Arc<sled::Db>) -> Self {
        Self { db }
    }

    pub(crate) fn tx<T, F>(&self, f: F) -> Result<T, MarketError>
    where
        F: Fn(&TransactionalTree) -> TxResult<T>,
    {
        self.db.transaction(f).map_err(|e| match e {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => MarketError::Storage(err),
        })
    }

    fn get_entity<T>(&self, key: &str) -> Result<Option<T>, MarketError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.db.get(key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn try_swap(&self, id: &str) -> Result<Option<Swap>, MarketError> {
        self.get_entity(&swap_key(id))
    }

    pub fn swap(&self, id: &str) -> Result<Swap, MarketError> {
        self.try_swap(id)?.ok_or_else(|| MarketError::NotFound {
            kind: "swap",
            id: id.to_string(),
        })
    }

    pub fn try_target(&self, id: &str) -> Result<Option<Target>, MarketError> {
        self.get_entity(&target_key(id))
    }

    pub fn target(&self, id: &str) -> Result<Target, MarketError> {
        self.try_target(id)?.ok_or_else(|| MarketError::NotFound {
            kind: "target",
            id: id.to_string(),
        })
    }

    pub fn try_proposal(&self, id: &str) -> Result<Option<Proposal>, MarketError> {
        self.get_entity(&proposal_key(id))
    }

    pub fn proposal(&self, id: &str) -> Result<Proposal, MarketError> {
        self.try_proposal(id)?.ok_or_else(|| MarketError::NotFound {
            kind: "proposal",
            id: id.to_string(),
        })
    }

    /// List a swap. Overwrites any previous row with the same id.
    pub fn put_swap(&self, swap: &Swap) -> Result<(), MarketError> {
        let bytes = encode(swap)?;
        self.db.insert(swap_key(&swap.id), bytes)?;
        Ok(())
    }

    pub(crate) fn put_proposal(&self, proposal: &Proposal) -> Result<(), MarketError> {
        let bytes = encode(proposal)?;
        self.db.insert(proposal_key(&proposal.id), bytes)?;
        Ok(())
    }

    /// Ids of every target that has ever pointed at the swap, any status.
    pub fn incoming_target_ids(&self, swap_id: &str) -> Result<Vec<String>, MarketError> {
        Ok(self
            .get_entity::<Vec<String>>(&incoming_key(swap_id))?
            .unwrap_or_default())
    }

    /// Incoming targets in canonical listing order: `created_at` ascending,
    /// id as tiebreak. Compatibility score never affects ordering.
    pub fn incoming_targets(&self, swap_id: &str) -> Result<Vec<Target>, MarketError> {
        let ids = self.incoming_target_ids(swap_id)?;
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(target) = self.try_target(&id)? {
                targets.push(target);
            }
        }
        targets.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(targets)
    }

    pub fn active_incoming_targets(&self, swap_id: &str) -> Result<Vec<Target>, MarketError> {
        let mut targets = self.incoming_targets(swap_id)?;
        targets.retain(Target::is_active);
        Ok(targets)
    }

    pub fn accepted_target(&self, swap_id: &str) -> Result<Option<Target>, MarketError> {
        Ok(self
            .incoming_targets(swap_id)?
            .into_iter()
            .find(|t| t.status == TargetStatus::Accepted))
    }

    pub fn outgoing_active_target(&self, swap_id: &str) -> Result<Option<Target>, MarketError> {
        match self.db.get(outgoing_key(swap_id))? {
            Some(bytes) => {
                let id = id_from_bytes(&bytes)?;
                self.try_target(&id)
            }
            None => Ok(None),
        }
    }

    /// Every target the swap has created, any status, `created_at` ascending.
    pub fn targets_from(&self, swap_id: &str) -> Result<Vec<Target>, MarketError> {
        let mut targets = Vec::new();
        for item in self.db.scan_prefix("target/") {
            let (_key, bytes) = item?;
            let target: Target = decode(&bytes)?;
            if target.source_swap_id == swap_id {
                targets.push(target);
            }
        }
        targets.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(targets)
    }

    pub(crate) fn all_swaps(&self) -> Result<Vec<Swap>, MarketError> {
        let mut swaps = Vec::new();
        for item in self.db.scan_prefix("swap/") {
            let (_key, bytes) = item?;
            swaps.push(decode(&bytes)?);
        }
        Ok(swaps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils;
    use std::sync::Arc;

    fn open_store() -> (tempfile::TempDir, MarketStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("store_tests.db")).unwrap();
        (dir, MarketStore::new(Arc::new(db)))
    }

    #[test]
    fn swap_round_trips_through_store() {
        let (_dir, store) = open_store();
        let swap = Swap::new_one_for_one(utils::user_id(), utils::booking_id());

        store.put_swap(&swap).unwrap();
        assert_eq!(store.swap(&swap.id).unwrap(), swap);
    }

    #[test]
    fn missing_swap_is_not_found() {
        let (_dir, store) = open_store();
        let err = store.swap("swap_missing").unwrap_err();
        assert!(matches!(err, MarketError::NotFound { kind: "swap", .. }));
    }

    #[test]
    fn incoming_targets_sorted_by_creation() {
        let (_dir, store) = open_store();
        let swap_id = utils::swap_id();

        let old = Target::new(
            utils::swap_id(),
            swap_id.clone(),
            utils::proposal_id(),
            TimeStamp::new_with(2026, 1, 1, 0, 0, 0),
        );
        let new = Target::new(
            utils::swap_id(),
            swap_id.clone(),
            utils::proposal_id(),
            TimeStamp::new_with(2026, 1, 2, 0, 0, 0),
        );

        // insert newest first to prove ordering comes from created_at
        store
            .tx(|tx| {
                tx_put(tx, &target_key(&new.id), &new)?;
                tx_push_incoming(tx, &swap_id, &new.id)?;
                tx_put(tx, &target_key(&old.id), &old)?;
                tx_push_incoming(tx, &swap_id, &old.id)?;
                Ok(())
            })
            .unwrap();

        let listed = store.incoming_targets(&swap_id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, old.id);
        assert_eq!(listed[1].id, new.id);
    }

    #[test]
    fn close_target_is_single_shot() {
        let (_dir, store) = open_store();
        let mut target_swap = Swap::new_one_for_one(utils::user_id(), utils::booking_id());
        target_swap.status = SwapStatus::Pending;
        store.put_swap(&target_swap).unwrap();

        let target = Target::new(
            utils::swap_id(),
            target_swap.id.clone(),
            utils::proposal_id(),
            TimeStamp::now(),
        );
        store
            .tx(|tx| {
                tx_put(tx, &target_key(&target.id), &target)?;
                tx_push_incoming(tx, &target.target_swap_id, &target.id)?;
                tx.insert(outgoing_key(&target.source_swap_id).as_str(), target.id.as_bytes())?;
                Ok(())
            })
            .unwrap();

        let closed = close_target(&store, &target.id, TargetStatus::Withdrawn, &TimeStamp::now())
            .unwrap();
        assert_eq!(closed.target.status, TargetStatus::Withdrawn);
        // sole incoming target gone, swap re-opens
        assert_eq!(closed.target_swap.status, SwapStatus::Active);
        assert!(
            store
                .outgoing_active_target(&target.source_swap_id)
                .unwrap()
                .is_none()
        );

        let err =
            close_target(&store, &target.id, TargetStatus::Rejected, &TimeStamp::now()).unwrap_err();
        assert!(matches!(
            err,
            MarketError::InvalidState(InvalidState::TargetNotActive { .. })
        ));
    }
}
