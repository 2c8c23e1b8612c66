//! Append-only audit ledger capability.
//!
//! The ledger is best-effort from the core's view: a failed append never
//! rolls back a domain transition that has already committed. Events are
//! minicbor-encoded and content-addressed by sha256, so the same event always
//! yields the same ledger key.
use std::sync::Mutex;

use chrono::Utc;

use crate::swap::TimeStamp;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("audit ledger is disabled")]
    Disabled,
    #[error("audit ledger unavailable")]
    Unavailable,
    #[error("audit ledger timed out")]
    Timeout,
    #[error("audit ledger rejected the event: {0}")]
    Rejected(String),
    #[error("failed to encode audit event: {0}")]
    Encoding(String),
}

/// Domain events recorded for audit. Payload fields are ids and amounts only;
/// proposal text never leaves the domain store.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    #[n(0)]
    TargetingCreated {
        #[n(0)]
        target_id: String,
        #[n(1)]
        source_swap_id: String,
        #[n(2)]
        target_swap_id: String,
        #[n(3)]
        proposal_id: String,
    },
    #[n(1)]
    TargetWithdrawn {
        #[n(0)]
        target_id: String,
        #[n(1)]
        source_swap_id: String,
        #[n(2)]
        target_swap_id: String,
    },
    #[n(2)]
    ProposalAccepted {
        #[n(0)]
        proposal_id: String,
        #[n(1)]
        source_swap_id: String,
        #[n(2)]
        target_swap_id: String,
        #[n(3)]
        amount: Option<u64>,
    },
    #[n(3)]
    ProposalRejected {
        #[n(0)]
        proposal_id: String,
        #[n(1)]
        target_swap_id: String,
    },
    #[n(4)]
    AuctionExpired {
        #[n(0)]
        swap_id: String,
        #[n(1)]
        expired_targets: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    pub transaction_id: String,
    pub consensus_timestamp: TimeStamp<Utc>,
}

pub trait AuditLedger: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<LedgerReceipt, LedgerError>;
}

/// Fallback ledger for deployments without notarization. Reporting `Disabled`
/// (rather than fabricating receipts) keeps the "accepted but unaudited"
/// warning path honest.
pub struct NullAuditLedger;

impl AuditLedger for NullAuditLedger {
    fn record(&self, _event: &AuditEvent) -> Result<LedgerReceipt, LedgerError> {
        Err(LedgerError::Disabled)
    }
}

/// Process-local ledger for development and tests: hash-of-cbor transaction
/// ids, events retained in order of arrival.
#[derive(Default)]
pub struct InMemoryLedger {
    events: Mutex<Vec<(String, AuditEvent)>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, AuditEvent)> {
        self.events
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl AuditLedger for InMemoryLedger {
    fn record(&self, event: &AuditEvent) -> Result<LedgerReceipt, LedgerError> {
        let cbor = minicbor::to_vec(event).map_err(|e| LedgerError::Encoding(e.to_string()))?;
        let transaction_id = sha256::digest(&cbor);

        let mut events = self.events.lock().map_err(|_| LedgerError::Unavailable)?;
        events.push((transaction_id.clone(), event.clone()));

        Ok(LedgerReceipt {
            transaction_id,
            consensus_timestamp: TimeStamp::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_encoding() {
        let event = AuditEvent::ProposalAccepted {
            proposal_id: "proposal_1".into(),
            source_swap_id: "swap_a".into(),
            target_swap_id: "swap_b".into(),
            amount: Some(15_000),
        };

        let encoding = minicbor::to_vec(&event).unwrap();
        let decode: AuditEvent = minicbor::decode(&encoding).unwrap();

        assert_eq!(event, decode);
    }

    #[test]
    fn in_memory_ledger_ids_are_content_addressed() {
        let ledger = InMemoryLedger::new();
        let event = AuditEvent::TargetingCreated {
            target_id: "target_1".into(),
            source_swap_id: "swap_a".into(),
            target_swap_id: "swap_b".into(),
            proposal_id: "proposal_1".into(),
        };

        let first = ledger.record(&event).unwrap();
        let second = ledger.record(&event).unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(ledger.events().len(), 2);
    }

    #[test]
    fn null_ledger_reports_disabled() {
        let ledger = NullAuditLedger;
        let event = AuditEvent::ProposalRejected {
            proposal_id: "proposal_1".into(),
            target_swap_id: "swap_b".into(),
        };

        assert!(matches!(ledger.record(&event), Err(LedgerError::Disabled)));
    }
}
