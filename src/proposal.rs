//! Proposal entity and its draft builder.
//!
//! A proposal is the human-readable content of a targeting act. It is created
//! atomically with its target, 1:1, and its content is immutable afterwards
//! except for the acceptance timestamp and the audit-ledger reference. It is
//! never deleted, only superseded, so rejected history stays auditable.
use chrono::Utc;

use crate::error::ValidationError;
use crate::swap::TimeStamp;
use crate::utils;

pub const MAX_MESSAGE_LEN: usize = 2_000;
pub const MAX_COMPATIBILITY_SCORE: u8 = 100;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    #[n(0)]
    USD,
    #[n(1)]
    GBP,
    #[n(2)]
    EUR,
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Currency::USD => "USD",
            Currency::GBP => "GBP",
            Currency::EUR => "EUR",
        };
        f.write_str(code)
    }
}

/// Where the proposal originated.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalSource {
    #[n(0)]
    Browse,
    #[n(1)]
    Direct,
    #[n(2)]
    Auction,
}

/// An optional cash top-up attached to a proposal. Amounts are minor units.
/// `escrow_id` is set once the proposer has pre-funded escrow at the gateway.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct CashOffer {
    #[n(0)]
    pub amount: u64,
    #[n(1)]
    pub currency: Currency,
    #[n(2)]
    pub escrow_id: Option<String>,
}

impl CashOffer {
    /// Display label, e.g. "USD 150.00".
    pub fn label(&self) -> String {
        format!(
            "{} {}.{:02}",
            self.currency,
            self.amount / 100,
            self.amount % 100
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    #[n(0)]
    pub id: String,
    /// External correlation key supplied by the caller, if any.
    #[n(1)]
    pub external_ref: Option<String>,
    #[n(2)]
    pub target_id: String,
    #[n(3)]
    pub source_swap_id: String,
    #[n(4)]
    pub target_swap_id: String,
    #[n(5)]
    pub proposer_id: String,
    #[n(6)]
    pub target_owner_id: String,
    #[n(7)]
    pub message: String,
    /// Advisory only: shown to the owner, never used for ordering or winner
    /// selection.
    #[n(8)]
    pub compatibility_score: u8,
    #[n(9)]
    pub created_from_browse: bool,
    #[n(10)]
    pub source: ProposalSource,
    #[n(11)]
    pub cash_offer: Option<CashOffer>,
    /// Audit-ledger transaction id, set after the acceptance event is durable.
    #[n(12)]
    pub ledger_transaction_id: Option<String>,
    #[n(13)]
    pub created_at: TimeStamp<Utc>,
    #[n(14)]
    pub updated_at: TimeStamp<Utc>,
    #[n(15)]
    pub accepted_at: Option<TimeStamp<Utc>>,
}

/// Builder for proposal content, validated before it is persisted.
#[derive(Debug, Clone, Default)]
pub struct ProposalDraft {
    message: String,
    compatibility_score: u8,
    created_from_browse: bool,
    source: Option<ProposalSource>,
    cash_offer: Option<CashOffer>,
    external_ref: Option<String>,
}

impl ProposalDraft {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }
    pub fn set_compatibility_score(mut self, score: u8) -> Self {
        self.compatibility_score = score;
        self
    }
    pub fn set_source(mut self, source: ProposalSource) -> Self {
        self.source = Some(source);
        self
    }
    pub fn mark_from_browse(mut self) -> Self {
        self.created_from_browse = true;
        self.source = Some(ProposalSource::Browse);
        self
    }
    pub fn set_cash_offer(mut self, amount: u64, currency: Currency) -> Self {
        self.cash_offer = Some(CashOffer {
            amount,
            currency,
            escrow_id: None,
        });
        self
    }
    /// Mark the cash offer as pre-funded at the payment gateway.
    pub fn set_escrow_id(mut self, escrow_id: &str) -> Self {
        if let Some(offer) = self.cash_offer.as_mut() {
            offer.escrow_id = Some(escrow_id.to_string());
        }
        self
    }
    pub fn set_external_ref(mut self, external_ref: &str) -> Self {
        self.external_ref = Some(external_ref.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if self.message.len() > MAX_MESSAGE_LEN {
            return Err(ValidationError::MessageTooLong(self.message.len()));
        }
        if self.compatibility_score > MAX_COMPATIBILITY_SCORE {
            return Err(ValidationError::ScoreOutOfRange(self.compatibility_score));
        }
        if let Some(offer) = &self.cash_offer {
            if offer.amount == 0 {
                return Err(ValidationError::ZeroCashOffer);
            }
        }
        Ok(())
    }

    /// Finalise the draft into a persistable proposal. Assumes `validate`
    /// has already passed.
    pub(crate) fn into_proposal(
        self,
        target_id: String,
        source_swap_id: String,
        target_swap_id: String,
        proposer_id: String,
        target_owner_id: String,
        created_at: TimeStamp<Utc>,
    ) -> Proposal {
        let source = self.source.unwrap_or(ProposalSource::Direct);
        Proposal {
            id: utils::proposal_id(),
            external_ref: self.external_ref,
            target_id,
            source_swap_id,
            target_swap_id,
            proposer_id,
            target_owner_id,
            message: self.message,
            compatibility_score: self.compatibility_score,
            created_from_browse: self.created_from_browse,
            source,
            cash_offer: self.cash_offer,
            ledger_transaction_id: None,
            updated_at: created_at.clone(),
            created_at,
            accepted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_validation_rejects_empty_message() {
        let draft = ProposalDraft::new();
        assert!(matches!(
            draft.validate(),
            Err(ValidationError::EmptyMessage)
        ));
    }

    #[test]
    fn draft_validation_rejects_out_of_range_score() {
        let draft = ProposalDraft::new()
            .set_message("interested in your booking")
            .set_compatibility_score(101);
        assert!(matches!(
            draft.validate(),
            Err(ValidationError::ScoreOutOfRange(101))
        ));
    }

    #[test]
    fn draft_validation_rejects_zero_cash_offer() {
        let draft = ProposalDraft::new()
            .set_message("with a top-up")
            .set_cash_offer(0, Currency::USD);
        assert!(matches!(
            draft.validate(),
            Err(ValidationError::ZeroCashOffer)
        ));
    }

    #[test]
    fn cash_offer_label_formats_minor_units() {
        let offer = CashOffer {
            amount: 15_000,
            currency: Currency::USD,
            escrow_id: None,
        };
        assert_eq!(offer.label(), "USD 150.00");

        let offer = CashOffer {
            amount: 205,
            currency: Currency::EUR,
            escrow_id: None,
        };
        assert_eq!(offer.label(), "EUR 2.05");
    }

    #[test]
    fn proposal_encoding() {
        let draft = ProposalDraft::new()
            .set_message("swap with me")
            .set_compatibility_score(82)
            .mark_from_browse()
            .set_cash_offer(5_000, Currency::GBP);
        draft.validate().unwrap();

        let proposal = draft.into_proposal(
            "target_1".into(),
            "swap_a".into(),
            "swap_b".into(),
            "user_a".into(),
            "user_b".into(),
            TimeStamp::now(),
        );

        let encoding = minicbor::to_vec(&proposal).unwrap();
        let decode: Proposal = minicbor::decode(&encoding).unwrap();

        assert_eq!(proposal, decode);
        assert!(proposal.created_from_browse);
        assert_eq!(proposal.source, ProposalSource::Browse);
    }
}
