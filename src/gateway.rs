//! External payment and fraud capabilities, consumed through narrow traits.
//!
//! Collaborators are dependency-injected at construction time. Each trait has
//! a typed null-object fallback so a deployment without payments or fraud
//! scoring still constructs, with well-defined behaviour instead of ad hoc
//! stand-ins.
use std::time::Duration;

use crate::proposal::{CashOffer, Currency, Proposal};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment gateway timed out")]
    Timeout,
    #[error("payment gateway unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationToken {
    pub token: String,
    pub amount: u64,
    pub currency: Currency,
    pub payer_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    Capture,
    Release,
    Refund,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentTransaction {
    pub id: String,
    pub amount: u64,
    pub currency: Currency,
    pub kind: PaymentKind,
}

/// Money movement. Calls are awaited synchronously from the core's view and
/// must carry their own bounded timeout; a timeout is a failure, never a
/// success. Idempotency keys are the gateway's responsibility.
pub trait PaymentGateway: Send + Sync {
    fn authorize(
        &self,
        amount: u64,
        currency: Currency,
        payer_id: &str,
    ) -> Result<AuthorizationToken, GatewayError>;
    fn capture(&self, token: AuthorizationToken) -> Result<PaymentTransaction, GatewayError>;
    fn release(
        &self,
        escrow_id: &str,
        recipient_id: &str,
    ) -> Result<PaymentTransaction, GatewayError>;
    fn refund(&self, escrow_id: &str) -> Result<PaymentTransaction, GatewayError>;
}

/// Fallback gateway for deployments without payments: declines every money
/// operation rather than pretending to move funds.
pub struct NullPaymentGateway;

impl PaymentGateway for NullPaymentGateway {
    fn authorize(
        &self,
        _amount: u64,
        _currency: Currency,
        _payer_id: &str,
    ) -> Result<AuthorizationToken, GatewayError> {
        Err(GatewayError::Declined("payments are disabled".into()))
    }
    fn capture(&self, _token: AuthorizationToken) -> Result<PaymentTransaction, GatewayError> {
        Err(GatewayError::Declined("payments are disabled".into()))
    }
    fn release(
        &self,
        _escrow_id: &str,
        _recipient_id: &str,
    ) -> Result<PaymentTransaction, GatewayError> {
        Err(GatewayError::Declined("payments are disabled".into()))
    }
    fn refund(&self, _escrow_id: &str) -> Result<PaymentTransaction, GatewayError> {
        Err(GatewayError::Declined("payments are disabled".into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Advisory fraud verdict. `requires_manual_review` never blocks acceptance
/// in this core; it is surfaced in the result for the caller to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub risk_level: RiskLevel,
    pub requires_manual_review: bool,
}

pub trait FraudDetectionService: Send + Sync {
    fn assess(&self, proposal: &Proposal, offer: &CashOffer) -> RiskAssessment;
}

pub struct NullFraudService;

impl FraudDetectionService for NullFraudService {
    fn assess(&self, _proposal: &Proposal, _offer: &CashOffer) -> RiskAssessment {
        RiskAssessment {
            risk_level: RiskLevel::Low,
            requires_manual_review: false,
        }
    }
}

/// Bounded retry with linear backoff, applied explicitly at the call sites
/// that need it (the post-commit ledger append), never blanket-wrapped over
/// a whole service.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

pub fn with_retry<T, E, F>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.max_attempts => return Err(err),
            Err(_) => std::thread::sleep(policy.backoff.saturating_mul(attempt)),
        }
    }
}
