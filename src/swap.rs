//! Swap entity: a booking a user has opened for swapping.
use chrono::{DateTime, TimeZone, Utc};

use crate::utils;

/// Status of a listed swap.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Active,
    #[n(2)]
    Pending,
    #[n(3)]
    Accepted,
    #[n(4)]
    Completed,
    #[n(5)]
    Cancelled,
    #[n(6)]
    Expired,
}

impl SwapStatus {
    /// A resolved swap can no longer receive or create targets.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            SwapStatus::Accepted | SwapStatus::Completed | SwapStatus::Cancelled | SwapStatus::Expired
        )
    }
}

impl std::fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SwapStatus::Draft => "draft",
            SwapStatus::Active => "active",
            SwapStatus::Pending => "pending",
            SwapStatus::Accepted => "accepted",
            SwapStatus::Completed => "completed",
            SwapStatus::Cancelled => "cancelled",
            SwapStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// How a swap admits competing proposals.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptanceStrategy {
    /// At most one active incoming target at a time.
    #[n(0)]
    OneForOne,
    /// Many active incoming targets; exactly one may be accepted.
    #[n(1)]
    Auction,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

// Ordering is implemented by hand: deriving it would demand `T: Ord`, which
// `Utc` does not implement, while `DateTime<Utc>` itself orders fine.
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Shifted copy, used for deadlines relative to some reference instant.
    pub fn plus_seconds(&self, secs: i64) -> Self {
        Self(self.0 + chrono::TimeDelta::seconds(secs))
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// A booking listed for swapping. Mutated only by the targeting state machine
/// and the acceptance pipeline; reads may observe transitional states.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Swap {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner_id: String,
    #[n(2)]
    pub source_booking_id: String,
    #[n(3)]
    pub status: SwapStatus,
    #[n(4)]
    pub acceptance_strategy: AcceptanceStrategy,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub expires_at: Option<TimeStamp<Utc>>,
    // Auction-only fields. `auction_closed_at` records an explicit owner
    // force-close, which keeps the auction acceptable past its deadline.
    #[n(7)]
    pub auction_end_at: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub auction_closed_at: Option<TimeStamp<Utc>>,
}

impl Swap {
    /// List a booking as a one-for-one swap, open immediately.
    pub fn new_one_for_one(owner_id: String, source_booking_id: String) -> Self {
        Self {
            id: utils::swap_id(),
            owner_id,
            source_booking_id,
            status: SwapStatus::Active,
            acceptance_strategy: AcceptanceStrategy::OneForOne,
            created_at: TimeStamp::now(),
            expires_at: None,
            auction_end_at: None,
            auction_closed_at: None,
        }
    }

    /// List a booking as an auction closing at `auction_end_at`.
    pub fn new_auction(
        owner_id: String,
        source_booking_id: String,
        auction_end_at: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id: utils::swap_id(),
            owner_id,
            source_booking_id,
            status: SwapStatus::Active,
            acceptance_strategy: AcceptanceStrategy::Auction,
            created_at: TimeStamp::now(),
            expires_at: None,
            auction_end_at: Some(auction_end_at),
            auction_closed_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: TimeStamp<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.status.is_resolved()
    }

    pub fn expired_by(&self, now: &TimeStamp<Utc>) -> bool {
        self.expires_at.as_ref().is_some_and(|at| at <= now)
    }

    /// Whether the auction window has closed for *new* targets. An explicit
    /// owner force-close also stops new targets, but keeps acceptance open.
    pub fn auction_ended(&self, now: &TimeStamp<Utc>) -> bool {
        self.acceptance_strategy == AcceptanceStrategy::Auction
            && (self.auction_closed_at.is_some()
                || self.auction_end_at.as_ref().is_some_and(|at| at <= now))
    }

    /// Whether an auction proposal may be accepted right now: before the
    /// deadline, or any time after an explicit owner force-close.
    pub fn auction_accepting(&self, now: &TimeStamp<Utc>) -> bool {
        match self.acceptance_strategy {
            AcceptanceStrategy::OneForOne => true,
            AcceptanceStrategy::Auction => {
                self.auction_closed_at.is_some()
                    || self.auction_end_at.as_ref().is_none_or(|at| now < at)
            }
        }
    }

    /// Preconditions for receiving a new incoming target.
    pub fn open_for_targeting(&self, now: &TimeStamp<Utc>) -> bool {
        matches!(self.status, SwapStatus::Active | SwapStatus::Pending)
            && !self.expired_by(now)
            && !self.auction_ended(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::now();

        let encoding = minicbor::to_vec(original.clone()).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn timestamps_order_chronologically() {
        let earlier = TimeStamp::now();
        let later = earlier.plus_seconds(30);

        assert!(earlier < later);
        assert!(&earlier <= &earlier.clone());
        assert_eq!(earlier.cmp(&later), std::cmp::Ordering::Less);
    }

    #[test]
    fn swap_encoding() {
        let swap = Swap::new_auction(
            "user_abc".into(),
            "booking_1".into(),
            TimeStamp::now().plus_seconds(3_600),
        );

        let encoding = minicbor::to_vec(&swap).unwrap();
        let decode: Swap = minicbor::decode(&encoding).unwrap();

        assert_eq!(swap, decode);
    }

    #[test]
    fn auction_accepting_window() {
        let now = TimeStamp::now();
        let mut swap = Swap::new_auction("user_a".into(), "booking_1".into(), now.plus_seconds(60));

        assert!(swap.auction_accepting(&now));
        assert!(!swap.auction_accepting(&now.plus_seconds(120)));

        // force-close re-opens acceptance past the deadline
        swap.auction_closed_at = Some(now.clone());
        assert!(swap.auction_accepting(&now.plus_seconds(120)));
    }

    #[test]
    fn resolved_statuses() {
        assert!(SwapStatus::Accepted.is_resolved());
        assert!(SwapStatus::Completed.is_resolved());
        assert!(SwapStatus::Cancelled.is_resolved());
        assert!(SwapStatus::Expired.is_resolved());
        assert!(!SwapStatus::Active.is_resolved());
        assert!(!SwapStatus::Pending.is_resolved());
        assert!(!SwapStatus::Draft.is_resolved());
    }
}
