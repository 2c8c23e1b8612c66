//! Identifier helpers: uuid7 payloads in bech32 with a human-readable prefix.

use bech32::Bech32m;
use uuid7::uuid7;

// invariant: the hrp values below are fixed and valid, and a 16-byte uuid
// payload sits far under the bech32m code-length ceiling, so encoding has no
// failure path for any input this function receives
fn new_prefixed_id(hrp: &str) -> String {
    let hrp = bech32::Hrp::parse_unchecked(hrp);
    bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .unwrap_or_else(|err| unreachable!("bech32 encoding of a fixed-prefix id failed: {err}"))
}

pub fn swap_id() -> String {
    new_prefixed_id("swap_")
}

pub fn target_id() -> String {
    new_prefixed_id("target_")
}

pub fn proposal_id() -> String {
    new_prefixed_id("proposal_")
}

pub fn user_id() -> String {
    new_prefixed_id("user_")
}

pub fn booking_id() -> String {
    new_prefixed_id("booking_")
}
