//! Core of a peer-to-peer booking-swap marketplace: the targeting state
//! machine (who proposes against whom) and the acceptance pipeline that
//! resolves those proposals.
//!
//! Entities are CBOR-encoded into a single sled keyspace and every compound
//! state transition runs inside one storage transaction. External concerns
//! (payments, fraud scoring, audit notarization, profile lookup) enter
//! through narrow traits with typed null-object fallbacks.
pub mod acceptance;
pub mod auction;
pub mod consistency;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod proposal;
pub mod store;
pub mod swap;
pub mod target;
pub mod targeting;
pub mod utils;
