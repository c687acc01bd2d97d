//! Raffle backend: a periodically settled raffle backed by a local
//! randomness oracle.
//!
//! - **Raffle** ([`raffle`]): entries, upkeep predicate, settlement.
//! - **Coordinator** ([`coordinator`]): subscriptions and the request queue.
//! - **Fulfiller** ([`fulfiller`]): produces random words and delivers them.
//! - **Keeper** ([`keeper`]): triggers upkeep when it is due.
//! - **HTTP API** ([`api`]): entry, upkeep and inspection endpoints.

pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod fulfiller;
pub mod keeper;
pub mod metrics;
pub mod payout;
pub mod raffle;
pub mod service;
pub mod vrf;
