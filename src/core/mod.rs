//! Core enforcement engine
//!
//! This module contains the live firewall rule synchronization and
//! enforcement engine:
//!
//! - [`rule`]: policy records consumed from the store (rules, blacklist
//!   entries, enforcement mode)
//! - [`conditions`]: rule → condition compilation and live-line token
//!   matching
//! - [`compiler`]: full persisted-configuration generation
//! - [`nft`]: the external command invocation surface
//! - [`bootstrap`]: idempotent table/chain/set/jump provisioning
//! - [`reconciler`]: live add/delete/update/list/flush against the
//!   application-owned chain
//! - [`blacklist`]: blacklist set enforcement with active session
//!   termination
//! - [`sync`]: background reconciliation of the persisted configuration
//! - [`mode_switch`]: blacklist ↔ whitelist chain rebuilds
//! - [`error`]: error types for engine operations

pub mod blacklist;
pub mod bootstrap;
pub mod compiler;
pub mod conditions;
pub mod error;
pub mod mode_switch;
pub mod nft;
pub mod reconciler;
pub mod rule;
pub mod sync;

#[cfg(test)]
pub mod test_helpers;
