//! netwarden - live nftables policy enforcement engine
//!
//! Enforces network access policy (address blacklist/whitelist plus
//! protocol/port rules) on a host by driving nftables through the `nft`
//! CLI. The engine applies individual rule changes to the *running* kernel
//! state without a full flush, actively terminates sessions from newly
//! blacklisted sources, and periodically reconciles the persisted
//! configuration file against live state so a restart never regresses
//! policy.
//!
//! # Architecture
//!
//! - [`core`] - The enforcement engine: condition compilation, config
//!   generation, infrastructure bootstrap, live reconciliation, blacklist
//!   enforcement, background persisted-file sync, mode switching
//! - [`storage`] - The policy store collaborator (rules, blacklist, mode)
//! - [`config`] - Engine configuration persistence
//! - [`audit`] - Audit logging of privileged operations
//! - [`service`] - Filtering subsystem status/reload control surface
//! - [`validators`] - Input validation and sanitization
//! - [`utils`] - Directory helpers (XDG)
//!
//! # Safety model
//!
//! - The application-owned chain is the only chain the engine mutates;
//!   baseline chains are never flushed
//! - Infrastructure bootstrap is idempotent and runs before every live
//!   mutation
//! - The persisted file is always backed up before being overwritten
//! - Every external tool is invoked as an argument vector, never a shell
//!   string

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod service;
pub mod storage;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use config::EngineConfig;
pub use core::error::{Error, Result};
pub use core::rule::{Action, BlacklistEntry, Mode, PortRange, Protocol, Rule};
