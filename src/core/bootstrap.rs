//! Idempotent nftables infrastructure bootstrap
//!
//! Makes the tables/chains/sets the engine depends on exist before any live
//! mutation, tolerating any subset already being present. Every check is
//! existence-based, so calling this repeatedly is a no-op once converged.
//! It runs before *every* live mutating operation because this process may
//! be one of several operators on the host and the chains may have been
//! reset externally.
//!
//! Two independent infrastructures:
//!
//! - filter: the base table, the host input chain (accept policy), the
//!   application-owned chain, and exactly one jump rule linking them. The
//!   jump is inserted at a low but non-first position so baseline loopback
//!   and established-connection rules are never bypassed.
//! - blacklist: a separate highest-priority table (prerouting hook at
//!   priority -300) holding the interval address set and its drop rule, so
//!   blocked sources are cut off before container-network forwarding.
//!
//! Failure to create any element aborts the whole bootstrap; the caller
//! must not proceed with the dependent operation.

use crate::config::EngineConfig;
use crate::core::conditions::{contains_sequence, tokenize};
use crate::core::error::{Error, Result};
use crate::core::nft::{CommandRunner, Nft};
use std::sync::Arc;
use tracing::info;

/// Priority of the blacklist prerouting chain. Runs before everything else,
/// including Docker's own chains.
const BLACKLIST_HOOK_PRIORITY: i32 = -300;

/// Ceiling for the jump rule position: after the baseline loopback and
/// established-connection rules, never first.
const JUMP_POSITION_CEILING: usize = 3;

#[derive(Debug, Clone)]
pub struct Bootstrap<R> {
    nft: Nft<R>,
    cfg: Arc<EngineConfig>,
}

impl<R: CommandRunner> Bootstrap<R> {
    pub fn new(nft: Nft<R>, cfg: Arc<EngineConfig>) -> Self {
        Self { nft, cfg }
    }

    /// Ensures the filter table, input chain, application chain and jump
    /// linkage exist.
    pub async fn ensure_filter(&self) -> Result<()> {
        let cfg = &self.cfg;

        if !self.nft.table_exists(&cfg.filter_table).await {
            info!(table = %cfg.filter_table, "creating filter table");
            self.nft
                .add_table(&cfg.filter_table)
                .await
                .map_err(|e| bootstrap_error("filter table", &e))?;
        }

        if !self.nft.chain_exists(&cfg.filter_table, &cfg.input_chain).await {
            info!(chain = %cfg.input_chain, "creating input base chain");
            self.nft
                .add_hook_chain(&cfg.filter_table, &cfg.input_chain, "input", 0, "accept")
                .await
                .map_err(|e| bootstrap_error("input chain", &e))?;
        }

        if !self.nft.chain_exists(&cfg.filter_table, &cfg.app_chain).await {
            info!(chain = %cfg.app_chain, "creating application chain");
            self.nft
                .add_chain(&cfg.filter_table, &cfg.app_chain)
                .await
                .map_err(|e| bootstrap_error("application chain", &e))?;
        }

        if !self.jump_rule_exists().await? {
            let current = self.chain_rule_count(&cfg.filter_table, &cfg.input_chain).await;
            let position = JUMP_POSITION_CEILING.min(current);
            info!(position, "linking input chain to application chain");
            let tokens = vec!["jump".to_string(), cfg.app_chain.clone()];
            self.nft
                .insert_rule_at(&cfg.filter_table, &cfg.input_chain, position, &tokens)
                .await
                .map_err(|e| bootstrap_error("jump rule", &e))?;
        }

        Ok(())
    }

    /// Ensures the blacklist table, prerouting chain, address set and drop
    /// rule exist.
    pub async fn ensure_blacklist(&self) -> Result<()> {
        let cfg = &self.cfg;

        if !self.nft.table_exists(&cfg.raw_table).await {
            info!(table = %cfg.raw_table, "creating raw table");
            self.nft
                .add_table(&cfg.raw_table)
                .await
                .map_err(|e| bootstrap_error("raw table", &e))?;
        }

        if !self
            .nft
            .chain_exists(&cfg.raw_table, &cfg.prerouting_chain)
            .await
        {
            info!(chain = %cfg.prerouting_chain, "creating prerouting base chain");
            self.nft
                .add_hook_chain(
                    &cfg.raw_table,
                    &cfg.prerouting_chain,
                    "prerouting",
                    BLACKLIST_HOOK_PRIORITY,
                    "accept",
                )
                .await
                .map_err(|e| bootstrap_error("prerouting chain", &e))?;
        }

        if !self.nft.set_exists(&cfg.raw_table, &cfg.blacklist_set).await {
            info!(set = %cfg.blacklist_set, "creating blacklist set");
            self.nft
                .add_interval_set(&cfg.raw_table, &cfg.blacklist_set)
                .await
                .map_err(|e| bootstrap_error("blacklist set", &e))?;
        }

        if !self.blacklist_rule_exists().await? {
            info!("adding blacklist drop rule to prerouting chain");
            let set_ref = format!("@{}", cfg.blacklist_set);
            let tokens: Vec<String> = ["ip", "saddr", set_ref.as_str(), "drop"]
                .iter()
                .map(ToString::to_string)
                .collect();
            self.nft
                .add_rule(&cfg.raw_table, &cfg.prerouting_chain, &tokens)
                .await
                .map_err(|e| bootstrap_error("blacklist drop rule", &e))?;
        }

        Ok(())
    }

    /// Whether the input chain already jumps to the application chain.
    async fn jump_rule_exists(&self) -> Result<bool> {
        let lines = self
            .nft
            .list_chain(&self.cfg.filter_table, &self.cfg.input_chain, false)
            .await?;
        let expected = ["jump", self.cfg.app_chain.as_str()];
        Ok(lines
            .iter()
            .any(|line| contains_sequence(&tokenize(line), &expected)))
    }

    /// Whether the prerouting chain already drops blacklist-set sources.
    async fn blacklist_rule_exists(&self) -> Result<bool> {
        let lines = self
            .nft
            .list_chain(&self.cfg.raw_table, &self.cfg.prerouting_chain, false)
            .await?;
        let set_ref = format!("@{}", self.cfg.blacklist_set);
        let expected = ["ip", "saddr", set_ref.as_str(), "drop"];
        Ok(lines
            .iter()
            .any(|line| contains_sequence(&tokenize(line), &expected)))
    }

    /// Counts the non-structural rule lines currently in a chain.
    async fn chain_rule_count(&self, table: &str, chain: &str) -> usize {
        let Ok(lines) = self.nft.list_chain(table, chain, false).await else {
            return 0;
        };
        lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| {
                !l.is_empty()
                    && !l.starts_with('#')
                    && !l.starts_with("table")
                    && !l.starts_with("chain")
                    && !l.starts_with("type")
                    && !l.starts_with("policy")
                    && !l.starts_with('}')
            })
            .count()
    }
}

fn bootstrap_error(element: &str, cause: &Error) -> Error {
    Error::Bootstrap(format!("could not create {element}: {cause}"))
}
