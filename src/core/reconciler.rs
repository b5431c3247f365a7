//! Live rule reconciliation against the application-owned chain
//!
//! Applies individual rule deltas to the *running* kernel state without a
//! full flush, so unrelated connections are never severed by a policy edit.
//! All operations target the application-owned chain only; baseline chains
//! are never touched.
//!
//! Deletion is the tricky part. Kernel handles are ephemeral and not
//! persisted, so a delete first re-derives the handle by listing the chain
//! with handle annotations and matching the rule's compiled condition
//! tokens as a contiguous sub-sequence of each line's tokens (see
//! [`conditions`](crate::core::conditions) for why substring matching is
//! unsafe). Only when no handle is found does it fall back to
//! content-addressed deletion — a degraded path, logged as such, because
//! repeated identical-text rules are indistinguishable there.

use crate::config::EngineConfig;
use crate::core::bootstrap::Bootstrap;
use crate::core::conditions::{self, RuleConditions, build_conditions};
use crate::core::error::{Error, Result};
use crate::core::nft::{CommandRunner, Nft};
use crate::core::rule::{Mode, Rule};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a full chain re-sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
}

impl SyncReport {
    pub fn complete(&self) -> bool {
        self.succeeded == self.attempted
    }
}

#[derive(Debug, Clone)]
pub struct LiveReconciler<R> {
    nft: Nft<R>,
    bootstrap: Bootstrap<R>,
    cfg: Arc<EngineConfig>,
}

impl<R: CommandRunner + Clone> LiveReconciler<R> {
    pub fn new(nft: Nft<R>, cfg: Arc<EngineConfig>) -> Self {
        let bootstrap = Bootstrap::new(nft.clone(), cfg.clone());
        Self {
            nft,
            bootstrap,
            cfg,
        }
    }

    pub fn bootstrap(&self) -> &Bootstrap<R> {
        &self.bootstrap
    }

    /// Appends one rule to the application chain, live.
    ///
    /// Nothing is retried on failure; the caller decides.
    pub async fn add(&self, rule: &Rule, mode: Mode) -> Result<()> {
        self.bootstrap.ensure_filter().await?;
        let conditions = build_conditions(rule, mode);
        self.nft
            .add_rule(
                &self.cfg.filter_table,
                &self.cfg.app_chain,
                &conditions.arg_tokens(),
            )
            .await?;
        info!(rule = %rule.name, line = %conditions.to_line(), "rule applied live");
        Ok(())
    }

    /// Removes one rule from the application chain, live.
    pub async fn delete(&self, rule: &Rule, mode: Mode) -> Result<()> {
        self.bootstrap.ensure_filter().await?;
        let conditions = build_conditions(rule, mode);

        if let Some(handle) = self.resolve_handle(&conditions).await? {
            self.nft
                .delete_rule_handle(&self.cfg.filter_table, &self.cfg.app_chain, handle)
                .await?;
            info!(rule = %rule.name, handle, "rule deleted live by handle");
            return Ok(());
        }

        // Degraded path: the handle could not be resolved (restart, external
        // edit). Content-addressed deletion is racier — identical rule text
        // is ambiguous — so it is attempted once and logged as degraded.
        warn!(
            rule = %rule.name,
            "live handle not found, falling back to content-addressed delete"
        );
        self.nft
            .delete_rule_tokens(
                &self.cfg.filter_table,
                &self.cfg.app_chain,
                &conditions.arg_tokens(),
            )
            .await
            .map_err(|e| match e {
                Error::Nft { .. } => Error::RuleNotFound(rule.name.clone()),
                other => other,
            })?;
        info!(rule = %rule.name, "rule deleted live by content");
        Ok(())
    }

    /// Replaces a rule: delete the old, add the new.
    ///
    /// Non-atomic two-step operation — in the failure window the old rule is
    /// briefly absent. If the add fails after a successful delete, the old
    /// rule is re-added as compensation and the overall operation still
    /// reports failure; a failed compensation is surfaced as its own error
    /// variant so the caller knows the chain is now missing a rule.
    pub async fn update(&self, old: &Rule, new: &Rule, mode: Mode) -> Result<()> {
        self.delete(old, mode).await?;

        if let Err(add_err) = self.add(new, mode).await {
            error!(
                old = %old.name,
                new = %new.name,
                "add failed after delete, attempting to restore the old rule"
            );
            return match self.add(old, mode).await {
                Ok(()) => Err(add_err),
                Err(comp_err) => Err(Error::Compensation {
                    rule: old.name.clone(),
                    source: Box::new(comp_err),
                }),
            };
        }

        info!(rule = %new.name, "rule updated live");
        Ok(())
    }

    /// Raw listing of the application chain, one element per line.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.bootstrap.ensure_filter().await?;
        self.nft
            .list_chain(&self.cfg.filter_table, &self.cfg.app_chain, false)
            .await
    }

    /// Number of filtering rules currently live in the application chain.
    pub async fn live_rule_count(&self) -> Result<usize> {
        let lines = self.list().await?;
        Ok(conditions::count_rule_lines(
            lines.iter().map(String::as_str),
        ))
    }

    /// Removes all rules from the application chain only. Never touches any
    /// other chain or table.
    pub async fn flush(&self) -> Result<()> {
        self.bootstrap.ensure_filter().await?;
        self.nft
            .flush_chain(&self.cfg.filter_table, &self.cfg.app_chain)
            .await?;
        info!("application chain flushed");
        Ok(())
    }

    /// Replaces the application chain contents with the given rule set
    /// under the given mode: flush, then add each active rule, attempting
    /// every rule even after individual failures.
    pub async fn resync(&self, rules: &[Rule], mode: Mode) -> Result<SyncReport> {
        self.flush().await?;

        let active: Vec<&Rule> = rules.iter().filter(|r| r.active).collect();
        let mut succeeded = 0;
        for rule in &active {
            match self.add(rule, mode).await {
                Ok(()) => succeeded += 1,
                Err(e) => error!(rule = %rule.name, "failed to re-add rule: {e}"),
            }
        }

        let report = SyncReport {
            attempted: active.len(),
            succeeded,
        };
        info!(
            succeeded = report.succeeded,
            attempted = report.attempted,
            "application chain re-sync finished"
        );
        Ok(report)
    }

    /// Resolves a rule's live handle by scanning the annotated chain listing
    /// for a line whose tokens contain the compiled condition sequences.
    pub async fn resolve_handle(&self, conditions: &RuleConditions) -> Result<Option<u64>> {
        let lines = self
            .nft
            .list_chain(&self.cfg.filter_table, &self.cfg.app_chain, true)
            .await?;
        Ok(lines.iter().find_map(|line| {
            if conditions::line_matches(line, conditions) {
                conditions::parse_handle(line)
            } else {
                None
            }
        }))
    }
}
