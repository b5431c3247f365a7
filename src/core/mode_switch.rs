//! Blacklist ↔ whitelist mode switching
//!
//! A mode change re-derives the effective action of every active rule (the
//! stored action is the author's intent; enforcement is mode-dependent) and
//! replaces the application chain's contents: flush, then re-add each rule
//! under the new mode. Every rule is attempted even after individual
//! failures; a partial result leaves the chain in a mixed state and is
//! surfaced to the caller as [`Error::PartialResync`] rather than silently
//! accepted.

use crate::core::error::{Error, Result};
use crate::core::nft::CommandRunner;
use crate::core::reconciler::{LiveReconciler, SyncReport};
use crate::core::rule::Mode;
use crate::storage::PolicyStore;
use tracing::info;

/// Persists the new mode and rebuilds the application chain under it.
pub async fn switch_mode<R, S>(
    store: &S,
    reconciler: &LiveReconciler<R>,
    new_mode: Mode,
) -> Result<SyncReport>
where
    R: CommandRunner + Clone,
    S: PolicyStore,
{
    let previous = store.mode()?;
    if previous == new_mode {
        info!(%new_mode, "mode unchanged, rebuilding chain anyway");
    } else {
        info!(%previous, %new_mode, "switching enforcement mode");
    }

    store.set_mode(new_mode)?;

    let rules = store.active_rules()?;
    let report = reconciler.resync(&rules, new_mode).await?;

    if !report.complete() {
        return Err(Error::PartialResync {
            succeeded: report.succeeded,
            attempted: report.attempted,
        });
    }

    info!(%new_mode, rules = report.attempted, "mode switch complete");
    Ok(report)
}
