//! Background reconciliation of the persisted configuration file
//!
//! One long-lived task per process. Each tick compares the number of
//! filtering rules live in the application chain with the number the
//! freshly compiled configuration would carry; when they diverge (or on an
//! explicit force) the compiled configuration is written to the persisted
//! path, preceded by a timestamped backup of the previous file. The tick
//! never reloads or flushes running kernel state — the file follows the
//! kernel, never the reverse, so a cold restart reproduces current policy.
//!
//! Counting is token-based on both sides (see
//! [`conditions::is_rule_line`](crate::core::conditions::is_rule_line));
//! the raw-substring heuristic this replaces would double-count a comment
//! line containing "drop".
//!
//! A tick that raises any error is caught and logged, and the loop backs
//! off to a fixed shorter retry interval before resuming normal cadence; a
//! single failed tick never terminates the loop. The only cancellation
//! point is the shutdown flag, checked once per sleep interval — a shutdown
//! request takes effect on the next wake, not immediately.

use crate::config::EngineConfig;
use crate::core::compiler;
use crate::core::error::Result;
use crate::core::nft::CommandRunner;
use crate::core::reconciler::LiveReconciler;
use crate::storage::PolicyStore;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default reconciliation period.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Enforced floor for the reconciliation period.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Fixed backoff after a failed tick.
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Observable state of the reconciliation service.
///
/// Owned by the loop and published as snapshots; advisory only and
/// rebuildable from zero after a restart.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub running: bool,
    pub interval: Duration,
    pub last_sync: Option<chrono::DateTime<chrono::Utc>>,
    pub sync_count: u64,
}

impl SyncStatus {
    fn new(interval: Duration) -> Self {
        Self {
            running: false,
            interval,
            last_sync: None,
            sync_count: 0,
        }
    }
}

/// Caller-side handle to a running [`SyncService`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    shutdown: Arc<AtomicBool>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SyncHandle {
    /// Requests a stop; takes effect when the loop next wakes.
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Snapshot of the service state.
    pub fn status(&self) -> SyncStatus {
        self.status_rx.borrow().clone()
    }
}

pub struct SyncService<R, S> {
    reconciler: LiveReconciler<R>,
    store: Arc<S>,
    cfg: Arc<EngineConfig>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    status_tx: watch::Sender<SyncStatus>,
    status: SyncStatus,
}

impl<R, S> SyncService<R, S>
where
    R: CommandRunner + Clone,
    S: PolicyStore,
{
    pub fn new(
        reconciler: LiveReconciler<R>,
        store: Arc<S>,
        cfg: Arc<EngineConfig>,
        interval: Duration,
    ) -> (Self, SyncHandle) {
        let interval = interval.max(MIN_SYNC_INTERVAL);
        let shutdown = Arc::new(AtomicBool::new(false));
        let status = SyncStatus::new(interval);
        let (status_tx, status_rx) = watch::channel(status.clone());
        let handle = SyncHandle {
            shutdown: shutdown.clone(),
            status_rx,
        };
        (
            Self {
                reconciler,
                store,
                cfg,
                interval,
                shutdown,
                status_tx,
                status,
            },
            handle,
        )
    }

    /// Runs the reconciliation loop until a stop is requested.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "reconciliation service started");
        self.status.running = true;
        self.publish();

        loop {
            let delay = match self.tick().await {
                Ok(()) => self.interval,
                Err(e) => {
                    error!("reconciliation tick failed: {e}");
                    RETRY_INTERVAL
                }
            };

            tokio::time::sleep(delay).await;

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
        }

        self.status.running = false;
        self.publish();
        info!("reconciliation service stopped");
    }

    /// One reconciliation pass: compare counts, sync when they diverge.
    pub async fn tick(&mut self) -> Result<()> {
        if !self.needs_sync().await? {
            debug!("live and persisted rule counts match, nothing to do");
            return Ok(());
        }
        self.sync_now().await
    }

    /// Whether live state and the persisted-equivalent configuration have
    /// diverged.
    pub async fn needs_sync(&self) -> Result<bool> {
        let live = self.reconciler.live_rule_count().await?;
        let persisted = self.persisted_rule_count()?;

        if live == persisted {
            Ok(false)
        } else {
            info!(live, persisted, "rule counts diverged, persisted sync required");
            Ok(true)
        }
    }

    /// Unconditionally writes the compiled configuration to the persisted
    /// path (with backup) and bumps the counters.
    pub async fn sync_now(&mut self) -> Result<()> {
        let mode = self.store.mode()?;
        let rules = self.store.active_rules()?;
        let blacklist = self.store.active_blacklist()?;
        let text = compiler::compile(mode, &rules, &blacklist, &self.cfg);

        let backup = write_persisted(&self.cfg.nftables_config_path, &text).await?;
        if let Some(backup) = backup {
            debug!(backup = %backup.display(), "previous configuration backed up");
        }

        self.status.sync_count += 1;
        self.status.last_sync = Some(chrono::Utc::now());
        self.publish();

        info!(
            sync_count = self.status.sync_count,
            path = %self.cfg.nftables_config_path.display(),
            "persisted configuration synchronized"
        );
        Ok(())
    }

    /// Number of rules the freshly compiled configuration carries in the
    /// application chain.
    fn persisted_rule_count(&self) -> Result<usize> {
        let mode = self.store.mode()?;
        let rules = self.store.active_rules()?;
        let blacklist = self.store.active_blacklist()?;
        let text = compiler::compile(mode, &rules, &blacklist, &self.cfg);
        Ok(compiler::persisted_rule_count(&text, &self.cfg.app_chain))
    }

    pub fn status(&self) -> SyncStatus {
        self.status.clone()
    }

    fn publish(&self) {
        let _ = self.status_tx.send_replace(self.status.clone());
    }
}

/// Writes the persisted configuration file.
///
/// The previous file, when present, is first copied to a timestamped backup
/// (`<path>.backup.<YYYYmmdd_HHMMSS>`). The new content is written to a
/// temp file in the same directory, fsynced, then renamed over the target;
/// a SHA-256 sidecar is refreshed last. Returns the backup path, if one was
/// made.
pub async fn write_persisted(path: &Path, contents: &str) -> Result<Option<PathBuf>> {
    let backup = if tokio::fs::try_exists(path).await? {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let backup_path = PathBuf::from(format!("{}.backup.{timestamp}", path.display()));
        tokio::fs::copy(path, &backup_path).await?;
        Some(backup_path)
    } else {
        None
    };

    let temp_path = PathBuf::from(format!("{}.tmp", path.display()));
    {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
    }
    tokio::fs::rename(&temp_path, path).await?;

    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    tokio::fs::write(format!("{}.sha256", path.display()), digest).await?;

    Ok(backup)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_persisted_creates_backup_only_when_previous_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nftables.conf");

        let first = write_persisted(&path, "first\n").await.unwrap();
        assert!(first.is_none());
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "first\n");

        let second = write_persisted(&path, "second\n").await.unwrap();
        let backup = second.expect("backup of the previous file");
        assert_eq!(tokio::fs::read_to_string(&backup).await.unwrap(), "first\n");
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second\n");

        // sidecar tracks the latest content
        let sidecar = tokio::fs::read_to_string(format!("{}.sha256", path.display()))
            .await
            .unwrap();
        assert_eq!(sidecar.len(), 64);
    }

    #[test]
    fn test_interval_floor_is_enforced() {
        assert!(MIN_SYNC_INTERVAL <= DEFAULT_SYNC_INTERVAL);
        assert_eq!(MIN_SYNC_INTERVAL, Duration::from_secs(60));
    }
}
