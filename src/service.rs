//! Filtering subsystem control surface
//!
//! Used only on manual full restarts and for status display — never by the
//! engine's steady-state path. Covers "is the filtering subsystem active"
//! and "reload everything from the persisted file", with the environment
//! detection the two deployment shapes need: inside a container there is no
//! systemd, so the nftables service state is inferred from the ruleset
//! itself.

use crate::core::conditions::{contains_sequence, tokenize};
use crate::core::error::Result;
use crate::core::nft::{CommandRunner, Nft};
use std::path::Path;
use tracing::{info, warn};

/// Where the process is running, which decides how the subsystem is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum Environment {
    #[strum(serialize = "container")]
    Container,
    #[strum(serialize = "host")]
    Host,
}

/// Detects a container environment (`/.dockerenv`, or a docker cgroup on
/// PID 1).
pub fn detect_environment() -> Environment {
    if Path::new("/.dockerenv").exists() {
        return Environment::Container;
    }
    if let Ok(cgroup) = std::fs::read_to_string("/proc/1/cgroup")
        && cgroup.contains("docker")
    {
        return Environment::Container;
    }
    Environment::Host
}

/// Snapshot of the filtering subsystem state.
#[derive(Debug, Clone)]
pub struct FirewallStatus {
    pub is_running: bool,
    pub rules_count: usize,
    pub environment: Environment,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

/// Probes the filtering subsystem in the detected environment.
pub async fn firewall_status<R: CommandRunner>(
    nft: &Nft<R>,
    filter_table: &str,
) -> FirewallStatus {
    firewall_status_in(detect_environment(), nft, filter_table).await
}

/// Probes the filtering subsystem in an explicit environment (test seam).
pub async fn firewall_status_in<R: CommandRunner>(
    environment: Environment,
    nft: &Nft<R>,
    filter_table: &str,
) -> FirewallStatus {
    let ruleset = nft.list_ruleset().await.unwrap_or_default();
    let rules_count = ruleset
        .lines()
        .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        .count();

    let is_running = match environment {
        Environment::Container => {
            // no systemd inside a container; a present filter table means
            // the subsystem is effectively up
            let expected = ["table", "inet", filter_table];
            ruleset
                .lines()
                .any(|line| contains_sequence(&tokenize(line), &expected))
        }
        Environment::Host => {
            let output = nft
                .runner()
                .run("systemctl", &["is-active", "nftables"], None)
                .await;
            if output.missing {
                warn!("systemctl not available, reporting subsystem as inactive");
                false
            } else {
                output.stdout.trim() == "active"
            }
        }
    };

    FirewallStatus {
        is_running,
        rules_count,
        environment,
        last_updated: chrono::Utc::now(),
    }
}

/// Reloads the full persisted configuration into the kernel, restarting the
/// nftables unit on hosts that run one.
pub async fn reload_ruleset<R: CommandRunner>(
    nft: &Nft<R>,
    config_path: &Path,
) -> Result<()> {
    reload_ruleset_in(detect_environment(), nft, config_path).await
}

/// Reload with an explicit environment (test seam).
pub async fn reload_ruleset_in<R: CommandRunner>(
    environment: Environment,
    nft: &Nft<R>,
    config_path: &Path,
) -> Result<()> {
    info!(path = %config_path.display(), "loading persisted configuration");
    nft.load_file(config_path).await?;

    if environment == Environment::Host {
        let output = nft
            .runner()
            .run("systemctl", &["restart", "nftables"], None)
            .await;
        if output.missing {
            warn!("systemctl not available, skipping service restart");
        } else if !output.success() {
            return Err(crate::core::error::Error::from_output(
                "restart nftables service",
                &output,
            ));
        }
    }

    info!("persisted configuration reloaded");
    Ok(())
}
