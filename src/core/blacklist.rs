//! Blacklist enforcement with active session termination
//!
//! Blocking an address is a three-step pipeline:
//!
//! 1. persist the entry in the policy store (active=true);
//! 2. add the address to the live interval set in the highest-priority
//!    table, which stops all *new* connections immediately;
//! 3. best-effort terminate *existing* sessions from that address with two
//!    independent mechanisms run in sequence: a targeted `ss -K` kill
//!    (immediate RST) and a `conntrack -D` purge (so no stale tracked state
//!    lets a future packet slip through as "already established").
//!
//! The set-membership add alone is sufficient to stop new connections, so
//! the termination step never fails the overall operation — a missing `ss`
//! or `conntrack` binary is logged as a warning. A failed set add rolls the
//! store write back so the store and the kernel never disagree about who is
//! blocked.

use crate::config::EngineConfig;
use crate::core::bootstrap::Bootstrap;
use crate::core::error::{Error, Result};
use crate::core::nft::{CmdOutput, CommandRunner, Nft};
use crate::core::rule::BlacklistEntry;
use crate::storage::PolicyStore;
use ipnetwork::IpNetwork;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct BlacklistEnforcer<R, S> {
    nft: Nft<R>,
    bootstrap: Bootstrap<R>,
    store: Arc<S>,
    cfg: Arc<EngineConfig>,
}

/// One tracked connection as reported by `conntrack -L`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedConnection {
    pub protocol: String,
    pub state: String,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub source_port: Option<String>,
    pub destination_port: Option<String>,
}

impl<R: CommandRunner + Clone, S: PolicyStore> BlacklistEnforcer<R, S> {
    pub fn new(nft: Nft<R>, store: Arc<S>, cfg: Arc<EngineConfig>) -> Self {
        let bootstrap = Bootstrap::new(nft.clone(), cfg.clone());
        Self {
            nft,
            bootstrap,
            store,
            cfg,
        }
    }

    /// Blocks an address: persist, add the live set element, kick existing
    /// sessions.
    pub async fn block(&self, address: IpNetwork, note: Option<String>) -> Result<()> {
        info!(%address, "blocking address");

        self.store
            .upsert_blacklist(BlacklistEntry::new(address, note))?;

        if let Err(e) = self.bootstrap.ensure_blacklist().await {
            self.rollback_entry(&address);
            return Err(e);
        }

        let element = element_argument(&address);
        let output = self
            .nft
            .add_element(&self.cfg.raw_table, &self.cfg.blacklist_set, &element)
            .await;
        if !output.success() && !element_already_present(&output) {
            error!(%address, stderr = %output.stderr.trim(), "failed to add blacklist element");
            self.rollback_entry(&address);
            return Err(Error::from_output("add blacklist element", &output));
        }

        // New connections are now cut off; kicking established sessions is a
        // best-effort enhancement on top.
        self.terminate_sessions(&address).await;

        info!(%address, "address blocked");
        Ok(())
    }

    /// Unblocks an address: deactivate the entry, remove the live element.
    /// Removing from the blacklist never needs to kill anything.
    pub async fn unblock(&self, address: IpNetwork) -> Result<()> {
        info!(%address, "unblocking address");

        if !self.store.deactivate_blacklist(&address)? {
            warn!(%address, "address was not in the active blacklist");
        }

        self.bootstrap.ensure_blacklist().await?;

        let element = element_argument(&address);
        let output = self
            .nft
            .delete_element(&self.cfg.raw_table, &self.cfg.blacklist_set, &element)
            .await;
        if !output.success() && !element_already_absent(&output) {
            return Err(Error::from_output("delete blacklist element", &output));
        }

        info!(%address, "address unblocked");
        Ok(())
    }

    /// Actively terminates established sessions from an address using two
    /// independent best-effort mechanisms. Returns whether at least one of
    /// them reported success.
    pub async fn terminate_sessions(&self, address: &IpNetwork) -> bool {
        let target = element_argument(address);

        // Step 1: ss -K sends an immediate RST to every matching session.
        let ss = self
            .nft
            .runner()
            .run("ss", &["-K", "src", &target], None)
            .await;
        let ss_ok = if ss.missing {
            warn!("`ss` not found, skipping active session kill (install iproute2)");
            false
        } else if ss.success() {
            info!(%address, "active sessions terminated via ss");
            true
        } else {
            error!(%address, stderr = %ss.stderr.trim(), "ss -K failed");
            false
        };

        // Step 2: purge the connection-tracking table so no tracked state
        // survives the kill.
        let ct = self
            .nft
            .runner()
            .run("conntrack", &["-D", "-s", &target], None)
            .await;
        let ct_ok = if ct.missing {
            warn!("`conntrack` not found, skipping state purge (install conntrack-tools)");
            false
        } else if ct.success() {
            info!(%address, "connection-tracking state purged");
            true
        } else {
            // conntrack -D exits non-zero when nothing matched; still fine
            warn!(%address, stderr = %ct.stderr.trim(), "conntrack -D reported no entries");
            false
        };

        if !ss_ok && !ct_ok {
            warn!(
                %address,
                "could not terminate existing sessions; new connections are blocked, \
                 established ones will only die off naturally"
            );
        }
        ss_ok || ct_ok
    }

    /// Lists tracked connections, optionally restricted to one source
    /// address. Purely observational.
    pub async fn active_connections(
        &self,
        address: Option<&IpNetwork>,
    ) -> Result<Vec<TrackedConnection>> {
        let target = address.map(element_argument);
        let mut args = vec!["-L"];
        if let Some(ref t) = target {
            args.push("-s");
            args.push(t);
        }

        let output = self.nft.runner().run("conntrack", &args, None).await;
        if output.missing {
            warn!("`conntrack` not found, connection listing unavailable");
            return Ok(Vec::new());
        }
        if !output.success() {
            return Err(Error::from_output("list connections", &output));
        }

        Ok(output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parse_conntrack_line)
            .collect())
    }

    fn rollback_entry(&self, address: &IpNetwork) {
        if let Err(e) = self.store.deactivate_blacklist(address) {
            error!(%address, "failed to roll back blacklist entry: {e}");
        }
    }
}

/// Renders the address as passed to nft/ss/conntrack: bare IP for host
/// networks, CIDR otherwise.
fn element_argument(address: &IpNetwork) -> String {
    let host_prefix = match address {
        IpNetwork::V4(_) => 32,
        IpNetwork::V6(_) => 128,
    };
    if address.prefix() == host_prefix {
        address.ip().to_string()
    } else {
        address.to_string()
    }
}

/// Whether a failed element add was only a duplicate — idempotent success.
fn element_already_present(output: &CmdOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("file exists") || stderr.contains("already")
}

/// Whether a failed element delete was only a missing element — idempotent
/// success.
fn element_already_absent(output: &CmdOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    stderr.contains("no such file or directory") || stderr.contains("does not exist")
}

/// Parses one `conntrack -L` line, e.g.
/// `tcp 6 431999 ESTABLISHED src=192.0.2.1 dst=198.51.100.2 sport=52044 dport=443 ...`
fn parse_conntrack_line(line: &str) -> TrackedConnection {
    let tokens = crate::core::conditions::tokenize(line);
    let mut conn = TrackedConnection {
        protocol: tokens.first().map(|s| (*s).to_string()).unwrap_or_default(),
        state: tokens.get(3).map(|s| (*s).to_string()).unwrap_or_default(),
        ..TrackedConnection::default()
    };

    for token in tokens {
        if let Some((key, value)) = token.split_once('=') {
            let value = Some(value.to_string());
            match key {
                "src" if conn.source.is_none() => conn.source = value,
                "dst" if conn.destination.is_none() => conn.destination = value,
                "sport" if conn.source_port.is_none() => conn.source_port = value,
                "dport" if conn.destination_port.is_none() => conn.destination_port = value,
                _ => {}
            }
        }
    }
    conn
}
