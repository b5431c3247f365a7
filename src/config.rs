//! Engine configuration persistence
//!
//! All knobs of the enforcement engine live in [`EngineConfig`]: the
//! persisted nftables config path, the `nft` binary path, the table/chain/
//! set names the engine owns, the reconciliation interval, and the
//! whitelist-mode seed data (trusted networks, control-plane ports).
//!
//! Every field has a serde default so an empty or partial config file is
//! valid; the config is loaded from an explicit `--config` path or from the
//! XDG config directory, and saved with an atomic temp-file + rename write.

use crate::utils::get_config_dir;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// The persisted nftables configuration file, fully overwritten on sync
    #[serde(default = "default_nftables_config_path")]
    pub nftables_config_path: PathBuf,

    /// Path to the nft binary. The `NETWARDEN_NFT_COMMAND` environment
    /// variable overrides this (test seam; see `core::nft`).
    #[serde(default = "default_nft_path")]
    pub nft_path: String,

    /// Base filtering table holding the input chain and application chain
    #[serde(default = "default_filter_table")]
    pub filter_table: String,

    /// Highest-priority table holding the blacklist set and its drop rule
    #[serde(default = "default_raw_table")]
    pub raw_table: String,

    /// The host's default input chain (accept policy, append-only augmented)
    #[serde(default = "default_input_chain")]
    pub input_chain: String,

    /// Prerouting chain in the raw table (priority -300, pre-empts
    /// container-network forwarding)
    #[serde(default = "default_prerouting_chain")]
    pub prerouting_chain: String,

    /// The application-owned chain; all user-authored rules live only here
    #[serde(default = "default_app_chain")]
    pub app_chain: String,

    /// Name of the interval-typed blacklist address set
    #[serde(default = "default_blacklist_set")]
    pub blacklist_set: String,

    /// Reconciliation period in seconds (floor of 60 enforced at start)
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Networks pre-seeded as accepted in whitelist mode
    #[serde(default = "default_trusted_networks")]
    pub trusted_networks: Vec<IpNetwork>,

    /// TCP ports kept reachable in whitelist mode so operators cannot lock
    /// themselves out of the management surface
    #[serde(default = "default_control_ports")]
    pub control_ports: Vec<u16>,

    /// Container bridge networks allowed through input/forward/output in
    /// both modes
    #[serde(default = "default_container_networks")]
    pub container_networks: Vec<IpNetwork>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nftables_config_path: default_nftables_config_path(),
            nft_path: default_nft_path(),
            filter_table: default_filter_table(),
            raw_table: default_raw_table(),
            input_chain: default_input_chain(),
            prerouting_chain: default_prerouting_chain(),
            app_chain: default_app_chain(),
            blacklist_set: default_blacklist_set(),
            sync_interval_secs: default_sync_interval(),
            trusted_networks: default_trusted_networks(),
            control_ports: default_control_ports(),
            container_networks: default_container_networks(),
        }
    }
}

fn default_nftables_config_path() -> PathBuf {
    PathBuf::from("/etc/nftables.conf")
}

fn default_nft_path() -> String {
    "nft".to_string()
}

fn default_filter_table() -> String {
    "filter".to_string()
}

fn default_raw_table() -> String {
    "raw".to_string()
}

fn default_input_chain() -> String {
    "input".to_string()
}

fn default_prerouting_chain() -> String {
    "prerouting".to_string()
}

fn default_app_chain() -> String {
    "warden".to_string()
}

fn default_blacklist_set() -> String {
    "blacklist".to_string()
}

fn default_sync_interval() -> u64 {
    300
}

fn v4(a: u8, b: u8, c: u8, d: u8, prefix: u8) -> IpNetwork {
    IpNetwork::V4(
        Ipv4Network::new(Ipv4Addr::new(a, b, c, d), prefix).expect("static network literal"),
    )
}

fn default_trusted_networks() -> Vec<IpNetwork> {
    vec![v4(192, 168, 0, 0, 16), v4(10, 0, 0, 0, 8)]
}

fn default_control_ports() -> Vec<u16> {
    vec![22, 80, 443, 8000]
}

fn default_container_networks() -> Vec<IpNetwork> {
    vec![
        // Docker default bridge plus the custom-network ranges
        v4(172, 17, 0, 0, 16),
        v4(172, 18, 0, 0, 15),
        v4(172, 20, 0, 0, 14),
        v4(172, 24, 0, 0, 13),
        v4(172, 32, 0, 0, 11),
        IpNetwork::V6(
            Ipv6Network::new(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 0), 8)
                .expect("static network literal"),
        ),
    ]
}

/// The default config file path inside the XDG config directory.
pub fn default_config_file() -> Option<PathBuf> {
    get_config_dir().map(|mut dir| {
        dir.push("config.json");
        dir
    })
}

/// Loads the engine config.
///
/// With an explicit path the file must exist and parse — a typo'd path or a
/// malformed file fails loudly rather than silently running with defaults.
/// Without one, the XDG config file is used when present, defaults otherwise.
pub async fn load_config(path: Option<&Path>) -> crate::core::error::Result<EngineConfig> {
    if let Some(path) = path {
        let json = tokio::fs::read_to_string(path).await?;
        return Ok(serde_json::from_str(&json)?);
    }

    if let Some(path) = default_config_file()
        && let Ok(json) = tokio::fs::read_to_string(&path).await
    {
        return Ok(serde_json::from_str(&json)?);
    }

    Ok(EngineConfig::default())
}

/// Saves the engine config to the XDG config directory using an atomic
/// write pattern: write a temp file, fsync, rename over the target.
pub async fn save_config(config: &EngineConfig) -> std::io::Result<()> {
    let Some(path) = default_config_file() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "config directory not found",
        ));
    };
    crate::utils::ensure_dirs()?;

    let json = serde_json::to_string_pretty(config)?;
    let mut temp_path = path.clone();
    temp_path.set_extension("json.tmp");

    {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(temp_path, path).await
}
