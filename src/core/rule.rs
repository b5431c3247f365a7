//! Policy record types shared by the live engine and the config compiler
//!
//! This module defines the records the engine consumes from the policy store:
//!
//! - [`Rule`] — one declarative filtering rule (source/destination/protocol/
//!   port plus the author's intended action)
//! - [`BlacklistEntry`] — one blocked address or network
//! - [`Mode`] — the process-wide enforcement mode (blacklist or whitelist)
//!
//! The engine never originates a [`Rule`]; it consumes records persisted by
//! the management surface and projects them into nftables state. The one
//! invariant that matters here: a rule's compiled condition tuple must be
//! reproducible identically by the live-apply path and the persisted-compile
//! path, which is why both go through
//! [`build_conditions`](crate::core::conditions::build_conditions).

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum number of rules allowed in a policy document
///
/// Limit prevents memory exhaustion from malformed/malicious stores.
/// 1000 rules is well beyond typical use cases (most hosts have <50).
pub const MAX_RULES: usize = 1000;

/// Network protocol type for firewall rules
///
/// `Copy` trait allows efficient passing by value for this small enum.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Match all protocols
    #[default]
    #[strum(serialize = "any")]
    Any,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// Internet Control Message Protocol
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    /// Returns lowercase protocol name as static string
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    /// Whether this protocol carries port numbers.
    ///
    /// Only TCP and UDP rules may compile a `dport` condition; ICMP and
    /// wildcard rules silently drop any configured port spec.
    pub const fn carries_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Rule action recorded by the rule's author (Accept or Drop)
///
/// This is the *stored intent*. The action actually applied to the kernel is
/// mode-dependent: see [`effective_action`](crate::core::conditions::effective_action).
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Accept the packet (allow it through)
    #[default]
    #[strum(serialize = "accept")]
    Accept,
    /// Drop the packet silently (no response sent)
    #[strum(serialize = "drop")]
    Drop,
}

impl Action {
    /// Returns lowercase action name (the nftables verdict token)
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "accept",
            Action::Drop => "drop",
        }
    }
}

/// Which traffic direction a rule belongs to
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum RuleClass {
    /// Incoming traffic (the default; the only class applied live today)
    #[default]
    #[strum(serialize = "input")]
    Input,
    /// Outgoing traffic
    #[strum(serialize = "output")]
    Output,
    /// Forwarded traffic (container/bridge paths)
    #[strum(serialize = "forward")]
    Forward,
}

/// Where a rule record came from
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Created by an operator
    #[default]
    #[strum(serialize = "manual")]
    Manual,
    /// Created through the self-service request flow
    #[strum(serialize = "self_service")]
    SelfService,
    /// Seeded by the system itself
    #[strum(serialize = "system")]
    System,
}

/// Process-wide enforcement mode
///
/// Blacklist mode: default-accept, rules and the blacklist set deny traffic.
/// Whitelist mode: default-drop, rules allow traffic. Mode is persisted in
/// the policy store and passed explicitly to every mode-dependent call —
/// there is no process global.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    #[strum(serialize = "blacklist")]
    Blacklist,
    #[strum(serialize = "whitelist")]
    Whitelist,
}

impl Mode {
    /// Parses a mode string, failing loudly on anything unrecognized.
    ///
    /// An unsupported mode value is a programmer/config error; callers must
    /// not silently default it away.
    pub fn parse(value: &str) -> crate::core::error::Result<Self> {
        Mode::from_str(value)
            .map_err(|_| crate::core::error::Error::UnsupportedMode(value.to_string()))
    }
}

/// An inclusive destination port range
///
/// Displays as `80` for a single port or `8000-9000` for a range, which is
/// exactly the token nftables expects after `dport`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_one = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid port: {p}"))
        };
        match s.split_once('-') {
            Some((a, b)) => {
                let (start, end) = (parse_one(a)?, parse_one(b)?);
                if start == 0 || end == 0 {
                    return Err("port must be between 1 and 65535".to_string());
                }
                if start > end {
                    return Err(format!("invalid port range: {start} > {end}"));
                }
                Ok(Self { start, end })
            }
            None => {
                let port = parse_one(s)?;
                if port == 0 {
                    return Err("port must be between 1 and 65535".to_string());
                }
                Ok(Self::single(port))
            }
        }
    }
}

/// One declarative firewall rule as persisted by the policy store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: Uuid,
    /// Unique, operator-facing name. Mutable; identity for CLI operations.
    pub name: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// Source network; `None` (or a zero-prefix network) matches any address
    #[serde(default)]
    pub source: Option<IpNetwork>,
    /// Destination network; `None` (or a zero-prefix network) matches any address
    #[serde(default)]
    pub destination: Option<IpNetwork>,
    /// Destination port spec, honored only for TCP/UDP
    #[serde(default)]
    pub ports: Option<PortRange>,
    /// The author's intended action; the applied action is mode-derived
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub class: RuleClass,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Rule {
    /// Creates a rule with defaults for everything but the name.
    ///
    /// Callers fill in the match fields afterwards; this keeps struct
    /// literals out of the CLI layer.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            protocol: Protocol::default(),
            source: None,
            destination: None,
            ports: None,
            action: Action::default(),
            class: RuleClass::default(),
            origin: Origin::default(),
            active: true,
            description: None,
            created_at: chrono::Utc::now(),
            updated_at: None,
        }
    }

    /// Marks the record as touched now.
    pub fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now());
    }
}

/// One blocked address or network
///
/// Lifecycle: created active when an operator blocks an address; deactivated
/// (never hard-deleted) when unblocked, so history survives while the live
/// set element is removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlacklistEntry {
    pub id: Uuid,
    pub address: IpNetwork,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl BlacklistEntry {
    pub fn new(address: IpNetwork, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address,
            description,
            active: true,
            created_at: chrono::Utc::now(),
        }
    }
}

fn default_true() -> bool {
    true
}
