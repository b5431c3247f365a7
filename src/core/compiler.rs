//! Full nftables configuration generation
//!
//! Compiles the complete persisted configuration text from the policy
//! store's view of the world: enforcement mode, active rules, active
//! blacklist entries. The output can fully replace the running configuration
//! on a cold start (`nft -f`); the steady-state path never loads it — live
//! deltas go through the reconciler and this file only follows reality.
//!
//! Two fixed templates exist. Blacklist mode is default-accept with the
//! blacklist set dropped at highest priority; whitelist mode is default-drop
//! with pre-seeded trusted networks and explicit allows for the engine's own
//! control-plane ports so operators cannot lock themselves out.
//!
//! User rules are substituted into a placeholder inside the application
//! chain. When the rule set is empty the placeholder line is removed
//! entirely — an empty substitution would leave a bare indented line but a
//! forgotten placeholder would be an nft syntax error.

use crate::config::EngineConfig;
use crate::core::conditions::{build_conditions, chain_block, count_rule_lines};
use crate::core::rule::{BlacklistEntry, Mode, Rule};
use ipnetwork::IpNetwork;
use std::fmt::Write;

/// Placeholder line marker replaced by the compiled user rules.
const RULES_PLACEHOLDER: &str = "{{USER_RULES}}";

/// Compiles the statement lines for the active rules under the given mode.
///
/// This is the exact text the live-apply path submits (token-for-token),
/// shared so reconciliation counting can never drift between the two paths.
pub fn rule_lines(rules: &[Rule], mode: Mode) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.active)
        .map(|r| build_conditions(r, mode).to_line())
        .collect()
}

/// Compiles the complete configuration text.
pub fn compile(
    mode: Mode,
    rules: &[Rule],
    blacklist: &[BlacklistEntry],
    cfg: &EngineConfig,
) -> String {
    let base = match mode {
        Mode::Blacklist => blacklist_config(blacklist, cfg),
        Mode::Whitelist => whitelist_config(cfg),
    };
    insert_rules(&base, &rule_lines(rules, mode))
}

/// Counts the user-rule lines inside the application chain of a compiled
/// configuration. Token-based, so template comments mentioning verdicts are
/// never miscounted.
pub fn persisted_rule_count(config_text: &str, app_chain: &str) -> usize {
    count_rule_lines(chain_block(config_text, app_chain))
}

/// Replaces the placeholder line with the compiled rules, or removes it
/// entirely when there are none.
fn insert_rules(config: &str, lines: &[String]) -> String {
    if lines.is_empty() {
        return config
            .lines()
            .filter(|l| !l.contains(RULES_PLACEHOLDER))
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
    }

    let replacement = lines.join("\n        ");
    config.replace(RULES_PLACEHOLDER, &replacement)
}

fn saddr(net: &IpNetwork) -> String {
    let family = if net.is_ipv4() { "ip" } else { "ip6" };
    format!("{family} saddr {net}")
}

fn daddr(net: &IpNetwork) -> String {
    let family = if net.is_ipv4() { "ip" } else { "ip6" };
    format!("{family} daddr {net}")
}

fn blacklist_config(blacklist: &[BlacklistEntry], cfg: &EngineConfig) -> String {
    let mut out = String::with_capacity(2048);

    let _ = writeln!(out, "#!/usr/sbin/nft -f\n");
    let _ = writeln!(out, "flush ruleset\n");

    // Highest-priority table: the blacklist set pre-empts every other chain,
    // including container-network forwarding.
    let _ = writeln!(out, "table inet {} {{", cfg.raw_table);
    let _ = writeln!(out, "    set {} {{", cfg.blacklist_set);
    let _ = writeln!(out, "        type ipv4_addr");
    let _ = writeln!(out, "        flags interval");
    let _ = writeln!(out, "        auto-merge");

    // The set type is ipv4_addr; v6 entries cannot be represented here
    let elements: Vec<String> = blacklist
        .iter()
        .filter(|e| e.active && e.address.is_ipv4())
        .map(|e| e.address.to_string())
        .collect();
    if !elements.is_empty() {
        let _ = writeln!(out, "        elements = {{ {} }}", elements.join(", "));
    }
    let _ = writeln!(out, "    }}\n");

    let _ = writeln!(out, "    chain {} {{", cfg.prerouting_chain);
    let _ = writeln!(
        out,
        "        type filter hook prerouting priority -300; policy accept;\n"
    );
    let _ = writeln!(
        out,
        "        ip saddr @{} drop comment \"blocked sources\"",
        cfg.blacklist_set
    );
    let _ = writeln!(out, "        iif lo accept");
    let _ = writeln!(out, "        ct state established,related accept");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}\n");

    let _ = writeln!(out, "table inet {} {{", cfg.filter_table);
    write_input_chain(&mut out, cfg, "accept", false);
    write_app_chain(&mut out, cfg);
    write_forward_chain(&mut out, cfg, "accept");
    write_output_chain(&mut out, cfg, "accept");
    let _ = writeln!(out, "}}");

    out
}

fn whitelist_config(cfg: &EngineConfig) -> String {
    let mut out = String::with_capacity(2048);

    let _ = writeln!(out, "#!/usr/sbin/nft -f\n");
    let _ = writeln!(out, "flush ruleset\n");

    let _ = writeln!(out, "table inet {} {{", cfg.filter_table);
    write_input_chain(&mut out, cfg, "drop", true);
    write_app_chain(&mut out, cfg);
    write_forward_chain(&mut out, cfg, "drop");
    write_output_chain(&mut out, cfg, "accept");
    let _ = writeln!(out, "}}");

    out
}

fn write_input_chain(out: &mut String, cfg: &EngineConfig, policy: &str, whitelist: bool) {
    let _ = writeln!(out, "    chain {} {{", cfg.input_chain);
    let _ = writeln!(
        out,
        "        type filter hook input priority 0; policy {policy};\n"
    );
    let _ = writeln!(out, "        iif lo accept");
    let _ = writeln!(out, "        ct state established,related accept\n");
    let _ = writeln!(out, "        jump {}\n", cfg.app_chain);

    let _ = writeln!(out, "        # container bridge networks");
    for net in &cfg.container_networks {
        let _ = writeln!(out, "        {} accept", saddr(net));
    }

    if whitelist {
        let _ = writeln!(out, "\n        # pre-seeded trusted networks");
        for net in &cfg.trusted_networks {
            let _ = writeln!(out, "        {} accept", saddr(net));
        }

        let _ = writeln!(out, "\n        # control-plane ports stay reachable");
        for port in &cfg.control_ports {
            let _ = writeln!(out, "        tcp dport {port} accept");
        }
    }

    let _ = writeln!(out, "    }}\n");
}

fn write_app_chain(out: &mut String, cfg: &EngineConfig) {
    let _ = writeln!(out, "    chain {} {{", cfg.app_chain);
    let _ = writeln!(out, "        {RULES_PLACEHOLDER}");
    let _ = writeln!(out, "        return");
    let _ = writeln!(out, "    }}\n");
}

fn write_forward_chain(out: &mut String, cfg: &EngineConfig, policy: &str) {
    let _ = writeln!(out, "    chain forward {{");
    let _ = writeln!(
        out,
        "        type filter hook forward priority 0; policy {policy};\n"
    );
    let _ = writeln!(out, "        ct state established,related accept\n");
    for net in &cfg.container_networks {
        let _ = writeln!(out, "        {} accept", saddr(net));
        let _ = writeln!(out, "        {} accept", daddr(net));
    }
    let _ = writeln!(out, "    }}\n");
}

fn write_output_chain(out: &mut String, cfg: &EngineConfig, policy: &str) {
    let _ = writeln!(out, "    chain output {{");
    let _ = writeln!(
        out,
        "        type filter hook output priority 0; policy {policy};\n"
    );
    for net in &cfg.container_networks {
        let _ = writeln!(out, "        {} accept", daddr(net));
    }
    let _ = writeln!(out, "    }}\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::Protocol;
    use crate::core::test_helpers::rule_with;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn test_empty_ruleset_drops_placeholder() {
        let text = compile(Mode::Blacklist, &[], &[], &cfg());
        assert!(!text.contains(RULES_PLACEHOLDER));
        assert!(!text.contains("{{"));
        // the application chain still exists, just without rules
        assert!(text.contains("chain warden {"));
        assert_eq!(persisted_rule_count(&text, "warden"), 0);
    }

    #[test]
    fn test_blacklist_mode_compiles_rules_as_drop() {
        let rules = vec![
            rule_with("a", Protocol::Tcp, Some(22), Some("10.0.0.0/24"), None),
            rule_with("b", Protocol::Any, None, Some("192.0.2.1/32"), None),
        ];
        let text = compile(Mode::Blacklist, &rules, &[], &cfg());
        assert!(text.contains("ip saddr 10.0.0.0/24 tcp dport 22 drop"));
        assert!(text.contains("ip saddr 192.0.2.1/32 drop"));
        assert_eq!(persisted_rule_count(&text, "warden"), 2);
    }

    #[test]
    fn test_whitelist_mode_compiles_rules_as_accept() {
        let rules = vec![rule_with(
            "a",
            Protocol::Tcp,
            Some(22),
            Some("10.0.0.0/24"),
            None,
        )];
        let text = compile(Mode::Whitelist, &rules, &[], &cfg());
        assert!(text.contains("ip saddr 10.0.0.0/24 tcp dport 22 accept"));
        assert!(!text.contains("tcp dport 22 drop"));
    }

    #[test]
    fn test_inactive_rules_are_not_compiled() {
        let mut rule = rule_with("a", Protocol::Tcp, Some(22), Some("10.0.0.0/24"), None);
        rule.active = false;
        let text = compile(Mode::Blacklist, &[rule], &[], &cfg());
        assert_eq!(persisted_rule_count(&text, "warden"), 0);
    }

    #[test]
    fn test_blacklist_set_elements() {
        let entries = vec![
            BlacklistEntry::new("203.0.113.7/32".parse().unwrap(), None),
            BlacklistEntry::new("198.51.100.0/24".parse().unwrap(), None),
        ];
        let text = compile(Mode::Blacklist, &[], &entries, &cfg());
        assert!(text.contains("elements = { 203.0.113.7/32, 198.51.100.0/24 }"));
        assert!(text.contains("ip saddr @blacklist drop"));
        assert!(text.contains("priority -300"));
    }

    #[test]
    fn test_empty_blacklist_emits_no_elements_line() {
        let text = compile(Mode::Blacklist, &[], &[], &cfg());
        assert!(!text.contains("elements ="));
    }

    #[test]
    fn test_inactive_blacklist_entries_excluded() {
        let mut entry = BlacklistEntry::new("203.0.113.7/32".parse().unwrap(), None);
        entry.active = false;
        let text = compile(Mode::Blacklist, &[], &[entry], &cfg());
        assert!(!text.contains("203.0.113.7"));
    }

    #[test]
    fn test_whitelist_default_drop_and_lockout_guard() {
        let text = compile(Mode::Whitelist, &[], &[], &cfg());
        assert!(text.contains("type filter hook input priority 0; policy drop;"));
        for port in cfg().control_ports {
            assert!(text.contains(&format!("tcp dport {port} accept")));
        }
        for net in cfg().trusted_networks {
            assert!(text.contains(&format!("saddr {net} accept")));
        }
    }

    #[test]
    fn test_whitelist_has_no_raw_table() {
        let text = compile(Mode::Whitelist, &[], &[], &cfg());
        assert!(!text.contains("table inet raw"));
    }

    #[test]
    fn test_persisted_count_matches_live_compiled_lines() {
        // Both paths compile through build_conditions; the app-chain count
        // must equal the number of active rules regardless of template noise
        // (control ports and trusted networks also contain dport/saddr).
        let rules = vec![
            rule_with("a", Protocol::Tcp, Some(22), Some("10.0.0.0/24"), None),
            rule_with("b", Protocol::Udp, Some(53), None, Some("10.1.0.0/16")),
            rule_with("c", Protocol::Any, None, Some("192.0.2.9/32"), None),
        ];
        for mode in [Mode::Blacklist, Mode::Whitelist] {
            let text = compile(mode, &rules, &[], &cfg());
            assert_eq!(persisted_rule_count(&text, "warden"), rules.len());
        }
    }

    #[test]
    fn test_jump_precedes_container_allowances() {
        let text = compile(Mode::Blacklist, &[], &[], &cfg());
        let jump = text.find("jump warden").unwrap();
        let container = text.find("container bridge networks").unwrap();
        assert!(jump < container);
    }
}
