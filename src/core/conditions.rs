//! Rule condition building and live-line token matching
//!
//! Two responsibilities live here because they must never drift apart:
//!
//! 1. Compiling a [`Rule`] into its ordered nftables match conditions plus
//!    the mode-derived effective action ([`build_conditions`]). This is the
//!    single source of truth used by both the live-apply path and the
//!    persisted-config compiler — if the two paths produced different text,
//!    reconciliation would falsely detect (or miss) drift.
//! 2. Matching those conditions against the string-shaped output of
//!    `nft -a list chain` to recover a kernel rule handle. Matching is done
//!    over whitespace-delimited tokens with contiguous-subsequence
//!    containment, never raw substring search: `10.0.0.1` is a textual
//!    prefix of `10.0.0.11`, and substring matching would delete the wrong
//!    rule.

use crate::core::rule::{Action, Mode, Rule};
use ipnetwork::IpNetwork;

/// Verdict tokens that terminate a live rule line.
///
/// `reject` is never generated by this engine but is recognized so that a
/// foreign rule line is still classified as a rule (and not a header) when
/// scanning chain listings.
pub const TERMINAL_ACTIONS: [&str; 3] = ["accept", "drop", "reject"];

/// Match tokens that identify a line as a filtering rule when counting.
pub const MATCH_TOKENS: [&str; 3] = ["saddr", "daddr", "dport"];

/// The compiled conditions of one rule under one mode.
///
/// `matchers` holds one string per condition (e.g. `"ip saddr 10.0.0.0/24"`),
/// in a fixed order: source, destination, protocol+port. The terminal action
/// comes last. Deterministic for a given `(Rule, Mode)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConditions {
    pub matchers: Vec<String>,
    pub action: Action,
}

impl RuleConditions {
    /// Flattens the conditions into the argument tokens passed to `nft`.
    ///
    /// Each matcher is split on whitespace so the command is built as an
    /// argument vector, never a shell string.
    pub fn arg_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self
            .matchers
            .iter()
            .flat_map(|m| m.split_whitespace().map(str::to_string))
            .collect();
        tokens.push(self.action.as_str().to_string());
        tokens
    }

    /// Renders the rule as a single nftables statement line.
    pub fn to_line(&self) -> String {
        if self.matchers.is_empty() {
            self.action.as_str().to_string()
        } else {
            format!("{} {}", self.matchers.join(" "), self.action.as_str())
        }
    }
}

/// Derives the action actually applied for the given mode.
///
/// The stored action field records the author's intent; enforcement is
/// mode-dependent: blacklist mode compiles every rule as `drop`, whitelist
/// mode compiles every rule as `accept`. This is required behavior, not an
/// incidental simplification.
pub const fn effective_action(mode: Mode) -> Action {
    match mode {
        Mode::Blacklist => Action::Drop,
        Mode::Whitelist => Action::Accept,
    }
}

/// Whether a network denotes "any address" and must be omitted from the
/// compiled conditions (`0.0.0.0/0`, `::/0`).
pub fn is_wildcard(network: &IpNetwork) -> bool {
    network.prefix() == 0
}

/// Returns the address-family keyword for a network (`ip` or `ip6`).
fn family_keyword(network: &IpNetwork) -> &'static str {
    if network.is_ipv4() { "ip" } else { "ip6" }
}

/// Compiles one rule into its ordered condition list and effective action.
///
/// Conditions are emitted in a fixed order:
/// 1. source address match (omitted for wildcard/absent sources)
/// 2. destination address match (omitted for wildcard/absent destinations)
/// 3. protocol + destination port (only when the protocol carries ports and
///    a port spec is present)
///
/// Pure and deterministic; no I/O.
pub fn build_conditions(rule: &Rule, mode: Mode) -> RuleConditions {
    let mut matchers = Vec::with_capacity(3);

    if let Some(source) = rule.source
        && !is_wildcard(&source)
    {
        matchers.push(format!("{} saddr {source}", family_keyword(&source)));
    }

    if let Some(destination) = rule.destination
        && !is_wildcard(&destination)
    {
        matchers.push(format!(
            "{} daddr {destination}",
            family_keyword(&destination)
        ));
    }

    if let Some(ports) = rule.ports
        && rule.protocol.carries_ports()
    {
        matchers.push(format!("{} dport {ports}", rule.protocol.as_str()));
    }

    RuleConditions {
        matchers,
        action: effective_action(mode),
    }
}

/// Splits a line into whitespace-delimited tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Whether `needle` appears as a contiguous run inside `haystack`.
pub fn contains_sequence<T: PartialEq>(haystack: &[T], needle: &[T]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Checks whether a live chain line is this rule.
///
/// The line matches when every condition's token sequence appears as a
/// contiguous run among the line's tokens, the effective action appears as
/// a standalone token, and the line carries at least one recognized verdict
/// token (which rejects headers, comments and chain declarations).
pub fn line_matches(line: &str, conditions: &RuleConditions) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }

    let line_tokens = tokenize(trimmed);

    for matcher in &conditions.matchers {
        let expected = tokenize(matcher);
        if !contains_sequence(&line_tokens, &expected) {
            return false;
        }
    }

    if !line_tokens.contains(&conditions.action.as_str()) {
        return false;
    }

    // An actual rule line always carries a verdict; headers never do.
    TERMINAL_ACTIONS
        .iter()
        .any(|action| line_tokens.contains(action))
}

/// Extracts the kernel-assigned handle from a `nft -a list` rule line.
///
/// Handle annotations trail the rule as `# handle N`; the handle token is
/// located by position, not by substring, so a comment merely containing
/// the word "handle" is not misread.
pub fn parse_handle(line: &str) -> Option<u64> {
    let tokens = tokenize(line);
    tokens
        .windows(2)
        .rev()
        .find(|w| w[0] == "handle")
        .and_then(|w| w[1].parse().ok())
}

/// Whether a line counts as a filtering rule for reconciliation purposes.
///
/// A rule line carries at least one recognized match token and a terminal
/// action token. Exact token comparison is used, not substring containment,
/// so a comment mentioning "drop" does not count.
pub fn is_rule_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return false;
    }
    let tokens = tokenize(trimmed);
    let has_match = MATCH_TOKENS.iter().any(|m| tokens.contains(m));
    let has_action = TERMINAL_ACTIONS.iter().any(|a| tokens.contains(a));
    has_match && has_action
}

/// Counts filtering rule lines in a listing or config fragment.
pub fn count_rule_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> usize {
    lines.into_iter().filter(|l| is_rule_line(l)).count()
}

/// Returns the body lines of a named chain inside an nftables config or
/// listing, excluding the `chain` header and the closing brace.
///
/// Brace depth is tracked per line, so nested blocks inside the chain (none
/// are generated today, but `nft` output may contain anonymous sets with
/// braces on one line) do not end the block early.
pub fn chain_block<'a>(text: &'a str, chain: &str) -> Vec<&'a str> {
    let mut lines = text.lines();
    for line in lines.by_ref() {
        let tokens = tokenize(line);
        if tokens.len() >= 2 && tokens[0] == "chain" && tokens[1] == chain {
            break;
        }
    }

    let mut body = Vec::new();
    let mut depth = 1i32;
    for line in lines {
        depth += i32::try_from(line.matches('{').count()).unwrap_or(0);
        depth -= i32::try_from(line.matches('}').count()).unwrap_or(0);
        if depth <= 0 {
            break;
        }
        body.push(line);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::{PortRange, Protocol};
    use crate::core::test_helpers::rule_with;

    #[test]
    fn test_wildcard_source_omitted() {
        let rule = rule_with("r", Protocol::Tcp, Some(22), Some("0.0.0.0/0"), None);
        let conds = build_conditions(&rule, Mode::Whitelist);
        assert_eq!(conds.matchers, vec!["tcp dport 22".to_string()]);
    }

    #[test]
    fn test_absent_source_omitted() {
        let rule = rule_with("r", Protocol::Tcp, Some(443), None, None);
        let conds = build_conditions(&rule, Mode::Whitelist);
        assert!(conds.matchers.iter().all(|m| !m.contains("saddr")));
    }

    #[test]
    fn test_condition_order_is_fixed() {
        let rule = rule_with(
            "r",
            Protocol::Udp,
            Some(53),
            Some("10.0.0.0/24"),
            Some("192.168.1.1/32"),
        );
        let conds = build_conditions(&rule, Mode::Blacklist);
        assert_eq!(
            conds.matchers,
            vec![
                "ip saddr 10.0.0.0/24".to_string(),
                "ip daddr 192.168.1.1/32".to_string(),
                "udp dport 53".to_string(),
            ]
        );
    }

    #[test]
    fn test_mode_forces_action() {
        let mut rule = rule_with("r", Protocol::Tcp, Some(22), Some("10.0.0.1/32"), None);
        rule.action = Action::Accept;
        assert_eq!(
            build_conditions(&rule, Mode::Blacklist).action,
            Action::Drop
        );
        rule.action = Action::Drop;
        assert_eq!(
            build_conditions(&rule, Mode::Whitelist).action,
            Action::Accept
        );
    }

    #[test]
    fn test_ports_ignored_for_icmp() {
        let mut rule = rule_with("r", Protocol::Icmp, None, Some("10.0.0.1/32"), None);
        rule.ports = Some(PortRange::single(22));
        let conds = build_conditions(&rule, Mode::Blacklist);
        assert!(conds.matchers.iter().all(|m| !m.contains("dport")));
    }

    #[test]
    fn test_ipv6_family_keyword() {
        let rule = rule_with("r", Protocol::Any, None, Some("2001:db8::/32"), None);
        let conds = build_conditions(&rule, Mode::Whitelist);
        assert_eq!(conds.matchers, vec!["ip6 saddr 2001:db8::/32".to_string()]);
    }

    #[test]
    fn test_arg_tokens_flatten() {
        let rule = rule_with("r", Protocol::Tcp, Some(22), Some("10.0.0.0/24"), None);
        let conds = build_conditions(&rule, Mode::Blacklist);
        assert_eq!(
            conds.arg_tokens(),
            vec!["ip", "saddr", "10.0.0.0/24", "tcp", "dport", "22", "drop"]
        );
    }

    #[test]
    fn test_bare_action_line() {
        let rule = rule_with("r", Protocol::Any, None, None, None);
        let conds = build_conditions(&rule, Mode::Blacklist);
        assert_eq!(conds.to_line(), "drop");
    }

    #[test]
    fn test_prefix_address_does_not_match() {
        // The classic false positive: 10.0.0.1 is a substring of 10.0.0.11
        let rule = rule_with("r", Protocol::Any, None, Some("10.0.0.11/32"), None);
        let conds = build_conditions(&rule, Mode::Blacklist);
        assert!(!line_matches("ip saddr 10.0.0.1/32 drop # handle 4", &conds));
        assert!(line_matches("ip saddr 10.0.0.11/32 drop # handle 5", &conds));
    }

    #[test]
    fn test_header_lines_never_match() {
        let rule = rule_with("r", Protocol::Any, None, None, None);
        let conds = build_conditions(&rule, Mode::Blacklist);
        assert!(!line_matches("chain warden {", &conds));
        assert!(!line_matches("# drop everything", &conds));
        assert!(!line_matches("", &conds));
    }

    #[test]
    fn test_action_must_be_standalone_token() {
        let rule = rule_with("r", Protocol::Any, None, Some("10.0.0.1/32"), None);
        let conds = build_conditions(&rule, Mode::Blacklist); // action: drop
        // "accept" line with the same source is a different rule
        assert!(!line_matches("ip saddr 10.0.0.1/32 accept # handle 2", &conds));
    }

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("ip saddr 10.0.0.1 drop # handle 42"), Some(42));
        assert_eq!(parse_handle("tcp dport 22 accept"), None);
        assert_eq!(parse_handle("handle"), None);
    }

    #[test]
    fn test_count_rule_lines_ignores_comments() {
        let lines = [
            "# a comment that says drop",
            "ip saddr 10.0.0.1/32 drop",
            "tcp dport 22 accept",
            "type filter hook input priority 0; policy accept;",
            "return",
        ];
        assert_eq!(count_rule_lines(lines), 2);
    }

    #[test]
    fn test_chain_block_extraction() {
        let text = "table inet filter {\n\
                    \tchain input {\n\
                    \t\ttcp dport 22 accept\n\
                    \t}\n\
                    \tchain warden {\n\
                    \t\tip saddr 10.0.0.1/32 drop\n\
                    \t\tip saddr 10.0.0.2/32 drop\n\
                    \t}\n\
                    }\n";
        let body = chain_block(text, "warden");
        assert_eq!(body.len(), 2);
        assert_eq!(count_rule_lines(body), 2);
    }

    #[test]
    fn test_chain_block_missing_chain() {
        assert!(chain_block("table inet filter {\n}\n", "warden").is_empty());
    }

    mod matcher_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn spliced_needle_is_found(
                hay in proptest::collection::vec("[a-z0-9.]{1,8}", 0..12),
                needle in proptest::collection::vec("[a-z0-9.]{1,8}", 1..4),
                split in 0usize..12,
            ) {
                let split = split.min(hay.len());
                let mut spliced = hay[..split].to_vec();
                spliced.extend(needle.iter().cloned());
                spliced.extend(hay[split..].iter().cloned());
                let spliced_refs: Vec<&str> = spliced.iter().map(String::as_str).collect();
                let needle_refs: Vec<&str> = needle.iter().map(String::as_str).collect();
                prop_assert!(contains_sequence(&spliced_refs, &needle_refs));
            }

            #[test]
            fn absent_token_never_matches(
                hay in proptest::collection::vec("[a-z]{1,6}", 0..12),
            ) {
                // "10.0.0.1" can never equal a purely alphabetic token
                let hay_refs: Vec<&str> = hay.iter().map(String::as_str).collect();
                prop_assert!(!contains_sequence(&hay_refs, &["10.0.0.1"]));
            }
        }
    }
}
