//! Shared test utilities for core module tests
//!
//! Provides rule builders and an in-memory nft emulation so tests never
//! touch real nftables or require privileges. Only compiled in test mode.

use crate::core::nft::{CmdOutput, CommandRunner};
use crate::core::rule::{PortRange, Protocol, Rule};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Creates a test rule with the fields that matter for condition building.
///
/// `source`/`destination` are CIDR strings (`"10.0.0.0/24"`); bare IPs get
/// a host prefix from the parser.
pub fn rule_with(
    name: &str,
    protocol: Protocol,
    port: Option<u16>,
    source: Option<&str>,
    destination: Option<&str>,
) -> Rule {
    let mut rule = Rule::named(name);
    rule.protocol = protocol;
    rule.ports = port.map(PortRange::single);
    rule.source = source.map(|s| s.parse().expect("test source network"));
    rule.destination = destination.map(|d| d.parse().expect("test destination network"));
    rule
}

/// One live rule inside the emulated kernel state.
#[derive(Debug, Clone)]
pub struct FakeRule {
    pub text: String,
    pub handle: u64,
}

/// Mutable state of the nft emulation.
#[derive(Debug, Default)]
pub struct FakeState {
    pub tables: BTreeSet<String>,
    pub chains: BTreeMap<(String, String), Vec<FakeRule>>,
    pub sets: BTreeMap<(String, String), Vec<String>>,
    pub next_handle: u64,
    /// Every invocation, program plus args joined with spaces
    pub calls: Vec<String>,
    /// Any invocation whose joined form contains one of these fails
    pub fail_contains: Vec<String>,
    /// Programs that report "binary not found"
    pub missing_binaries: BTreeSet<String>,
    /// When set, `-a` listings omit handle annotations (simulates tool
    /// builds that only annotate chain headers)
    pub omit_handles: bool,
}

/// In-memory emulation of the nft command surface.
///
/// Understands the exact command forms the engine issues (table/chain/set
/// creation, rule add/insert/delete/list/flush, element add/delete) and
/// keeps kernel-like state, including monotonically increasing rule
/// handles. Non-nft programs (`ss`, `conntrack`, `systemctl`) succeed with
/// empty output unless configured otherwise.
#[derive(Debug, Clone, Default)]
pub struct FakeNft {
    state: Arc<Mutex<FakeState>>,
}

impl FakeNft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake nft state")
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn fail_when(&self, needle: &str) {
        self.state().fail_contains.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().fail_contains.clear();
    }

    pub fn set_missing(&self, program: &str) {
        self.state().missing_binaries.insert(program.to_string());
    }

    pub fn chain_rules(&self, table: &str, chain: &str) -> Vec<String> {
        self.state()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .map(|rules| rules.iter().map(|r| r.text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_elements(&self, table: &str, set: &str) -> Vec<String> {
        self.state()
            .sets
            .get(&(table.to_string(), set.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Injects a live rule directly, bypassing the engine (simulates an
    /// external operator or pre-restart state).
    pub fn seed_rule(&self, table: &str, chain: &str, text: &str) {
        let mut state = self.state();
        state.next_handle += 1;
        let handle = state.next_handle;
        state
            .chains
            .entry((table.to_string(), chain.to_string()))
            .or_default()
            .push(FakeRule {
                text: text.to_string(),
                handle,
            });
    }

    fn dispatch_nft(state: &mut FakeState, args: &[&str]) -> CmdOutput {
        let mut args = args.to_vec();
        let with_handles = args.first() == Some(&"-a");
        if with_handles {
            args.remove(0);
        }

        match args.as_slice() {
            ["list", "tables"] => {
                let stdout = state
                    .tables
                    .iter()
                    .map(|t| format!("table inet {t}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                ok(stdout)
            }
            ["list", "chain", "inet", table, chain] => {
                let key = ((*table).to_string(), (*chain).to_string());
                match state.chains.get(&key) {
                    Some(rules) => ok(render_chain(
                        table,
                        chain,
                        rules,
                        with_handles && !state.omit_handles,
                    )),
                    None => err("Error: No such file or directory"),
                }
            }
            ["list", "set", "inet", table, set] => {
                let key = ((*table).to_string(), (*set).to_string());
                if state.sets.contains_key(&key) {
                    ok(format!("table inet {table} {{\n\tset {set} {{\n\t}}\n}}"))
                } else {
                    err("Error: No such file or directory")
                }
            }
            ["list", "ruleset"] => {
                let mut stdout = String::new();
                for table in &state.tables {
                    stdout.push_str(&format!("table inet {table} {{\n"));
                    for ((t, chain), rules) in &state.chains {
                        if t == table {
                            stdout.push_str(&format!("\tchain {chain} {{\n"));
                            for rule in rules {
                                stdout.push_str(&format!("\t\t{}\n", rule.text));
                            }
                            stdout.push_str("\t}\n");
                        }
                    }
                    stdout.push_str("}\n");
                }
                ok(stdout)
            }
            ["add", "table", "inet", table] => {
                state.tables.insert((*table).to_string());
                ok(String::new())
            }
            ["add", "chain", "inet", table, chain, ..] => {
                if !state.tables.contains(*table) {
                    return err("Error: No such file or directory");
                }
                state
                    .chains
                    .entry(((*table).to_string(), (*chain).to_string()))
                    .or_default();
                ok(String::new())
            }
            ["add", "set", "inet", table, set, ..] => {
                if !state.tables.contains(*table) {
                    return err("Error: No such file or directory");
                }
                state
                    .sets
                    .entry(((*table).to_string(), (*set).to_string()))
                    .or_default();
                ok(String::new())
            }
            ["add", "element", "inet", table, set, "{", element, "}"] => {
                let key = ((*table).to_string(), (*set).to_string());
                match state.sets.get_mut(&key) {
                    Some(elements) => {
                        if elements.iter().any(|e| e == element) {
                            err("Error: Could not process rule: File exists")
                        } else {
                            elements.push((*element).to_string());
                            ok(String::new())
                        }
                    }
                    None => err("Error: No such file or directory"),
                }
            }
            ["delete", "element", "inet", table, set, "{", element, "}"] => {
                let key = ((*table).to_string(), (*set).to_string());
                match state.sets.get_mut(&key) {
                    Some(elements) => match elements.iter().position(|e| e == element) {
                        Some(index) => {
                            elements.remove(index);
                            ok(String::new())
                        }
                        None => err("Error: Could not process rule: No such file or directory"),
                    },
                    None => err("Error: No such file or directory"),
                }
            }
            ["add", "rule", "inet", table, chain, rest @ ..] => {
                let key = ((*table).to_string(), (*chain).to_string());
                state.next_handle += 1;
                let handle = state.next_handle;
                match state.chains.get_mut(&key) {
                    Some(rules) => {
                        rules.push(FakeRule {
                            text: rest.join(" "),
                            handle,
                        });
                        ok(String::new())
                    }
                    None => err("Error: No such file or directory"),
                }
            }
            ["insert", "rule", "inet", table, chain, "position", position, rest @ ..] => {
                let key = ((*table).to_string(), (*chain).to_string());
                state.next_handle += 1;
                let handle = state.next_handle;
                let position: usize = position.parse().unwrap_or(0);
                match state.chains.get_mut(&key) {
                    Some(rules) => {
                        let index = position.min(rules.len());
                        rules.insert(
                            index,
                            FakeRule {
                                text: rest.join(" "),
                                handle,
                            },
                        );
                        ok(String::new())
                    }
                    None => err("Error: No such file or directory"),
                }
            }
            ["delete", "rule", "inet", table, chain, "handle", handle] => {
                let key = ((*table).to_string(), (*chain).to_string());
                let handle: u64 = handle.parse().unwrap_or(0);
                match state.chains.get_mut(&key) {
                    Some(rules) => match rules.iter().position(|r| r.handle == handle) {
                        Some(index) => {
                            rules.remove(index);
                            ok(String::new())
                        }
                        None => err("Error: Could not process rule: No such file or directory"),
                    },
                    None => err("Error: No such file or directory"),
                }
            }
            ["delete", "rule", "inet", table, chain, rest @ ..] => {
                let key = ((*table).to_string(), (*chain).to_string());
                let text = rest.join(" ");
                match state.chains.get_mut(&key) {
                    Some(rules) => match rules.iter().position(|r| r.text == text) {
                        Some(index) => {
                            rules.remove(index);
                            ok(String::new())
                        }
                        None => err("Error: Could not process rule: No such file or directory"),
                    },
                    None => err("Error: No such file or directory"),
                }
            }
            ["flush", "chain", "inet", table, chain] => {
                let key = ((*table).to_string(), (*chain).to_string());
                match state.chains.get_mut(&key) {
                    Some(rules) => {
                        rules.clear();
                        ok(String::new())
                    }
                    None => err("Error: No such file or directory"),
                }
            }
            ["-f", _path] => ok(String::new()),
            _ => err("Error: unrecognized command"),
        }
    }
}

impl CommandRunner for FakeNft {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        _timeout: Option<std::time::Duration>,
    ) -> CmdOutput {
        let mut state = self.state();

        let joined = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        state.calls.push(joined.clone());

        if state.missing_binaries.contains(program) {
            return CmdOutput {
                code: None,
                stdout: String::new(),
                stderr: format!("{program}: command not found"),
                missing: true,
            };
        }

        if state.fail_contains.iter().any(|n| joined.contains(n.as_str())) {
            return err("Error: injected failure");
        }

        match program {
            "ss" | "conntrack" | "systemctl" => ok(String::new()),
            _ => Self::dispatch_nft(&mut state, args),
        }
    }
}

fn render_chain(table: &str, chain: &str, rules: &[FakeRule], with_handles: bool) -> String {
    let mut out = format!("table inet {table} {{\n\tchain {chain} {{\n");
    for rule in rules {
        if with_handles {
            out.push_str(&format!("\t\t{} # handle {}\n", rule.text, rule.handle));
        } else {
            out.push_str(&format!("\t\t{}\n", rule.text));
        }
    }
    out.push_str("\t}\n}\n");
    out
}

fn ok(stdout: String) -> CmdOutput {
    CmdOutput {
        code: Some(0),
        stdout,
        stderr: String::new(),
        missing: false,
    }
}

fn err(stderr: &str) -> CmdOutput {
    CmdOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
        missing: false,
    }
}
