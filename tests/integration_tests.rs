//! Integration tests for netwarden
//!
//! These drive the engine through its public API with a scripted command
//! runner, so no test requires privileges or a real nftables install. The
//! focus is end-to-end behavior: compile → persist → count parity, handle
//! resolution through the reconciler, and the persisted-file write/backup
//! contract.

use netwarden::core::conditions::{self, build_conditions};
use netwarden::core::nft::{CmdOutput, CommandRunner, Nft};
use netwarden::core::reconciler::LiveReconciler;
use netwarden::core::{compiler, sync};
use netwarden::storage::{JsonStore, PolicyStore};
use netwarden::{EngineConfig, Mode, PortRange, Protocol, Rule};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted runner: canned responses keyed by invocation prefix, every
/// call recorded. Unmatched invocations succeed with empty output.
#[derive(Debug, Clone, Default)]
struct StubRunner {
    responses: Arc<Mutex<Vec<(String, CmdOutput)>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StubRunner {
    fn respond(&self, prefix: &str, stdout: &str) {
        self.responses.lock().unwrap().push((
            prefix.to_string(),
            CmdOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
                missing: false,
            },
        ));
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for StubRunner {
    async fn run(&self, program: &str, args: &[&str], _timeout: Option<Duration>) -> CmdOutput {
        let joined = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        self.calls.lock().unwrap().push(joined.clone());

        let responses = self.responses.lock().unwrap();
        for (prefix, output) in responses.iter() {
            if joined.starts_with(prefix.as_str()) {
                return output.clone();
            }
        }
        CmdOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            missing: false,
        }
    }
}

fn test_rule(name: &str, protocol: Protocol, port: Option<u16>, source: Option<&str>) -> Rule {
    let mut rule = Rule::named(name);
    rule.protocol = protocol;
    rule.ports = port.map(PortRange::single);
    rule.source = source.map(|s| s.parse().unwrap());
    rule
}

// ── compile → parse round trip ───────────────────────────────────────────

#[test]
fn compiled_config_round_trips_non_wildcard_fields() {
    let cfg = EngineConfig::default();
    let rules = vec![
        test_rule("wildcard", Protocol::Tcp, Some(22), Some("0.0.0.0/0")),
        test_rule("scoped", Protocol::Tcp, Some(443), Some("10.1.2.0/24")),
    ];

    let text = compiler::compile(Mode::Whitelist, &rules, &[], &cfg);
    let body = conditions::chain_block(&text, &cfg.app_chain);

    let rule_lines: Vec<&str> = body
        .iter()
        .copied()
        .filter(|l| conditions::is_rule_line(l))
        .collect();
    assert_eq!(rule_lines.len(), 2);

    // the wildcard source must not appear as an address match anywhere in
    // the application chain
    let wildcard_line = rule_lines
        .iter()
        .find(|l| l.contains("dport 22"))
        .expect("wildcard rule compiled");
    assert!(!wildcard_line.contains("saddr"));

    let scoped_line = rule_lines
        .iter()
        .find(|l| l.contains("dport 443"))
        .expect("scoped rule compiled");
    let tokens = conditions::tokenize(scoped_line);
    assert!(conditions::contains_sequence(
        &tokens,
        &["ip", "saddr", "10.1.2.0/24"]
    ));
}

#[test]
fn mode_forces_terminal_action_in_both_paths() {
    let cfg = EngineConfig::default();
    let rule = test_rule("r", Protocol::Tcp, Some(22), Some("10.0.0.0/24"));

    for (mode, verdict) in [(Mode::Blacklist, "drop"), (Mode::Whitelist, "accept")] {
        // live path
        let conds = build_conditions(&rule, mode);
        assert_eq!(conds.arg_tokens().last().map(String::as_str), Some(verdict));

        // persisted path
        let text = compiler::compile(mode, std::slice::from_ref(&rule), &[], &cfg);
        let body = conditions::chain_block(&text, &cfg.app_chain);
        let line = body
            .iter()
            .find(|l| conditions::is_rule_line(l))
            .expect("compiled rule line");
        assert!(line.trim_end().ends_with(verdict));
    }
}

#[test]
fn unsupported_mode_string_fails_loudly() {
    let err = Mode::parse("permissive").unwrap_err();
    assert!(err.to_string().contains("unsupported firewall mode"));
}

// ── reconciler handle resolution through the public API ──────────────────

#[tokio::test]
async fn delete_resolves_handle_from_annotated_listing() {
    let runner = StubRunner::default();

    // bootstrap probes: everything already exists
    runner.respond("nft list tables", "table inet filter");
    runner.respond(
        "nft list chain inet filter input",
        "table inet filter {\n\tchain input {\n\t\tjump warden\n\t}\n}",
    );
    // annotated listing with two near-identical addresses
    runner.respond(
        "nft -a list chain inet filter warden",
        "table inet filter {\n\
         \tchain warden {\n\
         \t\tip saddr 10.0.0.11/32 drop # handle 7\n\
         \t\tip saddr 10.0.0.1/32 drop # handle 9\n\
         \t}\n\
         }",
    );

    let cfg = Arc::new(EngineConfig::default());
    let nft = Nft::new(runner.clone(), &cfg);
    let reconciler = LiveReconciler::new(nft, cfg);

    let rule = test_rule("target", Protocol::Any, None, Some("10.0.0.1/32"));
    reconciler.delete(&rule, Mode::Blacklist).await.unwrap();

    // handle 9, not 7: token matching must not fall for the prefix address
    let calls = runner.calls();
    assert!(calls
        .iter()
        .any(|c| c == "nft delete rule inet filter warden handle 9"));
    assert!(!calls
        .iter()
        .any(|c| c == "nft delete rule inet filter warden handle 7"));
}

#[tokio::test]
async fn add_issues_argument_vector_command() {
    let runner = StubRunner::default();
    runner.respond("nft list tables", "table inet filter");
    runner.respond(
        "nft list chain inet filter input",
        "table inet filter {\n\tchain input {\n\t\tjump warden\n\t}\n}",
    );

    let cfg = Arc::new(EngineConfig::default());
    let nft = Nft::new(runner.clone(), &cfg);
    let reconciler = LiveReconciler::new(nft, cfg);

    let rule = test_rule("ssh", Protocol::Tcp, Some(22), Some("192.0.2.0/24"));
    reconciler.add(&rule, Mode::Whitelist).await.unwrap();

    assert!(runner.calls().iter().any(|c| c
        == "nft add rule inet filter warden ip saddr 192.0.2.0/24 tcp dport 22 accept"));
}

// ── persisted store + config file flow ───────────────────────────────────

#[tokio::test]
async fn store_to_persisted_file_flow() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path().join("policy.json")).unwrap();

    store
        .insert_rule(test_rule("ssh", Protocol::Tcp, Some(22), Some("10.0.0.0/24")))
        .unwrap();
    store
        .insert_rule(test_rule("dns", Protocol::Udp, Some(53), None))
        .unwrap();
    store.set_mode(Mode::Blacklist).unwrap();

    let cfg = EngineConfig {
        nftables_config_path: dir.path().join("nftables.conf"),
        ..EngineConfig::default()
    };

    let text = compiler::compile(
        store.mode().unwrap(),
        &store.active_rules().unwrap(),
        &store.active_blacklist().unwrap(),
        &cfg,
    );
    assert_eq!(compiler::persisted_rule_count(&text, &cfg.app_chain), 2);

    // first write: no backup; second write: exactly one
    assert!(sync::write_persisted(&cfg.nftables_config_path, &text)
        .await
        .unwrap()
        .is_none());
    let backup = sync::write_persisted(&cfg.nftables_config_path, &text)
        .await
        .unwrap()
        .expect("backup of the previous file");
    assert!(backup.to_string_lossy().contains(".backup."));

    let written = std::fs::read_to_string(&cfg.nftables_config_path).unwrap();
    assert_eq!(written, text);
}

#[test]
fn deactivated_rules_drop_out_of_compiled_output() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path().join("policy.json")).unwrap();
    let cfg = EngineConfig::default();

    store
        .insert_rule(test_rule("ssh", Protocol::Tcp, Some(22), Some("10.0.0.0/24")))
        .unwrap();
    store.deactivate_rule("ssh").unwrap();

    let text = compiler::compile(
        Mode::Blacklist,
        &store.active_rules().unwrap(),
        &[],
        &cfg,
    );
    assert_eq!(compiler::persisted_rule_count(&text, &cfg.app_chain), 0);
    // the record itself survives for history
    assert!(store.find_rule("ssh").unwrap().is_some());
}
