//! External command invocation surface
//!
//! Everything the engine does to the kernel goes through the `nft` binary
//! (plus `ss`/`conntrack` for session termination), consumed exclusively as
//! argument-vector process invocations with captured stdout/stderr/exit
//! code — never through a shell string.
//!
//! [`CommandRunner`] is the seam: the production [`SystemRunner`] spawns
//! real processes via `tokio::process` with a fixed 30-second timeout for
//! rule-table operations; tests substitute an in-memory emulation so no test
//! ever touches real nftables or requires privileges.

use crate::config::EngineConfig;
use crate::core::error::{Error, Result};
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

/// Fixed timeout for rule-table operations.
///
/// Session-kill and conntrack calls run without one; they are expected to be
/// near-instant and are best-effort anyway.
pub const NFT_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable overriding the nft binary path (test seam).
pub const NFT_COMMAND_ENV: &str = "NETWARDEN_NFT_COMMAND";

/// Captured result of one external command invocation.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    /// Exit code; `None` on timeout or spawn failure
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// The binary itself was not found — a soft failure for the optional
    /// session-termination tools
    pub missing: bool,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes external commands as argument vectors.
///
/// Implementations must not interpret arguments through a shell.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Option<Duration>,
    ) -> impl Future<Output = CmdOutput> + Send;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> CmdOutput {
        debug!(program, ?args, "spawning external command");

        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return CmdOutput {
                        code: None,
                        stdout: String::new(),
                        stderr: format!(
                            "{program} timed out after {} seconds",
                            limit.as_secs()
                        ),
                        missing: false,
                    };
                }
            },
            None => command.output().await,
        };

        match output {
            Ok(output) => CmdOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                missing: false,
            },
            Err(e) => CmdOutput {
                code: None,
                stdout: String::new(),
                stderr: format!("{program}: {e}"),
                missing: e.kind() == std::io::ErrorKind::NotFound,
            },
        }
    }
}

/// Typed client for the nft invocation surface.
///
/// Thin wrappers over the command forms the engine needs: table/chain/set
/// creation, rule add/insert/delete/list/flush, set element add/delete, and
/// full-ruleset load. Callers own the decision of which failures are hard
/// errors; existence probes interpret the exit code themselves.
#[derive(Debug, Clone)]
pub struct Nft<R> {
    runner: R,
    program: String,
}

impl<R: CommandRunner> Nft<R> {
    pub fn new(runner: R, cfg: &EngineConfig) -> Self {
        let program = std::env::var(NFT_COMMAND_ENV).unwrap_or_else(|_| cfg.nft_path.clone());
        Self { runner, program }
    }

    /// Access to the underlying runner, for the non-nft tools (`ss`,
    /// `conntrack`, `systemctl`) that share the same invocation discipline.
    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Runs nft with the rule-table timeout, returning the raw output.
    pub async fn run(&self, args: &[&str]) -> CmdOutput {
        self.runner.run(&self.program, args, Some(NFT_TIMEOUT)).await
    }

    /// Runs nft and converts a non-zero exit into a structured error.
    pub async fn run_checked(&self, context: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = self.run(args).await;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::from_output(context, &output))
        }
    }

    pub async fn table_exists(&self, table: &str) -> bool {
        let output = self.run(&["list", "tables"]).await;
        if !output.success() {
            return false;
        }
        output.stdout.lines().any(|line| {
            let tokens = crate::core::conditions::tokenize(line);
            tokens.len() >= 3 && tokens[0] == "table" && tokens[2] == table
        })
    }

    pub async fn add_table(&self, table: &str) -> Result<()> {
        self.run_checked("add table", &["add", "table", "inet", table])
            .await
            .map(|_| ())
    }

    pub async fn chain_exists(&self, table: &str, chain: &str) -> bool {
        self.run(&["list", "chain", "inet", table, chain])
            .await
            .success()
    }

    /// Creates a regular (non-base) chain.
    pub async fn add_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run_checked("add chain", &["add", "chain", "inet", table, chain])
            .await
            .map(|_| ())
    }

    /// Creates a base chain attached to a netfilter hook.
    pub async fn add_hook_chain(
        &self,
        table: &str,
        chain: &str,
        hook: &str,
        priority: i32,
        policy: &str,
    ) -> Result<()> {
        let priority = format!("{priority};");
        let policy = format!("{policy};");
        self.run_checked(
            "add base chain",
            &[
                "add",
                "chain",
                "inet",
                table,
                chain,
                "{",
                "type",
                "filter",
                "hook",
                hook,
                "priority",
                priority.as_str(),
                "policy",
                policy.as_str(),
                "}",
            ],
        )
        .await
        .map(|_| ())
    }

    pub async fn set_exists(&self, table: &str, set: &str) -> bool {
        self.run(&["list", "set", "inet", table, set]).await.success()
    }

    /// Creates an interval-typed IPv4 address set with auto-merge.
    pub async fn add_interval_set(&self, table: &str, set: &str) -> Result<()> {
        self.run_checked(
            "add set",
            &[
                "add",
                "set",
                "inet",
                table,
                set,
                "{",
                "type",
                "ipv4_addr;",
                "flags",
                "interval;",
                "auto-merge;",
                "}",
            ],
        )
        .await
        .map(|_| ())
    }

    /// Lists a chain, one element per line, optionally with handle
    /// annotations (`-a`).
    pub async fn list_chain(
        &self,
        table: &str,
        chain: &str,
        with_handles: bool,
    ) -> Result<Vec<String>> {
        let output = if with_handles {
            self.run_checked(
                "list chain",
                &["-a", "list", "chain", "inet", table, chain],
            )
            .await?
        } else {
            self.run_checked("list chain", &["list", "chain", "inet", table, chain])
                .await?
        };
        Ok(output.stdout.lines().map(str::to_string).collect())
    }

    pub async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        self.run_checked("flush chain", &["flush", "chain", "inet", table, chain])
            .await
            .map(|_| ())
    }

    /// Appends a rule built from pre-tokenized conditions.
    pub async fn add_rule(&self, table: &str, chain: &str, tokens: &[String]) -> Result<()> {
        let mut args = vec!["add", "rule", "inet", table, chain];
        args.extend(tokens.iter().map(String::as_str));
        self.run_checked("add rule", &args).await.map(|_| ())
    }

    /// Inserts a rule at a position inside a chain.
    pub async fn insert_rule_at(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        tokens: &[String],
    ) -> Result<()> {
        let position = position.to_string();
        let mut args = vec!["insert", "rule", "inet", table, chain, "position", position.as_str()];
        args.extend(tokens.iter().map(String::as_str));
        self.run_checked("insert rule", &args).await.map(|_| ())
    }

    /// Deletes a rule by its kernel handle — exact and safe.
    pub async fn delete_rule_handle(&self, table: &str, chain: &str, handle: u64) -> Result<()> {
        let handle = handle.to_string();
        self.run_checked(
            "delete rule by handle",
            &["delete", "rule", "inet", table, chain, "handle", handle.as_str()],
        )
        .await
        .map(|_| ())
    }

    /// Deletes a rule by re-submitting its exact text. Degraded path: only
    /// works where the tool supports content-addressed deletion, and
    /// repeated identical-text rules are indistinguishable.
    pub async fn delete_rule_tokens(
        &self,
        table: &str,
        chain: &str,
        tokens: &[String],
    ) -> Result<()> {
        let mut args = vec!["delete", "rule", "inet", table, chain];
        args.extend(tokens.iter().map(String::as_str));
        self.run_checked("delete rule by content", &args)
            .await
            .map(|_| ())
    }

    /// Adds one element to a named set. Returns the raw output; callers
    /// decide whether "already exists" is an error.
    pub async fn add_element(&self, table: &str, set: &str, element: &str) -> CmdOutput {
        self.run(&["add", "element", "inet", table, set, "{", element, "}"])
            .await
    }

    /// Removes one element from a named set. Raw output for the same reason.
    pub async fn delete_element(&self, table: &str, set: &str, element: &str) -> CmdOutput {
        self.run(&["delete", "element", "inet", table, set, "{", element, "}"])
            .await
    }

    /// Loads a full ruleset from a file (`nft -f`). Used only on manual full
    /// restarts, never by the steady-state path.
    pub async fn load_file(&self, path: &std::path::Path) -> Result<()> {
        let path = path.to_string_lossy();
        self.run_checked("load ruleset file", &["-f", path.as_ref()])
            .await
            .map(|_| ())
    }

    pub async fn list_ruleset(&self) -> Result<String> {
        Ok(self
            .run_checked("list ruleset", &["list", "ruleset"])
            .await?
            .stdout)
    }
}
