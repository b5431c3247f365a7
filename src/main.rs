//! netwarden - live nftables policy enforcement engine
//!
//! Command-line front end for the enforcement engine. The steady-state
//! deployment runs `netwarden serve` (the background reconciliation
//! service); everything else is an operator action applied live.
//!
//! # Usage
//!
//! ```bash
//! netwarden serve                      # run the reconciliation service
//! netwarden status                     # subsystem + sync status
//! netwarden sync [--force]             # one reconciliation pass
//! netwarden apply                      # rebuild the live chain from the store
//! netwarden reload                     # load the persisted file into the kernel
//! netwarden mode whitelist             # switch enforcement mode
//! netwarden rule add --name allow-ssh --protocol tcp --port 22 --source 10.0.0.0/24
//! netwarden rule remove allow-ssh
//! netwarden rule list [--live]
//! netwarden block 203.0.113.7 --note "abuse"
//! netwarden unblock 203.0.113.7
//! ```

use clap::{Parser, Subcommand};
use netwarden::audit::{AuditEvent, AuditLog, EventType};
use netwarden::core::blacklist::BlacklistEnforcer;
use netwarden::core::mode_switch::switch_mode;
use netwarden::core::nft::{Nft, SystemRunner};
use netwarden::core::reconciler::LiveReconciler;
use netwarden::core::sync::{SyncHandle, SyncService};
use netwarden::storage::{JsonStore, PolicyStore};
use netwarden::{EngineConfig, Mode, Result, Rule};
use shadow_rs::shadow;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

shadow!(build);

#[derive(Parser)]
#[command(
    name = "netwarden",
    version = build::CLAP_LONG_VERSION,
    about = "Live nftables policy enforcement engine"
)]
struct Cli {
    /// Engine configuration file (defaults to the XDG config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Policy store document (defaults to the XDG data dir)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the background reconciliation service
    Serve {
        /// Reconciliation interval in seconds (floor: 60)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Show filtering subsystem and policy status
    Status,
    /// Run one reconciliation pass
    Sync {
        /// Write the persisted file even when counts match
        #[arg(long)]
        force: bool,
    },
    /// Rebuild the live application chain from the policy store
    Apply,
    /// Load the persisted configuration into the kernel
    Reload,
    /// Switch the enforcement mode (blacklist or whitelist)
    Mode { mode: String },
    /// Manage firewall rules
    #[command(subcommand)]
    Rule(RuleCommand),
    /// Block an address: live set element plus active session termination
    Block {
        address: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Unblock an address
    Unblock { address: String },
}

#[derive(Subcommand)]
enum RuleCommand {
    /// Add a rule to the store and apply it live
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "any")]
        protocol: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        /// Destination port or range (e.g. 22 or 8000-9000)
        #[arg(long)]
        port: Option<String>,
        /// Author's intended action (accept or drop); enforcement is
        /// mode-dependent
        #[arg(long, default_value = "accept")]
        action: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Deactivate a rule and remove it from the live chain
    Remove { name: String },
    /// List rules from the store, or the raw live chain with --live
    List {
        #[arg(long)]
        live: bool,
    },
}

/// Wired-up engine components shared by the command handlers.
struct Engine {
    cfg: Arc<EngineConfig>,
    store: Arc<JsonStore>,
    nft: Nft<SystemRunner>,
    reconciler: LiveReconciler<SystemRunner>,
    enforcer: BlacklistEnforcer<SystemRunner, JsonStore>,
    audit: Option<AuditLog>,
}

impl Engine {
    async fn bring_up(config: Option<PathBuf>, store: Option<PathBuf>) -> Result<Self> {
        let cfg = Arc::new(netwarden::config::load_config(config.as_deref()).await?);

        let store_path = match store {
            Some(path) => path,
            None => {
                netwarden::utils::ensure_dirs()?;
                let mut path = netwarden::utils::get_data_dir().ok_or_else(|| {
                    netwarden::Error::Storage("data directory not found".to_string())
                })?;
                path.push("policy.json");
                path
            }
        };
        let store = Arc::new(JsonStore::open(store_path)?);

        let nft = Nft::new(SystemRunner, &cfg);
        let reconciler = LiveReconciler::new(nft.clone(), cfg.clone());
        let enforcer = BlacklistEnforcer::new(nft.clone(), store.clone(), cfg.clone());

        let audit = match AuditLog::new() {
            Ok(log) => Some(log),
            Err(e) => {
                warn!("audit log unavailable: {e}");
                None
            }
        };

        Ok(Self {
            cfg,
            store,
            nft,
            reconciler,
            enforcer,
            audit,
        })
    }

    fn sync_service(&self, interval: Option<u64>) -> (SyncService<SystemRunner, JsonStore>, SyncHandle) {
        let interval = Duration::from_secs(interval.unwrap_or(self.cfg.sync_interval_secs));
        SyncService::new(
            self.reconciler.clone(),
            self.store.clone(),
            self.cfg.clone(),
            interval,
        )
    }

    async fn record(&self, event_type: EventType, success: bool, details: serde_json::Value, error: Option<String>) {
        if let Some(audit) = &self.audit
            && let Err(e) = audit.log(AuditEvent::new(event_type, success, details, error)).await
        {
            warn!("failed to write audit event: {e}");
        }
    }

    /// Runs an operation, records its outcome in the audit log, and passes
    /// the result through.
    async fn audited<T>(
        &self,
        event_type: EventType,
        details: serde_json::Value,
        result: Result<T>,
    ) -> Result<T> {
        match &result {
            Ok(_) => self.record(event_type, true, details, None).await,
            Err(e) => {
                self.record(event_type, false, details, Some(e.to_string()))
                    .await;
            }
        }
        result
    }
}

async fn cmd_serve(engine: &Engine, interval: Option<u64>) -> Result<()> {
    let (service, handle) = engine.sync_service(interval);
    let task = tokio::spawn(service.run());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, reconciliation stops on its next wake");
    handle.request_stop();
    task.abort();
    Ok(())
}

async fn cmd_status(engine: &Engine) -> Result<()> {
    let status = netwarden::service::firewall_status(&engine.nft, &engine.cfg.filter_table).await;
    let mode = engine.store.mode()?;
    let rules = engine.store.active_rules()?;
    let blacklist = engine.store.active_blacklist()?;

    println!("environment:       {}", status.environment);
    println!(
        "subsystem:         {}",
        if status.is_running { "active" } else { "inactive" }
    );
    println!("mode:              {mode}");
    println!("live ruleset:      {} lines", status.rules_count);
    println!("stored rules:      {} active", rules.len());
    println!("blocked addresses: {} active", blacklist.len());
    Ok(())
}

async fn cmd_sync(engine: &Engine, force: bool) -> Result<()> {
    let (mut service, _handle) = engine.sync_service(None);
    let result = if force {
        service.sync_now().await
    } else {
        service.tick().await
    };
    let result = engine
        .audited(
            EventType::SyncPersisted,
            serde_json::json!({"force": force}),
            result,
        )
        .await;
    result?;

    let status = service.status();
    if status.sync_count > 0 {
        println!(
            "persisted configuration written to {}",
            engine.cfg.nftables_config_path.display()
        );
    } else {
        println!("live and persisted rule counts match, nothing to do");
    }
    Ok(())
}

async fn cmd_apply(engine: &Engine) -> Result<()> {
    let mode = engine.store.mode()?;
    let rules = engine.store.active_rules()?;

    let result = match engine.reconciler.resync(&rules, mode).await {
        Ok(report) if report.complete() => Ok(report),
        Ok(report) => Err(netwarden::Error::PartialResync {
            succeeded: report.succeeded,
            attempted: report.attempted,
        }),
        Err(e) => Err(e),
    };
    let report = engine
        .audited(
            EventType::ApplyRules,
            serde_json::json!({"rules": rules.len(), "mode": mode.to_string()}),
            result,
        )
        .await?;

    // fold the applied state into the persisted file right away
    let (mut service, _handle) = engine.sync_service(None);
    service.sync_now().await?;

    println!("applied {} rules live ({mode} mode)", report.attempted);
    Ok(())
}

async fn cmd_reload(engine: &Engine) -> Result<()> {
    let result =
        netwarden::service::reload_ruleset(&engine.nft, &engine.cfg.nftables_config_path).await;
    engine
        .audited(
            EventType::ReloadRuleset,
            serde_json::json!({"path": engine.cfg.nftables_config_path.display().to_string()}),
            result,
        )
        .await?;
    println!("persisted configuration reloaded");
    Ok(())
}

async fn cmd_mode(engine: &Engine, mode: &str) -> Result<()> {
    let mode = Mode::parse(mode)?;

    let result = switch_mode(engine.store.as_ref(), &engine.reconciler, mode).await;
    let report = engine
        .audited(
            EventType::ModeSwitch,
            serde_json::json!({"mode": mode.to_string()}),
            result,
        )
        .await?;

    let (mut service, _handle) = engine.sync_service(None);
    service.sync_now().await?;

    println!(
        "mode switched to {mode}, {} rules re-applied",
        report.attempted
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_rule_add(
    engine: &Engine,
    name: String,
    protocol: &str,
    source: Option<&str>,
    destination: Option<&str>,
    port: Option<&str>,
    action: &str,
    description: Option<&str>,
) -> Result<()> {
    netwarden::validators::validate_rule_name(&name)?;

    let mut rule = Rule::named(&name);
    rule.protocol = protocol
        .parse()
        .map_err(|_| netwarden::Error::Validation {
            field: "protocol".to_string(),
            message: format!("unknown protocol: {protocol}"),
        })?;
    rule.action = action.parse().map_err(|_| netwarden::Error::Validation {
        field: "action".to_string(),
        message: format!("unknown action: {action}"),
    })?;
    rule.source = source
        .map(|s| netwarden::validators::parse_network("source", s))
        .transpose()?;
    rule.destination = destination
        .map(|d| netwarden::validators::parse_network("destination", d))
        .transpose()?;
    rule.ports = port
        .map(|p| {
            p.parse::<netwarden::PortRange>()
                .map_err(|message| netwarden::Error::Validation {
                    field: "port".to_string(),
                    message,
                })
        })
        .transpose()?;
    rule.description = description.map(netwarden::validators::sanitize_description);

    let mode = engine.store.mode()?;
    engine.store.insert_rule(rule.clone())?;

    // storage is authoritative; a failed live add is reported but the
    // record stays, and the next apply/sync converges the chain
    let result = engine.reconciler.add(&rule, mode).await;
    engine
        .audited(
            EventType::AddRule,
            serde_json::json!({"rule": name.as_str()}),
            result,
        )
        .await?;

    println!("rule '{name}' added and applied live");
    Ok(())
}

async fn cmd_rule_remove(engine: &Engine, name: &str) -> Result<()> {
    let rule = engine
        .store
        .find_rule(name)?
        .ok_or_else(|| netwarden::Error::Storage(format!("no rule named '{name}'")))?;

    let mode = engine.store.mode()?;
    let result = engine.reconciler.delete(&rule, mode).await;
    engine
        .audited(
            EventType::RemoveRule,
            serde_json::json!({"rule": name}),
            result,
        )
        .await?;

    engine.store.deactivate_rule(name)?;
    println!("rule '{name}' removed");
    Ok(())
}

async fn cmd_rule_list(engine: &Engine, live: bool) -> Result<()> {
    if live {
        for line in engine.reconciler.list().await? {
            println!("{line}");
        }
        return Ok(());
    }

    let mode = engine.store.mode()?;
    for rule in engine.store.active_rules()? {
        let conditions = netwarden::core::conditions::build_conditions(&rule, mode);
        println!(
            "{:<24} {:<48} origin={} intent={}",
            rule.name,
            conditions.to_line(),
            rule.origin,
            rule.action
        );
    }
    Ok(())
}

async fn cmd_block(engine: &Engine, address: &str, note: Option<String>) -> Result<()> {
    let network = netwarden::validators::parse_network("address", address)?;
    let note = note.map(|n| netwarden::validators::sanitize_description(&n));

    let result = engine.enforcer.block(network, note).await;
    engine
        .audited(
            EventType::BlockAddress,
            serde_json::json!({"address": address}),
            result,
        )
        .await?;

    println!("{address} blocked; existing sessions terminated best-effort");
    Ok(())
}

async fn cmd_unblock(engine: &Engine, address: &str) -> Result<()> {
    let network = netwarden::validators::parse_network("address", address)?;

    let result = engine.enforcer.unblock(network).await;
    engine
        .audited(
            EventType::UnblockAddress,
            serde_json::json!({"address": address}),
            result,
        )
        .await?;

    println!("{address} unblocked");
    Ok(())
}

async fn dispatch(cli: Cli) -> Result<()> {
    let engine = Engine::bring_up(cli.config, cli.store).await?;

    match cli.command {
        Command::Serve { interval } => cmd_serve(&engine, interval).await,
        Command::Status => cmd_status(&engine).await,
        Command::Sync { force } => cmd_sync(&engine, force).await,
        Command::Apply => cmd_apply(&engine).await,
        Command::Reload => cmd_reload(&engine).await,
        Command::Mode { mode } => cmd_mode(&engine, &mode).await,
        Command::Rule(RuleCommand::Add {
            name,
            protocol,
            source,
            destination,
            port,
            action,
            description,
        }) => {
            cmd_rule_add(
                &engine,
                name,
                &protocol,
                source.as_deref(),
                destination.as_deref(),
                port.as_deref(),
                &action,
                description.as_deref(),
            )
            .await
        }
        Command::Rule(RuleCommand::Remove { name }) => cmd_rule_remove(&engine, &name).await,
        Command::Rule(RuleCommand::List { live }) => cmd_rule_list(&engine, live).await,
        Command::Block { address, note } => cmd_block(&engine, &address, note).await,
        Command::Unblock { address } => cmd_unblock(&engine, &address).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).init();

    if !nix::unistd::getuid().is_root() {
        warn!("not running as root; nft operations will likely be refused by the kernel");
    }

    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
