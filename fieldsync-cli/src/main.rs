use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fieldsync_core::config::Config;
use fieldsync_core::core_store::model::{FieldMap, OperationId, RecordId, ReferenceKind};
use fieldsync_core::core_store::store::{LocalStore, StoreStats};
use fieldsync_core::core_sync::{
    EnvToken, HttpRemote, NetworkState, SyncEngine, SyncReport, SyncStatus, SyncSupervisor,
};
use fieldsync_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use fieldsync_core::metrics::init_metrics;
use fieldsync_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML); FIELDSYNC_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// More verbose logging; repeat for more detail
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Connection type to report to the engine (offline, metered, unmetered)
    #[arg(long, global = true, default_value = "unmetered")]
    network: NetworkState,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print sync status and store counts
    Status,
    /// List queued operations in push order
    Pending,
    /// List records flagged as conflicted
    Conflicts,
    /// Run one push+pull cycle
    Sync,
    /// Startup cycle, then the periodic cycle until interrupted
    Run {
        /// Seconds a running cycle may take to finish after a shutdown signal
        #[arg(long, default_value_t = 30)]
        grace_secs: u64,
    },
    /// Settle a conflicted record
    Resolve {
        uuid: String,
        /// local | remote | merge (aliases: keep_local, client_wins, keep_server, server_wins)
        strategy: String,
        /// JSON object of merged field values, required for `merge`
        #[arg(long)]
        fields: Option<String>,
    },
    /// Recent sync cycles, newest first
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Re-arm an operation that exhausted its retries
    Retry { op_id: String },
    /// Drop a queued operation without sending it
    Discard { op_id: String },
    /// Fetch one reference cache now (germplasm, trait, location)
    RefreshReference { kind: ReferenceKind },
    /// Empty a reference cache; every kind when none is given
    ClearReference { kind: Option<ReferenceKind> },
    /// Write a configuration file with default values
    InitConfig {
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_flags = args.logging();

    let command = match args.command {
        Command::InitConfig { path, force } => return init_config(&path, force),
        command => command,
    };

    let config = Config::load(args.config.as_deref()).context("loading configuration")?;
    init_observability(&log_flags, &config)?;

    let engine = open_engine(&config)?;
    engine.set_network(args.network);

    match command {
        Command::Status => {
            #[derive(Serialize)]
            struct StatusView {
                status: SyncStatus,
                stats: StoreStats,
            }
            print_json(&StatusView {
                status: engine.refresh_status()?,
                stats: engine.stats()?,
            })?;
        }
        Command::Pending => print_json(&engine.pending()?)?,
        Command::Conflicts => print_json(&engine.conflicts()?)?,
        Command::Sync => match engine.sync_now().await? {
            Some(report) => report_cycle(&report)?,
            None => bail!("sync skipped: {}", skip_reason(engine.is_syncing(), args.network)),
        },
        Command::Run { grace_secs } => {
            let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(grace_secs)));
            install_signal_handlers(Arc::clone(&coordinator));
            let startup = SyncSupervisor::new(Arc::clone(&engine))
                .run_until_shutdown(&coordinator)
                .await;
            match startup {
                Ok(Some(report)) if report.auth_failed => {
                    bail!("remote rejected the credentials; queued operations were kept")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Startup sync had failed before shutdown"),
            }
        }
        Command::Resolve {
            uuid,
            strategy,
            fields,
        } => {
            let strategy = SyncEngine::parse_strategy(&strategy)?;
            let merged: Option<FieldMap> = fields
                .as_deref()
                .map(serde_json::from_str::<FieldMap>)
                .transpose()
                .context("--fields must be a JSON object")?;
            let record =
                engine.resolve_conflict(&RecordId::from(uuid.as_str()), strategy, merged.as_ref())?;
            print_json(&record)?;
        }
        Command::History { limit } => print_json(&engine.history(limit)?)?,
        Command::Retry { op_id } => {
            if !engine.retry_operation(&OperationId(op_id.clone()))? {
                bail!("no queued operation {}", op_id);
            }
            info!(op = %op_id, "Operation re-armed");
        }
        Command::Discard { op_id } => match engine.discard_operation(&OperationId(op_id.clone()))? {
            Some(op) => print_json(&op)?,
            None => bail!("no queued operation {}", op_id),
        },
        Command::RefreshReference { kind } => {
            let rows = engine.refresh_reference(kind).await?;
            print_json(&[ReferenceCount { kind, rows }])?;
        }
        Command::ClearReference { kind } => {
            let kinds = match kind {
                Some(kind) => vec![kind],
                None => ReferenceKind::ALL.to_vec(),
            };
            let mut cleared = Vec::with_capacity(kinds.len());
            for kind in kinds {
                cleared.push(ReferenceCount {
                    kind,
                    rows: engine.clear_reference(kind)?,
                });
            }
            print_json(&cleared)?;
        }
        Command::InitConfig { path, force } => init_config(&path, force)?,
    }

    Ok(())
}

#[derive(Serialize)]
struct ReferenceCount {
    kind: ReferenceKind,
    rows: usize,
}

/// Why `sync_now` returned without running a cycle
fn skip_reason(cycle_running: bool, network: NetworkState) -> String {
    if cycle_running {
        "another sync cycle is already running".to_string()
    } else {
        format!("network '{}' is not eligible", network)
    }
}

/// Logging flags, detached from the subcommand
struct LogFlags {
    level: Option<String>,
    verbose: u8,
    json: bool,
}

impl Args {
    fn logging(&self) -> LogFlags {
        LogFlags {
            level: self.log_level.clone(),
            verbose: self.verbose,
            json: self.json_logs,
        }
    }
}

fn init_observability(flags: &LogFlags, config: &Config) -> Result<()> {
    let mut log_config = LogConfig::from_settings(&config.logging)?;
    if let Some(level) = &flags.level {
        match LogLevel::from_str(level) {
            Some(level) => log_config.level = level,
            None => eprintln!("Invalid log level '{}', using '{}'", level, config.logging.level),
        }
    }
    for _ in 0..flags.verbose {
        log_config.level = log_config.level.more_verbose();
    }
    if flags.json {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    init_metrics();
    Ok(())
}

fn open_engine(config: &Config) -> Result<Arc<SyncEngine>> {
    let store = LocalStore::open(&config.store)
        .with_context(|| format!("opening {}", config.store.path.display()))?;
    let credentials = Arc::new(EnvToken {
        var: config.remote.token_env.clone(),
    });
    if std::env::var(&config.remote.token_env).is_err() {
        warn!(var = %config.remote.token_env, "No bearer token set; pushes will halt as unauthorized");
    }
    let remote = HttpRemote::new(
        config.remote.base_url.clone(),
        config.remote.request_timeout,
        credentials,
    )?;
    Ok(SyncEngine::bootstrap(
        Arc::new(store),
        Arc::new(remote),
        config.sync.clone(),
    )?)
}

fn report_cycle(report: &SyncReport) -> Result<()> {
    print_json(report)?;
    if report.auth_failed {
        bail!("remote rejected the credentials; queued operations were kept");
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to_file(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
