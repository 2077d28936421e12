//! Clinic Offline - inspect and drive the offline data layer of the parent portal.
//!
//! Works against the configured backend, or against an in-process sample
//! backend with `--demo`:
//!   clinic-offline --demo sync                 # Drain the queue and refresh the cache
//!   clinic-offline --demo cache                # Show cached collections and their age
//!   clinic-offline enqueue children create '{"name":"Emma"}'
//!   clinic-offline queue                       # List queued changes
//!   clinic-offline reminders --days 14         # Vaccinations due in the next two weeks

mod cli;

use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::Parser;
use colored::Colorize;
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clinic_offline::application::{
    format_cache_table, format_queue_table, format_reminders_table, format_status, OutputFormat,
};
use clinic_offline::domain::{SyncSession, SyncOutcome};
use clinic_offline::infrastructure::{
    ensure_config_exists, load_config, load_config_from_file, MemoryRemote, StaticProbe,
};
use clinic_offline::{AppConfig, AppError, OfflineEngine, Result, TriggerResult};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Main application logic.
async fn run(cli: Cli) -> Result<()> {
    let format = cli
        .output_format()
        .map_err(|e| AppError::Config { message: e })?;

    if matches!(cli.command, Commands::InitConfig) {
        return cmd_init_config();
    }

    let config = match &cli.config {
        Some(path) => load_config_from_file(path)?,
        None => load_config()?,
    };
    let engine = build_engine(config, cli.demo)?;
    engine.start();

    let result = dispatch(&engine, cli.command, format).await;
    engine.shutdown();
    result
}

async fn dispatch(engine: &OfflineEngine, command: Commands, format: OutputFormat) -> Result<()> {
    match command {
        Commands::Status => cmd_status(engine, format)?,
        Commands::Queue => cmd_queue(engine, format)?,
        Commands::Enqueue {
            resource,
            operation,
            payload,
        } => {
            let payload = serde_json::from_str(&payload).map_err(AppError::json_parse)?;
            let id = engine.enqueue_mutation(&resource, operation, payload)?;
            println!("{} Queued change #{id}", "✓".green().bold());
            if engine.is_offline() {
                println!("  Offline: the change will be sent when the connection returns.");
            } else {
                report_trigger(&run_sync(engine).await);
            }
        }
        Commands::Sync => report_trigger(&run_sync(engine).await),
        Commands::Refresh => {
            let session = engine.force_refresh().await?;
            print_session(&session);
        }
        Commands::Cache { collection } => cmd_cache(engine, collection.as_deref(), format)?,
        Commands::Reminders { days } => {
            let reminders = engine.get_upcoming_reminders(days);
            match format {
                OutputFormat::Json => println!("{}", to_json(&reminders)?),
                OutputFormat::Table => {
                    if reminders.is_empty() {
                        println!("No vaccinations due in the next {days} days.");
                    } else {
                        println!("{}", format_reminders_table(&reminders));
                    }
                }
            }
        }
        Commands::Ack { id } => {
            let entry = engine.acknowledge_failure(id)?;
            println!(
                "{} Removed rejected change #{} ({})",
                "✓".green().bold(),
                entry.id,
                entry.summary()
            );
        }
        Commands::ClearQueue { yes } => {
            let pending = engine.get_sync_queue().len();
            if !yes && pending > 0 {
                return Err(AppError::Config {
                    message: format!(
                        "Refusing to discard {pending} unsent changes; pass --yes to confirm"
                    ),
                });
            }
            let removed = engine.clear_sync_queue();
            println!("{} Discarded {removed} queued changes", "✓".green().bold());
        }
        Commands::ClearCache => {
            engine.clear_cache();
            println!("{} Cache cleared", "✓".green().bold());
        }
        Commands::InstallStatus => cmd_install_status(engine, format)?,
        Commands::DismissInstall => {
            engine.dismiss_install_prompt();
            println!(
                "Install banner hidden for {} days",
                engine.config().install.dismiss_cooldown_days
            );
        }
        Commands::InitConfig => cmd_init_config()?,
    }

    Ok(())
}

/// Build the engine, swapping in the sample backend for `--demo`.
fn build_engine(mut config: AppConfig, demo: bool) -> Result<OfflineEngine> {
    if !demo {
        return OfflineEngine::builder(config).build();
    }

    config.paths.data_dir = Some(config.data_dir().join("demo"));
    OfflineEngine::builder(config)
        .remote(Arc::new(demo_backend()))
        .probe(Arc::new(StaticProbe(true)))
        .build()
}

/// Sample backend with one family's records.
fn demo_backend() -> MemoryRemote {
    let today = Utc::now().date_naive();
    let day = |offset: i64| (today + Duration::days(offset)).format("%Y-%m-%d").to_string();

    let remote = MemoryRemote::new();
    remote.seed(
        "children",
        vec![
            json!({"id": "c-1", "name": "Emma", "birth_date": "2021-04-12"}),
            json!({"id": "c-2", "name": "Noah", "birth_date": "2023-09-30"}),
        ],
    );
    remote.seed(
        "appointments",
        vec![json!({"id": "a-1", "child_id": "c-1", "date": day(3), "type": "checkup"})],
    );
    remote.seed(
        "vaccinations",
        vec![json!({"id": "v-1", "child_id": "c-1", "vaccine_name": "MMR", "date": "2022-04-20"})],
    );
    remote.seed(
        "reminders",
        vec![
            json!({"id": "r-1", "child_name": "Emma", "title": "MMR booster", "due_date": day(5)}),
            json!({"id": "r-2", "child_name": "Noah", "vaccine_name": "DTaP", "due_date": day(20)}),
            json!({"id": "r-3", "child_name": "Noah", "vaccine_name": "Hepatitis B", "due_date": day(90)}),
        ],
    );
    remote
}

/// Run a sync, waiting out one that is already in progress.
async fn run_sync(engine: &OfflineEngine) -> TriggerResult {
    loop {
        match engine.sync_with_server().await {
            TriggerResult::AlreadySyncing => engine.coordinator().wait_until_idle().await,
            other => return other,
        }
    }
}

fn report_trigger(result: &TriggerResult) {
    match result {
        TriggerResult::Completed(session) => print_session(session),
        TriggerResult::Offline => println!("{} Offline, nothing sent", "!".yellow().bold()),
        TriggerResult::AlreadySyncing => println!("A sync is already running"),
    }
}

fn print_session(session: &SyncSession) {
    match session.outcome {
        SyncOutcome::Synced => println!(
            "{} Synced: {} changes sent, {} collections refreshed",
            "✓".green().bold(),
            session.applied_count,
            session.refreshed.len()
        ),
        SyncOutcome::Partial => println!(
            "{} Synced with rejections: {} sent, {} rejected (see `queue`)",
            "!".yellow().bold(),
            session.applied_count,
            session.failed_count
        ),
        SyncOutcome::Error => println!(
            "{} Sync stopped: {}",
            "✗".red().bold(),
            session.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

fn cmd_status(engine: &OfflineEngine, format: OutputFormat) -> Result<()> {
    let status = engine.status();
    let connectivity = engine.connectivity();

    match format {
        OutputFormat::Json => {
            let value = json!({
                "online": connectivity.online,
                "state": status.state.to_string(),
                "pending": status.pending,
                "failed": status.failed,
                "lastSession": status.last_session,
                "nextRetryAt": status.next_retry_at,
                "dataStale": engine.is_data_stale(),
                "memoryOnly": engine.is_memory_only(),
            });
            println!("{}", to_json(&value)?);
        }
        OutputFormat::Table => {
            println!(
                "{}",
                format_status(&status, &connectivity, engine.is_memory_only())
            );
            if engine.is_data_stale() {
                println!("  {}", "Cached data is out of date".yellow());
            }
        }
    }
    Ok(())
}

fn cmd_queue(engine: &OfflineEngine, format: OutputFormat) -> Result<()> {
    let entries = engine.get_sync_queue();
    match format {
        OutputFormat::Json => println!("{}", to_json(&entries)?),
        OutputFormat::Table => {
            if entries.is_empty() {
                println!("No queued changes.");
            } else {
                println!("{}", format_queue_table(&entries));
            }
        }
    }
    Ok(())
}

fn cmd_cache(engine: &OfflineEngine, collection: Option<&str>, format: OutputFormat) -> Result<()> {
    let mut data = engine.get_cached_data();
    if let Some(name) = collection {
        data.collections.retain(|key, _| key == name);
        if data.collections.is_empty() {
            return Err(AppError::NotFound {
                message: format!("Nothing cached for collection {name}"),
            });
        }
    }
    match format {
        OutputFormat::Json => println!("{}", to_json(&data)?),
        OutputFormat::Table => {
            if data.collections.is_empty() {
                println!("Nothing cached yet. Run `sync` while online.");
            } else {
                println!(
                    "{}",
                    format_cache_table(&data, Utc::now(), engine.cache().stale_after())
                );
                println!("\n{} records cached", data.record_count());
            }
        }
    }
    Ok(())
}

fn cmd_install_status(engine: &OfflineEngine, format: OutputFormat) -> Result<()> {
    let state = engine.install().state();
    let offer = engine.should_offer_install();
    match format {
        OutputFormat::Json => {
            let value = json!({
                "offer": offer,
                "installed": engine.install().is_installed(),
                "suppressed": engine.install().is_suppressed(),
                "state": state,
            });
            println!("{}", to_json(&value)?);
        }
        OutputFormat::Table => {
            println!("{}", "Install banner".bold());
            println!("  Offer now: {}", if offer { "yes".green() } else { "no".normal() });
            match state.dismissed_at {
                Some(at) => println!("  Last dismissed: {}", at.format("%Y-%m-%d %H:%M")),
                None => println!("  Last dismissed: never"),
            }
        }
    }
    Ok(())
}

fn cmd_init_config() -> Result<()> {
    let path = ensure_config_exists()?;
    println!("{} Configuration at {}", "✓".green().bold(), path.display());
    Ok(())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(AppError::json_parse)
}

/// Setup tracing/logging based on verbosity level.
fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
