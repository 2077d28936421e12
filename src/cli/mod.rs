//! CLI interface using clap.
//!
//! Provides command-line arguments and subcommands for the tool.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use clinic_offline::application::OutputFormat;
use clinic_offline::MutationOperation;

/// Clinic Offline - inspect and drive the offline data layer of the parent portal.
#[derive(Parser, Debug)]
#[command(name = "clinic-offline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (use multiple times for more verbosity).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format: table or json.
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Configuration file (defaults to ~/.clinic-offline/config.toml).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Use an in-process demo backend with sample data instead of the configured one.
    #[arg(long)]
    pub demo: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show connectivity, sync state, and queue counts.
    Status,

    /// List queued changes.
    Queue,

    /// Queue a change to send to the server.
    Enqueue {
        /// Resource collection (e.g. children, appointments).
        resource: String,

        /// Operation: create, update, or delete.
        operation: MutationOperation,

        /// Record body as JSON.
        payload: String,
    },

    /// Send queued changes and refresh the cache.
    Sync,

    /// Refresh the cache now, waiting for a running sync first.
    Refresh,

    /// Show cached collections and their age.
    Cache {
        /// Only show this collection.
        collection: Option<String>,
    },

    /// Show upcoming vaccination reminders from the cache.
    Reminders {
        /// Days ahead to include.
        #[arg(short, long, default_value = "30")]
        days: u32,
    },

    /// Acknowledge a change the server rejected, removing it from the queue.
    Ack {
        /// Queue id of the rejected change.
        id: u64,
    },

    /// Discard every queued change.
    ClearQueue {
        /// Confirm discarding unsent changes.
        #[arg(long)]
        yes: bool,
    },

    /// Drop all cached data.
    ClearCache,

    /// Show whether the install banner may be offered.
    InstallStatus,

    /// Hide the install banner for the cooldown period.
    DismissInstall,

    /// Write a default configuration file.
    InitConfig,
}

impl Cli {
    /// Parse the output format argument.
    pub fn output_format(&self) -> Result<OutputFormat, String> {
        self.format.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "clinic-offline",
            "--demo",
            "enqueue",
            "children",
            "create",
            r#"{"name":"Emma"}"#,
        ])
        .unwrap();

        assert!(cli.demo);
        match cli.command {
            Commands::Enqueue {
                resource,
                operation,
                payload,
            } => {
                assert_eq!(resource, "children");
                assert_eq!(operation, MutationOperation::Create);
                assert!(payload.contains("Emma"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_operation() {
        assert!(Cli::try_parse_from(["clinic-offline", "enqueue", "children", "upsert", "{}"]).is_err());
    }

    #[test]
    fn test_cache_collection_is_optional() {
        let cli = Cli::try_parse_from(["clinic-offline", "cache"]).unwrap();
        assert!(matches!(cli.command, Commands::Cache { collection: None }));

        let cli = Cli::try_parse_from(["clinic-offline", "-f", "json", "cache", "reminders"]).unwrap();
        assert!(matches!(cli.output_format(), Ok(OutputFormat::Json)));
        match cli.command {
            Commands::Cache { collection } => assert_eq!(collection.as_deref(), Some("reminders")),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_reminder_days_default() {
        let cli = Cli::try_parse_from(["clinic-offline", "reminders"]).unwrap();
        assert!(matches!(cli.command, Commands::Reminders { days: 30 }));
    }
}
