//! Output formatting for the command line.
//!
//! Supports two output formats: tables for people, JSON for scripts.

use chrono::{DateTime, Duration, Utc};
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Table};

use crate::domain::{
    CachedData, ConnectivityState, MutationStatus, QueuedMutation, Reminder, SyncOutcome,
    SyncState, SyncStatus,
};

/// Output format options.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Human-readable tables.
    #[default]
    Table,
    /// JSON for programmatic use.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {s}. Use: table, json")),
        }
    }
}

/// Formats the mutation queue as a table.
pub fn format_queue_table(entries: &[QueuedMutation]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Queued", "Change", "Status", "Tries", "Last error"]);

    for entry in entries {
        let status = match entry.status {
            MutationStatus::Failed => entry.status.to_string().red().to_string(),
            MutationStatus::InFlight => entry.status.to_string().yellow().to_string(),
            _ => entry.status.to_string(),
        };

        table.add_row(vec![
            entry.id.to_string(),
            entry.created_at.format("%Y-%m-%d %H:%M").to_string(),
            entry.summary(),
            status,
            entry.attempts.to_string(),
            entry
                .last_error
                .as_deref()
                .map_or_else(|| "-".to_string(), |e| truncate(e, 40)),
        ]);
    }

    table.to_string()
}

/// Formats cached collections with their age.
pub fn format_cache_table(data: &CachedData, now: DateTime<Utc>, stale_after: Duration) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Collection", "Records", "Fetched", "Age", "Fresh"]);

    for (name, entry) in &data.collections {
        let fresh = if entry.is_stale(now, stale_after) {
            "stale".yellow().to_string()
        } else {
            "yes".green().to_string()
        };

        table.add_row(vec![
            name.clone(),
            entry.value.len().to_string(),
            entry.fetched_at.format("%Y-%m-%d %H:%M").to_string(),
            format_age(entry.age(now)),
            fresh,
        ]);
    }

    table.to_string()
}

/// Formats upcoming reminders.
pub fn format_reminders_table(reminders: &[Reminder]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Due", "Reminder", "Child"]);

    for reminder in reminders {
        let child = reminder
            .record
            .get("child_name")
            .or_else(|| reminder.record.get("child_id"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("-");

        table.add_row(vec![
            reminder.due_date.format("%Y-%m-%d").to_string(),
            truncate(reminder.title(), 35),
            child.to_string(),
        ]);
    }

    table.to_string()
}

/// Formats sync and connectivity status for display.
pub fn format_status(status: &SyncStatus, connectivity: &ConnectivityState, memory_only: bool) -> String {
    let network = if connectivity.online {
        "online".green()
    } else {
        "offline".red()
    };
    let state = match status.state {
        SyncState::Idle => status.state.to_string().normal(),
        SyncState::Syncing => status.state.to_string().cyan(),
        SyncState::Synced => status.state.to_string().green(),
        SyncState::Error => status.state.to_string().red(),
    };

    let mut out = format!(
        "{}\n  Network: {} (since {})\n  Sync: {}\n  Pending changes: {}\n  Failed changes: {}",
        "Status".bold(),
        network,
        connectivity.last_transition_at.format("%Y-%m-%d %H:%M:%S"),
        state,
        status.pending.to_string().cyan(),
        status.failed.to_string().red(),
    );

    if let Some(session) = &status.last_session {
        let outcome = match session.outcome {
            SyncOutcome::Synced => "synced".green(),
            SyncOutcome::Partial => "partial".yellow(),
            SyncOutcome::Error => "error".red(),
        };
        out.push_str(&format!(
            "\n  Last sync: {} at {} ({} applied, {} rejected)",
            outcome,
            session.started_at.format("%Y-%m-%d %H:%M:%S"),
            session.applied_count,
            session.failed_count
        ));
        if let Some(error) = &session.error {
            out.push_str(&format!("\n  Last error: {error}"));
        }
    }
    if let Some(at) = status.next_retry_at {
        out.push_str(&format!("\n  Next retry: {}", at.format("%H:%M:%S")));
    }
    if memory_only {
        out.push_str(&format!(
            "\n  {}",
            "Storage unavailable: changes are kept in memory only".yellow()
        ));
    }

    out
}

/// Human-friendly age ("3h 20m", "2d 4h").
fn format_age(age: Duration) -> String {
    if age.num_days() > 0 {
        format!("{}d {}h", age.num_days(), age.num_hours() % 24)
    } else if age.num_hours() > 0 {
        format!("{}h {}m", age.num_hours(), age.num_minutes() % 60)
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}

/// Truncates a string to max length with ellipsis.
fn truncate(s: &str, max_len: usize) -> String {
    let s = s.lines().next().unwrap_or(s);
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CachedEntity, MutationOperation};
    use serde_json::json;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world!", 8), "hello...");
        assert_eq!(truncate("Impfung fällig bald", 10), "Impfung...");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::minutes(5)), "5m");
        assert_eq!(format_age(Duration::minutes(200)), "3h 20m");
        assert_eq!(format_age(Duration::hours(25)), "1d 1h");
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("table".parse::<OutputFormat>(), Ok(OutputFormat::Table)));
        assert!(matches!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("markdown".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_tables_list_every_row() {
        let now = Utc::now();
        let entry = QueuedMutation::new(7, "children", MutationOperation::Create, json!({}), now);
        assert!(format_queue_table(&[entry]).contains("create children"));

        let mut data = CachedData::default();
        data.collections.insert(
            "children".into(),
            CachedEntity::new("children", vec![json!({}), json!({})], now - Duration::hours(2)),
        );
        let table = format_cache_table(&data, now, Duration::hours(24));
        assert!(table.contains("children"));
        assert!(table.contains("2h 0m"));
    }
}
