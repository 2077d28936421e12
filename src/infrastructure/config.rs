//! Configuration file management.
//!
//! Handles loading and saving TOML configuration files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{AppConfig, AppError, Result};

/// Default configuration file content.
const DEFAULT_CONFIG: &str = r#"# Clinic Offline Configuration
# Auto-generated - edit as needed

[cache]
# Hours after which cached data is reported stale (default: 24)
stale_after_hours = 24

# Collections refreshed after every sync
tracked_collections = ["children", "appointments", "vaccinations", "reminders"]

[sync]
# Whether automatic sync triggers are enabled
enabled = true

# Foreground sync tick in seconds (0 disables)
interval_secs = 300

# Try to sync right after a change is queued
sync_on_enqueue = true

# Sync when the connection comes back
sync_on_reconnect = true

# Milliseconds the "synced" indicator stays before returning to idle
grace_ms = 2000

# Timeout for each backend request in seconds
request_timeout_secs = 15

[sync.retry]
initial_delay_ms = 1000
max_delay_ms = 300000
multiplier = 2.0
jitter = true

[install]
# Days the install banner stays hidden after being dismissed (default: 7)
dismiss_cooldown_days = 7

[remote]
# Hosted backend base URL
# base_url = "https://your-project.example.co"

# Environment variable holding the API key
api_key_env = "CLINIC_API_KEY"

[remote.scope]
# tenant_id = "clinic-id"
# parent_id = "parent-id"

[paths]
# Custom data directory (optional, defaults to ~/.clinic-offline)
# data_dir = "/custom/path"
"#;

/// Load configuration from file or create default.
///
/// # Errors
/// Returns error if file exists but cannot be read or parsed.
pub fn load_config() -> Result<AppConfig> {
    let config_path = config_file_path();

    if config_path.exists() {
        load_config_from_file(&config_path)
    } else {
        Ok(AppConfig::default())
    }
}

/// Load configuration from a specific file.
///
/// # Errors
/// Returns error if file cannot be read or parsed.
pub fn load_config_from_file(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::io(format!("Failed to read config file: {}", path.display()), e))?;

    toml::from_str(&content).map_err(|e| AppError::Config {
        message: format!("Failed to parse config file: {e}"),
    })
}

/// Save configuration to file.
///
/// # Errors
/// Returns error if file cannot be written.
pub fn save_config(config: &AppConfig) -> Result<()> {
    let config_path = config.config_file_path();

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io("Failed to create config directory", e))?;
    }

    let content = toml::to_string_pretty(config).map_err(|e| AppError::Config {
        message: format!("Failed to serialize config: {e}"),
    })?;

    fs::write(&config_path, content).map_err(|e| {
        AppError::io(
            format!("Failed to write config file: {}", config_path.display()),
            e,
        )
    })?;

    tracing::info!(path = %config_path.display(), "Configuration saved");

    Ok(())
}

/// Create default configuration file if it doesn't exist.
///
/// # Errors
/// Returns error if file cannot be created.
pub fn ensure_config_exists() -> Result<PathBuf> {
    let config_path = config_file_path();

    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| AppError::io("Failed to create config directory", e))?;
        }

        fs::write(&config_path, DEFAULT_CONFIG)
            .map_err(|e| AppError::io("Failed to create default config", e))?;

        tracing::info!(path = %config_path.display(), "Created default configuration");
    }

    Ok(config_path)
}

/// Get the path to the configuration file.
#[must_use]
pub fn config_file_path() -> PathBuf {
    AppConfig::default_data_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_parses() {
        let config: AppConfig = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.cache.stale_after_hours, 24);
        assert_eq!(config.install.dismiss_cooldown_days, 7);
        assert_eq!(config.sync.retry.initial_delay_ms, 1000);
        assert!(config.remote.base_url.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: AppConfig = toml::from_str("[cache]\nstale_after_hours = 6\n").unwrap();
        assert_eq!(config.cache.stale_after_hours, 6);
        assert_eq!(config.cache.tracked_collections.len(), 4);
        assert_eq!(config.sync.grace_ms, 2000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.remote.scope.tenant_id = Some("clinic-7".into());

        let content = toml::to_string_pretty(&config).unwrap();
        fs::write(&config_path, content).unwrap();

        let loaded = load_config_from_file(&config_path).unwrap();

        assert_eq!(loaded.remote.scope.tenant_id.as_deref(), Some("clinic-7"));
        assert_eq!(loaded.sync.interval_secs, config.sync.interval_secs);
    }
}
