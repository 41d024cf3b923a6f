//! Sync timing configuration
//!
//! The symbol source re-indexes a changed file on its own schedule and
//! offers no completion signal, so reconciliation is ordered after it with
//! plain timers. The constants are empirical, not a protocol guarantee;
//! they are configurable for exactly that reason.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Debounce window for document edits and manifest events. Restarted by
    /// every new event so rapid typing coalesces into one reconciliation.
    #[serde(default = "default_change_debounce_ms")]
    pub change_debounce_ms: u64,
    /// Fixed delay applied to file create/delete events. Never restarted.
    #[serde(default = "default_create_delete_delay_ms")]
    pub create_delete_delay_ms: u64,
    /// Glob patterns for paths the watcher should ignore.
    #[serde(default)]
    pub ignore: Vec<String>,
}

// Assume a typing speed of about two characters per second.
fn default_change_debounce_ms() -> u64 {
    500
}

fn default_create_delete_delay_ms() -> u64 {
    20
}

impl Default for SyncConfig {
    fn default() -> SyncConfig {
        SyncConfig {
            change_debounce_ms: default_change_debounce_ms(),
            create_delete_delay_ms: default_create_delete_delay_ms(),
            ignore: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<SyncConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: SyncConfig =
            toml::from_str(&content).with_context(|| "Failed to parse sync config")?;

        Ok(config)
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    pub fn create_delete_delay(&self) -> Duration {
        Duration::from_millis(self.create_delete_delay_ms)
    }
}
