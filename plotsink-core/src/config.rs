use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration file model.
///
/// The `cache` group is mandatory; a file without it fails to parse, which
/// is fatal at startup. Destination groups are keyed by their name.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Filename whose presence in a candidate directory marks the
    /// underlying disk as unmounted, excluding the directory.
    #[serde(default)]
    pub skip_directory_file: Option<String>,

    pub cache: GroupConfig,

    #[serde(default)]
    pub destinations: BTreeMap<String, GroupConfig>,
}

/// One group of managed directories sharing a concurrency budget.
#[derive(Debug, Deserialize)]
pub struct GroupConfig {
    pub concurrency: i64,

    /// Directory paths or globs.
    pub paths: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Sum of all destination concurrency budgets. The cache concurrency
    /// should not exceed this, or receives will outpace migration.
    pub fn destination_concurrency_total(&self) -> i64 {
        self.destinations.values().map(|g| g.concurrency).sum()
    }
}
