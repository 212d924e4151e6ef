//! Configuration of the preprocessing service
//!
//! The configuration file is TOML with a `[manager]` table and an `[[items]]`
//! array:
//!
//! ```toml
//! [manager]
//! workers_num = 4
//! sink_mode = "server"
//!
//! [[items]]
//! itemid = 1
//! value_type = "uint64"
//! dependents = [2]
//!
//! [[items.steps]]
//! type = "multiplier"
//! params = "8"
//! ```
//!
//! # Default Location
//!
//! - **Linux**: `~/.config/preproc-rs/preprocessor.toml`
//! - **macOS**: `~/Library/Application Support/preproc-rs/preprocessor.toml`
//! - **Windows**: `%APPDATA%\preproc-rs\preprocessor.toml`

mod items;

pub use items::ItemConfig;

use crate::error::{PreprocError, Result};
use crate::preprocessor::sink::SinkMode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for configuration directories
pub const APP_ID: &str = "preproc-rs";

/// Configuration filename
pub const CONFIG_FILE: &str = "preprocessor.toml";

/// Default number of worker threads
pub const DEFAULT_WORKERS_NUM: usize = 3;

/// Default time allowed for all workers to register
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default number of finished tasks handled per drain
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Get the path of the default configuration file
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== Manager Config ====================

/// Worker pool and output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Number of worker threads
    pub workers_num: usize,

    /// Seconds to wait for all workers to register
    pub startup_timeout_secs: u64,

    /// Finished tasks handled per drain call
    pub batch_size: usize,

    /// Routing of discovery rule values
    pub sink_mode: SinkMode,

    /// Optional log file, in addition to stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers_num: DEFAULT_WORKERS_NUM,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            sink_mode: SinkMode::default(),
            log_file: None,
        }
    }
}

impl ManagerConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Builder method to set the worker count
    pub fn with_workers(mut self, workers_num: usize) -> Self {
        self.workers_num = workers_num;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers_num == 0 {
            return Err(PreprocError::Config(
                "workers_num must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(PreprocError::Config(
                "batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ==================== Config File ====================

/// Contents of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocConfig {
    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub items: Vec<ItemConfig>,
}

impl PreprocConfig {
    /// Parse and validate a configuration document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| PreprocError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PreprocError::from(e).with_context(format!("Failed to read configuration {:?}", path))
        })?;

        Self::from_toml_str(&content)
            .map_err(|e| e.with_context(format!("in {}", path.display())))
    }

    /// Load a configuration file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load configuration, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the configuration to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PreprocError::from(e).with_context("Failed to create configuration directory")
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            PreprocError::Serialization(format!("Failed to serialize configuration: {}", e))
        })?;

        std::fs::write(path, content).map_err(|e| {
            PreprocError::from(e).with_context(format!("Failed to write configuration {:?}", path))
        })
    }

    /// Check the manager settings and item references
    pub fn validate(&self) -> Result<()> {
        self.manager.validate()?;

        let mut ids = HashSet::with_capacity(self.items.len());
        for item in &self.items {
            if !ids.insert(item.itemid) {
                return Err(PreprocError::Config(format!(
                    "duplicate item {}",
                    item.itemid
                )));
            }
        }

        for item in &self.items {
            if let Some(missing) = item.dependents.iter().find(|id| !ids.contains(id)) {
                return Err(PreprocError::Config(format!(
                    "item {} lists unknown dependent item {}",
                    item.itemid, missing
                )));
            }
            if item.dependents.contains(&item.itemid) {
                return Err(PreprocError::Config(format!(
                    "item {} depends on itself",
                    item.itemid
                )));
            }
        }

        if let Some(cycle) = self.find_dependency_cycle() {
            let path: Vec<String> = cycle.iter().map(u64::to_string).collect();
            return Err(PreprocError::Config(format!(
                "dependency cycle {}",
                path.join(" -> ")
            )));
        }

        Ok(())
    }

    /// First cycle in the dependents graph, as the item path that closes it
    fn find_dependency_cycle(&self) -> Option<Vec<u64>> {
        let graph: HashMap<u64, &[u64]> = self
            .items
            .iter()
            .map(|item| (item.itemid, item.dependents.as_slice()))
            .collect();
        let mut done: HashSet<u64> = HashSet::with_capacity(graph.len());

        for item in &self.items {
            if done.contains(&item.itemid) {
                continue;
            }

            // (itemid, index of the next dependent to visit)
            let mut stack: Vec<(u64, usize)> = vec![(item.itemid, 0)];
            while let Some((itemid, next)) = stack.last().copied() {
                let dependents = graph.get(&itemid).copied().unwrap_or_default();
                let Some(&dep) = dependents.get(next) else {
                    done.insert(itemid);
                    stack.pop();
                    continue;
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }

                if let Some(pos) = stack.iter().position(|(id, _)| *id == dep) {
                    let mut cycle: Vec<u64> = stack[pos..].iter().map(|(id, _)| *id).collect();
                    cycle.push(dep);
                    return Some(cycle);
                }
                if !done.contains(&dep) {
                    stack.push((dep, 0));
                }
            }
        }

        None
    }

    pub fn find_item(&self, itemid: u64) -> Option<&ItemConfig> {
        self.items.iter().find(|i| i.itemid == itemid)
    }
}
