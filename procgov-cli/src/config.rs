//! Configuration file
//!
//! The file holds the governor settings and the group list:
//!
//! ```json
//! {
//!   "settings": { "tick_interval_ms": 300 },
//!   "groups": [
//!     { "name": "browsers", "enabled": true, "paths": [{ "path": "/usr/bin/firefox" }],
//!       "memory": { "enabled": true, "cap_mb": 2048, "enable_monitoring": true } }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use procgov_core::{ConfigSource, GovernorSettings, ResourceLimitConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Parsed configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub settings: GovernorSettings,
    pub groups: Vec<ResourceLimitConfig>,
}

impl ConfigFile {
    /// Read and validate `path`
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        let file: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid configuration {}", path.display()))?;
        file.validate()?;

        debug!(path = %path.display(), groups = file.groups.len(), "Configuration loaded");
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        check_group_names(&self.groups).map_err(anyhow::Error::msg)
    }
}

/// Group names must be non-empty and unique; they name the kernel groups
fn check_group_names(groups: &[ResourceLimitConfig]) -> std::result::Result<(), String> {
    let mut names = HashSet::new();
    for group in groups {
        if group.name.trim().is_empty() {
            return Err("Group names must not be empty".to_string());
        }
        if !names.insert(group.name.as_str()) {
            return Err(format!("Duplicate group name: {}", group.name));
        }
    }
    Ok(())
}

/// Re-reads the group list from the file on every request
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for FileConfigSource {
    fn configs(&self) -> procgov_core::Result<Vec<ResourceLimitConfig>> {
        let text = std::fs::read_to_string(&self.path)?;
        let file: ConfigFile = serde_json::from_str(&text)?;
        check_group_names(&file.groups)
            .map_err(|message| procgov_core::Error::InvalidConfig { message })?;
        Ok(file.groups)
    }
}
