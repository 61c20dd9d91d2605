// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Configuration loading for kubemcp
//!
//! Settings come from one primary TOML file plus an optional drop-in
//! directory. Drop-in fragments are applied in lexical filename order over the
//! primary file, and command-line overrides are applied last:
//! - tables merge key by key
//! - scalars and arrays from a later fragment replace earlier values
//!
//! Every (re)load replays the whole chain from disk, so the merged result is
//! always derivable from the fragments alone.

mod store;

pub use store::{ConfigStore, ReloadGuard};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, trace};

/// Get the base kubemcp directory (~/.kubemcp/)
pub fn base_dir() -> anyhow::Result<PathBuf> {
    use anyhow::Context;
    dirs::home_dir()
        .map(|p| p.join(".kubemcp"))
        .context("Could not determine home directory")
}

/// Name of the drop-in directory used when only a primary file is given
pub const DEFAULT_DROP_IN_DIR: &str = "conf.d";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to list drop-in directory {}: {source}", .path.display())]
    ListDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid merged configuration: {0}")]
    Invalid(#[source] toml::de::Error),
}

/// How the cluster identity is obtained
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderStrategy {
    /// In-cluster service account when available and no kubeconfig is set
    #[default]
    Auto,
    /// Always use a kubeconfig file
    Kubeconfig,
    /// Always use the in-cluster service account
    InCluster,
    /// Every request must carry its own cluster override headers
    AuthHeaders,
}

/// A `{group, version, kind}` policy rule.
///
/// `"*"` matches anything in that field. An empty `kind` covers every kind of
/// the group/version; an empty `group` is the core API group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRule {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

impl ResourceRule {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }
}

/// Overrides `validation.enabled` when set to a boolean string
pub const VALIDATION_ENV: &str = "KUBEMCP_VALIDATION_ENABLED";

/// Pre-flight checks run before requests reach the API server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl ValidationConfig {
    /// Environment first, then the file; off when neither says otherwise
    pub fn is_enabled(&self) -> bool {
        self.resolve(std::env::var(VALIDATION_ENV).ok().as_deref())
    }

    fn resolve(&self, env: Option<&str>) -> bool {
        if let Some(value) = env.and_then(parse_bool) {
            return value;
        }
        self.enabled.unwrap_or(false)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Merged kubemcp settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticConfig {
    /// Verbosity, 0 (info) to 9 (trace)
    pub log_level: u8,
    /// Output format handed to list operations ("table", "yaml")
    pub list_output: String,
    /// Enabled operation groups
    pub toolsets: Vec<String>,
    /// When non-empty, only these operations are exposed
    pub enabled_tools: Vec<String>,
    pub disabled_tools: Vec<String>,
    pub read_only: bool,
    pub disable_destructive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
    pub cluster_provider_strategy: ProviderStrategy,
    /// Upper bound for cluster calls made on behalf of one request
    pub request_timeout_secs: u64,
    /// Polling interval of the file watch that triggers reloads
    pub watch_interval_ms: u64,
    pub denied_resources: Vec<ResourceRule>,
    pub allowed_resources: Vec<ResourceRule>,
    pub validation: ValidationConfig,
}

impl Default for StaticConfig {
    fn default() -> Self {
        Self {
            log_level: 0,
            list_output: "table".to_string(),
            toolsets: vec!["core".to_string(), "config".to_string(), "helm".to_string()],
            enabled_tools: vec![],
            disabled_tools: vec![],
            read_only: false,
            disable_destructive: false,
            kubeconfig: None,
            cluster_provider_strategy: ProviderStrategy::Auto,
            request_timeout_secs: 30,
            watch_interval_ms: 2000,
            denied_resources: vec![],
            allowed_resources: vec![],
            validation: ValidationConfig::default(),
        }
    }
}

impl StaticConfig {
    /// Deserialize a merged table, filling in defaults for absent keys
    pub fn from_table(table: toml::Table) -> Result<Self, ConfigError> {
        toml::Value::Table(table)
            .try_into()
            .map_err(ConfigError::Invalid)
    }

    /// Render as TOML (used by `kubemcp config`)
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Where configuration is read from
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Primary file; when set it must exist
    pub primary: Option<PathBuf>,
    /// Drop-in directory; may be absent on disk
    pub drop_in_dir: Option<PathBuf>,
    /// Applied after every file fragment
    pub overrides: toml::Table,
}

impl ConfigSources {
    /// Sources for a primary file and optional drop-in directory.
    /// Without an explicit directory, `conf.d` next to the primary file is used.
    pub fn new(primary: Option<PathBuf>, drop_in_dir: Option<PathBuf>) -> Self {
        let drop_in_dir = drop_in_dir.or_else(|| {
            primary
                .as_deref()
                .and_then(Path::parent)
                .map(|p| p.join(DEFAULT_DROP_IN_DIR))
        });
        Self {
            primary,
            drop_in_dir,
            overrides: toml::Table::new(),
        }
    }

    /// Add a command-line override applied as the last fragment
    pub fn with_override(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.overrides.insert(key.to_string(), value.into());
        self
    }

    /// Paths whose changes should trigger a reload
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.primary
            .iter()
            .chain(self.drop_in_dir.iter())
            .cloned()
            .collect()
    }
}

/// One parsed override fragment
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// File path, or `None` for command-line overrides
    pub path: Option<PathBuf>,
    pub table: toml::Table,
}

/// A fully merged configuration generation
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Increases by one on every committed reload
    pub version: u64,
    pub primary: toml::Table,
    /// In application order, highest priority last
    pub fragments: Vec<Fragment>,
    pub merged: StaticConfig,
}

impl ConfigSnapshot {
    /// Recompute the merged settings from the primary table and fragments
    pub fn replay(&self) -> Result<StaticConfig, ConfigError> {
        let mut table = self.primary.clone();
        for fragment in &self.fragments {
            merge_tables(&mut table, fragment.table.clone());
        }
        StaticConfig::from_table(table)
    }
}

/// Merge `overlay` into `base`: nested tables merge, everything else replaces
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Parse one TOML file into a table
pub async fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// List `*.toml` files of a drop-in directory in lexical filename order
pub async fn drop_in_files(dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let list_err = |source| ConfigError::ListDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(list_err(e)),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
        let path = entry.path();
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        if !is_toml {
            continue;
        }
        // Follows symlinks; mounted ConfigMaps link every key
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => files.push(path),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Skipping dangling drop-in link");
            }
            Err(e) => return Err(list_err(e)),
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Read and merge every source. Nothing is returned unless all of them parse.
pub async fn load(sources: &ConfigSources) -> Result<ConfigSnapshot, ConfigError> {
    let primary = match &sources.primary {
        Some(path) => read_table(path).await?,
        None => toml::Table::new(),
    };

    let mut fragments = Vec::new();
    if let Some(dir) = &sources.drop_in_dir {
        for path in drop_in_files(dir).await? {
            trace!(path = %path.display(), "Reading drop-in fragment");
            let table = read_table(&path).await?;
            fragments.push(Fragment {
                path: Some(path),
                table,
            });
        }
    }
    if !sources.overrides.is_empty() {
        fragments.push(Fragment {
            path: None,
            table: sources.overrides.clone(),
        });
    }

    let mut snapshot = ConfigSnapshot {
        version: 0,
        primary,
        fragments,
        merged: StaticConfig::default(),
    };
    snapshot.merged = snapshot.replay()?;

    debug!(
        primary = ?sources.primary,
        fragments = snapshot.fragments.len(),
        "Loaded configuration"
    );
    Ok(snapshot)
}
