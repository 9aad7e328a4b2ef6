//! Sync configuration: global output directory plus the list of sources.
//!
//! ```toml
//! output_dir = "~/ledgers"
//!
//! [[sources]]
//! name = "prosper"
//! kind = "prosper"
//! [sources.options]
//! client_id = "..."
//! ```
//!
//! Load-time validation covers the shape shared by every source (unique
//! names, known kinds). Variant-specific options are checked when the source
//! is constructed, still before any network or file activity.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::cursor::CURSOR_FILE_NAME;

/// Default config location, relative to the home directory.
pub const DEFAULT_CONFIG_FILE: &str = ".ledgersync.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(String),

    #[error("cannot resolve home directory for {0}")]
    NoHomeDir(String),

    #[error("source names must not be empty")]
    EmptyName,

    #[error("source '{0}' is configured more than once")]
    DuplicateSource(String),

    #[error("source '{source_name}' has unknown kind '{kind}' (known: {known})")]
    UnknownKind {
        source_name: String,
        kind: String,
        known: String,
    },

    #[error("no configured source named '{0}'")]
    UnknownSource(String),

    #[error("source '{source_name}' is missing required option '{key}'")]
    MissingOption { source_name: String, key: String },

    #[error("source '{source_name}' option '{key}' is invalid: {reason}")]
    InvalidOption {
        source_name: String,
        key: String,
        reason: String,
    },

    #[error("source '{source_name}' could not be constructed: {reason}")]
    Construct { source_name: String, reason: String },
}

/// Which data source variant to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Marketplace API (Prosper notes).
    Prosper,
    /// Payroll portal (ADP pay statements).
    Adp,
    /// Hosted aggregator (LedgerLinker service).
    LedgerLinker,
    /// Spreadsheet (Google Sheets).
    GoogleSheets,
}

impl SourceKind {
    pub const ALL: [SourceKind; 4] = [
        SourceKind::Prosper,
        SourceKind::Adp,
        SourceKind::LedgerLinker,
        SourceKind::GoogleSheets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Prosper => "prosper",
            SourceKind::Adp => "adp",
            SourceKind::LedgerLinker => "ledgerlinker",
            SourceKind::GoogleSheets => "google_sheets",
        }
    }

    fn known() -> String {
        Self::ALL.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|k| k.as_str() == s).ok_or(())
    }
}

/// Variant-specific options, validated by each source at construction.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct SourceOptions(BTreeMap<String, toml::Value>);

impl SourceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<toml::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<toml::Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// A string option, if present.
    pub fn opt_str(&self, source_name: &str, key: &str) -> Result<Option<String>, ConfigError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(ConfigError::InvalidOption {
                source_name: source_name.to_string(),
                key: key.to_string(),
                reason: format!("expected a string, found {}", other.type_str()),
            }),
        }
    }

    /// A non-empty string option that must be present.
    pub fn require_str(&self, source_name: &str, key: &str) -> Result<String, ConfigError> {
        match self.opt_str(source_name, key)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(ConfigError::MissingOption {
                source_name: source_name.to_string(),
                key: key.to_string(),
            }),
        }
    }

    pub fn str_or(&self, source_name: &str, key: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self
            .opt_str(source_name, key)?
            .unwrap_or_else(|| default.to_string()))
    }

    /// A list-of-strings option. A single string is accepted as a one-item list.
    pub fn opt_str_list(
        &self,
        source_name: &str,
        key: &str,
    ) -> Result<Option<Vec<String>>, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidOption {
            source_name: source_name.to_string(),
            key: key.to_string(),
            reason,
        };
        match self.0.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(vec![s.clone()])),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s.clone()),
                    other => Err(invalid(format!(
                        "expected a list of strings, found {} item",
                        other.type_str()
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(invalid(format!(
                "expected a list of strings, found {}",
                other.type_str()
            ))),
        }
    }
}

/// One configured source after load-time validation.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    /// Ledger directory for this source (defaults to the global one).
    pub output_dir: PathBuf,
    pub options: SourceOptions,
}

/// Validated configuration for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub output_dir: PathBuf,
    pub cursor_file: PathBuf,
    /// In configuration order; this is the processing order.
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    output_dir: String,
    cursor_file: Option<String>,
    #[serde(default)]
    sources: Vec<RawSource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSource {
    name: String,
    kind: String,
    output_dir: Option<String>,
    #[serde(default)]
    options: SourceOptions,
}

impl SyncConfig {
    /// Default config path: `~/.ledgersync.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(DEFAULT_CONFIG_FILE))
            .ok_or_else(|| ConfigError::NoHomeDir(DEFAULT_CONFIG_FILE.to_string()))
    }

    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let output_dir = expand_home(&raw.output_dir)?;
        let cursor_file = match raw.cursor_file {
            Some(p) => expand_home(&p)?,
            None => output_dir.join(CURSOR_FILE_NAME),
        };

        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(raw.sources.len());
        for src in raw.sources {
            if src.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !seen.insert(src.name.clone()) {
                return Err(ConfigError::DuplicateSource(src.name));
            }
            let kind = src
                .kind
                .parse::<SourceKind>()
                .map_err(|_| ConfigError::UnknownKind {
                    source_name: src.name.clone(),
                    kind: src.kind.clone(),
                    known: SourceKind::known(),
                })?;
            let output_dir = match src.output_dir {
                Some(dir) => expand_home(&dir)?,
                None => output_dir.clone(),
            };
            sources.push(SourceConfig {
                name: src.name,
                kind,
                output_dir,
                options: src.options,
            });
        }

        Ok(Self {
            output_dir,
            cursor_file,
            sources,
        })
    }

    /// Restrict to the named sources, keeping configuration order.
    /// An empty selection keeps every source.
    pub fn select(&self, names: &[String]) -> Result<Vec<&SourceConfig>, ConfigError> {
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.sources.iter().any(|s| &s.name == *n))
        {
            return Err(ConfigError::UnknownSource(unknown.clone()));
        }
        Ok(self
            .sources
            .iter()
            .filter(|s| names.is_empty() || names.contains(&s.name))
            .collect())
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf, ConfigError> {
    if path == "~" {
        return dirs::home_dir().ok_or_else(|| ConfigError::NoHomeDir(path.to_string()));
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or_else(|| ConfigError::NoHomeDir(path.to_string())),
        None => Ok(PathBuf::from(path)),
    }
}
