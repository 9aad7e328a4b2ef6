//! Builds data sources from validated configuration.

use std::path::PathBuf;

use super::adp::{self, AdpSource};
use super::ledgerlinker::{self, LedgerLinkerSource};
use super::prosper::{self, ProsperSource};
use super::provider::DataSource;
use super::sheets::{self, SheetsSource};
use crate::config::{ConfigError, SourceConfig, SourceKind};

/// A constructed source together with where its ledgers go.
pub struct ConfiguredSource {
    pub name: String,
    pub kind: SourceKind,
    pub output_dir: PathBuf,
    pub source: Box<dyn DataSource>,
}

impl std::fmt::Debug for ConfiguredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredSource")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

/// Options every source of `kind` must be given.
pub fn required_options(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::Prosper => prosper::REQUIRED_OPTIONS,
        SourceKind::Adp => adp::REQUIRED_OPTIONS,
        SourceKind::LedgerLinker => ledgerlinker::REQUIRED_OPTIONS,
        SourceKind::GoogleSheets => sheets::REQUIRED_OPTIONS,
    }
}

/// Construct the source described by `config`, validating its options.
pub fn create_source(config: &SourceConfig) -> Result<Box<dyn DataSource>, ConfigError> {
    let source: Box<dyn DataSource> = match config.kind {
        SourceKind::Prosper => Box::new(ProsperSource::from_config(config)?),
        SourceKind::Adp => Box::new(AdpSource::from_config(config)?),
        SourceKind::LedgerLinker => Box::new(LedgerLinkerSource::from_config(config)?),
        SourceKind::GoogleSheets => Box::new(SheetsSource::from_config(config)?),
    };
    Ok(source)
}

/// Construct every source, stopping at the first invalid one so that no
/// source runs against a half-valid configuration.
pub fn create_sources<'a, I>(configs: I) -> Result<Vec<ConfiguredSource>, ConfigError>
where
    I: IntoIterator<Item = &'a SourceConfig>,
{
    configs
        .into_iter()
        .map(|config| {
            Ok(ConfiguredSource {
                name: config.name.clone(),
                kind: config.kind,
                output_dir: config.output_dir.clone(),
                source: create_source(config)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;

    #[test]
    fn builds_every_kind_in_config_order() {
        let config = SyncConfig::from_toml(
            r#"
output_dir = "/tmp/ledgers"

[[sources]]
name = "notes"
kind = "prosper"
[sources.options]
client_id = "id"
client_secret = "secret"
username = "me"
password = "pw"

[[sources]]
name = "payroll"
kind = "adp"
[sources.options]
session_cookie = "cookie"

[[sources]]
name = "bank"
kind = "ledgerlinker"
[sources.options]
token = "t"

[[sources]]
name = "budget"
kind = "google_sheets"
[sources.options]
spreadsheet_id = "abc"
range = "Sheet1"
access_token = "tok"
"#,
        )
        .unwrap();

        let sources = create_sources(&config.sources).unwrap();
        let names: Vec<&str> = sources.iter().map(|s| s.source.name()).collect();
        assert_eq!(names, vec!["notes", "payroll", "bank", "budget"]);
        assert!(sources[2].source.exports().is_empty());
        assert_eq!(sources[1].source.exports().len(), 1);
    }

    #[test]
    fn first_invalid_source_fails_the_whole_set() {
        let config = SyncConfig::from_toml(
            r#"
output_dir = "/tmp/ledgers"

[[sources]]
name = "bank"
kind = "ledgerlinker"
[sources.options]
token = "t"

[[sources]]
name = "payroll"
kind = "adp"
"#,
        )
        .unwrap();

        assert!(matches!(
            create_sources(&config.sources),
            Err(ConfigError::MissingOption { source_name, key })
                if source_name == "payroll" && key == "session_cookie"
        ));
    }

    #[test]
    fn required_options_are_listed_per_kind() {
        for kind in SourceKind::ALL {
            assert!(!required_options(kind).is_empty(), "{kind}");
        }
        assert_eq!(required_options(SourceKind::LedgerLinker), &["token"]);
    }
}
