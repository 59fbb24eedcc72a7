use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::common::{AuditError, Result};

pub const ENV_CONFIG_FILE: &str = "NETAUDIT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "netaudit.toml";

/// Top-level TOML configuration.
///
/// ```toml
/// domain_names = ["corp.example.com"]
///
/// [sources.ipfabric]
/// url = "https://ipfabric.corp.example.com"
/// credentials = { token = "$IPF_TOKEN" }
/// options = { snapshot = "$last" }
///
/// [sources.netbox]
/// url = "https://netbox.corp.example.com"
/// credentials = { token = "$NETBOX_TOKEN" }
///
/// [collections.devices.sources.netbox.maps.status]
/// # provider value = canonical value
/// offline = "decommissioned"
/// ```
///
/// Credential and URL values beginning with `$` are resolved from the
/// environment at load time; a missing variable fails the load.
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub domain_names: Vec<String>,

    pub sources: HashMap<String, SourceConfig>,

    #[serde(default)]
    pub collections: HashMap<String, CollectionConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    pub credentials: Credentials,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    Token { token: String },
    Login { username: String, password: String },
}

impl Credentials {
    pub fn token(&self) -> Option<&str> {
        match self {
            Credentials::Token { token } => Some(token),
            Credentials::Login { .. } => None,
        }
    }

    pub fn login_pair(&self) -> Option<(&str, &str)> {
        match self {
            Credentials::Login { username, password } => Some((username, password)),
            Credentials::Token { .. } => None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CollectionConfig {
    #[serde(default)]
    pub sources: HashMap<String, CollectionSourceConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CollectionSourceConfig {
    /// field → (provider value → canonical value)
    #[serde(default)]
    pub maps: HashMap<String, BTreeMap<String, String>>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.expand_env()?;
        Ok(config)
    }

    /// Config file path from the CLI argument, the `NETAUDIT_CONFIG`
    /// environment variable, or the default, in that order.
    pub fn resolve_path(cli_path: Option<&Path>) -> std::path::PathBuf {
        match cli_path {
            Some(path) => path.to_path_buf(),
            None => std::env::var(ENV_CONFIG_FILE)
                .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string())
                .into(),
        }
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources
            .get(name)
            .ok_or_else(|| AuditError::not_found("source config", name))
    }

    /// Field-value map tables for one collection on one source; empty when
    /// the configuration does not mention the pair.
    pub fn maps(&self, collection: &str, source: &str) -> HashMap<String, BTreeMap<String, String>> {
        self.collections
            .get(collection)
            .and_then(|col| col.sources.get(source))
            .map(|src| src.maps.clone())
            .unwrap_or_default()
    }

    fn expand_env(&mut self) -> Result<()> {
        for source in self.sources.values_mut() {
            source.url = expand_value(&source.url)?;
            match &mut source.credentials {
                Credentials::Token { token } => *token = expand_value(token)?,
                Credentials::Login { username, password } => {
                    *username = expand_value(username)?;
                    *password = expand_value(password)?;
                }
            }
        }
        Ok(())
    }
}

/// `$NAME` values resolve from the environment; anything else passes through.
/// A literal leading dollar can be written as `$$`.
fn expand_value(value: &str) -> Result<String> {
    if let Some(rest) = value.strip_prefix("$$") {
        return Ok(format!("${rest}"));
    }
    match value.strip_prefix('$') {
        Some(name) => Ok(std::env::var(name)?),
        None => Ok(value.to_string()),
    }
}
