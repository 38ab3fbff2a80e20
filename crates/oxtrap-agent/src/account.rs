//! Per-account configuration files.
//!
//! Each file in a provider's `conf_dir` describes one account. The format is
//! picked from the extension: `.json`, `.toml`, `.yaml` or `.yml`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use oxtrap_check::api::DEFAULT_API_URL;
use oxtrap_cloud::cloudwatch::AwsCredentials;
use oxtrap_cloud::collector::ServiceConfig;
use oxtrap_common::types::Tags;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Stable account id. Also the correlation key of the destination check.
    pub id: String,
    pub aws: AwsCredentials,
    pub regions: Vec<RegionConfig>,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub period: Period,
    #[serde(default)]
    pub tags: Tags,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Empty means every built-in namespace.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub tags: Tags,
    /// Overrides the regional monitoring endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    pub api_token: String,
    #[serde(default = "default_api_app")]
    pub api_app: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub check_bundle_id: Option<String>,
    #[serde(default)]
    pub broker_id: Option<String>,
    #[serde(default)]
    pub broker_ca_file: Option<PathBuf>,
    #[serde(default)]
    pub trace_metrics: bool,
}

fn default_api_app() -> String {
    "oxtrap".to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

/// Provider polling granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Five minute metrics.
    #[default]
    Basic,
    /// One minute metrics.
    Detailed,
}

impl Period {
    pub fn secs(&self) -> i64 {
        match self {
            Period::Basic => 300,
            Period::Detailed => 60,
        }
    }
}

impl AccountConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            bail!("invalid id (empty)");
        }
        if self.id.chars().any(char::is_whitespace) {
            bail!("invalid id ({}), contains spaces", self.id);
        }
        if self.regions.is_empty() {
            bail!("no regions configured");
        }
        if self.regions.iter().any(|r| r.name.trim().is_empty()) {
            bail!("region with empty name");
        }
        if self.destination.api_token.is_empty() {
            bail!("destination api_token is required");
        }
        Ok(())
    }
}

fn parse(path: &Path, content: &str) -> anyhow::Result<Option<AccountConfig>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let config = match ext.as_str() {
        "json" => serde_json::from_str(content)?,
        "toml" => toml::from_str(content)?,
        "yaml" | "yml" => serde_yaml::from_str(content)?,
        _ => return Ok(None),
    };
    Ok(Some(config))
}

/// Loads one account file. Returns `None` for files with an unsupported
/// extension.
pub fn load_account(path: &Path) -> anyhow::Result<Option<AccountConfig>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let Some(account) = parse(path, &content).with_context(|| format!("parsing {}", path.display()))?
    else {
        return Ok(None);
    };
    account
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(Some(account))
}

/// Loads every valid account in `dir`, sorted by file name.
///
/// Invalid files are logged and skipped so one bad account never blocks the
/// others.
pub fn load_accounts(dir: &Path) -> anyhow::Result<Vec<AccountConfig>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading config dir {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();

    let mut accounts = Vec::new();
    for path in paths {
        match load_account(&path) {
            Ok(Some(account)) => {
                tracing::debug!(account = %account.id, file = %path.display(), "loaded account");
                accounts.push(account);
            }
            Ok(None) => tracing::debug!(file = %path.display(), "unsupported extension, ignoring"),
            Err(e) => tracing::error!(file = %path.display(), error = %format!("{e:#}"), "skipping account"),
        }
    }
    Ok(accounts)
}
