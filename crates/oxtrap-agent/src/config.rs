use std::path::PathBuf;

use anyhow::{bail, Context};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Added to the `RUST_LOG` filter as `oxtrap=<level>`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub aws: ProviderConfig,
}

/// One provider section, e.g. `[aws]`.
#[derive(Debug, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding one configuration file per account.
    #[serde(default)]
    pub conf_dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading agent config {path}"))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing agent config {path}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.aws.enabled && self.aws.conf_dir.as_os_str().is_empty() {
            bail!("aws is enabled but aws.conf_dir is not set");
        }
        if !self.aws.enabled {
            bail!("no providers enabled");
        }
        Ok(())
    }

    /// `oxtrap=<log_level>` directive for the tracing filter.
    pub fn log_directive(&self) -> String {
        format!("oxtrap={}", self.log_level.trim().to_lowercase())
    }
}
