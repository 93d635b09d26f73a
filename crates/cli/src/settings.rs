use anyhow::Context as _;
use apiwire_resilience::serde_duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-user defaults, overridden by flags and environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliSettings {
    #[serde(default)]
    pub description: Option<PathBuf>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub multi_tenant: bool,
    #[serde(default, with = "serde_duration", skip_serializing_if = "Option::is_none")]
    pub max_device_poll: Option<Duration>,
}

pub fn default_settings_path() -> anyhow::Result<PathBuf> {
    let base = if let Ok(v) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(v)
    } else {
        let home = std::env::var("HOME").context("HOME is not set")?;
        PathBuf::from(home).join(".config")
    };
    Ok(base.join("apiwire").join("cli.json"))
}

/// A missing file yields the defaults.
pub fn load_settings(path: &Path) -> anyhow::Result<CliSettings> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CliSettings::default()),
        Err(e) => return Err(e).with_context(|| format!("read settings {}", path.display())),
    };
    serde_json::from_slice(&bytes).with_context(|| format!("parse {}", path.display()))
}
