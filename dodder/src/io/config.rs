//! Tunables stored under `<project>/.dodder/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::model::{DEFAULT_OLLAMA_URL, normalize_base_url};

pub const CONFIG_DIR: &str = ".dodder";
pub const CONFIG_FILE: &str = "config.toml";
pub const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";

/// Default config location for a project directory.
pub fn default_config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Dodder configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DodderConfig {
    pub backend: BackendConfig,
    pub agent: AgentConfig,
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    /// Ollama base URL. Falls back to `OLLAMA_HOST`, then the local default.
    pub url: Option<String>,
    /// Per-request wall-clock limit in seconds.
    pub request_timeout_secs: u64,
    /// Total attempts per generation (first try included) before giving up.
    pub max_attempts: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: 120,
            max_attempts: 2,
        }
    }
}

impl BackendConfig {
    /// Resolve the backend URL given the value of `OLLAMA_HOST`.
    pub fn resolved_url(&self, ollama_host: Option<&str>) -> String {
        let explicit = self.url.as_deref().filter(|url| !url.trim().is_empty());
        let from_env = ollama_host.filter(|host| !host.trim().is_empty());
        normalize_base_url(explicit.or(from_env).unwrap_or(DEFAULT_OLLAMA_URL))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Corrective re-prompts allowed per generation after a malformed reply.
    pub max_corrections: u32,
    /// Character budget for the conversation window sent to the backend.
    pub window_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_corrections: 1,
            window_chars: 24_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellConfig {
    /// Kill commands running longer than this. `0` disables the limit.
    pub command_timeout_secs: u64,
    /// Keep at most this many bytes of each output stream.
    pub output_limit_bytes: usize,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 600,
            output_limit_bytes: 100_000,
        }
    }
}

impl ShellConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }
}

impl DodderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend.request_timeout_secs == 0 {
            return Err(anyhow!("backend.request_timeout_secs must be > 0"));
        }
        if self.backend.max_attempts == 0 {
            return Err(anyhow!("backend.max_attempts must be > 0"));
        }
        if self
            .backend
            .url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            return Err(anyhow!("backend.url must not be empty when set"));
        }
        if self.agent.window_chars == 0 {
            return Err(anyhow!("agent.window_chars must be > 0"));
        }
        if self.shell.output_limit_bytes == 0 {
            return Err(anyhow!("shell.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DodderConfig::default()`.
pub fn load_config(path: &Path) -> Result<DodderConfig> {
    if !path.exists() {
        let cfg = DodderConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DodderConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
