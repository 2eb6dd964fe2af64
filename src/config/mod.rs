//! Configuration loading.
//!
//! Resolution order for the file: explicit path, `LUNA_CONFIG`, then
//! `~/.luna/config.toml`. A missing file yields defaults. Selected values
//! can be overridden from the environment after the file is read.

pub mod schema;

pub use schema::{
    AnalysisConfig, Config, DisengagementConfig, GatewayConfig, HardLimitPolicy,
    OrchestratorConfig, VoiceConfig,
};

use anyhow::Context;
use directories::UserDirs;
use std::path::{Path, PathBuf};

const REDACTED: &str = "***";

impl Config {
    /// Default config location, `~/.luna/config.toml`.
    pub fn default_path() -> anyhow::Result<PathBuf> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".luna").join("config.toml"))
    }

    /// Load from `path` (or the resolved default), apply env overrides and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("LUNA_CONFIG") {
                Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
                _ => Self::default_path()?,
            },
        };

        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file; a missing file yields defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            toml::from_str::<Self>(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse config {}: {e}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Environment overrides, with the lookup injectable for tests.
    pub fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(provider) = get("LUNA_VOICE_PROVIDER") {
            match provider.parse() {
                Ok(kind) => self.voice.provider = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring LUNA_VOICE_PROVIDER"),
            }
        }
        if let Some(model) = get("LUNA_VOICE_MODEL") {
            self.voice.model = Some(model);
        }
        if let Some(host) = get("LUNA_GATEWAY_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = get("LUNA_GATEWAY_PORT") {
            match port.parse() {
                Ok(port) => self.gateway.port = port,
                Err(e) => tracing::warn!(error = %e, "Ignoring LUNA_GATEWAY_PORT"),
            }
        }
        if let Some(endpoint) = get("LUNA_ANALYSIS_ENDPOINT") {
            self.analysis.endpoint = Some(endpoint);
        }
        if let Some(key) = get("LUNA_ANALYSIS_API_KEY") {
            self.analysis.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let orch = &self.orchestrator;
        if orch.max_session_secs == 0 {
            anyhow::bail!("orchestrator.max_session_secs must be greater than zero");
        }
        if let Some(t) = orch
            .wrap_up_thresholds_secs
            .iter()
            .find(|t| **t == 0 || **t >= orch.max_session_secs)
        {
            anyhow::bail!(
                "orchestrator.wrap_up_thresholds_secs entry {t} must be between 1 and max_session_secs ({})",
                orch.max_session_secs
            );
        }
        let d = &orch.disengagement;
        if d.enabled && (d.low_content_run == 0 || d.window == 0) {
            anyhow::bail!("orchestrator.disengagement low_content_run and window must be at least 1");
        }
        if let Some(endpoint) = &self.analysis.endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("analysis.endpoint must be an http(s) URL, got {endpoint}");
            }
        }
        Ok(())
    }

    /// Copy with every secret masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.voice.api_key.is_some() {
            copy.voice.api_key = Some(REDACTED.into());
        }
        if copy.analysis.api_key.is_some() {
            copy.analysis.api_key = Some(REDACTED.into());
        }
        copy
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
