// src/config/engine.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::composite::CompositeScoreConfig;

pub const ENV_CONFIG_PATH: &str = "SCORER_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/scorer.toml";
pub const DEFAULT_JSON_PATH: &str = "config/scorer.json";

fn default_database_url() -> String {
    "sqlite://data/scores.db".to_string()
}
fn default_max_connections() -> u32 {
    8
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_progress_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_cache_capacity() -> u64 {
    10_000
}
fn default_cache_ttl_secs() -> u64 {
    600
}
fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Process-wide settings. Loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Idle lifetime of a progress entry before the sweeper drops it.
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Deadline for the persistence step; unset means no deadline.
    #[serde(default)]
    pub persist_timeout_ms: Option<u64>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub metrics_enabled: bool,
    #[serde(default)]
    pub composite: CompositeScoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
            progress_ttl_secs: default_progress_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            persist_timeout_ms: None,
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            bind_addr: default_bind_addr(),
            metrics_enabled: false,
            composite: CompositeScoreConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn progress_ttl(&self) -> Duration {
        Duration::from_secs(self.progress_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn persist_timeout(&self) -> Option<Duration> {
        self.persist_timeout_ms.map(Duration::from_millis)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Load from an explicit path. The extension picks the format; unknown
    /// extensions try TOML, then JSON.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading scorer config from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let cfg = parse_config(&content, ext.as_str())
            .with_context(|| format!("parsing scorer config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load using env var + fallbacks:
    /// 1) $SCORER_CONFIG_PATH
    /// 2) config/scorer.toml
    /// 3) config/scorer.json
    /// 4) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
        }
        for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
            let pb = PathBuf::from(candidate);
            if pb.exists() {
                return Self::load_from(&pb);
            }
        }
        tracing::info!(target: "config", "no scorer config file found, using defaults");
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<()> {
        self.composite
            .validate()
            .map_err(|e| anyhow!("invalid composite config: {e}"))?;
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be at least 1"));
        }
        if self.progress_ttl_secs == 0 {
            return Err(anyhow!("progress_ttl_secs must be positive"));
        }
        Ok(())
    }
}

fn parse_config(s: &str, hint_ext: &str) -> Result<EngineConfig> {
    match hint_ext {
        "toml" => Ok(toml::from_str(s)?),
        "json" => Ok(serde_json::from_str(s)?),
        _ => toml::from_str(s)
            .map_err(anyhow::Error::from)
            .or_else(|_| serde_json::from_str(s).map_err(anyhow::Error::from))
            .map_err(|_| anyhow!("unsupported scorer config format")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissingPerspectivePolicy;
    use crate::model::Perspective;
    use std::{env, fs};

    const SAMPLE_TOML: &str = r#"
database_url = "sqlite::memory:"
progress_ttl_secs = 60
persist_timeout_ms = 1500

[composite]
missing_perspective_policy = "exclude"

[[composite.models]]
model_name = "meta-llama/llama-4-maverick"
perspective = "left"

[[composite.models]]
model_name = "openai/gpt-4.1-nano"
perspective = "right"
"#;

    #[test]
    fn toml_and_json_parse() {
        let cfg = parse_config(SAMPLE_TOML, "toml").unwrap();
        assert_eq!(cfg.database_url, "sqlite::memory:");
        assert_eq!(cfg.progress_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.persist_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(cfg.sweep_interval_secs, 300);
        assert_eq!(
            cfg.composite.missing_perspective_policy,
            MissingPerspectivePolicy::Exclude
        );
        assert_eq!(cfg.composite.models[1].perspective, Perspective::Right);

        let json = r#"{"bind_addr":"0.0.0.0:9000","composite":{"min_score":-1.0,"max_score":1.0}}"#;
        let cfg = parse_config(json, "").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert!(cfg.composite.models.is_empty());
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.composite.min_score = 2.0;
        assert!(cfg.validate().is_err());
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);

        // No files in the temp CWD → defaults.
        let cfg = EngineConfig::load_default().unwrap();
        assert_eq!(cfg.progress_ttl_secs, 300);

        // config/scorer.toml is picked up.
        fs::create_dir_all(tmp.path().join("config")).unwrap();
        fs::write(tmp.path().join(DEFAULT_TOML_PATH), SAMPLE_TOML).unwrap();
        let cfg = EngineConfig::load_default().unwrap();
        assert_eq!(cfg.progress_ttl_secs, 60);

        // Env var wins.
        let p_json = tmp.path().join("custom.json");
        fs::write(&p_json, r#"{"progress_ttl_secs": 42}"#).unwrap();
        env::set_var(ENV_CONFIG_PATH, p_json.display().to_string());
        let cfg = EngineConfig::load_default().unwrap();
        assert_eq!(cfg.progress_ttl_secs, 42);

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml"));
        assert!(EngineConfig::load_default().is_err());
        env::remove_var(ENV_CONFIG_PATH);

        env::set_current_dir(&old).unwrap();
    }
}
