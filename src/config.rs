//! Load and validate runtime configuration.

use anyhow::Context;
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path};

#[derive(Debug, Deserialize, Clone)]
pub struct StoreCfg {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendCfg {
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    #[serde(default = "default_hosted_base_url")]
    pub hosted_base_url: String,
    #[serde(default = "default_local_base_url")]
    pub local_base_url: String,
    #[serde(default = "default_max_recommendations")]
    pub max_recommendations: usize,
    /// Fallback credential for hosted users without their own key.
    #[serde(skip)]
    pub hosted_api_key: Option<String>,
}

impl Default for BackendCfg {
    fn default() -> Self {
        Self {
            timeout_sec: default_timeout_sec(),
            hosted_base_url: default_hosted_base_url(),
            local_base_url: default_local_base_url(),
            max_recommendations: default_max_recommendations(),
            hosted_api_key: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExecCfg {
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub backend: BackendCfg,
    #[serde(default)]
    pub exec: ExecCfg,
    /// Static price table served by the quote provider.
    #[serde(default)]
    pub quotes: HashMap<String, f64>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            let s = fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            Self::from_yaml(&s)?
        } else {
            Self::default()
        };
        cfg.apply_env();
        Ok(cfg)
    }

    pub fn from_yaml(s: &str) -> anyhow::Result<Self> {
        // An empty document deserialises to unit, not to a map.
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(s).context("parse config yaml")?;
        if cfg.backend.timeout_sec == 0 {
            anyhow::bail!("backend.timeout_sec must be > 0");
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(p) = std::env::var("ADVISOR_STORE_PATH") {
            if !p.trim().is_empty() {
                self.store.path = p;
            }
        }
        self.backend.hosted_api_key = std::env::var("ADVISOR_HOSTED_API_KEY")
            .ok()
            .filter(|s| !s.trim().is_empty());
    }
}

fn default_store_path() -> String {
    directories::ProjectDirs::from("", "", "robo-advisor")
        .map(|d| d.data_dir().join("advisor.json").to_string_lossy().into_owned())
        .unwrap_or_else(|| "data/advisor.json".to_string())
}

fn default_timeout_sec() -> u64 {
    60
}

fn default_hosted_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_local_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_max_recommendations() -> usize {
    20
}
