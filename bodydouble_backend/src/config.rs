use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const HOSTED_LETTA_URL: &str = "https://api.letta.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Required,
    #[default]
    Disabled,
}

impl AuthMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
            "" | "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
            other => Err(anyhow::anyhow!(
                "Invalid auth mode '{}'. Expected 'required' or 'disabled'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    // HTTP surface
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub auth_token: Option<String>,

    // Account storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Conversational agent service (Letta)
    #[serde(default)]
    pub letta_base_url: Option<String>,
    #[serde(default)]
    pub letta_api_key: Option<String>,
    #[serde(default = "default_agent_models")]
    pub agent_models: Vec<String>,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    // Speech service (Fish Audio)
    #[serde(default = "default_fish_api_url")]
    pub fish_api_url: String,
    #[serde(default)]
    pub fish_api_key: Option<String>,
    #[serde(default = "default_fish_model")]
    pub fish_model: String,
    #[serde(default)]
    pub fish_voice_reference_id: Option<String>,
    #[serde(default = "default_speech_timeout_secs")]
    pub speech_timeout_secs: u64,

    // OAuth connector (Composio)
    #[serde(default = "default_composio_api_url")]
    pub composio_api_url: String,
    #[serde(default)]
    pub composio_api_key: Option<String>,
    #[serde(default)]
    pub composio_gmail_auth_config: Option<String>,

    // Product behavior
    #[serde(default = "default_followup_delay_secs")]
    pub followup_delay_secs: u64,
    #[serde(default = "default_focus_min")]
    pub default_focus_min: u32,
    #[serde(default = "default_break_min")]
    pub default_break_min: u32,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_database_path() -> String {
    "bodydouble_accounts.db".to_string()
}

fn default_agent_models() -> Vec<String> {
    vec![
        "openai/o4-mini".to_string(),
        "openai/gpt-4o-mini".to_string(),
        "gpt-4o-mini".to_string(),
        "o4-mini".to_string(),
    ]
}

fn default_agent_timeout_secs() -> u64 {
    30
}

fn default_fish_api_url() -> String {
    "https://api.fish.audio".to_string()
}

fn default_fish_model() -> String {
    "s1".to_string()
}

fn default_speech_timeout_secs() -> u64 {
    120
}

fn default_composio_api_url() -> String {
    "https://backend.composio.dev".to_string()
}

fn default_followup_delay_secs() -> u64 {
    600
}

fn default_focus_min() -> u32 {
    25
}

fn default_break_min() -> u32 {
    5
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            auth_mode: AuthMode::default(),
            auth_token: None,
            database_path: default_database_path(),
            letta_base_url: None,
            letta_api_key: None,
            agent_models: default_agent_models(),
            agent_timeout_secs: default_agent_timeout_secs(),
            fish_api_url: default_fish_api_url(),
            fish_api_key: None,
            fish_model: default_fish_model(),
            fish_voice_reference_id: None,
            speech_timeout_secs: default_speech_timeout_secs(),
            composio_api_url: default_composio_api_url(),
            composio_api_key: None,
            composio_gmail_auth_config: None,
            followup_delay_secs: default_followup_delay_secs(),
            default_focus_min: default_focus_min(),
            default_break_min: default_break_min(),
        }
    }
}

impl CompanionConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("bodydouble_config.toml")
    }

    /// Load `bodydouble_config.toml` (next to the executable) when present,
    /// then apply environment overrides on top.
    pub fn load() -> Self {
        let path = Self::config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<CompanionConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    config
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        config
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Overlay values read through `lookup`. Blank values are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(addr) = read("BODYDOUBLE_BIND") {
            self.bind_addr = addr;
        }
        if let Some(mode) = read("BODYDOUBLE_AUTH_MODE") {
            match AuthMode::parse(&mode) {
                Ok(mode) => self.auth_mode = mode,
                Err(e) => tracing::warn!("Ignoring BODYDOUBLE_AUTH_MODE: {}", e),
            }
        }
        if let Some(token) = read("BODYDOUBLE_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Some(path) = read("ACCOUNTS_DB_PATH") {
            self.database_path = path;
        }

        if let Some(url) = read("LETTA_BASE_URL") {
            self.letta_base_url = Some(url);
        }
        if let Some(key) = read("LETTA_API_KEY") {
            self.letta_api_key = Some(key);
        }
        if let Some(models) = read("LETTA_MODELS") {
            let models: Vec<String> = models
                .split(',')
                .map(str::trim)
                .filter(|model| !model.is_empty())
                .map(str::to_string)
                .collect();
            if !models.is_empty() {
                self.agent_models = models;
            }
        }
        if let Some(secs) = read("AGENT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.agent_timeout_secs = secs;
        }

        if let Some(url) = read("FISH_API_URL") {
            self.fish_api_url = url;
        }
        if let Some(key) = read("FISH_API_KEY") {
            self.fish_api_key = Some(key);
        }
        if let Some(model) = read("FISH_MODEL") {
            self.fish_model = model;
        }
        if let Some(reference) = read("FISH_VOICE_REFERENCE_ID") {
            self.fish_voice_reference_id = Some(reference);
        }
        if let Some(secs) = read("SPEECH_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.speech_timeout_secs = secs;
        }

        if let Some(url) = read("COMPOSIO_API_URL") {
            self.composio_api_url = url;
        }
        if let Some(key) = read("COMPOSIO_API_KEY") {
            self.composio_api_key = Some(key);
        }
        if let Some(config_id) = read("COMPOSIO_GMAIL_AUTH_CONFIG") {
            self.composio_gmail_auth_config = Some(config_id);
        }

        if let Some(secs) = read("FOLLOWUP_DELAY_SEC").and_then(|v| v.parse().ok()) {
            self.followup_delay_secs = secs;
        }
        if let Some(minutes) = read("DEFAULT_FOCUS_MIN").and_then(|v| v.parse().ok()) {
            self.default_focus_min = minutes;
        }
        if let Some(minutes) = read("DEFAULT_BREAK_MIN").and_then(|v| v.parse().ok()) {
            self.default_break_min = minutes;
        }
    }

    /// Base URL of the agent service, or `None` when it is not configured.
    /// A bare API key selects the hosted service.
    pub fn letta_endpoint(&self) -> Option<String> {
        let non_blank = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        if let Some(url) = non_blank(&self.letta_base_url) {
            return Some(url.trim_end_matches('/').to_string());
        }
        non_blank(&self.letta_api_key).map(|_| HOSTED_LETTA_URL.to_string())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs.max(1))
    }

    pub fn speech_timeout(&self) -> Duration {
        Duration::from_secs(self.speech_timeout_secs.max(1))
    }

    pub fn followup_delay(&self) -> Duration {
        Duration::from_secs(self.followup_delay_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_product_timings() {
        let config = CompanionConfig::default();
        assert_eq!(config.followup_delay_secs, 600);
        assert_eq!(config.default_focus_min, 25);
        assert_eq!(config.default_break_min, 5);
        assert_eq!(config.agent_models.len(), 4);
        assert_eq!(config.auth_mode, AuthMode::Disabled);
    }

    #[test]
    fn env_overrides_replace_fields_and_skip_blanks() {
        let mut config = CompanionConfig::default();
        config.apply_env_overrides(lookup_from(&[
            ("FOLLOWUP_DELAY_SEC", "30"),
            ("DEFAULT_FOCUS_MIN", "not-a-number"),
            ("FISH_API_KEY", "  "),
            ("LETTA_MODELS", "a/b, c ,"),
            ("BODYDOUBLE_AUTH_MODE", "required"),
        ]));
        assert_eq!(config.followup_delay_secs, 30);
        assert_eq!(config.default_focus_min, 25);
        assert!(config.fish_api_key.is_none());
        assert_eq!(config.agent_models, vec!["a/b".to_string(), "c".to_string()]);
        assert_eq!(config.auth_mode, AuthMode::Required);
    }

    #[test]
    fn letta_endpoint_prefers_base_url_then_hosted_key() {
        let mut config = CompanionConfig::default();
        assert!(config.letta_endpoint().is_none());

        config.letta_api_key = Some("key".to_string());
        assert_eq!(config.letta_endpoint().as_deref(), Some(HOSTED_LETTA_URL));

        config.letta_base_url = Some("http://localhost:8283/".to_string());
        assert_eq!(
            config.letta_endpoint().as_deref(),
            Some("http://localhost:8283")
        );
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: CompanionConfig =
            toml::from_str("followup_delay_secs = 5\nauth_mode = \"required\"\n")
                .expect("parse config");
        assert_eq!(config.followup_delay_secs, 5);
        assert_eq!(config.auth_mode, AuthMode::Required);
        assert_eq!(config.fish_model, "s1");
    }

    #[test]
    fn parse_auth_mode_rejects_unknown() {
        assert_eq!(AuthMode::parse("off").unwrap(), AuthMode::Disabled);
        assert!(AuthMode::parse("nope").is_err());
    }
}
