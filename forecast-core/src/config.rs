use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use crate::{normalize::AlignmentPolicy, provider::ProviderId};

pub const DEFAULT_TIMEZONE: &str = "Europe/Moscow";
pub const DEFAULT_SIGNATURE: &str = "468 Forecasts";

/// Per-provider settings. Which fields are required depends on the provider:
/// OpenWeather needs `api_key`, MET Norway needs `user_agent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Overrides the provider endpoint (used by tests and proxies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Timeline alignment constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub cadence_hours: u32,
    pub tolerance_minutes: u32,
    pub horizon_days: u32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self { cadence_hours: 3, tolerance_minutes: 90, horizon_days: 5 }
    }
}

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IANA zone used for chart labels and daily summaries.
    pub timezone: String,

    /// Text stamped on every rendered chart.
    pub signature: String,

    /// Rendering budget added on top of both provider timeouts to form the
    /// overall run deadline.
    pub render_budget_secs: u64,

    pub alignment: AlignmentConfig,

    /// Example TOML:
    /// [providers.openweather]
    /// api_key = "..."
    ///
    /// [providers.metno]
    /// user_agent = "my-bot/1.0 (me@example.com)"
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            signature: DEFAULT_SIGNATURE.to_string(),
            render_budget_secs: 10,
            alignment: AlignmentConfig::default(),
            providers: HashMap::new(),
        }
    }
}

impl Config {
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("Invalid timezone '{}' in config: {e}", self.timezone))
    }

    pub fn alignment_policy(&self) -> Result<AlignmentPolicy> {
        let a = self.alignment;
        AlignmentPolicy::new(
            chrono::Duration::hours(a.cadence_hours.into()),
            chrono::Duration::minutes(a.tolerance_minutes.into()),
            chrono::Duration::days(a.horizon_days.into()),
        )
        .context("Invalid [alignment] section in config")
    }

    pub fn render_budget(&self) -> Duration {
        Duration::from_secs(self.render_budget_secs)
    }

    pub fn provider_config(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(id.as_str())
    }

    pub fn upsert_provider(&mut self, id: ProviderId, cfg: ProviderConfig) {
        self.providers.insert(id.as_str().to_string(), cfg);
    }

    /// Set/replace the OpenWeather API key, keeping other provider fields.
    pub fn set_api_key(&mut self, id: ProviderId, api_key: String) {
        self.providers.entry(id.as_str().to_string()).or_default().api_key = Some(api_key);
    }

    /// Set/replace the identifying User-Agent sent to MET Norway.
    pub fn set_user_agent(&mut self, id: ProviderId, user_agent: String) {
        self.providers.entry(id.as_str().to_string()).or_default().user_agent = Some(user_agent);
    }

    pub fn is_provider_configured(&self, id: ProviderId) -> bool {
        let Some(cfg) = self.provider_config(id) else {
            return false;
        };
        match id {
            ProviderId::MetNo => cfg.user_agent.is_some(),
            ProviderId::OpenWeather => cfg.api_key.is_some(),
        }
    }

    /// Load config from disk, or return defaults if it doesn't exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            // First run: no config file, return defaults.
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let cfg: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(cfg)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path()?)
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    fn project_dirs() -> Result<ProjectDirs> {
        ProjectDirs::from("dev", "forecast-compare", "forecast")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))
    }

    /// Path to the config file.
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.config_dir().join("config.toml"))
    }

    /// Path to the persistent per-chat settings file.
    pub fn settings_file_path() -> Result<PathBuf> {
        Ok(Self::project_dirs()?.data_dir().join("settings.toml"))
    }
}
