use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::calendar_client::NylasConfig;
use crate::focus_optimizer::FocusTimeSettings;
use crate::pattern_learner::{DEFAULT_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS};
use crate::reschedule::{DEFAULT_MAX_DELAY_DAYS, MAX_DELAY_DAYS_LIMIT};
use crate::time_utils::{parse_hhmm, parse_timezone, parse_weekday, HourRange};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub calendar: CalendarConfig,
    pub scheduling: SchedulingConfig,
    pub focus: FocusTimeSettings,
    pub general: GeneralConfig,
}

/// Calendar backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalendarConfig {
    /// `"nylas"` or `"file"`
    pub provider: String,
    pub api_key: Option<String>,
    pub api_url: String,
    pub grant_id: Option<String>,
    /// JSON snapshot read and written by the `file` provider
    pub events_file: Option<PathBuf>,
    /// Used to find the user's own response among participants
    pub user_email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkingHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    pub timezone: String,
    pub working_hours: WorkingHours,
    pub lookback_days: u32,
    pub max_delay_days: u32,
    pub avoid_days: Vec<String>,
}

/// General application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    pub verbose: bool,
    pub request_timeout_secs: u64,
    pub analysis_timeout_secs: u64,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            provider: "nylas".to_string(),
            api_key: None,
            api_url: "https://api.us.nylas.com".to_string(),
            grant_id: None,
            events_file: None,
            user_email: None,
        }
    }
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            enabled: true,
            start: "09:00".to_string(),
            end: "17:00".to_string(),
        }
    }
}

impl WorkingHours {
    /// Whole hours used for bucketing. A start like 08:30 rounds up to 09.
    pub fn hour_range(&self) -> Result<HourRange> {
        if !self.enabled {
            return Ok(HourRange::new(0, 24)?);
        }
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        if start >= end {
            anyhow::bail!(
                "Working hours must start before they end, got {}-{}",
                self.start,
                self.end
            );
        }
        Ok(HourRange::new((start + 59) / 60, end / 60)?)
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            working_hours: WorkingHours::default(),
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            max_delay_days: DEFAULT_MAX_DELAY_DAYS,
            avoid_days: Vec::new(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            request_timeout_secs: 30,
            analysis_timeout_secs: 120,
        }
    }
}

impl GeneralConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_path(&Self::get_config_path())?.unwrap_or_default();
        dotenv::dotenv().ok();
        config.load_from_env();
        Ok(config)
    }

    /// Reads a config file, `None` when it does not exist
    pub fn load_from_path(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        Ok(Some(config))
    }

    fn load_from_env(&mut self) {
        self.apply_env(|key| env::var(key).ok());
    }

    /// Applies environment overrides looked up through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(api_key) = lookup("NYLAS_API_KEY") {
            self.calendar.api_key = Some(api_key);
        }
        if let Some(grant_id) = lookup("NYLAS_GRANT_ID") {
            self.calendar.grant_id = Some(grant_id);
        }
        if let Some(api_url) = lookup("NYLAS_API_URL") {
            self.calendar.api_url = api_url;
        }
        if let Some(provider) = lookup("CADENCE_PROVIDER") {
            self.calendar.provider = provider;
        }
        if let Some(path) = lookup("CADENCE_EVENTS_FILE") {
            self.calendar.events_file = Some(PathBuf::from(path));
        }
        if let Some(email) = lookup("CADENCE_USER_EMAIL") {
            self.calendar.user_email = Some(email);
        }
        if let Some(timezone) = lookup("CADENCE_TIMEZONE") {
            self.scheduling.timezone = timezone;
        }
        if let Some(verbose) = lookup("CADENCE_VERBOSE") {
            self.general.verbose = verbose.parse().unwrap_or(false);
        }
    }

    /// Save configuration to file
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory '{}'", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file '{}'", path.display()))?;
        Ok(())
    }

    /// Get the configuration file path
    pub fn get_config_path() -> PathBuf {
        // ~/.config/cadence/config.toml on every platform
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("cadence");
        path.push("config.toml");
        path
    }

    pub fn timezone(&self) -> Result<Tz> {
        Ok(parse_timezone(&self.scheduling.timezone)?)
    }

    pub fn nylas_config(&self) -> Result<NylasConfig> {
        let api_key = self
            .calendar
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No Nylas API key configured. Set NYLAS_API_KEY or run:\n  cadence config set calendar.api_key <key>"
                )
            })?;

        Ok(NylasConfig {
            api_key,
            api_url: self.calendar.api_url.clone(),
            timeout: self.general.request_timeout(),
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.calendar.provider.as_str() {
            "nylas" => {}
            "file" => {
                if self.calendar.events_file.is_none() {
                    return Err(anyhow::anyhow!(
                        "The 'file' provider needs calendar.events_file or --events-file"
                    ));
                }
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid provider: {}. Must be 'nylas' or 'file'",
                    other
                ));
            }
        }

        self.timezone()?;
        self.scheduling.working_hours.hour_range()?;

        for day in &self.scheduling.avoid_days {
            if parse_weekday(day).is_none() {
                return Err(anyhow::anyhow!("Unknown day in scheduling.avoid_days: {}", day));
            }
        }

        if self.scheduling.lookback_days == 0 || self.scheduling.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(anyhow::anyhow!(
                "scheduling.lookback_days must be between 1 and {}",
                MAX_LOOKBACK_DAYS
            ));
        }
        if self.scheduling.max_delay_days > MAX_DELAY_DAYS_LIMIT {
            return Err(anyhow::anyhow!(
                "scheduling.max_delay_days must be at most {}",
                MAX_DELAY_DAYS_LIMIT
            ));
        }

        self.focus.validate()?;

        if self.general.request_timeout_secs == 0 || self.general.analysis_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Timeouts must be greater than 0 seconds"));
        }

        Ok(())
    }

    /// Create a sample configuration file
    pub fn create_sample_config() -> Result<()> {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            println!("Configuration file already exists at: {}", config_path.display());
            return Ok(());
        }

        Self::default().save_to_path(&config_path)?;

        println!("Created sample configuration file at: {}", config_path.display());
        println!("Please edit the file and set your calendar credentials, or use environment variables:");
        println!("  NYLAS_API_KEY=your_nylas_api_key");
        println!("  NYLAS_GRANT_ID=your_grant_id");

        Ok(())
    }

    /// Set a configuration value
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse::<T>()
                .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", key, value))
        }

        fn days(value: &str) -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(String::from)
                .collect()
        }

        match key {
            "calendar.provider" => match value {
                "nylas" | "file" => self.calendar.provider = value.to_string(),
                _ => {
                    return Err(anyhow::anyhow!(
                        "Invalid provider: {}. Must be 'nylas' or 'file'",
                        value
                    ))
                }
            },
            "calendar.api_key" => self.calendar.api_key = Some(value.to_string()),
            "calendar.api_url" => self.calendar.api_url = value.to_string(),
            "calendar.grant_id" => self.calendar.grant_id = Some(value.to_string()),
            "calendar.events_file" => self.calendar.events_file = Some(PathBuf::from(value)),
            "calendar.user_email" => self.calendar.user_email = Some(value.to_string()),
            "scheduling.timezone" => {
                parse_timezone(value)?;
                self.scheduling.timezone = value.to_string();
            }
            "scheduling.working_hours.enabled" => self.scheduling.working_hours.enabled = parse(key, value)?,
            "scheduling.working_hours.start" => {
                parse_hhmm(value)?;
                self.scheduling.working_hours.start = value.to_string();
            }
            "scheduling.working_hours.end" => {
                parse_hhmm(value)?;
                self.scheduling.working_hours.end = value.to_string();
            }
            "scheduling.lookback_days" => self.scheduling.lookback_days = parse(key, value)?,
            "scheduling.max_delay_days" => self.scheduling.max_delay_days = parse(key, value)?,
            "scheduling.avoid_days" => self.scheduling.avoid_days = days(value),
            "focus.enabled" => self.focus.enabled = parse(key, value)?,
            "focus.target_hours_per_week" => self.focus.target_hours_per_week = parse(key, value)?,
            "focus.min_block_duration" => self.focus.min_block_duration = parse(key, value)?,
            "focus.max_block_duration" => self.focus.max_block_duration = parse(key, value)?,
            "focus.protected_days" => self.focus.protected_days = days(value),
            "focus.auto_decline" => self.focus.auto_decline = parse(key, value)?,
            "focus.allow_urgent_override" => self.focus.allow_urgent_override = parse(key, value)?,
            "focus.require_approval" => self.focus.require_approval = parse(key, value)?,
            "focus.lookback_days" => self.focus.lookback_days = parse(key, value)?,
            "general.verbose" => self.general.verbose = parse(key, value)?,
            "general.request_timeout_secs" => self.general.request_timeout_secs = parse(key, value)?,
            "general.analysis_timeout_secs" => self.general.analysis_timeout_secs = parse(key, value)?,
            _ => {
                return Err(anyhow::anyhow!("Unknown configuration key: {}", key));
            }
        }
        Ok(())
    }

    /// Get available configuration keys
    pub fn get_available_keys() -> Vec<&'static str> {
        vec![
            "calendar.provider",
            "calendar.api_key",
            "calendar.api_url",
            "calendar.grant_id",
            "calendar.events_file",
            "calendar.user_email",
            "scheduling.timezone",
            "scheduling.working_hours.enabled",
            "scheduling.working_hours.start",
            "scheduling.working_hours.end",
            "scheduling.lookback_days",
            "scheduling.max_delay_days",
            "scheduling.avoid_days",
            "focus.enabled",
            "focus.target_hours_per_week",
            "focus.min_block_duration",
            "focus.max_block_duration",
            "focus.protected_days",
            "focus.auto_decline",
            "focus.allow_urgent_override",
            "focus.require_approval",
            "focus.lookback_days",
            "general.verbose",
            "general.request_timeout_secs",
            "general.analysis_timeout_secs",
        ]
    }
}

/// Configuration builder for programmatic configuration
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.config.calendar.provider = provider.to_string();
        self
    }

    pub fn events_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.calendar.events_file = Some(path.into());
        self
    }

    pub fn grant_id(mut self, grant_id: &str) -> Self {
        self.config.calendar.grant_id = Some(grant_id.to_string());
        self
    }

    pub fn user_email(mut self, email: &str) -> Self {
        self.config.calendar.user_email = Some(email.to_string());
        self
    }

    pub fn timezone(mut self, timezone: &str) -> Self {
        self.config.scheduling.timezone = timezone.to_string();
        self
    }

    pub fn working_hours(mut self, start: &str, end: &str) -> Self {
        self.config.scheduling.working_hours.start = start.to_string();
        self.config.scheduling.working_hours.end = end.to_string();
        self
    }

    pub fn focus(mut self, settings: FocusTimeSettings) -> Self {
        self.config.focus = settings;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.general.verbose = verbose;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.calendar.provider, "nylas");
        assert_eq!(config.calendar.api_url, "https://api.us.nylas.com");
        assert_eq!(config.scheduling.timezone, "UTC");
        assert_eq!(config.scheduling.lookback_days, 90);
        assert_eq!(config.scheduling.max_delay_days, 14);
        assert_eq!(config.focus.target_hours_per_week, 14.0);
        assert_eq!(config.general.analysis_timeout_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .provider("file")
            .events_file("/tmp/events.json")
            .grant_id("grant-1")
            .user_email("me@example.com")
            .timezone("Europe/Berlin")
            .working_hours("08:00", "16:00")
            .verbose(true)
            .build();

        assert_eq!(config.calendar.provider, "file");
        assert_eq!(config.calendar.grant_id, Some("grant-1".to_string()));
        assert_eq!(config.timezone().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.scheduling.working_hours.hour_range().unwrap(), HourRange { start: 8, end: 16 });
        assert!(config.general.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.scheduling.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
        config.scheduling.timezone = "America/New_York".to_string();
        assert!(config.validate().is_ok());

        config.scheduling.working_hours.start = "18:00".to_string();
        assert!(config.validate().is_err());
        config.scheduling.working_hours.start = "09:00".to_string();

        config.calendar.provider = "file".to_string();
        assert!(config.validate().is_err());
        config.calendar.events_file = Some(PathBuf::from("events.json"));
        assert!(config.validate().is_ok());

        config.scheduling.avoid_days = vec!["Caturday".to_string()];
        assert!(config.validate().is_err());
        config.scheduling.avoid_days.clear();

        config.scheduling.lookback_days = u32::MAX;
        assert!(config.validate().is_err());
        config.scheduling.lookback_days = MAX_LOOKBACK_DAYS;
        assert!(config.validate().is_ok());

        config.scheduling.max_delay_days = u32::MAX;
        assert!(config.validate().is_err());
        config.scheduling.max_delay_days = MAX_DELAY_DAYS_LIMIT;
        assert!(config.validate().is_ok());

        config.focus.lookback_days = MAX_LOOKBACK_DAYS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_working_hours_round_start_up() {
        let hours = WorkingHours {
            enabled: true,
            start: "08:30".to_string(),
            end: "17:30".to_string(),
        };
        assert_eq!(hours.hour_range().unwrap(), HourRange { start: 9, end: 17 });

        let disabled = WorkingHours {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(disabled.hour_range().unwrap(), HourRange { start: 0, end: 24 });

        let malformed = WorkingHours {
            start: "nine".to_string(),
            ..Default::default()
        };
        assert!(malformed.hour_range().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("NYLAS_API_KEY", "key-123"),
            ("NYLAS_GRANT_ID", "grant-9"),
            ("CADENCE_TIMEZONE", "Asia/Tokyo"),
            ("CADENCE_VERBOSE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.calendar.api_key.as_deref(), Some("key-123"));
        assert_eq!(config.calendar.grant_id.as_deref(), Some("grant-9"));
        assert_eq!(config.scheduling.timezone, "Asia/Tokyo");
        assert!(config.general.verbose);
        assert_eq!(config.calendar.provider, "nylas");

        let nylas = config.nylas_config().unwrap();
        assert_eq!(nylas.api_key, "key-123");
        assert_eq!(nylas.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_nylas_config_requires_key() {
        assert!(Config::default().nylas_config().is_err());
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::default();
        config.set_value("scheduling.timezone", "Europe/Paris").unwrap();
        config.set_value("scheduling.avoid_days", "Saturday, Sunday").unwrap();
        config.set_value("focus.target_hours_per_week", "10.5").unwrap();
        config.set_value("focus.auto_decline", "true").unwrap();

        assert_eq!(config.scheduling.timezone, "Europe/Paris");
        assert_eq!(config.scheduling.avoid_days, vec!["Saturday", "Sunday"]);
        assert_eq!(config.focus.target_hours_per_week, 10.5);
        assert!(config.focus.auto_decline);

        assert!(config.set_value("scheduling.timezone", "Nowhere/City").is_err());
        assert!(config.set_value("focus.min_block_duration", "an hour").is_err());
        assert!(config.set_value("calendar.provider", "outlook").is_err());
        assert!(config.set_value("unknown.key", "1").is_err());
    }

    #[test]
    fn test_every_listed_key_is_settable() {
        let samples: HashMap<&str, &str> = [
            ("scheduling.timezone", "UTC"),
            ("scheduling.working_hours.start", "09:00"),
            ("scheduling.working_hours.end", "17:00"),
            ("calendar.provider", "nylas"),
        ]
        .into_iter()
        .collect();

        for key in Config::get_available_keys() {
            let value = samples.get(key).copied().unwrap_or_else(|| {
                if key.ends_with("enabled")
                    || key.ends_with("verbose")
                    || key.ends_with("decline")
                    || key.ends_with("override")
                    || key.ends_with("approval")
                {
                    "true"
                } else {
                    "30"
                }
            });
            let mut config = Config::default();
            assert!(config.set_value(key, value).is_ok(), "key {} rejected {}", key, value);
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.calendar.grant_id = Some("grant-1".to_string());
        config.focus.protected_days = vec!["Friday".to_string()];
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[scheduling]\ntimezone = \"Europe/Berlin\"\n").unwrap();

        let loaded = Config::load_from_path(&path).unwrap().unwrap();
        assert_eq!(loaded.scheduling.timezone, "Europe/Berlin");
        assert_eq!(loaded.scheduling.working_hours, WorkingHours::default());
        assert_eq!(loaded.calendar.provider, "nylas");
        assert!(Config::load_from_path(&dir.path().join("missing.toml")).unwrap().is_none());
    }
}
