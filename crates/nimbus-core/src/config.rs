use config::{Environment, Map};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org/data/2.5";
pub const DEFAULT_POLL_MS: u64 = 60_000;

/// Prefix of the recognised environment variables (`WEATHER_API_KEY`, ...)
const ENV_PREFIX: &str = "WEATHER";
const CONFIG_FILE: &str = "config.toml";
const APP_DIR: &str = "nimbus";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding `config.toml` and persisted location state
    #[serde(skip)]
    pub config_dir: PathBuf,

    /// Weather API settings
    #[serde(default)]
    pub weather: WeatherSettings,

    /// Location fallback settings
    #[serde(default)]
    pub location: LocationConfig,
}

/// Weather provider endpoint and request options.
///
/// Every field can be overridden by a `WEATHER_<FIELD>` environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherSettings {
    /// Endpoint root, e.g. `https://api.openweathermap.org/data/2.5`
    pub base_url: String,

    /// Provider API key. Never written back to disk.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,

    /// `metric`, `imperial` or `standard`
    pub units: String,

    /// Language code for descriptions and place names
    pub lang: String,

    /// Default polling interval in milliseconds (0 disables polling)
    pub poll_ms: u64,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            units: "metric".to_string(),
            lang: "vi".to_string(),
            poll_ms: DEFAULT_POLL_MS,
        }
    }
}

impl WeatherSettings {
    /// Layer `WEATHER_*` environment variables over these settings.
    ///
    /// `env` replaces the process environment when given (used by tests).
    pub fn with_env_overrides(
        &self,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let layered = config::Config::builder()
            .add_source(config::Config::try_from(self)?)
            .add_source(Environment::with_prefix(ENV_PREFIX).source(env))
            .build()?;

        Ok(layered.try_deserialize()?)
    }

    /// The API key, or a configuration error if none is set.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(ConfigError::MissingSetting("WEATHER_API_KEY".to_string()));
        }
        Ok(key)
    }

    pub fn has_api_key(&self) -> bool {
        self.require_api_key().is_ok()
    }

    /// Polling interval, `None` when polling is disabled.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_ms > 0).then(|| Duration::from_millis(self.poll_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// City used when nothing has been persisted yet
    #[serde(default = "default_city")]
    pub default_city: String,
}

fn default_city() -> String {
    "Hanoi".to_string()
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            default_city: default_city(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self::with_dir(config_dir)
    }
}

impl Config {
    fn with_dir(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            weather: WeatherSettings::default(),
            location: LocationConfig::default(),
        }
    }

    /// Load configuration from the user config directory and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = Self::default_config_dir()?;
        Self::load_from(&config_dir, None)
    }

    /// Load configuration from `config_dir`, creating a default file if it doesn't exist,
    /// then apply `WEATHER_*` environment overrides.
    pub fn load_from(
        config_dir: &Path,
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(|e| {
                ConfigError::NotFound(format!("{}: {}", config_path.display(), e))
            })?;
            toml::from_str::<Config>(&contents)?
        } else {
            let config = Self::with_dir(config_dir.to_path_buf());
            if let Err(e) = config.save() {
                tracing::warn!("Could not write default config: {}", e);
            }
            config
        };

        config.config_dir = config_dir.to_path_buf();
        config.weather = config.weather.with_env_overrides(env)?;
        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult), ConfigError> {
        let config = Self::load()?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()));
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_url(&self.weather.base_url, "weather.base_url", &mut result);

        if !self.weather.has_api_key() {
            result.add_warning(
                "weather.api_key",
                "WEATHER_API_KEY is not set - every fetch will fail",
            );
        }

        if self.weather.poll_ms == 0 {
            result.add_warning("weather.poll_ms", "Weather polling disabled (0 ms)");
        } else if self.weather.poll_ms < 10_000 {
            result.add_warning(
                "weather.poll_ms",
                "Polling more often than every 10 seconds burns through API quota",
            );
        }

        if !matches!(
            self.weather.units.as_str(),
            "metric" | "imperial" | "standard"
        ) {
            result.add_warning(
                "weather.units",
                format!("Unknown units '{}', provider may reject it", self.weather.units),
            );
        }

        if self.location.default_city.trim().is_empty() {
            result.add_warning("location.default_city", "No default city configured");
        }

        result
    }

    fn validate_url(url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to file. The API key is left out.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = self.config_dir.join(CONFIG_FILE);

        std::fs::create_dir_all(&self.config_dir).map_err(|e| {
            ConfigError::Invalid(format!("Failed to create config directory: {}", e))
        })?;

        let mut on_disk = self.clone();
        on_disk.weather.api_key.clear();

        let contents = toml::to_string_pretty(&on_disk)
            .map_err(|e| ConfigError::Invalid(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&config_path, contents)
            .map_err(|e| ConfigError::Invalid(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    fn default_config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR))
            .ok_or_else(|| ConfigError::NotFound("user config directory".to_string()))
    }
}
