use std::time::Duration;
use tracing::Level;

/// Default duration of the authentication watchdog.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(7);
/// Default keychain service the credentials are stored under.
pub const DEFAULT_KEYCHAIN_SERVICE: &str = "rabbithole";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Settings for one Rabbithole session.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfig {
    pub url: String,
    pub auto_login: bool,
    pub auth_timeout: Duration,
    pub keychain_service: String,
    /// Playback volume in `0.0..=1.0`; `None` leaves the engine default.
    pub volume: Option<f32>,
    pub log_level: Level,
}

impl ClientConfig {
    /// A configuration for `url` with every other setting at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_login: true,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            keychain_service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
            volume: None,
            log_level: Level::INFO,
        }
    }

    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let url = std::env::var("RABBITHOLE_URL")
            .map_err(|_| ConfigError::MissingVar("RABBITHOLE_URL".to_string()))?;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "RABBITHOLE_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", url),
            ));
        }

        let auto_login = match std::env::var("RABBITHOLE_AUTO_LOGIN") {
            Ok(value) => parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "RABBITHOLE_AUTO_LOGIN".to_string(),
                    format!("'{}' is not a boolean", value),
                )
            })?,
            Err(_) => true,
        };

        let auth_timeout = match std::env::var("RABBITHOLE_AUTH_TIMEOUT_SECS") {
            Ok(value) => value.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                ConfigError::InvalidValue("RABBITHOLE_AUTH_TIMEOUT_SECS".to_string(), e.to_string())
            })?,
            Err(_) => DEFAULT_AUTH_TIMEOUT,
        };

        let keychain_service = std::env::var("RABBITHOLE_KEYCHAIN_SERVICE")
            .unwrap_or_else(|_| DEFAULT_KEYCHAIN_SERVICE.to_string());

        let volume = match std::env::var("RABBITHOLE_VOLUME") {
            Ok(value) => {
                let volume = value.parse::<f32>().map_err(|e| {
                    ConfigError::InvalidValue("RABBITHOLE_VOLUME".to_string(), e.to_string())
                })?;
                if !(0.0..=1.0).contains(&volume) {
                    return Err(ConfigError::InvalidValue(
                        "RABBITHOLE_VOLUME".to_string(),
                        format!("{} is outside 0.0..=1.0", volume),
                    ));
                }
                Some(volume)
            }
            Err(_) => None,
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            url,
            auto_login,
            auth_timeout,
            keychain_service,
            volume,
            log_level,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
