use crate::{audio_utils, telemetry::TracingSettings};
use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Defines the supported realtime speech model providers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    OpenAI,
}

impl Provider {
    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Gemini => "models/gemini-2.5-flash-native-audio-preview-09-2025",
            Provider::OpenAI => "gpt-4o-realtime-preview-2024-10-01",
        }
    }
}

/// How participants are turned into an identity and a lesson context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContextStrategyKind {
    /// Metadata JSON plus the remote context API.
    Remote,
    /// Identity token only, local instruction template.
    Token,
    /// Metadata that carries its own lesson context.
    Embedded,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub realtime_model: String,
    pub temperature: f32,
    pub client_sample_rate: f64,
    pub context_strategy: ContextStrategyKind,
    pub context_api_base_url: Option<String>,
    pub tracing: Option<TracingSettings>,
    pub log_level: Level,
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var(
            "BIND_ADDRESS",
            SocketAddr::from(([0, 0, 0, 0], 3000)),
        )?;

        let provider_str =
            std::env::var("REALTIME_PROVIDER").unwrap_or_else(|_| "gemini".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            _ => Provider::Gemini,
        };

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok();

        match provider {
            Provider::OpenAI if openai_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
                ));
            }
            Provider::Gemini if gemini_api_key.is_none() => {
                return Err(ConfigError::MissingVar(
                    "GEMINI_API_KEY must be set for 'gemini' provider".to_string(),
                ));
            }
            _ => {}
        }

        let realtime_model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| provider.default_model().to_string());
        let temperature = parse_var("REALTIME_TEMPERATURE", 0.8f32)?;
        let client_sample_rate =
            parse_var("CLIENT_SAMPLE_RATE", audio_utils::DEFAULT_CLIENT_SAMPLE_RATE)?;
        if client_sample_rate <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "CLIENT_SAMPLE_RATE".to_string(),
                "sample rate must be positive".to_string(),
            ));
        }

        let strategy_str =
            std::env::var("CONTEXT_STRATEGY").unwrap_or_else(|_| "remote".to_string());
        let context_strategy = match strategy_str.to_lowercase().as_str() {
            "remote" => ContextStrategyKind::Remote,
            "token" => ContextStrategyKind::Token,
            "embedded" => ContextStrategyKind::Embedded,
            other => {
                return Err(ConfigError::InvalidValue(
                    "CONTEXT_STRATEGY".to_string(),
                    format!("'{}' is not one of remote, token, embedded", other),
                ));
            }
        };

        let context_api_base_url = std::env::var("CONTEXT_API_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        if context_strategy == ContextStrategyKind::Remote && context_api_base_url.is_none() {
            return Err(ConfigError::MissingVar(
                "CONTEXT_API_BASE_URL must be set for 'remote' context strategy".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            gemini_api_key,
            realtime_model,
            temperature,
            client_sample_rate,
            context_strategy,
            context_api_base_url,
            tracing: TracingSettings::from_env().ok(),
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            for var in [
                "BIND_ADDRESS",
                "REALTIME_PROVIDER",
                "OPENAI_API_KEY",
                "GEMINI_API_KEY",
                "REALTIME_MODEL",
                "REALTIME_TEMPERATURE",
                "CLIENT_SAMPLE_RATE",
                "CONTEXT_STRATEGY",
                "CONTEXT_API_BASE_URL",
                "LANGFUSE_HOST",
                "LANGFUSE_PUBLIC_KEY",
                "LANGFUSE_SECRET_KEY",
                "RUST_LOG",
            ] {
                env::remove_var(var);
            }
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
            env::set_var("CONTEXT_API_BASE_URL", "http://context.test");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.bind_address.to_string(), "0.0.0.0:3000");
        assert_eq!(config.provider, Provider::Gemini);
        assert_eq!(config.realtime_model, Provider::Gemini.default_model());
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.client_sample_rate, 24000.0);
        assert_eq!(config.context_strategy, ContextStrategyKind::Remote);
        assert_eq!(
            config.context_api_base_url.as_deref(),
            Some("http://context.test")
        );
        assert!(config.tracing.is_none());
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_openai_token_strategy() {
        clear_env_vars();
        unsafe {
            env::set_var("REALTIME_PROVIDER", "OpenAI");
            env::set_var("OPENAI_API_KEY", "test-openai-key");
            env::set_var("CONTEXT_STRATEGY", "token");
            env::set_var("REALTIME_TEMPERATURE", "0.6");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.provider, Provider::OpenAI);
        assert_eq!(config.realtime_model, Provider::OpenAI.default_model());
        assert_eq!(config.context_strategy, ContextStrategyKind::Token);
        assert_eq!(config.context_api_base_url, None);
        assert_eq!(config.temperature, 0.6);
    }

    #[test]
    #[serial]
    fn test_config_tracing_requires_all_settings() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("LANGFUSE_HOST", "https://langfuse.test");
            env::set_var("LANGFUSE_PUBLIC_KEY", "pk");
        }
        assert!(Config::from_env().unwrap().tracing.is_none());

        unsafe {
            env::set_var("LANGFUSE_SECRET_KEY", "sk");
        }
        let tracing = Config::from_env().unwrap().tracing.expect("tracing settings");
        assert_eq!(tracing.host, "https://langfuse.test");
    }

    #[test]
    #[serial]
    fn test_config_missing_provider_key() {
        clear_env_vars();
        unsafe {
            env::set_var("CONTEXT_API_BASE_URL", "http://context.test");
        }

        match Config::from_env().unwrap_err() {
            ConfigError::MissingVar(msg) => assert!(msg.contains("GEMINI_API_KEY")),
            _ => panic!("Expected MissingVar for GEMINI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_remote_requires_base_url() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
        }

        match Config::from_env().unwrap_err() {
            ConfigError::MissingVar(msg) => assert!(msg.contains("CONTEXT_API_BASE_URL")),
            _ => panic!("Expected MissingVar for CONTEXT_API_BASE_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("CONTEXT_STRATEGY", "magic");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CONTEXT_STRATEGY"),
            _ => panic!("Expected InvalidValue for CONTEXT_STRATEGY"),
        }

        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BIND_ADDRESS", "not-a-valid-address");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BIND_ADDRESS"),
            _ => panic!("Expected InvalidValue for BIND_ADDRESS"),
        }

        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }
}
