use std::{env, fmt, str::FromStr};

use thiserror::Error;

/// Whether the gateway keeps sessions alive across requests or treats every
/// request as an independent exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Stateful,
    Stateless,
}

impl FromStr for SessionMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stateful" => Ok(Self::Stateful),
            "stateless" => Ok(Self::Stateless),
            _ => Err(ConfigError::InvalidSessionMode),
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stateful => write!(f, "stateful"),
            Self::Stateless => write!(f, "stateless"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub session_mode: SessionMode,
    pub stale_timeout_ms: u64,
    pub allowed_origins: Option<Vec<String>>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub max_port_retries: u32,
    pub port_retry_delay_ms: u64,
    pub endpoint_path: String,
    pub api_token: Option<String>,
    pub auth_issuer: Option<String>,
    pub auth_resource: Option<String>,
    pub environment: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SESSION_MODE must be 'stateful' or 'stateless'")]
    InvalidSessionMode,
    #[error("SESSION_STALE_TIMEOUT_MS must be a positive integer")]
    InvalidStaleTimeout,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MAX_PORT_RETRIES must be a non-negative integer")]
    InvalidMaxRetries,
    #[error("PORT_RETRY_DELAY_MS must be a non-negative integer")]
    InvalidRetryDelay,
    #[error("MCP_ENDPOINT_PATH must start with '/'")]
    InvalidEndpointPath,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup so tests
    /// can run without mutating process-global environment state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let session_mode = non_empty("SESSION_MODE")
            .map(|value| value.parse::<SessionMode>())
            .transpose()?
            .unwrap_or(SessionMode::Stateful);

        let stale_timeout_ms = non_empty("SESSION_STALE_TIMEOUT_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|ms| *ms > 0)
                    .ok_or(ConfigError::InvalidStaleTimeout)
            })
            .transpose()?
            .unwrap_or(30 * 60 * 1000);

        let allowed_origins = non_empty("ALLOWED_ORIGINS").map(|value| {
            value
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect::<Vec<_>>()
        });

        let bind_addr = non_empty("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = non_empty("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);
        let max_port_retries = non_empty("MAX_PORT_RETRIES")
            .map(|value| {
                value
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidMaxRetries)
            })
            .transpose()?
            .unwrap_or(3);
        let port_retry_delay_ms = non_empty("PORT_RETRY_DELAY_MS")
            .map(|value| {
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidRetryDelay)
            })
            .transpose()?
            .unwrap_or(200);

        let endpoint_path = non_empty("MCP_ENDPOINT_PATH").unwrap_or_else(|| "/mcp".to_string());
        if !endpoint_path.starts_with('/') {
            return Err(ConfigError::InvalidEndpointPath);
        }

        let api_token = non_empty("MCP_API_TOKEN");
        let auth_issuer = non_empty("AUTH_ISSUER");
        let auth_resource = non_empty("AUTH_RESOURCE");
        let environment = non_empty("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        Ok(Self {
            session_mode,
            stale_timeout_ms,
            allowed_origins,
            bind_addr,
            bind_port,
            max_port_retries,
            port_retry_delay_ms,
            endpoint_path,
            api_token,
            auth_issuer,
            auth_resource,
            environment,
        })
    }
}
