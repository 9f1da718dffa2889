use std::path::PathBuf;
use std::time::Duration;

use haul_telemetry::{LogFormat, TelemetryConfig};
use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {detail}")]
    Invalid { name: &'static str, detail: String },
}

/// Process configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub database_path: PathBuf,
    /// Absent means the single-node in-memory store.
    pub redis_url: Option<String>,
    pub jwt_secret: SecretString,
    pub webhook_secret: SecretString,
    pub authority_base_url: String,
    pub authority_timeout: Duration,
    pub telemetry: TelemetryConfig,
}

impl RelayConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = match var("PORT") {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                detail: format!("not a port number: {raw}"),
            })?,
            None => 3001,
        };
        let environment = var("APP_ENV").unwrap_or_else(|| "development".to_string());
        let database_path =
            PathBuf::from(var("DATABASE_PATH").unwrap_or_else(|| "./haul.db".to_string()));
        let redis_url = var("REDIS_URL");

        let jwt_secret = var("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        let webhook_secret = var("WEBHOOK_SECRET").ok_or(ConfigError::Missing("WEBHOOK_SECRET"))?;

        let authority_base_url =
            var("AUTHORITY_BASE_URL").unwrap_or_else(|| "http://127.0.0.1:8000/api".to_string());
        let authority_timeout = match var("AUTHORITY_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(raw.parse().map_err(|_| ConfigError::Invalid {
                name: "AUTHORITY_TIMEOUT_MS",
                detail: format!("not a number of milliseconds: {raw}"),
            })?),
            None => Duration::from_secs(5),
        };

        let mut telemetry = TelemetryConfig::default();
        if let Some(raw) = var("LOG_LEVEL") {
            telemetry.log_level =
                TelemetryConfig::parse_level(&raw).map_err(|e| ConfigError::Invalid {
                    name: "LOG_LEVEL",
                    detail: e.to_string(),
                })?;
        }
        if let Some(raw) = var("LOG_FORMAT") {
            telemetry.format = raw.parse::<LogFormat>().map_err(|e| ConfigError::Invalid {
                name: "LOG_FORMAT",
                detail: e.to_string(),
            })?;
        }

        Ok(Self {
            host,
            port,
            environment,
            database_path,
            redis_url,
            jwt_secret: SecretString::from(jwt_secret),
            webhook_secret: SecretString::from(webhook_secret),
            authority_base_url,
            authority_timeout,
            telemetry,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
