use std::{path::PathBuf, sync::Arc, time::Duration};

use thiserror::Error;
use warehouse::{
    BigQueryClient, BigQueryConfig, InMemoryWarehouse, TableRef, TokenSource, WarehouseClient,
    WarehouseError, bigquery::DEFAULT_ENDPOINT,
};

use crate::{IngestSettings, LatestViewRefresh};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const MEMORY_PROJECT_ID: &str = "local";
const MEMORY_DATASET_ID: &str = "macscan";
const MEMORY_TABLE_ID: &str = "scans";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid {key} value '{value}'")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarehouseBackend {
    BigQuery,
    Memory,
}

impl WarehouseBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BigQuery => "bigquery",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialConfig {
    AccessToken(String),
    KeyFile(PathBuf),
    Metadata,
}

impl CredentialConfig {
    pub fn token_source(&self) -> Result<TokenSource, WarehouseError> {
        match self {
            Self::AccessToken(token) => Ok(TokenSource::Static(token.clone())),
            Self::KeyFile(path) => TokenSource::from_key_file(path),
            Self::Metadata => Ok(TokenSource::metadata()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub bind_addr: String,
    pub http_workers: usize,
    pub backend: WarehouseBackend,
    pub credentials: CredentialConfig,
    pub bigquery: BigQueryConfig,
    pub ingest: IngestSettings,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvLookup { lookup };

        let backend = match env.get("MACSCAN_WAREHOUSE").as_deref() {
            None | Some("bigquery") => WarehouseBackend::BigQuery,
            Some("memory") => WarehouseBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "MACSCAN_WAREHOUSE",
                    value: other.to_string(),
                });
            }
        };

        let table = match backend {
            WarehouseBackend::BigQuery => TableRef::new(
                env.with_fallback("MACSCAN_PROJECT_ID", "GOOGLE_CLOUD_PROJECT")
                    .ok_or(ConfigError::Missing("MACSCAN_PROJECT_ID"))?,
                env.get("MACSCAN_DATASET_ID")
                    .ok_or(ConfigError::Missing("MACSCAN_DATASET_ID"))?,
                env.get("MACSCAN_TABLE_ID")
                    .ok_or(ConfigError::Missing("MACSCAN_TABLE_ID"))?,
            ),
            WarehouseBackend::Memory => TableRef::new(
                env.with_fallback("MACSCAN_PROJECT_ID", "GOOGLE_CLOUD_PROJECT")
                    .unwrap_or_else(|| MEMORY_PROJECT_ID.to_string()),
                env.get("MACSCAN_DATASET_ID")
                    .unwrap_or_else(|| MEMORY_DATASET_ID.to_string()),
                env.get("MACSCAN_TABLE_ID")
                    .unwrap_or_else(|| MEMORY_TABLE_ID.to_string()),
            ),
        };

        let latest_view = match env.get("MACSCAN_LATEST_VIEW_ID") {
            Some(view_id) => Some(LatestViewRefresh {
                view_id,
                strict: env.parse_bool("MACSCAN_LATEST_VIEW_STRICT")?.unwrap_or(false),
            }),
            None => None,
        };

        let credentials = if let Some(token) = env.get("MACSCAN_ACCESS_TOKEN") {
            CredentialConfig::AccessToken(token)
        } else if let Some(path) =
            env.with_fallback("MACSCAN_KEY_FILE", "GOOGLE_APPLICATION_CREDENTIALS")
        {
            CredentialConfig::KeyFile(PathBuf::from(path))
        } else {
            CredentialConfig::Metadata
        };

        let bind_addr = env
            .get("MACSCAN_BIND")
            .or_else(|| env.get("PORT").map(|port| format!("0.0.0.0:{port}")))
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());

        let http_workers = env
            .parse::<usize>("MACSCAN_HTTP_WORKERS")
            .filter(|workers| *workers > 0)
            .unwrap_or_else(default_http_workers);

        let request_timeout_ms = env
            .parse::<u64>("MACSCAN_REQUEST_TIMEOUT_MS")
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        Ok(Self {
            bind_addr,
            http_workers,
            backend,
            credentials,
            bigquery: BigQueryConfig {
                endpoint: env
                    .get("MACSCAN_BIGQUERY_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
                timeout: Duration::from_millis(request_timeout_ms),
            },
            ingest: IngestSettings { table, latest_view },
            logging: LoggingConfig {
                level: env
                    .get("MACSCAN_LOG_LEVEL")
                    .unwrap_or_else(|| "info".to_string()),
                json: env.parse_bool("MACSCAN_LOG_JSON")?.unwrap_or(false),
            },
        })
    }
}

/// Constructs the process-wide warehouse client. The returned handle is shared
/// by every request; for BigQuery it owns the connection pool and token cache.
pub fn build_warehouse_client(
    config: &RuntimeConfig,
) -> Result<Arc<dyn WarehouseClient>, WarehouseError> {
    match config.backend {
        WarehouseBackend::Memory => Ok(Arc::new(InMemoryWarehouse::new())),
        WarehouseBackend::BigQuery => {
            let token_source = config.credentials.token_source()?;
            Ok(Arc::new(BigQueryClient::new(
                config.bigquery.clone(),
                token_source,
            )?))
        }
    }
}

fn default_http_workers() -> usize {
    std::thread::available_parallelism()
        .map(|parallelism| parallelism.get().clamp(1, 32))
        .unwrap_or(4)
}

struct EnvLookup<F> {
    lookup: F,
}

impl<F> EnvLookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values read as absent.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn with_fallback(&self, primary: &str, fallback: &str) -> Option<String> {
        self.get(primary).or_else(|| self.get(fallback))
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|value| value.parse::<T>().ok())
    }

    fn parse_bool(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { key, value: raw }),
        }
    }
}
