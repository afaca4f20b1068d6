//! Worker configuration from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mailhaus_providers::propertyradar::{DEFAULT_BASE_URL, PropertyRadarConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Queue timing and sizing. Page size belongs to the provider
/// (`PropertyRadarConfig::page_size`).
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub poll_interval: Duration,
    pub max_attempts: u32,
    pub files_per_cycle: usize,
    /// How long a claimed job stays leased without a progress update before
    /// another poller may take it over.
    pub lease: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_attempts: 3,
            files_per_cycle: 10,
            lease: Duration::from_secs(600),
        }
    }
}

/// Stuck-file reporting and retention.
#[derive(Debug, Clone, PartialEq)]
pub struct HousekeepingConfig {
    pub interval: Duration,
    pub stuck_after: Duration,
    pub retention_months: u32,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            stuck_after: Duration::from_secs(60 * 60),
            retention_months: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub payload_dir: PathBuf,
    pub property_radar: PropertyRadarConfig,
    pub queue: QueueConfig,
    pub housekeeping: HousekeepingConfig,
}

impl WorkerConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = match get("DATABASE_URL") {
            Some(url) => url,
            None => compose_database_url(&get)?,
        };

        let queue = QueueConfig {
            poll_interval: Duration::from_secs(parse_or(&get, "QUEUE_POLL_INTERVAL_SECS", 10u64)?),
            max_attempts: positive(&get, "QUEUE_MAX_ATTEMPTS", 3u32)?,
            files_per_cycle: parse_or(&get, "QUEUE_FILES_PER_CYCLE", 10usize)?,
            lease: Duration::from_secs(positive(&get, "QUEUE_LEASE_SECS", 600u64)?),
        };

        let housekeeping = HousekeepingConfig {
            interval: Duration::from_secs(positive(&get, "HOUSEKEEPING_INTERVAL_SECS", 3600u64)?),
            stuck_after: Duration::from_secs(60 * parse_or(&get, "PAYLOAD_STUCK_MINUTES", 60u64)?),
            retention_months: positive(&get, "PAYLOAD_RETENTION_MONTHS", 3u32)?,
        };

        let property_radar = PropertyRadarConfig {
            api_token: get("PROPERTY_RADAR_TOKEN"),
            base_url: get("PROPERTY_RADAR_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            timeout: Duration::from_secs(positive(&get, "PROPERTY_RADAR_TIMEOUT_SECS", 30u64)?),
            page_size: positive(&get, "QUEUE_PAGE_SIZE", 500u32)?,
        };

        Ok(Self {
            database_url,
            db_max_connections: positive(&get, "DB_MAX_CONNECTIONS", 5u32)?,
            payload_dir: get("PAYLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/payloads")),
            property_radar,
            queue,
            housekeeping,
        })
    }
}

fn compose_database_url(get: &impl Fn(&str) -> Option<String>) -> Result<String, ConfigError> {
    let host = get("PR_PG_HOST").ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let port: u16 = parse_or(get, "PR_PG_PORT", 5432u16)?;
    let user = get("PR_PG_USER").unwrap_or_else(|| "postgres".to_string());
    let database = get("PR_PG_DATABASE").unwrap_or_else(|| "mailhaus".to_string());
    let auth = match get("PR_PG_PASSWORD") {
        Some(password) => format!("{user}:{password}"),
        None => user,
    };
    Ok(format!("postgres://{auth}@{host}:{port}/{database}"))
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + ToString,
    T::Err: core::fmt::Display,
{
    let v = parse_or(get, key, default)?;
    if v <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(v)
}
