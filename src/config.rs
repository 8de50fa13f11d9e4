use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/locf-refresh/config.json";
const DEFAULT_HISTORY_START: &str = "2020-01-01T00:00:00Z";

fn setup_config_path() -> PathBuf {
    for key in ["LOCF_SETUP_CONFIG_PATH", "FLEET_SETUP_CONFIG_PATH"] {
        if let Ok(path) = env::var(key) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
    }
    PathBuf::from(DEFAULT_SETUP_CONFIG_PATH)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    metadata_database_url: Option<String>,
    #[serde(default)]
    locf_batch_size: Option<usize>,
    #[serde(default)]
    locf_stale_threshold_minutes: Option<i64>,
    #[serde(default)]
    alert_webhook_url: Option<String>,
    #[serde(default)]
    alert_token: Option<String>,
    #[serde(default)]
    excluded_devices: Option<Vec<String>>,
    #[serde(default)]
    excluded_gateways: Option<Vec<String>>,
    #[serde(default)]
    staleness_checks: Option<Vec<String>>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "locf-refresh failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    let mut bytes = contents.into_bytes();
    match simd_json::serde::from_slice(&mut bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "locf-refresh failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    env_value(key).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) {
    if env_value("LOCF_METADATA_DATABASE_URL").is_none() {
        if let Some(url) = overrides
            .metadata_database_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.metadata_database_url = normalize_database_url(url.to_string());
        }
    }
    if env_value("LOCF_BATCH_SIZE").is_none() {
        if let Some(value) = overrides.locf_batch_size.filter(|v| *v != 0) {
            config.batch_size = value;
        }
    }
    if env_value("LOCF_STALE_THRESHOLD_MINUTES").is_none() {
        if let Some(value) = overrides.locf_stale_threshold_minutes.filter(|v| *v > 0) {
            config.stale_threshold_minutes = value;
        }
    }
    if env_value("LOCF_ALERT_WEBHOOK_URL").is_none() {
        if let Some(url) = overrides
            .alert_webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.alert_webhook_url = Some(url.to_string());
        }
    }
    if env_value("LOCF_ALERT_TOKEN").is_none() {
        if let Some(token) = overrides.alert_token.as_deref().map(str::trim) {
            config.alert_token = if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            };
        }
    }
    if env_value("LOCF_EXCLUDED_DEVICES").is_none() {
        if let Some(devices) = overrides.excluded_devices.clone() {
            config.excluded_devices = devices;
        }
    }
    if env_value("LOCF_EXCLUDED_GATEWAYS").is_none() {
        if let Some(gateways) = overrides.excluded_gateways.clone() {
            config.excluded_gateways = gateways;
        }
    }
    if env_value("LOCF_STALENESS_CHECKS").is_none() {
        if let Some(checks) = overrides.staleness_checks.clone() {
            config.staleness_checks = checks;
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub metadata_database_url: String,
    pub schema: String,
    pub raw_table: String,
    pub filled_table: String,
    pub batch_size: usize,
    pub seed_lookback_hours: i64,
    pub forward_window_days: i64,
    pub query_pacing_ms: u64,
    pub refresh_pacing_ms: u64,
    pub stale_threshold_minutes: i64,
    pub excluded_devices: Vec<String>,
    pub excluded_gateways: Vec<String>,
    /// `table` or `table:device` entries; empty means the raw and filled
    /// tables.
    pub staleness_checks: Vec<String>,
    pub alert_webhook_url: Option<String>,
    pub alert_token: Option<String>,
    pub history_start: DateTime<Utc>,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides(&setup_config_path());

        let database_url = env_value("LOCF_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("LOCF_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);
        let metadata_database_url = env_value("LOCF_METADATA_DATABASE_URL")
            .map(normalize_database_url)
            .unwrap_or_else(|| database_url.clone());

        let history_start = match env_value("LOCF_HISTORY_START") {
            Some(raw) => parse_history_start(&raw)
                .with_context(|| format!("LOCF_HISTORY_START '{raw}' is not an RFC 3339 timestamp"))?,
            None => parse_history_start(DEFAULT_HISTORY_START)?,
        };

        let mut config = Self {
            database_url,
            metadata_database_url,
            schema: env_value("LOCF_SCHEMA").unwrap_or_else(|| "public".to_string()),
            raw_table: env_value("LOCF_RAW_TABLE").unwrap_or_else(|| "time_series".to_string()),
            filled_table: env_value("LOCF_FILLED_TABLE")
                .unwrap_or_else(|| "time_series_locf".to_string()),
            batch_size: env_parse("LOCF_BATCH_SIZE").filter(|v| *v > 0).unwrap_or(50),
            seed_lookback_hours: env_parse("LOCF_SEED_LOOKBACK_HOURS")
                .filter(|v| *v > 0)
                .unwrap_or(24),
            forward_window_days: env_parse("LOCF_FORWARD_WINDOW_DAYS")
                .filter(|v| *v > 0)
                .unwrap_or(90),
            query_pacing_ms: env_parse("LOCF_QUERY_PACING_MS").unwrap_or(250),
            refresh_pacing_ms: env_parse("LOCF_REFRESH_PACING_MS").unwrap_or(100),
            stale_threshold_minutes: env_parse("LOCF_STALE_THRESHOLD_MINUTES")
                .filter(|v| *v > 0)
                .unwrap_or(60),
            excluded_devices: env_list("LOCF_EXCLUDED_DEVICES")
                .unwrap_or_else(|| vec!["111111".to_string()]),
            excluded_gateways: env_list("LOCF_EXCLUDED_GATEWAYS")
                .unwrap_or_else(|| vec!["lambda_access".to_string()]),
            staleness_checks: env_list("LOCF_STALENESS_CHECKS").unwrap_or_default(),
            alert_webhook_url: env_value("LOCF_ALERT_WEBHOOK_URL"),
            alert_token: env_value("LOCF_ALERT_TOKEN"),
            history_start,
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }

        Ok(config)
    }

    pub fn seed_lookback(&self) -> ChronoDuration {
        ChronoDuration::hours(self.seed_lookback_hours)
    }

    pub fn forward_window(&self) -> ChronoDuration {
        ChronoDuration::days(self.forward_window_days)
    }

    pub fn query_pacing(&self) -> Duration {
        Duration::from_millis(self.query_pacing_ms)
    }

    pub fn refresh_pacing(&self) -> Duration {
        Duration::from_millis(self.refresh_pacing_ms)
    }

    pub fn stale_threshold(&self) -> ChronoDuration {
        ChronoDuration::minutes(self.stale_threshold_minutes)
    }
}

fn parse_history_start(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw.trim())?.with_timezone(&Utc))
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg2://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
