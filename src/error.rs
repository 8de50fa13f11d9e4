use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Which slice of a table a watermark lookup was scoped to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    All,
    Device(String),
    Batch { len: usize, first: String },
}

impl Scope {
    pub fn device(device: Option<&str>) -> Self {
        match device {
            Some(device) => Scope::Device(device.to_string()),
            None => Scope::All,
        }
    }

    pub fn batch(devices: &[String]) -> Self {
        match devices {
            [] => Scope::All,
            [only] => Scope::Device(only.clone()),
            [first, ..] => Scope::Batch {
                len: devices.len(),
                first: first.clone(),
            },
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::All => write!(f, "all devices"),
            Scope::Device(device) => write!(f, "device '{device}'"),
            Scope::Batch { len, first } => write!(f, "{len} devices starting at '{first}'"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no timestamp found in '{table}' for {scope} within any lookback window")]
    WatermarkNotFound { table: String, scope: Scope },

    #[error(
        "latest timestamp in '{table}' for {scope} is {latest}, older than the threshold {threshold}"
    )]
    StaleWatermark {
        table: String,
        scope: Scope,
        latest: DateTime<Utc>,
        threshold: DateTime<Utc>,
    },

    #[error("duplicate key while bulk loading '{table}': {message}")]
    DuplicateKey { table: String, message: String },

    #[error("table '{0}' has no columns or does not exist")]
    MissingTable(String),

    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),

    #[error("failed to encode bulk load payload: {0}")]
    Encode(#[from] csv::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type RefreshResult<T> = std::result::Result<T, RefreshError>;
