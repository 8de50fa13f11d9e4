use crate::error::{RefreshError, RefreshResult, Scope};
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

/// 2h, 12h, 2d, 7d, 14d, 90d, 180d, 365d.
const LOOKBACK_HOURS: [i64; 8] = [2, 12, 48, 168, 336, 2_160, 4_320, 8_760];

/// Finds the newest timestamp already present in a table by searching
/// successively wider lookback windows.
#[derive(Clone, Debug)]
pub struct WatermarkResolver {
    lookbacks: Vec<ChronoDuration>,
}

impl Default for WatermarkResolver {
    fn default() -> Self {
        Self::new(LOOKBACK_HOURS.iter().map(|h| ChronoDuration::hours(*h)).collect())
    }
}

/// Watermark for a set of devices resolved together.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchWatermark {
    /// Oldest of the per-device watermarks; the batch is loaded from here.
    pub floor: DateTime<Utc>,
    pub per_device: HashMap<String, DateTime<Utc>>,
}

impl BatchWatermark {
    pub fn uniform(floor: DateTime<Utc>) -> Self {
        Self {
            floor,
            per_device: HashMap::new(),
        }
    }

    /// Rows for `device` at or before this instant are already filled.
    pub fn for_device(&self, device: &str) -> DateTime<Utc> {
        self.per_device
            .get(device)
            .copied()
            .map_or(self.floor, |ts| ts.max(self.floor))
    }
}

impl WatermarkResolver {
    pub fn new(lookbacks: Vec<ChronoDuration>) -> Self {
        Self { lookbacks }
    }

    pub async fn latest<S: TimeSeriesStore>(
        &self,
        store: &mut S,
        table: &str,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> RefreshResult<DateTime<Utc>> {
        for lookback in &self.lookbacks {
            let since = now - *lookback;
            if let Some(latest) = store.max_timestamp(table, since, device).await? {
                tracing::debug!(
                    table,
                    device = device.unwrap_or("*"),
                    lookback_hours = lookback.num_hours(),
                    %latest,
                    "resolved watermark"
                );
                return Ok(latest);
            }
        }

        Err(RefreshError::WatermarkNotFound {
            table: table.to_string(),
            scope: Scope::device(device),
        })
    }

    /// Like [`Self::latest`], but fails with `StaleWatermark` when the
    /// result is older than `now - threshold`.
    pub async fn latest_within<S: TimeSeriesStore>(
        &self,
        store: &mut S,
        table: &str,
        device: Option<&str>,
        now: DateTime<Utc>,
        threshold: ChronoDuration,
    ) -> RefreshResult<DateTime<Utc>> {
        let latest = self.latest(store, table, device, now).await?;
        ensure_fresh(table, Scope::device(device), latest, now, threshold)
    }

    /// Per-device watermarks for `devices`, taken from the narrowest window
    /// in which any of them has rows. The floor is the minimum of those.
    pub async fn batch<S: TimeSeriesStore>(
        &self,
        store: &mut S,
        table: &str,
        devices: &[String],
        now: DateTime<Utc>,
    ) -> RefreshResult<BatchWatermark> {
        for lookback in &self.lookbacks {
            let since = now - *lookback;
            let per_device = store.device_max_timestamps(table, since, devices).await?;
            if let Some(floor) = per_device.values().min().copied() {
                tracing::debug!(
                    table,
                    devices = devices.len(),
                    found = per_device.len(),
                    lookback_hours = lookback.num_hours(),
                    %floor,
                    "resolved batch watermark"
                );
                return Ok(BatchWatermark { floor, per_device });
            }
        }

        Err(RefreshError::WatermarkNotFound {
            table: table.to_string(),
            scope: Scope::batch(devices),
        })
    }
}

fn ensure_fresh(
    table: &str,
    scope: Scope,
    latest: DateTime<Utc>,
    now: DateTime<Utc>,
    threshold: ChronoDuration,
) -> RefreshResult<DateTime<Utc>> {
    let cutoff = now - threshold;
    if latest < cutoff {
        return Err(RefreshError::StaleWatermark {
            table: table.to_string(),
            scope,
            latest,
            threshold: cutoff,
        });
    }
    Ok(latest)
}
