use super::watermark::WatermarkResolver;
use crate::alert::Alerter;
use crate::store::TimeSeriesStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalenessCheck {
    pub table: String,
    pub device: Option<String>,
}

impl StalenessCheck {
    pub fn table(table: &str) -> Self {
        Self {
            table: table.to_string(),
            device: None,
        }
    }

    /// Parses `table` or `table:device`.
    pub fn parse(entry: &str) -> Option<Self> {
        let (table, device) = match entry.split_once(':') {
            Some((table, device)) => (table.trim(), Some(device.trim())),
            None => (entry.trim(), None),
        };
        if table.is_empty() || device.is_some_and(str::is_empty) {
            return None;
        }
        Some(Self {
            table: table.to_string(),
            device: device.map(str::to_string),
        })
    }
}

/// Checks from configuration entries. Malformed entries are logged and left
/// out; no entries at all means the raw and filled tables.
pub fn checks_from_entries(
    entries: &[String],
    raw_table: &str,
    filled_table: &str,
) -> Vec<StalenessCheck> {
    let checks: Vec<StalenessCheck> = entries
        .iter()
        .filter_map(|entry| {
            let check = StalenessCheck::parse(entry);
            if check.is_none() {
                tracing::warn!(entry = %entry, "ignoring malformed staleness check");
            }
            check
        })
        .collect();
    if checks.is_empty() {
        return vec![
            StalenessCheck::table(raw_table),
            StalenessCheck::table(filled_table),
        ];
    }
    checks
}

/// Checks that each table has rows newer than `now - threshold`. Problems
/// are sent to `alerter` by email and SMS; nothing is raised. Returns the
/// number of checks that alerted.
pub async fn check_tables<S: TimeSeriesStore, A: Alerter>(
    store: &mut S,
    alerter: &A,
    resolver: &WatermarkResolver,
    checks: &[StalenessCheck],
    threshold: ChronoDuration,
    now: DateTime<Utc>,
) -> usize {
    let mut alerted = 0;
    for check in checks {
        let device = check.device.as_deref();
        match resolver
            .latest_within(store, &check.table, device, now, threshold)
            .await
        {
            Ok(latest) => tracing::debug!(
                table = %check.table,
                device = device.unwrap_or("*"),
                %latest,
                "table is fresh"
            ),
            Err(err) => {
                tracing::error!(
                    table = %check.table,
                    device = device.unwrap_or("*"),
                    threshold_minutes = threshold.num_minutes(),
                    error = %err,
                    "staleness check failed"
                );
                alerter.notify(&err, "staleness check", true, true).await;
                alerted += 1;
            }
        }
    }
    alerted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixed_now, sample_frame, MemoryStore, RecordingAlerter, Row};

    #[tokio::test]
    async fn stale_and_empty_tables_alert_without_failing() {
        let now = fixed_now();
        let mut store = MemoryStore::default()
            .with_table(
                "time_series",
                sample_frame(vec![
                    Row::new("A", now - ChronoDuration::minutes(5)).metric("spm", 1.0),
                    Row::new("B", now - ChronoDuration::hours(4)).metric("spm", 1.0),
                ]),
            )
            .with_table(
                "time_series_locf",
                sample_frame(vec![
                    Row::new("A", now - ChronoDuration::hours(3)).metric("spm", 1.0)
                ]),
            );
        let alerter = RecordingAlerter::default();
        let checks = [
            StalenessCheck::table("time_series"),
            StalenessCheck::table("time_series_locf"),
            StalenessCheck::parse("time_series:B").unwrap(),
            StalenessCheck::table("time_series_missing"),
        ];

        let alerted = check_tables(
            &mut store,
            &alerter,
            &WatermarkResolver::default(),
            &checks,
            ChronoDuration::hours(1),
            now,
        )
        .await;

        assert_eq!(alerted, 3);
        let alerts = alerter.recorded();
        assert!(alerts.iter().all(|a| a.email && a.sms));
        assert!(alerts[0].error.contains("time_series_locf"));
        assert!(alerts[1].error.contains("device 'B'"));
        assert!(alerts[2].error.contains("no timestamp found"));
    }

    #[test]
    fn parses_table_and_device_entries() {
        assert_eq!(
            StalenessCheck::parse(" time_series "),
            Some(StalenessCheck::table("time_series"))
        );
        assert_eq!(
            StalenessCheck::parse("time_series_locf:200401"),
            Some(StalenessCheck {
                table: "time_series_locf".to_string(),
                device: Some("200401".to_string()),
            })
        );
        assert_eq!(StalenessCheck::parse(""), None);
        assert_eq!(StalenessCheck::parse("time_series:"), None);
        assert_eq!(StalenessCheck::parse(":200401"), None);
    }

    #[test]
    fn empty_or_malformed_entries_fall_back_to_both_tables() {
        let defaults = checks_from_entries(&[], "time_series", "time_series_locf");
        assert_eq!(
            defaults,
            vec![
                StalenessCheck::table("time_series"),
                StalenessCheck::table("time_series_locf"),
            ]
        );
        assert_eq!(
            checks_from_entries(&[":".to_string()], "time_series", "time_series_locf"),
            defaults
        );

        let configured = checks_from_entries(
            &["time_series_locf:B".to_string(), "bogus:".to_string()],
            "time_series",
            "time_series_locf",
        );
        assert_eq!(configured.len(), 1);
        assert_eq!(configured[0].device.as_deref(), Some("B"));
    }
}
