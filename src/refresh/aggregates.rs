use super::pace;
use crate::store::{TimeSeriesStore, Window};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// A continuous aggregate and the narrowest window worth refreshing it
/// over. Windows shorter than two buckets leave the newest bucket
/// unmaterialized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateView {
    pub name: String,
    pub min_window: ChronoDuration,
}

impl AggregateView {
    pub fn new(name: &str, min_window: ChronoDuration) -> Self {
        Self {
            name: name.to_string(),
            min_window,
        }
    }
}

pub fn default_views() -> Vec<AggregateView> {
    vec![
        AggregateView::new(
            "time_series_mvca_20_minute_interval",
            ChronoDuration::minutes(40),
        ),
        AggregateView::new("time_series_mvca_1_hour_interval", ChronoDuration::hours(2)),
        AggregateView::new("time_series_mvca_3_hour_interval", ChronoDuration::hours(6)),
        AggregateView::new("time_series_mvca_6_hour_interval", ChronoDuration::hours(12)),
        AggregateView::new(
            "time_series_mvca_24_hour_interval",
            ChronoDuration::hours(48),
        ),
    ]
}

/// `[start, end]`, with `start` pulled back so the window is at least
/// `min_window` long. Never narrows.
pub fn refresh_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    min_window: ChronoDuration,
) -> Window {
    if end - start < min_window {
        Window::new(end - min_window, end)
    } else {
        Window::new(start, end)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
}

/// Refreshes every view over `[since, now]`, one at a time. A failing view
/// is logged and skipped.
pub async fn refresh_views<S: TimeSeriesStore>(
    store: &mut S,
    views: &[AggregateView],
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    pacing: Duration,
) -> RefreshReport {
    let mut report = RefreshReport::default();
    for view in views {
        let window = refresh_window(since, now, view.min_window);
        tracing::info!(
            view = %view.name,
            window_start = %window.start,
            window_end = %window.end,
            "force-refreshing continuous aggregate"
        );
        match store
            .refresh_aggregate(&view.name, window.start, window.end)
            .await
        {
            Ok(()) => report.refreshed.push(view.name.clone()),
            Err(err) => {
                tracing::error!(
                    view = %view.name,
                    window_start = %window.start,
                    window_end = %window.end,
                    error = %err,
                    "continuous aggregate refresh failed"
                );
                report.failed.push(view.name.clone());
            }
        }
        pace(pacing).await;
    }
    report
}
