//! Incremental last-observation-carried-forward refresh.
//!
//! One run resolves how far the filled table already reaches, fills the raw
//! rows that arrived since (per device batch when asked to), appends them,
//! forces the continuous aggregates to recompute over the affected window
//! and finally checks both tables are fresh.

mod aggregates;
mod batcher;
mod bulk;
mod fill;
mod merge;
mod staleness;
mod watermark;


pub use aggregates::{default_views, AggregateView};
pub use fill::RowFilters;

use crate::alert::Alerter;
use crate::config::Config;
use crate::error::{RefreshResult, Scope};
use crate::frame::KeyColumns;
use crate::store::{DeviceDirectory, TimeSeriesStore};
use bulk::LoadOutcome;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use merge::MergeOutcome;
use staleness::StalenessCheck;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use watermark::{BatchWatermark, WatermarkResolver};

/// A filled table this far behind at startup means the previous run died.
const STARTUP_STALE_THRESHOLD_HOURS: i64 = 1;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub raw_table: String,
    pub filled_table: String,
    pub keys: KeyColumns,
    pub batch_size: usize,
    pub seed_lookback: ChronoDuration,
    pub forward_window: ChronoDuration,
    pub query_pacing: Duration,
    pub refresh_pacing: Duration,
    pub stale_threshold: ChronoDuration,
    pub staleness_checks: Vec<StalenessCheck>,
    pub startup_threshold: ChronoDuration,
    pub filters: RowFilters,
    pub history_start: DateTime<Utc>,
    pub views: Vec<AggregateView>,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            raw_table: config.raw_table.clone(),
            filled_table: config.filled_table.clone(),
            keys: KeyColumns::default(),
            batch_size: config.batch_size,
            seed_lookback: config.seed_lookback(),
            forward_window: config.forward_window(),
            query_pacing: config.query_pacing(),
            refresh_pacing: config.refresh_pacing(),
            stale_threshold: config.stale_threshold(),
            staleness_checks: staleness::checks_from_entries(
                &config.staleness_checks,
                &config.raw_table,
                &config.filled_table,
            ),
            startup_threshold: ChronoDuration::hours(STARTUP_STALE_THRESHOLD_HOURS),
            filters: RowFilters {
                excluded_devices: config.excluded_devices.clone(),
                excluded_gateways: config.excluded_gateways.clone(),
            },
            history_start: config.history_start,
            views: default_views(),
        }
    }

    /// Production defaults without pacing.
    #[cfg(test)]
    pub fn for_tables(raw_table: &str, filled_table: &str) -> Self {
        Self {
            raw_table: raw_table.to_string(),
            filled_table: filled_table.to_string(),
            keys: KeyColumns::default(),
            batch_size: 50,
            seed_lookback: ChronoDuration::hours(24),
            forward_window: ChronoDuration::days(90),
            query_pacing: Duration::ZERO,
            refresh_pacing: Duration::ZERO,
            stale_threshold: ChronoDuration::hours(1),
            staleness_checks: staleness::checks_from_entries(&[], raw_table, filled_table),
            startup_threshold: ChronoDuration::hours(STARTUP_STALE_THRESHOLD_HOURS),
            filters: RowFilters {
                excluded_devices: vec!["111111".to_string()],
                excluded_gateways: vec!["lambda_access".to_string()],
            },
            history_start: crate::testing::fixed_now() - ChronoDuration::days(365),
            views: default_views(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchOutcome {
    Loaded(u64),
    NoOp,
    Conflict,
    /// No watermark could be resolved; the batch was not attempted.
    Skipped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<BatchOutcome>,
    pub rows_inserted: u64,
    pub refresh_anchor: Option<DateTime<Utc>>,
    pub views_refreshed: usize,
    pub views_failed: usize,
    pub stale_alerts: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: BatchOutcome) {
        if let BatchOutcome::Loaded(rows) = outcome {
            self.rows_inserted += rows;
        }
        self.outcomes.push(outcome);
    }

    fn count(&self, wanted: fn(&BatchOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|outcome| wanted(outcome)).count()
    }

    pub fn no_ops(&self) -> usize {
        self.count(|o| matches!(o, BatchOutcome::NoOp))
    }

    pub fn conflicts(&self) -> usize {
        self.count(|o| matches!(o, BatchOutcome::Conflict))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, BatchOutcome::Skipped))
    }
}

pub(crate) async fn pace(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

pub struct Pipeline<'a, S, D, A> {
    store: &'a mut S,
    directory: &'a mut D,
    alerter: &'a A,
    settings: &'a PipelineSettings,
    resolver: WatermarkResolver,
    clock: fn() -> DateTime<Utc>,
}

impl<'a, S, D, A> Pipeline<'a, S, D, A>
where
    S: TimeSeriesStore,
    D: DeviceDirectory,
    A: Alerter,
{
    pub fn new(
        store: &'a mut S,
        directory: &'a mut D,
        alerter: &'a A,
        settings: &'a PipelineSettings,
    ) -> Self {
        Self {
            store,
            directory,
            alerter,
            settings,
            resolver: WatermarkResolver::default(),
            clock: Utc::now,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// One incremental refresh. Fatal errors are alerted by email and SMS
    /// before being returned.
    pub async fn run(&mut self, by_device: bool) -> anyhow::Result<RunSummary> {
        match self.run_inner(by_device).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                self.alerter.notify(&err, "locf refresh", true, true).await;
                Err(anyhow::Error::new(err).context("locf refresh run failed"))
            }
        }
    }

    async fn run_inner(&mut self, by_device: bool) -> RefreshResult<RunSummary> {
        let started = Instant::now();
        let settings = self.settings;
        let mut summary = RunSummary::default();

        summary.stale_alerts += staleness::check_tables(
            &mut *self.store,
            self.alerter,
            &self.resolver,
            &[StalenessCheck::table(&settings.filled_table)],
            settings.startup_threshold,
            (self.clock)(),
        )
        .await;

        // Includes devices no longer in service.
        let gateway_devices = self.directory.gateway_devices().await?;

        let batches: Vec<Option<Vec<String>>> = if by_device {
            let devices = self.directory.devices_in_service().await?;
            let batches = batcher::batch_devices(&devices, settings.batch_size);
            tracing::info!(
                devices = devices.len(),
                batches = batches.len(),
                batch_size = settings.batch_size,
                "processing power units in batches"
            );
            batches.into_iter().map(Some).collect()
        } else {
            vec![None]
        };

        let total = batches.len();
        for (idx, batch) in batches.iter().enumerate() {
            let devices = batch.as_deref();
            if let Some(devices) = devices {
                tracing::info!(
                    batch = idx + 1,
                    of = total,
                    scope = %Scope::batch(devices),
                    "starting batch"
                );
            }

            let watermark = match self.resolve_watermark(devices).await {
                Ok(watermark) => watermark,
                Err(err) if devices.is_some() => {
                    tracing::error!(batch = idx + 1, error = %err, "skipping batch without a watermark");
                    self.alerter.notify(&err, "batch watermark", true, false).await;
                    summary.record(BatchOutcome::Skipped);
                    continue;
                }
                Err(err) => return Err(err),
            };
            summary.refresh_anchor = Some(
                summary
                    .refresh_anchor
                    .map_or(watermark.floor, |anchor| anchor.min(watermark.floor)),
            );

            let outcome = self
                .process_batch(devices, &gateway_devices, &watermark)
                .await?;
            tracing::info!(batch = idx + 1, outcome = ?outcome, "batch finished");
            summary.record(outcome);
        }

        match summary.refresh_anchor {
            Some(since) => {
                let report = aggregates::refresh_views(
                    &mut *self.store,
                    &settings.views,
                    since,
                    (self.clock)(),
                    settings.refresh_pacing,
                )
                .await;
                summary.views_refreshed = report.refreshed.len();
                summary.views_failed = report.failed.len();
            }
            None => tracing::error!(
                "skipping continuous aggregate refresh: no batch produced a watermark"
            ),
        }

        // Last, so the steps above get a chance to fix what this checks.
        summary.stale_alerts += staleness::check_tables(
            &mut *self.store,
            self.alerter,
            &self.resolver,
            &settings.staleness_checks,
            settings.stale_threshold,
            (self.clock)(),
        )
        .await;

        tracing::info!(
            batches = summary.outcomes.len(),
            rows_inserted = summary.rows_inserted,
            no_ops = summary.no_ops(),
            conflicts = summary.conflicts(),
            skipped = summary.skipped(),
            views_refreshed = summary.views_refreshed,
            views_failed = summary.views_failed,
            stale_alerts = summary.stale_alerts,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "locf refresh completed"
        );
        Ok(summary)
    }

    async fn resolve_watermark(
        &mut self,
        devices: Option<&[String]>,
    ) -> RefreshResult<BatchWatermark> {
        let settings = self.settings;
        let table = &settings.filled_table;
        let now = (self.clock)();
        match devices {
            Some(devices) => {
                self.resolver
                    .batch(&mut *self.store, table, devices, now)
                    .await
            }
            None => self
                .resolver
                .latest(&mut *self.store, table, None, now)
                .await
                .map(BatchWatermark::uniform),
        }
    }

    async fn process_batch(
        &mut self,
        devices: Option<&[String]>,
        gateway_devices: &HashMap<String, String>,
        watermark: &BatchWatermark,
    ) -> RefreshResult<BatchOutcome> {
        let settings = self.settings;
        let merged = merge::merge_and_fill(
            &mut *self.store,
            settings,
            gateway_devices,
            watermark.floor,
            devices,
        )
        .await?;
        let frame = match merged {
            MergeOutcome::Filled(frame) => frame,
            MergeOutcome::NoOp => return Ok(BatchOutcome::NoOp),
        };
        pace(settings.query_pacing).await;

        let loaded =
            bulk::load_new_rows(&mut *self.store, &settings.filled_table, frame, watermark).await?;
        Ok(match loaded {
            LoadOutcome::Inserted(rows) => BatchOutcome::Loaded(rows),
            LoadOutcome::Conflict => BatchOutcome::Conflict,
        })
    }

    /// Development mode: recompute every view from the configured start of
    /// history up to now.
    pub async fn full_history(&mut self) -> RunSummary {
        let since = self.settings.history_start;
        tracing::info!(%since, views = self.settings.views.len(), "refreshing aggregates over full history");
        let report = aggregates::refresh_views(
            &mut *self.store,
            &self.settings.views,
            since,
            (self.clock)(),
            self.settings.refresh_pacing,
        )
        .await;
        RunSummary {
            refresh_anchor: Some(since),
            views_refreshed: report.refreshed.len(),
            views_failed: report.failed.len(),
            ..RunSummary::default()
        }
    }
}
