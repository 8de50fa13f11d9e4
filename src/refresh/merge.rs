use super::fill;
use super::{pace, PipelineSettings};
use crate::error::{RefreshError, RefreshResult, Scope};
use crate::frame::SampleFrame;
use crate::store::{TimeSeriesStore, Window};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;

#[derive(Debug)]
pub enum MergeOutcome {
    /// Seed and raw rows merged and gap-filled, sorted by device then time.
    Filled(SampleFrame),
    /// The raw table has nothing after the watermark.
    NoOp,
}

/// Loads the already-filled seed window and the raw rows after
/// `watermark`, merges them and fills the gaps per device.
pub async fn merge_and_fill<S: TimeSeriesStore>(
    store: &mut S,
    settings: &PipelineSettings,
    gateway_devices: &HashMap<String, String>,
    watermark: DateTime<Utc>,
    devices: Option<&[String]>,
) -> RefreshResult<MergeOutcome> {
    let started = Instant::now();
    let scope = Scope::batch(devices.unwrap_or(&[]));

    let columns = store.table_columns(&settings.filled_table).await?;
    if columns.is_empty() {
        return Err(RefreshError::MissingTable(settings.filled_table.clone()));
    }

    let seed_window = Window::new(watermark - settings.seed_lookback, watermark);
    let mut frame = store
        .fetch_window(&settings.filled_table, &columns, seed_window, devices)
        .await?;
    tracing::debug!(
        table = %settings.filled_table,
        %scope,
        window_start = %seed_window.start,
        window_end = %seed_window.end,
        rows = frame.len(),
        "loaded seed window"
    );
    pace(settings.query_pacing).await;

    let raw_window = Window::new(watermark, watermark + settings.forward_window);
    let raw = store
        .fetch_window(&settings.raw_table, &columns, raw_window, devices)
        .await?;
    if raw.is_empty() {
        tracing::warn!(
            table = %settings.raw_table,
            %scope,
            window_start = %raw_window.start,
            window_end = %raw_window.end,
            "no new raw rows after the watermark; nothing to fill"
        );
        return Ok(MergeOutcome::NoOp);
    }
    let seed_rows = frame.len();
    let raw_rows = raw.len();
    frame.append(raw);

    let prepared = fill::prepare(
        &mut frame,
        &settings.filters,
        gateway_devices,
        &settings.keys.gateway,
    );
    if prepared.unkeyed > 0 {
        tracing::warn!(
            %scope,
            rows = prepared.unkeyed,
            "dropped rows with no device id or timestamp"
        );
    }
    let stats = fill::gap_fill(&mut frame);

    tracing::info!(
        %scope,
        seed_rows,
        raw_rows,
        repaired = prepared.repaired,
        excluded = prepared.excluded,
        rows = stats.rows,
        devices = stats.devices,
        columns = stats.columns,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "gap-filled window"
    );
    Ok(MergeOutcome::Filled(frame))
}
