use super::watermark::BatchWatermark;
use crate::error::{RefreshError, RefreshResult};
use crate::frame::SampleFrame;
use crate::store::TimeSeriesStore;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Inserted(u64),
    /// The store already had some of these rows; the load was rolled back.
    Conflict,
}

/// Appends the rows of `frame` that are newer than their device's
/// watermark. Everything at or before it is already in `table`.
pub async fn load_new_rows<S: TimeSeriesStore>(
    store: &mut S,
    table: &str,
    mut frame: SampleFrame,
    watermark: &BatchWatermark,
) -> RefreshResult<LoadOutcome> {
    let keep: Vec<bool> = (0..frame.len())
        .map(|row| match (frame.device(row), frame.timestamp(row)) {
            (Some(device), Some(ts)) => ts.and_utc() > watermark.for_device(device),
            _ => false,
        })
        .collect();
    frame.retain(&keep);

    if frame.is_empty() {
        tracing::info!(table, floor = %watermark.floor, "no filled rows newer than the watermark");
        return Ok(LoadOutcome::Inserted(0));
    }

    let rows = frame.len();
    let payload = encode_csv(&frame)?;
    tracing::debug!(table, rows, bytes = payload.len(), "copying filled rows");

    match store.copy_rows(table, frame.specs(), payload).await {
        Ok(inserted) => {
            tracing::info!(table, rows = inserted, "bulk loaded filled rows");
            Ok(LoadOutcome::Inserted(inserted))
        }
        Err(RefreshError::DuplicateKey { table, message }) => {
            tracing::warn!(
                table = %table,
                rows,
                floor = %watermark.floor,
                error = %message,
                "duplicate key during bulk load; rolled back this batch"
            );
            Ok(LoadOutcome::Conflict)
        }
        Err(err) => Err(err),
    }
}

/// CSV body for `COPY ... (FORMAT csv, NULL '')`, columns in frame order.
pub fn encode_csv(frame: &SampleFrame) -> RefreshResult<Bytes> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(BytesMut::new().writer());
    for row in 0..frame.len() {
        writer.write_record(frame.cells(row).map(Option::unwrap_or_default))?;
    }
    let buffer = writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))?;
    Ok(buffer.into_inner().freeze())
}
