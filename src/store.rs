//! Boundary with the relational store.
//!
//! The pipeline only talks to the time-series database through
//! [`TimeSeriesStore`] and to the device metadata database through
//! [`DeviceDirectory`]. Both are explicit context objects owned by one
//! invocation.

mod postgres;
mod sql;


pub use postgres::{PgDirectory, PgStore};

use crate::error::RefreshResult;
use crate::frame::{ColumnSpec, SampleFrame};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Time window between two instants. Row fetches treat it as `(start, end]`;
/// aggregate refreshes pass both bounds through unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

#[allow(async_fn_in_trait)]
pub trait TimeSeriesStore {
    /// Newest timestamp in `table` at or after `since`, optionally for one
    /// device only.
    async fn max_timestamp(
        &mut self,
        table: &str,
        since: DateTime<Utc>,
        device: Option<&str>,
    ) -> RefreshResult<Option<DateTime<Utc>>>;

    /// Newest timestamp per device for the given devices, looking no
    /// further back than `since`. Devices without rows are absent.
    async fn device_max_timestamps(
        &mut self,
        table: &str,
        since: DateTime<Utc>,
        devices: &[String],
    ) -> RefreshResult<HashMap<String, DateTime<Utc>>>;

    /// Declared columns of `table`, in table order.
    async fn table_columns(&mut self, table: &str) -> RefreshResult<Vec<ColumnSpec>>;

    /// Rows of `table` inside `window`, shaped as `columns`. Columns the
    /// table does not have come back as nulls. `None` devices means all.
    async fn fetch_window(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        window: Window,
        devices: Option<&[String]>,
    ) -> RefreshResult<SampleFrame>;

    /// Streams a CSV payload into `table` inside one transaction. A
    /// uniqueness violation rolls the transaction back and surfaces as
    /// [`crate::error::RefreshError::DuplicateKey`].
    async fn copy_rows(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        payload: bytes::Bytes,
    ) -> RefreshResult<u64>;

    /// Recomputes a continuous aggregate over `[start, end]`. Runs outside
    /// any transaction block.
    async fn refresh_aggregate(
        &mut self,
        view: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RefreshResult<()>;
}

#[allow(async_fn_in_trait)]
pub trait DeviceDirectory {
    /// Devices currently installed in the field, in a stable order.
    async fn devices_in_service(&mut self) -> RefreshResult<Vec<String>>;

    /// Gateway to device mapping, including devices no longer in service.
    async fn gateway_devices(&mut self) -> RefreshResult<HashMap<String, String>>;
}
