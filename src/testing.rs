//! In-memory collaborators for exercising the pipeline without a database.

use crate::alert::Alerter;
use crate::error::{RefreshError, RefreshResult};
use crate::frame::{ColumnKind, ColumnSpec, ColumnValues, KeyColumns, SampleFrame};
use crate::store::{DeviceDirectory, TimeSeriesStore, Window};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Mutex;

pub fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

#[derive(Clone, Debug)]
pub struct Row {
    device: Option<String>,
    gateway: Option<String>,
    ts: DateTime<Utc>,
    metrics: Vec<(String, Option<f64>)>,
}

impl Row {
    pub fn new(device: &str, ts: DateTime<Utc>) -> Self {
        Self {
            device: Some(device.to_string()),
            gateway: None,
            ts,
            metrics: Vec::new(),
        }
    }

    pub fn unkeyed(ts: DateTime<Utc>) -> Self {
        Self {
            device: None,
            gateway: None,
            ts,
            metrics: Vec::new(),
        }
    }

    pub fn gateway(mut self, gateway: &str) -> Self {
        self.gateway = Some(gateway.to_string());
        self
    }

    pub fn metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.push((name.to_string(), Some(value)));
        self
    }

    pub fn null(mut self, name: &str) -> Self {
        self.metrics.push((name.to_string(), None));
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device.as_deref()
    }
}

/// Frame with the key columns plus one float column per metric name seen
/// in `rows`, in first-seen order.
pub fn sample_frame(rows: Vec<Row>) -> SampleFrame {
    let mut names: Vec<String> = Vec::new();
    for row in &rows {
        for (name, _) in &row.metrics {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    frame_with_metrics(&names, rows)
}

pub fn frame_with_metrics(metrics: &[&str], rows: Vec<Row>) -> SampleFrame {
    let keys = KeyColumns::default();
    let mut specs = vec![
        keys.spec("timestamp_utc", ColumnKind::Timestamp),
        keys.spec("gateway", ColumnKind::Text),
        keys.spec("power_unit", ColumnKind::Text),
    ];
    specs.extend(metrics.iter().map(|name| keys.spec(name, ColumnKind::Float)));

    let mut columns = vec![
        ColumnValues::Timestamp(rows.iter().map(|r| Some(r.ts.naive_utc())).collect()),
        ColumnValues::Text(rows.iter().map(|r| r.gateway.clone()).collect()),
        ColumnValues::Text(rows.iter().map(|r| r.device.clone()).collect()),
    ];
    for name in metrics {
        columns.push(ColumnValues::Float(
            rows.iter()
                .map(|r| {
                    r.metrics
                        .iter()
                        .find(|(metric, _)| metric == name)
                        .and_then(|(_, value)| *value)
                })
                .collect(),
        ));
    }
    SampleFrame::from_parts(specs, columns)
}

/// Values of one float column for one device, in frame order.
pub fn device_series(frame: &SampleFrame, device: &str, metric: &str) -> Vec<Option<f64>> {
    let Some(ColumnValues::Float(values)) = frame.column(metric) else {
        return Vec::new();
    };
    (0..frame.len())
        .filter(|row| frame.device(*row) == Some(device))
        .map(|row| values[row])
        .collect()
}

#[derive(Default)]
pub struct MemoryStore {
    tables: HashMap<String, SampleFrame>,
    pub max_timestamp_calls: Vec<(String, DateTime<Utc>, Option<String>)>,
    pub fetch_calls: Vec<(String, Window, Option<Vec<String>>)>,
    pub copy_calls: usize,
    pub refreshed: Vec<(String, DateTime<Utc>, DateTime<Utc>)>,
    pub failing_views: HashSet<String>,
    pub fail_copies: bool,
}

impl MemoryStore {
    pub fn with_table(mut self, name: &str, frame: SampleFrame) -> Self {
        self.tables.insert(name.to_string(), frame);
        self
    }

    pub fn table(&self, name: &str) -> Option<&SampleFrame> {
        self.tables.get(name)
    }

    fn rows_matching<'a>(
        frame: &'a SampleFrame,
        since: DateTime<Utc>,
    ) -> impl Iterator<Item = (Option<&'a str>, DateTime<Utc>)> + 'a {
        (0..frame.len()).filter_map(move |row| {
            let ts = frame.timestamp(row)?.and_utc();
            (ts >= since).then(|| (frame.device(row), ts))
        })
    }
}

fn protocol_error(message: &str) -> RefreshError {
    RefreshError::Database(sqlx::Error::Protocol(message.to_string()))
}

fn parse_cell(column: &mut ColumnValues, raw: &str) -> RefreshResult<()> {
    let bad = || protocol_error(&format!("bad COPY value '{raw}'"));
    let empty = raw.is_empty();
    match column {
        ColumnValues::Float(values) => values.push(if empty {
            None
        } else {
            Some(raw.parse::<f64>().map_err(|_| bad())?)
        }),
        ColumnValues::Int(values) => values.push(if empty {
            None
        } else {
            Some(raw.parse::<i64>().map_err(|_| bad())?)
        }),
        ColumnValues::Bool(values) => values.push(match raw {
            "" => None,
            "true" | "t" => Some(true),
            "false" | "f" => Some(false),
            _ => return Err(bad()),
        }),
        ColumnValues::Text(values) => values.push((!empty).then(|| raw.to_string())),
        ColumnValues::Timestamp(values) => values.push(if empty {
            None
        } else {
            Some(NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f").map_err(|_| bad())?)
        }),
    }
    Ok(())
}

fn row_keys(frame: &SampleFrame) -> Vec<(Option<String>, Option<NaiveDateTime>)> {
    (0..frame.len())
        .map(|row| (frame.device(row).map(str::to_string), frame.timestamp(row)))
        .collect()
}

impl TimeSeriesStore for MemoryStore {
    async fn max_timestamp(
        &mut self,
        table: &str,
        since: DateTime<Utc>,
        device: Option<&str>,
    ) -> RefreshResult<Option<DateTime<Utc>>> {
        self.max_timestamp_calls
            .push((table.to_string(), since, device.map(str::to_string)));
        let Some(frame) = self.tables.get(table) else {
            return Ok(None);
        };
        Ok(Self::rows_matching(frame, since)
            .filter(|(dev, _)| device.is_none() || *dev == device)
            .map(|(_, ts)| ts)
            .max())
    }

    async fn device_max_timestamps(
        &mut self,
        table: &str,
        since: DateTime<Utc>,
        devices: &[String],
    ) -> RefreshResult<HashMap<String, DateTime<Utc>>> {
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        let Some(frame) = self.tables.get(table) else {
            return Ok(latest);
        };
        for (device, ts) in Self::rows_matching(frame, since) {
            let Some(device) = device.filter(|d| devices.iter().any(|x| x == d)) else {
                continue;
            };
            let entry = latest.entry(device.to_string()).or_insert(ts);
            if ts > *entry {
                *entry = ts;
            }
        }
        Ok(latest)
    }

    async fn table_columns(&mut self, table: &str) -> RefreshResult<Vec<ColumnSpec>> {
        Ok(self
            .tables
            .get(table)
            .map(|frame| frame.specs().to_vec())
            .unwrap_or_default())
    }

    async fn fetch_window(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        window: Window,
        devices: Option<&[String]>,
    ) -> RefreshResult<SampleFrame> {
        self.fetch_calls
            .push((table.to_string(), window, devices.map(<[String]>::to_vec)));
        let mut frame = SampleFrame::empty(columns.to_vec());
        let Some(source) = self.tables.get(table) else {
            return Ok(frame);
        };

        let mut selected = source.clone();
        let keep: Vec<bool> = (0..selected.len())
            .map(|row| {
                let in_window = selected
                    .timestamp(row)
                    .map(|ts| ts.and_utc())
                    .is_some_and(|ts| ts > window.start && ts <= window.end);
                let wanted = devices.map_or(true, |devices| {
                    selected
                        .device(row)
                        .is_some_and(|device| devices.iter().any(|d| d == device))
                });
                in_window && wanted
            })
            .collect();
        selected.retain(&keep);
        frame.append(selected);
        Ok(frame)
    }

    async fn copy_rows(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        payload: Bytes,
    ) -> RefreshResult<u64> {
        self.copy_calls += 1;
        if self.fail_copies {
            return Err(protocol_error("connection reset during COPY"));
        }

        let mut values: Vec<ColumnValues> = columns
            .iter()
            .map(|column| ColumnValues::empty(column.kind))
            .collect();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(payload.as_ref());
        for record in reader.records() {
            let record = record?;
            for (idx, column) in values.iter_mut().enumerate() {
                parse_cell(column, record.get(idx).unwrap_or(""))?;
            }
        }
        let incoming = SampleFrame::from_parts(columns.to_vec(), values);

        let target = self
            .tables
            .entry(table.to_string())
            .or_insert_with(|| SampleFrame::empty(columns.to_vec()));
        let mut seen: HashSet<(Option<String>, Option<NaiveDateTime>)> =
            row_keys(target).into_iter().collect();
        for key in row_keys(&incoming) {
            if !seen.insert(key.clone()) {
                return Err(RefreshError::DuplicateKey {
                    table: table.to_string(),
                    message: format!("duplicate key value violates unique constraint: {key:?}"),
                });
            }
        }

        let inserted = incoming.len() as u64;
        target.append(incoming);
        Ok(inserted)
    }

    async fn refresh_aggregate(
        &mut self,
        view: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RefreshResult<()> {
        if self.failing_views.contains(view) {
            return Err(protocol_error(&format!("cannot refresh '{view}'")));
        }
        self.refreshed.push((view.to_string(), start, end));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDirectory {
    pub devices: Vec<String>,
    pub gateways: HashMap<String, String>,
}

impl DeviceDirectory for MemoryDirectory {
    async fn devices_in_service(&mut self) -> RefreshResult<Vec<String>> {
        Ok(self.devices.clone())
    }

    async fn gateway_devices(&mut self) -> RefreshResult<HashMap<String, String>> {
        Ok(self.gateways.clone())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedAlert {
    pub context: String,
    pub error: String,
    pub email: bool,
    pub sms: bool,
}

#[derive(Default)]
pub struct RecordingAlerter {
    pub alerts: Mutex<Vec<RecordedAlert>>,
}

impl RecordingAlerter {
    pub fn recorded(&self) -> Vec<RecordedAlert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl Alerter for RecordingAlerter {
    async fn notify(&self, error: &dyn Display, context: &str, via_email: bool, via_sms: bool) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(RecordedAlert {
                context: context.to_string(),
                error: error.to_string(),
                email: via_email,
                sms: via_sms,
            });
        }
    }
}
