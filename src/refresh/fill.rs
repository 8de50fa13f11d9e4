use crate::frame::{ColumnRole, ColumnValues, SampleFrame};
use std::collections::HashMap;
use std::ops::Range;

/// Devices and gateways whose rows never reach the filled table.
#[derive(Clone, Debug, Default)]
pub struct RowFilters {
    pub excluded_devices: Vec<String>,
    pub excluded_gateways: Vec<String>,
}

impl RowFilters {
    fn excludes(&self, device: &str, gateway: Option<&str>) -> bool {
        self.excluded_devices.iter().any(|d| d == device)
            || gateway.is_some_and(|gw| self.excluded_gateways.iter().any(|g| g == gw))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrepareStats {
    pub repaired: usize,
    pub excluded: usize,
    pub unkeyed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FillStats {
    pub rows: usize,
    pub devices: usize,
    pub columns: usize,
}

/// Device ids arrive both as text and as floats rendered to text
/// (`"200401.0"`).
pub fn normalize_device_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Normalizes device ids, recovers missing ones from the gateway map, and
/// drops rows that are excluded or still cannot be keyed.
pub fn prepare(
    frame: &mut SampleFrame,
    filters: &RowFilters,
    gateway_devices: &HashMap<String, String>,
    gateway_column: &str,
) -> PrepareStats {
    let mut stats = PrepareStats::default();
    let gateways: Vec<Option<String>> = match frame.column(gateway_column) {
        Some(ColumnValues::Text(values)) => values.clone(),
        _ => vec![None; frame.len()],
    };
    let timestamps: Vec<bool> = (0..frame.len())
        .map(|row| frame.timestamp(row).is_some())
        .collect();

    let Some(devices) = frame.devices_mut() else {
        stats.unkeyed = frame.len();
        let drop_all = vec![false; frame.len()];
        frame.retain(&drop_all);
        return stats;
    };

    let mut keep = Vec::with_capacity(devices.len());
    for (row, device) in devices.iter_mut().enumerate() {
        let gateway = gateways.get(row).and_then(Option::as_deref);
        let mut normalized = device.as_deref().and_then(normalize_device_id);
        if normalized.is_none() {
            normalized = gateway
                .and_then(|gw| gateway_devices.get(gw))
                .and_then(|d| normalize_device_id(d));
            if normalized.is_some() {
                stats.repaired += 1;
            }
        }
        *device = normalized;

        let keyed = device.is_some() && timestamps.get(row).copied().unwrap_or(false);
        let wanted = match device.as_deref() {
            Some(id) if keyed => !filters.excludes(id, gateway),
            _ => false,
        };
        if !keyed {
            stats.unkeyed += 1;
        } else if !wanted {
            stats.excluded += 1;
        }
        keep.push(keyed && wanted);
    }

    frame.retain(&keep);
    stats
}

/// Sorts by (device, timestamp) and fills every metric column forward then
/// backward within each device. One pass per column.
pub fn gap_fill(frame: &mut SampleFrame) -> FillStats {
    let mut order: Vec<usize> = (0..frame.len()).collect();
    order.sort_by(|a, b| {
        (frame.device(*a), frame.timestamp(*a)).cmp(&(frame.device(*b), frame.timestamp(*b)))
    });
    frame.permute(&order);

    let groups = device_groups(frame);
    let mut columns = 0;
    for (spec, values) in frame.columns_mut() {
        if spec.role == ColumnRole::Metric {
            values.fill_groups(&groups);
            columns += 1;
        }
    }

    FillStats {
        rows: frame.len(),
        devices: groups.len(),
        columns,
    }
}

/// Contiguous runs of rows sharing a device. Requires a frame sorted by
/// device.
fn device_groups(frame: &SampleFrame) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    for row in 1..=frame.len() {
        if row == frame.len() || frame.device(row) != frame.device(start) {
            groups.push(start..row);
            start = row;
        }
    }
    groups
}
