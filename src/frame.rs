//! Column-oriented buffer for time-series rows.
//!
//! Raw and filled telemetry share a wide schema (well over a hundred nullable
//! metric columns). Rows are stored one typed vector per column so the gap
//! fill can walk a single column at a time.

use chrono::NaiveDateTime;
use std::ops::Range;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Float,
    Int,
    Bool,
    Text,
    Timestamp,
}

impl ColumnKind {
    /// Maps an `information_schema.columns.data_type` value onto the
    /// representation used while the column is in memory. Arbitrary
    /// precision numbers stay text so they round-trip exactly.
    pub fn from_pg_type(data_type: &str) -> Self {
        match data_type.trim().to_ascii_lowercase().as_str() {
            "double precision" | "real" => ColumnKind::Float,
            "smallint" | "integer" | "bigint" => ColumnKind::Int,
            "boolean" => ColumnKind::Bool,
            "timestamp without time zone" | "timestamp with time zone" => ColumnKind::Timestamp,
            _ => ColumnKind::Text,
        }
    }

    pub fn pg_cast(&self) -> &'static str {
        match self {
            ColumnKind::Float => "float8",
            ColumnKind::Int => "int8",
            ColumnKind::Bool => "bool",
            ColumnKind::Text => "text",
            ColumnKind::Timestamp => "timestamp",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnRole {
    Device,
    Timestamp,
    Identifier,
    Metric,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
    pub role: ColumnRole,
}

/// Names of the key columns shared by the raw and filled tables.
#[derive(Clone, Debug)]
pub struct KeyColumns {
    pub device: String,
    pub timestamp: String,
    pub gateway: String,
    /// Identifier-like columns copied through untouched by the fill.
    pub passthrough: Vec<String>,
}

impl Default for KeyColumns {
    fn default() -> Self {
        Self {
            device: "power_unit".to_string(),
            timestamp: "timestamp_utc".to_string(),
            gateway: "gateway".to_string(),
            passthrough: vec!["timestamp_utc_inserted".to_string()],
        }
    }
}

impl KeyColumns {
    pub fn role_of(&self, name: &str) -> ColumnRole {
        if name == self.device {
            ColumnRole::Device
        } else if name == self.timestamp {
            ColumnRole::Timestamp
        } else if name == self.gateway || self.passthrough.iter().any(|col| col == name) {
            ColumnRole::Identifier
        } else {
            ColumnRole::Metric
        }
    }

    /// The device column is always held as text, whatever its declared
    /// type, so ids compare and normalize the same way everywhere.
    pub fn spec(&self, name: &str, kind: ColumnKind) -> ColumnSpec {
        let role = self.role_of(name);
        let kind = if role == ColumnRole::Device {
            ColumnKind::Text
        } else {
            kind
        };
        ColumnSpec {
            name: name.to_string(),
            kind,
            role,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValues {
    Float(Vec<Option<f64>>),
    Int(Vec<Option<i64>>),
    Bool(Vec<Option<bool>>),
    Text(Vec<Option<String>>),
    Timestamp(Vec<Option<NaiveDateTime>>),
}

macro_rules! with_values {
    ($column:expr, $values:ident => $body:expr) => {
        match $column {
            ColumnValues::Float($values) => $body,
            ColumnValues::Int($values) => $body,
            ColumnValues::Bool($values) => $body,
            ColumnValues::Text($values) => $body,
            ColumnValues::Timestamp($values) => $body,
        }
    };
}

impl ColumnValues {
    pub fn empty(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Float => ColumnValues::Float(Vec::new()),
            ColumnKind::Int => ColumnValues::Int(Vec::new()),
            ColumnKind::Bool => ColumnValues::Bool(Vec::new()),
            ColumnKind::Text => ColumnValues::Text(Vec::new()),
            ColumnKind::Timestamp => ColumnValues::Timestamp(Vec::new()),
        }
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnValues::Float(_) => ColumnKind::Float,
            ColumnValues::Int(_) => ColumnKind::Int,
            ColumnValues::Bool(_) => ColumnKind::Bool,
            ColumnValues::Text(_) => ColumnKind::Text,
            ColumnValues::Timestamp(_) => ColumnKind::Timestamp,
        }
    }

    pub fn len(&self) -> usize {
        with_values!(self, values => values.len())
    }

    fn push_nulls(&mut self, count: usize) {
        with_values!(self, values => values.extend(std::iter::repeat_with(|| None).take(count)))
    }

    fn append(&mut self, other: ColumnValues) {
        match (self, other) {
            (ColumnValues::Float(a), ColumnValues::Float(b)) => a.extend(b),
            (ColumnValues::Int(a), ColumnValues::Int(b)) => a.extend(b),
            (ColumnValues::Bool(a), ColumnValues::Bool(b)) => a.extend(b),
            (ColumnValues::Text(a), ColumnValues::Text(b)) => a.extend(b),
            (ColumnValues::Timestamp(a), ColumnValues::Timestamp(b)) => a.extend(b),
            (this, other) => {
                tracing::warn!(
                    left = ?this.kind(),
                    right = ?other.kind(),
                    "column kind mismatch while appending; padding with nulls"
                );
                this.push_nulls(other.len());
            }
        }
    }

    fn retain(&mut self, keep: &[bool]) {
        with_values!(self, values => {
            let mut flags = keep.iter();
            values.retain(|_| flags.next().copied().unwrap_or(false));
        })
    }

    fn permute(&mut self, order: &[usize]) {
        with_values!(self, values => {
            let mut old = std::mem::take(values);
            *values = order.iter().map(|&idx| old[idx].take()).collect();
        })
    }

    /// Forward fill then backward fill inside each group. Groups must be
    /// disjoint ranges over contiguous rows.
    pub fn fill_groups(&mut self, groups: &[Range<usize>]) {
        with_values!(self, values => {
            for group in groups {
                fill_forward_backward(&mut values[group.clone()]);
            }
        })
    }

    /// Text form of one cell as written to a `COPY ... (FORMAT csv)` stream.
    pub fn render(&self, row: usize) -> Option<String> {
        match self {
            ColumnValues::Float(values) => values.get(row)?.map(|v| v.to_string()),
            ColumnValues::Int(values) => values.get(row)?.map(|v| v.to_string()),
            ColumnValues::Bool(values) => values
                .get(row)?
                .map(|v| if v { "true" } else { "false" }.to_string()),
            ColumnValues::Text(values) => values.get(row)?.clone(),
            ColumnValues::Timestamp(values) => values
                .get(row)?
                .map(|v| v.format(TIMESTAMP_FORMAT).to_string()),
        }
    }
}

fn fill_forward_backward<T: Clone>(values: &mut [Option<T>]) {
    let mut last: Option<T> = None;
    for value in values.iter_mut() {
        match value {
            Some(current) => last = Some(current.clone()),
            None => *value = last.clone(),
        }
    }

    let mut next: Option<T> = None;
    for value in values.iter_mut().rev() {
        match value {
            Some(current) => next = Some(current.clone()),
            None => *value = next.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SampleFrame {
    specs: Vec<ColumnSpec>,
    columns: Vec<ColumnValues>,
    len: usize,
}

impl SampleFrame {
    #[cfg(test)]
    pub fn empty(specs: Vec<ColumnSpec>) -> Self {
        let columns = specs
            .iter()
            .map(|spec| ColumnValues::empty(spec.kind))
            .collect();
        Self {
            specs,
            columns,
            len: 0,
        }
    }

    /// Builds a frame from already-decoded columns. Columns shorter than the
    /// longest one are padded with nulls.
    pub fn from_parts(specs: Vec<ColumnSpec>, mut columns: Vec<ColumnValues>) -> Self {
        columns.truncate(specs.len());
        while columns.len() < specs.len() {
            columns.push(ColumnValues::empty(specs[columns.len()].kind));
        }
        let len = columns.iter().map(ColumnValues::len).max().unwrap_or(0);
        for column in &mut columns {
            let missing = len - column.len();
            if missing > 0 {
                column.push_nulls(missing);
            }
        }
        Self {
            specs,
            columns,
            len,
        }
    }

    pub fn specs(&self) -> &[ColumnSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn index_of_role(&self, role: ColumnRole) -> Option<usize> {
        self.specs.iter().position(|spec| spec.role == role)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValues> {
        let idx = self.specs.iter().position(|spec| spec.name == name)?;
        self.columns.get(idx)
    }

    pub fn columns_mut(&mut self) -> impl Iterator<Item = (&ColumnSpec, &mut ColumnValues)> {
        self.specs.iter().zip(self.columns.iter_mut())
    }

    pub fn cells(&self, row: usize) -> impl Iterator<Item = Option<String>> + '_ {
        self.columns.iter().map(move |column| column.render(row))
    }

    pub fn device(&self, row: usize) -> Option<&str> {
        match self.columns.get(self.index_of_role(ColumnRole::Device)?)? {
            ColumnValues::Text(values) => values.get(row)?.as_deref(),
            _ => None,
        }
    }

    pub fn devices_mut(&mut self) -> Option<&mut Vec<Option<String>>> {
        let idx = self.index_of_role(ColumnRole::Device)?;
        match self.columns.get_mut(idx)? {
            ColumnValues::Text(values) => Some(values),
            _ => None,
        }
    }

    pub fn timestamp(&self, row: usize) -> Option<NaiveDateTime> {
        match self.columns.get(self.index_of_role(ColumnRole::Timestamp)?)? {
            ColumnValues::Timestamp(values) => *values.get(row)?,
            _ => None,
        }
    }

    /// Appends `other` below this frame. Columns are matched by name; a
    /// column missing from `other` is filled with nulls.
    pub fn append(&mut self, other: SampleFrame) {
        let other_len = other.len;
        let mut other_columns: Vec<Option<(ColumnSpec, ColumnValues)>> = other
            .specs
            .into_iter()
            .zip(other.columns)
            .map(Some)
            .collect();

        for (spec, column) in self.specs.iter().zip(self.columns.iter_mut()) {
            let matched = other_columns
                .iter_mut()
                .find(|slot| {
                    slot.as_ref()
                        .is_some_and(|(other_spec, _)| other_spec.name == spec.name)
                })
                .and_then(Option::take);
            match matched {
                Some((_, values)) => column.append(values),
                None => column.push_nulls(other_len),
            }
        }
        self.len += other_len;
    }

    pub fn retain(&mut self, keep: &[bool]) {
        for column in &mut self.columns {
            column.retain(keep);
        }
        self.len = keep.iter().take(self.len).filter(|flag| **flag).count();
    }

    /// Reorders every column so that new row `i` is old row `order[i]`.
    pub fn permute(&mut self, order: &[usize]) {
        debug_assert_eq!(order.len(), self.len);
        for column in &mut self.columns {
            column.permute(order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, minute, 0))
            .unwrap()
    }

    fn frame(devices: &[&str], minutes: &[u32], values: &[Option<f64>]) -> SampleFrame {
        let keys = KeyColumns::default();
        SampleFrame::from_parts(
            vec![
                keys.spec("timestamp_utc", ColumnKind::Timestamp),
                keys.spec("power_unit", ColumnKind::Text),
                keys.spec("spm", ColumnKind::Float),
            ],
            vec![
                ColumnValues::Timestamp(minutes.iter().map(|m| Some(ts(*m))).collect()),
                ColumnValues::Text(devices.iter().map(|d| Some(d.to_string())).collect()),
                ColumnValues::Float(values.to_vec()),
            ],
        )
    }

    #[test]
    fn roles_follow_key_columns() {
        let keys = KeyColumns::default();
        assert_eq!(keys.role_of("power_unit"), ColumnRole::Device);
        assert_eq!(keys.role_of("timestamp_utc"), ColumnRole::Timestamp);
        assert_eq!(keys.role_of("gateway"), ColumnRole::Identifier);
        assert_eq!(keys.role_of("timestamp_utc_inserted"), ColumnRole::Identifier);
        assert_eq!(keys.role_of("hyd_oil_temp"), ColumnRole::Metric);
    }

    #[test]
    fn maps_postgres_types() {
        assert_eq!(ColumnKind::from_pg_type("real"), ColumnKind::Float);
        assert_eq!(ColumnKind::from_pg_type("smallint"), ColumnKind::Int);
        assert_eq!(ColumnKind::from_pg_type("boolean"), ColumnKind::Bool);
        assert_eq!(
            ColumnKind::from_pg_type("timestamp without time zone"),
            ColumnKind::Timestamp
        );
        assert_eq!(
            ColumnKind::from_pg_type("character varying"),
            ColumnKind::Text
        );
        assert_eq!(ColumnKind::from_pg_type("numeric"), ColumnKind::Text);
    }

    #[test]
    fn numeric_values_round_trip_exactly() {
        let digits = "12345678901234567.891";
        let column = ColumnValues::Text(vec![Some(digits.to_string())]);
        assert_eq!(column.render(0).as_deref(), Some(digits));
    }

    #[test]
    fn integer_device_column_is_keyed_as_text() {
        let keys = KeyColumns::default();
        let spec = keys.spec("power_unit", ColumnKind::from_pg_type("integer"));
        assert_eq!(spec.kind, ColumnKind::Text);
        assert_eq!(spec.kind.pg_cast(), "text");
        assert_eq!(keys.spec("spm", ColumnKind::Int).kind, ColumnKind::Int);

        let frame = SampleFrame::from_parts(
            vec![keys.spec("timestamp_utc", ColumnKind::Timestamp), spec],
            vec![
                ColumnValues::Timestamp(vec![Some(ts(0))]),
                ColumnValues::Text(vec![Some("200401".to_string())]),
            ],
        );
        assert_eq!(frame.device(0), Some("200401"));
    }

    #[test]
    fn fill_carries_forward_then_backward() {
        let mut values = vec![None, Some(1.0), None, None, Some(2.0), None];
        fill_forward_backward(&mut values);
        assert_eq!(
            values,
            vec![
                Some(1.0),
                Some(1.0),
                Some(1.0),
                Some(1.0),
                Some(2.0),
                Some(2.0)
            ]
        );

        let mut all_null: Vec<Option<f64>> = vec![None, None];
        fill_forward_backward(&mut all_null);
        assert_eq!(all_null, vec![None, None]);
    }

    #[test]
    fn append_pads_missing_columns() {
        let mut seed = frame(&["A"], &[0], &[Some(1.0)]);
        let keys = KeyColumns::default();
        let narrow = SampleFrame::from_parts(
            vec![
                keys.spec("timestamp_utc", ColumnKind::Timestamp),
                keys.spec("power_unit", ColumnKind::Text),
            ],
            vec![
                ColumnValues::Timestamp(vec![Some(ts(10))]),
                ColumnValues::Text(vec![Some("A".to_string())]),
            ],
        );
        seed.append(narrow);
        assert_eq!(seed.len(), 2);
        assert_eq!(
            seed.column("spm"),
            Some(&ColumnValues::Float(vec![Some(1.0), None]))
        );
        assert_eq!(seed.device(1), Some("A"));
        assert_eq!(seed.timestamp(1), Some(ts(10)));
    }

    #[test]
    fn retain_and_permute_keep_rows_aligned() {
        let mut f = frame(
            &["A", "B", "C"],
            &[0, 10, 20],
            &[Some(1.0), Some(2.0), Some(3.0)],
        );
        f.permute(&[2, 0, 1]);
        assert_eq!(f.device(0), Some("C"));
        assert_eq!(f.timestamp(0), Some(ts(20)));
        f.retain(&[true, false, true]);
        assert_eq!(f.len(), 2);
        assert_eq!(f.device(1), Some("B"));
        assert_eq!(
            f.column("spm"),
            Some(&ColumnValues::Float(vec![Some(3.0), Some(2.0)]))
        );
    }

    #[test]
    fn renders_cells_for_copy() {
        let f = frame(&["A"], &[5], &[None]);
        let cells: Vec<Option<String>> = f.cells(0).collect();
        assert_eq!(
            cells,
            vec![
                Some("2024-01-01 00:05:00".to_string()),
                Some("A".to_string()),
                None
            ]
        );
        assert_eq!(
            ColumnValues::Bool(vec![Some(true)]).render(0).as_deref(),
            Some("true")
        );
        assert_eq!(ColumnValues::Int(vec![Some(-3)]).render(0).as_deref(), Some("-3"));
    }
}
