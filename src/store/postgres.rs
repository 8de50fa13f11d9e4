use super::sql;
use super::{DeviceDirectory, TimeSeriesStore, Window};
use crate::error::{RefreshError, RefreshResult};
use crate::frame::{ColumnKind, ColumnSpec, ColumnValues, KeyColumns, SampleFrame};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Row};
use std::collections::HashMap;

const COPY_CHUNK_BYTES: usize = 64 * 1024;

async fn connect_utc(database_url: &str) -> Result<PgConnection, sqlx::Error> {
    let mut conn = PgConnection::connect(database_url).await?;
    sqlx::query("SET TIME ZONE 'UTC'")
        .execute(&mut conn)
        .await?;
    Ok(conn)
}

/// Time-series store backed by one long-lived connection.
pub struct PgStore {
    conn: PgConnection,
    schema: String,
    keys: KeyColumns,
    column_cache: HashMap<String, Vec<ColumnSpec>>,
}

impl PgStore {
    pub async fn connect(database_url: &str, schema: &str, keys: KeyColumns) -> RefreshResult<Self> {
        sql::quote_ident(schema)?;
        let conn = connect_utc(database_url).await?;
        Ok(Self {
            conn,
            schema: schema.to_string(),
            keys,
            column_cache: HashMap::new(),
        })
    }

    pub async fn close(self) -> RefreshResult<()> {
        self.conn.close().await?;
        Ok(())
    }

    /// Runs a statement on the simple query protocol with no transaction
    /// open. Only used for calls the server refuses inside a transaction
    /// block.
    async fn execute_autocommit(&mut self, statement: &str) -> RefreshResult<()> {
        sqlx::raw_sql(statement).execute(&mut self.conn).await?;
        Ok(())
    }
}

impl TimeSeriesStore for PgStore {
    async fn max_timestamp(
        &mut self,
        table: &str,
        since: DateTime<Utc>,
        device: Option<&str>,
    ) -> RefreshResult<Option<DateTime<Utc>>> {
        let target = sql::qualified(&self.schema, table)?;
        let ts = sql::quote_ident(&self.keys.timestamp)?;
        let mut statement = format!("SELECT max({ts})::timestamp FROM {target} WHERE {ts} >= $1");
        if device.is_some() {
            let dev = sql::quote_ident(&self.keys.device)?;
            statement.push_str(&format!(" AND {dev}::text = $2"));
        }

        let mut query =
            sqlx::query_scalar::<_, Option<NaiveDateTime>>(&statement).bind(since.naive_utc());
        if let Some(device) = device {
            query = query.bind(device);
        }
        let latest = query.fetch_one(&mut self.conn).await?;
        Ok(latest.map(|ts| ts.and_utc()))
    }

    async fn device_max_timestamps(
        &mut self,
        table: &str,
        since: DateTime<Utc>,
        devices: &[String],
    ) -> RefreshResult<HashMap<String, DateTime<Utc>>> {
        let target = sql::qualified(&self.schema, table)?;
        let ts = sql::quote_ident(&self.keys.timestamp)?;
        let dev = sql::quote_ident(&self.keys.device)?;
        let statement = format!(
            r#"
            SELECT {dev}::text AS device, max({ts})::timestamp AS latest
            FROM {target}
            WHERE {ts} >= $1
              AND {dev}::text = ANY($2)
            GROUP BY 1
            "#
        );

        let rows = sqlx::query(&statement)
            .bind(since.naive_utc())
            .bind(devices)
            .fetch_all(&mut self.conn)
            .await?;

        let mut latest = HashMap::with_capacity(rows.len());
        for row in rows {
            let device: String = row.try_get("device")?;
            let ts: NaiveDateTime = row.try_get("latest")?;
            latest.insert(device, ts.and_utc());
        }
        Ok(latest)
    }

    async fn table_columns(&mut self, table: &str) -> RefreshResult<Vec<ColumnSpec>> {
        if let Some(cached) = self.column_cache.get(table) {
            return Ok(cached.clone());
        }

        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = $1
              AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&mut self.conn)
        .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("column_name")?;
            let data_type: String = row.try_get("data_type")?;
            columns.push(self.keys.spec(&name, ColumnKind::from_pg_type(&data_type)));
        }
        tracing::debug!(table, columns = columns.len(), "discovered table columns");

        self.column_cache.insert(table.to_string(), columns.clone());
        Ok(columns)
    }

    async fn fetch_window(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        window: Window,
        devices: Option<&[String]>,
    ) -> RefreshResult<SampleFrame> {
        let present: Vec<String> = self
            .table_columns(table)
            .await?
            .into_iter()
            .map(|column| column.name)
            .collect();
        let target = sql::qualified(&self.schema, table)?;
        let ts = sql::quote_ident(&self.keys.timestamp)?;
        let select = sql::select_list(columns, &present)?;
        let mut statement =
            format!("SELECT {select} FROM {target} WHERE {ts} > $1 AND {ts} <= $2");
        if devices.is_some() {
            let dev = sql::quote_ident(&self.keys.device)?;
            statement.push_str(&format!(" AND {dev}::text = ANY($3)"));
        }

        let mut query = sqlx::query(&statement)
            .bind(window.start.naive_utc())
            .bind(window.end.naive_utc());
        if let Some(devices) = devices {
            query = query.bind(devices);
        }

        let mut values: Vec<ColumnValues> = columns
            .iter()
            .map(|column| ColumnValues::empty(column.kind))
            .collect();
        let mut rows = query.fetch(&mut self.conn);
        while let Some(row) = rows.try_next().await? {
            for (idx, column) in values.iter_mut().enumerate() {
                push_cell(column, &row, idx)?;
            }
        }
        drop(rows);

        Ok(SampleFrame::from_parts(columns.to_vec(), values))
    }

    async fn copy_rows(
        &mut self,
        table: &str,
        columns: &[ColumnSpec],
        payload: Bytes,
    ) -> RefreshResult<u64> {
        let target = sql::qualified(&self.schema, table)?;
        let statement = sql::copy_statement(&target, columns)?;

        let mut tx = self.conn.begin().await?;
        match copy_payload(&mut tx, &statement, payload).await {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(table, error = %rollback_err, "rollback after failed COPY failed");
                }
                Err(classify_copy_error(table, err))
            }
        }
    }

    async fn refresh_aggregate(
        &mut self,
        view: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RefreshResult<()> {
        for part in view.split('.') {
            sql::quote_ident(part)?;
        }
        let call = sql::refresh_call(view, start, end);
        self.execute_autocommit(&call).await
    }
}

fn push_cell(column: &mut ColumnValues, row: &PgRow, idx: usize) -> Result<(), sqlx::Error> {
    match column {
        ColumnValues::Float(values) => values.push(row.try_get::<Option<f64>, _>(idx)?),
        ColumnValues::Int(values) => values.push(row.try_get::<Option<i64>, _>(idx)?),
        ColumnValues::Bool(values) => values.push(row.try_get::<Option<bool>, _>(idx)?),
        ColumnValues::Text(values) => values.push(row.try_get::<Option<String>, _>(idx)?),
        ColumnValues::Timestamp(values) => {
            values.push(row.try_get::<Option<NaiveDateTime>, _>(idx)?)
        }
    }
    Ok(())
}

async fn copy_payload(
    conn: &mut PgConnection,
    statement: &str,
    payload: Bytes,
) -> Result<u64, sqlx::Error> {
    let mut copy = conn.copy_in_raw(statement).await?;
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + COPY_CHUNK_BYTES).min(payload.len());
        if let Err(err) = copy.send(payload.slice(offset..end)).await {
            let _ = copy.abort(err.to_string()).await;
            return Err(err);
        }
        offset = end;
    }
    copy.finish().await
}

fn classify_copy_error(table: &str, err: sqlx::Error) -> RefreshError {
    if let Some(db_err) = err.as_database_error() {
        if db_err.is_unique_violation() {
            return RefreshError::DuplicateKey {
                table: table.to_string(),
                message: db_err.message().to_string(),
            };
        }
    }
    RefreshError::Database(err)
}

/// Device metadata lookups against the fleet configuration database.
pub struct PgDirectory {
    conn: PgConnection,
}

impl PgDirectory {
    pub async fn connect(database_url: &str) -> RefreshResult<Self> {
        let conn = connect_utc(database_url).await?;
        Ok(Self { conn })
    }

    pub async fn close(self) -> RefreshResult<()> {
        self.conn.close().await?;
        Ok(())
    }
}

impl DeviceDirectory for PgDirectory {
    async fn devices_in_service(&mut self) -> RefreshResult<Vec<String>> {
        let devices = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT t1.power_unit_str
            FROM public.power_units t1
            INNER JOIN public.gw t2
                ON t2.power_unit_id = t1.id
            INNER JOIN public.structures t3
                ON t3.power_unit_id = t1.id
            WHERE t1.power_unit_str IS NOT NULL
              AND t2.gateway IS NOT NULL
              AND t3.surface IS NOT NULL
            ORDER BY t1.power_unit_str
            "#,
        )
        .fetch_all(&mut self.conn)
        .await?;
        Ok(devices)
    }

    async fn gateway_devices(&mut self) -> RefreshResult<HashMap<String, String>> {
        let rows = sqlx::query(
            r#"
            SELECT t2.aws_thing AS gateway, t1.power_unit_str
            FROM public.power_units t1
            LEFT JOIN public.gw t2
                ON t2.power_unit_id = t1.id
            WHERE t1.power_unit_str IS NOT NULL
              AND t2.gateway IS NOT NULL
              AND t2.aws_thing IS NOT NULL
            "#,
        )
        .fetch_all(&mut self.conn)
        .await?;

        let mut mapping = HashMap::with_capacity(rows.len());
        for row in rows {
            let gateway: String = row.try_get("gateway")?;
            let device: String = row.try_get("power_unit_str")?;
            mapping.insert(gateway, device);
        }
        Ok(mapping)
    }
}
