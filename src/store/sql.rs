use crate::error::{RefreshError, RefreshResult};
use crate::frame::ColumnSpec;
use chrono::{DateTime, Utc};

const LITERAL_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Double-quotes an identifier after checking it is a plain name.
pub(super) fn quote_ident(name: &str) -> RefreshResult<String> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !valid {
        return Err(RefreshError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

pub(super) fn qualified(schema: &str, table: &str) -> RefreshResult<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

pub(super) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(super) fn timestamp_literal(ts: DateTime<Utc>) -> String {
    quote_literal(&ts.naive_utc().format(LITERAL_TIMESTAMP_FORMAT).to_string())
}

/// Select list that reads every requested column with the in-memory cast,
/// substituting typed nulls for columns `present` does not contain.
pub(super) fn select_list(columns: &[ColumnSpec], present: &[String]) -> RefreshResult<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        let ident = quote_ident(&column.name)?;
        let cast = column.kind.pg_cast();
        if present.iter().any(|name| name == &column.name) {
            parts.push(format!("{ident}::{cast} AS {ident}"));
        } else {
            parts.push(format!("NULL::{cast} AS {ident}"));
        }
    }
    Ok(parts.join(", "))
}

pub(super) fn copy_statement(table: &str, columns: &[ColumnSpec]) -> RefreshResult<String> {
    let names = columns
        .iter()
        .map(|column| quote_ident(&column.name))
        .collect::<RefreshResult<Vec<_>>>()?;
    Ok(format!(
        "COPY {table} ({}) FROM STDIN WITH (FORMAT csv, HEADER false, DELIMITER ',', NULL '', ENCODING 'UTF-8')",
        names.join(", ")
    ))
}

pub(super) fn refresh_call(view: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "CALL refresh_continuous_aggregate({}, {}, {})",
        quote_literal(view),
        timestamp_literal(start),
        timestamp_literal(end)
    )
}
