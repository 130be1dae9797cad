//! Primary database access.
//!
//! Thin wrapper over the `mysql` crate: option building, stringly query
//! results for the preflight checks, typed row images for the snapshot,
//! and a frozen per-run cache of column names used to label binlog rows.

use std::collections::HashMap;
use std::time::Duration;

use mysql::prelude::Queryable;
use mysql::{Conn, Opts, OptsBuilder, Row, Value as SqlValue};
use serde_json::Value;

use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, Result};
use crate::event::RowImage;
use crate::settings::PrimarySettings;

/// Read timeout applied to replication-stream connections so that an
/// idle binlog read surfaces as "no event yet" instead of blocking
/// shutdown.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_millis(500);

pub fn build_opts(primary: &PrimarySettings, db_name: Option<&str>) -> Opts {
    let builder = OptsBuilder::new()
        .ip_or_hostname(Some(primary.host.clone()))
        .tcp_port(primary.port)
        .user(Some(primary.user.clone()))
        .pass(Some(primary.password.clone()))
        .db_name(db_name.map(str::to_string));
    builder.into()
}

pub fn build_stream_opts(primary: &PrimarySettings) -> Opts {
    let builder = OptsBuilder::new()
        .ip_or_hostname(Some(primary.host.clone()))
        .tcp_port(primary.port)
        .user(Some(primary.user.clone()))
        .pass(Some(primary.password.clone()))
        .read_timeout(Some(STREAM_READ_TIMEOUT));
    builder.into()
}

/// Minimal query surface the preflight checks run against; production
/// code uses `Primary`, tests substitute a scripted runner.
pub trait SqlRunner {
    /// Runs a statement and returns every result row with each value
    /// rendered as text. Statements that produce no rows return an empty
    /// vec; failed statements return an error.
    fn fetch_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>>;
}

/// One client connection to the primary.
pub struct Primary {
    conn: Conn,
}

impl Primary {
    pub fn connect(primary: &PrimarySettings, db_name: Option<&str>) -> Result<Primary> {
        let conn = Conn::new(build_opts(primary, db_name))?;
        Ok(Primary { conn })
    }

    pub fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn.query_drop(sql)?;
        Ok(())
    }

    /// `SHOW MASTER STATUS` as a checkpoint. Fails when the account
    /// cannot see the primary's binlog position.
    pub fn master_status(&mut self) -> Result<Checkpoint> {
        let row: Option<Row> = self.conn.query_first("SHOW MASTER STATUS")?;
        let mut row = row.ok_or_else(|| {
            EngineError::Preflight(
                "SHOW MASTER STATUS returned nothing; the account needs a replication \
                 monitoring privilege"
                    .into(),
            )
        })?;
        let log_file: String = row
            .take(0)
            .ok_or_else(|| EngineError::Stream("SHOW MASTER STATUS missing file column".into()))?;
        let log_pos: u64 = row
            .take(1)
            .ok_or_else(|| EngineError::Stream("SHOW MASTER STATUS missing position column".into()))?;
        Ok(Checkpoint::new(log_file, log_pos))
    }

    /// The primary's current GTID position, used by the health surface.
    pub fn current_gtid(&mut self) -> Result<Option<String>> {
        let gtid: Option<String> = self.conn.query_first("SELECT @@GLOBAL.gtid_current_pos")?;
        Ok(gtid.filter(|g| !g.is_empty()))
    }

    /// Typed row images for snapshot fetches: one column-name -> value
    /// map per row, in result order.
    pub fn fetch_images(&mut self, sql: &str) -> Result<Vec<RowImage>> {
        let mut images = Vec::new();
        let result = self.conn.query_iter(sql)?;
        for row in result {
            images.push(row_to_image(row?)?);
        }
        Ok(images)
    }

    pub fn query_first_tuple(&mut self, sql: &str) -> Result<Option<(u64, Option<u64>, Option<u64>)>> {
        Ok(self.conn.query_first(sql)?)
    }

    pub fn column_names(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let names: Vec<String> = self.conn.exec(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
            (schema, table),
        )?;
        Ok(names)
    }
}

impl SqlRunner for Primary {
    fn fetch_rows(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        let mut rows = Vec::new();
        let result = self.conn.query_iter(sql)?;
        for row in result {
            let row = row?;
            let values = row.unwrap();
            rows.push(values.iter().map(sql_value_to_text).collect());
        }
        Ok(rows)
    }
}

fn row_to_image(row: Row) -> Result<RowImage> {
    let names: Vec<String> = row
        .columns_ref()
        .iter()
        .map(|c| c.name_str().to_string())
        .collect();
    let values = row.unwrap();
    let mut image = RowImage::new();
    for (name, value) in names.into_iter().zip(values) {
        image.insert(name, sql_value_to_json(value)?);
    }
    Ok(image)
}

pub fn sql_value_to_json(value: SqlValue) -> Result<Value> {
    let json = match value {
        SqlValue::NULL => Value::Null,
        SqlValue::Bytes(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
        SqlValue::Int(i) => Value::from(i),
        SqlValue::UInt(u) => Value::from(u),
        SqlValue::Float(f) => Value::from(f as f64),
        SqlValue::Double(d) => Value::from(d),
        SqlValue::Date(year, month, day, hour, minute, second, micros) => {
            if micros > 0 {
                Value::String(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
                ))
            } else {
                Value::String(format!(
                    "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
                ))
            }
        }
        SqlValue::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = u64::from(days) * 24 + u64::from(hours);
            if micros > 0 {
                Value::String(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"))
            } else {
                Value::String(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
            }
        }
    };
    Ok(json)
}

fn sql_value_to_text(value: &SqlValue) -> String {
    match value {
        SqlValue::NULL => String::new(),
        SqlValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => other.as_sql(true).trim_matches('\'').to_string(),
    }
}

/// Per-run cache of column names, keyed by `schema.table`. The schema is
/// frozen at first touch: a table's column list is fetched once and kept
/// for the lifetime of the stream, matching the frozen-schema contract
/// of the binlog consumer.
pub struct TableMetaCache {
    connection: Primary,
    columns: HashMap<String, Vec<String>>,
}

impl TableMetaCache {
    pub fn new(connection: Primary) -> TableMetaCache {
        TableMetaCache {
            connection,
            columns: HashMap::new(),
        }
    }

    pub fn columns(&mut self, schema: &str, table: &str) -> Result<&[String]> {
        let key = format!("{schema}.{table}");
        if !self.columns.contains_key(&key) {
            let names = self.connection.column_names(schema, table)?;
            if names.is_empty() {
                return Err(EngineError::Stream(format!("no column metadata for {key}")));
            }
            self.columns.insert(key.clone(), names);
        }
        Ok(self.columns.get(&key).map(Vec::as_slice).unwrap_or(&[]))
    }
}
