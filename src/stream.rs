//! Live replication stream.
//!
//! The wire protocol and standard event decoding come from the `mysql`
//! crate; this module classifies the decoded events into the small
//! `SourceEvent` vocabulary the consumer runs on. The one frame the
//! library does not decode — the MariaDB GTID event — is parsed from
//! its raw payload here.

use std::collections::HashMap;

use mysql::binlog::events::{Event, EventData, RowsEventData, TableMapEvent};
use mysql::binlog::row::BinlogRow;
use mysql::binlog::value::BinlogValue;
use mysql::{BinlogRequest, Conn};
use serde_json::Value;

use crate::checkpoint::Checkpoint;
use crate::error::{EngineError, Result};
use crate::event::{RowEvent, RowImage, RowKind};
use crate::primary::{self, sql_value_to_json, Primary, TableMetaCache};
use crate::settings::{PrimarySettings, Settings};

/// Replica id announced by the live consumer.
pub const CONSUMER_SERVER_ID: u32 = 100_001;

/// Throwaway replica id used by the preflight probe.
pub const PROBE_SERVER_ID: u32 = 999_999;

/// MariaDB GTID event, start of an event group. Not part of the
/// standard event-type range the decoder knows.
pub const MARIADB_GTID_EVENT: u8 = 162;

/// One step of the replication stream, as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// A transaction begins; carries its GTID as `domain-server-seq`.
    GtidBegin(String),
    /// Row mutations of one table, in binlog order.
    Rows(Vec<RowEvent>),
    /// A transaction committed; the checkpoint may advance to this
    /// position.
    Commit { log_file: String, log_pos: u64 },
    /// Framing the consumer does not act on.
    Skipped,
}

/// A restartable sequence of framed replication events. `poll` returns
/// `Ok(None)` when no event is available yet, so callers can observe
/// the stop flag instead of blocking on IO.
pub trait BinlogSource {
    fn poll(&mut self) -> Result<Option<SourceEvent>>;
}

/// Production source: a replication connection positioned at the
/// checkpoint, plus a side connection resolving column names once per
/// table (the schema is frozen for the lifetime of the stream).
pub struct MysqlBinlogSource {
    stream: mysql::BinlogStream,
    meta: TableMetaCache,
    log_file: String,
    table_maps: HashMap<u64, TableMapEvent<'static>>,
}

impl MysqlBinlogSource {
    pub fn open(settings: &Settings, start: &Checkpoint) -> Result<MysqlBinlogSource> {
        let meta = TableMetaCache::new(Primary::connect(&settings.primary, None)?);
        let conn = Conn::new(primary::build_stream_opts(&settings.primary))?;
        let stream = conn.get_binlog_stream(
            BinlogRequest::new(CONSUMER_SERVER_ID)
                .with_filename(start.log_file.as_bytes().to_vec())
                .with_pos(start.log_pos),
        )?;
        Ok(MysqlBinlogSource {
            stream,
            meta,
            log_file: start.log_file.clone(),
            table_maps: HashMap::new(),
        })
    }

    fn classify(&mut self, event: Event) -> Result<SourceEvent> {
        let header = event.header();

        if header.event_type_raw() == MARIADB_GTID_EVENT {
            let gtid = parse_mariadb_gtid(header.server_id(), event.data())?;
            return Ok(SourceEvent::GtidBegin(gtid));
        }

        let data = event
            .read_data()
            .map_err(|e| EngineError::Stream(format!("cannot decode binlog event: {e}")))?;
        match data {
            Some(EventData::RotateEvent(rotate)) => {
                self.log_file = rotate.name().to_string();
                Ok(SourceEvent::Skipped)
            }
            Some(EventData::TableMapEvent(table_map)) => {
                self.table_maps
                    .insert(table_map.table_id(), table_map.into_owned());
                Ok(SourceEvent::Skipped)
            }
            Some(EventData::XidEvent(_)) => Ok(SourceEvent::Commit {
                log_file: self.log_file.clone(),
                log_pos: u64::from(header.log_pos()),
            }),
            Some(EventData::RowsEvent(rows)) => self.convert_rows(rows),
            // DDL and the rest of the framing are out of scope
            _ => Ok(SourceEvent::Skipped),
        }
    }

    fn convert_rows(&mut self, rows: RowsEventData<'_>) -> Result<SourceEvent> {
        let kind = match &rows {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => RowKind::Insert,
            RowsEventData::UpdateRowsEvent(_) | RowsEventData::UpdateRowsEventV1(_) => RowKind::Update,
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => RowKind::Delete,
            other => {
                return Err(EngineError::UnknownEvent(format!(
                    "unsupported rows event kind: {other:?}"
                )))
            }
        };

        let table_id = rows.table_id();
        let table_map = self.table_maps.get(&table_id).ok_or_else(|| {
            EngineError::UnknownEvent(format!("rows event without table map, table id {table_id}"))
        })?;
        let schema = table_map.database_name().to_string();
        let table = table_map.table_name().to_string();
        let columns = self.meta.columns(&schema, &table)?.to_vec();

        let mut events = Vec::new();
        for row in rows.rows(table_map) {
            let (before, after) =
                row.map_err(|e| EngineError::Stream(format!("cannot decode row image: {e}")))?;
            let event = match kind {
                RowKind::Insert => {
                    let after = after.ok_or_else(|| missing_image(kind, &table))?;
                    RowEvent::insert(&schema, &table, row_to_image(&columns, &after)?)
                }
                RowKind::Update => {
                    let before = before.ok_or_else(|| missing_image(kind, &table))?;
                    let after = after.ok_or_else(|| missing_image(kind, &table))?;
                    RowEvent::update(
                        &schema,
                        &table,
                        row_to_image(&columns, &before)?,
                        row_to_image(&columns, &after)?,
                    )
                }
                RowKind::Delete => {
                    let before = before.ok_or_else(|| missing_image(kind, &table))?;
                    RowEvent::delete(&schema, &table, row_to_image(&columns, &before)?)
                }
            };
            events.push(event);
        }
        Ok(SourceEvent::Rows(events))
    }
}

impl BinlogSource for MysqlBinlogSource {
    fn poll(&mut self) -> Result<Option<SourceEvent>> {
        match self.stream.next() {
            None => Err(EngineError::Stream("binlog stream closed by primary".into())),
            Some(Err(e)) if is_idle_timeout(&e) => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(event)) => self.classify(event).map(Some),
        }
    }
}

/// Opens a throwaway replication connection and reads once, proving the
/// account can attach to the stream. Does not resume or save positions.
pub fn probe(primary: &PrimarySettings) -> Result<()> {
    let conn = Conn::new(primary::build_stream_opts(primary))?;
    let mut stream = conn.get_binlog_stream(BinlogRequest::new(PROBE_SERVER_ID))?;
    match stream.next() {
        Some(Err(e)) if !is_idle_timeout(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

fn is_idle_timeout(error: &mysql::Error) -> bool {
    match error {
        mysql::Error::IoError(io) => matches!(
            io.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
        _ => false,
    }
}

fn missing_image(kind: RowKind, table: &str) -> EngineError {
    EngineError::UnknownEvent(format!("{kind} event for `{table}` is missing a row image"))
}

/// MariaDB GTID event payload: little-endian u64 sequence number, u32
/// domain id, one flag byte. The server id lives in the event header.
fn parse_mariadb_gtid(server_id: u32, data: &[u8]) -> Result<String> {
    if data.len() < 13 {
        return Err(EngineError::UnknownEvent(format!(
            "short MariaDB GTID event: {} bytes",
            data.len()
        )));
    }
    let mut sequence = [0u8; 8];
    sequence.copy_from_slice(&data[..8]);
    let mut domain = [0u8; 4];
    domain.copy_from_slice(&data[8..12]);
    Ok(format!(
        "{}-{}-{}",
        u32::from_le_bytes(domain),
        server_id,
        u64::from_le_bytes(sequence)
    ))
}

fn row_to_image(columns: &[String], row: &BinlogRow) -> Result<RowImage> {
    if row.len() != columns.len() {
        return Err(EngineError::UnknownEvent(format!(
            "row has {} columns, table metadata has {}; schema changed mid-run?",
            row.len(),
            columns.len()
        )));
    }
    let mut image = RowImage::new();
    for (idx, name) in columns.iter().enumerate() {
        let value = match row.as_ref(idx) {
            Some(BinlogValue::Value(value)) => sql_value_to_json(value.clone())?,
            Some(_) => {
                return Err(EngineError::UnknownEvent(format!(
                    "unsupported binlog value in column `{name}`"
                )))
            }
            None => Value::Null,
        };
        image.insert(name.clone(), value);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gtid_payload(sequence: u64, domain: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&domain.to_le_bytes());
        data.push(0); // flags
        data
    }

    #[test]
    fn parses_mariadb_gtid_payload() {
        let gtid = parse_mariadb_gtid(1, &gtid_payload(2236, 0)).unwrap();
        assert_eq!(gtid, "0-1-2236");
        let gtid = parse_mariadb_gtid(7, &gtid_payload(158, 3)).unwrap();
        assert_eq!(gtid, "3-7-158");
    }

    #[test]
    fn short_gtid_payload_is_fatal() {
        let err = parse_mariadb_gtid(1, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEvent(_)));
    }

    #[test]
    fn gtid_payload_tolerates_trailing_bytes() {
        let mut data = gtid_payload(99, 2);
        data.extend_from_slice(&[1, 2, 3, 4]); // optional tail + checksum
        assert_eq!(parse_mariadb_gtid(5, &data).unwrap(), "2-5-99");
    }
}
