//! In-memory versioned sink.
//!
//! Models the canonical target for this pipeline: a ReplacingMergeTree
//! style table keyed by `id` with `version` and `deleted` columns, where
//! the row with the highest version wins and deleted rows drop out of
//! aggregates. Rows are batched through an `InsertBuffer` and flushed as
//! homogeneous packs at commit boundaries or on overload. Doubles as the
//! recording sink for the test suite: it counts every callback and can
//! inject failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

use crate::buffer::{InsertBuffer, InsertItem};
use crate::error::{EngineError, Result};
use crate::event::{RowKind, RowPayload};
use crate::sink::EventSink;

const VERSION_COLUMN: &str = "version";
const DELETED_COLUMN: &str = "deleted";

#[derive(Debug, Default, Clone)]
pub struct SinkStats {
    pub init: u64,
    pub initiate_full_regeneration: u64,
    pub finished_full_regeneration: u64,
    pub initiate_synch_mode: u64,
    pub tear_down: u64,
    pub commit_boundary: u64,
    pub process_event_insert: u64,
    pub process_event_update: u64,
    pub process_event_delete: u64,
}

impl SinkStats {
    pub fn events_total(&self) -> u64 {
        self.process_event_insert + self.process_event_update + self.process_event_delete
    }
}

pub struct MemorySink {
    stats: Mutex<SinkStats>,
    version: Mutex<u64>,
    buffer: InsertBuffer,
    tables: Mutex<HashMap<String, Vec<InsertItem>>>,
    fail_events: AtomicBool,
}

impl Default for MemorySink {
    fn default() -> Self {
        MemorySink::new()
    }
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::with_threshold(InsertBuffer::DEFAULT_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> MemorySink {
        MemorySink {
            stats: Mutex::new(SinkStats::default()),
            version: Mutex::new(0),
            buffer: InsertBuffer::new(threshold),
            tables: Mutex::new(HashMap::new()),
            fail_events: AtomicBool::new(false),
        }
    }

    /// While set, every `process_event` fails. Clearing it lets a
    /// restarted run redeliver the rejected transaction.
    pub fn emulate_error(&self, on: bool) {
        self.fail_events.store(on, Ordering::SeqCst);
    }

    pub fn stats(&self) -> SinkStats {
        self.stats.lock().expect("sink stats poisoned").clone()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// All flushed rows of a table, in flush order.
    pub fn rows(&self, table: &str) -> Vec<InsertItem> {
        self.tables
            .lock()
            .expect("sink tables poisoned")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Collapses a table the way its readers would: per `id`, the row
    /// with the highest version wins; deleted winners are dropped.
    /// Returns `(row_count, sum(column))` over the surviving rows.
    pub fn aggregate(&self, table: &str, column: &str) -> (u64, i64) {
        let mut winners: HashMap<String, (u64, bool, i64)> = HashMap::new();
        for row in self.rows(table) {
            let id = match field(&row, "id") {
                Some(id) => id.to_string(),
                None => continue,
            };
            let version = field(&row, VERSION_COLUMN).and_then(Value::as_u64).unwrap_or(0);
            let deleted = field(&row, DELETED_COLUMN).and_then(Value::as_u64).unwrap_or(0) != 0;
            let value = field(&row, column).and_then(Value::as_i64).unwrap_or(0);
            let entry = winners.entry(id).or_insert((0, true, 0));
            if version >= entry.0 {
                *entry = (version, deleted, value);
            }
        }
        let mut count = 0;
        let mut sum = 0;
        for (_, deleted, value) in winners.values() {
            if !deleted {
                count += 1;
                sum += value;
            }
        }
        (count, sum)
    }

    fn flush(&self) {
        loop {
            let pack = self.buffer.drain_pack();
            if pack.is_empty() {
                break;
            }
            debug!(table = %pack[0].table, rows = pack.len(), "flushing pack");
            let mut tables = self.tables.lock().expect("sink tables poisoned");
            let rows = tables.entry(pack[0].table.clone()).or_default();
            rows.extend(pack);
        }
    }

    fn next_version(&self) -> u64 {
        let mut version = self.version.lock().expect("sink version poisoned");
        *version += 1;
        *version
    }

    fn stamp_and_push(&self, table: &str, mut image: crate::event::RowImage, deleted: bool) {
        image.insert(VERSION_COLUMN.to_string(), Value::from(self.next_version()));
        if deleted {
            image.insert(DELETED_COLUMN.to_string(), Value::from(1));
        }
        let columns: Vec<String> = image.keys().cloned().collect();
        let values: Vec<Value> = image.values().cloned().collect();
        if self.buffer.push(table, columns, values) {
            self.flush();
        }
    }
}

fn field<'a>(row: &'a InsertItem, name: &str) -> Option<&'a Value> {
    let idx = row.columns.iter().position(|c| c == name)?;
    row.values.get(idx)
}

impl EventSink for MemorySink {
    fn init(&self) -> Result<()> {
        self.stats.lock().expect("sink stats poisoned").init += 1;
        Ok(())
    }

    fn initiate_full_regeneration(&self) -> Result<()> {
        self.stats
            .lock()
            .expect("sink stats poisoned")
            .initiate_full_regeneration += 1;
        Ok(())
    }

    fn finished_full_regeneration(&self) -> Result<()> {
        self.flush();
        self.stats
            .lock()
            .expect("sink stats poisoned")
            .finished_full_regeneration += 1;
        Ok(())
    }

    fn initiate_synch_mode(&self) -> Result<()> {
        // Resume versioning above everything already flushed, the way a
        // live sink would re-read max(version) from its target.
        let max_seen = self
            .tables
            .lock()
            .expect("sink tables poisoned")
            .values()
            .flatten()
            .filter_map(|row| field(row, VERSION_COLUMN).and_then(Value::as_u64))
            .max()
            .unwrap_or(0);
        let mut version = self.version.lock().expect("sink version poisoned");
        if max_seen > *version {
            *version = max_seen;
        }
        drop(version);
        self.stats.lock().expect("sink stats poisoned").initiate_synch_mode += 1;
        Ok(())
    }

    fn process_event(&self, kind: RowKind, _schema: &str, table: &str, payload: RowPayload) -> Result<()> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(EngineError::SinkRejected("emulated sink failure".into()));
        }
        {
            let mut stats = self.stats.lock().expect("sink stats poisoned");
            match kind {
                RowKind::Insert => stats.process_event_insert += 1,
                RowKind::Update => stats.process_event_update += 1,
                RowKind::Delete => stats.process_event_delete += 1,
            }
        }
        let image = payload.sink_image().clone();
        self.stamp_and_push(table, image, kind == RowKind::Delete);
        Ok(())
    }

    fn commit_boundary(&self) -> Result<()> {
        self.flush();
        self.stats.lock().expect("sink stats poisoned").commit_boundary += 1;
        Ok(())
    }

    fn tear_down(&self) -> Result<()> {
        self.flush();
        self.stats.lock().expect("sink stats poisoned").tear_down += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::image_from_columns;
    use serde_json::json;

    fn image(id: i64, value: i64) -> crate::event::RowImage {
        image_from_columns(
            &["id".into(), "name".into(), "value".into()],
            vec![json!(id), json!(format!("name_{id}")), json!(value)],
        )
    }

    #[test]
    fn versions_are_monotonic_across_events() {
        let sink = MemorySink::with_threshold(0);
        for i in 0..5 {
            sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(i, i)))
                .unwrap();
        }
        sink.commit_boundary().unwrap();
        let versions: Vec<u64> = sink
            .rows("items")
            .iter()
            .map(|r| field(r, VERSION_COLUMN).unwrap().as_u64().unwrap())
            .collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        assert_eq!(versions, sorted);
        assert_eq!(versions.len(), 5);
    }

    #[test]
    fn update_supersedes_insert_in_aggregate() {
        let sink = MemorySink::new();
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(1, 10)))
            .unwrap();
        sink.process_event(
            RowKind::Update,
            "db",
            "items",
            RowPayload::Update {
                before_values: image(1, 10),
                after_values: image(1, 110),
            },
        )
        .unwrap();
        sink.commit_boundary().unwrap();
        assert_eq!(sink.aggregate("items", "value"), (1, 110));
    }

    #[test]
    fn delete_drops_row_from_aggregate() {
        let sink = MemorySink::new();
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(1, 10)))
            .unwrap();
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(2, 20)))
            .unwrap();
        sink.process_event(RowKind::Delete, "db", "items", RowPayload::Values(image(2, 20)))
            .unwrap();
        sink.commit_boundary().unwrap();
        assert_eq!(sink.aggregate("items", "value"), (1, 10));
    }

    #[test]
    fn redelivery_is_deduplicated_by_version() {
        let sink = MemorySink::new();
        // same row delivered twice (at-least-once), later version wins
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(7, 70)))
            .unwrap();
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(7, 70)))
            .unwrap();
        sink.commit_boundary().unwrap();
        assert_eq!(sink.aggregate("items", "value"), (1, 70));
    }

    #[test]
    fn events_buffer_until_commit() {
        let sink = MemorySink::new();
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(1, 1)))
            .unwrap();
        assert_eq!(sink.buffered(), 1);
        assert!(sink.rows("items").is_empty());
        sink.commit_boundary().unwrap();
        assert_eq!(sink.buffered(), 0);
        assert_eq!(sink.rows("items").len(), 1);
    }

    #[test]
    fn emulated_error_rejects_events() {
        let sink = MemorySink::new();
        sink.emulate_error(true);
        let err = sink
            .process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(1, 1)))
            .unwrap_err();
        assert!(matches!(err, EngineError::SinkRejected(_)));
        assert_eq!(sink.stats().events_total(), 0);

        sink.emulate_error(false);
        sink.process_event(RowKind::Insert, "db", "items", RowPayload::Values(image(1, 1)))
            .unwrap();
        assert_eq!(sink.stats().process_event_insert, 1);
    }

    #[test]
    fn counters_track_callbacks() {
        let sink = MemorySink::new();
        sink.init().unwrap();
        sink.initiate_full_regeneration().unwrap();
        sink.finished_full_regeneration().unwrap();
        sink.initiate_synch_mode().unwrap();
        sink.commit_boundary().unwrap();
        sink.tear_down().unwrap();
        let stats = sink.stats();
        assert_eq!(stats.init, 1);
        assert_eq!(stats.initiate_full_regeneration, 1);
        assert_eq!(stats.finished_full_regeneration, 1);
        assert_eq!(stats.initiate_synch_mode, 1);
        assert_eq!(stats.commit_boundary, 1);
        assert_eq!(stats.tear_down, 1);
    }
}
