//! The single-threaded binlog consumer: drains the replication stream
//! in log order, drives the sink, and persists the checkpoint at
//! transaction commit boundaries — never inside a transaction.

use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::engine::Engine;
use crate::error::Result;
use crate::settings::Settings;
use crate::sink::SinkHandle;
use crate::stream::{BinlogSource, SourceEvent};

/// How long to yield when the stream has no event for us.
pub const POLL_IDLE: Duration = Duration::from_millis(200);

pub struct BinlogConsumer<S: BinlogSource> {
    source: S,
    sink: SinkHandle,
    store: CheckpointStore,
    position: Checkpoint,
    db_name: String,
    stream_tables: Vec<String>,
}

impl<S: BinlogSource> BinlogConsumer<S> {
    pub fn new(
        source: S,
        sink: SinkHandle,
        store: CheckpointStore,
        position: Checkpoint,
        settings: &Settings,
    ) -> BinlogConsumer<S> {
        BinlogConsumer {
            source,
            sink,
            store,
            position,
            db_name: settings.db_name.clone(),
            stream_tables: settings.stream_tables.clone(),
        }
    }

    /// The last committed position: only advanced at commit boundaries,
    /// so on a crash the tail of an uncommitted transaction is replayed.
    pub fn position(&self) -> &Checkpoint {
        &self.position
    }

    /// Runs until stop is requested or a fatal error occurs. A sink
    /// error leaves the checkpoint behind the failing transaction, so a
    /// restart redelivers it.
    pub fn run(&mut self, engine: &Engine) -> Result<()> {
        while !engine.stop_requested() {
            match self.source.poll()? {
                Some(event) => self.apply(engine, event)?,
                None => thread::sleep(POLL_IDLE),
            }
        }
        Ok(())
    }

    fn apply(&mut self, engine: &Engine, event: SourceEvent) -> Result<()> {
        match event {
            SourceEvent::GtidBegin(gtid) => {
                engine.set_consumer_gtid(gtid);
            }
            SourceEvent::Rows(events) => {
                for event in events {
                    if event.schema != self.db_name || !self.stream_tables.contains(&event.table) {
                        continue;
                    }
                    self.sink
                        .process_event(event.kind, &event.schema, &event.table, event.payload)?;
                }
            }
            SourceEvent::Commit { log_file, log_pos } => {
                self.sink.commit_boundary()?;
                self.position = Checkpoint::new(log_file, log_pos);
                debug!(position = %self.position, "transaction committed");
                if let Err(e) = self.store.save(&self.position) {
                    // next commit retries; the in-memory position stays ahead
                    warn!(error = %e, "checkpoint save failed");
                }
            }
            SourceEvent::Skipped => {}
        }
        Ok(())
    }
}
