use tracing::{debug, info};

use crate::error::Result;
use crate::event::{RowKind, RowPayload};
use crate::sink::EventSink;

/// Sink that only logs what it receives. Default for the binary when no
/// real target is wired in yet.
#[derive(Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> LogSink {
        LogSink
    }
}

impl EventSink for LogSink {
    fn init(&self) -> Result<()> {
        info!("log sink ready");
        Ok(())
    }

    fn initiate_full_regeneration(&self) -> Result<()> {
        info!("snapshot starting");
        Ok(())
    }

    fn finished_full_regeneration(&self) -> Result<()> {
        info!("snapshot finished");
        Ok(())
    }

    fn initiate_synch_mode(&self) -> Result<()> {
        info!("entering live stream");
        Ok(())
    }

    fn process_event(&self, kind: RowKind, schema: &str, table: &str, payload: RowPayload) -> Result<()> {
        debug!(%kind, schema, table, ?payload, "row event");
        Ok(())
    }

    fn commit_boundary(&self) -> Result<()> {
        debug!("commit");
        Ok(())
    }

    fn tear_down(&self) -> Result<()> {
        info!("log sink closed");
        Ok(())
    }
}
