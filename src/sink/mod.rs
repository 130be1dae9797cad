//! Sink plugin surface.
//!
//! A sink receives lifecycle callbacks and row events. `process_event`
//! may be called from several snapshot workers concurrently; every other
//! entry point is single-threaded. Delivery is at-least-once: sinks
//! deduplicate with a monotonic version of their own (see `MemorySink`
//! for the canonical versioned-table arrangement).

pub mod log;
pub mod memory;

use std::sync::Arc;

use tracing::trace;

use crate::error::{EngineError, Result};
use crate::event::{RowKind, RowPayload};

pub use self::log::LogSink;
pub use self::memory::MemorySink;

pub trait EventSink: Send + Sync {
    /// Once, after preflight, before any stage.
    fn init(&self) -> Result<()>;
    /// Once, at the start of SNAPSHOT.
    fn initiate_full_regeneration(&self) -> Result<()>;
    /// Once, at the end of SNAPSHOT.
    fn finished_full_regeneration(&self) -> Result<()>;
    /// Once, at the start of STREAM.
    fn initiate_synch_mode(&self) -> Result<()>;
    /// Per row. Multi-threaded during SNAPSHOT, single-threaded in STREAM.
    fn process_event(&self, kind: RowKind, schema: &str, table: &str, payload: RowPayload) -> Result<()>;
    /// At each transaction commit boundary in STREAM.
    fn commit_boundary(&self) -> Result<()>;
    /// Once, on orderly shutdown.
    fn tear_down(&self) -> Result<()>;
}

/// Thin façade over the configured sink: resolves the module name up
/// front (an unresolvable sink fails before any stage is entered), tags
/// failures with the entry point that raised them, and traces dispatch.
#[derive(Clone)]
pub struct SinkHandle {
    name: String,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle").field("name", &self.name).finish()
    }
}

impl SinkHandle {
    pub fn resolve(name: &str) -> Result<SinkHandle> {
        let sink = registry(name)
            .ok_or_else(|| EngineError::Preflight(format!("unknown sink module `{name}`")))?;
        Ok(SinkHandle {
            name: name.to_string(),
            sink,
        })
    }

    pub fn from_sink(name: &str, sink: Arc<dyn EventSink>) -> SinkHandle {
        SinkHandle {
            name: name.to_string(),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn init(&self) -> Result<()> {
        trace!(sink = %self.name, "init");
        self.sink.init().map_err(|e| EngineError::in_sink("init", e))
    }

    pub fn initiate_full_regeneration(&self) -> Result<()> {
        trace!(sink = %self.name, "initiate_full_regeneration");
        self.sink
            .initiate_full_regeneration()
            .map_err(|e| EngineError::in_sink("initiate_full_regeneration", e))
    }

    pub fn finished_full_regeneration(&self) -> Result<()> {
        trace!(sink = %self.name, "finished_full_regeneration");
        self.sink
            .finished_full_regeneration()
            .map_err(|e| EngineError::in_sink("finished_full_regeneration", e))
    }

    pub fn initiate_synch_mode(&self) -> Result<()> {
        trace!(sink = %self.name, "initiate_synch_mode");
        self.sink
            .initiate_synch_mode()
            .map_err(|e| EngineError::in_sink("initiate_synch_mode", e))
    }

    pub fn process_event(
        &self,
        kind: RowKind,
        schema: &str,
        table: &str,
        payload: RowPayload,
    ) -> Result<()> {
        trace!(sink = %self.name, %kind, schema, table, "process_event");
        self.sink
            .process_event(kind, schema, table, payload)
            .map_err(|e| EngineError::in_sink("process_event", e))
    }

    pub fn commit_boundary(&self) -> Result<()> {
        trace!(sink = %self.name, "commit_boundary");
        self.sink
            .commit_boundary()
            .map_err(|e| EngineError::in_sink("commit_boundary", e))
    }

    pub fn tear_down(&self) -> Result<()> {
        trace!(sink = %self.name, "tear_down");
        self.sink.tear_down().map_err(|e| EngineError::in_sink("tear_down", e))
    }
}

/// Built-in sink registry. Binaries that link their own sink register it
/// by constructing a `SinkHandle::from_sink` instead.
fn registry(name: &str) -> Option<Arc<dyn EventSink>> {
    match name {
        "log" => Some(Arc::new(LogSink::new())),
        "memory" => Some(Arc::new(MemorySink::new())),
        _ => None,
    }
}
