//! Initial snapshot: a pool of workers sharing one id-space cursor per
//! table, each worker reading through its own consistent-snapshot
//! transaction and emitting synthetic insert events.

use std::collections::HashMap;
use std::sync::{Barrier, Mutex};
use std::thread;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::event::{RowImage, RowKind, RowPayload};
use crate::primary::Primary;
use crate::settings::{PrimarySettings, Settings};
use crate::sink::SinkHandle;

#[derive(Debug, Default)]
struct TableProgress {
    current_id: Option<u64>,
    max_id: u64,
    rows_count: u64,
    rows_parsed: u64,
}

/// Shared state of the snapshot workers: per-table id cursor and
/// progress counters, all under one mutex. Workers sample the same
/// table from slightly different read views; merging keeps the maximum
/// observed row count, the lowest observed minimum id and the highest
/// observed maximum id, so the progress estimate never decreases.
pub struct SnapshotCoordinator {
    tables: Mutex<HashMap<String, TableProgress>>,
}

impl Default for SnapshotCoordinator {
    fn default() -> Self {
        SnapshotCoordinator::new()
    }
}

impl SnapshotCoordinator {
    pub fn new() -> SnapshotCoordinator {
        SnapshotCoordinator {
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Hands out the next fetch window: returns the current cursor and
    /// advances it by `n`. The range `[start, start + n)` belongs to the
    /// calling worker exclusively.
    pub fn reserve(&self, table: &str, n: u64) -> u64 {
        let mut tables = self.tables.lock().expect("coordinator poisoned");
        let progress = tables.entry(table.to_string()).or_default();
        let start = progress.current_id.unwrap_or(0);
        progress.current_id = Some(start + n);
        start
    }

    /// Merges one worker's `(COUNT, MIN(id), MAX(id))` sample.
    pub fn report_range(&self, table: &str, count: u64, min_id: Option<u64>, max_id: Option<u64>) {
        let min_id = min_id.unwrap_or(0);
        let max_id = max_id.unwrap_or(0);
        let mut tables = self.tables.lock().expect("coordinator poisoned");
        let progress = tables.entry(table.to_string()).or_default();
        if count > progress.rows_count {
            progress.rows_count = count;
        }
        if progress.current_id.map_or(true, |current| min_id < current) {
            progress.current_id = Some(min_id);
        }
        if max_id > progress.max_id {
            progress.max_id = max_id;
        }
    }

    pub fn add_parsed(&self, table: &str, count: u64) {
        let mut tables = self.tables.lock().expect("coordinator poisoned");
        tables.entry(table.to_string()).or_default().rows_parsed += count;
    }

    /// True once the next window would start past the highest observed
    /// id, meaning an empty fetch is the end of the table rather than a
    /// gap in the id space.
    pub fn is_end(&self, table: &str) -> bool {
        let tables = self.tables.lock().expect("coordinator poisoned");
        match tables.get(table) {
            Some(progress) => progress.current_id.unwrap_or(0) > progress.max_id,
            None => true,
        }
    }

    /// `(total_rows, parsed_rows)` summed across tables, for the health
    /// surface.
    pub fn statistic(&self) -> (u64, u64) {
        let tables = self.tables.lock().expect("coordinator poisoned");
        let mut total = 0;
        let mut parsed = 0;
        for progress in tables.values() {
            total += progress.rows_count;
            parsed += progress.rows_parsed;
        }
        (total, parsed)
    }
}

/// One worker's view of the primary during the snapshot. Production
/// workers hold a `REPEATABLE READ` transaction opened with a consistent
/// snapshot; tests substitute an in-memory table set.
pub trait SnapshotSource {
    /// `(COUNT(*), MIN(id), MAX(id))` of a table as this worker sees it.
    fn table_extent(&mut self, db_name: &str, table: &str) -> Result<(u64, Option<u64>, Option<u64>)>;

    /// All rows with `start <= id < end`, in id order.
    fn fetch_range(&mut self, db_name: &str, table: &str, start: u64, end: u64) -> Result<Vec<RowImage>>;
}

pub struct PrimarySnapshotSource {
    primary: Primary,
}

impl PrimarySnapshotSource {
    pub fn open(settings: &PrimarySettings) -> Result<PrimarySnapshotSource> {
        let mut primary = Primary::connect(settings, None)?;
        primary.execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")?;
        primary.execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")?;
        Ok(PrimarySnapshotSource { primary })
    }
}

impl SnapshotSource for PrimarySnapshotSource {
    fn table_extent(&mut self, db_name: &str, table: &str) -> Result<(u64, Option<u64>, Option<u64>)> {
        let extent = self
            .primary
            .query_first_tuple(&format!("SELECT COUNT(*), MIN(id), MAX(id) FROM {db_name}.{table}"))?;
        Ok(extent.unwrap_or((0, None, None)))
    }

    fn fetch_range(&mut self, db_name: &str, table: &str, start: u64, end: u64) -> Result<Vec<RowImage>> {
        self.primary.fetch_images(&format!(
            "SELECT * FROM {db_name}.{table} WHERE id >= {start} AND id < {end}"
        ))
    }
}

/// Runs `settings.snapshot_workers` workers to completion. Any worker
/// error stops the others at their next batch boundary and is returned.
pub fn run_snapshot<S, F>(engine: &Engine, settings: &Settings, sink: &SinkHandle, connect: F) -> Result<()>
where
    S: SnapshotSource,
    F: Fn() -> Result<S> + Send + Sync,
{
    info!(
        workers = settings.snapshot_workers,
        tables = ?settings.snapshot_tables,
        "starting snapshot workers"
    );

    let barrier = Barrier::new(settings.snapshot_workers);
    let results = thread::scope(|scope| {
        let mut handles = Vec::new();
        for worker in 0..settings.snapshot_workers {
            let connect = &connect;
            let barrier = &barrier;
            handles.push(scope.spawn(move || {
                let result = worker_loop(worker, engine, settings, sink, connect, barrier);
                if let Err(e) = &result {
                    engine.record_error(format!("snapshot worker {worker}: {e}"));
                    engine.request_stop();
                }
                result
            }));
        }
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(EngineError::Stream("snapshot worker panicked".into())))
            })
            .collect::<Vec<_>>()
    });

    for result in results {
        result?;
    }
    Ok(())
}

fn worker_loop<S: SnapshotSource>(
    worker: usize,
    engine: &Engine,
    settings: &Settings,
    sink: &SinkHandle,
    connect: &impl Fn() -> Result<S>,
    barrier: &Barrier,
) -> Result<()> {
    let coordinator = engine.coordinator();

    // Every worker samples every table before any worker starts
    // fetching; otherwise a late sample could pull the shared cursor
    // back below ranges that were already handed out. The barrier is
    // reached on the error path too, so a failed worker cannot strand
    // the others.
    let setup = connect().and_then(|mut source| {
        for table in &settings.snapshot_tables {
            let (count, min_id, max_id) = source.table_extent(&settings.db_name, table)?;
            coordinator.report_range(table, count, min_id, max_id);
            debug!(worker, %table, count, "sampled table extent");
        }
        Ok(source)
    });
    barrier.wait();
    let mut source = setup?;

    for table in &settings.snapshot_tables {
        loop {
            if engine.stop_requested() {
                return Ok(());
            }
            let start = coordinator.reserve(table, settings.snapshot_batch);
            let rows = source.fetch_range(&settings.db_name, table, start, start + settings.snapshot_batch)?;
            if rows.is_empty() {
                if coordinator.is_end(table) {
                    break;
                }
                // id gap narrower than the remaining table, keep scanning
                continue;
            }
            let fetched = rows.len() as u64;
            for image in rows {
                sink.process_event(RowKind::Insert, &settings.db_name, table, RowPayload::Values(image))?;
            }
            coordinator.add_parsed(table, fetched);
        }
        debug!(worker, %table, "table snapshot complete");
    }

    Ok(())
}
