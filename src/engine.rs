//! Engine state and the lifecycle supervisor.
//!
//! The reference design for this pipeline kept stage, last GTID, stop
//! flag and snapshot progress in process-wide globals; here they are
//! bundled into an `Engine` value owned by the supervisor and shared
//! with the consumer, the snapshot workers and the health server. One
//! mutex protects the fields the health server reads.

use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{EngineError, Result};
use crate::primary::Primary;
use crate::settings::Settings;
use crate::sink::SinkHandle;
use crate::snapshot::{self, PrimarySnapshotSource, SnapshotCoordinator};
use crate::stream::{self, MysqlBinlogSource};
use crate::{consumer, health, preflight};

/// Window within which a second interrupt forces an immediate exit.
pub const FORCE_EXIT_WINDOW_MS: u64 = 1_500;

/// Exit code of a forced (double-interrupt) shutdown.
pub const FORCE_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Init,
    Snapshot,
    Stream,
}

#[derive(Debug)]
struct EngineShared {
    stage: Stage,
    consumer_gtid: Option<String>,
    last_error: Option<String>,
}

pub struct Engine {
    shared: Mutex<EngineShared>,
    stop: AtomicBool,
    coordinator: SnapshotCoordinator,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            shared: Mutex::new(EngineShared {
                stage: Stage::Init,
                consumer_gtid: None,
                last_error: None,
            }),
            stop: AtomicBool::new(false),
            coordinator: SnapshotCoordinator::new(),
        }
    }

    pub fn coordinator(&self) -> &SnapshotCoordinator {
        &self.coordinator
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn stage(&self) -> Stage {
        self.shared.lock().expect("engine state poisoned").stage
    }

    /// Stages only move forward; a backward transition is a programming
    /// error and is ignored with a warning rather than honored.
    pub fn advance_stage(&self, stage: Stage) {
        let mut shared = self.shared.lock().expect("engine state poisoned");
        if stage < shared.stage {
            warn!(?stage, current = ?shared.stage, "ignoring backward stage transition");
            return;
        }
        if stage != shared.stage {
            info!(from = ?shared.stage, to = ?stage, "stage transition");
            shared.stage = stage;
        }
    }

    pub fn set_consumer_gtid(&self, gtid: String) {
        self.shared.lock().expect("engine state poisoned").consumer_gtid = Some(gtid);
    }

    pub fn consumer_gtid(&self) -> Option<String> {
        self.shared
            .lock()
            .expect("engine state poisoned")
            .consumer_gtid
            .clone()
    }

    pub fn record_error(&self, message: String) {
        error!(%message, "fatal engine error");
        self.shared.lock().expect("engine state poisoned").last_error = Some(message);
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .lock()
            .expect("engine state poisoned")
            .last_error
            .clone()
    }
}

/// Installs the INT/TERM handler: first signal requests a cooperative
/// stop, a second within the force window exits immediately with 130.
pub fn install_signal_handler(engine: Arc<Engine>) -> Result<()> {
    let last_signal = AtomicU64::new(0);
    ctrlc::set_handler(move || {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let previous = last_signal.swap(now, Ordering::SeqCst);
        if previous != 0 && now.saturating_sub(previous) < FORCE_EXIT_WINDOW_MS {
            eprintln!("force exit");
            process::exit(FORCE_EXIT_CODE);
        }
        eprintln!("graceful shutdown requested (signal again to force)");
        engine.request_stop();
    })
    .map_err(|e| EngineError::Config(format!("cannot install signal handler: {e}")))
}

/// Runs the whole pipeline: preflight, health server, snapshot when no
/// checkpoint exists, then the live stream until stop. The sink is torn
/// down and the health server joined on every exit path.
pub fn run(settings: &Settings, sink: &SinkHandle, engine: Arc<Engine>) -> Result<()> {
    let mut admin = Primary::connect(&settings.primary, None)?;

    preflight::preflight_check(&mut admin, settings, || stream::probe(&settings.primary))?;

    let health_settings = settings.clone();
    let health_engine = engine.clone();
    let health_primary = settings.primary.clone();
    let health_thread = thread::spawn(move || {
        health::serve(
            &health_engine,
            &health_settings.health_socket_path,
            move || Primary::connect(&health_primary, None)?.current_gtid(),
        )
    });

    let result = run_stages(settings, sink, &engine, &mut admin);

    if let Err(e) = &result {
        engine.record_error(e.to_string());
    }
    engine.request_stop();

    if let Err(e) = sink.tear_down() {
        warn!(error = %e, "sink tear_down failed");
    }
    match health_thread.join() {
        Ok(Err(e)) => warn!(error = %e, "health server failed"),
        Err(_) => warn!("health server panicked"),
        Ok(Ok(())) => {}
    }

    result
}

fn run_stages(
    settings: &Settings,
    sink: &SinkHandle,
    engine: &Arc<Engine>,
    admin: &mut Primary,
) -> Result<()> {
    sink.init()?;

    let store = CheckpointStore::new(&settings.checkpoint_path);
    let checkpoint = match store.load() {
        Some(checkpoint) => {
            info!(%checkpoint, "resuming from checkpoint");
            checkpoint
        }
        None => {
            info!("no usable checkpoint, running full snapshot");
            engine.advance_stage(Stage::Snapshot);

            // The snapshot cut: everything committed after this position
            // is observed again by the stream, so persist it before any
            // worker starts reading.
            let cut = admin.master_status()?;
            store.save(&cut)?;

            sink.initiate_full_regeneration()?;
            snapshot::run_snapshot(engine, settings, sink, || {
                PrimarySnapshotSource::open(&settings.primary)
            })?;
            sink.finished_full_regeneration()?;
            info!("snapshot finished");
            cut
        }
    };

    if engine.stop_requested() {
        return Ok(());
    }

    engine.advance_stage(Stage::Stream);
    sink.initiate_synch_mode()?;
    info!(start = %checkpoint, "starting binlog consumer");

    let source = MysqlBinlogSource::open(settings, &checkpoint)?;
    let mut consumer = consumer::BinlogConsumer::new(source, sink.clone(), store, checkpoint, settings);
    consumer.run(engine)
}
