//! Health introspection over a UNIX-domain socket. Each accepted
//! connection gets one JSON document and a newline, then the socket is
//! closed. The accept loop polls with a short timeout so a stop request
//! wakes it.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{Engine, Stage};
use crate::error::Result;
use crate::gtid;

/// Upper bound on how long a stop request waits for the accept loop.
pub const ACCEPT_IDLE: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    stage: Stage,
    snapshot_rows_total: u64,
    snapshot_rows_parsed: u64,
    server_gtid: Option<String>,
    consumer_gtid: Option<String>,
    gtid_diff: u64,
    error: Option<String>,
}

/// Serves health answers until the engine requests stop. The socket
/// file is unlinked before binding (stale files from a previous run)
/// and removed again on the way out. `server_gtid` queries the primary
/// for its current GTID position, once per accepted connection.
pub fn serve(
    engine: &Engine,
    socket_path: &Path,
    mut server_gtid: impl FnMut() -> Result<Option<String>>,
) -> Result<()> {
    let _ = fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    listener.set_nonblocking(true)?;
    info!(path = %socket_path.display(), "health server started");

    while !engine.stop_requested() {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = answer(engine, stream, &mut server_gtid) {
                    warn!(error = %e, "health answer failed");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_IDLE),
            Err(e) => {
                warn!(error = %e, "health accept failed");
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }

    drop(listener);
    let _ = fs::remove_file(socket_path);
    info!("health server stopped");
    Ok(())
}

fn answer(
    engine: &Engine,
    mut stream: UnixStream,
    server_gtid: &mut impl FnMut() -> Result<Option<String>>,
) -> Result<()> {
    stream.set_nonblocking(false)?;

    let (server_gtid, probe_error) = match server_gtid() {
        Ok(gtid) => (gtid, None),
        Err(e) => (None, Some(e.to_string())),
    };
    let consumer_gtid = engine.consumer_gtid();
    let (snapshot_rows_total, snapshot_rows_parsed) = engine.coordinator().statistic();
    let error = probe_error.or_else(|| engine.last_error());

    let report = HealthReport {
        status: if error.is_none() { "ok" } else { "error" },
        stage: engine.stage(),
        snapshot_rows_total,
        snapshot_rows_parsed,
        gtid_diff: gtid::diff(consumer_gtid.as_deref(), server_gtid.as_deref()),
        server_gtid,
        consumer_gtid,
        error,
    };

    let mut document = serde_json::to_string(&report)?;
    document.push('\n');
    stream.write_all(document.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::Engine;
    use std::io::Read;
    use std::sync::Arc;

    fn ask(path: &Path) -> serde_json::Value {
        // the server may still be binding; retry briefly
        let mut attempts = 0;
        let mut stream = loop {
            match UnixStream::connect(path) {
                Ok(stream) => break stream,
                Err(_) if attempts < 50 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("cannot reach health socket: {e}"),
            }
        };
        let mut raw = String::new();
        stream.read_to_string(&mut raw).unwrap();
        assert!(raw.ends_with('\n'));
        serde_json::from_str(raw.trim_end()).unwrap()
    }

    #[test]
    fn answers_snapshot_progress_and_gtid_diff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.sock");
        let engine = Arc::new(Engine::new());
        engine.advance_stage(Stage::Snapshot);
        engine.coordinator().report_range("items", 10_000, Some(1), Some(10_000));
        engine.coordinator().report_range("items2", 10_000, Some(1), Some(10_000));
        engine.coordinator().add_parsed("items", 1_500);
        engine.set_consumer_gtid("1-1-2236".into());

        let server = {
            let engine = engine.clone();
            let path = path.clone();
            thread::spawn(move || serve(&engine, &path, || Ok(Some("0-1-158,1-1-2237".into()))))
        };

        let answer = ask(&path);
        assert_eq!(answer["status"], "ok");
        assert_eq!(answer["stage"], "SNAPSHOT");
        assert_eq!(answer["snapshot_rows_total"], 20_000);
        assert_eq!(answer["snapshot_rows_parsed"], 1_500);
        assert_eq!(answer["server_gtid"], "0-1-158,1-1-2237");
        assert_eq!(answer["consumer_gtid"], "1-1-2236");
        assert_eq!(answer["gtid_diff"], 1);
        assert_eq!(answer["error"], serde_json::Value::Null);

        engine.request_stop();
        server.join().unwrap().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn reports_probe_failures_as_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.sock");
        let engine = Arc::new(Engine::new());

        let server = {
            let engine = engine.clone();
            let path = path.clone();
            thread::spawn(move || {
                serve(&engine, &path, || {
                    Err(EngineError::Stream("primary unreachable".into()))
                })
            })
        };

        let answer = ask(&path);
        assert_eq!(answer["status"], "error");
        assert_eq!(answer["stage"], "INIT");
        assert_eq!(answer["server_gtid"], serde_json::Value::Null);
        assert_eq!(answer["gtid_diff"], 0);
        assert!(answer["error"].as_str().unwrap().contains("primary unreachable"));

        engine.request_stop();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn rebinds_over_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.sock");
        // stale socket from a dead process
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let engine = Arc::new(Engine::new());
        let server = {
            let engine = engine.clone();
            let path = path.clone();
            thread::spawn(move || serve(&engine, &path, || Ok(None)))
        };

        let answer = ask(&path);
        assert_eq!(answer["status"], "ok");

        engine.request_stop();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn reports_recorded_engine_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("health.sock");
        let engine = Arc::new(Engine::new());
        engine.record_error("sink `process_event` failed: emulated sink failure".into());

        let server = {
            let engine = engine.clone();
            let path = path.clone();
            thread::spawn(move || serve(&engine, &path, || Ok(None)))
        };

        let answer = ask(&path);
        assert_eq!(answer["status"], "error");
        assert!(answer["error"].as_str().unwrap().contains("process_event"));

        engine.request_stop();
        server.join().unwrap().unwrap();
    }
}
