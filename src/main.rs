use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use binlog_mirror::engine;
use binlog_mirror::{Engine, Result, Settings, SinkHandle};

/// One-way CDC pipeline: snapshots the configured tables, then mirrors
/// row events from the primary's binlog into the configured sink.
#[derive(Parser)]
#[command(name = "binlog-mirror", version, about)]
struct Cli {
    /// Path to the YAML settings file.
    #[arg(long, short, env = "BINLOG_MIRROR_CONFIG", default_value = "binlog-mirror.yaml")]
    config: PathBuf,

    /// Override the configured sink module.
    #[arg(long)]
    sink: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = try_main(Cli::parse()) {
        error!(error = %e, "engine stopped with a fatal error");
        process::exit(1);
    }
}

fn try_main(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(&cli.config)?;
    if let Some(sink) = cli.sink {
        settings.sink_module = sink;
    }

    let sink = SinkHandle::resolve(&settings.sink_module)?;
    let engine = Arc::new(Engine::new());
    engine::install_signal_handler(engine.clone())?;

    info!(db = %settings.db_name, sink = %sink.name(), "starting");
    engine::run(&settings, &sink, engine)?;
    info!("clean shutdown");
    Ok(())
}
