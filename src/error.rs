use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-wide error type. Configuration and preflight failures are fatal
/// before any stage runs; the rest bubble up to the supervisor, which
/// records them for the health surface and shuts the pipeline down.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("primary connection error: {0}")]
    Primary(#[from] mysql::Error),

    #[error("binlog stream error: {0}")]
    Stream(String),

    #[error("unknown binlog framing: {0}")]
    UnknownEvent(String),

    #[error("sink `{entry}` failed: {source}")]
    Sink {
        entry: &'static str,
        #[source]
        source: Box<EngineError>,
    },

    #[error("sink rejected event: {0}")]
    SinkRejected(String),

    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn in_sink(entry: &'static str, source: EngineError) -> EngineError {
        EngineError::Sink {
            entry,
            source: Box::new(source),
        }
    }
}
