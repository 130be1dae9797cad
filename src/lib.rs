pub mod buffer;
pub mod checkpoint;
pub mod consumer;
pub mod engine;
pub mod error;
pub mod event;
pub mod gtid;
pub mod health;
pub mod preflight;
pub mod primary;
pub mod settings;
pub mod sink;
pub mod snapshot;
pub mod stream;

pub use crate::checkpoint::{Checkpoint, CheckpointStore};
pub use crate::engine::{Engine, Stage};
pub use crate::error::{EngineError, Result};
pub use crate::event::{RowEvent, RowKind, RowPayload};
pub use crate::settings::Settings;
pub use crate::sink::{EventSink, SinkHandle};
