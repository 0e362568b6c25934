//! Error taxonomy for the orchestration core.
//!
//! Every request handler surfaces failures synchronously through its
//! acknowledgement; nothing is retried behind the caller's back. Benign
//! races (duplicate pipe/connect/router creation) and per-tick telemetry
//! failures are absorbed before they ever reach this type.

use crate::engine::EngineError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Request arrived before the worker pool finished initializing.
    /// Non-fatal; the caller is expected to retry.
    #[error("Server not ready")]
    NotReady,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Incompatible capabilities: {0}")]
    IncompatibleCapabilities(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// A media-engine worker process exited. Unrecoverable in the
    /// current design: the whole service terminates.
    #[error("Worker {0} died")]
    WorkerFatal(usize),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Media engine error: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for Error {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(what) => Self::NotFound(what),
            EngineError::TransportClosed(id) => Self::TransportFailure(id),
            other => Self::Engine(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
