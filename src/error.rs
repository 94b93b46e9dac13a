// src/error.rs
use std::io;

use thiserror::Error;

/// Central error type for the ravel engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Underlying I/O error from the OS or network.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The worker pool is shutting down and rejects new submissions.
    #[error("worker pool is stopped")]
    PoolStopped,
    /// A task finished without delivering its result.
    #[error("task result dropped before completion")]
    TaskLost,
    /// Rejected server configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Signal handler installation failed.
    #[error("signal handler error: {0}")]
    Signal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
