//! Error types for engine commands, run controls, and storage.

/// Failure reported by the engine's command API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The engine task is gone or never answered.
    #[error("maintenance engine is unavailable")]
    Unavailable,

    /// The engine refused the command.
    #[error("{0}")]
    Rejected(String),

    #[error("no active maintenance run for this profile")]
    NoActiveRun,
}

/// Error surfaced to the caller of a run control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Skipping needs a single current database, which parallel runs lack.
    #[error("cannot skip a database while databases run in parallel")]
    SkipInParallel,

    /// Rejected before anything was sent to the engine.
    #[error("{0}")]
    Validation(String),
}

/// The event bridge already owns the engine's event source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("engine event listeners are already registered")]
pub struct AlreadyRegistered;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no data directory available")]
    NoDataDir,

    #[error("unknown maintenance setting {0:?}")]
    UnknownSetting(String),

    #[error("invalid value for {key}: {source}")]
    InvalidSetting {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}
