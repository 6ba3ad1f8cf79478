use thiserror::Error;

/// The engine's error taxonomy (spec §7): configuration errors and I/O
/// errors are fatal and reported once; numeric degeneracy is asserted in
/// debug builds and only surfaced here where a release build would
/// otherwise divide by a degenerate value.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to open output file {path}: {source}")]
    OutputIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("numeric degeneracy at {where_}: {detail}")]
    NumericDegeneracy { where_: &'static str, detail: String },

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("worker pool disconnected: {0}")]
    WorkerPoolDisconnected(String),
}
