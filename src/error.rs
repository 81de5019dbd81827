use std::path::PathBuf;
use thiserror::Error;

/// Reasons a run could not be launched. Nothing is spawned when one of these is returned.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("File not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error("Unsupported audio format: {}", .0.display())]
    UnsupportedAudio(PathBuf),

    #[error("Another process is running. Please stop it before starting a new one.")]
    Busy,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        LaunchError::Io {
            context: context.into(),
            source,
        }
    }
}
