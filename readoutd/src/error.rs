use std::io;
use std::path::PathBuf;

/// Errors surfaced across the readout component boundary.
///
/// Only configuration and lifecycle failures propagate to the caller of
/// `init`/`conf`/`record`. Runtime integrity problems (queue timeouts, frame
/// gaps, buffer overruns) are counted and never raised as errors.
#[derive(Debug, thiserror::Error)]
pub enum ReadoutError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource queue not found: {0}")]
    ResourceQueue(String),

    #[error("cannot open file {path}: {source}")]
    CannotOpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("command {command} not allowed in state {state}")]
    InvalidState {
        command: &'static str,
        state: &'static str,
    },

    #[error("a recording is still running, no new recording was started")]
    RecordingActive,

    #[error("recording is not configured for this link")]
    RecordingNotConfigured,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReadoutError>;
