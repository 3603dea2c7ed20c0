//! Error types for stepbox-core.

use crate::layers::{DriverError, TeardownStep};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for stepbox-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while running or reclaiming a sandbox.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from spec assembly
    #[error("spec error: {0}")]
    Spec(#[from] stepbox_spec::SpecError),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Config(String),

    /// The process could not be started
    #[error("failed to start {command}: {source}")]
    Launch {
        /// Command that was launched
        command: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Waiting for the process failed
    #[error("failed to wait for {command}: {source}")]
    Wait {
        /// Command being waited on
        command: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The process exited unsuccessfully without a stop request
    #[error("{command} exited with {status}")]
    Exited {
        /// Command that exited
        command: String,
        /// Exit status reported by the OS
        status: std::process::ExitStatus,
    },

    /// The execution spec has no command to run
    #[error("execution spec has an empty command")]
    EmptyCommand,

    /// A required binary is missing
    #[error("missing requirements: failed to lookup {0} binary")]
    Requirements(String),

    /// A socket did not come up in time
    #[error("socket {path} not ready after {timeout:?}")]
    SocketTimeout {
        /// Socket path
        path: PathBuf,
        /// How long we waited
        timeout: Duration,
    },

    /// The process stopped while something was waiting on it
    #[error("{command} stopped before {path} became ready")]
    ProcessStopped {
        /// Command that stopped
        command: String,
        /// Socket path being waited on
        path: PathBuf,
    },

    /// Reading the layer root failed
    #[error("failed to scan layers in {path}: {source}")]
    Scan {
        /// Layer root
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// An entry in the layer root is not a numbered layer directory
    #[error("invalid layer entry {path}: expected a numbered layer directory")]
    InvalidLayer {
        /// Offending entry
        path: PathBuf,
    },

    /// A layer could not be torn down
    #[error("failed to {step} {layer}: {source}")]
    Teardown {
        /// Step that failed
        step: TeardownStep,
        /// Layer path
        layer: PathBuf,
        /// Driver error
        source: DriverError,
    },

    /// Tearing down the snapshot layers under a data root failed
    #[error("failed to cleanup snapshot layers in {path}: {source}")]
    SnapshotCleanup {
        /// Snapshot directory
        path: PathBuf,
        /// Scan or teardown failure
        source: Box<CoreError>,
    },

    /// Removing a directory failed
    #[error("failed to remove {path}: {source}")]
    Remove {
        /// Directory being removed
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A background task panicked or was cancelled
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Layer path of a teardown failure.
    pub fn layer(&self) -> Option<&std::path::Path> {
        match self {
            CoreError::Teardown { layer, .. } => Some(layer.as_path()),
            CoreError::SnapshotCleanup { source, .. } => source.layer(),
            _ => None,
        }
    }
}
