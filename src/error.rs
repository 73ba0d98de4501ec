//! The top-level error for the agent. Each subsystem has its own error enum
//! close to the code that raises it; this one only gathers them up so the
//! supervisor and the binary can report a single failure.

use crate::capture_file::CaptureFileError;
use crate::event_stream::StreamError;
use crate::radio::RadioError;
use crate::remote::RemoteError;
use crate::spectrum_file::SpectrumFileError;
use crate::store::StoreError;

use thiserror::Error;

/// Anything that can stop the agent (or one of its workers) for good.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The radio did not answer the start-up self-test.
    #[error("radio self-test failed")]
    SelfTestFailed,

    /// A worker returned or panicked; the supervisor treats both as fatal.
    #[error("worker `{name}` exited")]
    WorkerExited {
        /// Name of the worker thread that stopped first.
        name: String,
    },

    /// Failed to start a worker thread.
    #[error("unable to spawn worker `{name}`: {source}")]
    Spawn {
        /// Name of the worker that could not be started.
        name: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The task store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A control-plane call failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The radio failed.
    #[error(transparent)]
    Radio(#[from] RadioError),

    /// A capture file could not be read or written.
    #[error(transparent)]
    CaptureFile(#[from] CaptureFileError),

    /// A spectrum file could not be read or written.
    #[error(transparent)]
    SpectrumFile(#[from] SpectrumFileError),

    /// The event stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Any other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
