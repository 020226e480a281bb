use std::{io, path::PathBuf, string::FromUtf8Error};

use crate::constants::MAX_PAYLOAD_SIZE;

/// Failures of the framing layer.
///
/// Every variant is fatal to the connection it happened on: the framing
/// primitives never retry, and the caller is expected to drop the stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The peer closed the stream cleanly, before the first byte of a message.
    ///
    /// This is how a worker learns that the server has no more work for it.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The stream failed, or the peer went away in the middle of a message.
    #[error("connection broken: {0}")]
    ConnectionBroken(#[from] io::Error),

    /// A length prefix announced (or a sender tried to frame) a payload
    /// larger than [`MAX_PAYLOAD_SIZE`].
    #[error("payload of {0} bytes exceeds the {max} byte limit", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    /// A dispatch message carried a type tag outside `{0, 1, 2}`.
    #[error("unknown task kind tag {0:#04x}")]
    UnknownTaskKind(u8),

    /// A payload that must be text was not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
}

/// Failures around a single task: moving it over the wire, running it on a
/// worker, or persisting its result on the server.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The exchange with the peer failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The shell could not be started for this command.
    #[error("failed to run `{command}`: {source}")]
    Execution {
        command: String,
        #[source]
        source: io::Error,
    },

    /// A file-output command printed nothing that could name its result file.
    #[error("command printed no result file path")]
    MissingResultPath,

    /// The file named by a file-output command could not be read.
    #[error("failed to read result file {}: {source}", .path.display())]
    ResultFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A received file result could not be spooled to a temporary file.
    #[error("failed to spool received file: {0}")]
    Spool(#[source] io::Error),

    /// The result could not be written to its destination.
    #[error("failed to persist result to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TaskError {
    /// True for failures that mean the worker could not produce an output,
    /// as opposed to a broken exchange or a server-side storage problem.
    pub fn is_execution(&self) -> bool {
        matches!(
            self,
            TaskError::Execution { .. } | TaskError::MissingResultPath | TaskError::ResultFile { .. }
        )
    }
}

/// Failures that stop the listener before it can serve anything.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("could not resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("could not listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Failures that end a worker run.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("could not connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("giving up after {0} consecutive execution failures")]
    TooManyFailures(u32),
}

/// Failures while building the initial task list.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {what}: {source}")]
    Read {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid task manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{commands} commands but {destinations} result paths")]
    LengthMismatch { commands: usize, destinations: usize },

    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
