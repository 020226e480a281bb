use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::error::{ProtocolError, TaskError};
use crate::protocol::{recv_sized, send_typed};

/// Declared shape of a task's output.
///
/// The discriminants are the tags sent on the wire and must not change.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// The command is run for its side effects only.
    #[serde(alias = "none")]
    #[value(name = "none")]
    NoOutput,
    /// The command's standard output is the result.
    #[serde(alias = "stdout")]
    #[value(name = "stdout")]
    StandardOutput,
    /// The last line the command prints is the path of a result file.
    #[serde(alias = "file")]
    #[value(name = "file")]
    FileOutput,
}

impl TaskKind {
    pub fn from_byte(byte: u8) -> Option<TaskKind> {
        match byte {
            NO_OUTPUT_TASK_CODE => Some(TaskKind::NoOutput),
            STANDARD_OUTPUT_TASK_CODE => Some(TaskKind::StandardOutput),
            FILE_OUTPUT_TASK_CODE => Some(TaskKind::FileOutput),
            _ => None,
        }
    }

    #[inline]
    pub fn as_byte(self) -> u8 {
        match self {
            TaskKind::NoOutput => NO_OUTPUT_TASK_CODE,
            TaskKind::StandardOutput => STANDARD_OUTPUT_TASK_CODE,
            TaskKind::FileOutput => FILE_OUTPUT_TASK_CODE,
        }
    }
}

impl TryFrom<u8> for TaskKind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        TaskKind::from_byte(byte).ok_or(ProtocolError::UnknownTaskKind(byte))
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::NoOutput => write!(f, "none"),
            TaskKind::StandardOutput => write!(f, "stdout"),
            TaskKind::FileOutput => write!(f, "file"),
        }
    }
}

/// A result as held by the server once it has been received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    /// Result of a [`TaskKind::NoOutput`] task.
    Empty,
    /// Captured standard output.
    Text(String),
    /// A file on the server: the spool file right after receipt, the
    /// destination once persisted.
    File(PathBuf),
}

/// One shell command together with how its result is handled.
///
/// Tasks are immutable once built; their results live in the
/// [`TasksManager`](crate::manager::TasksManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    command: String,
    kind: TaskKind,
    #[serde(default)]
    destination: Option<PathBuf>,
}

impl Task {
    pub fn new(command: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            command: command.into(),
            kind,
            destination: None,
        }
    }

    /// Sets where the server persists this task's result.
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Wire form of the task: the kind tag and the UTF-8 command.
    pub fn serialize(&self) -> (u8, &[u8]) {
        (self.kind.as_byte(), self.command.as_bytes())
    }

    /// Rebuilds a task from a received dispatch message.
    pub fn from_wire(tag: u8, payload: Vec<u8>) -> Result<Self, ProtocolError> {
        let kind = TaskKind::try_from(tag)?;
        let command = String::from_utf8(payload)?;
        Ok(Task::new(command, kind))
    }

    /// Sends the task to a worker.
    pub async fn dispatch_to<W>(&self, stream: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let (tag, payload) = self.serialize();
        send_typed(stream, tag, payload).await
    }

    /// Waits for the worker's answer to this task and decodes it by kind.
    ///
    /// File results are spooled to a fresh temporary file whose path is
    /// returned; nothing is written to the destination here.
    pub async fn await_result<R>(&self, stream: &mut R) -> Result<TaskResult, TaskError>
    where
        R: AsyncRead + Unpin,
    {
        let bytes = recv_sized(stream).await?;
        match self.kind {
            TaskKind::NoOutput => Ok(TaskResult::Empty),
            TaskKind::StandardOutput => {
                let text = String::from_utf8(bytes).map_err(ProtocolError::from)?;
                Ok(TaskResult::Text(text))
            }
            TaskKind::FileOutput => {
                let path = tokio::task::spawn_blocking(move || spool(&bytes))
                    .await
                    .map_err(|e| TaskError::Spool(io::Error::other(e)))?
                    .map_err(TaskError::Spool)?;
                Ok(TaskResult::File(path))
            }
        }
    }

    /// Runs the command through `sh -c` and returns the bytes to send back.
    ///
    /// A non-zero exit status is not a failure. For file-output tasks the last
    /// line of standard output names a local file whose contents are returned
    /// instead of the output itself.
    pub async fn execute(&self) -> Result<Vec<u8>, TaskError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
            .map_err(|source| TaskError::Execution {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            warn!(command = %self.command, status = %output.status, "command exited unsuccessfully");
        }

        match self.kind {
            TaskKind::NoOutput => Ok(Vec::new()),
            TaskKind::StandardOutput => Ok(output.stdout),
            TaskKind::FileOutput => {
                let path = result_file_path(&output.stdout).ok_or(TaskError::MissingResultPath)?;
                debug!(path = %path.display(), "reading produced result file");
                tokio::fs::read(&path)
                    .await
                    .map_err(|source| TaskError::ResultFile { path, source })
            }
        }
    }

    /// Persists a received result to the destination, if one is set.
    ///
    /// Writes go through a temporary file in the destination directory, so a
    /// failed save leaves any previous destination file intact, and the
    /// saved file keeps the mode of the file it replaces. Returns the result
    /// as it should be remembered afterwards.
    ///
    /// Without a destination a received file stays in its spool file, whose
    /// path is returned and logged.
    pub async fn save_result(&self, result: TaskResult) -> Result<TaskResult, TaskError> {
        let Some(destination) = self.destination.clone() else {
            if let TaskResult::File(spooled) = &result {
                info!(path = %spooled.display(), "no destination, result kept in spool file");
            }
            return Ok(result);
        };

        match result {
            TaskResult::Empty => Ok(TaskResult::Empty),
            TaskResult::Text(text) => {
                let bytes = text.clone().into_bytes();
                let target = destination.clone();
                run_blocking(move || persist(&target, &mut bytes.as_slice()))
                    .await
                    .map_err(|source| TaskError::Persist {
                        path: destination,
                        source,
                    })?;
                Ok(TaskResult::Text(text))
            }
            TaskResult::File(spooled) => {
                let target = destination.clone();
                let source_path = spooled.clone();
                run_blocking(move || {
                    let mut source = std::fs::File::open(&source_path)?;
                    persist(&target, &mut source)
                })
                .await
                .map_err(|source| TaskError::Persist {
                    path: destination.clone(),
                    source,
                })?;

                if spooled != destination {
                    if let Err(e) = tokio::fs::remove_file(&spooled).await {
                        debug!(path = %spooled.display(), error = %e, "could not remove spool file");
                    }
                }
                Ok(TaskResult::File(destination))
            }
        }
    }
}

/// Path printed on the last non-empty line of `stdout`.
fn result_file_path(stdout: &[u8]) -> Option<PathBuf> {
    let text = String::from_utf8_lossy(stdout);
    let line = text.trim_end_matches(['\n', '\r']).lines().last()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(PathBuf::from(line))
    }
}

fn spool(bytes: &[u8]) -> io::Result<PathBuf> {
    let mut file = NamedTempFile::new()?;
    file.write_all(bytes)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn persist(destination: &Path, source: &mut impl io::Read) -> io::Result<()> {
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = staging_file(destination, dir)?;
    io::copy(source, &mut staged)?;
    staged.flush()?;
    staged.persist(destination).map_err(|e| e.error)?;
    Ok(())
}

/// Temporary file next to `destination` with the permissions the saved file
/// should end up with: those of the file being replaced, or the usual
/// `0666` less the umask for a new one.
fn staging_file(destination: &Path, dir: &Path) -> io::Result<NamedTempFile> {
    let existing = std::fs::metadata(destination).ok().map(|m| m.permissions());
    let mut builder = tempfile::Builder::new();
    #[cfg(unix)]
    if existing.is_none() {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    let staged = builder.tempfile_in(dir)?;
    if let Some(permissions) = existing {
        staged.as_file().set_permissions(permissions)?;
    }
    Ok(staged)
}

async fn run_blocking<F>(f: F) -> io::Result<()>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
}
