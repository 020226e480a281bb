//! Building the initial task list.
//!
//! Two input shapes are understood. A *command list* has one shell command
//! per line, optionally paired with a *results list* holding the destination
//! of each command's result on the same line number. A *manifest* is a JSON
//! array of tasks:
//!
//! ```json
//! [
//!   { "command": "echo 0", "kind": "stdout", "destination": "out/0.txt" },
//!   { "command": "touch /tmp/flag", "kind": "none" }
//! ]
//! ```

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::LoadError;
use crate::task::{Task, TaskKind};

/// Non-blank lines of `reader`, line endings stripped.
pub fn read_lines(reader: impl BufRead) -> io::Result<Vec<String>> {
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if !line.trim().is_empty() {
            lines.push(line.to_string());
        }
    }
    Ok(lines)
}

/// Reads the lines of `path`, or of stdin when `path` is `None`.
pub fn read_lines_from(path: Option<&Path>) -> Result<Vec<String>, LoadError> {
    match path {
        Some(path) => {
            let file = File::open(path).map_err(|source| LoadError::Read {
                what: path.display().to_string(),
                source,
            })?;
            read_lines(BufReader::new(file)).map_err(|source| LoadError::Read {
                what: path.display().to_string(),
                source,
            })
        }
        None => read_lines(io::stdin().lock()).map_err(|source| LoadError::Read {
            what: "stdin".to_string(),
            source,
        }),
    }
}

/// Pairs commands with destinations. Both lists must be the same length.
pub fn build_tasks(
    commands: Vec<String>,
    destinations: Option<Vec<PathBuf>>,
    kind: TaskKind,
) -> Result<Vec<Task>, LoadError> {
    match destinations {
        None => Ok(commands
            .into_iter()
            .map(|command| Task::new(command, kind))
            .collect()),
        Some(destinations) => {
            if destinations.len() != commands.len() {
                return Err(LoadError::LengthMismatch {
                    commands: commands.len(),
                    destinations: destinations.len(),
                });
            }
            Ok(commands
                .into_iter()
                .zip(destinations)
                .map(|(command, destination)| Task::new(command, kind).with_destination(destination))
                .collect())
        }
    }
}

pub fn read_manifest(reader: impl Read) -> Result<Vec<Task>, LoadError> {
    Ok(serde_json::from_reader(reader)?)
}

pub fn read_manifest_from(path: &Path) -> Result<Vec<Task>, LoadError> {
    let file = File::open(path).map_err(|source| LoadError::Read {
        what: path.display().to_string(),
        source,
    })?;
    read_manifest(BufReader::new(file))
}

/// Creates the parent directory of every destination, so results can be
/// persisted as soon as they arrive.
pub fn prepare_destinations(tasks: &[Task]) -> Result<(), LoadError> {
    for parent in tasks
        .iter()
        .filter_map(Task::destination)
        .filter_map(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
    {
        if !parent.is_dir() {
            debug!(path = %parent.display(), "creating result directory");
            fs::create_dir_all(parent).map_err(|source| LoadError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }
    Ok(())
}
