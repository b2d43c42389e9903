//! Persistence of the per-repository session state file.
//!
//! The worker itself never touches the disk; it reports new state over the
//! control channel and receives prior state in the start message. These
//! helpers implement the file format for the parent-side launcher and for
//! round-trip tests.
//!
//! # File format
//!
//! Three newline-terminated lines inside the repository's cache directory:
//!
//! ```text
//! <session_id>
//! <serial>
//! <last-modified HTTP date, possibly empty>
//! ```
//!
//! # Atomic replace
//!
//! The file is replaced in four steps: write to a temp file, fsync it,
//! rename over the old file, fsync the containing directory. A crash at
//! any point leaves either the old or the new state, never a torn one;
//! the final directory fsync is what keeps the rename itself from being
//! lost on power failure.

use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;

use crate::types::RepositoryState;

/// Name of the state file inside a repository's cache directory.
pub const STATE_FILENAME: &str = ".state";

/// Errors from loading or storing a state file.
#[derive(Debug, Error)]
pub enum StateError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The file did not have the expected three-line shape.
    #[error("malformed state file: {reason}")]
    Malformed { reason: &'static str },

    /// Only the state of a completed sync can be stored.
    #[error("refusing to store empty repository state")]
    Empty,
}

/// Result type for state-file operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Loads the state file at `path`.
///
/// A missing file is not an error: it yields the default (empty) state,
/// which makes the next sync bootstrap from a snapshot.
pub fn load(path: &Path) -> Result<RepositoryState> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(RepositoryState::default());
        }
        Err(e) => return Err(e.into()),
    };

    let mut lines = text.lines();
    let session_id = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or(StateError::Malformed {
            reason: "missing session id",
        })?
        .to_owned();
    let serial = lines
        .next()
        .and_then(|line| line.parse::<u64>().ok())
        .filter(|serial| *serial > 0)
        .ok_or(StateError::Malformed {
            reason: "missing or invalid serial",
        })?;
    let last_modified = match lines.next() {
        None | Some("") => None,
        Some(line) => Some(line.to_owned()),
    };
    if lines.next().is_some() {
        return Err(StateError::Malformed {
            reason: "trailing content",
        });
    }

    Ok(RepositoryState {
        session_id,
        serial,
        last_modified,
    })
}

/// Stores `state` at `path`, replacing any previous file atomically.
pub fn store(path: &Path, state: &RepositoryState) -> Result<()> {
    if state.is_empty() {
        return Err(StateError::Empty);
    }

    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        write!(
            file,
            "{}\n{}\n{}\n",
            state.session_id,
            state.serial,
            state.last_modified.as_deref().unwrap_or("")
        )?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    // Make the rename itself durable.
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

/// Syncs a directory so its entries are durable.
///
/// Without this, a renamed file might revert to its old name after a
/// power loss even though its contents were synced.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dir = std::fs::OpenOptions::new().read(true).open(dir)?;
    dir.sync_all()
}
