//! Atomic JSON file helpers.
//!
//! Every durable file the agent owns (`session.json`, `unsynced.json`,
//! `unsynced_app_logs.json`) is rewritten whole. Writes go to a sibling
//! temporary file that is flushed and renamed over the target, so a crash
//! leaves either the previous or the new contents on disk, never a torn file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes `value` as pretty JSON and atomically replaces `path` with it.
///
/// Parent directories are created when missing.
///
/// # Errors
///
/// Returns an I/O error if serialization, the temporary write, or the rename fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// Reads and deserializes a JSON file.
///
/// Returns `Ok(None)` when the file does not exist.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be read, or an
/// [`io::ErrorKind::InvalidData`] error if its contents are not valid JSON
/// for `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Removes `path`, treating a missing file as success.
///
/// # Errors
///
/// Returns any I/O error other than [`io::ErrorKind::NotFound`].
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
