//! File-system helpers for fragment directories
//!
//! Each backend reads its desired state from a directory of fragment files.
//! These helpers give every backend the same view of such a directory:
//!
//! - [`list_file_names`]: regular files, sorted, hidden files skipped
//! - [`is_directory`]: absent paths are `false`, not an error
//! - [`try_read_text_file`]: absent files yield a default
//! - [`write_file_atomic`]: temp file → rename, mode 0600

use std::io::{ErrorKind, Write};
use std::path::Path;

/// Lists the names of regular files in `dir`, in lexicographic order.
///
/// Names starting with `.` (editor swap files, `.keep`) are skipped.
pub fn list_file_names(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(dir = %dir.display(), "Skipping non UTF-8 file name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Returns whether `path` exists and is a directory.
pub fn is_directory(path: &Path) -> std::io::Result<bool> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.is_dir()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads `path` as text, returning `default` if the file does not exist.
pub fn try_read_text_file(path: &Path, default: &str) -> std::io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(default.to_string()),
        Err(e) => Err(e),
    }
}

/// Creates `dir` (and parents) with mode 0700.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    DirBuilder::new().mode(0o700).recursive(true).create(dir)
}

/// Writes `contents` to `path` atomically.
/// 1. Writes to a temporary file in the same directory (created 0600).
/// 2. Flushes it to disk.
/// 3. Atomically renames it over the target path.
pub fn write_file_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
