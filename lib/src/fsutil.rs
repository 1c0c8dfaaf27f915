use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::FrostpackError;

/// Longest path the classic Windows APIs accept without escaping.
const LONG_PATH_LIMIT: usize = 247;

const LONG_PATH_PREFIX: &str = r"\\?\";

/// Escape a path to the platform's long-path form when it would otherwise
/// exceed the OS limit. A no-op everywhere but Windows.
pub fn long_path(path: &Path) -> Cow<'_, Path> {
    if cfg!(windows) && needs_escape(path) {
        Cow::Owned(escape_long_path(path))
    } else {
        Cow::Borrowed(path)
    }
}

fn needs_escape(path: &Path) -> bool {
    let raw = path.to_string_lossy();
    !raw.is_empty() && !raw.starts_with(LONG_PATH_PREFIX) && raw.len() > LONG_PATH_LIMIT
}

fn escape_long_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{}", LONG_PATH_PREFIX, path.display()))
}

pub fn exists(path: &Path) -> bool {
    long_path(path).is_file()
}

/// Create parent directories as needed and open `path` for writing.
///
/// Returns `None` when the file already exists: extraction is strictly
/// first-write-wins, so the caller skips the payload.
pub fn create_new_output(path: &Path) -> Result<Option<File>, FrostpackError> {
    let escaped = long_path(path);
    if escaped.is_file() {
        return Ok(None);
    }
    if let Some(parent) = escaped.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| FrostpackError::Io("Couldn't create output dirs".into(), e))?;
    }
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&escaped)
    {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(FrostpackError::Io("Couldn't open output".into(), e)),
    }
}

/// Open an existing file for reading, long-path aware.
pub fn open_input(path: &Path) -> Result<File, FrostpackError> {
    File::open(long_path(path))
        .map_err(|e| FrostpackError::Io(format!("Couldn't open '{}'", path.display()), e))
}

#[cfg(test)]
mod fsutil_tests {
    use std::path::Path;

    use super::{create_new_output, escape_long_path, needs_escape, LONG_PATH_LIMIT};

    #[test]
    fn short_paths_pass_through() {
        assert!(!needs_escape(Path::new("C:/games/out/bundles/ebx/a.ebx")));
    }

    #[test]
    fn long_paths_are_escaped_once() {
        let long = format!("C:/out/{}", "a/".repeat(LONG_PATH_LIMIT));
        let path = Path::new(&long).to_path_buf();
        assert!(needs_escape(&path));

        let escaped = escape_long_path(&path);
        assert!(escaped.to_string_lossy().starts_with(r"\\?\"));
        assert!(!needs_escape(&escaped));
    }

    #[test]
    fn first_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/file.bin");

        let first = create_new_output(&target).unwrap();
        assert!(first.is_some());
        drop(first);

        assert!(create_new_output(&target).unwrap().is_none());
    }
}
