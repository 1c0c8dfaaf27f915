//! GUID → relative-path index over an extracted EBX tree. Built
//! incrementally during extraction (fast header sniffs), persisted next
//! to the dump, and consulted whenever a cross-file link resolves.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::FrostpackError;
use crate::fsutil;
use crate::guid::Guid;

use super::{read_file_guid, Dbx};

/// Logical EBX name for a file: its path relative to the extraction
/// root, extension stripped, separators normalized to forward slashes.
pub fn relative_name(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?.with_extension("");
    let mut name = String::new();
    for component in rel.components() {
        if !name.is_empty() {
            name.push('/');
        }
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(name)
}

#[derive(Debug, Default)]
pub struct GuidTable {
    entries: HashMap<Guid, String>,
}

impl GuidTable {
    pub fn get(&self, guid: &Guid) -> Option<&str> {
        self.entries.get(guid).map(String::as_str)
    }

    pub fn insert(&mut self, guid: Guid, name: String) {
        self.entries.insert(guid, name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fast mode: register one file by sniffing the header GUID at its
    /// fixed offset. Returns `false` for files that are not EBX.
    pub fn insert_file(&mut self, path: &Path, root: &Path) -> Result<bool, FrostpackError> {
        let Some(guid) = read_file_guid(path)? else {
            return Ok(false);
        };
        let Some(name) = relative_name(path, root) else {
            return Ok(false);
        };
        self.entries.insert(guid, name);
        Ok(true)
    }

    /// Fast scan over a whole tree.
    pub fn scan_fast(&mut self, input_dir: &Path, root: &Path) -> Result<(), FrostpackError> {
        for entry in WalkDir::new(input_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                FrostpackError::Custom(format!(
                    "Couldn't walk '{}': {e}",
                    input_dir.display()
                ))
            })?;
            if entry.file_type().is_file() {
                self.insert_file(entry.path(), root)?;
            }
        }
        Ok(())
    }

    /// Full scan: parse every EBX so the logical name comes from the
    /// primary instance's `Name` field instead of the disk path.
    pub fn scan_full(&mut self, input_dir: &Path, root: &Path) -> Result<(), FrostpackError> {
        for entry in WalkDir::new(input_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                FrostpackError::Custom(format!(
                    "Couldn't walk '{}': {e}",
                    input_dir.display()
                ))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if read_file_guid(entry.path())?.is_none() {
                continue;
            }
            let Some(logical) = relative_name(entry.path(), root) else {
                continue;
            };
            let dbx = Dbx::read_file(entry.path(), &logical)?;
            self.entries.insert(dbx.file_guid, dbx.true_filename);
        }
        Ok(())
    }

    /// Persist as one `<guid> <path>` pair per line, sorted for stable
    /// output. This is the one artifact a re-run may rewrite.
    pub fn save(&self, path: &Path) -> Result<(), FrostpackError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(fsutil::long_path(parent))
                .map_err(|e| FrostpackError::Io("Couldn't create output dirs".into(), e))?;
        }
        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|(guid, name)| format!("{} {name}\n", guid.full_format()))
            .collect();
        lines.sort();
        std::fs::write(fsutil::long_path(path), lines.concat())
            .map_err(|e| FrostpackError::Io("Couldn't write GUID table".into(), e))
    }

    pub fn load(path: &Path) -> Result<GuidTable, FrostpackError> {
        let f = fsutil::open_input(path)?;
        let mut entries = HashMap::new();
        for line in BufReader::new(f).lines() {
            let line =
                line.map_err(|e| FrostpackError::Io("Couldn't read GUID table".into(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let Some((guid, name)) = line.split_once(' ') else {
                return Err(FrostpackError::Custom(format!(
                    "Malformed GUID table line in '{}': {line}",
                    path.display()
                )));
            };
            let guid: Guid = guid.parse().map_err(FrostpackError::Custom)?;
            entries.insert(guid, name.to_string());
        }
        Ok(GuidTable { entries })
    }
}

/// The conventional table location inside a dump tree.
pub fn table_path(target_dir: &Path) -> PathBuf {
    target_dir.join("guidtable.txt")
}
