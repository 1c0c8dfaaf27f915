//! Superbundle access. A superbundle is a plain concatenation of bundle
//! payloads indexed by its TOC; X360 images wrap the whole file in LZX
//! compression and need an external decompressor pass before reading.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::FrostpackError;
use crate::fsutil;

/// Leading bytes of an X360-LZX-compressed superbundle.
pub const X360_MAGIC: [u8; 4] = [0x0F, 0xF5, 0x12, 0xED];

/// External X360 decompressor, invoked as `<program> /T /Y <input> <output>`.
/// The exit code is not consumed; a missing or truncated output surfaces
/// as an open error on the result.
#[derive(Debug, Clone)]
pub struct X360Decompressor {
    program: PathBuf,
}

impl X360Decompressor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn decompress(&self, input: &Path, output: &Path) -> Result<(), FrostpackError> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(fsutil::long_path(parent))
                .map_err(|e| FrostpackError::Io("Couldn't create temp dirs".into(), e))?;
        }
        log::debug!(
            "Running {} /T /Y {} {}",
            self.program.display(),
            input.display(),
            output.display()
        );
        Command::new(&self.program)
            .arg("/T")
            .arg("/Y")
            .arg(input)
            .arg(output)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| FrostpackError::Io("Couldn't run X360 decompressor".into(), e))?;
        Ok(())
    }
}

impl Default for X360Decompressor {
    fn default() -> Self {
        Self::new("xbdecompress")
    }
}

/// Open a superbundle, transparently decompressing X360 images into the
/// scratch directory. A decompressed file is recorded in `temp_files` so
/// the caller can delete it once the bundle loop is done.
pub fn open_superbundle(
    sb_path: &Path,
    game_dir: &Path,
    scratch_dir: &Path,
    decompressor: &X360Decompressor,
    temp_files: &mut Vec<PathBuf>,
) -> Result<File, FrostpackError> {
    let mut sb = fsutil::open_input(sb_path)?;
    let mut magic = [0u8; 4];
    let is_x360 = match sb.read_exact(&mut magic) {
        Ok(()) => magic == X360_MAGIC,
        Err(_) => false,
    };
    if !is_x360 {
        sb.seek(SeekFrom::Start(0))
            .map_err(|e| FrostpackError::Io("Couldn't rewind superbundle".into(), e))?;
        return Ok(sb);
    }

    drop(sb);
    let local = sb_path
        .strip_prefix(game_dir)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| PathBuf::from(sb_path.file_name().unwrap_or_default()));
    let decompressed = scratch_dir.join(local);
    decompressor.decompress(sb_path, &decompressed)?;
    temp_files.push(decompressed.clone());
    fsutil::open_input(&decompressed)
}

/// Delete the temp files produced while processing one superbundle.
pub fn clear_temp_files(temp_files: &mut Vec<PathBuf>) {
    for temp in temp_files.drain(..) {
        if let Err(e) = std::fs::remove_file(fsutil::long_path(&temp)) {
            log::warn!("Couldn't remove temp file '{}': {}", temp.display(), e);
        }
    }
}

#[cfg(test)]
mod superbundle_tests {
    use super::*;
    use crate::dbo::build::write_file;

    #[test]
    fn plain_superbundle_is_returned_whole() {
        let dir = tempfile::tempdir().unwrap();
        let sb_path = dir.path().join("Data/win32/game.sb");
        write_file(&sb_path, b"plain bundle bytes");

        let mut temp_files = Vec::new();
        let mut sb = open_superbundle(
            &sb_path,
            dir.path(),
            dir.path(),
            &X360Decompressor::default(),
            &mut temp_files,
        )
        .unwrap();
        let mut content = Vec::new();
        sb.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"plain bundle bytes");
        assert!(temp_files.is_empty());
    }

    #[test]
    fn clearing_temp_files_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp/game.sb");
        write_file(&temp, b"scratch");

        let mut temp_files = vec![temp.clone()];
        clear_temp_files(&mut temp_files);
        assert!(temp_files.is_empty());
        assert!(!temp.exists());
    }
}
