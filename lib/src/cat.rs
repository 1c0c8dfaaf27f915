//! The CAS catalog maps SHA-1 digests to byte ranges inside `cas_NN.cas`
//! archive files. Catalog files share the TOC obfuscation layer and open
//! with a 16-byte "nyan" header that carries no information.

use std::collections::HashMap;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use binrw::{binread, BinReaderExt};

use crate::dbo;
use crate::error::FrostpackError;
use crate::guid::Sha1;

const HEADER_LEN: u64 = 16;

/// One fixed 32-byte catalog record. Catalog files are always
/// little-endian.
#[binread]
#[derive(Debug)]
#[br(little)]
struct RawCatEntry {
    sha1: Sha1,
    offset: u32,
    size: u32,
    cas_num: u32,
}

#[derive(Debug, Clone)]
pub struct CatEntry {
    /// Resolved `cas_NN.cas` path next to the catalog file.
    pub path: PathBuf,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Default)]
pub struct Catalog {
    entries: HashMap<Sha1, CatEntry>,
}

impl Catalog {
    /// Read a catalog file into the map. Loading a patched catalog over a
    /// base one lets the patched records win by SHA-1.
    pub fn load(&mut self, cat_path: &Path) -> Result<(), FrostpackError> {
        let mut cat = dbo::un_xor(cat_path)?;
        let cat_size = cat.get_ref().len() as u64;
        cat.seek(SeekFrom::Start(HEADER_LEN))
            .map_err(|e| FrostpackError::Io("Couldn't skip catalog header".into(), e))?;
        let cas_directory = cat_path.parent().unwrap_or_else(|| Path::new(""));

        while cat.stream_position().unwrap_or(cat_size) != cat_size {
            let raw: RawCatEntry = cat.read_le().map_err(|e| {
                FrostpackError::BinRW(
                    format!("Couldn't read catalog entry in '{}'", cat_path.display()),
                    e,
                )
            })?;
            self.entries.insert(
                raw.sha1,
                CatEntry {
                    path: cas_directory.join(format!("cas_{:02}.cas", raw.cas_num)),
                    offset: raw.offset,
                    size: raw.size,
                },
            );
        }
        Ok(())
    }

    pub fn lookup(&self, sha1: &Sha1) -> Result<&CatEntry, FrostpackError> {
        self.entries
            .get(sha1)
            .ok_or(FrostpackError::MissingCatalogEntry(*sha1))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
