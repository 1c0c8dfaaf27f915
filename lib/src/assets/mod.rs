//! Drivers that reinterpret decoded EBX descriptors into standalone
//! asset files, walking the extracted chunk and RES stores.

use std::path::{Path, PathBuf};

use strum::EnumString;

use crate::ebx::{Dbx, EbxEnvironment};
use crate::error::FrostpackError;
use crate::fsutil;
use crate::guid::Guid;

pub mod movie;
pub mod sound;

/// Where a driver looks for extracted inputs and writes its outputs.
#[derive(Debug, Clone)]
pub struct AssetDirs {
    /// Bundle-level chunk store.
    pub chunk_dir: PathBuf,
    /// TOC-level chunk store, searched after the primary.
    pub chunk_dir_overlay: PathBuf,
    pub res_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl AssetDirs {
    /// Find a chunk file by GUID, primary directory first. A miss is
    /// logged and yields `None`; drivers carry on without the chunk.
    pub fn find_chunk(&self, id: &Guid) -> Option<PathBuf> {
        if id.is_null() {
            return None;
        }
        let file_name = format!("{}.chunk", id.format());
        for dir in [&self.chunk_dir, &self.chunk_dir_overlay] {
            let path = dir.join(&file_name);
            if fsutil::exists(&path) {
                return Some(path);
            }
        }
        log::warn!("Chunk does not exist: {}", id.format());
        None
    }

    /// Find the RES file matching an asset's logical name.
    pub fn find_res(&self, true_filename: &str) -> Option<PathBuf> {
        let path = self
            .res_dir
            .join(format!("{}.res", true_filename.to_lowercase()));
        if fsutil::exists(&path) {
            return Some(path);
        }
        log::warn!("Res does not exist: {true_filename}");
        None
    }
}

pub trait AssetDriver: Send + Sync {
    /// Does this driver handle assets whose primary instance is named
    /// `primary_name`?
    fn wants(&self, primary_name: &str) -> bool;

    fn extract(
        &self,
        dbx: &Dbx,
        env: &EbxEnvironment,
        dirs: &AssetDirs,
    ) -> Result<(), FrostpackError>;
}

#[derive(EnumString, Copy, Clone, Debug)]
#[strum(serialize_all = "snake_case")]
pub enum AssetDriverImpl {
    Sound,
    Movie,
}

impl AssetDriverImpl {
    pub fn into_boxed_driver(self) -> Box<dyn AssetDriver> {
        match self {
            Self::Sound => Box::new(sound::SoundWaveDriver),
            Self::Movie => Box::new(movie::MovieTextureDriver),
        }
    }
}

/// Run every interested driver against one decoded EBX.
pub fn extract_assets(
    dbx: &Dbx,
    env: &EbxEnvironment,
    dirs: &AssetDirs,
    drivers: &[Box<dyn AssetDriver>],
) -> Result<(), FrostpackError> {
    let Some(primary) = dbx.primary_instance() else {
        return Ok(());
    };
    let primary_name = primary.complex.name.clone();
    for driver in drivers {
        if driver.wants(&primary_name) {
            driver.extract(dbx, env, dirs)?;
        }
    }
    Ok(())
}

/// Copy a found source file verbatim, first-write-wins.
pub(crate) fn copy_verbatim(source: &Path, target: &Path) -> Result<(), FrostpackError> {
    let Some(mut out) = fsutil::create_new_output(target)? else {
        return Ok(());
    };
    let mut input = fsutil::open_input(source)?;
    std::io::copy(&mut input, &mut out)
        .map_err(|e| FrostpackError::Io("Couldn't copy asset source".into(), e))?;
    Ok(())
}
