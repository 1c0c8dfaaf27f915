//! Video assembly. A `MovieTextureAsset` stores its stream either in a
//! chunk (named by `ChunkGuid`) or, when that GUID is null, in the RES
//! file matching the asset's logical name. Either way the source is
//! copied verbatim.

use crate::ebx::{Dbx, EbxEnvironment};
use crate::error::FrostpackError;

use super::{copy_verbatim, AssetDirs, AssetDriver};

pub struct MovieTextureDriver;

impl AssetDriver for MovieTextureDriver {
    fn wants(&self, primary_name: &str) -> bool {
        primary_name == "MovieTextureAsset"
    }

    fn extract(
        &self,
        dbx: &Dbx,
        _env: &EbxEnvironment,
        dirs: &AssetDirs,
    ) -> Result<(), FrostpackError> {
        log::info!("{}", dbx.true_filename);
        let Some(primary) = dbx.primary_instance() else {
            return Ok(());
        };

        let chunk_guid = primary
            .complex
            .get_field("ChunkGuid")
            .map_err(|e| e.add_context(format!("In '{}'", dbx.true_filename)))?
            .value
            .as_guid()
            .ok_or_else(|| {
                FrostpackError::Custom(format!(
                    "Field 'ChunkGuid' is not a GUID in '{}'",
                    dbx.true_filename
                ))
            })?;

        let source = if chunk_guid.is_null() {
            dirs.find_res(&dbx.true_filename)
        } else {
            dirs.find_chunk(&chunk_guid)
        };
        // A missing source is logged by the lookup; skip the asset.
        let Some(source) = source else {
            return Ok(());
        };

        let target = dirs.output_dir.join(format!("{}.vp6", dbx.true_filename));
        copy_verbatim(&source, &target)
    }
}
