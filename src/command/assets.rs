use std::path::PathBuf;

use clap::Args;
use owo_colors::Style;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use walkdir::WalkDir;

use frostpack::assets::{AssetDirs, AssetDriver, AssetDriverImpl};
use frostpack::console::StderrStyle;
use frostpack::ebx::guid_table::{self, relative_name, GuidTable};
use frostpack::ebx::EbxEnvironment;
use frostpack::error::FrostpackError;

use crate::command::global_args::GlobalArgs;
use crate::command::FbDumpCommand;

/// Re-parse extracted EBX files and assemble sound/movie assets from
/// the chunk and RES stores of a dump tree.
#[derive(Args, Debug)]
pub struct Assets {
    /// A dump tree produced by the `dump` command.
    dump_directory: PathBuf,
    /// Where to write assembled assets.
    target_directory: PathBuf,
    /// Asset drivers to run.
    #[clap(short, long, required(true))]
    driver: Vec<AssetDriverImpl>,
}

impl FbDumpCommand for Assets {
    fn run(self, _global_args: GlobalArgs) -> Result<(), FrostpackError> {
        let bundles = self.dump_directory.join("bundles");
        let ebx_root = bundles.join("ebx");
        if !ebx_root.is_dir() {
            log::warn!("No extracted EBX under '{}'", ebx_root.display());
            return Ok(());
        }

        // Prefer the table written by the dump; fall back to a scan.
        let table_file = guid_table::table_path(&self.dump_directory);
        let table = if table_file.is_file() {
            GuidTable::load(&table_file)?
        } else {
            let mut table = GuidTable::default();
            table.scan_fast(&ebx_root, &ebx_root)?;
            table
        };

        let env = EbxEnvironment::new(ebx_root.clone(), table);
        let dirs = AssetDirs {
            chunk_dir: bundles.join("chunks"),
            chunk_dir_overlay: self.dump_directory.join("chunks"),
            res_dir: bundles.join("res"),
            output_dir: self.target_directory,
        };
        let drivers: Vec<Box<dyn AssetDriver>> = self
            .driver
            .into_iter()
            .map(AssetDriverImpl::into_boxed_driver)
            .collect();

        let mut files = Vec::new();
        for entry in WalkDir::new(&ebx_root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                FrostpackError::Custom(format!("Couldn't walk '{}': {e}", ebx_root.display()))
            })?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        files
            .into_par_iter()
            .try_for_each(|path| -> Result<(), FrostpackError> {
                let Some(logical) = relative_name(&path, &ebx_root) else {
                    return Ok(());
                };
                let dbx = match env.open(&path, &logical) {
                    Ok(dbx) => dbx,
                    Err(e) => {
                        log::warn!(
                            "Couldn't parse {}: {:#?}",
                            logical.stderr_style(Style::new().green()),
                            e
                        );
                        return Ok(());
                    }
                };
                if let Err(e) = frostpack::assets::extract_assets(&dbx, &env, &dirs, &drivers) {
                    log::warn!(
                        "Failed to extract {}: {:#?}",
                        dbx.true_filename.stderr_style(Style::new().green()),
                        e
                    );
                }
                Ok(())
            })?;

        Ok(())
    }
}
