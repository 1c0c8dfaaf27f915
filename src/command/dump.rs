use std::path::PathBuf;

use clap::Args;
use owo_colors::Style;

use frostpack::console::StderrStyle;
use frostpack::dump::DumpContext;
use frostpack::error::FrostpackError;
use frostpack::superbundle::X360Decompressor;

use crate::command::global_args::GlobalArgs;
use crate::command::FbDumpCommand;

/// Extract every TOC under the game's Data and Update trees.
///
/// DLC content is dumped first, then the base game; a patched TOC is
/// always applied before its base TOC so the patched payloads win.
#[derive(Args, Debug)]
pub struct Dump {
    /// The game installation (the directory holding Data/ and Update/).
    game_directory: PathBuf,
    /// Where to write the extracted tree.
    target_directory: PathBuf,
    /// External X360 decompressor program for LZX superbundles.
    #[clap(long, default_value = "xbdecompress")]
    x360_decompressor: PathBuf,
}

impl FbDumpCommand for Dump {
    fn run(self, _global_args: GlobalArgs) -> Result<(), FrostpackError> {
        let data_dir = self.game_directory.join("Data");
        let update_dir = self.game_directory.join("Update");
        let patch_dir = update_dir.join("Patch").join("Data");

        let mut ctx = DumpContext::new(
            &self.game_directory,
            &self.target_directory,
            X360Decompressor::new(self.x360_decompressor),
        )?;

        let cat_path = data_dir.join("cas.cat");
        if cat_path.is_file() {
            log::info!("Reading cat entries...");
            ctx.load_catalog(&cat_path)?;

            let patched_cat = patch_dir.join("cas.cat");
            if patched_cat.is_file() {
                log::info!("Reading patched cat entries...");
                ctx.load_catalog(&patched_cat)?;
            }
        }

        if update_dir.is_dir() {
            // Extract all DLC ahead of the base game.
            let mut dlc_dirs: Vec<PathBuf> = std::fs::read_dir(&update_dir)
                .map_err(|e| FrostpackError::Io("Couldn't list Update dir".into(), e))?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.is_dir() && path.file_name().is_some_and(|name| name != "Patch")
                })
                .collect();
            dlc_dirs.sort();

            for dlc in dlc_dirs {
                log::info!(
                    "Extracting DLC {}...",
                    dlc.file_name()
                        .unwrap_or_default()
                        .to_string_lossy()
                        .stderr_style(Style::new().green())
                );
                ctx.dump_root(&dlc.join("Data"), &patch_dir)?;
            }
        }

        log::info!("Extracting main game...");
        ctx.dump_root(&data_dir, &patch_dir)?;

        log::info!("Writing EBX GUID table...");
        ctx.write_guid_table()?;

        Ok(())
    }
}
