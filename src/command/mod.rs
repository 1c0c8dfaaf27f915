use clap::{Parser, Subcommand};

use frostpack::error::FrostpackError;

use crate::command::global_args::GlobalArgs;

mod assets;
mod dump;
mod global_args;

pub trait FbDumpCommand {
    fn run(self, global_args: GlobalArgs) -> Result<(), FrostpackError>;
}

#[derive(Parser, Debug)]
#[clap(about = "Frostbite 2 game data extractor", version)]
pub struct FbDump {
    #[clap(flatten)]
    pub global_args: GlobalArgs,
    /// Thing to do.
    #[clap(subcommand)]
    pub subcommand: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Dump(dump::Dump),
    Assets(assets::Assets),
}

impl FbDumpCommand for Command {
    fn run(self, global_args: GlobalArgs) -> Result<(), FrostpackError> {
        match self {
            Command::Dump(v) => v.run(global_args),
            Command::Assets(v) => v.run(global_args),
        }
    }
}
