use clap::Parser;
use env_logger::Env;

use frostpack::error::FrostpackError;

use crate::command::{FbDump, FbDumpCommand};

mod command;

fn main() -> Result<(), FrostpackError> {
    let args = FbDump::parse();

    let default_level = match args.global_args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    args.subcommand.run(args.global_args)
}
