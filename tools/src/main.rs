use anyhow::Result;
use clap::Parser;

use bgm_tools::build::{build, BuildArgs};
use bgm_tools::dump::{dump, DumpArgs};
use bgm_tools::inspect::{inspect, InspectArgs};
use bgm_tools::validate::{validate, ValidateArgs};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
enum Cli {
    Dump(DumpArgs),
    Build(BuildArgs),
    Inspect(InspectArgs),
    Validate(ValidateArgs),
}

fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse_from(wild::args()) {
        Cli::Dump(args) => dump(&args),
        Cli::Build(args) => build(&args),
        Cli::Inspect(args) => inspect(&args),
        Cli::Validate(args) => validate(&args),
    }
}
