use crate::utils::{destination, iter_files};
use anyhow::{Context, Result};
use bgm::Song;
use clap::Args;
use std::{fs, path::PathBuf};

/// Build sequence files back from their JSON form
#[derive(Args)]
#[command(author, version)]
pub struct BuildArgs {
    /// The JSON file(s) or folder(s) to build
    paths: Vec<PathBuf>,

    /// The destination folder for the built sequences
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Search the paths recursively
    #[arg(short, long)]
    recursive: bool,
}

pub fn build(args: &BuildArgs) -> Result<()> {
    for entry in iter_files(&args.paths, args.recursive, &["json"]) {
        let path = entry.path();

        let text = fs::read_to_string(path).context("Reading the JSON file failed")?;
        let mut song = Song::from_text(&text).context("Parsing the song failed")?;

        let destination = destination(path, args.output.as_deref(), "bgm");
        song.to_path(&destination)
            .context("Writing the sequence file failed")?;

        println!(
            "{} => {}",
            path.to_string_lossy(),
            destination.to_string_lossy()
        );
    }

    Ok(())
}
