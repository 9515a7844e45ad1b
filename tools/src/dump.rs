use crate::utils::{destination, iter_files};
use anyhow::{Context, Result};
use bgm::Song;
use clap::Args;
use std::{fs, path::PathBuf};

/// Dump sequence files to their editable JSON form
#[derive(Args)]
#[command(author, version)]
pub struct DumpArgs {
    /// The sequence file(s) or folder(s) to dump
    paths: Vec<PathBuf>,

    /// The destination folder for the dumps
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Search the paths recursively
    #[arg(short, long)]
    recursive: bool,
}

pub fn dump(args: &DumpArgs) -> Result<()> {
    for entry in iter_files(&args.paths, args.recursive, &["bgm"]) {
        let path = entry.path();

        let song = Song::from_path(path).context("Reading the sequence file failed")?;
        let text = song
            .to_text()
            .context("Converting the song to text failed")?;

        let destination = destination(path, args.output.as_deref(), "json");
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Creating the output directory failed")?;
            }
        }

        fs::write(&destination, text).context("Writing the dump failed")?;

        println!(
            "{} => {}",
            path.to_string_lossy(),
            destination.to_string_lossy()
        );
    }

    Ok(())
}
