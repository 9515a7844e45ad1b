use crate::utils::iter_files;
use anyhow::{Context, Result};
use bgm::Song;
use clap::Args;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Print an overview of sequence files
#[derive(Args)]
#[command(author, version)]
pub struct InspectArgs {
    /// The sequence file(s) or folder(s) to inspect
    paths: Vec<PathBuf>,

    /// Search the paths recursively
    #[arg(short, long)]
    recursive: bool,

    /// Print the file regions each song claims
    #[arg(short = 'g', long)]
    regions: bool,
}

pub fn inspect(args: &InspectArgs) -> Result<()> {
    let paths: Vec<_> = iter_files(&args.paths, args.recursive, &["bgm"])
        .map(|entry| entry.path().to_owned())
        .collect();

    if let Some((last, rest)) = paths.split_last() {
        for path in rest {
            print(path, args.regions)?;
            println!();
        }

        print(last, args.regions)?;
    }

    Ok(())
}

fn print(path: &Path, regions: bool) -> Result<()> {
    let bytes = fs::read(path).context("Reading the sequence file failed")?;
    let song = Song::from_bytes(&bytes).context("Parsing the sequence failed")?;

    println!(
        "{:<32}{} ({} ticks/beat)",
        path.file_name().unwrap().to_string_lossy(),
        song.name,
        song.ticks_per_beat()
    );

    let variations = song
        .compositions
        .iter()
        .filter(|composition| composition.enabled)
        .count();

    println!(
        "{} bytes | {variations} variations | {} phrases | {} drums | {} instruments",
        bytes.len(),
        song.phrases.len(),
        song.drums.len(),
        song.instruments.len()
    );

    if regions {
        let mut cursor = 0;
        for region in song.regions() {
            if region.start > cursor {
                println!("  {cursor:#06x}..{:#06x}  (unclaimed)", region.start);
            }

            println!(
                "  {:#06x}..{:#06x}  {}",
                region.start, region.end, region.label
            );

            cursor = cursor.max(region.end);
        }

        if cursor < bytes.len() as u32 {
            println!("  {cursor:#06x}..{:#06x}  (unclaimed)", bytes.len());
        }
    }

    Ok(())
}
