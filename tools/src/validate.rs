use anyhow::{bail, Context, Result};
use clap::Args;
use std::{fs, path::PathBuf};

/// Compare a built sequence file against a reference, byte for byte
#[derive(Args)]
#[command(author, version)]
pub struct ValidateArgs {
    /// The built sequence file
    built: PathBuf,

    /// The reference file to compare against
    reference: PathBuf,
}

pub fn validate(args: &ValidateArgs) -> Result<()> {
    let built = fs::read(&args.built).context("Reading the built file failed")?;
    let reference = fs::read(&args.reference).context("Reading the reference file failed")?;

    match first_mismatch(&built, &reference) {
        None => {
            println!(
                "{} matches {} over {} bytes",
                args.built.to_string_lossy(),
                args.reference.to_string_lossy(),
                reference.len()
            );

            Ok(())
        }
        Some(offset) => {
            println!("First mismatch at {offset:#06x}");
            print_window(&built, offset, "built");
            print_window(&reference, offset, "reference");

            bail!("the files differ")
        }
    }
}

fn first_mismatch(built: &[u8], reference: &[u8]) -> Option<usize> {
    let shared = built.len().min(reference.len());

    if let Some(offset) = (0..shared).find(|&index| built[index] != reference[index]) {
        return Some(offset);
    }

    if built.len() == reference.len() {
        return None;
    }

    // A zero tail shorter than one 16-byte alignment block does not count
    let longer = if built.len() > reference.len() {
        built
    } else {
        reference
    };

    let excess = &longer[shared..];
    if excess.len() < 16 && excess.iter().all(|byte| *byte == 0) {
        None
    } else {
        Some(shared)
    }
}

fn print_window(bytes: &[u8], offset: usize, label: &str) {
    let start = (offset & !0xF).min(bytes.len());
    let end = (start + 16).min(bytes.len());

    print!("{label:>9} {start:#06x}:");
    for byte in &bytes[start..end] {
        print!(" {byte:02x}");
    }
    println!();
}
