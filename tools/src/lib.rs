//! # BGM Tools
//!
//! The [Paper Mario](https://en.wikipedia.org/wiki/Paper_Mario_(video_game)) soundtrack ships as BGM sequence files, a compact binary format the game's audio engine plays back straight from ROM. Anyone editing that soundtrack needs the files in a form a text editor can handle, and needs the result to come back byte for byte.
//!
//! This crate provides a command-line utility that does exactly that: dump sequences to JSON, build them back into sequence files, print overviews and compare a rebuilt file against its reference. Decode diagnostics from the underlying [bgm] crate are switched on through the standard `RUST_LOG` environment variable.
//!
//! ## Dump
//!
//! ```console
//! Dump sequence files to their editable JSON form
//!
//! Usage: bgm-tools dump [OPTIONS] [PATHS]...
//!
//! Arguments:
//!   [PATHS]...  The sequence file(s) or folder(s) to dump
//!
//! Options:
//!   -o, --output <OUTPUT>  The destination folder for the dumps
//!   -r, --recursive        Search the paths recursively
//!   -h, --help             Print help
//!   -V, --version          Print version
//! ```
//!
//! ### Example
//!
//! ```console
//! $ bgm-tools dump songs/toad_town.bgm
//! songs/toad_town.bgm => songs/toad_town.json
//! ```
//!
//! ## Build
//!
//! ```console
//! Build sequence files back from their JSON form
//!
//! Usage: bgm-tools build [OPTIONS] [PATHS]...
//!
//! Arguments:
//!   [PATHS]...  The JSON file(s) or folder(s) to build
//!
//! Options:
//!   -o, --output <OUTPUT>  The destination folder for the built sequences
//!   -r, --recursive        Search the paths recursively
//!   -h, --help             Print help
//!   -V, --version          Print version
//! ```
//!
//! ### Example
//!
//! ```console
//! $ bgm-tools build songs/toad_town.json -o out
//! songs/toad_town.json => out/toad_town.bgm
//! ```
//!
//! ## Inspect
//!
//! ```console
//! Print an overview of sequence files
//!
//! Usage: bgm-tools inspect [OPTIONS] [PATHS]...
//!
//! Arguments:
//!   [PATHS]...  The sequence file(s) or folder(s) to inspect
//!
//! Options:
//!   -r, --recursive  Search the paths recursively
//!   -g, --regions    Print the file regions each song claims
//!   -h, --help       Print help
//!   -V, --version    Print version
//! ```
//!
//! ### Example
//!
//! ```console
//! $ bgm-tools inspect songs -r
//! battle.bgm                      BTL1 (48 ticks/beat)
//! 3632 bytes | 2 variations | 14 phrases | 12 drums | 8 instruments
//!
//! toad_town.bgm                   TOWN (48 ticks/beat)
//! 5168 bytes | 1 variations | 21 phrases | 10 drums | 11 instruments
//! ```
//!
//! With `--regions` every claimed span of the file is listed, which makes quick
//! work of finding data the decoder did not account for:
//!
//! ```console
//! $ bgm-tools inspect -g victory.bgm
//! victory.bgm                     JING (48 ticks/beat)
//! 352 bytes | 1 variations | 2 phrases | 0 drums | 3 instruments
//!   0x0000..0x0024  header
//!   0x0024..0x003c  instrument presets
//!   0x003c..0x0050  composition 0
//!   0x0050..0x0090  phrase table 0x50
//!   0x0090..0x00c4  track stream 0x90
//!   0x00c4..0x00d9  track stream 0xc4
//!   0x00d9..0x00dc  (unclaimed)
//!   0x00dc..0x011c  phrase table 0xdc
//!   0x011c..0x0140  track stream 0x11c
//!   0x0140..0x015a  track stream 0x140
//!   0x015a..0x0160  (unclaimed)
//! ```
//!
//! ## Validate
//!
//! ```console
//! Compare a built sequence file against a reference, byte for byte
//!
//! Usage: bgm-tools validate <BUILT> <REFERENCE>
//!
//! Arguments:
//!   <BUILT>      The built sequence file
//!   <REFERENCE>  The reference file to compare against
//!
//! Options:
//!   -h, --help     Print help
//!   -V, --version  Print version
//! ```
//!
//! ### Example
//!
//! ```console
//! $ bgm-tools validate out/toad_town.bgm ref/toad_town.bgm
//! out/toad_town.bgm matches ref/toad_town.bgm over 5168 bytes
//! ```
//!
//! On a mismatch both files are shown around the first differing byte:
//!
//! ```console
//! $ bgm-tools validate out/battle.bgm ref/battle.bgm
//! First mismatch at 0x0d44
//!     built 0x0d40: 25 30 81 5e 43 30 26 30 81 5e 43 30 00 00 00 00
//! reference 0x0d40: 25 30 81 5e 46 30 26 30 81 5e 46 30 00 00 00 00
//! Error: the files differ
//! ```

pub mod build;
pub mod dump;
pub mod inspect;
pub mod validate;
pub(crate) mod utils;
