//! Reading, writing and editing the background music sequences of Paper
//! Mario on the Nintendo 64. Files decode into an editable [`Song`] graph
//! and encode back byte-for-byte; a JSON authored form covers hand editing
//! and diffing. This crate does not play the music, it only works with the
//! sequence data itself.

pub(crate) mod bytes;
pub mod error;
pub mod name;
pub mod presets;
pub mod song;

pub use name::SongName;
pub use song::Song;
