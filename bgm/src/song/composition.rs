//! The four composition slots that arrange phrases into a song
//!
//! A composition is a run of 32-bit words, type-tagged in the top nibble
//! and terminated by a zero word. Play words store the target phrase table
//! as a word offset relative to the composition start; loops nest through
//! numbered registers.

use super::{Decoder, Encoder, FromBytesError, Patch, PendingPlay};
use crate::error::FormatError;
use serde::{Deserialize, Serialize};

const KIND_END: u32 = 0;
const KIND_PLAY: u32 = 1;
const KIND_START_LOOP: u32 = 3;
const KIND_END_LOOP: u32 = 5;

/// One of the four playback variations of a song
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Composition {
    /// Whether the slot is present in the file
    pub enabled: bool,

    /// The arrangement in playback order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CompositionCommand>,

    #[serde(skip)]
    pub(crate) file_pos: u32,
}

/// A single arrangement word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositionCommand {
    /// Play a phrase through, identified by its serial id
    Play { phrase: u32 },

    /// Open loop register `index`
    StartLoop { index: u8 },

    /// Jump back to the matching [`CompositionCommand::StartLoop`] `count`
    /// times; a count of zero repeats forever
    EndLoop { index: u8, count: u8 },
}

impl Composition {
    /// Decode the word run at `offset`, pulling in every phrase it plays
    pub(crate) fn read(
        decoder: &mut Decoder,
        index: usize,
        offset: u32,
    ) -> Result<Self, FromBytesError> {
        decoder.reader.set_position(offset);
        let mut commands = Vec::new();

        loop {
            let word_pos = decoder.reader.position();
            let word = decoder.reader.read_u32()?;
            let kind = word >> 28;
            let data = word & 0x0FFF_FFFF;
            match kind {
                KIND_END => break,
                KIND_PLAY => {
                    // phrase tables are addressed in words, relative to us
                    let target = offset + data * 4;
                    decoder.phrase_at(target)?;
                    decoder.pending_plays.push(PendingPlay {
                        composition: index,
                        command: commands.len(),
                        offset: target,
                    });
                    commands.push(CompositionCommand::Play { phrase: 0 });
                }
                KIND_START_LOOP => commands.push(CompositionCommand::StartLoop {
                    index: (data & 0x1F) as u8,
                }),
                KIND_END_LOOP => commands.push(CompositionCommand::EndLoop {
                    index: (data & 0x1F) as u8,
                    count: ((data >> 5) & 0x7F) as u8,
                }),
                kind => {
                    return Err(FormatError::UnknownCompositionCommand {
                        kind: kind as u8,
                        offset: word_pos,
                    }
                    .into());
                }
            }
        }

        let end = decoder.reader.position();
        decoder.claim(offset, end, format!("composition {index}"));

        Ok(Self {
            enabled: true,
            commands,
            file_pos: offset,
        })
    }

    /// Emit the word run, leaving play words for the patch pass
    pub(crate) fn write(&mut self, encoder: &mut Encoder, slot: usize) {
        if !self.enabled {
            self.file_pos = 0;
            return;
        }

        let Encoder { writer, patches } = encoder;
        self.file_pos = writer.position();
        for command in &self.commands {
            match *command {
                CompositionCommand::Play { phrase } => {
                    patches.push(Patch::Play {
                        at: writer.position(),
                        composition: slot,
                        serial: phrase,
                    });
                    writer.write_u32(0);
                }
                CompositionCommand::StartLoop { index } => {
                    writer.write_u32(KIND_START_LOOP << 28 | (index & 0x1F) as u32);
                }
                CompositionCommand::EndLoop { index, count } => writer.write_u32(
                    KIND_END_LOOP << 28 | ((count & 0x7F) as u32) << 5 | (index & 0x1F) as u32,
                ),
            }
        }
        writer.write_u32(KIND_END);
    }
}
