//! Phrases, the patterns compositions sequence
//!
//! A phrase is a 4-aligned table of sixteen packed track words followed by
//! the streams the words point into. Two slots carrying bit-identical words
//! resolve to the same stream bytes, so the decode keeps one stream and
//! marks the later slot as a replay of the earlier one.

use super::stream::{CommandStream, StreamKind};
use super::track::Track;
use super::{Decoder, Encoder, FromBytesError, ToBytesError};
use log::debug;
use serde::{Deserialize, Serialize};

/// A pattern of up to sixteen parallel tracks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phrase {
    /// Identity across the song, starting at 1 in file order
    pub serial: u32,

    /// Where the track table sat in the decoded file
    #[serde(default)]
    pub file_pos: u32,

    /// The sixteen track slots
    pub tracks: [Track; Self::TRACK_COUNT],
}

impl Phrase {
    /// Number of track slots
    pub const TRACK_COUNT: usize = 16;

    /// Byte length of the track table
    pub(crate) const TABLE_LEN: u32 = 0x40;

    /// Decode the table at `offset` and every stream it points into
    pub(crate) fn read(decoder: &mut Decoder, offset: u32) -> Result<Self, FromBytesError> {
        decoder.reader.set_position(offset);
        let mut words = [0u32; Self::TRACK_COUNT];
        for word in &mut words {
            *word = decoder.reader.read_u32()?;
        }
        decoder.claim(
            offset,
            offset + Self::TABLE_LEN,
            format!("phrase table {offset:#x}"),
        );

        let mut tracks: [Track; Self::TRACK_COUNT] = Default::default();
        for (index, word) in words.iter().copied().enumerate() {
            if word == 0 {
                continue;
            }

            if let Some(master) = words[..index].iter().position(|w| *w == word) {
                debug!("phrase at {offset:#x}: track {index} replays track {master}");
                let (mut track, _) = Track::unpack(word);
                track.copy_of = Some(master);
                tracks[index] = track;
                continue;
            }

            let (mut track, relative) = Track::unpack(word);
            let stream_pos = offset + relative;
            let is_drum = (word >> 7) & 1 != 0;
            decoder.reader.set_position(stream_pos);
            let stream =
                CommandStream::read(decoder, &mut track, StreamKind::Track, None, is_drum)?;
            decoder.claim(
                stream_pos,
                stream_pos + stream.file_len,
                format!("track stream {stream_pos:#x}"),
            );
            track.commands = stream;
            tracks[index] = track;
        }

        Ok(Self {
            serial: 0,
            file_pos: offset,
            tracks,
        })
    }

    /// Reserve the track table and emit the streams without a branch
    pub(crate) fn write_streams(
        &mut self,
        encoder: &mut Encoder,
        phrase: usize,
    ) -> Result<(), ToBytesError> {
        encoder.writer.align(4);
        self.file_pos = encoder.writer.position();
        encoder.writer.skip(Self::TABLE_LEN);
        for (index, track) in self.tracks.iter_mut().enumerate() {
            if track.enabled && track.copy_of.is_none() && !track.has_branch() {
                track.write(encoder, phrase, index)?;
            }
        }
        Ok(())
    }

    /// Emit the streams that carry a branch command
    ///
    /// These come after every phrase's plain streams so branch tables can
    /// land in one block near the end of the file.
    pub(crate) fn write_branching_streams(
        &mut self,
        encoder: &mut Encoder,
        phrase: usize,
    ) -> Result<(), ToBytesError> {
        for (index, track) in self.tracks.iter_mut().enumerate() {
            if track.enabled && track.copy_of.is_none() && track.has_branch() {
                track.write(encoder, phrase, index)?;
            }
        }
        Ok(())
    }
}
