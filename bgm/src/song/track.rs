//! Tracks and the packed table words that describe them
//!
//! Each phrase holds sixteen table words. A zero word is a disabled slot;
//! any other word packs the stream offset relative to the phrase, the
//! polyphony mode, a linked-track index, a low-active flag and the drum
//! bit. The offset is the only field that changes between two structurally
//! identical tracks, which is what the table-level sharing keys on.

use super::command::Command;
use super::stream::CommandStream;
use super::{Encoder, ToBytesError};
use serde::{Deserialize, Serialize};

/// Simultaneous note allowance per polyphony mode
pub const VOICE_COUNTS: [usize; 8] = [0, 1, 0, 0, 0, 2, 3, 4];

/// One of the sixteen track slots of a phrase
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Track {
    /// Whether the slot holds a stream at all
    pub enabled: bool,

    /// Polyphony mode, an index into [`VOICE_COUNTS`]
    #[serde(default = "default_polyphony")]
    pub polyphony: u8,

    /// Index of the track this one is coupled to
    pub linked: u8,

    /// Low-active toggle bit carried through verbatim
    pub flag: bool,

    /// Table-level sharing: this slot replays another track of the same
    /// phrase instead of carrying its own stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_of: Option<usize>,

    /// The track's own command stream
    pub commands: CommandStream,

    /// Detour bodies referenced from the stream, in first-use order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detours: Vec<TrackDetour>,

    /// Branch tables referenced from the stream, in first-use order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<TrackBranch>,
}

/// Authored tracks play one voice unless they say otherwise
fn default_polyphony() -> u8 {
    1
}

/// A subroutine-like stream a track jumps through and returns from
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TrackDetour {
    /// Identity within the owning track, starting at 1
    pub serial: u32,

    /// Where the body sat in the decoded file
    pub file_pos: u32,

    /// The body, stored without a terminator
    pub commands: CommandStream,

    /// The command referencing this body stored length zero, which the
    /// engine reads as 256 bytes without advancing time
    #[serde(skip)]
    pub(crate) bugged: bool,
}

/// A table of same-length alternatives the engine picks from at runtime
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TrackBranch {
    /// Identity within the owning track, starting at 1
    pub serial: u32,

    /// Where the table sat in the decoded file
    pub table_pos: u32,

    /// One stream per option slot; slot 0 is the do-nothing measure
    pub options: Vec<CommandStream>,
}

impl Track {
    /// Split a non-zero table word into the track fields and the stream
    /// offset relative to the phrase start
    pub(crate) fn unpack(word: u32) -> (Self, u32) {
        let track = Self {
            enabled: word != 0,
            polyphony: ((word >> 13) & 7) as u8,
            linked: ((word >> 9) & 0xF) as u8,
            flag: (word >> 8) & 1 == 0,
            ..Default::default()
        };
        (track, (word >> 16) & 0xFFFF)
    }

    /// Pack the table word for this track, given the owning phrase's file
    /// position
    pub(crate) fn track_word(&self, phrase_pos: u32) -> u32 {
        if !self.enabled {
            return 0;
        }
        ((self.commands.file_pos.wrapping_sub(phrase_pos)) & 0xFFFF) << 16
            | ((self.polyphony & 7) as u32) << 13
            | ((self.linked & 0xF) as u32) << 9
            | u32::from(!self.flag) << 8
            | u32::from(self.commands.is_drum) << 7
    }

    /// Whether the stream contains a branch command
    pub(crate) fn has_branch(&self) -> bool {
        self.commands
            .commands
            .iter()
            .any(|command| matches!(command, Command::Branch { .. }))
    }

    /// Emit the primary stream followed by its detour bodies
    pub(crate) fn write(
        &mut self,
        encoder: &mut Encoder,
        phrase: usize,
        track: usize,
    ) -> Result<(), ToBytesError> {
        self.commands.write(encoder, phrase, track, true)?;
        for detour in &mut self.detours {
            detour.commands.write(encoder, phrase, track, false)?;
            detour.file_pos = detour.commands.file_pos;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_word_involution() {
        let word = 0x0040_A680;
        let (mut track, offset) = Track::unpack(word);
        assert!(track.enabled);
        assert_eq!(offset, 0x40);
        assert_eq!(track.polyphony, 5);
        assert_eq!(track.linked, 3);
        assert!(track.flag);

        track.commands.is_drum = true;
        track.commands.file_pos = 0x1040;
        assert_eq!(track.track_word(0x1000), word);

        track.flag = false;
        assert_eq!(track.track_word(0x1000), 0x0040_A780);
    }

    #[test]
    fn disabled_track_word_is_zero() {
        let track = Track::default();
        assert_eq!(track.track_word(0x1000), 0);
    }

    #[test]
    fn authored_tracks_default_to_one_voice() {
        let track: Track = serde_json::from_str(
            r#"{
                "enabled": true,
                "linked": 0,
                "flag": true,
                "commands": { "commands": [], "is_drum": false }
            }"#,
        )
        .expect("track rejected");
        assert_eq!(track.polyphony, 1);
        assert_eq!(VOICE_COUNTS[track.polyphony as usize], 1);
    }
}
