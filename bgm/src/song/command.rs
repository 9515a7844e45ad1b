//! The command vocabulary of sequence streams

use serde::{Deserialize, Serialize};

/// A single sequencer command inside a [`CommandStream`](super::CommandStream)
///
/// The engine's opcode space is fixed and exhaustively known, so the whole
/// vocabulary is one closed sum type; matching on it at the codec sites is
/// what guarantees every opcode is handled in both directions.
///
/// Three kinds carry deferred references instead of plain payloads:
/// [`Branch`](Command::Branch) and [`Detour`](Command::Detour) name a
/// side structure of the enclosing track by serial id, and their binary
/// payloads are only patched in once the whole file is laid out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Let time pass before the next command takes effect
    Delay { ticks: u16 },

    /// Sound a note for a fixed number of ticks
    Note { pitch: u8, velocity: u8, length: u16 },

    /// Set the song-wide tempo in beats per minute
    MasterTempo { bpm: u16 },

    /// Set the song-wide volume (7 bits)
    MasterVolume { volume: u8 },

    /// Detune the whole song by signed cents
    MasterDetune { cents: i8 },

    /// Select the effect on the output bus
    BusEffect { effect: u8 },

    /// Ramp the song-wide tempo to a target over a tick duration
    MasterTempoLerp { time: u16, bpm: u16 },

    /// Ramp the song-wide volume to a target over a tick duration
    MasterVolumeLerp { time: u16, volume: u8 },

    /// Set one parameter of the master effect
    MasterEffect { index: u8, value: u8 },

    /// Force a bank/patch pair regardless of the current instrument
    OverridePatch { bank: u8, patch: u8 },

    /// Set the current instrument's volume (7 bits)
    InstrumentVolume { volume: u8 },

    /// Set the current instrument's pan position (7 bits)
    InstrumentPan { pan: u8 },

    /// Set the current instrument's reverb send (7 bits)
    InstrumentReverb { reverb: u8 },

    /// Set the owning track's volume (7 bits)
    TrackVolume { volume: u8 },

    /// Tune the current instrument by signed semitones
    InstrumentCoarseTune { semitones: i8 },

    /// Tune the current instrument by signed cents
    InstrumentFineTune { cents: i8 },

    /// Detune the owning track by a signed 16-bit amount
    TrackDetune { cents: i16 },

    /// Start a tremolo with onset delay, speed and depth
    TrackTremolo { delay: u8, speed: u8, depth: u8 },

    /// Change the speed of the running tremolo
    TrackTremoloRate { rate: u8 },

    /// Change the depth of the running tremolo
    TrackTremoloDepth { depth: u8 },

    /// Stop the running tremolo
    TrackTremoloStop,

    /// Re-randomize pan between two positions per note
    RandomPan { pan1: u8, pan2: u8 },

    /// Switch the track to an instrument, from the song's own preset list or
    /// the global bank
    UseInstrument { index: u8, global: bool },

    /// Ramp the current instrument's volume to a target over a tick duration
    InstrumentVolumeLerp { time: u16, volume: u8 },

    /// Select the reverb algorithm
    ReverbType { index: u8 },

    /// Jump through the branch table with the given serial id on the
    /// enclosing track
    Branch { serial: u32 },

    /// Raise a 24-bit event the game scripting side can wait on
    EventTrigger { info: u32 },

    /// Play the detour with the given serial id on the enclosing track, then
    /// continue
    Detour { serial: u32 },

    /// Configure one side of the stereo delay effect
    StereoDelay { index: u8, time: u8, side: u8 },

    /// Move the custom envelope cursor
    SeekCustomEnvelope { index: u8 },

    /// Append a value at the custom envelope cursor
    WriteCustomEnvelope { value: u16 },

    /// Attach a custom envelope to the track
    UseCustomEnvelope { index: u8 },

    /// Fire a one-shot sound effect
    TriggerSound { index: u8 },

    /// Override the proximity mix with a fixed volume pair
    ProxMixOverride { vol1: u8, vol2: u8 },
}
