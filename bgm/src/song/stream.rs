//! Timed command streams and their byte-level codec
//!
//! Streams are flat opcode runs. Track and branch streams end at a `0x00`
//! terminator; detour bodies are unterminated and stop at the byte length
//! their referencing command carries. Delays and note lengths share one
//! continuation idiom: values below a threshold fit in a single byte, values
//! at or above it spill into a second byte and are offset-adjusted, so both
//! directions must apply the exact same split or every later timestamp in
//! the stream silently shifts.

use super::command::Command;
use super::track::{Track, TrackBranch, TrackDetour, VOICE_COUNTS};
use super::{Decoder, Encoder, FromBytesError, Patch, Song, ToBytesError};
use crate::bytes::{Reader, Writer};
use crate::error::{FormatError, OutOfBoundsError, StructuralError};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

const OP_TERMINATOR: u8 = 0x00;
const OP_NOTE: u8 = 0x80;
const OP_MASTER_TEMPO: u8 = 0xE0;
const OP_MASTER_VOLUME: u8 = 0xE1;
const OP_MASTER_DETUNE: u8 = 0xE2;
const OP_BUS_EFFECT: u8 = 0xE3;
const OP_MASTER_TEMPO_LERP: u8 = 0xE4;
const OP_MASTER_VOLUME_LERP: u8 = 0xE5;
const OP_MASTER_EFFECT: u8 = 0xE6;
const OP_OVERRIDE_PATCH: u8 = 0xE8;
const OP_INSTRUMENT_VOLUME: u8 = 0xE9;
const OP_INSTRUMENT_PAN: u8 = 0xEA;
const OP_INSTRUMENT_REVERB: u8 = 0xEB;
const OP_TRACK_VOLUME: u8 = 0xEC;
const OP_INSTRUMENT_COARSE_TUNE: u8 = 0xED;
const OP_INSTRUMENT_FINE_TUNE: u8 = 0xEE;
const OP_TRACK_DETUNE: u8 = 0xEF;
const OP_TRACK_TREMOLO: u8 = 0xF0;
const OP_TRACK_TREMOLO_RATE: u8 = 0xF1;
const OP_TRACK_TREMOLO_DEPTH: u8 = 0xF2;
const OP_TRACK_TREMOLO_STOP: u8 = 0xF3;
const OP_RANDOM_PAN: u8 = 0xF4;
const OP_USE_INSTRUMENT: u8 = 0xF5;
const OP_INSTRUMENT_VOLUME_LERP: u8 = 0xF6;
const OP_REVERB_TYPE: u8 = 0xF7;
const OP_BRANCH: u8 = 0xFC;
const OP_EVENT_TRIGGER: u8 = 0xFD;
const OP_DETOUR: u8 = 0xFE;
const OP_EXTENDED: u8 = 0xFF;

const SUB_STEREO_DELAY: u8 = 0x01;
const SUB_SEEK_CUSTOM_ENVELOPE: u8 = 0x02;
const SUB_WRITE_CUSTOM_ENVELOPE: u8 = 0x03;
const SUB_USE_CUSTOM_ENVELOPE: u8 = 0x04;
const SUB_TRIGGER_SOUND: u8 = 0x05;
const SUB_PROX_MIX_OVERRIDE: u8 = 0x06;

/// The longest delay a single command can encode
pub(crate) const MAX_DELAY_TICKS: u16 = 0x877;

/// The longest note length the two-byte form can encode
pub(crate) const MAX_NOTE_LENGTH: u16 = 0x40BF;

/// Pitches above this collide with the control opcode range
const MAX_PITCH: u8 = 0x53;

/// What a stream is read as, deciding terminator handling and which
/// commands are legal inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Track,
    Branch,
    Detour,
}

/// A timed run of commands, stored as one contiguous byte stream
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CommandStream {
    /// The commands in playback order
    pub commands: Vec<Command>,

    /// Whether the stream addresses the drum sampler instead of a melodic
    /// instrument
    pub is_drum: bool,

    /// Total ticks the stream takes to play, derived from its commands
    #[serde(skip)]
    pub duration: u32,

    #[serde(skip)]
    pub(crate) file_pos: u32,

    #[serde(skip)]
    pub(crate) file_len: u32,
}

impl CommandStream {
    /// Decode a stream at the reader's current position
    ///
    /// `limit` carries the external byte length of a detour body; streams
    /// without a limit run to their `0x00` terminator. Branch and detour
    /// commands may only appear in [`StreamKind::Track`] streams and pull
    /// their side structures in through `track`.
    pub(crate) fn read(
        decoder: &mut Decoder,
        track: &mut Track,
        kind: StreamKind,
        limit: Option<u32>,
        is_drum: bool,
    ) -> Result<Self, FromBytesError> {
        let start = decoder.reader.position();
        let voices = VOICE_COUNTS[(track.polyphony & 7) as usize];
        let mut commands = Vec::new();
        let mut time = 0u32;
        let mut onset_time = 0u32;
        let mut onsets = 0usize;

        loop {
            if let Some(limit) = limit {
                if decoder.reader.position() - start >= limit {
                    break;
                }
            }

            let offset = decoder.reader.position();
            let opcode = decoder.reader.read_u8()?;
            match opcode {
                OP_TERMINATOR => break,
                0x01..=0x7F => {
                    let ticks = read_delay(&mut decoder.reader, opcode)?;
                    time += ticks as u32;
                    commands.push(Command::Delay { ticks });
                }
                0x80..=0xD3 => {
                    let pitch = opcode & 0x7F;
                    let velocity = decoder.reader.read_u8()?;
                    let length = read_note_length(&mut decoder.reader)?;
                    // the engine only budgets voices per onset tick
                    if onsets == 0 || time != onset_time {
                        onset_time = time;
                        onsets = 1;
                    } else {
                        onsets += 1;
                    }
                    if onsets > voices {
                        warn!(
                            "stream at {start:#x}: {onsets} notes start on tick {onset_time} against the {voices} voice allowance"
                        );
                    }
                    commands.push(Command::Note {
                        pitch,
                        velocity,
                        length,
                    });
                }
                OP_MASTER_TEMPO => commands.push(Command::MasterTempo {
                    bpm: decoder.reader.read_u16()?,
                }),
                OP_MASTER_VOLUME => commands.push(Command::MasterVolume {
                    volume: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_MASTER_DETUNE => commands.push(Command::MasterDetune {
                    cents: decoder.reader.read_i8()?,
                }),
                OP_BUS_EFFECT => commands.push(Command::BusEffect {
                    effect: decoder.reader.read_u8()?,
                }),
                OP_MASTER_TEMPO_LERP => commands.push(Command::MasterTempoLerp {
                    time: decoder.reader.read_u16()?,
                    bpm: decoder.reader.read_u16()?,
                }),
                OP_MASTER_VOLUME_LERP => commands.push(Command::MasterVolumeLerp {
                    time: decoder.reader.read_u16()?,
                    volume: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_MASTER_EFFECT => commands.push(Command::MasterEffect {
                    index: decoder.reader.read_u8()?,
                    value: decoder.reader.read_u8()?,
                }),
                OP_OVERRIDE_PATCH => commands.push(Command::OverridePatch {
                    bank: decoder.reader.read_u8()?,
                    patch: decoder.reader.read_u8()?,
                }),
                OP_INSTRUMENT_VOLUME => commands.push(Command::InstrumentVolume {
                    volume: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_INSTRUMENT_PAN => commands.push(Command::InstrumentPan {
                    pan: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_INSTRUMENT_REVERB => commands.push(Command::InstrumentReverb {
                    reverb: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_TRACK_VOLUME => commands.push(Command::TrackVolume {
                    volume: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_INSTRUMENT_COARSE_TUNE => commands.push(Command::InstrumentCoarseTune {
                    semitones: decoder.reader.read_i8()?,
                }),
                OP_INSTRUMENT_FINE_TUNE => commands.push(Command::InstrumentFineTune {
                    cents: decoder.reader.read_i8()?,
                }),
                OP_TRACK_DETUNE => commands.push(Command::TrackDetune {
                    cents: decoder.reader.read_i16()?,
                }),
                OP_TRACK_TREMOLO => commands.push(Command::TrackTremolo {
                    delay: decoder.reader.read_u8()?,
                    speed: decoder.reader.read_u8()?,
                    depth: decoder.reader.read_u8()?,
                }),
                OP_TRACK_TREMOLO_RATE => commands.push(Command::TrackTremoloRate {
                    rate: decoder.reader.read_u8()?,
                }),
                OP_TRACK_TREMOLO_DEPTH => commands.push(Command::TrackTremoloDepth {
                    depth: decoder.reader.read_u8()?,
                }),
                OP_TRACK_TREMOLO_STOP => commands.push(Command::TrackTremoloStop),
                OP_RANDOM_PAN => commands.push(Command::RandomPan {
                    pan1: decoder.reader.read_u8()? & 0x7F,
                    pan2: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_USE_INSTRUMENT => {
                    let value = decoder.reader.read_u8()?;
                    commands.push(if value >= 0x80 {
                        Command::UseInstrument {
                            index: value - 0x80,
                            global: true,
                        }
                    } else {
                        Command::UseInstrument {
                            index: value,
                            global: false,
                        }
                    });
                }
                OP_INSTRUMENT_VOLUME_LERP => commands.push(Command::InstrumentVolumeLerp {
                    time: decoder.reader.read_u16()?,
                    volume: decoder.reader.read_u8()? & 0x7F,
                }),
                OP_REVERB_TYPE => commands.push(Command::ReverbType {
                    index: decoder.reader.read_u8()?,
                }),
                OP_BRANCH => {
                    if kind != StreamKind::Track {
                        return Err(FormatError::MisplacedBranch { offset }.into());
                    }
                    let serial = read_branch(decoder, track, offset)?;
                    time += decoder.branch_measure;
                    commands.push(Command::Branch { serial });
                }
                OP_EVENT_TRIGGER => commands.push(Command::EventTrigger {
                    info: decoder.reader.read_u32()? & 0x00FF_FFFF,
                }),
                OP_DETOUR => {
                    if kind != StreamKind::Track {
                        return Err(FormatError::MisplacedDetour { offset }.into());
                    }
                    let (serial, advance) = read_detour(decoder, track, is_drum, offset)?;
                    time += advance;
                    commands.push(Command::Detour { serial });
                }
                OP_EXTENDED => {
                    let sub = decoder.reader.read_u8()?;
                    match sub {
                        SUB_STEREO_DELAY => {
                            let index = decoder.reader.read_u8()?;
                            let packed = decoder.reader.read_u8()?;
                            commands.push(Command::StereoDelay {
                                index,
                                time: packed & 0xF,
                                side: ((packed >> 4) & 1) + 1,
                            });
                        }
                        SUB_SEEK_CUSTOM_ENVELOPE => {
                            let index = decoder.reader.read_u8()?;
                            let _ = decoder.reader.read_u8()?;
                            commands.push(Command::SeekCustomEnvelope { index });
                        }
                        SUB_WRITE_CUSTOM_ENVELOPE => commands.push(Command::WriteCustomEnvelope {
                            value: decoder.reader.read_u16()?,
                        }),
                        SUB_USE_CUSTOM_ENVELOPE => {
                            let index = decoder.reader.read_u8()?;
                            let _ = decoder.reader.read_u8()?;
                            commands.push(Command::UseCustomEnvelope { index });
                        }
                        SUB_TRIGGER_SOUND => {
                            let index = decoder.reader.read_u8()?;
                            let _ = decoder.reader.read_u8()?;
                            commands.push(Command::TriggerSound { index });
                        }
                        SUB_PROX_MIX_OVERRIDE => commands.push(Command::ProxMixOverride {
                            vol1: decoder.reader.read_u8()?,
                            vol2: decoder.reader.read_u8()?,
                        }),
                        sub => {
                            return Err(FormatError::UnknownExtendedOpcode { sub, offset }.into());
                        }
                    }
                }
                opcode => return Err(FormatError::UnknownOpcode { opcode, offset }.into()),
            }
        }

        let end = decoder.reader.position();
        if let Some(limit) = limit {
            let read = end - start;
            if read != limit {
                return Err(StructuralError::DetourOverrun {
                    offset: start,
                    limit,
                    read,
                }
                .into());
            }
        }

        trace!(
            "read {kind:?} stream at {start:#x}: {} commands, {time} ticks",
            commands.len()
        );

        Ok(Self {
            commands,
            is_drum,
            duration: time,
            file_pos: start,
            file_len: end - start,
        })
    }

    /// Emit the stream at the writer's current position
    ///
    /// Branch and detour commands write placeholder payloads and record a
    /// patch site; detour bodies are emitted without a terminator since the
    /// referencing command carries their length.
    pub(crate) fn write(
        &mut self,
        encoder: &mut Encoder,
        phrase: usize,
        track: usize,
        terminate: bool,
    ) -> Result<(), ToBytesError> {
        let Encoder { writer, patches } = encoder;
        self.file_pos = writer.position();

        for command in &self.commands {
            match *command {
                Command::Delay { ticks } => write_delay(writer, ticks)?,
                Command::Note {
                    pitch,
                    velocity,
                    length,
                } => {
                    if pitch > MAX_PITCH {
                        return Err(StructuralError::PitchOutOfRange { pitch }.into());
                    }
                    writer.write_u8(OP_NOTE | pitch);
                    writer.write_u8(velocity);
                    write_note_length(writer, length)?;
                }
                Command::MasterTempo { bpm } => {
                    writer.write_u8(OP_MASTER_TEMPO);
                    writer.write_u16(bpm);
                }
                Command::MasterVolume { volume } => {
                    writer.write_u8(OP_MASTER_VOLUME);
                    writer.write_u8(volume & 0x7F);
                }
                Command::MasterDetune { cents } => {
                    writer.write_u8(OP_MASTER_DETUNE);
                    writer.write_i8(cents);
                }
                Command::BusEffect { effect } => {
                    writer.write_u8(OP_BUS_EFFECT);
                    writer.write_u8(effect);
                }
                Command::MasterTempoLerp { time, bpm } => {
                    writer.write_u8(OP_MASTER_TEMPO_LERP);
                    writer.write_u16(time);
                    writer.write_u16(bpm);
                }
                Command::MasterVolumeLerp { time, volume } => {
                    writer.write_u8(OP_MASTER_VOLUME_LERP);
                    writer.write_u16(time);
                    writer.write_u8(volume & 0x7F);
                }
                Command::MasterEffect { index, value } => {
                    writer.write_u8(OP_MASTER_EFFECT);
                    writer.write_u8(index);
                    writer.write_u8(value);
                }
                Command::OverridePatch { bank, patch } => {
                    writer.write_u8(OP_OVERRIDE_PATCH);
                    writer.write_u8(bank);
                    writer.write_u8(patch);
                }
                Command::InstrumentVolume { volume } => {
                    writer.write_u8(OP_INSTRUMENT_VOLUME);
                    writer.write_u8(volume & 0x7F);
                }
                Command::InstrumentPan { pan } => {
                    writer.write_u8(OP_INSTRUMENT_PAN);
                    writer.write_u8(pan & 0x7F);
                }
                Command::InstrumentReverb { reverb } => {
                    writer.write_u8(OP_INSTRUMENT_REVERB);
                    writer.write_u8(reverb & 0x7F);
                }
                Command::TrackVolume { volume } => {
                    writer.write_u8(OP_TRACK_VOLUME);
                    writer.write_u8(volume & 0x7F);
                }
                Command::InstrumentCoarseTune { semitones } => {
                    writer.write_u8(OP_INSTRUMENT_COARSE_TUNE);
                    writer.write_i8(semitones);
                }
                Command::InstrumentFineTune { cents } => {
                    writer.write_u8(OP_INSTRUMENT_FINE_TUNE);
                    writer.write_i8(cents);
                }
                Command::TrackDetune { cents } => {
                    writer.write_u8(OP_TRACK_DETUNE);
                    writer.write_i16(cents);
                }
                Command::TrackTremolo {
                    delay,
                    speed,
                    depth,
                } => {
                    writer.write_u8(OP_TRACK_TREMOLO);
                    writer.write_u8(delay);
                    writer.write_u8(speed);
                    writer.write_u8(depth);
                }
                Command::TrackTremoloRate { rate } => {
                    writer.write_u8(OP_TRACK_TREMOLO_RATE);
                    writer.write_u8(rate);
                }
                Command::TrackTremoloDepth { depth } => {
                    writer.write_u8(OP_TRACK_TREMOLO_DEPTH);
                    writer.write_u8(depth);
                }
                Command::TrackTremoloStop => writer.write_u8(OP_TRACK_TREMOLO_STOP),
                Command::RandomPan { pan1, pan2 } => {
                    writer.write_u8(OP_RANDOM_PAN);
                    writer.write_u8(pan1 & 0x7F);
                    writer.write_u8(pan2 & 0x7F);
                }
                Command::UseInstrument { index, global } => {
                    writer.write_u8(OP_USE_INSTRUMENT);
                    writer.write_u8(if global { index.wrapping_add(0x80) } else { index });
                }
                Command::InstrumentVolumeLerp { time, volume } => {
                    writer.write_u8(OP_INSTRUMENT_VOLUME_LERP);
                    writer.write_u16(time);
                    writer.write_u8(volume & 0x7F);
                }
                Command::ReverbType { index } => {
                    writer.write_u8(OP_REVERB_TYPE);
                    writer.write_u8(index);
                }
                Command::Branch { serial } => {
                    writer.write_u8(OP_BRANCH);
                    patches.push(Patch::Branch {
                        at: writer.position(),
                        phrase,
                        track,
                        serial,
                    });
                    writer.write_u16(0);
                    writer.write_u8(0);
                }
                Command::EventTrigger { info } => {
                    writer.write_u8(OP_EVENT_TRIGGER);
                    writer.write_u32(info & 0x00FF_FFFF);
                }
                Command::Detour { serial } => {
                    writer.write_u8(OP_DETOUR);
                    patches.push(Patch::Detour {
                        at: writer.position(),
                        phrase,
                        track,
                        serial,
                    });
                    writer.write_u16(0);
                    writer.write_u8(0);
                }
                Command::StereoDelay { index, time, side } => {
                    writer.write_u8(OP_EXTENDED);
                    writer.write_u8(SUB_STEREO_DELAY);
                    writer.write_u8(index);
                    writer.write_u8((side.wrapping_sub(1) & 1) << 4 | (time & 0xF));
                }
                Command::SeekCustomEnvelope { index } => {
                    writer.write_u8(OP_EXTENDED);
                    writer.write_u8(SUB_SEEK_CUSTOM_ENVELOPE);
                    writer.write_u8(index);
                    writer.write_u8(0);
                }
                Command::WriteCustomEnvelope { value } => {
                    writer.write_u8(OP_EXTENDED);
                    writer.write_u8(SUB_WRITE_CUSTOM_ENVELOPE);
                    writer.write_u16(value);
                }
                Command::UseCustomEnvelope { index } => {
                    writer.write_u8(OP_EXTENDED);
                    writer.write_u8(SUB_USE_CUSTOM_ENVELOPE);
                    writer.write_u8(index);
                    writer.write_u8(0);
                }
                Command::TriggerSound { index } => {
                    writer.write_u8(OP_EXTENDED);
                    writer.write_u8(SUB_TRIGGER_SOUND);
                    writer.write_u8(index);
                    writer.write_u8(0);
                }
                Command::ProxMixOverride { vol1, vol2 } => {
                    writer.write_u8(OP_EXTENDED);
                    writer.write_u8(SUB_PROX_MIX_OVERRIDE);
                    writer.write_u8(vol1);
                    writer.write_u8(vol2);
                }
            }
        }

        if terminate {
            writer.write_u8(OP_TERMINATOR);
        }
        self.file_len = writer.position() - self.file_pos;
        Ok(())
    }

    /// Recompute `duration` and the per-command elapsed time from scratch
    ///
    /// Used after loading the authored form, where tick accounting is not
    /// stored. `detour_durations` maps detour serial ids to their already
    /// recomputed durations.
    pub(crate) fn recompute_duration(
        &mut self,
        branch_measure: u32,
        detour_durations: &[(u32, u32)],
    ) {
        let mut time = 0u32;
        for command in &self.commands {
            match *command {
                Command::Delay { ticks } => time += ticks as u32,
                Command::Branch { .. } => time += branch_measure,
                Command::Detour { serial } => {
                    if let Some((_, duration)) =
                        detour_durations.iter().find(|(id, _)| *id == serial)
                    {
                        time += duration;
                    }
                }
                _ => {}
            }
        }
        self.duration = time;
    }
}

/// Decode the rest of a delay whose first byte is `opcode`
pub(crate) fn read_delay(reader: &mut Reader, opcode: u8) -> Result<u16, OutOfBoundsError> {
    if opcode < 0x78 {
        Ok(opcode as u16)
    } else {
        let next = reader.read_u8()?;
        Ok((((opcode & 7) as u16) << 8) + next as u16 + 0x78)
    }
}

/// Decode a note length at the reader's current position
pub(crate) fn read_note_length(reader: &mut Reader) -> Result<u16, OutOfBoundsError> {
    let first = reader.read_u8()?;
    if first < 0xC0 {
        Ok(first as u16)
    } else {
        let extra = reader.read_u8()?;
        Ok((((first & 0x3F) as u16) << 8) + extra as u16 + 0xC0)
    }
}

/// Encode a delay in the short or continued form
pub(crate) fn write_delay(writer: &mut Writer, ticks: u16) -> Result<(), StructuralError> {
    if ticks < 0x78 {
        writer.write_u8(ticks as u8);
    } else if ticks <= MAX_DELAY_TICKS {
        writer.write_u8(0x78 | ((ticks - 0x78) >> 8) as u8);
        writer.write_u8(((ticks - 0x78) & 0xFF) as u8);
    } else {
        return Err(StructuralError::DelayTooLong { ticks });
    }
    Ok(())
}

/// Encode a note length in the short or continued form
pub(crate) fn write_note_length(writer: &mut Writer, length: u16) -> Result<(), StructuralError> {
    if length < 0xC0 {
        writer.write_u8(length as u8);
    } else if length <= MAX_NOTE_LENGTH {
        writer.write_u8(0xC0 | ((length - 0xC0) >> 8) as u8);
        writer.write_u8(((length - 0xC0) & 0xFF) as u8);
    } else {
        return Err(StructuralError::NoteTooLong { length });
    }
    Ok(())
}

fn read_branch(
    decoder: &mut Decoder,
    track: &mut Track,
    offset: u32,
) -> Result<u32, FromBytesError> {
    let table_pos = decoder.reader.read_u16()? as u32;
    let count = decoder.reader.read_u8()?;

    match decoder.branch_options {
        None => {
            if count == 0 || count > Song::MAX_BRANCH_OPTIONS {
                return Err(FormatError::BranchOptionCountRange { count }.into());
            }
            decoder.branch_options = Some(count);
        }
        Some(expected) if expected != count => {
            return Err(FormatError::BranchOptionCountMismatch {
                expected,
                found: count,
            }
            .into());
        }
        Some(_) => {}
    }

    if let Some(index) = track.branches.iter().position(|b| b.table_pos == table_pos) {
        debug!("branch table at {table_pos:#x} reused by the command at {offset:#x}");
        return Ok(track.branches[index].serial);
    }

    let resume = decoder.reader.position();
    decoder.claim(
        table_pos,
        table_pos + 3 * count as u32,
        format!("branch table {table_pos:#x}"),
    );
    decoder.reader.set_position(table_pos);

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let option_pos = decoder.reader.read_u16()? as u32;
        let is_drum = decoder.reader.read_u8()? != 0;
        entries.push((option_pos, is_drum));
    }

    // slot 0 always points at the shared one-measure empty stream
    decoder.reader.set_position(entries[0].0);
    let measure = decoder.reader.read_u8()? as u32;
    let terminator = decoder.reader.read_u8()?;
    if measure != decoder.branch_measure || terminator != 0 {
        return Err(StructuralError::EmptyBranchMalformed {
            offset: entries[0].0,
        }
        .into());
    }

    let mut options = Vec::with_capacity(count as usize);
    for (option_pos, is_drum) in entries {
        decoder.reader.set_position(option_pos);
        let stream = CommandStream::read(decoder, track, StreamKind::Branch, None, is_drum)?;
        if stream.duration != decoder.branch_measure {
            return Err(StructuralError::BranchOptionDuration {
                expected: decoder.branch_measure,
                found: stream.duration,
            }
            .into());
        }
        decoder.claim(
            option_pos,
            option_pos + stream.file_len,
            format!("branch option {option_pos:#x}"),
        );
        options.push(stream);
    }

    decoder.reader.set_position(resume);

    let serial = track.branches.len() as u32 + 1;
    track.branches.push(TrackBranch {
        serial,
        table_pos,
        options,
    });
    Ok(serial)
}

fn read_detour(
    decoder: &mut Decoder,
    track: &mut Track,
    is_drum: bool,
    offset: u32,
) -> Result<(u32, u32), FromBytesError> {
    let detour_pos = decoder.reader.read_u16()? as u32;
    let stored = decoder.reader.read_u8()?;
    let (length, bugged) = if stored == 0 {
        warn!(
            "detour at {detour_pos:#x} stores length zero, reading it as 256 (engine length overflow)"
        );
        (0x100, true)
    } else {
        (stored as u32, false)
    };

    if let Some(index) = track.detours.iter().position(|d| d.file_pos == detour_pos) {
        let existing = &track.detours[index];
        if existing.commands.file_len != length {
            return Err(StructuralError::DetourLengthConflict {
                offset: detour_pos,
                expected: existing.commands.file_len,
                found: length,
            }
            .into());
        }
        debug!("detour at {detour_pos:#x} reused by the command at {offset:#x}");
        // a reused detour contributes no elapsed time, same as the engine
        return Ok((existing.serial, 0));
    }

    let resume = decoder.reader.position();
    decoder.claim(
        detour_pos,
        detour_pos + length,
        format!("detour {detour_pos:#x}"),
    );
    decoder.reader.set_position(detour_pos);
    let commands = CommandStream::read(decoder, track, StreamKind::Detour, Some(length), is_drum)?;
    decoder.reader.set_position(resume);

    // the engine skips the elapsed time of a length-overflowed detour as well
    let advance = if bugged { 0 } else { commands.duration };
    let serial = track.detours.len() as u32 + 1;
    track.detours.push(TrackDetour {
        serial,
        file_pos: detour_pos,
        bugged,
        commands,
    });
    Ok((serial, advance))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_track(bytes: &[u8]) -> (CommandStream, Track) {
        let mut decoder = Decoder::new(bytes);
        let mut track = Track {
            polyphony: 1,
            ..Default::default()
        };
        let stream = CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false)
            .expect("stream rejected");
        (stream, track)
    }

    #[test]
    fn delay_encoding_idempotent() {
        for ticks in 0..=MAX_DELAY_TICKS {
            let mut writer = Writer::new();
            write_delay(&mut writer, ticks).expect("within range");
            let bytes = writer.into_vec();
            assert_eq!(bytes.len() == 1, ticks < 0x78, "form split at {ticks:#x}");

            let mut reader = Reader::new(&bytes);
            let opcode = reader.read_u8().unwrap();
            assert_eq!(read_delay(&mut reader, opcode), Ok(ticks));
        }

        let mut writer = Writer::new();
        assert_eq!(
            write_delay(&mut writer, MAX_DELAY_TICKS + 1),
            Err(StructuralError::DelayTooLong { ticks: 0x878 })
        );
    }

    #[test]
    fn note_length_round_trip() {
        for length in 0..=0x33FF {
            let mut writer = Writer::new();
            write_note_length(&mut writer, length).expect("within range");
            let bytes = writer.into_vec();
            assert_eq!(bytes.len() == 1, length < 0xC0, "form split at {length:#x}");

            let mut reader = Reader::new(&bytes);
            assert_eq!(read_note_length(&mut reader), Ok(length));
        }

        let mut writer = Writer::new();
        write_note_length(&mut writer, MAX_NOTE_LENGTH).expect("maximum encodes");
        assert_eq!(
            write_note_length(&mut writer, MAX_NOTE_LENGTH + 1),
            Err(StructuralError::NoteTooLong { length: 0x40C0 })
        );
    }

    #[test]
    fn basic_stream() {
        let (stream, _) = read_track(&[0x30, 0x82, 0x64, 0x20, 0x00]);
        assert_eq!(
            stream.commands,
            vec![
                Command::Delay { ticks: 0x30 },
                Command::Note {
                    pitch: 2,
                    velocity: 0x64,
                    length: 0x20
                },
            ]
        );
        assert_eq!(stream.duration, 0x30);
        assert_eq!(stream.file_len, 5);
    }

    #[test]
    fn chord_onsets_share_one_tick() {
        // two notes with no delay between them start on the same tick; the
        // third starts 0x30 ticks later and opens a fresh onset count
        let (stream, _) = read_track(&[
            0x82, 0x64, 0x20, 0x84, 0x64, 0x20, 0x30, 0x85, 0x64, 0x20, 0x00,
        ]);
        assert_eq!(stream.commands.len(), 4);
        assert_eq!(stream.duration, 0x30);
    }

    #[test]
    fn extended_delay() {
        let (stream, _) = read_track(&[0x7F, 0xFF, 0x00]);
        assert_eq!(stream.commands, vec![Command::Delay { ticks: 0x877 }]);
        assert_eq!(stream.duration, 0x877);
    }

    #[test]
    fn unknown_opcodes() {
        let bytes = [0xD4];
        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false),
            Err(FromBytesError::Format(FormatError::UnknownOpcode {
                opcode: 0xD4,
                offset: 0
            }))
        ));

        let bytes = [0xFF, 0x07];
        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false),
            Err(FromBytesError::Format(FormatError::UnknownExtendedOpcode {
                sub: 0x07,
                offset: 0
            }))
        ));
    }

    #[test]
    fn command_catalog_round_trip() {
        #[rustfmt::skip]
        let bytes = vec![
            0xE0, 0x00, 0x78,
            0xE1, 0x50,
            0xE2, 0xF8,
            0xE3, 0x02,
            0xE4, 0x00, 0x30, 0x00, 0x90,
            0xE5, 0x00, 0x40, 0x26,
            0xE6, 0x01, 0x22,
            0xE8, 0x02, 0x33,
            0xE9, 0x44,
            0xEA, 0x40,
            0xEB, 0x18,
            0xEC, 0x71,
            0xED, 0x0C,
            0xEE, 0xFB,
            0xEF, 0xFF, 0x9C,
            0xF0, 0x05, 0x10, 0x20,
            0xF1, 0x11,
            0xF2, 0x22,
            0xF3,
            0xF4, 0x10, 0x60,
            0xF5, 0x85,
            0xF6, 0x00, 0x60, 0x33,
            0xF7, 0x01,
            0xFD, 0x00, 0x01, 0x02, 0x03,
            0xFF, 0x01, 0x02, 0x17,
            0xFF, 0x02, 0x03, 0x00,
            0xFF, 0x03, 0x01, 0x00,
            0xFF, 0x04, 0x01, 0x00,
            0xFF, 0x05, 0x07, 0x00,
            0xFF, 0x06, 0x30, 0x40,
            0x00,
        ];

        let (mut stream, _) = read_track(&bytes);
        assert_eq!(stream.commands.len(), 30);
        assert_eq!(
            stream.commands[0],
            Command::MasterTempo { bpm: 0x78 }
        );
        assert_eq!(stream.commands[2], Command::MasterDetune { cents: -8 });
        assert_eq!(stream.commands[14], Command::TrackDetune { cents: -100 });
        assert_eq!(
            stream.commands[20],
            Command::UseInstrument {
                index: 5,
                global: true
            }
        );
        assert_eq!(
            stream.commands[23],
            Command::EventTrigger { info: 0x010203 }
        );
        assert_eq!(
            stream.commands[24],
            Command::StereoDelay {
                index: 2,
                time: 7,
                side: 2
            }
        );

        let mut encoder = Encoder::new();
        stream
            .write(&mut encoder, 0, 0, true)
            .expect("stream rejected");
        assert_eq!(encoder.writer.into_vec(), bytes);
    }

    #[test]
    fn detour_adds_time_once() {
        // a four byte detour body of single-tick delays at 0x10, entered twice
        let mut bytes = vec![0u8; 0x14];
        bytes[0] = 0xFE;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x04;
        bytes[4] = 0xFE;
        bytes[5..7].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[7] = 0x04;
        bytes[8] = 0x00;
        bytes[0x10..0x14].fill(0x01);

        let (stream, track) = read_track(&bytes);
        assert_eq!(
            stream.commands,
            vec![Command::Detour { serial: 1 }, Command::Detour { serial: 1 }]
        );
        assert_eq!(track.detours.len(), 1);
        assert_eq!(track.detours[0].commands.duration, 4);
        assert!(!track.detours[0].bugged);
        // the second entry reuses the first body and contributes no time
        assert_eq!(stream.duration, 4);
    }

    #[test]
    fn shared_detours_must_agree_on_length() {
        // both commands point at 0x10, but carry lengths 4 and 2
        let mut bytes = vec![0u8; 0x14];
        bytes[0] = 0xFE;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x04;
        bytes[4] = 0xFE;
        bytes[5..7].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[7] = 0x02;
        bytes[8] = 0x00;
        bytes[0x10..0x14].fill(0x01);

        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false),
            Err(FromBytesError::Structure(
                StructuralError::DetourLengthConflict {
                    offset: 0x10,
                    expected: 4,
                    found: 2
                }
            ))
        ));
    }

    #[test]
    fn detour_length_overflow() {
        // stored length zero means 256 bytes, and its time is not added
        let mut bytes = vec![0u8; 0x110];
        bytes[0] = 0xFE;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x00;
        bytes[4] = 0x00;
        bytes[0x10..0x110].fill(0x01);

        let (stream, track) = read_track(&bytes);
        assert_eq!(track.detours.len(), 1);
        assert!(track.detours[0].bugged);
        assert_eq!(track.detours[0].commands.commands.len(), 256);
        assert_eq!(track.detours[0].commands.duration, 256);
        assert_eq!(stream.duration, 0);
    }

    #[test]
    fn detour_must_stop_at_its_length() {
        let bytes = [0x01, 0xE0, 0x00, 0x78];
        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Detour, Some(3), false),
            Err(FromBytesError::Structure(StructuralError::DetourOverrun {
                offset: 0,
                limit: 3,
                read: 4
            }))
        ));
    }

    #[test]
    fn branch_table() {
        // command at 0, table at 0x10 with two options, the shared empty
        // measure at 0x20 and a one-measure option at 0x30
        let mut bytes = vec![0u8; 0x40];
        bytes[0] = 0xFC;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x02;
        bytes[4] = 0x00;
        bytes[0x10..0x12].copy_from_slice(&0x0020u16.to_be_bytes());
        bytes[0x12] = 0x00;
        bytes[0x13..0x15].copy_from_slice(&0x0030u16.to_be_bytes());
        bytes[0x15] = 0x01;
        bytes[0x20] = 0x60;
        bytes[0x21] = 0x00;
        bytes[0x30] = 0x60;
        bytes[0x31] = 0x00;

        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        let stream = CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false)
            .expect("stream rejected");

        assert_eq!(stream.commands, vec![Command::Branch { serial: 1 }]);
        assert_eq!(stream.duration, 96);
        assert_eq!(decoder.branch_options, Some(2));
        assert_eq!(track.branches.len(), 1);

        let branch = &track.branches[0];
        assert_eq!(branch.table_pos, 0x10);
        assert_eq!(branch.options.len(), 2);
        assert_eq!(branch.options[0].duration, 96);
        assert!(!branch.options[0].is_drum);
        assert!(branch.options[1].is_drum);
    }

    #[test]
    fn branch_option_counts_must_agree_across_commands() {
        // the second command carries 3 options against the established 2
        let mut bytes = vec![0u8; 0x40];
        bytes[0] = 0xFC;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x02;
        bytes[4] = 0xFC;
        bytes[5..7].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[7] = 0x03;
        bytes[8] = 0x00;
        bytes[0x10..0x12].copy_from_slice(&0x0020u16.to_be_bytes());
        bytes[0x13..0x15].copy_from_slice(&0x0030u16.to_be_bytes());
        bytes[0x20] = 0x60;
        bytes[0x30] = 0x60;

        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false),
            Err(FromBytesError::Format(
                FormatError::BranchOptionCountMismatch {
                    expected: 2,
                    found: 3
                }
            ))
        ));
    }

    #[test]
    fn option_zero_must_be_the_empty_measure() {
        // option 0 opens with a 0x30 tick delay instead of the 0x60 tick measure
        let mut bytes = vec![0u8; 0x40];
        bytes[0] = 0xFC;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x02;
        bytes[0x10..0x12].copy_from_slice(&0x0020u16.to_be_bytes());
        bytes[0x13..0x15].copy_from_slice(&0x0030u16.to_be_bytes());
        bytes[0x20] = 0x30;
        bytes[0x30] = 0x60;

        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false),
            Err(FromBytesError::Structure(
                StructuralError::EmptyBranchMalformed { offset: 0x20 }
            ))
        ));
    }

    #[test]
    fn branch_option_duration_must_match_the_measure() {
        // the second option runs 48 ticks instead of the 96 tick measure
        let mut bytes = vec![0u8; 0x40];
        bytes[0] = 0xFC;
        bytes[1..3].copy_from_slice(&0x0010u16.to_be_bytes());
        bytes[3] = 0x02;
        bytes[0x10..0x12].copy_from_slice(&0x0020u16.to_be_bytes());
        bytes[0x13..0x15].copy_from_slice(&0x0030u16.to_be_bytes());
        bytes[0x20] = 0x60;
        bytes[0x30] = 0x30;

        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Track, None, false),
            Err(FromBytesError::Structure(
                StructuralError::BranchOptionDuration {
                    expected: 96,
                    found: 48
                }
            ))
        ));
    }

    #[test]
    fn branch_and_detour_are_track_only() {
        let bytes = [0xFC, 0x00, 0x10, 0x02];
        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Branch, None, false),
            Err(FromBytesError::Format(FormatError::MisplacedBranch {
                offset: 0
            }))
        ));

        let bytes = [0xFE, 0x00, 0x10, 0x04];
        let mut decoder = Decoder::new(&bytes);
        let mut track = Track::default();
        assert!(matches!(
            CommandStream::read(&mut decoder, &mut track, StreamKind::Detour, Some(4), false),
            Err(FromBytesError::Format(FormatError::MisplacedDetour {
                offset: 0
            }))
        ));
    }
}
