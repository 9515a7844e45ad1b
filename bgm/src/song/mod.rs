//! Songs and every structure the sequence format stores inside them
//!
//! The byte form is one contiguous buffer full of raw offsets: a header,
//! preset tables, up to four compositions, and the phrase tables, command
//! streams, detour bodies and branch tables they point into. Decoding
//! resolves the offsets into the object graph rooted at [`Song`]; encoding
//! lays out a fresh buffer in the canonical order and patches the offsets
//! back in once every structure has a position.

pub mod command;
pub mod composition;
pub mod phrase;
pub mod stream;
pub mod track;

pub use command::Command;
pub use composition::{Composition, CompositionCommand};
pub use phrase::Phrase;
pub use stream::CommandStream;
pub use track::{Track, TrackBranch, TrackDetour, VOICE_COUNTS};

use crate::bytes::{Reader, Writer};
use crate::error::{FormatError, OutOfBoundsError, ReferenceError, StructuralError};
use crate::name::{NameFromBytesError, SongName};
use crate::presets::{DrumPreset, InstrumentPreset};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, Read, Write},
    mem,
    path::Path,
};
use thiserror::Error;

/// A complete song, decoded into an editable graph
///
/// Every cross-reference in the byte form is a file offset; in the graph
/// they become serial ids, so two songs with the same musical content
/// compare and encode the same even when their source files laid the
/// structures out differently. Encoding starts from a blank buffer and
/// never reuses source offsets, which keeps decode followed by encode
/// byte-for-byte stable.
///
/// ```no_run
/// use bgm::Song;
///
/// let mut song = Song::from_path("overworld.bgm")?;
/// println!("{} at {} ticks per beat", song.name, song.ticks_per_beat());
/// song.to_path("out/overworld.bgm")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    /// Four character display name
    #[serde(default)]
    pub name: SongName,

    /// Index into [`Song::TIMING_PRESETS`]
    #[serde(default = "default_timing_preset")]
    pub timing_preset: u8,

    /// Ticks every branch option plays for
    #[serde(default = "default_branch_measure")]
    pub branch_measure: u32,

    /// File-wide number of options in every branch table
    #[serde(default = "default_branch_options")]
    pub branch_options: u8,

    /// Drum presets, indexed by drum notes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drums: Vec<DrumPreset>,

    /// Instrument presets, selected by use-instrument commands
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instruments: Vec<InstrumentPreset>,

    /// The four playback variation slots
    #[serde(default)]
    pub compositions: [Composition; Self::COMPOSITION_COUNT],

    /// Every phrase in the song, in file order, serials starting at 1
    #[serde(default)]
    pub phrases: Vec<Phrase>,

    #[serde(skip)]
    regions: Vec<Region>,
}

fn default_timing_preset() -> u8 {
    4
}

fn default_branch_measure() -> u32 {
    Song::DEFAULT_BRANCH_MEASURE
}

fn default_branch_options() -> u8 {
    Song::DEFAULT_BRANCH_OPTIONS
}

/// A byte range the decode attributed to one structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// First byte of the range
    pub start: u32,

    /// One past the last byte of the range
    pub end: u32,

    /// What the range holds
    pub label: String,
}

impl Song {
    /// Every sequence file starts with these four bytes
    pub const MAGIC: [u8; 4] = *b"BGM ";

    /// Number of composition slots in every song
    pub const COMPOSITION_COUNT: usize = 4;

    /// Ticks per beat for each of the eight timing presets
    pub const TIMING_PRESETS: [u32; 8] = [48, 24, 32, 40, 48, 56, 64, 48];

    /// Ticks in the measure every branch option fills
    pub const DEFAULT_BRANCH_MEASURE: u32 = 96;

    /// Option count used when a song has no branches to take it from
    pub const DEFAULT_BRANCH_OPTIONS: u8 = 10;

    /// Largest option count a branch table can hold
    pub const MAX_BRANCH_OPTIONS: u8 = 16;

    const HEADER_LEN: u32 = 0x24;

    /// Create an empty song with no phrases and default timing
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticks in one beat under the song's timing preset
    pub fn ticks_per_beat(&self) -> u32 {
        Self::TIMING_PRESETS[(self.timing_preset & 7) as usize]
    }

    /// The byte ranges the last decode attributed, sorted by start
    ///
    /// Empty for songs that were never decoded from bytes.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Decode a song from its byte form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FromBytesError> {
        let mut decoder = Decoder::new(bytes);

        let magic = decoder.reader.read_slice(4)?;
        if magic != Self::MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(FormatError::BadMagic { found }.into());
        }

        // the length field counts up to the end of the last structure,
        // before the file is padded out to a 16 byte boundary
        let _file_len = decoder.reader.read_u32()?;

        let mut name_bytes = [0u8; SongName::LEN];
        name_bytes.copy_from_slice(decoder.reader.read_slice(SongName::LEN as u32)?);
        let name = SongName::from_bytes(name_bytes)?;

        let reserved_pos = decoder.reader.position();
        let reserved = decoder.reader.read_u32()?;
        if reserved != 0 {
            return Err(FormatError::ReservedNotZero {
                offset: reserved_pos,
                value: reserved,
            }
            .into());
        }

        let timing_preset = decoder.reader.read_u8()? & 7;
        for _ in 0..3 {
            let offset = decoder.reader.position();
            let value = decoder.reader.read_u8()?;
            if value != 0 {
                return Err(FormatError::ReservedNotZero {
                    offset,
                    value: value as u32,
                }
                .into());
            }
        }

        // offsets in the header are word-addressed
        let mut composition_offsets = [0u32; Self::COMPOSITION_COUNT];
        for offset in &mut composition_offsets {
            *offset = decoder.reader.read_u16()? as u32 * 4;
        }
        let drum_offset = decoder.reader.read_u16()? as u32 * 4;
        let drum_count = decoder.reader.read_u16()? as usize;
        let instrument_offset = decoder.reader.read_u16()? as u32 * 4;
        let instrument_count = decoder.reader.read_u16()? as usize;

        decoder.claim(0, Self::HEADER_LEN, "header");

        let mut drums = Vec::with_capacity(drum_count);
        if drum_count > 0 {
            let position = decoder.reader.position();
            if drum_offset != position {
                return Err(FormatError::DrumTableMisplaced {
                    expected: position,
                    found: drum_offset,
                }
                .into());
            }
            for _ in 0..drum_count {
                drums.push(DrumPreset::read(&mut decoder.reader)?);
            }
            let end = decoder.reader.position();
            decoder.claim(position, end, "drum presets");
        }

        let mut instruments = Vec::with_capacity(instrument_count);
        if instrument_count > 0 {
            let position = decoder.reader.position();
            if instrument_offset != position {
                return Err(FormatError::InstrumentTableMisplaced {
                    expected: position,
                    found: instrument_offset,
                }
                .into());
            }
            for _ in 0..instrument_count {
                instruments.push(InstrumentPreset::read(&mut decoder.reader)?);
            }
            let end = decoder.reader.position();
            decoder.claim(position, end, "instrument presets");
        }

        let mut compositions: [Composition; Self::COMPOSITION_COUNT] = Default::default();
        for (index, &offset) in composition_offsets.iter().enumerate() {
            if offset != 0 {
                compositions[index] = Composition::read(&mut decoder, index, offset)?;
            }
        }

        Self::recover_phrases(&mut decoder)?;

        decoder.phrases.sort_by_key(|phrase| phrase.file_pos);
        for (index, phrase) in decoder.phrases.iter_mut().enumerate() {
            phrase.serial = index as u32 + 1;
        }

        let pending = mem::take(&mut decoder.pending_plays);
        for play in pending {
            let serial = decoder
                .phrases
                .iter()
                .find(|phrase| phrase.file_pos == play.offset)
                .map(|phrase| phrase.serial)
                .ok_or(ReferenceError::UnresolvedPlayOffset {
                    offset: play.offset,
                })?;
            compositions[play.composition].commands[play.command] =
                CompositionCommand::Play { phrase: serial };
        }

        decoder.regions.sort_by_key(|region| region.start);

        debug!(
            "decoded {name}: {} drums, {} instruments, {} phrases",
            drums.len(),
            instruments.len(),
            decoder.phrases.len()
        );

        Ok(Self {
            name,
            timing_preset,
            branch_measure: decoder.branch_measure,
            branch_options: decoder
                .branch_options
                .unwrap_or(Self::DEFAULT_BRANCH_OPTIONS),
            drums,
            instruments,
            compositions,
            phrases: decoder.phrases,
            regions: decoder.regions,
        })
    }

    /// Decode a song from an I/O source
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, FromReaderError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Self::from_bytes(&bytes)?)
    }

    /// Load a song from a file
    ///
    /// ```no_run
    /// use bgm::Song;
    ///
    /// let song = Song::from_path("battle.bgm")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, FromPathError> {
        let file = File::open(path)?;
        Ok(Self::from_reader(file)?)
    }

    /// Encode the song into its byte form
    ///
    /// Takes `&mut self` because encoding assigns every structure its file
    /// position, which the graph records.
    pub fn to_vec(&mut self) -> Result<Vec<u8>, ToBytesError> {
        let mut encoder = Encoder::new();
        encoder.writer.set_position(Self::HEADER_LEN);

        for drum in &self.drums {
            drum.write(&mut encoder.writer);
        }
        for instrument in &self.instruments {
            instrument.write(&mut encoder.writer);
        }

        for (index, composition) in self.compositions.iter_mut().enumerate() {
            composition.write(&mut encoder, index);
        }

        for (index, phrase) in self.phrases.iter_mut().enumerate() {
            phrase.write_streams(&mut encoder, index)?;
        }
        for (index, phrase) in self.phrases.iter_mut().enumerate() {
            phrase.write_branching_streams(&mut encoder, index)?;
        }

        self.write_branches(&mut encoder)?;

        let end_offset = encoder.writer.position();
        encoder.writer.align(16);

        self.apply_patches(&mut encoder)?;
        self.write_tables(&mut encoder.writer);
        self.write_header(&mut encoder.writer, end_offset);

        Ok(encoder.writer.into_vec())
    }

    /// Encode the song into an I/O sink
    pub fn to_writer<W: Write>(&mut self, mut writer: W) -> Result<(), ToWriterError> {
        let bytes = self.to_vec()?;
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Write the song to a file, creating missing parent directories
    pub fn to_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ToWriterError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.to_writer(File::create(path)?)
    }

    /// Render the song as its authored text form
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a song from its authored text form
    ///
    /// Beyond the JSON structure this checks the references the text form
    /// states by serial id and recomputes the tick accounting the byte
    /// form would carry implicitly.
    pub fn from_text(text: &str) -> Result<Self, FromTextError> {
        let mut song: Self = serde_json::from_str(text)?;
        song.finish_from_text()?;
        Ok(song)
    }

    /// Walk unclaimed gaps for phrase tables nothing references
    ///
    /// Songs in the wild carry phrases no composition plays. A gap
    /// qualifies when, after up to three zero bytes of padding to a 4
    /// byte boundary, it is at least one table long and either its first
    /// track word points its stream right behind the table or the gap is
    /// exactly one bare table. Each sweep decodes the first find and
    /// starts over, since a recovered phrase claims bytes of its own.
    fn recover_phrases(decoder: &mut Decoder) -> Result<(), FromBytesError> {
        loop {
            let mut claimed: Vec<(u32, u32)> = decoder
                .regions
                .iter()
                .map(|region| (region.start, region.end))
                .collect();
            claimed.sort_unstable();

            let mut candidate = None;
            let mut cursor = 0u32;
            for (start, end) in claimed {
                if start > cursor {
                    candidate = Self::phrase_candidate(&decoder.reader, cursor, start);
                    if candidate.is_some() {
                        break;
                    }
                }
                cursor = cursor.max(end);
            }
            if candidate.is_none() && cursor < decoder.reader.len() {
                candidate = Self::phrase_candidate(&decoder.reader, cursor, decoder.reader.len());
            }

            match candidate {
                Some(table) => {
                    warn!("recovering an unreferenced phrase at {table:#x}");
                    decoder.phrase_at(table)?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Check the gap `start..end` for a phrase table, returning its offset
    fn phrase_candidate(reader: &Reader, start: u32, end: u32) -> Option<u32> {
        if end - start <= 3 {
            return None;
        }
        let padded = (start + 3) & !3;
        let bytes = reader.bytes();
        if bytes[start as usize..padded as usize]
            .iter()
            .any(|byte| *byte != 0)
        {
            return None;
        }
        let size = end - padded;
        if size < Phrase::TABLE_LEN {
            return None;
        }
        let first = u16::from_be_bytes([bytes[padded as usize], bytes[padded as usize + 1]]);
        if first as u32 == Phrase::TABLE_LEN || size == Phrase::TABLE_LEN {
            Some(padded)
        } else {
            None
        }
    }

    /// Reserve and fill every branch table, option-index-major
    fn write_branches(&mut self, encoder: &mut Encoder) -> Result<(), ToBytesError> {
        let mut sites: Vec<(usize, usize, usize)> = Vec::new();
        for (pi, phrase) in self.phrases.iter().enumerate() {
            for (ti, track) in phrase.tracks.iter().enumerate() {
                for bi in 0..track.branches.len() {
                    sites.push((pi, ti, bi));
                }
            }
        }
        if sites.is_empty() {
            return Ok(());
        }

        let count = self.branch_options;
        if count == 0 || count > Self::MAX_BRANCH_OPTIONS {
            return Err(StructuralError::BranchOptionsOutOfRange { count }.into());
        }
        for &(pi, ti, bi) in &sites {
            let branch = &self.phrases[pi].tracks[ti].branches[bi];
            if branch.options.len() != count as usize {
                return Err(StructuralError::BranchOptionCount {
                    expected: count,
                    found: branch.options.len(),
                }
                .into());
            }
        }

        // the shared empty option stores the measure as a single delay byte
        if !(1..=0x77).contains(&self.branch_measure) {
            return Err(StructuralError::BranchMeasureOutOfRange {
                ticks: self.branch_measure,
            }
            .into());
        }

        for &(pi, ti, bi) in &sites {
            let branch = &mut self.phrases[pi].tracks[ti].branches[bi];
            branch.table_pos = encoder.writer.position();
            encoder.writer.skip(3 * count as u32);
        }

        // one do-nothing measure, shared by slot 0 of every table
        let empty_offset = encoder.writer.position();
        encoder.writer.write_u8(self.branch_measure as u8);
        encoder.writer.write_u8(0);
        for &(pi, ti, bi) in &sites {
            let option = &mut self.phrases[pi].tracks[ti].branches[bi].options[0];
            option.file_pos = empty_offset;
            option.file_len = 2;
        }

        for index in 1..count as usize {
            for &(pi, ti, bi) in &sites {
                let option = &mut self.phrases[pi].tracks[ti].branches[bi].options[index];
                option.write(encoder, pi, ti, true)?;
            }
        }

        let resume = encoder.writer.position();
        for &(pi, ti, bi) in &sites {
            let branch = &self.phrases[pi].tracks[ti].branches[bi];
            encoder.writer.set_position(branch.table_pos);
            for option in &branch.options {
                encoder.writer.write_u16(option.file_pos as u16);
                encoder.writer.write_u8(u8::from(option.is_drum));
            }
        }
        encoder.writer.set_position(resume);
        Ok(())
    }

    /// Fill in every placeholder the first pass left behind
    fn apply_patches(&self, encoder: &mut Encoder) -> Result<(), ToBytesError> {
        let patches = mem::take(&mut encoder.patches);
        let writer = &mut encoder.writer;

        for patch in patches {
            match patch {
                Patch::Play {
                    at,
                    composition,
                    serial,
                } => {
                    let phrase = self
                        .phrases
                        .iter()
                        .find(|phrase| phrase.serial == serial)
                        .ok_or(ReferenceError::UnknownPhrase {
                            composition,
                            serial,
                        })?;
                    let relative = (phrase.file_pos - self.compositions[composition].file_pos) / 4;
                    writer.set_position(at);
                    writer.write_u32(1 << 28 | relative);
                }
                Patch::Branch {
                    at,
                    phrase,
                    track,
                    serial,
                } => {
                    let branch = self.phrases[phrase].tracks[track]
                        .branches
                        .iter()
                        .find(|branch| branch.serial == serial)
                        .ok_or(ReferenceError::UnknownBranch { serial })?;
                    writer.set_position(at);
                    writer.write_u16(branch.table_pos as u16);
                    writer.write_u8(self.branch_options);
                }
                Patch::Detour {
                    at,
                    phrase,
                    track,
                    serial,
                } => {
                    let detour = self.phrases[phrase].tracks[track]
                        .detours
                        .iter()
                        .find(|detour| detour.serial == serial)
                        .ok_or(ReferenceError::UnknownDetour { serial })?;
                    let len = detour.commands.file_len;
                    if len > 0x100 {
                        return Err(StructuralError::DetourTooLong { len }.into());
                    }
                    if len == 0x100 {
                        warn!(
                            "detour at {:#x} is 256 bytes long, storing the length as zero (engine length overflow)",
                            detour.commands.file_pos
                        );
                    }
                    writer.set_position(at);
                    writer.write_u16(detour.commands.file_pos as u16);
                    writer.write_u8(len as u8);
                }
            }
        }
        Ok(())
    }

    /// Write every phrase's track table now that stream positions are known
    fn write_tables(&self, writer: &mut Writer) {
        for phrase in &self.phrases {
            writer.set_position(phrase.file_pos);
            for (index, track) in phrase.tracks.iter().enumerate() {
                let master = track.copy_of.unwrap_or(index);
                writer.write_u32(phrase.tracks[master].track_word(phrase.file_pos));
            }
        }
    }

    fn write_header(&self, writer: &mut Writer, end_offset: u32) {
        writer.set_position(0);
        writer.write_slice(&Self::MAGIC);
        writer.write_u32(end_offset);
        writer.write_slice(self.name.bytes());
        writer.write_u32(0);
        writer.write_u8(self.timing_preset & 7);
        writer.skip(3);
        for composition in &self.compositions {
            writer.write_u16((composition.file_pos / 4) as u16);
        }
        let drum_offset = if self.drums.is_empty() {
            0
        } else {
            Self::HEADER_LEN / 4
        };
        writer.write_u16(drum_offset as u16);
        writer.write_u16(self.drums.len() as u16);
        let instrument_offset = if self.instruments.is_empty() {
            0
        } else {
            (Self::HEADER_LEN + self.drums.len() as u32 * DrumPreset::LEN) / 4
        };
        writer.write_u16(instrument_offset as u16);
        writer.write_u16(self.instruments.len() as u16);
    }

    /// Validate references the text form states by serial id and recompute
    /// the tick accounting
    fn finish_from_text(&mut self) -> Result<(), FromTextError> {
        if self.branch_options == 0 || self.branch_options > Self::MAX_BRANCH_OPTIONS {
            return Err(FormatError::BranchOptionCountRange {
                count: self.branch_options,
            }
            .into());
        }

        for (index, composition) in self.compositions.iter().enumerate() {
            for command in &composition.commands {
                if let CompositionCommand::Play { phrase } = command {
                    if !self.phrases.iter().any(|p| p.serial == *phrase) {
                        return Err(ReferenceError::UnknownPhrase {
                            composition: index,
                            serial: *phrase,
                        }
                        .into());
                    }
                }
            }
        }

        for phrase in &self.phrases {
            for (index, track) in phrase.tracks.iter().enumerate() {
                if let Some(master) = track.copy_of {
                    if master >= index
                        || !phrase.tracks[master].enabled
                        || phrase.tracks[master].copy_of.is_some()
                    {
                        return Err(ReferenceError::BadCopyOf {
                            phrase: phrase.serial,
                            track: index,
                            copy_of: master,
                        }
                        .into());
                    }
                }

                for command in &track.commands.commands {
                    match *command {
                        Command::Branch { serial } => {
                            if !track.branches.iter().any(|b| b.serial == serial) {
                                return Err(ReferenceError::UnknownBranch { serial }.into());
                            }
                        }
                        Command::Detour { serial } => {
                            if !track.detours.iter().any(|d| d.serial == serial) {
                                return Err(ReferenceError::UnknownDetour { serial }.into());
                            }
                        }
                        _ => {}
                    }
                }

                for detour in &track.detours {
                    if Self::contains_jump(&detour.commands) {
                        return Err(FormatError::MisplacedDetour {
                            offset: detour.file_pos,
                        }
                        .into());
                    }
                }
                for branch in &track.branches {
                    if branch.options.len() != self.branch_options as usize {
                        return Err(StructuralError::BranchOptionCount {
                            expected: self.branch_options,
                            found: branch.options.len(),
                        }
                        .into());
                    }
                    for option in &branch.options {
                        if Self::contains_jump(option) {
                            return Err(FormatError::MisplacedBranch {
                                offset: branch.table_pos,
                            }
                            .into());
                        }
                    }
                }
            }
        }

        let branch_measure = self.branch_measure;
        for phrase in &mut self.phrases {
            for track in &mut phrase.tracks {
                let mut detour_durations = Vec::with_capacity(track.detours.len());
                for detour in &mut track.detours {
                    detour.commands.recompute_duration(branch_measure, &[]);
                    detour_durations.push((detour.serial, detour.commands.duration));
                }
                for branch in &mut track.branches {
                    for option in &mut branch.options {
                        option.recompute_duration(branch_measure, &[]);
                    }
                    // slot 0 is replaced by the shared empty measure on
                    // encode, so only the authored options are checked
                    for option in branch.options.iter().skip(1) {
                        if option.duration != branch_measure {
                            return Err(StructuralError::BranchOptionDuration {
                                expected: branch_measure,
                                found: option.duration,
                            }
                            .into());
                        }
                    }
                }
                track
                    .commands
                    .recompute_duration(branch_measure, &detour_durations);
            }
        }
        Ok(())
    }

    fn contains_jump(stream: &CommandStream) -> bool {
        stream
            .commands
            .iter()
            .any(|command| matches!(command, Command::Branch { .. } | Command::Detour { .. }))
    }
}

impl Default for Song {
    fn default() -> Self {
        Self {
            name: SongName::default(),
            timing_preset: default_timing_preset(),
            branch_measure: Self::DEFAULT_BRANCH_MEASURE,
            branch_options: Self::DEFAULT_BRANCH_OPTIONS,
            drums: Vec::new(),
            instruments: Vec::new(),
            compositions: Default::default(),
            phrases: Vec::new(),
            regions: Vec::new(),
        }
    }
}

/// Shared state of one decode run
pub(crate) struct Decoder<'a> {
    pub(crate) reader: Reader<'a>,
    pub(crate) branch_measure: u32,
    pub(crate) branch_options: Option<u8>,
    pub(crate) regions: Vec<Region>,
    pub(crate) phrases: Vec<Phrase>,
    pub(crate) pending_plays: Vec<PendingPlay>,
}

/// A play word whose phrase serial is assigned once all phrases are known
pub(crate) struct PendingPlay {
    pub(crate) composition: usize,
    pub(crate) command: usize,
    pub(crate) offset: u32,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self {
            reader: Reader::new(bytes),
            branch_measure: Song::DEFAULT_BRANCH_MEASURE,
            branch_options: None,
            regions: Vec::new(),
            phrases: Vec::new(),
            pending_plays: Vec::new(),
        }
    }

    /// Decode the phrase whose table sits at `offset`, unless that offset
    /// was decoded before
    pub(crate) fn phrase_at(&mut self, offset: u32) -> Result<(), FromBytesError> {
        if self.phrases.iter().any(|phrase| phrase.file_pos == offset) {
            return Ok(());
        }
        let resume = self.reader.position();
        let phrase = Phrase::read(self, offset)?;
        self.phrases.push(phrase);
        self.reader.set_position(resume);
        Ok(())
    }

    /// Record that `start..end` belongs to a named structure
    ///
    /// Ranges are deduplicated by start so structures referenced from
    /// several places count once.
    pub(crate) fn claim(&mut self, start: u32, end: u32, label: impl Into<String>) {
        if self.regions.iter().any(|region| region.start == start) {
            return;
        }
        self.regions.push(Region {
            start,
            end,
            label: label.into(),
        });
    }
}

/// Shared state of one encode run
pub(crate) struct Encoder {
    pub(crate) writer: Writer,
    pub(crate) patches: Vec<Patch>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self {
            writer: Writer::new(),
            patches: Vec::new(),
        }
    }
}

/// A placeholder payload emitted in the first pass, filled in once every
/// target structure has a file position
pub(crate) enum Patch {
    Play {
        at: u32,
        composition: usize,
        serial: u32,
    },
    Branch {
        at: u32,
        phrase: usize,
        track: usize,
        serial: u32,
    },
    Detour {
        at: u32,
        phrase: usize,
        track: usize,
        serial: u32,
    },
}

/// An error describing why bytes could not be decoded into a [`Song`]
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FromBytesError {
    #[error("the bytes do not follow the sequence format: {0}")]
    Format(#[from] FormatError),

    #[error("the song name could not be read: {0}")]
    Name(#[from] NameFromBytesError),

    #[error("a structural rule of the format does not hold: {0}")]
    Structure(#[from] StructuralError),

    #[error("a cross-reference does not resolve: {0}")]
    Reference(#[from] ReferenceError),

    #[error("unexpected end of the file: {0}")]
    OutOfBounds(#[from] OutOfBoundsError),
}

/// An error describing why a [`Song`] could not be read from an I/O source
#[derive(Debug, Error)]
pub enum FromReaderError {
    #[error("could not read the source: {0}")]
    Read(#[from] io::Error),

    #[error("could not decode the song: {0}")]
    FromBytes(#[from] FromBytesError),
}

/// An error describing why a [`Song`] could not be loaded from a file
#[derive(Debug, Error)]
pub enum FromPathError {
    #[error("could not open the file: {0}")]
    FileOpen(#[from] io::Error),

    #[error("could not read the song: {0}")]
    Read(#[from] FromReaderError),
}

/// An error describing why a [`Song`] could not be encoded to bytes
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToBytesError {
    #[error("a structural rule of the format does not hold: {0}")]
    Structure(#[from] StructuralError),

    #[error("a cross-reference does not resolve: {0}")]
    Reference(#[from] ReferenceError),
}

/// An error describing why a [`Song`] could not be written to an I/O sink
#[derive(Debug, Error)]
pub enum ToWriterError {
    #[error("could not encode the song: {0}")]
    ToBytes(#[from] ToBytesError),

    #[error("could not write the sink: {0}")]
    Write(#[from] io::Error),
}

/// An error describing why the authored text form could not be parsed
#[derive(Debug, Error)]
pub enum FromTextError {
    #[error("the document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("a field does not follow the sequence format: {0}")]
    Format(#[from] FormatError),

    #[error("a structural rule of the format does not hold: {0}")]
    Structure(#[from] StructuralError),

    #[error("a cross-reference does not resolve: {0}")]
    Reference(#[from] ReferenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A two phrase file laid out by hand, byte for byte
    fn reference_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 0xC0];
        bytes[0x00..0x04].copy_from_slice(b"BGM ");
        bytes[0x04..0x08].copy_from_slice(&0xBEu32.to_be_bytes());
        bytes[0x08..0x0C].copy_from_slice(b"TEST");
        bytes[0x10] = 4;
        bytes[0x14..0x16].copy_from_slice(&9u16.to_be_bytes());
        // composition 0: play, open loop 3, play, close loop 3 after 5
        bytes[0x24..0x28].copy_from_slice(&0x1000_0005u32.to_be_bytes());
        bytes[0x28..0x2C].copy_from_slice(&0x3000_0003u32.to_be_bytes());
        bytes[0x2C..0x30].copy_from_slice(&0x1000_0016u32.to_be_bytes());
        bytes[0x30..0x34].copy_from_slice(&0x5000_00A3u32.to_be_bytes());
        // phrase at 0x38, track 0 stream right behind the table
        bytes[0x38..0x3C].copy_from_slice(&0x0040_2100u32.to_be_bytes());
        bytes[0x78] = 0x60;
        // phrase at 0x7C, same shape
        bytes[0x7C..0x80].copy_from_slice(&0x0040_2100u32.to_be_bytes());
        bytes[0xBC] = 0x30;
        bytes
    }

    /// A song touching presets, sharing, branches and detours
    fn sample_song() -> Song {
        let mut song = Song::new();
        song.name = SongName::from_str_lossy("DEMO").expect("name rejected");
        song.branch_options = 2;

        song.drums.push(DrumPreset {
            bank: 1,
            patch: 2,
            key_base: 0x3C00,
            volume: 100,
            pan: 10,
            reverb: 20,
            rand_tune: 0,
            rand_volume: 5,
            rand_pan: 0,
            rand_reverb: 0,
        });
        song.instruments.push(InstrumentPreset {
            bank: 0,
            patch: 7,
            volume: 110,
            pan: -12,
            reverb: 8,
            coarse_tune: 0,
            fine_tune: 3,
        });

        let mut phrase = Phrase {
            serial: 1,
            file_pos: 0,
            tracks: Default::default(),
        };

        phrase.tracks[0] = Track {
            enabled: true,
            polyphony: 1,
            flag: true,
            commands: CommandStream {
                commands: vec![
                    Command::UseInstrument {
                        index: 0,
                        global: false,
                    },
                    Command::Note {
                        pitch: 5,
                        velocity: 100,
                        length: 0x30,
                    },
                    Command::Delay { ticks: 0x30 },
                    Command::Detour { serial: 1 },
                    Command::Delay { ticks: 0x18 },
                ],
                ..Default::default()
            },
            detours: vec![TrackDetour {
                serial: 1,
                commands: CommandStream {
                    commands: vec![
                        Command::Note {
                            pitch: 7,
                            velocity: 90,
                            length: 0x18,
                        },
                        Command::Delay { ticks: 0x18 },
                    ],
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        };

        phrase.tracks[1] = Track {
            enabled: true,
            polyphony: 1,
            flag: true,
            copy_of: Some(0),
            ..Default::default()
        };

        phrase.tracks[2] = Track {
            enabled: true,
            polyphony: 1,
            flag: true,
            commands: CommandStream {
                commands: vec![Command::Branch { serial: 1 }],
                ..Default::default()
            },
            branches: vec![TrackBranch {
                serial: 1,
                table_pos: 0,
                options: vec![
                    CommandStream {
                        commands: vec![Command::Delay { ticks: 0x60 }],
                        ..Default::default()
                    },
                    CommandStream {
                        commands: vec![
                            Command::Note {
                                pitch: 9,
                                velocity: 80,
                                length: 0x30,
                            },
                            Command::Delay { ticks: 0x30 },
                            Command::Delay { ticks: 0x30 },
                        ],
                        ..Default::default()
                    },
                ],
            }],
            ..Default::default()
        };

        song.phrases.push(phrase);
        song.compositions[0] = Composition {
            enabled: true,
            commands: vec![
                CompositionCommand::Play { phrase: 1 },
                CompositionCommand::StartLoop { index: 0 },
                CompositionCommand::Play { phrase: 1 },
                CompositionCommand::EndLoop { index: 0, count: 0 },
            ],
            file_pos: 0,
        };
        song
    }

    #[test]
    fn reference_file_decodes_and_reencodes() {
        let bytes = reference_bytes();
        let mut song = Song::from_bytes(&bytes).expect("song rejected");

        assert_eq!(song.name.as_str(), "TEST");
        assert_eq!(song.ticks_per_beat(), 48);
        assert_eq!(song.phrases.len(), 2);
        assert_eq!(song.phrases[0].serial, 1);
        assert_eq!(song.phrases[0].file_pos, 0x38);
        assert_eq!(song.phrases[1].file_pos, 0x7C);
        assert!(song.compositions[0].enabled);
        assert!(!song.compositions[1].enabled);
        assert_eq!(
            song.compositions[0].commands,
            vec![
                CompositionCommand::Play { phrase: 1 },
                CompositionCommand::StartLoop { index: 3 },
                CompositionCommand::Play { phrase: 2 },
                CompositionCommand::EndLoop { index: 3, count: 5 },
            ]
        );
        assert_eq!(
            song.phrases[0].tracks[0].commands.commands,
            vec![Command::Delay { ticks: 0x60 }]
        );
        assert!(!song.phrases[0].tracks[0].flag);

        assert_eq!(song.to_vec().expect("song rejected"), bytes);
    }

    #[test]
    fn built_song_survives_the_byte_form() {
        let mut song = sample_song();
        let bytes = song.to_vec().expect("song rejected");

        let mut decoded = Song::from_bytes(&bytes).expect("song rejected");
        assert_eq!(decoded.name.as_str(), "DEMO");
        assert_eq!(decoded.branch_options, 2);
        assert_eq!(decoded.drums, song.drums);
        assert_eq!(decoded.instruments, song.instruments);
        assert_eq!(decoded.phrases.len(), 1);

        let phrase = &decoded.phrases[0];
        assert_eq!(
            phrase.tracks[0].commands.commands,
            song.phrases[0].tracks[0].commands.commands
        );
        assert_eq!(phrase.tracks[1].copy_of, Some(0));
        assert_eq!(phrase.tracks[2].branches.len(), 1);
        assert_eq!(phrase.tracks[2].branches[0].options.len(), 2);
        assert_eq!(phrase.tracks[2].branches[0].options[1].duration, 0x60);
        assert_eq!(phrase.tracks[0].detours.len(), 1);
        assert_eq!(phrase.tracks[0].detours[0].commands.duration, 0x18);

        assert_eq!(decoded.to_vec().expect("song rejected"), bytes);
    }

    #[test]
    fn unreferenced_phrases_are_recovered() {
        // one played phrase at 0x30, an orphan at 0x74 behind a 2 byte pad
        let mut bytes = vec![0u8; 0xC0];
        bytes[0x00..0x04].copy_from_slice(b"BGM ");
        bytes[0x04..0x08].copy_from_slice(&0xB6u32.to_be_bytes());
        bytes[0x08..0x0C].copy_from_slice(b"ORPH");
        bytes[0x10] = 4;
        bytes[0x14..0x16].copy_from_slice(&9u16.to_be_bytes());
        bytes[0x24..0x28].copy_from_slice(&0x1000_0003u32.to_be_bytes());
        bytes[0x30..0x34].copy_from_slice(&0x0040_2100u32.to_be_bytes());
        bytes[0x70] = 0x60;
        bytes[0x74..0x78].copy_from_slice(&0x0040_2100u32.to_be_bytes());
        bytes[0xB4] = 0x30;

        let song = Song::from_bytes(&bytes).expect("song rejected");
        assert_eq!(song.phrases.len(), 2);
        assert_eq!(song.phrases[0].file_pos, 0x30);
        assert_eq!(song.phrases[1].file_pos, 0x74);
        assert_eq!(song.phrases[1].serial, 2);
        assert_eq!(
            song.phrases[1].tracks[0].commands.commands,
            vec![Command::Delay { ticks: 0x30 }]
        );
        // only the first phrase is played
        assert_eq!(
            song.compositions[0].commands,
            vec![CompositionCommand::Play { phrase: 1 }]
        );
    }

    #[test]
    fn a_blank_table_is_recovered_by_its_size() {
        // a bare all-zero table at 0x70 has no stream behind it, so only
        // its exact size gives it away
        let mut bytes = vec![0u8; 0xB0];
        bytes[0x00..0x04].copy_from_slice(b"BGM ");
        bytes[0x04..0x08].copy_from_slice(&0xB0u32.to_be_bytes());
        bytes[0x08..0x0C].copy_from_slice(b"BLNK");
        bytes[0x10] = 4;
        bytes[0x14..0x16].copy_from_slice(&9u16.to_be_bytes());
        bytes[0x24..0x28].copy_from_slice(&0x1000_0002u32.to_be_bytes());
        bytes[0x2C..0x30].copy_from_slice(&0x0040_2100u32.to_be_bytes());
        bytes[0x6C] = 0x60;

        let song = Song::from_bytes(&bytes).expect("song rejected");
        assert_eq!(song.phrases.len(), 2);
        assert_eq!(song.phrases[1].file_pos, 0x70);
        assert!(song.phrases[1].tracks.iter().all(|track| !track.enabled));
    }

    #[test]
    fn text_form_round_trips() {
        let mut song = sample_song();
        let bytes = song.to_vec().expect("song rejected");
        let decoded = Song::from_bytes(&bytes).expect("song rejected");

        let text = decoded.to_text().expect("serialization failed");
        let mut reloaded = Song::from_text(&text).expect("text rejected");
        assert_eq!(reloaded.to_vec().expect("song rejected"), bytes);
    }

    #[test]
    fn unknown_play_targets_are_rejected() {
        let mut song = sample_song();
        song.compositions[0].commands[0] = CompositionCommand::Play { phrase: 99 };
        assert_eq!(
            song.to_vec(),
            Err(ToBytesError::Reference(ReferenceError::UnknownPhrase {
                composition: 0,
                serial: 99
            }))
        );
    }

    #[test]
    fn authored_branch_options_must_fill_the_measure() {
        let mut song = sample_song();
        song.phrases[0].tracks[2].branches[0].options[1] = CommandStream {
            commands: vec![Command::Delay { ticks: 0x30 }],
            ..Default::default()
        };
        let text = song.to_text().expect("serialization failed");
        assert!(matches!(
            Song::from_text(&text),
            Err(FromTextError::Structure(
                StructuralError::BranchOptionDuration {
                    expected: 96,
                    found: 48
                }
            ))
        ));
    }

    #[test]
    fn authored_copies_must_point_at_an_earlier_track() {
        let mut song = sample_song();
        song.phrases[0].tracks[1].copy_of = Some(5);
        let text = song.to_text().expect("serialization failed");
        assert!(matches!(
            Song::from_text(&text),
            Err(FromTextError::Reference(ReferenceError::BadCopyOf {
                track: 1,
                copy_of: 5,
                ..
            }))
        ));
    }

    #[test]
    fn header_must_carry_the_magic() {
        let mut bytes = reference_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Song::from_bytes(&bytes),
            Err(FromBytesError::Format(FormatError::BadMagic { .. }))
        ));
    }

    #[test]
    fn reserved_header_bytes_must_be_zero() {
        let mut bytes = reference_bytes();
        bytes[0x0C] = 1;
        assert!(matches!(
            Song::from_bytes(&bytes),
            Err(FromBytesError::Format(FormatError::ReservedNotZero {
                offset: 0x0C,
                ..
            }))
        ));
    }

    #[test]
    fn branch_measures_must_fit_one_delay_byte() {
        let mut song = sample_song();
        song.branch_measure = 0x100;
        assert_eq!(
            song.to_vec(),
            Err(ToBytesError::Structure(
                StructuralError::BranchMeasureOutOfRange { ticks: 0x100 }
            ))
        );
    }

    #[test]
    fn detour_length_overflow_round_trips() {
        let mut song = sample_song();
        song.phrases[0].tracks[0].detours[0].commands.commands =
            vec![Command::Delay { ticks: 1 }; 256];
        let bytes = song.to_vec().expect("song rejected");

        let decoded = Song::from_bytes(&bytes).expect("song rejected");
        let detour = &decoded.phrases[0].tracks[0].detours[0];
        assert!(detour.bugged);
        assert_eq!(detour.commands.commands.len(), 256);

        song.phrases[0].tracks[0].detours[0].commands.commands =
            vec![Command::Delay { ticks: 1 }; 257];
        assert_eq!(
            song.to_vec(),
            Err(ToBytesError::Structure(StructuralError::DetourTooLong {
                len: 257
            }))
        );
    }
}
