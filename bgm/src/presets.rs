//! The drum and instrument preset tables from the sequence header
//!
//! Both tables are plain arrays of fixed-size records sitting right after
//! the header, drums first. The sequence data proper only refers to them by
//! index, so the records round-trip as-is.

use crate::bytes::{Reader, Writer};
use crate::error::FormatError;
use serde::{Deserialize, Serialize};

/// A drum kit entry: a sampler patch plus per-hit randomization ranges
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrumPreset {
    pub bank: u8,
    pub patch: u8,
    pub key_base: u16,
    pub volume: u8,
    pub pan: i8,
    pub reverb: u8,
    pub rand_tune: u8,
    pub rand_volume: u8,
    pub rand_pan: u8,
    pub rand_reverb: u8,
}

impl DrumPreset {
    /// The number of bytes a drum record occupies in the file
    pub const LEN: u32 = 12;

    pub(crate) fn read(reader: &mut Reader) -> Result<Self, FormatError> {
        let preset = Self {
            bank: reader.read_u8()?,
            patch: reader.read_u8()?,
            key_base: reader.read_u16()?,
            volume: reader.read_u8()?,
            pan: reader.read_i8()?,
            reverb: reader.read_u8()?,
            rand_tune: reader.read_u8()?,
            rand_volume: reader.read_u8()?,
            rand_pan: reader.read_u8()?,
            rand_reverb: reader.read_u8()?,
        };
        read_pad(reader)?;
        Ok(preset)
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.bank);
        writer.write_u8(self.patch);
        writer.write_u16(self.key_base);
        writer.write_u8(self.volume);
        writer.write_i8(self.pan);
        writer.write_u8(self.reverb);
        writer.write_u8(self.rand_tune);
        writer.write_u8(self.rand_volume);
        writer.write_u8(self.rand_pan);
        writer.write_u8(self.rand_reverb);
        writer.write_u8(0);
    }
}

/// A melodic instrument entry: patch selection plus mix and tuning defaults
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentPreset {
    pub bank: u8,
    pub patch: u8,
    pub volume: u8,
    pub pan: i8,
    pub reverb: u8,
    pub coarse_tune: i8,
    pub fine_tune: i8,
}

impl InstrumentPreset {
    /// The number of bytes an instrument record occupies in the file
    pub const LEN: u32 = 8;

    pub(crate) fn read(reader: &mut Reader) -> Result<Self, FormatError> {
        let preset = Self {
            bank: reader.read_u8()?,
            patch: reader.read_u8()?,
            volume: reader.read_u8()?,
            pan: reader.read_i8()?,
            reverb: reader.read_u8()?,
            coarse_tune: reader.read_i8()?,
            fine_tune: reader.read_i8()?,
        };
        read_pad(reader)?;
        Ok(preset)
    }

    pub(crate) fn write(&self, writer: &mut Writer) {
        writer.write_u8(self.bank);
        writer.write_u8(self.patch);
        writer.write_u8(self.volume);
        writer.write_i8(self.pan);
        writer.write_u8(self.reverb);
        writer.write_i8(self.coarse_tune);
        writer.write_i8(self.fine_tune);
        writer.write_u8(0);
    }
}

fn read_pad(reader: &mut Reader) -> Result<(), FormatError> {
    let offset = reader.position();
    let value = reader.read_u8()?;
    if value != 0 {
        return Err(FormatError::PresetPadNotZero { offset, value });
    }
    Ok(())
}
