//! The four-character song name stored in the sequence header
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{fmt, str};
use thiserror::Error;

/// A fixed-width, space-padded song name
///
/// The header reserves exactly four bytes for the name; shorter names are
/// padded with trailing spaces on disk and trimmed again for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SongName {
    bytes: [u8; Self::LEN],
}

impl SongName {
    /// The number of bytes a name occupies in the header
    pub const LEN: usize = 4;

    /// Try to convert the raw header bytes to a name
    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Result<Self, NameFromBytesError> {
        for (index, byte) in bytes.iter().enumerate() {
            if !Self::is_byte_allowed(*byte) {
                return Err(NameFromBytesError {
                    byte: *byte,
                    index,
                });
            }
        }

        Ok(Self { bytes })
    }

    /// Build a name from authored text, padding and truncating as needed
    ///
    /// Over-long input is truncated to the four characters that fit, with a
    /// warning on the log.
    pub fn from_str_lossy(name: &str) -> Result<Self, NameFromBytesError> {
        if name.len() > Self::LEN {
            log::warn!(
                "song name {name:?} is longer than {} characters, truncating",
                Self::LEN
            );
        }

        let mut dest = [b' '; Self::LEN];
        for (index, byte) in name.bytes().take(Self::LEN).enumerate() {
            if !Self::is_byte_allowed(byte) {
                return Err(NameFromBytesError { byte, index });
            }
            dest[index] = byte;
        }

        Ok(Self { bytes: dest })
    }

    /// Access the underlying, space-padded header bytes
    pub fn bytes(&self) -> &[u8; Self::LEN] {
        &self.bytes
    }

    /// The number of characters before the trailing padding
    pub fn len(&self) -> usize {
        self.bytes
            .iter()
            .rposition(|byte| *byte != b' ')
            .map_or(0, |index| index + 1)
    }

    /// Are there _any_ characters in the name?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The name without its trailing padding
    pub fn as_str(&self) -> &str {
        // SAFETY: Safe, because from_bytes/from_str_lossy only let printable
        // ASCII through
        unsafe { str::from_utf8_unchecked(&self.bytes[..self.len()]) }
    }

    /// Is a specific byte usable in a name?
    pub fn is_byte_allowed(byte: u8) -> bool {
        // printable ASCII, space included for the padding
        (0x20..=0x7E).contains(&byte)
    }
}

impl Default for SongName {
    fn default() -> Self {
        Self {
            bytes: [b' '; Self::LEN],
        }
    }
}

impl fmt::Display for SongName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for SongName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SongName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Self::from_str_lossy(&text).map_err(de::Error::custom)
    }
}

/// An error describing what could go wrong converting bytes to a [`SongName`]
#[derive(Debug, Error, PartialEq, Eq)]
#[error("byte {byte:#04x} at position {index} is not allowed in a name")]
pub struct NameFromBytesError {
    pub byte: u8,
    pub index: usize,
}
