//! Big-endian byte cursors for the sequence container layout
//!
//! The format addresses its structures by absolute file offset, so both
//! directions work over random-access cursors: [`Reader`] wraps a borrowed
//! buffer with bounds-checked reads, [`Writer`] grows a buffer and can jump
//! back to patch placeholder fields once final offsets are known.

use crate::error::OutOfBoundsError;

/// Bounds-checked read cursor over a borrowed byte buffer
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub(crate) fn position(&self) -> u32 {
        self.position as u32
    }

    pub(crate) fn set_position(&mut self, position: u32) {
        self.position = position as usize;
    }

    pub(crate) fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// The whole underlying buffer, independent of the cursor
    pub(crate) fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], OutOfBoundsError> {
        match self.bytes.get(self.position..self.position + count) {
            Some(slice) => {
                self.position += count;
                Ok(slice)
            }
            None => Err(OutOfBoundsError {
                offset: self.position as u32,
                count: count as u32,
                len: self.bytes.len() as u32,
            }),
        }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, OutOfBoundsError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn read_i8(&mut self) -> Result<i8, OutOfBoundsError> {
        Ok(self.read_u8()? as i8)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, OutOfBoundsError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_i16(&mut self) -> Result<i16, OutOfBoundsError> {
        Ok(self.read_u16()? as i16)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, OutOfBoundsError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_slice(&mut self, count: u32) -> Result<&'a [u8], OutOfBoundsError> {
        self.take(count as usize)
    }
}

/// Growable write cursor with patch-back positioning
///
/// Writing past the current end extends the buffer; repositioning into
/// already-written territory overwrites in place. Gaps created by moving the
/// cursor beyond the end are zero-filled, which is what the format expects
/// from reserved fields and alignment padding.
#[derive(Default)]
pub(crate) struct Writer {
    bytes: Vec<u8>,
    position: usize,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn position(&self) -> u32 {
        self.position as u32
    }

    pub(crate) fn set_position(&mut self, position: u32) {
        self.position = position as usize;
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.bytes
    }

    fn put(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    pub(crate) fn write_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub(crate) fn write_i8(&mut self, value: i8) {
        self.write_u8(value as u8);
    }

    pub(crate) fn write_u16(&mut self, value: u16) {
        self.put(&value.to_be_bytes());
    }

    pub(crate) fn write_i16(&mut self, value: i16) {
        self.write_u16(value as u16);
    }

    pub(crate) fn write_u32(&mut self, value: u32) {
        self.put(&value.to_be_bytes());
    }

    pub(crate) fn write_slice(&mut self, bytes: &[u8]) {
        self.put(bytes);
    }

    /// Advance the cursor without touching existing bytes, zero-filling any
    /// stretch beyond the current end
    pub(crate) fn skip(&mut self, count: u32) {
        self.position += count as usize;
        if self.position > self.bytes.len() {
            self.bytes.resize(self.position, 0);
        }
    }

    /// Pad forward to the next multiple of `alignment`
    pub(crate) fn align(&mut self, alignment: u32) {
        let rem = self.position % alignment as usize;
        if rem != 0 {
            self.skip(alignment - rem as u32);
        }
    }
}
