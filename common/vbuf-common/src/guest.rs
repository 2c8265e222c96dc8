//! Bounds-checked view over the console's flat RAM image
//!
//! RAM is stored as host-endian 32-bit words, the layout emulators use so that word accesses
//! from the CPU core are a plain load. Narrower accesses are swizzled to match: a 16-bit value at
//! guest address `A` lives at byte offset `A ^ 2` and an 8-bit value at `A ^ 3`.

use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("guest memory access out of range: address={address:06X}, len={len}")]
pub struct GuestMemoryError {
    pub address: u32,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct GuestMemory {
    ram: Box<[u8]>,
}

impl GuestMemory {
    /// Create a zero-filled RAM image. The length is rounded up to a whole number of words.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self { ram: vec![0; len.next_multiple_of(4)].into_boxed_slice() }
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut bytes = bytes;
        bytes.resize(bytes.len().next_multiple_of(4), 0);
        Self { ram: bytes.into_boxed_slice() }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.ram.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ram.is_empty()
    }

    /// Address of the last valid byte.
    #[inline]
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.ram.len().saturating_sub(1) as u32
    }

    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.ram
    }

    #[inline]
    #[must_use]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    fn range(&self, address: u32, len: usize) -> Result<Range<usize>, GuestMemoryError> {
        let start = address as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.ram.len() => Ok(start..end),
            _ => Err(GuestMemoryError { address, len }),
        }
    }

    /// Read a byte.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is outside of RAM.
    #[inline]
    pub fn read_u8(&self, address: u32) -> Result<u8, GuestMemoryError> {
        let range = self.range(address ^ 3, 1)?;
        Ok(self.ram[range.start])
    }

    /// Read a 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the value is outside of RAM.
    #[inline]
    pub fn read_u16(&self, address: u32) -> Result<u16, GuestMemoryError> {
        let range = self.range(address ^ 2, 2)?;
        Ok(u16::from_le_bytes([self.ram[range.start], self.ram[range.start + 1]]))
    }

    /// Read a 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the value is outside of RAM.
    #[inline]
    pub fn read_u32(&self, address: u32) -> Result<u32, GuestMemoryError> {
        let range = self.range(address, 4)?;
        let mut word = [0; 4];
        word.copy_from_slice(&self.ram[range]);
        Ok(u32::from_le_bytes(word))
    }

    /// Write a byte.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` is outside of RAM.
    #[inline]
    pub fn write_u8(&mut self, address: u32, value: u8) -> Result<(), GuestMemoryError> {
        let range = self.range(address ^ 3, 1)?;
        self.ram[range.start] = value;
        Ok(())
    }

    /// Write a 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the value is outside of RAM.
    #[inline]
    pub fn write_u16(&mut self, address: u32, value: u16) -> Result<(), GuestMemoryError> {
        let range = self.range(address ^ 2, 2)?;
        self.ram[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write a 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns an error if any byte of the value is outside of RAM.
    #[inline]
    pub fn write_u32(&mut self, address: u32, value: u32) -> Result<(), GuestMemoryError> {
        let range = self.range(address, 4)?;
        self.ram[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Borrow raw RAM bytes without any swizzling.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of RAM.
    pub fn slice(&self, address: u32, len: usize) -> Result<&[u8], GuestMemoryError> {
        let range = self.range(address, len)?;
        Ok(&self.ram[range])
    }

    /// Copy raw RAM bytes without any swizzling.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of RAM.
    pub fn read_bytes(&self, address: u32, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        dst.copy_from_slice(self.slice(address, dst.len())?);
        Ok(())
    }

    /// Overwrite raw RAM bytes without any swizzling.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of RAM.
    pub fn write_bytes(&mut self, address: u32, src: &[u8]) -> Result<(), GuestMemoryError> {
        let range = self.range(address, src.len())?;
        self.ram[range].copy_from_slice(src);
        Ok(())
    }

    /// Fill a raw byte range with `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of RAM.
    pub fn fill(&mut self, address: u32, len: usize, value: u8) -> Result<(), GuestMemoryError> {
        let range = self.range(address, len)?;
        self.ram[range].fill(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn narrow_accesses_are_swizzled_within_words() {
        let mut memory = GuestMemory::new(16);
        memory.write_u32(4, 0x11223344).unwrap();

        assert_eq!(0x11, memory.read_u8(4).unwrap());
        assert_eq!(0x44, memory.read_u8(7).unwrap());
        assert_eq!(0x1122, memory.read_u16(4).unwrap());
        assert_eq!(0x3344, memory.read_u16(6).unwrap());

        memory.write_u16(6, 0xABCD).unwrap();
        assert_eq!(0x1122ABCD, memory.read_u32(4).unwrap());
    }

    #[test]
    fn out_of_range_access_fails() {
        let mut memory = GuestMemory::new(8);

        assert_eq!(Err(GuestMemoryError { address: 6, len: 4 }), memory.read_u32(6));
        assert!(memory.write_u32(8, 0).is_err());
        assert!(memory.fill(4, 5, 0xFF).is_err());
        assert!(memory.read_u8(8).is_err());
        assert_eq!(7, memory.limit());
    }

    #[test]
    fn length_rounded_to_words() {
        assert_eq!(12, GuestMemory::new(9).len());
        assert_eq!(8, GuestMemory::from_bytes(vec![1, 2, 3, 4, 5]).len());
    }
}
