//! Utilities for decoding from and encoding into bytes.
//!
//! This module defines the (de)serialization traits [`ToBytes`] and [`FromBytes`], as well as the
//! helper structs [`ByteWriter`] and [`ByteReader`], which wrap a `&mut [u8]` or `&[u8]` and offer
//! useful utilities to read and write values.
//!
//! Everything that crosses a link implements these traits: L2CAP frames, and the Security Manager
//! commands carried inside them.
//!
//! # Byte order
//!
//! Multi-byte integers are little-endian on the wire. Keys, nonces and MAC values are also sent LSB
//! first, but the cryptographic toolbox works on their big-endian representation. The
//! [`ByteReader::read_reversed`] and [`ByteWriter::write_reversed`] methods convert between the
//! two, so decoded PDU fields always hold big-endian values.
//!
//! [`ToBytes`]: trait.ToBytes.html
//! [`FromBytes`]: trait.FromBytes.html
//! [`ByteWriter`]: struct.ByteWriter.html
//! [`ByteReader`]: struct.ByteReader.html

use crate::{utils::swapped, Error};
use core::mem;

/// Wrapper around a byte slice that can be used to encode data into bytes.
///
/// All `write_*` methods on this type will return `Error::Eof` when the underlying buffer slice is
/// full.
pub struct ByteWriter<'a>(&'a mut [u8]);

impl<'a> ByteWriter<'a> {
    /// Creates a writer that will write to `buf`.
    pub fn new(buf: &'a mut [u8]) -> Self {
        ByteWriter(buf)
    }

    /// Consumes `self` and returns the part of the contained buffer that has not yet been written
    /// to.
    pub fn into_rest(self) -> &'a mut [u8] {
        self.0
    }

    /// Returns the number of bytes that can be written to `self` until it is full.
    pub fn space_left(&self) -> usize {
        self.0.len()
    }

    /// Writes all bytes from `other` to `self`.
    ///
    /// Returns `Error::Eof` when `self` does not have enough space left to fit `other`. In that
    /// case, `self` will not be modified.
    pub fn write_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if self.space_left() < other.len() {
            Err(Error::Eof)
        } else {
            self.0[..other.len()].copy_from_slice(other);
            let this = mem::take(&mut self.0);
            self.0 = &mut this[other.len()..];
            Ok(())
        }
    }

    /// Writes `value` to `self` in reverse byte order.
    ///
    /// Used for keys, nonces and MACs, which are kept big-endian in memory but sent LSB first.
    pub fn write_reversed<const N: usize>(&mut self, value: &[u8; N]) -> Result<(), Error> {
        self.write_slice(&swapped(*value))
    }

    /// Writes a single byte to `self`.
    ///
    /// Returns `Error::Eof` when no space is left.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.write_slice(&[byte])
    }

    /// Writes a `u16` to `self`, using Little Endian byte order.
    ///
    /// If `self` does not have enough space left, an error will be returned and no bytes will be
    /// written to `self`.
    pub fn write_u16_le(&mut self, value: u16) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }

    /// Writes a `u64` to `self`, using Little Endian byte order.
    pub fn write_u64_le(&mut self, value: u64) -> Result<(), Error> {
        self.write_slice(&value.to_le_bytes())
    }
}

/// Allows reading values from a borrowed byte slice.
pub struct ByteReader<'a>(&'a [u8]);

impl<'a> ByteReader<'a> {
    /// Creates a new `ByteReader` that will read from the given byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteReader(bytes)
    }

    /// Returns the number of bytes that can still be read from `self`.
    pub fn bytes_left(&self) -> usize {
        self.0.len()
    }

    /// Returns whether `self` is at the end of the underlying buffer (EOF).
    ///
    /// If this returns `true`, no data can be read from `self` anymore.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reads a byte slice of length `len` from `self`.
    ///
    /// If `self` contains less than `len` bytes, `Error::Eof` will be returned and `self` will not
    /// be modified.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.bytes_left() < len {
            Err(Error::Eof)
        } else {
            let slice = &self.0[..len];
            self.0 = &self.0[len..];
            Ok(slice)
        }
    }

    /// Reads a fixed-size byte array from `self`.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut buf = [0; N];
        buf.copy_from_slice(self.read_slice(N)?);
        Ok(buf)
    }

    /// Reads a fixed-size byte array sent LSB first and returns it in big-endian order.
    pub fn read_reversed<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        self.read_array().map(swapped)
    }

    /// Reads the remaining bytes from `self`.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.0;
        self.0 = &[];
        rest
    }

    /// Reads a single byte from `self`.
    ///
    /// Returns `Error::Eof` when `self` is empty.
    pub fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Reads a `u16` from `self`, using Little Endian byte order.
    pub fn read_u16_le(&mut self) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Reads a `u64` from `self`, using Little Endian byte order.
    pub fn read_u64_le(&mut self) -> Result<u64, Error> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Fails with `Error::IncompleteParse` unless every byte of the input was consumed.
    pub fn finish(&self) -> Result<(), Error> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::IncompleteParse)
        }
    }
}

/// Trait for encoding a value into a byte buffer.
pub trait ToBytes {
    /// Converts `self` to bytes and writes them into `writer`, advancing `writer` to point past the
    /// encoded value.
    ///
    /// If `writer` does not contain enough space, an error will be returned and the state of the
    /// buffer is unspecified (eg. `self` may be partially written into `writer`).
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error>;
}

/// Trait for decoding values from a byte slice.
pub trait FromBytes<'a>: Sized {
    /// Decode a `Self` from a byte slice, advancing `bytes` to point past the data that was read.
    ///
    /// If `bytes` contains data not valid for the target type, or contains an insufficient number
    /// of bytes, an error will be returned and the state of `bytes` is unspecified (it can point to
    /// arbitrary data).
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error>;
}

/// Encodes `value` into a stack buffer holding at most `N` bytes.
pub fn encode<T: ToBytes + ?Sized, const N: usize>(
    value: &T,
) -> Result<heapless::Vec<u8, N>, Error> {
    let mut buf = [0; N];
    let mut writer = ByteWriter::new(&mut buf);
    value.to_bytes(&mut writer)?;
    let used = N - writer.space_left();
    heapless::Vec::from_slice(&buf[..used]).map_err(|()| Error::Eof)
}

impl<'a> ToBytes for &'a [u8] {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(*self)
    }
}

impl<'a> FromBytes<'a> for &'a [u8] {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(bytes.read_rest())
    }
}

impl<'a> FromBytes<'a> for u8 {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        bytes.read_u8()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_fields() {
        let wire = [0x01, 0x02, 0x03, 0x04];
        let mut reader = ByteReader::new(&wire);
        let value: [u8; 4] = reader.read_reversed().unwrap();
        assert_eq!(value, [0x04, 0x03, 0x02, 0x01]);
        assert!(reader.finish().is_ok());

        let mut buf = [0; 4];
        let mut writer = ByteWriter::new(&mut buf);
        writer.write_reversed(&value).unwrap();
        assert_eq!(writer.space_left(), 0);
        assert_eq!(buf, wire);
    }

    #[test]
    fn eof_leaves_reader_untouched() {
        let mut reader = ByteReader::new(&[0xAA, 0xBB]);
        assert_eq!(reader.read_array::<3>(), Err(Error::Eof));
        assert_eq!(reader.read_u16_le(), Ok(0xBBAA));
        assert_eq!(reader.read_u8(), Err(Error::Eof));
    }

    #[test]
    fn trailing_data() {
        let mut reader = ByteReader::new(&[1, 2]);
        reader.read_u8().unwrap();
        assert_eq!(reader.finish(), Err(Error::IncompleteParse));
    }

    #[test]
    fn encode_into_vec() {
        let data: &[u8] = &[1, 2, 3];
        let vec = encode::<_, 8>(&data).unwrap();
        assert_eq!(&vec[..], &[1, 2, 3]);
        assert_eq!(encode::<_, 2>(&data), Err(Error::Eof));
    }
}
