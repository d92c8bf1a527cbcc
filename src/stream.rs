//! Little-endian marshaling streams for the binary endpoint encoding.
//!
//! Only what endpoint marshaling needs is here: fixed-width integers,
//! booleans, sizes, strings, raw blobs and encapsulations. An
//! encapsulation is a `size:i32` (covering its own 6-byte header) followed
//! by the encoding version and the body.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Version of the binary encoding used inside an encapsulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EncodingVersion {
    pub major: u8,
    pub minor: u8,
}

impl EncodingVersion {
    pub const V1_0: Self = Self { major: 1, minor: 0 };
    pub const V1_1: Self = Self { major: 1, minor: 1 };

    /// Parses `major.minor`.
    pub fn parse(text: &str) -> Option<Self> {
        let (major, minor) = text.split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl Default for EncodingVersion {
    fn default() -> Self {
        Self::V1_1
    }
}

impl fmt::Display for EncodingVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

const ENCAPS_HEADER: usize = 6;

/// Growable output stream.
#[derive(Debug, Default)]
pub struct OutputStream {
    buf: BytesMut,
    encoding: EncodingVersion,
    encaps: Vec<(usize, EncodingVersion)>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoding(encoding: EncodingVersion) -> Self {
        Self {
            encoding,
            ..Self::default()
        }
    }

    /// Encoding of the innermost open encapsulation, or of the stream.
    pub fn encoding(&self) -> EncodingVersion {
        self.encaps
            .last()
            .map(|(_, encoding)| *encoding)
            .unwrap_or(self.encoding)
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buf.put_i16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    /// Writes a size: one byte below 255, otherwise `255` then an `i32`.
    pub fn write_size(&mut self, size: usize) {
        if size < 255 {
            self.buf.put_u8(size as u8);
        } else {
            self.buf.put_u8(255);
            self.buf.put_i32_le(size as i32);
        }
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_size(value.len());
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_blob(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn start_encapsulation(&mut self, encoding: EncodingVersion) {
        self.encaps.push((self.buf.len(), encoding));
        self.buf.put_i32_le(0);
        self.buf.put_u8(encoding.major);
        self.buf.put_u8(encoding.minor);
    }

    /// Closes the innermost encapsulation and back-patches its size.
    pub fn end_encapsulation(&mut self) {
        if let Some((start, _)) = self.encaps.pop() {
            let size = (self.buf.len() - start) as i32;
            self.buf[start..start + 4].copy_from_slice(&size.to_le_bytes());
        }
    }

    /// Writes an empty encapsulation of `encoding`.
    pub fn write_empty_encapsulation(&mut self, encoding: EncodingVersion) {
        self.start_encapsulation(encoding);
        self.end_encapsulation();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finished(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Read-only input stream over a byte slice.
#[derive(Debug)]
pub struct InputStream {
    buf: Bytes,
    encoding: EncodingVersion,
    encaps: Vec<(usize, EncodingVersion)>,
    initial: usize,
}

impl InputStream {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let buf = data.into();
        let initial = buf.len();
        Self {
            buf,
            encoding: EncodingVersion::default(),
            encaps: Vec::new(),
            initial,
        }
    }

    pub fn encoding(&self) -> EncodingVersion {
        self.encaps
            .last()
            .map(|(_, encoding)| *encoding)
            .unwrap_or(self.encoding)
    }

    fn position(&self) -> usize {
        self.initial - self.buf.remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, count: usize) -> Result<()> {
        if self.buf.remaining() < count {
            return Err(TransportError::marshal(format!(
                "unexpected end of stream: need {count} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16_le())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_size(&mut self) -> Result<usize> {
        let byte = self.read_u8()?;
        if byte < 255 {
            return Ok(byte as usize);
        }
        let size = self.read_i32()?;
        usize::try_from(size).map_err(|_| TransportError::marshal(format!("negative size {size}")))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let size = self.read_size()?;
        let bytes = self.read_blob(size)?;
        String::from_utf8(bytes).map_err(|e| TransportError::marshal(format!("invalid UTF-8: {e}")))
    }

    pub fn read_blob(&mut self, count: usize) -> Result<Vec<u8>> {
        self.need(count)?;
        let mut bytes = vec![0; count];
        self.buf.copy_to_slice(&mut bytes);
        Ok(bytes)
    }

    /// Opens an encapsulation and returns its encoding.
    pub fn start_encapsulation(&mut self) -> Result<EncodingVersion> {
        let start = self.position();
        let size = self.read_i32()?;
        if size < ENCAPS_HEADER as i32 {
            return Err(TransportError::marshal(format!(
                "invalid encapsulation size {size}"
            )));
        }
        let size = size as usize;
        if size - 4 > self.buf.remaining() {
            return Err(TransportError::marshal(format!(
                "encapsulation of {size} bytes exceeds the stream"
            )));
        }
        let encoding = EncodingVersion {
            major: self.read_u8()?,
            minor: self.read_u8()?,
        };
        self.encaps.push((start + size, encoding));
        Ok(encoding)
    }

    /// Closes the innermost encapsulation. Unread bytes are an error.
    pub fn end_encapsulation(&mut self) -> Result<()> {
        let Some((end, _)) = self.encaps.pop() else {
            return Err(TransportError::marshal("no open encapsulation"));
        };
        let position = self.position();
        if position != end {
            return Err(TransportError::marshal(format!(
                "encapsulation has {} unread bytes",
                end.saturating_sub(position)
            )));
        }
        Ok(())
    }

    /// Reads the remaining body of the open encapsulation as a blob, used
    /// for endpoints of unknown types. Returns the body and its encoding.
    pub fn read_encapsulation_body(&mut self) -> Result<(Vec<u8>, EncodingVersion)> {
        let Some((end, encoding)) = self.encaps.last().copied() else {
            return Err(TransportError::marshal("no open encapsulation"));
        };
        let count = end.saturating_sub(self.position());
        Ok((self.read_blob(count)?, encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_size_uses_escape_byte() {
        let mut out = OutputStream::new();
        out.write_size(300);
        let bytes = out.finished();
        assert_eq!(&bytes[..], &[255, 44, 1, 0, 0]);
        assert_eq!(InputStream::new(bytes).read_size().unwrap(), 300);
    }

    #[test]
    fn encapsulation_size_includes_header() {
        let mut out = OutputStream::new();
        out.start_encapsulation(EncodingVersion::V1_0);
        out.write_i32(7);
        out.end_encapsulation();
        let bytes = out.finished();
        assert_eq!(&bytes[..6], &[10, 0, 0, 0, 1, 0]);

        let mut input = InputStream::new(bytes);
        assert_eq!(input.start_encapsulation().unwrap(), EncodingVersion::V1_0);
        assert_eq!(input.read_i32().unwrap(), 7);
        input.end_encapsulation().unwrap();
    }

    #[test]
    fn unread_encapsulation_bytes_are_rejected() {
        let mut out = OutputStream::new();
        out.start_encapsulation(EncodingVersion::V1_1);
        out.write_i32(7);
        out.end_encapsulation();

        let mut input = InputStream::new(out.finished());
        input.start_encapsulation().unwrap();
        assert!(input.end_encapsulation().is_err());
    }

    #[test]
    fn truncated_input_is_a_marshal_error() {
        let mut input = InputStream::new(vec![1u8, 2]);
        assert!(matches!(
            input.read_i32(),
            Err(TransportError::Marshal { .. })
        ));
    }
}
