//! Little-endian field codec for record bodies
//!
//! Strings and blobs are `u32` length-prefixed. Every read is bounds checked and
//! reports a protocol violation instead of panicking.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// Builder for a record body
#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: BytesMut,
}

impl BodyWriter {
    /// Create an empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a byte
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Append a little-endian `u32`
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    /// Append a little-endian `u64`
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    /// Append a little-endian `i64`
    pub fn put_i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64_le(value);
        self
    }

    /// Append a timestamp as unix milliseconds
    pub fn put_time(&mut self, value: &DateTime<Utc>) -> &mut Self {
        self.put_i64(value.timestamp_millis())
    }

    /// Append a length-prefixed UTF-8 string
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_blob(value.as_bytes())
    }

    /// Append a length-prefixed byte blob
    pub fn put_blob(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Finish the body
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked reader over a record body
#[derive(Debug)]
pub struct BodyReader {
    buf: Bytes,
    what: &'static str,
}

impl BodyReader {
    /// Read `buf`; `what` names the record in error messages
    pub fn new(buf: Bytes, what: &'static str) -> Self {
        Self { buf, what }
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(Error::protocol(format!(
                "Truncated {}: needed {} more bytes, {} left",
                self.what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Read a byte
    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a little-endian `u32`
    pub fn get_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    /// Read a little-endian `u64`
    pub fn get_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    /// Read a little-endian `i64`
    pub fn get_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    /// Read a timestamp stored as unix milliseconds
    pub fn get_time(&mut self) -> Result<DateTime<Utc>> {
        let millis = self.get_i64()?;
        DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
            Error::protocol(format!("{}: timestamp {} out of range", self.what, millis))
        })
    }

    /// Read a length-prefixed blob without copying
    pub fn get_blob(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.ensure(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn get_str(&mut self) -> Result<String> {
        let raw = self.get_blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol(format!("{}: string field is not UTF-8", self.what)))
    }

    /// Give back the unread bytes
    pub fn into_remaining(self) -> Bytes {
        self.buf
    }

    /// Require that every byte was consumed
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(Error::protocol(format!(
                "{}: {} trailing bytes, field count mismatch",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_read_back() {
        let mut writer = BodyWriter::new();
        writer
            .put_u8(7)
            .put_u32(1234)
            .put_i64(-5)
            .put_u64(99)
            .put_str("users/1")
            .put_blob(&[1, 2, 3]);
        let mut reader = BodyReader::new(writer.finish(), "test record");

        assert_eq!(reader.get_u8().unwrap(), 7);
        assert_eq!(reader.get_u32().unwrap(), 1234);
        assert_eq!(reader.get_i64().unwrap(), -5);
        assert_eq!(reader.get_u64().unwrap(), 99);
        assert_eq!(reader.get_str().unwrap(), "users/1");
        assert_eq!(reader.get_blob().unwrap().as_ref(), &[1, 2, 3]);
        reader.finish().unwrap();
    }

    #[test]
    fn test_truncated_is_protocol_violation() {
        let mut writer = BodyWriter::new();
        writer.put_u32(100).put_u8(1);
        let mut reader = BodyReader::new(writer.finish(), "document");

        let err = reader.get_str().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("Truncated document"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut writer = BodyWriter::new();
        writer.put_u8(1).put_u8(2);
        let mut reader = BodyReader::new(writer.finish(), "counter");
        reader.get_u8().unwrap();

        let err = reader.finish().unwrap_err();
        assert!(err.to_string().contains("field count mismatch"));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut writer = BodyWriter::new();
        writer.put_blob(&[0xff, 0xfe]);
        let mut reader = BodyReader::new(writer.finish(), "tombstone");
        assert!(matches!(reader.get_str(), Err(Error::Protocol(_))));
    }
}
