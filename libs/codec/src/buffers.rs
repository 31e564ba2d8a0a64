//! Field-level readers and writers for AMQP argument lists
//!
//! All integers are big-endian. Short strings carry a one-octet length, long
//! strings a four-octet length. Consecutive bit arguments share one octet,
//! least significant bit first.

use crate::error::{ProtocolError, ProtocolResult};
use crate::table::{self, FieldTable};
use bytes::{BufMut, Bytes, BytesMut};

/// Cursor over a frame payload
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize, context: &'static str) -> ProtocolResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::truncated(context, len, self.remaining()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self, context: &'static str) -> ProtocolResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, context)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ProtocolResult<u8> {
        Ok(self.read_array::<1>("octet")?[0])
    }

    pub fn read_u16(&mut self) -> ProtocolResult<u16> {
        Ok(u16::from_be_bytes(self.read_array("short")?))
    }

    pub fn read_u32(&mut self) -> ProtocolResult<u32> {
        Ok(u32::from_be_bytes(self.read_array("long")?))
    }

    pub fn read_u64(&mut self) -> ProtocolResult<u64> {
        Ok(u64::from_be_bytes(self.read_array("longlong")?))
    }

    /// Read one octet of packed bits, least significant first
    pub fn read_bits<const N: usize>(&mut self) -> ProtocolResult<[bool; N]> {
        let octet = self.read_u8()?;
        let mut bits = [false; N];
        for (i, bit) in bits.iter_mut().enumerate() {
            *bit = octet & (1 << i) != 0;
        }
        Ok(bits)
    }

    pub fn read_short_str(&mut self) -> ProtocolResult<String> {
        let len = self.read_u8()? as usize;
        let raw = self.read_bytes(len, "short string")?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 {
            context: "short string",
        })
    }

    pub fn read_long_bytes(&mut self) -> ProtocolResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.read_bytes(len, "long string")?.to_vec())
    }

    /// Long string decoded as UTF-8, replacing invalid sequences
    pub fn read_long_str_lossy(&mut self) -> ProtocolResult<String> {
        Ok(String::from_utf8_lossy(&self.read_long_bytes()?).into_owned())
    }

    pub fn read_table(&mut self) -> ProtocolResult<FieldTable> {
        let len = self.read_u32()? as usize;
        let raw = self.read_bytes(len, "field table")?;
        table::decode_table_body(raw)
    }
}

/// Growable argument-list writer
#[derive(Debug, Default)]
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Pack up to eight consecutive bit arguments into one octet
    pub fn put_bits(&mut self, bits: &[bool]) {
        debug_assert!(bits.len() <= 8);
        let octet = bits
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, bit)| if *bit { acc | (1 << i) } else { acc });
        self.buf.put_u8(octet);
    }

    pub fn put_short_str(&mut self, s: &str, context: &'static str) -> ProtocolResult<()> {
        if s.len() > u8::MAX as usize {
            return Err(ProtocolError::ShortStringTooLong {
                len: s.len(),
                context,
            });
        }
        self.buf.put_u8(s.len() as u8);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub fn put_long_bytes(&mut self, data: &[u8]) {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
    }

    pub fn put_table(&mut self, table: &FieldTable) -> ProtocolResult<()> {
        let mut body = FieldWriter::new();
        table::encode_table_body(table, &mut body)?;
        self.put_long_bytes(&body.buf);
        Ok(())
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_packing_lsb_first() {
        let mut w = FieldWriter::new();
        w.put_bits(&[true, false, true]);
        assert_eq!(w.as_slice(), &[0b0000_0101]);

        let bytes = w.into_bytes();
        let mut r = FieldReader::new(&bytes);
        assert_eq!(r.read_bits::<3>().unwrap(), [true, false, true]);
    }

    #[test]
    fn test_short_string_limit() {
        let mut w = FieldWriter::new();
        let long = "x".repeat(256);
        assert!(matches!(
            w.put_short_str(&long, "queue"),
            Err(ProtocolError::ShortStringTooLong { len: 256, .. })
        ));
    }

    #[test]
    fn test_truncated_read() {
        let mut r = FieldReader::new(&[0x00, 0x01]);
        assert!(matches!(
            r.read_u32(),
            Err(ProtocolError::Truncated { need: 4, got: 2, .. })
        ));
    }

    #[test]
    fn test_strings_are_length_prefixed() {
        let mut w = FieldWriter::new();
        w.put_short_str("/test", "vhost").unwrap();
        w.put_long_bytes(b"\0guest\0guest");
        assert_eq!(&w.as_slice()[..6], b"\x05/test");
        assert_eq!(&w.as_slice()[6..10], &[0, 0, 0, 12]);
    }
}
