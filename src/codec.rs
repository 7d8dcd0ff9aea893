//! Bounded little-endian reading and writing shared by every wire structure of the
//! management layer. Reads never panic: running past the end of the buffer yields
//! `ProtocolError::Truncated` naming the field being decoded.

use crate::error::ProtocolError;

/// Cursor over an untrusted byte buffer.
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    pub fn read_bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::Truncated {
                field,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, field)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.read_array::<1>(field)?[0])
    }

    pub fn read_u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.read_array(field)?))
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.read_array(field)?))
    }

    pub fn read_i64(&mut self, field: &'static str) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.read_array(field)?))
    }

    /// Reads a field prefixed by its 16-bit little-endian length.
    pub fn read_prefixed(&mut self, field: &'static str) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_u16(field)? as usize;
        self.read_bytes(len, field)
    }

    pub fn read_prefixed_string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let bytes = self.read_prefixed(field)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    /// Everything not consumed yet.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }
}

/// Appends `bytes` behind a 16-bit little-endian length prefix.
pub fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8], field: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: bytes.len(),
        max: u16::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Appends `bytes` behind a 32-bit little-endian length prefix.
pub fn put_prefixed_u32(out: &mut Vec<u8>, bytes: &[u8], field: &'static str) -> Result<(), ProtocolError> {
    let len = u32::try_from(bytes.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: bytes.len(),
        max: u32::MAX as usize,
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Cuts `value` down to at most `max` characters.
pub fn truncate_chars(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
