//! TLV (type-length-value) codec.
//!
//! ```text
//! +------+-----------+-----------------+
//! | type | len (LE)  | value[len]      |
//! +------+-----------+-----------------+
//! ```
//!
//! Fixed-width integers are stored in their native little-endian layout.
//! Decoding never writes more than the caller's bound but always consumes the
//! declared length, so the stream stays aligned on the next field.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{TLV_HEAD_SIZE, TLV_MAX_DATA_LENGTH};
use crate::error::{OtaError, ProtocolViolation};
use crate::transport::{ByteSource, TransportError};

/// Value carried by a TLV field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvValue<'a> {
    U8(u8),
    U16(u16),
    U32(u32),
    Bytes(&'a [u8]),
}

impl TlvValue<'_> {
    pub fn len(&self) -> usize {
        match self {
            TlvValue::U8(_) => 1,
            TlvValue::U16(_) => 2,
            TlvValue::U32(_) => 4,
            TlvValue::Bytes(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append one encoded TLV field to `out`.
pub fn encode(kind: u8, value: TlvValue<'_>, out: &mut Vec<u8>) -> Result<(), ProtocolViolation> {
    let len = value.len();
    if len > TLV_MAX_DATA_LENGTH as usize {
        return Err(ProtocolViolation::TlvOverrun {
            declared: len,
            remaining: TLV_MAX_DATA_LENGTH as usize,
        });
    }

    let mut head = [0u8; TLV_HEAD_SIZE];
    head[0] = kind;
    LittleEndian::write_u16(&mut head[1..3], len as u16);
    out.extend_from_slice(&head);

    match value {
        TlvValue::U8(v) => out.push(v),
        TlvValue::U16(v) => {
            let mut b = [0u8; 2];
            LittleEndian::write_u16(&mut b, v);
            out.extend_from_slice(&b);
        }
        TlvValue::U32(v) => {
            let mut b = [0u8; 4];
            LittleEndian::write_u32(&mut b, v);
            out.extend_from_slice(&b);
        }
        TlvValue::Bytes(b) => out.extend_from_slice(b),
    }
    Ok(())
}

/// Encode a single TLV field into a fresh buffer.
pub fn encode_to_vec(kind: u8, value: TlvValue<'_>) -> Result<Vec<u8>, ProtocolViolation> {
    let mut out = Vec::with_capacity(TLV_HEAD_SIZE + value.len());
    encode(kind, value, &mut out)?;
    Ok(out)
}

/// TLV header (type + declared length).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvHeader {
    pub kind: u8,
    pub len: u16,
}

impl TlvHeader {
    pub const SIZE: usize = TLV_HEAD_SIZE;

    /// Total bytes the field occupies on the wire.
    pub fn wire_len(&self) -> usize {
        Self::SIZE + self.len as usize
    }
}

/// Read a TLV header off the stream.
pub fn decode_header<S: ByteSource + ?Sized>(source: &mut S) -> Result<TlvHeader, TransportError> {
    let kind = source.read_u8()?;
    let len = source.read_u16_le()?;
    Ok(TlvHeader { kind, len })
}

/// Read the value of `header`, keeping at most `max_len` bytes.
///
/// The stream always advances by the declared length.
pub fn decode_value<S: ByteSource + ?Sized>(
    source: &mut S,
    header: &TlvHeader,
    max_len: usize,
) -> Result<Vec<u8>, TransportError> {
    let declared = header.len as usize;
    let keep = declared.min(max_len);
    let mut value = vec![0u8; keep];
    source.read_exact(&mut value)?;
    source.skip(declared - keep)?;
    Ok(value)
}

/// Reader over the parameter block of one command.
///
/// Tracks how much of the declared parameter length is left so that no
/// field can run past the end of the command.
pub struct ParamReader<'a, S: ByteSource + ?Sized> {
    source: &'a mut S,
    remaining: usize,
}

impl<'a, S: ByteSource + ?Sized> ParamReader<'a, S> {
    pub fn new(source: &'a mut S, param_len: u16) -> Self {
        Self {
            source,
            remaining: param_len as usize,
        }
    }

    /// Parameter bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn consume(&mut self, count: usize) -> Result<(), ProtocolViolation> {
        if count > self.remaining {
            return Err(ProtocolViolation::TlvOverrun {
                declared: count,
                remaining: self.remaining,
            });
        }
        self.remaining -= count;
        Ok(())
    }

    /// Next TLV header, or `None` once the parameter block is exhausted.
    pub fn next_header(&mut self) -> Result<Option<TlvHeader>, OtaError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.consume(TlvHeader::SIZE)?;
        let header = decode_header(self.source)?;
        if header.len as usize > self.remaining {
            return Err(ProtocolViolation::TlvOverrun {
                declared: header.len as usize,
                remaining: self.remaining,
            }
            .into());
        }
        Ok(Some(header))
    }

    /// Value of a field whose header was just read, bounded by `max_len`.
    pub fn read_value(&mut self, header: &TlvHeader, max_len: usize) -> Result<Vec<u8>, OtaError> {
        self.consume(header.len as usize)?;
        Ok(decode_value(self.source, header, max_len)?)
    }

    /// Integer value of a field, read with the native little-endian layout.
    ///
    /// Shorter fields are zero-extended; longer fields are truncated.
    pub fn read_uint(&mut self, header: &TlvHeader, width: usize) -> Result<u32, OtaError> {
        let value = self.read_value(header, width.min(4))?;
        let mut raw = [0u8; 4];
        raw[..value.len()].copy_from_slice(&value);
        Ok(LittleEndian::read_u32(&raw))
    }

    /// Discard the value of a field whose header was just read.
    pub fn skip_value(&mut self, header: &TlvHeader) -> Result<(), OtaError> {
        self.consume(header.len as usize)?;
        self.source.skip(header.len as usize)?;
        Ok(())
    }

    /// Read the next field, requiring it to be of type `kind`.
    pub fn expect_uint(&mut self, kind: u8, width: usize) -> Result<u32, OtaError> {
        let header = self.next_header()?.ok_or(ProtocolViolation::TlvOverrun {
            declared: TlvHeader::SIZE,
            remaining: 0,
        })?;
        if header.kind != kind {
            self.skip_value(&header)?;
            return Err(ProtocolViolation::UnexpectedTlv {
                expected: kind,
                actual: header.kind,
            }
            .into());
        }
        self.read_uint(&header, width)
    }

    /// Raw bytes outside any TLV (image data payload).
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<(), OtaError> {
        self.consume(buf.len())?;
        self.source.read_exact(buf)?;
        Ok(())
    }

    pub fn read_raw_u8(&mut self) -> Result<u8, OtaError> {
        let mut b = [0u8; 1];
        self.read_raw(&mut b)?;
        Ok(b[0])
    }

    pub fn read_raw_u32(&mut self) -> Result<u32, OtaError> {
        let mut b = [0u8; 4];
        self.read_raw(&mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }

    /// Discard whatever is left of the parameter block.
    pub fn skip_rest(&mut self) -> Result<usize, OtaError> {
        let left = self.remaining;
        self.source.skip(left)?;
        self.remaining = 0;
        Ok(left)
    }
}
