//! Byte-stream transport abstraction.
//!
//! Defines the `OtaTransport` trait consumed by the protocol engine and the
//! `ByteSource` reader the codecs pull from, allowing different
//! implementations (radio stream, mock, simulated host).

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport not open")]
    NotOpen,

    #[error("Link disconnected")]
    Disconnected,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Unexpected end of stream: needed {needed} bytes, got {got}")]
    UnexpectedEof { needed: usize, got: usize },

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Abstract byte-stream transport (SPP, BLE or GATT-over-BR/EDR).
///
/// Reads block according to the transport's own timeout policy; the
/// protocol engine never preempts a read.
pub trait OtaTransport: Send + Sync {
    /// Open the stream for reading and writing.
    fn open(&self) -> Result<(), TransportError>;

    /// Close the stream.
    fn close(&self) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes. Returning `Ok(0)` means no data arrived
    /// within the transport's timeout.
    fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write a whole frame.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Number of bytes that can be read without blocking.
    fn available(&self) -> usize;

    /// Check if the link is still up.
    fn is_connected(&self) -> bool;
}

/// Exact-length reader used by the header and TLV codecs.
pub trait ByteSource {
    /// Fill `buf` completely or fail.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Consume and discard `count` bytes.
    fn skip(&mut self, mut count: usize) -> Result<(), TransportError> {
        let mut scratch = [0u8; 32];
        while count > 0 {
            let n = count.min(scratch.len());
            self.read_exact(&mut scratch[..n])?;
            count -= n;
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, TransportError> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_u16_le(&mut self) -> Result<u16, TransportError> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(LittleEndian::read_u16(&b))
    }

    fn read_u32_le(&mut self) -> Result<u32, TransportError> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(LittleEndian::read_u32(&b))
    }
}

impl ByteSource for &[u8] {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if self.len() < buf.len() {
            return Err(TransportError::UnexpectedEof {
                needed: buf.len(),
                got: self.len(),
            });
        }
        let (head, tail) = self.split_at(buf.len());
        buf.copy_from_slice(head);
        *self = tail;
        Ok(())
    }
}

/// Adapts a transport into a `ByteSource` that loops until satisfied.
pub struct TransportReader<'a, T: OtaTransport + ?Sized> {
    inner: &'a T,
}

impl<'a, T: OtaTransport + ?Sized> TransportReader<'a, T> {
    pub fn new(inner: &'a T) -> Self {
        Self { inner }
    }
}

impl<T: OtaTransport + ?Sized> ByteSource for TransportReader<'_, T> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..])?;
            if n == 0 {
                tracing::error!(needed = buf.len(), got = filled, "Short read from transport");
                return Err(TransportError::UnexpectedEof {
                    needed: buf.len(),
                    got: filled,
                });
            }
            filled += n;
        }
        Ok(())
    }
}
