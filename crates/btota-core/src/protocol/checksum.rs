//! CRC32 over unit payloads (IEEE 802.3 / ISO-HDLC polynomial).

use crc::{CRC_32_ISO_HDLC, Crc};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Running CRC32 for data that arrives in pieces.
pub struct Crc32Accumulator {
    digest: crc::Digest<'static, u32>,
}

impl Crc32Accumulator {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Crc32Accumulator {
    fn default() -> Self {
        Self::new()
    }
}
