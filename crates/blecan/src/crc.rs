/// MSB-first CRC-8 with a configurable polynomial and initial value.
///
/// The adapter firmware is not consistent about which polynomial it expects, so the
/// configuration travels with each frame kind instead of being a crate-wide constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc8 {
    pub poly: u8,
    pub init: u8,
}

impl Crc8 {
    /// Command, configuration, UDS payload and fixed frames.
    pub const COMMAND: Self = Self::new(0x1F, 0x00);
    /// Segmented (indexed) frames.
    pub const SEGMENT: Self = Self::new(0x07, 0x00);

    pub const fn new(poly: u8, init: u8) -> Self {
        Self { poly, init }
    }

    pub fn digest(&self) -> Crc8Digest {
        Crc8Digest {
            poly: self.poly,
            crc: self.init,
        }
    }

    pub fn checksum(&self, data: &[u8]) -> u8 {
        let mut d = self.digest();
        d.update(data);
        d.finish()
    }
}

pub struct Crc8Digest {
    poly: u8,
    crc: u8,
}

impl Crc8Digest {
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.crc ^= byte;
            for _ in 0..8 {
                self.crc = if (self.crc & 0x80) != 0 {
                    (self.crc << 1) ^ self.poly
                } else {
                    self.crc << 1
                };
            }
        }
    }

    pub fn finish(&self) -> u8 {
        self.crc
    }
}
