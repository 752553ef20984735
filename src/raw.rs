//! Raw bit unpacking for bypass-coded segments.
//!
//! The encoder side lives in [`crate::mqc::MqEncoder`] (`bypass_*`); this
//! is its reader, honoring the same stuffing rule: a byte following an
//! `0xFF` carries only seven bits.

pub struct RawDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    c: u32,
    ct: u32,
}

impl<'a> RawDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            c: 0,
            ct: 0,
        }
    }

    /// Reads one bit, most significant first. Past the end of data every
    /// synthesized byte reads as `0xFF`, mirroring what the matching
    /// flush would have committed.
    pub fn decode(&mut self) -> u32 {
        if self.ct == 0 {
            self.ct = 8;
            if self.pos == self.data.len() {
                self.c = 0xFF;
            } else {
                if self.c == 0xFF {
                    self.ct = 7;
                }
                self.c = self.data[self.pos] as u32;
                self.pos += 1;
            }
        }
        self.ct -= 1;
        (self.c >> self.ct) & 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_bits_msb_first() {
        let mut raw = RawDecoder::new(&[0b1010_0110, 0b1100_0001]);
        let bits: Vec<u32> = (0..16).map(|_| raw.decode()).collect();
        assert_eq!(bits, [1, 0, 1, 0, 0, 1, 1, 0, 1, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn test_stuffed_byte_after_ff_has_seven_bits() {
        // 0xFF, then 0x55: the leading bit of 0x55 is a stuff bit and the
        // payload continues with its low seven bits.
        let mut raw = RawDecoder::new(&[0xFF, 0x55]);
        for _ in 0..8 {
            assert_eq!(raw.decode(), 1);
        }
        let next: Vec<u32> = (0..7).map(|_| raw.decode()).collect();
        assert_eq!(next, [1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_end_of_data_synthesizes_ones() {
        let mut raw = RawDecoder::new(&[0x00]);
        for _ in 0..8 {
            assert_eq!(raw.decode(), 0);
        }
        for _ in 0..16 {
            assert_eq!(raw.decode(), 1);
        }
    }
}
