//! Bit-level IO for packet headers (ISO/IEC 15444-1 B.10).
//!
//! Packet headers use the same stuffing discipline as the MQ byte stream:
//! after an `0xFF` byte only seven bits of the next byte are usable, so a
//! header can never contain a two-byte marker. A 16-bit sliding window
//! keeps the previously completed byte visible for that check.

/// MSB-first bit writer with header stuffing.
pub struct BitWriter {
    data: Vec<u8>,
    buf: u32,
    ct: u32,
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            buf: 0,
            ct: 8,
        }
    }

    fn byteout(&mut self) {
        self.buf = (self.buf << 8) & 0xFFFF;
        self.ct = if self.buf == 0xFF00 { 7 } else { 8 };
        self.data.push((self.buf >> 8) as u8);
    }

    pub fn put_bit(&mut self, b: u32) {
        if self.ct == 0 {
            self.byteout();
        }
        self.ct -= 1;
        self.buf |= b << self.ct;
    }

    /// Writes the low `n` bits of `v`, most significant first.
    pub fn write(&mut self, v: u32, n: u32) {
        for i in (0..n).rev() {
            self.put_bit((v >> i) & 1);
        }
    }

    /// Byte-aligns, emitting a pad byte after a trailing `0xFF` so the
    /// reader's alignment step always finds it.
    pub fn finish(mut self) -> Vec<u8> {
        self.ct = 0;
        self.byteout();
        if self.ct == 7 {
            self.ct = 0;
            self.byteout();
        }
        self.data
    }
}

/// MSB-first bit reader over a packet header.
///
/// Reads fail with `Err(())` once the slice is exhausted; the packet
/// parser turns that into a proper decode error.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buf: u32,
    ct: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buf: 0,
            ct: 0,
        }
    }

    fn bytein(&mut self) -> Result<(), ()> {
        self.buf = (self.buf << 8) & 0xFFFF;
        self.ct = if self.buf == 0xFF00 { 7 } else { 8 };
        if self.pos >= self.data.len() {
            return Err(());
        }
        self.buf |= self.data[self.pos] as u32;
        self.pos += 1;
        Ok(())
    }

    pub fn get_bit(&mut self) -> Result<u32, ()> {
        if self.ct == 0 {
            self.bytein()?;
        }
        self.ct -= 1;
        Ok((self.buf >> self.ct) & 1)
    }

    /// Reads `n` bits, most significant first.
    pub fn read(&mut self, n: u32) -> Result<u32, ()> {
        let mut v = 0;
        for _ in 0..n {
            v = (v << 1) | self.get_bit()?;
        }
        Ok(v)
    }

    /// Byte-aligns after the header, consuming the pad byte that follows
    /// a trailing `0xFF`.
    pub fn align(&mut self) -> Result<(), ()> {
        self.ct = 0;
        if self.buf & 0xFF == 0xFF {
            self.bytein()?;
            self.ct = 0;
        }
        Ok(())
    }

    /// Bytes consumed so far, including the byte currently being read.
    pub fn position(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_mixed_widths() {
        let mut w = BitWriter::new();
        w.write(0b101, 3);
        w.write(0x1F, 9);
        w.write(0, 1);
        w.write(0x2CA, 10);
        let bytes = w.finish();

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(3), Ok(0b101));
        assert_eq!(r.read(9), Ok(0x1F));
        assert_eq!(r.read(1), Ok(0));
        assert_eq!(r.read(10), Ok(0x2CA));
    }

    #[test]
    fn test_ff_byte_is_stuffed() {
        let mut w = BitWriter::new();
        w.write(0xFF, 8);
        w.write(0x7F, 7);
        let bytes = w.finish();
        // After 0xFF the next byte holds seven payload bits under a zero
        // stuff bit, so it can never reach 0x80.
        assert_eq!(bytes, [0xFF, 0x7F]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(8), Ok(0xFF));
        assert_eq!(r.read(7), Ok(0x7F));
    }

    #[test]
    fn test_align_consumes_pad_after_trailing_ff() {
        let mut w = BitWriter::new();
        w.write(0xFF, 8);
        let bytes = w.finish();
        assert_eq!(bytes, [0xFF, 0x00]);

        let mut r = BitReader::new(&bytes);
        assert_eq!(r.read(8), Ok(0xFF));
        assert!(r.align().is_ok());
        assert_eq!(r.position(), 2);
    }

    #[test]
    fn test_exhausted_reader_errors() {
        let mut r = BitReader::new(&[0xA0]);
        assert_eq!(r.read(8), Ok(0xA0));
        assert!(r.read(1).is_err());
    }
}
