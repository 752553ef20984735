//! MQ arithmetic coder (ISO/IEC 15444-1 Annex C).
//!
//! Adaptive binary coder shared by all Tier-1 coding passes. The encoder
//! also carries the raw bypass mode used for lazy coding; the matching
//! bypass decoder lives in [`crate::raw`].

/// Number of context registers used by the bit-plane coder.
pub const NUM_CTXS: usize = 19;

/// One row of the probability state machine.
///
/// The 47 rows of Table C-2 are expanded to 94 entries so that a context
/// is a single index: entry `2*row + mps`, with the LPS transition of a
/// "switch" row crossing over to the opposite-MPS twin.
#[derive(Debug, Clone, Copy)]
struct MqState {
    qeval: u32,
    mps: u32,
    nmps: u8,
    nlps: u8,
}

/// Table C-2: (Qe, NMPS, NLPS, SWITCH).
const MQ_BASE: [(u16, u8, u8, bool); 47] = [
    (0x5601, 1, 1, true),
    (0x3401, 2, 6, false),
    (0x1801, 3, 9, false),
    (0x0AC1, 4, 12, false),
    (0x0521, 5, 29, false),
    (0x0221, 38, 33, false),
    (0x5601, 7, 6, true),
    (0x5401, 8, 14, false),
    (0x4801, 9, 14, false),
    (0x3801, 10, 14, false),
    (0x3001, 11, 17, false),
    (0x2401, 12, 18, false),
    (0x1C01, 13, 20, false),
    (0x1601, 29, 21, false),
    (0x5601, 15, 14, true),
    (0x5401, 16, 14, false),
    (0x5101, 17, 15, false),
    (0x4801, 18, 16, false),
    (0x3801, 19, 17, false),
    (0x3401, 20, 18, false),
    (0x3001, 21, 19, false),
    (0x2801, 22, 19, false),
    (0x2401, 23, 20, false),
    (0x2201, 24, 21, false),
    (0x1C01, 25, 22, false),
    (0x1801, 26, 23, false),
    (0x1601, 27, 24, false),
    (0x1401, 28, 25, false),
    (0x1201, 29, 26, false),
    (0x1101, 30, 27, false),
    (0x0AC1, 31, 28, false),
    (0x09C1, 32, 29, false),
    (0x08A1, 33, 30, false),
    (0x0521, 34, 31, false),
    (0x0441, 35, 32, false),
    (0x02A1, 36, 33, false),
    (0x0221, 37, 34, false),
    (0x0141, 38, 35, false),
    (0x0111, 39, 36, false),
    (0x0085, 40, 37, false),
    (0x0049, 41, 38, false),
    (0x0025, 42, 39, false),
    (0x0015, 43, 40, false),
    (0x0009, 44, 41, false),
    (0x0005, 45, 42, false),
    (0x0001, 45, 43, false),
    (0x5601, 46, 46, false),
];

const fn expand_states() -> [MqState; 94] {
    let mut table = [MqState {
        qeval: 0,
        mps: 0,
        nmps: 0,
        nlps: 0,
    }; 94];
    let mut row = 0;
    while row < 47 {
        let (qe, nmps, nlps, switch) = MQ_BASE[row];
        let mut mps: u8 = 0;
        while mps < 2 {
            let lps_mps = if switch { 1 - mps } else { mps };
            table[2 * row + mps as usize] = MqState {
                qeval: qe as u32,
                mps: mps as u32,
                nmps: 2 * nmps + mps,
                nlps: 2 * nlps + lps_mps,
            };
            mps += 1;
        }
        row += 1;
    }
    table
}

const MQ_STATES: [MqState; 94] = expand_states();

/// MQ encoder over a growable byte buffer.
///
/// Registers follow Annex C: `a` is the interval, `c` the 28-bit code
/// register with the carry at bit 27, `ct` the shift countdown to the
/// next byte transfer. Context registers persist across terminations
/// until [`MqEncoder::reset_states`].
pub struct MqEncoder {
    a: u32,
    c: u32,
    ct: u32,
    out: Vec<u8>,
    ctxs: [u8; NUM_CTXS],
}

impl Default for MqEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MqEncoder {
    pub fn new() -> Self {
        Self {
            a: 0x8000,
            c: 0,
            ct: 12,
            out: Vec::new(),
            ctxs: [0; NUM_CTXS],
        }
    }

    /// Re-initializes registers and discards buffered output. Context
    /// registers are left alone; callers reset those separately.
    pub fn init(&mut self) {
        self.a = 0x8000;
        self.c = 0;
        self.ct = 12;
        self.out.clear();
    }

    /// Returns every context to row 0 with MPS 0.
    pub fn reset_states(&mut self) {
        self.ctxs = [0; NUM_CTXS];
    }

    /// Pins one context to a table row and MPS value.
    pub fn set_state(&mut self, ctx: usize, mps: u32, row: u8) {
        self.ctxs[ctx] = 2 * row + mps as u8;
    }

    /// Bytes committed so far. Exact after a termination, otherwise the
    /// code register still holds up to three bytes of pending output.
    pub fn num_bytes(&self) -> usize {
        self.out.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.out
    }

    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// C.2.5 ENCODE: codes decision `d` in context `ctx`.
    pub fn encode(&mut self, ctx: usize, d: u32) {
        let state = MQ_STATES[self.ctxs[ctx] as usize];
        if d == state.mps {
            self.code_mps(ctx, state);
        } else {
            self.code_lps(ctx, state);
        }
    }

    fn code_mps(&mut self, ctx: usize, state: MqState) {
        self.a -= state.qeval;
        if self.a & 0x8000 == 0 {
            // Conditional exchange: the MPS sub-interval went below Qe.
            if self.a < state.qeval {
                self.a = state.qeval;
            } else {
                self.c += state.qeval;
            }
            self.ctxs[ctx] = state.nmps;
            self.renorm();
        } else {
            self.c += state.qeval;
        }
    }

    fn code_lps(&mut self, ctx: usize, state: MqState) {
        self.a -= state.qeval;
        if self.a < state.qeval {
            self.c += state.qeval;
        } else {
            self.a = state.qeval;
        }
        self.ctxs[ctx] = state.nlps;
        self.renorm();
    }

    fn renorm(&mut self) {
        loop {
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.ct == 0 {
                self.byteout();
            }
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    fn byteout(&mut self) {
        if self.out.last() == Some(&0xFF) {
            // Only seven bits follow a stuff byte.
            self.out.push((self.c >> 20) as u8);
            self.c &= 0xFFFFF;
            self.ct = 7;
        } else if self.c & 0x800_0000 == 0 {
            self.out.push((self.c >> 19) as u8);
            self.c &= 0x7FFFF;
            self.ct = 8;
        } else {
            // Carry ripples into the previous byte.
            if let Some(last) = self.out.last_mut() {
                *last += 1;
            }
            if self.out.last() == Some(&0xFF) {
                self.c &= 0x7FF_FFFF;
                self.out.push((self.c >> 20) as u8);
                self.c &= 0xFFFFF;
                self.ct = 7;
            } else {
                self.out.push((self.c >> 19) as u8);
                self.c &= 0x7FFFF;
                self.ct = 8;
            }
        }
    }

    fn setbits(&mut self) {
        let tempc = self.c + self.a;
        self.c |= 0xFFFF;
        if self.c >= tempc {
            self.c -= 0x8000;
        }
    }

    /// C.2.9 FLUSH: terminates the segment. A redundant trailing `0xFF`
    /// is stripped; the decoder resynthesizes it past the end of data.
    pub fn flush(&mut self) {
        self.setbits();
        self.c <<= self.ct;
        self.byteout();
        self.c <<= self.ct;
        self.byteout();
        if self.out.last() == Some(&0xFF) {
            self.out.pop();
        }
    }

    /// Error-resilient termination: pads so that a decoder can detect
    /// tampering with the last bytes of the segment.
    pub fn erterm(&mut self) {
        let mut k = 11 - self.ct as i32 + 1;
        while k > 0 {
            self.c <<= self.ct;
            self.ct = 0;
            self.byteout();
            k -= self.ct as i32;
        }
        if self.out.last() != Some(&0xFF) {
            self.byteout();
        }
    }

    /// Re-initializes registers to continue with a new MQ segment after a
    /// termination, keeping the buffered bytes and the context registers.
    pub fn restart_init(&mut self) {
        self.a = 0x8000;
        self.c = 0;
        self.ct = 12;
        if self.out.last() == Some(&0xFF) {
            self.ct = 13;
        }
    }

    /// Switches to raw bypass output.
    pub fn bypass_init(&mut self) {
        self.c = 0;
        self.ct = 8;
    }

    /// Appends one raw bit, with bit stuffing after an `0xFF` byte.
    pub fn bypass_put(&mut self, d: u32) {
        self.ct -= 1;
        self.c += d << self.ct;
        if self.ct == 0 {
            self.out.push(self.c as u8);
            self.ct = 8;
            if self.c as u8 == 0xFF {
                self.ct = 7;
            }
            self.c = 0;
        }
    }

    /// Terminates a raw segment, padding the last byte with alternating
    /// bits so it cannot become `0xFF`.
    pub fn bypass_flush(&mut self) {
        if self.ct < 8 {
            let mut pad = 0;
            while self.ct > 0 {
                self.ct -= 1;
                self.c += pad << self.ct;
                pad = (pad + 1) & 1;
            }
            self.out.push(self.c as u8);
            self.ct = 8;
            self.c = 0;
        }
    }
}

/// MQ decoder over a borrowed byte slice.
///
/// `pos` tracks the byte currently feeding the code register. An `0xFF`
/// followed by a byte above `0x8F` marks the end of usable data, after
/// which `bytein` synthesizes `0xFF` forever; running off the end of the
/// slice behaves identically, so truncated segments decode as far as
/// their bytes allow without ever reading past the slice.
pub struct MqDecoder<'a> {
    a: u32,
    c: u32,
    ct: u32,
    data: &'a [u8],
    pos: usize,
    ctxs: [u8; NUM_CTXS],
}

impl<'a> MqDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let mut dec = Self {
            a: 0,
            c: 0,
            ct: 0,
            data,
            pos: 0,
            ctxs: [0; NUM_CTXS],
        };
        dec.init(data);
        dec
    }

    /// C.3.1 INITDEC over a new segment. Context registers carry over,
    /// which is what the bit-plane coder needs between terminations.
    pub fn init(&mut self, data: &'a [u8]) {
        self.data = data;
        self.pos = 0;
        self.c = if data.is_empty() {
            0xFF << 16
        } else {
            (data[0] as u32) << 16
        };
        self.bytein();
        self.c <<= 7;
        self.ct -= 7;
        self.a = 0x8000;
    }

    /// Returns every context to row 0 with MPS 0.
    pub fn reset_states(&mut self) {
        self.ctxs = [0; NUM_CTXS];
    }

    /// Pins one context to a table row and MPS value.
    pub fn set_state(&mut self, ctx: usize, mps: u32, row: u8) {
        self.ctxs[ctx] = 2 * row + mps as u8;
    }

    /// C.3.2 DECODE: returns the decision coded in context `ctx`.
    pub fn decode(&mut self, ctx: usize) -> u32 {
        let state = MQ_STATES[self.ctxs[ctx] as usize];
        self.a -= state.qeval;
        let d;
        if (self.c >> 16) < state.qeval {
            // LPS exchange.
            if self.a < state.qeval {
                self.a = state.qeval;
                d = state.mps;
                self.ctxs[ctx] = state.nmps;
            } else {
                self.a = state.qeval;
                d = 1 - state.mps;
                self.ctxs[ctx] = state.nlps;
            }
            self.renorm();
        } else {
            self.c -= state.qeval << 16;
            if self.a & 0x8000 == 0 {
                // MPS exchange.
                if self.a < state.qeval {
                    d = 1 - state.mps;
                    self.ctxs[ctx] = state.nlps;
                } else {
                    d = state.mps;
                    self.ctxs[ctx] = state.nmps;
                }
                self.renorm();
            } else {
                d = state.mps;
            }
        }
        d
    }

    fn renorm(&mut self) {
        loop {
            if self.ct == 0 {
                self.bytein();
            }
            self.a <<= 1;
            self.c <<= 1;
            self.ct -= 1;
            if self.a & 0x8000 != 0 {
                break;
            }
        }
    }

    fn bytein(&mut self) {
        if self.pos < self.data.len() {
            let next = if self.pos + 1 < self.data.len() {
                self.data[self.pos + 1] as u32
            } else {
                0xFF
            };
            if self.data[self.pos] == 0xFF {
                if next > 0x8F {
                    self.c += 0xFF00;
                    self.ct = 8;
                } else {
                    self.pos += 1;
                    self.c += next << 9;
                    self.ct = 7;
                }
            } else {
                self.pos += 1;
                self.c += next << 8;
                self.ct = 8;
            }
        } else {
            self.c += 0xFF00;
            self.ct = 8;
        }
    }
}
