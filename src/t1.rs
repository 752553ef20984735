//! Tier-1 coding: context modelling and bit-plane coding of code-blocks.
//!
//! Magnitudes are coded bit-plane by bit-plane in three passes per plane
//! (significance propagation, magnitude refinement, cleanup), each decision
//! driven by a context derived from the significance state of the eight
//! neighbours. The flag grid carries one extra border cell on every side so
//! neighbour lookups never need bounds checks.
//!
//! Scaling conventions differ per side: the encoder receives coefficients
//! pre-shifted left by [`NMSEDEC_FRACBITS`] (the fractional tail feeds the
//! distortion estimates), while the decoder reconstructs at twice the
//! coefficient scale so the half-interval offsets stay integral. Callers
//! divide by two (or scale by `stepsize / 2`) when placing samples.

use crate::floor_log2;
use crate::mqc::{MqDecoder, MqEncoder};
use crate::params::{
    CBLKSTY_LAZY, CBLKSTY_PTERM, CBLKSTY_RESET, CBLKSTY_SEGSYM, CBLKSTY_TERMALL, CBLKSTY_VSC,
};
use crate::raw::RawDecoder;
use crate::tile::{CodeBlockDec, Pass};

pub const NMSEDEC_BITS: i32 = 7;
pub const NMSEDEC_FRACBITS: i32 = NMSEDEC_BITS - 1;

// Neighbour significance, diagonals first, then the four signs, then the
// state of the sample itself.
const SIG_NE: u16 = 0x0001;
const SIG_SE: u16 = 0x0002;
const SIG_SW: u16 = 0x0004;
const SIG_NW: u16 = 0x0008;
const SIG_N: u16 = 0x0010;
const SIG_E: u16 = 0x0020;
const SIG_S: u16 = 0x0040;
const SIG_W: u16 = 0x0080;
const SIG_OTH: u16 = 0x00FF;
const SGN_N: u16 = 0x0100;
const SGN_E: u16 = 0x0200;
const SGN_S: u16 = 0x0400;
const SGN_W: u16 = 0x0800;
const SIG: u16 = 0x1000;
const REFINE: u16 = 0x2000;
const VISIT: u16 = 0x4000;

/// Causal mode hides the stripe row below the current one.
const VSC_MASK: u16 = !(SIG_S | SIG_SE | SIG_SW | SGN_S);

const CTX_ZC: usize = 0;
const CTX_SC: usize = 9;
const CTX_MAG: usize = 14;
const CTX_AGG: usize = 17;
const CTX_UNI: usize = 18;

/// Zero-coding context from the neighbourhood, table D.1. `orient` 2 swaps
/// the horizontal and vertical counts, orient 3 uses the diagonal-first
/// classification.
const fn zc_context(f: u32, orient: u32) -> u8 {
    let mut h = ((f & SIG_W as u32) != 0) as u32 + ((f & SIG_E as u32) != 0) as u32;
    let mut v = ((f & SIG_N as u32) != 0) as u32 + ((f & SIG_S as u32) != 0) as u32;
    let d = ((f & SIG_NW as u32) != 0) as u32
        + ((f & SIG_NE as u32) != 0) as u32
        + ((f & SIG_SE as u32) != 0) as u32
        + ((f & SIG_SW as u32) != 0) as u32;

    if orient == 3 {
        let hv = h + v;
        return if d == 0 {
            if hv == 0 {
                0
            } else if hv == 1 {
                1
            } else {
                2
            }
        } else if d == 1 {
            if hv == 0 {
                3
            } else if hv == 1 {
                4
            } else {
                5
            }
        } else if d == 2 {
            if hv == 0 { 6 } else { 7 }
        } else {
            8
        };
    }
    if orient == 2 {
        let t = h;
        h = v;
        v = t;
    }
    if h == 0 {
        if v == 0 {
            if d == 0 {
                0
            } else if d == 1 {
                1
            } else {
                2
            }
        } else if v == 1 {
            3
        } else {
            4
        }
    } else if h == 1 {
        if v == 0 {
            if d == 0 { 5 } else { 6 }
        } else {
            7
        }
    } else {
        8
    }
}

const fn build_zc_lut() -> [u8; 1024] {
    let mut lut = [0u8; 1024];
    let mut orient = 0u32;
    while orient < 4 {
        let mut f = 0u32;
        while f < 256 {
            lut[((orient << 8) | f) as usize] = zc_context(f, orient);
            f += 1;
        }
        orient += 1;
    }
    lut
}

static ZC_LUT: [u8; 1024] = build_zc_lut();

// Sign-coding tables are keyed by bits 4..=11 of the flag word: the four
// primary significances followed by the four signs.
const fn sign_contrib(key: u32, dir: u32) -> i32 {
    if key & (1 << dir) == 0 {
        0
    } else if key & (1 << (dir + 4)) == 0 {
        1
    } else {
        -1
    }
}

const fn sc_sums(key: u32) -> (i32, i32) {
    let mut hc = sign_contrib(key, 1) + sign_contrib(key, 3);
    let mut vc = sign_contrib(key, 0) + sign_contrib(key, 2);
    if hc < -1 {
        hc = -1;
    } else if hc > 1 {
        hc = 1;
    }
    if vc < -1 {
        vc = -1;
    } else if vc > 1 {
        vc = 1;
    }
    (hc, vc)
}

const fn build_sc_ctx_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    let mut key = 0u32;
    while key < 256 {
        let (mut hc, mut vc) = sc_sums(key);
        if hc < 0 {
            hc = -hc;
            vc = -vc;
        }
        let n: u8 = if hc == 0 {
            if vc == 0 { 0 } else { 1 }
        } else if vc == -1 {
            2
        } else if vc == 0 {
            3
        } else {
            4
        };
        lut[key as usize] = CTX_SC as u8 + n;
        key += 1;
    }
    lut
}

const fn build_sc_flip_lut() -> [u8; 256] {
    let mut lut = [0u8; 256];
    let mut key = 0u32;
    while key < 256 {
        let (hc, vc) = sc_sums(key);
        lut[key as usize] = (hc < 0 || (hc == 0 && vc < 0)) as u8;
        key += 1;
    }
    lut
}

static SC_CTX_LUT: [u8; 256] = build_sc_ctx_lut();
static SC_FLIP_LUT: [u8; 256] = build_sc_flip_lut();

// Normalized MSE decrease per coded bit, in 1/8192 units of the squared
// step size, for the four combinations of pass kind and first plane.
const fn build_nmsedec_sig() -> [i32; 128] {
    let mut lut = [0i32; 128];
    let mut i = 0i32;
    while i < 128 {
        let v = (3 * i - 144) * 128;
        lut[i as usize] = if v > 0 { v } else { 0 };
        i += 1;
    }
    lut
}

const fn build_nmsedec_sig0() -> [i32; 128] {
    let mut lut = [0i32; 128];
    let mut i = 0i32;
    while i < 128 {
        let v = (2 * i - 64) * 128;
        lut[i as usize] = if v > 0 { v } else { 0 };
        i += 1;
    }
    lut
}

const fn build_nmsedec_ref() -> [i32; 128] {
    let mut lut = [0i32; 128];
    let mut i = 0i32;
    while i < 128 {
        let v = if i >= 64 {
            (i - 80) * 128
        } else {
            (48 - i) * 128
        };
        lut[i as usize] = if v > 0 { v } else { 0 };
        i += 1;
    }
    lut
}

const fn build_nmsedec_ref0() -> [i32; 128] {
    let mut lut = [0i32; 128];
    let mut i = 0i32;
    while i < 128 {
        let v = if i >= 64 {
            (3 * i - 144) * 128
        } else {
            (i - 16) * 128
        };
        lut[i as usize] = if v > 0 { v } else { 0 };
        i += 1;
    }
    lut
}

static NMSEDEC_SIG: [i32; 128] = build_nmsedec_sig();
static NMSEDEC_SIG0: [i32; 128] = build_nmsedec_sig0();
static NMSEDEC_REF: [i32; 128] = build_nmsedec_ref();
static NMSEDEC_REF0: [i32; 128] = build_nmsedec_ref0();

fn zc_ctx(flags: u16, orient: u32) -> usize {
    ZC_LUT[((orient << 8) | (flags & SIG_OTH) as u32) as usize] as usize
}

fn sc_ctx(flags: u16) -> usize {
    SC_CTX_LUT[((flags >> 4) & 0xFF) as usize] as usize
}

fn sc_flip(flags: u16) -> u32 {
    SC_FLIP_LUT[((flags >> 4) & 0xFF) as usize] as u32
}

fn mr_ctx(flags: u16) -> usize {
    if flags & REFINE != 0 {
        CTX_MAG + 2
    } else if flags & SIG_OTH != 0 {
        CTX_MAG + 1
    } else {
        CTX_MAG
    }
}

fn nmsedec_sig(x: i32, bitpos: i32) -> i32 {
    if bitpos > NMSEDEC_FRACBITS {
        NMSEDEC_SIG[((x >> (bitpos - NMSEDEC_FRACBITS)) & 127) as usize]
    } else {
        NMSEDEC_SIG0[(x & 127) as usize]
    }
}

fn nmsedec_ref(x: i32, bitpos: i32) -> i32 {
    if bitpos > NMSEDEC_FRACBITS {
        NMSEDEC_REF[((x >> (bitpos - NMSEDEC_FRACBITS)) & 127) as usize]
    } else {
        NMSEDEC_REF0[(x & 127) as usize]
    }
}

/// Marks `idx` significant with sign `s` (1 = negative) and updates the
/// nine affected neighbourhood entries.
fn update_flags(flags: &mut [u16], idx: usize, s: u32, stride: usize) {
    const MOD: [u16; 8] = [
        SIG_S,
        SIG_S | SGN_S,
        SIG_E,
        SIG_E | SGN_E,
        SIG_W,
        SIG_W | SGN_W,
        SIG_N,
        SIG_N | SGN_N,
    ];
    let s = s as usize;
    flags[idx - stride - 1] |= SIG_SE;
    flags[idx - stride] |= MOD[s];
    flags[idx - stride + 1] |= SIG_SW;
    flags[idx - 1] |= MOD[s + 2];
    flags[idx] |= SIG;
    flags[idx + 1] |= MOD[s + 4];
    flags[idx + stride - 1] |= SIG_NE;
    flags[idx + stride] |= MOD[s + 6];
    flags[idx + stride + 1] |= SIG_NW;
}

fn init_enc_ctxs(mqc: &mut MqEncoder) {
    mqc.reset_states();
    mqc.set_state(CTX_UNI, 0, 46);
    mqc.set_state(CTX_AGG, 0, 3);
    mqc.set_state(CTX_ZC, 0, 4);
}

fn init_dec_ctxs(mqc: &mut MqDecoder) {
    mqc.reset_states();
    mqc.set_state(CTX_UNI, 0, 46);
    mqc.set_state(CTX_AGG, 0, 3);
    mqc.set_state(CTX_ZC, 0, 4);
}

/// Output of coding one code-block: the codeword, one entry per coding
/// pass, and the cumulative weighted distortion decrease.
#[derive(Debug, Default)]
pub struct CodedCblk {
    pub data: Vec<u8>,
    pub passes: Vec<Pass>,
    pub numbps: i32,
    pub distortion: f64,
}

/// Reusable encoder state; one instance per worker thread.
pub struct T1Encoder {
    mqc: MqEncoder,
    flags: Vec<u16>,
    w: usize,
    h: usize,
    stride: usize,
}

impl Default for T1Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl T1Encoder {
    pub fn new() -> Self {
        Self {
            mqc: MqEncoder::new(),
            flags: Vec::new(),
            w: 0,
            h: 0,
            stride: 0,
        }
    }

    fn resize(&mut self, w: usize, h: usize) {
        self.w = w;
        self.h = h;
        self.stride = w + 2;
        self.flags.clear();
        self.flags.resize((w + 2) * (h + 2), 0);
    }

    /// Codes one block. `data` holds the coefficients pre-shifted left by
    /// [`NMSEDEC_FRACBITS`], row-major `w * h`. `msew` is the combined
    /// component, band and step-size weight used to turn the per-pass
    /// normalized MSE decrease into image-domain distortion.
    pub fn encode_cblk(
        &mut self,
        data: &[i32],
        w: usize,
        h: usize,
        orient: u32,
        style: u8,
        msew: f64,
    ) -> CodedCblk {
        debug_assert_eq!(data.len(), w * h);
        self.resize(w, h);

        let mut max = 0;
        for &d in data {
            max = max.max(d.abs());
        }
        let numbps = if max > 0 {
            floor_log2(max) + 1 - NMSEDEC_FRACBITS
        } else {
            0
        };

        init_enc_ctxs(&mut self.mqc);
        self.mqc.init();

        let lazy = style & CBLKSTY_LAZY != 0;
        let mut passes: Vec<Pass> = Vec::new();
        let mut bpno = numbps - 1;
        let mut passtype = 2;
        let mut cumwmsedec = 0.0;

        while bpno >= 0 {
            let mut correction = 3;
            let raw = lazy && passtype < 2 && bpno < numbps - 4;

            let nmsedec = match passtype {
                0 => self.enc_sigpass(data, bpno, orient, style, raw),
                1 => self.enc_refpass(data, bpno, style, raw),
                _ => self.enc_clnpass(data, bpno, orient, style),
            };
            let delta = msew * (1u64 << bpno) as f64;
            cumwmsedec += delta * delta * nmsedec as f64 / 8192.0;

            let last_pass = passtype == 2 && bpno == 0;
            let term = (style & CBLKSTY_TERMALL != 0 && !last_pass)
                || (lazy
                    && ((bpno < numbps - 4 && passtype > 0)
                        || (bpno == numbps - 4 && passtype == 2)));
            if term {
                if raw {
                    self.mqc.bypass_flush();
                } else {
                    self.mqc.flush();
                }
                correction = 0;
            }

            passtype += 1;
            if passtype == 3 {
                passtype = 0;
                bpno -= 1;
            }

            if term && bpno >= 0 {
                if lazy && passtype < 2 && bpno < numbps - 4 {
                    self.mqc.bypass_init();
                } else {
                    self.mqc.restart_init();
                }
            }

            passes.push(Pass {
                rate: self.mqc.num_bytes() + correction,
                distortion: cumwmsedec,
                term,
                len: 0,
            });

            if style & CBLKSTY_RESET != 0 {
                init_enc_ctxs(&mut self.mqc);
            }
        }

        if let Some(last) = passes.last() {
            if !last.term {
                if style & CBLKSTY_PTERM != 0 {
                    self.mqc.erterm();
                } else {
                    self.mqc.flush();
                }
            }
        }

        let total = self.mqc.num_bytes();
        let coded = self.mqc.take_data();

        // Truncation lengths: clamped to the stream, never ending on a
        // stuffable 0xFF, and non-decreasing so pass lengths stay valid.
        let mut prev = 0usize;
        for pass in &mut passes {
            let mut rate = pass.rate.min(total);
            if rate > 1 && coded[rate - 1] == 0xFF {
                rate -= 1;
            }
            rate = rate.max(prev);
            pass.rate = rate;
            pass.len = rate - prev;
            prev = rate;
        }

        CodedCblk {
            data: coded,
            passes,
            numbps,
            distortion: cumwmsedec,
        }
    }

    fn enc_sigpass(&mut self, data: &[i32], bpno: i32, orient: u32, style: u8, raw: bool) -> i32 {
        let one = 1i32 << (bpno + NMSEDEC_FRACBITS);
        let mut nmsedec = 0;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    if flag & SIG_OTH == 0 || flag & (SIG | VISIT) != 0 {
                        continue;
                    }
                    let dp = data[j * self.w + i];
                    let v = (dp.abs() & one != 0) as u32;
                    if raw {
                        self.mqc.bypass_put(v);
                    } else {
                        self.mqc.encode(zc_ctx(flag, orient), v);
                    }
                    if v != 0 {
                        let s = (dp < 0) as u32;
                        nmsedec += nmsedec_sig(dp.abs(), bpno + NMSEDEC_FRACBITS);
                        if raw {
                            self.mqc.bypass_put(s);
                        } else {
                            self.mqc.encode(sc_ctx(flag), s ^ sc_flip(flag));
                        }
                        update_flags(&mut self.flags, idx, s, self.stride);
                        self.flags[idx] |= SIG;
                    }
                    self.flags[idx] |= VISIT;
                }
            }
        }
        nmsedec
    }

    fn enc_refpass(&mut self, data: &[i32], bpno: i32, style: u8, raw: bool) -> i32 {
        let one = 1i32 << (bpno + NMSEDEC_FRACBITS);
        let mut nmsedec = 0;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    if flag & (SIG | VISIT) != SIG {
                        continue;
                    }
                    let dp = data[j * self.w + i];
                    nmsedec += nmsedec_ref(dp.abs(), bpno + NMSEDEC_FRACBITS);
                    let v = (dp.abs() & one != 0) as u32;
                    if raw {
                        self.mqc.bypass_put(v);
                    } else {
                        self.mqc.encode(mr_ctx(flag), v);
                    }
                    self.flags[idx] |= REFINE;
                }
            }
        }
        nmsedec
    }

    fn enc_clnpass(&mut self, data: &[i32], bpno: i32, orient: u32, style: u8) -> i32 {
        let one = 1i32 << (bpno + NMSEDEC_FRACBITS);
        let mut nmsedec = 0;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                let agg = k + 3 < self.h && self.stripe_idle(k, i, style);
                let mut runlen = 0usize;
                if agg {
                    while runlen < 4 {
                        if data[(k + runlen) * self.w + i].abs() & one != 0 {
                            break;
                        }
                        runlen += 1;
                    }
                    self.mqc.encode(CTX_AGG, (runlen != 4) as u32);
                    if runlen == 4 {
                        continue;
                    }
                    self.mqc.encode(CTX_UNI, runlen as u32 >> 1);
                    self.mqc.encode(CTX_UNI, runlen as u32 & 1);
                }
                for j in (k + runlen)..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    let dp = data[j * self.w + i];
                    let sig_now = if agg && j == k + runlen {
                        // Run interruption: the significance bit is implied.
                        true
                    } else if self.flags[idx] & (SIG | VISIT) == 0 {
                        let v = (dp.abs() & one != 0) as u32;
                        self.mqc.encode(zc_ctx(flag, orient), v);
                        v != 0
                    } else {
                        false
                    };
                    if sig_now {
                        nmsedec += nmsedec_sig(dp.abs(), bpno + NMSEDEC_FRACBITS);
                        let s = (dp < 0) as u32;
                        self.mqc.encode(sc_ctx(flag), s ^ sc_flip(flag));
                        update_flags(&mut self.flags, idx, s, self.stride);
                        self.flags[idx] |= SIG;
                    }
                    self.flags[idx] &= !VISIT;
                }
            }
        }
        if style & CBLKSTY_SEGSYM != 0 {
            self.mqc.encode(CTX_UNI, 1);
            self.mqc.encode(CTX_UNI, 0);
            self.mqc.encode(CTX_UNI, 1);
            self.mqc.encode(CTX_UNI, 0);
        }
        nmsedec
    }

    /// True when no sample of the four-row stripe column at (`k`, `i`) is
    /// significant, visited, or has a significant neighbour.
    fn stripe_idle(&self, k: usize, i: usize, style: u8) -> bool {
        for r in 0..4 {
            let mut f = self.flags[(k + r + 1) * self.stride + i + 1];
            if r == 3 && style & CBLKSTY_VSC != 0 {
                f &= VSC_MASK;
            }
            if f & (SIG | VISIT | SIG_OTH) != 0 {
                return false;
            }
        }
        true
    }
}

/// Reusable decoder state; [`data`](T1Decoder::data) holds the samples of
/// the last decoded block at twice the coefficient scale.
pub struct T1Decoder {
    data: Vec<i32>,
    flags: Vec<u16>,
    w: usize,
    h: usize,
    stride: usize,
}

impl Default for T1Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl T1Decoder {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            flags: Vec::new(),
            w: 0,
            h: 0,
            stride: 0,
        }
    }

    pub fn data(&self) -> &[i32] {
        &self.data
    }

    fn resize(&mut self, w: usize, h: usize) {
        self.w = w;
        self.h = h;
        self.stride = w + 2;
        self.data.clear();
        self.data.resize(w * h, 0);
        self.flags.clear();
        self.flags.resize((w + 2) * (h + 2), 0);
    }

    /// Decodes every segment the packet parser attached to `cblk`. Missing
    /// or truncated bytes read as synthesized `0xFF`, so damaged blocks
    /// decode as far as their data carries them.
    pub fn decode_cblk(&mut self, cblk: &CodeBlockDec, orient: u32, style: u8) {
        let w = cblk.width();
        let h = cblk.height();
        self.resize(w, h);

        let lazy = style & CBLKSTY_LAZY != 0;
        let mut bpno = cblk.numbps - 1;
        let mut passtype = 2;

        let mut mqc = MqDecoder::new(&[]);
        init_dec_ctxs(&mut mqc);

        for seg in &cblk.segs {
            if bpno < 0 {
                break;
            }
            let bytes = &cblk.data[seg.start..seg.start + seg.len];
            if lazy && passtype < 2 && bpno < cblk.numbps - 4 {
                let mut raw = RawDecoder::new(bytes);
                for _ in 0..seg.numpasses {
                    if bpno < 0 {
                        break;
                    }
                    if passtype == 0 {
                        self.dec_sigpass_raw(&mut raw, bpno, style);
                    } else {
                        self.dec_refpass_raw(&mut raw, bpno);
                    }
                    passtype += 1;
                    if passtype == 3 {
                        passtype = 0;
                        bpno -= 1;
                    }
                }
            } else {
                mqc.init(bytes);
                for _ in 0..seg.numpasses {
                    if bpno < 0 {
                        break;
                    }
                    match passtype {
                        0 => self.dec_sigpass_mq(&mut mqc, bpno, orient, style),
                        1 => self.dec_refpass_mq(&mut mqc, bpno, style),
                        _ => self.dec_clnpass(&mut mqc, bpno, orient, style),
                    }
                    if style & CBLKSTY_RESET != 0 {
                        init_dec_ctxs(&mut mqc);
                    }
                    passtype += 1;
                    if passtype == 3 {
                        passtype = 0;
                        bpno -= 1;
                    }
                }
            }
        }
    }

    fn dec_sigpass_mq(&mut self, mqc: &mut MqDecoder, bpno: i32, orient: u32, style: u8) {
        let one = 1i32 << (bpno + 1);
        let oneplushalf = one | (one >> 1);
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    if flag & SIG_OTH == 0 || flag & (SIG | VISIT) != 0 {
                        continue;
                    }
                    if mqc.decode(zc_ctx(flag, orient)) != 0 {
                        let s = mqc.decode(sc_ctx(flag)) ^ sc_flip(flag);
                        self.data[j * self.w + i] =
                            if s != 0 { -oneplushalf } else { oneplushalf };
                        update_flags(&mut self.flags, idx, s, self.stride);
                        self.flags[idx] |= SIG;
                    }
                    self.flags[idx] |= VISIT;
                }
            }
        }
    }

    fn dec_sigpass_raw(&mut self, raw: &mut RawDecoder, bpno: i32, style: u8) {
        let one = 1i32 << (bpno + 1);
        let oneplushalf = one | (one >> 1);
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    if flag & SIG_OTH == 0 || flag & (SIG | VISIT) != 0 {
                        continue;
                    }
                    if raw.decode() != 0 {
                        let s = raw.decode();
                        self.data[j * self.w + i] =
                            if s != 0 { -oneplushalf } else { oneplushalf };
                        update_flags(&mut self.flags, idx, s, self.stride);
                        self.flags[idx] |= SIG;
                    }
                    self.flags[idx] |= VISIT;
                }
            }
        }
    }

    fn dec_refpass_mq(&mut self, mqc: &mut MqDecoder, bpno: i32, style: u8) {
        let poshalf = 1i32 << bpno;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    if flag & (SIG | VISIT) != SIG {
                        continue;
                    }
                    let t = if mqc.decode(mr_ctx(flag)) != 0 {
                        poshalf
                    } else {
                        -poshalf
                    };
                    let dp = &mut self.data[j * self.w + i];
                    *dp += if *dp < 0 { -t } else { t };
                    self.flags[idx] |= REFINE;
                }
            }
        }
    }

    fn dec_refpass_raw(&mut self, raw: &mut RawDecoder, bpno: i32) {
        let poshalf = 1i32 << bpno;
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                for j in k..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    if self.flags[idx] & (SIG | VISIT) != SIG {
                        continue;
                    }
                    let t = if raw.decode() != 0 { poshalf } else { -poshalf };
                    let dp = &mut self.data[j * self.w + i];
                    *dp += if *dp < 0 { -t } else { t };
                    self.flags[idx] |= REFINE;
                }
            }
        }
    }

    fn dec_clnpass(&mut self, mqc: &mut MqDecoder, bpno: i32, orient: u32, style: u8) {
        let one = 1i32 << (bpno + 1);
        let oneplushalf = one | (one >> 1);
        for k in (0..self.h).step_by(4) {
            for i in 0..self.w {
                let agg = k + 3 < self.h && self.stripe_idle(k, i, style);
                let mut runlen = 0usize;
                if agg {
                    if mqc.decode(CTX_AGG) == 0 {
                        continue;
                    }
                    runlen = ((mqc.decode(CTX_UNI) << 1) | mqc.decode(CTX_UNI)) as usize;
                }
                for j in (k + runlen)..(k + 4).min(self.h) {
                    let idx = (j + 1) * self.stride + i + 1;
                    let vsc = style & CBLKSTY_VSC != 0 && (j == k + 3 || j == self.h - 1);
                    let flag = if vsc {
                        self.flags[idx] & VSC_MASK
                    } else {
                        self.flags[idx]
                    };
                    let sig_now = if agg && j == k + runlen {
                        true
                    } else if flag & (SIG | VISIT) == 0 {
                        mqc.decode(zc_ctx(flag, orient)) != 0
                    } else {
                        false
                    };
                    if sig_now {
                        let s = mqc.decode(sc_ctx(flag)) ^ sc_flip(flag);
                        self.data[j * self.w + i] =
                            if s != 0 { -oneplushalf } else { oneplushalf };
                        update_flags(&mut self.flags, idx, s, self.stride);
                        self.flags[idx] |= SIG;
                    }
                    self.flags[idx] &= !VISIT;
                }
            }
        }
        if style & CBLKSTY_SEGSYM != 0 {
            // Segmentation symbol 1010; a mismatch would mean upstream
            // corruption, decoding continues either way.
            for _ in 0..4 {
                mqc.decode(CTX_UNI);
            }
        }
    }

    fn stripe_idle(&self, k: usize, i: usize, style: u8) -> bool {
        for r in 0..4 {
            let mut f = self.flags[(k + r + 1) * self.stride + i + 1];
            if r == 3 && style & CBLKSTY_VSC != 0 {
                f &= VSC_MASK;
            }
            if f & (SIG | VISIT | SIG_OTH) != 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::Segment;

    fn lcg(state: &mut u64) -> i32 {
        *state = state.wrapping_mul(1103515245).wrapping_add(12345);
        ((*state >> 16) & 0xFF) as i32 - 128
    }

    /// Pseudo-random coefficients in `-amplitude..=amplitude`, unshifted.
    fn sample_block(w: usize, h: usize, amplitude: i32, seed: u64) -> Vec<i32> {
        let mut state = seed;
        (0..w * h)
            .map(|_| lcg(&mut state) * amplitude / 128)
            .collect()
    }

    fn shifted(data: &[i32]) -> Vec<i32> {
        data.iter().map(|&v| v << NMSEDEC_FRACBITS).collect()
    }

    /// Splits a codeword into decoder segments at the recorded pass
    /// terminations, the same grouping the packet parser reconstructs.
    fn segment_layout(coded: &CodedCblk) -> Vec<Segment> {
        let mut segs = Vec::new();
        let mut start = 0;
        let mut len = 0;
        let mut numpasses = 0;
        for pass in &coded.passes {
            numpasses += 1;
            len += pass.len;
            if pass.term {
                segs.push(Segment {
                    start,
                    len,
                    numpasses,
                    ..Segment::default()
                });
                start += len;
                len = 0;
                numpasses = 0;
            }
        }
        if numpasses > 0 {
            segs.push(Segment {
                start,
                len: coded.data.len() - start,
                numpasses,
                ..Segment::default()
            });
        }
        segs
    }

    fn decode_all(coded: &CodedCblk, w: usize, h: usize, orient: u32, style: u8) -> Vec<i32> {
        let cblk = CodeBlockDec {
            x0: 0,
            y0: 0,
            x1: w as i32,
            y1: h as i32,
            data: coded.data.clone(),
            segs: segment_layout(coded),
            numbps: coded.numbps,
            numlenbits: 0,
        };
        let mut dec = T1Decoder::new();
        dec.decode_cblk(&cblk, orient, style);
        dec.data().to_vec()
    }

    fn assert_round_trip(w: usize, h: usize, orient: u32, style: u8, amplitude: i32, seed: u64) {
        let data = sample_block(w, h, amplitude, seed);
        let mut enc = T1Encoder::new();
        let coded = enc.encode_cblk(&shifted(&data), w, h, orient, style, 1.0);
        let decoded = decode_all(&coded, w, h, orient, style);
        for (n, (&got, &want)) in decoded.iter().zip(&data).enumerate() {
            // Decoder output is at twice the coefficient scale.
            assert_eq!(
                got / 2,
                want,
                "sample {} mismatch (style {:#04x})",
                n,
                style
            );
        }
    }

    #[test]
    fn round_trips_plain_block() {
        assert_round_trip(16, 12, 0, 0, 100, 7);
    }

    #[test]
    fn round_trips_every_band_orientation() {
        for orient in 0..4 {
            assert_round_trip(11, 13, orient, 0, 90, 3 + orient as u64);
        }
    }

    #[test]
    fn round_trips_all_code_block_styles() {
        let styles = [
            CBLKSTY_LAZY,
            CBLKSTY_RESET,
            CBLKSTY_TERMALL,
            CBLKSTY_VSC,
            CBLKSTY_PTERM,
            CBLKSTY_SEGSYM,
            CBLKSTY_LAZY | CBLKSTY_TERMALL,
            CBLKSTY_LAZY | CBLKSTY_RESET | CBLKSTY_TERMALL | CBLKSTY_VSC | CBLKSTY_SEGSYM,
        ];
        for &style in &styles {
            // Amplitude large enough that selective bypass actually
            // produces raw segments (more than four magnitude planes).
            assert_round_trip(17, 9, 1, style, 2000, 11);
        }
    }

    #[test]
    fn round_trips_single_sample_block() {
        for &value in &[5, -5, 1, -1023] {
            let data = [value << NMSEDEC_FRACBITS];
            let mut enc = T1Encoder::new();
            let coded = enc.encode_cblk(&data, 1, 1, 0, 0, 1.0);
            let decoded = decode_all(&coded, 1, 1, 0, 0);
            assert_eq!(decoded[0] / 2, value);
        }
    }

    #[test]
    fn zero_block_codes_no_passes() {
        let data = vec![0i32; 64];
        let mut enc = T1Encoder::new();
        let coded = enc.encode_cblk(&data, 8, 8, 0, 0, 1.0);
        assert_eq!(coded.numbps, 0);
        assert!(coded.passes.is_empty());
        assert!(coded.data.is_empty());

        let decoded = decode_all(&coded, 8, 8, 0, 0);
        assert!(decoded.iter().all(|&v| v == 0));
    }

    #[test]
    fn pass_rates_are_monotonic_and_never_end_on_ff() {
        let data = sample_block(32, 32, 120, 23);
        let mut enc = T1Encoder::new();
        let coded = enc.encode_cblk(&shifted(&data), 32, 32, 2, 0, 1.0);
        assert!(coded.passes.len() > 3);

        let mut prev_rate = 0;
        let mut prev_disto = 0.0;
        let mut total_len = 0;
        for pass in &coded.passes {
            assert!(pass.rate >= prev_rate);
            assert!(pass.rate <= coded.data.len());
            assert!(pass.distortion >= prev_disto);
            if pass.rate > 1 {
                assert_ne!(coded.data[pass.rate - 1], 0xFF);
            }
            total_len += pass.len;
            prev_rate = pass.rate;
            prev_disto = pass.distortion;
        }
        assert_eq!(total_len, prev_rate);
    }

    #[test]
    fn termall_splits_into_one_segment_per_pass() {
        let data = sample_block(12, 8, 200, 5);
        let mut enc = T1Encoder::new();
        let coded = enc.encode_cblk(&shifted(&data), 12, 8, 0, CBLKSTY_TERMALL, 1.0);
        assert!(coded.passes.iter().all(|p| p.term));
        let segs = segment_layout(&coded);
        assert_eq!(segs.len(), coded.passes.len());
        assert_eq!(
            segs.iter().map(|s| s.len).sum::<usize>(),
            coded.data.len()
        );
    }

    #[test]
    fn lazy_mode_terminates_at_bypass_boundaries() {
        let data = sample_block(16, 16, 2000, 31);
        let mut enc = T1Encoder::new();
        let coded = enc.encode_cblk(&shifted(&data), 16, 16, 0, CBLKSTY_LAZY, 1.0);
        assert!(coded.numbps > 4, "need raw planes for this test");

        // The first ten passes stay in one arithmetic segment, after which
        // raw pairs alternate with single cleanup passes.
        let segs = segment_layout(&coded);
        assert!(segs.len() > 1);
        assert_eq!(segs[0].numpasses, 10);
        for seg in &segs[1..] {
            assert!(seg.numpasses <= 2);
        }
    }

    #[test]
    fn truncation_degrades_gracefully() {
        let w = 16;
        let h = 16;
        let data = sample_block(w, h, 100, 41);
        let mut enc = T1Encoder::new();
        let coded = enc.encode_cblk(&shifted(&data), w, h, 0, 0, 1.0);
        assert!(coded.passes.len() >= 4);

        // Keep the first four passes' worth of bytes but announce them all;
        // the decoder must survive on synthesized tail bytes.
        let keep = coded.passes[3].rate;
        let cblk = CodeBlockDec {
            x0: 0,
            y0: 0,
            x1: w as i32,
            y1: h as i32,
            data: coded.data[..keep].to_vec(),
            segs: vec![Segment {
                start: 0,
                len: keep,
                numpasses: coded.passes.len() as u32,
                ..Segment::default()
            }],
            numbps: coded.numbps,
            numlenbits: 0,
        };
        let mut dec = T1Decoder::new();
        dec.decode_cblk(&cblk, 0, 0);

        let limit = 1i32 << (coded.numbps + 1);
        assert!(dec.data().iter().all(|&v| v.abs() < limit));
    }

    #[test]
    fn zero_coding_context_spot_values() {
        assert_eq!(zc_ctx(0, 0), 0);
        // One significant horizontal neighbour.
        assert_eq!(zc_ctx(SIG_E, 0), 5);
        assert_eq!(zc_ctx(SIG_E, 1), 5);
        // Highpass-transposed band swaps horizontal and vertical counts.
        assert_eq!(zc_ctx(SIG_E, 2), 3);
        // Diagonal band classifies by diagonal count first.
        assert_eq!(zc_ctx(SIG_E, 3), 1);
        assert_eq!(zc_ctx(SIG_NE | SIG_SW, 3), 6);
        // Saturated neighbourhood.
        assert_eq!(zc_ctx(SIG_OTH, 0), 8);
        assert_eq!(zc_ctx(SIG_OTH, 3), 8);
    }

    #[test]
    fn sign_coding_context_spot_values() {
        // No significant neighbours.
        assert_eq!(sc_ctx(0), 9);
        assert_eq!(sc_flip(0), 0);
        // North positive.
        assert_eq!(sc_ctx(SIG_N), 10);
        assert_eq!(sc_flip(SIG_N), 0);
        // North negative: same context, flipped prediction.
        assert_eq!(sc_ctx(SIG_N | SGN_N), 10);
        assert_eq!(sc_flip(SIG_N | SGN_N), 1);
        // Both horizontals positive, verticals split.
        assert_eq!(sc_ctx(SIG_E | SIG_W), 12);
        assert_eq!(sc_ctx(SIG_E | SIG_W | SIG_N), 13);
        assert_eq!(sc_ctx(SIG_E | SIG_W | SIG_N | SGN_N), 11);
        // Opposite horizontal signs cancel.
        assert_eq!(sc_ctx(SIG_E | SIG_W | SGN_W), 9);
    }

    #[test]
    fn magnitude_context_spot_values() {
        assert_eq!(mr_ctx(0), 14);
        assert_eq!(mr_ctx(SIG_N), 15);
        assert_eq!(mr_ctx(REFINE), 16);
        assert_eq!(mr_ctx(REFINE | SIG_N), 16);
    }

    #[test]
    fn nmsedec_tables_match_closed_forms() {
        assert_eq!(NMSEDEC_SIG[48], 0);
        assert_eq!(NMSEDEC_SIG[49], 384);
        assert_eq!(NMSEDEC_SIG[127], 30336);
        assert_eq!(NMSEDEC_SIG0[32], 0);
        assert_eq!(NMSEDEC_SIG0[33], 256);
        assert_eq!(NMSEDEC_REF[0], 6144);
        assert_eq!(NMSEDEC_REF[64], 0);
        assert_eq!(NMSEDEC_REF[96], 2048);
        assert_eq!(NMSEDEC_REF0[16], 0);
        assert_eq!(NMSEDEC_REF0[17], 128);
        assert_eq!(NMSEDEC_REF0[64], 6144);
    }
}
