//! Tile coding: the per-tile pipeline and the image-level entry points.
//!
//! Encoding runs load, colour transform, wavelet transform, context coding
//! and rate allocation in sequence, then emits the packet stream. Decoding
//! runs the same stages backwards and is lenient where the format allows
//! it: a damaged stream decodes as far as it goes and the damage is
//! reported through [`DecodeStatus`] instead of aborting the tile.
//!
//! Rate allocation follows the post-compression scheme of ISO/IEC 15444-1:
//! every coding pass of every code-block carries its rate-distortion slope,
//! and a bisection over a global slope threshold picks the pass prefix per
//! block that meets each layer's byte or quality target. Candidate
//! assignments are checked by replaying actual packet emission against the
//! byte budget, so header cost is accounted for exactly.

use log::{debug, warn};
use rayon::prelude::*;

use crate::dwt::{self, Dwt53, Dwt97};
use crate::error::J2kError;
use crate::image::{Image, ImageComponent};
use crate::mct;
use crate::params::{CodingParameters, DecoderOptions, RateControl, WaveletFilter};
use crate::t1::{NMSEDEC_FRACBITS, T1Decoder, T1Encoder};
use crate::t2;
use crate::tile::{DecTile, EncTile, Layer, Tile, TileData};
use crate::{ceil_div, ceil_div_pow2};

/// Per-tile outcome of a decode.
///
/// `consumed` is how many bytes of the tile's packet stream were read.
/// `warning` records recoverable bitstream damage (truncation, a header
/// that ends mid-field); the tile is still reconstructed from whatever
/// decoded cleanly before the damage.
#[derive(Debug, Clone, Default)]
pub struct DecodeStatus {
    pub consumed: usize,
    pub warning: Option<J2kError>,
}

/// Image-level encoder: one packet stream per tile.
pub struct Encoder<'a> {
    image: &'a Image,
    cp: CodingParameters,
}

impl<'a> Encoder<'a> {
    /// Resolves `cp` against the image (tile grid, per-component parameter
    /// broadcast, step size synthesis) and validates the combination.
    pub fn new(image: &'a Image, mut cp: CodingParameters) -> Result<Self, J2kError> {
        cp.setup(image)?;
        Ok(Self { image, cp })
    }

    /// The resolved parameters. The decoder needs these verbatim.
    pub fn coding_parameters(&self) -> &CodingParameters {
        &self.cp
    }

    /// Encodes every tile in raster order.
    pub fn encode(&self) -> Result<Vec<Vec<u8>>, J2kError> {
        let (tiles_w, tiles_h) = self.cp.tile_grid(self.image);
        let mut streams = Vec::with_capacity((tiles_w * tiles_h) as usize);
        for tileno in 0..tiles_w * tiles_h {
            streams.push(encode_tile(self.image, &self.cp, tileno)?);
        }
        Ok(streams)
    }
}

/// Image-level decoder: rebuilds an image from per-tile packet streams.
pub struct Decoder {
    template: Image,
    cp: CodingParameters,
    opts: DecoderOptions,
}

impl Decoder {
    /// `template` describes the full-resolution geometry the encoder saw;
    /// its sample data is ignored. `cp` must be the encoder's resolved
    /// parameters (missing step sizes are re-synthesized the same way).
    pub fn new(
        template: Image,
        mut cp: CodingParameters,
        opts: DecoderOptions,
    ) -> Result<Self, J2kError> {
        cp.setup(&template)?;
        Ok(Self { template, cp, opts })
    }

    /// Decodes one packet stream per tile, raster order, into a fresh image
    /// `2^reduce` times smaller than the template on each axis.
    pub fn decode(&self, tiles: &[Vec<u8>]) -> Result<(Image, Vec<DecodeStatus>), J2kError> {
        let (tiles_w, tiles_h) = self.cp.tile_grid(&self.template);
        if tiles.len() != (tiles_w * tiles_h) as usize {
            return Err(J2kError::InvalidParameter(
                "one packet stream required per tile",
            ));
        }
        let mut out = reduced_image(&self.template, self.opts.reduce);
        let mut statuses = Vec::with_capacity(tiles.len());
        for (tileno, src) in tiles.iter().enumerate() {
            statuses.push(decode_tile(
                &mut out,
                &self.template,
                &self.cp,
                self.opts,
                tileno as u32,
                src,
            )?);
        }
        Ok((out, statuses))
    }
}

fn encode_tile(image: &Image, cp: &CodingParameters, tileno: u32) -> Result<Vec<u8>, J2kError> {
    let mut tile: EncTile = Tile::build(image, cp, tileno);
    load_tile(&mut tile, image);
    if cp.mct {
        forward_mct(&mut tile);
    }
    for (tilec, tccp) in tile.comps.iter_mut().zip(&cp.comps) {
        let (x0, y0, x1, y1) = (tilec.x0, tilec.y0, tilec.x1, tilec.y1);
        match &mut tilec.data {
            TileData::Int(data) => Dwt53::forward(data, x0, y0, x1, y1, tccp.num_resolutions),
            TileData::Real(data) => Dwt97::forward(data, x0, y0, x1, y1, tccp.num_resolutions),
        }
    }
    encode_blocks(&mut tile, cp);
    let mut dest = Vec::new();
    rate_allocate(&mut tile, image, cp, tileno, &mut dest)?;
    Ok(dest)
}

/// Copies the tile's window out of each component plane, removing the DC
/// offset so unsigned samples are centred around zero.
fn load_tile(tile: &mut EncTile, image: &Image) {
    for (tilec, comp) in tile.comps.iter_mut().zip(&image.comps) {
        let ix0 = ceil_div(image.x0, comp.dx) as i32;
        let iy0 = ceil_div(image.y0, comp.dy) as i32;
        let iw = comp.w as usize;
        let shift = comp.dc_offset();
        let w = tilec.width();
        let (x0, y0, x1, y1) = (tilec.x0, tilec.y0, tilec.x1, tilec.y1);
        match &mut tilec.data {
            TileData::Int(dst) => {
                for y in y0..y1 {
                    let src_row = (y - iy0) as usize * iw;
                    let dst_row = (y - y0) as usize * w;
                    for x in x0..x1 {
                        dst[dst_row + (x - x0) as usize] =
                            comp.data[src_row + (x - ix0) as usize] - shift;
                    }
                }
            }
            TileData::Real(dst) => {
                for y in y0..y1 {
                    let src_row = (y - iy0) as usize * iw;
                    let dst_row = (y - y0) as usize * w;
                    for x in x0..x1 {
                        dst[dst_row + (x - x0) as usize] =
                            (comp.data[src_row + (x - ix0) as usize] - shift) as f32;
                    }
                }
            }
        }
    }
}

fn forward_mct(tile: &mut EncTile) {
    let (c0, rest) = tile.comps.split_at_mut(1);
    let (c1, c2) = rest.split_at_mut(1);
    // Transformed components share one filter, so the variants agree.
    match (&mut c0[0].data, &mut c1[0].data, &mut c2[0].data) {
        (TileData::Int(a), TileData::Int(b), TileData::Int(c)) => mct::rct_forward(a, b, c),
        (TileData::Real(a), TileData::Real(b), TileData::Real(c)) => mct::ict_forward(a, b, c),
        _ => {}
    }
}

fn inverse_mct(tile: &mut DecTile) {
    let (c0, rest) = tile.comps.split_at_mut(1);
    let (c1, c2) = rest.split_at_mut(1);
    match (&mut c0[0].data, &mut c1[0].data, &mut c2[0].data) {
        (TileData::Int(a), TileData::Int(b), TileData::Int(c)) => mct::rct_inverse(a, b, c),
        (TileData::Real(a), TileData::Real(b), TileData::Real(c)) => mct::ict_inverse(a, b, c),
        _ => {}
    }
}

/// Offset of a band inside the packed wavelet buffer: detail bands sit to
/// the right of and below the previous resolution's rectangle.
fn band_offset(res_dims: &[(i32, i32)], resno: usize, orient: u32) -> (i32, i32) {
    let mut ox = 0;
    let mut oy = 0;
    if orient & 1 != 0 {
        ox = res_dims[resno - 1].0;
    }
    if orient & 2 != 0 {
        oy = res_dims[resno - 1].1;
    }
    (ox, oy)
}

/// Context-codes every code-block of the tile and accumulates the total
/// distortion the coded passes can remove.
fn encode_blocks(tile: &mut EncTile, cp: &CodingParameters) {
    let mct = cp.mct;
    let mut distortion = 0.0;
    for (compno, tilec) in tile.comps.iter_mut().enumerate() {
        let tccp = &cp.comps[compno];
        let style = tccp.cblk_style;
        let reversible = tccp.filter == WaveletFilter::Reversible53;
        let tile_w = tilec.width();
        let num_res = tilec.num_resolutions;
        let res_dims: Vec<(i32, i32)> = tilec
            .resolutions
            .iter()
            .map(|r| (r.width(), r.height()))
            .collect();
        let data = &tilec.data;
        for (resno, res) in tilec.resolutions.iter_mut().enumerate() {
            let level = num_res - 1 - resno as u32;
            for band in &mut res.bands {
                let (ox, oy) = band_offset(&res_dims, resno, band.orient);
                let w1 = if mct && compno < 3 {
                    mct::norm(compno, reversible)
                } else {
                    1.0
                };
                let msew = w1 * dwt::band_norm(reversible, band.orient, level) * band.stepsize as f64;
                let orient = band.orient;
                let (bx0, by0) = (band.x0, band.y0);
                let stepsize = band.stepsize;
                for prc in &mut band.precincts {
                    distortion += prc
                        .cblks
                        .par_iter_mut()
                        .map_init(T1Encoder::new, |t1, cblk| {
                            let w = cblk.width();
                            let h = cblk.height();
                            let x = (cblk.x0 - bx0 + ox) as usize;
                            let y = (cblk.y0 - by0 + oy) as usize;
                            let mut coeffs = Vec::with_capacity(w * h);
                            match data {
                                TileData::Int(src) => {
                                    for j in 0..h {
                                        let row = (y + j) * tile_w + x;
                                        for i in 0..w {
                                            coeffs.push(src[row + i] << NMSEDEC_FRACBITS);
                                        }
                                    }
                                }
                                TileData::Real(src) => {
                                    let scale = (1 << NMSEDEC_FRACBITS) as f32 / stepsize;
                                    for j in 0..h {
                                        let row = (y + j) * tile_w + x;
                                        for i in 0..w {
                                            coeffs.push((src[row + i] * scale) as i32);
                                        }
                                    }
                                }
                            }
                            let coded = t1.encode_cblk(&coeffs, w, h, orient, style, msew);
                            cblk.data = coded.data;
                            cblk.passes = coded.passes;
                            cblk.numbps = coded.numbps;
                            coded.distortion
                        })
                        .sum::<f64>();
                }
            }
        }
    }
    tile.distortion = distortion;
}

/// Distributes coded passes over the quality layers.
///
/// For each layer a bisection over the slope threshold searches for the
/// selection that meets the layer's target: a byte budget checked by
/// replaying packet emission, or a distortion target derived from the
/// requested ratio. A target of zero skips the search and takes every pass
/// still unassigned. The final packet stream is written to `dest`.
fn rate_allocate(
    tile: &mut EncTile,
    image: &Image,
    cp: &CodingParameters,
    tileno: u32,
    dest: &mut Vec<u8>,
) -> Result<(), J2kError> {
    let num_layers = cp.num_layers as usize;

    // Slope range over every pass of every code-block; layer bookkeeping
    // is sized here as well.
    let mut min_slope = f64::MAX;
    let mut max_slope = 0.0f64;
    for tilec in &mut tile.comps {
        for res in &mut tilec.resolutions {
            for band in &mut res.bands {
                for prc in &mut band.precincts {
                    for cblk in &mut prc.cblks {
                        cblk.layers = vec![Layer::default(); num_layers];
                        cblk.numpassesinlayers = 0;
                        let mut prev_rate = 0;
                        let mut prev_disto = 0.0;
                        for pass in &cblk.passes {
                            let dr = pass.rate - prev_rate;
                            let dd = pass.distortion - prev_disto;
                            prev_rate = pass.rate;
                            prev_disto = pass.distortion;
                            if dr == 0 {
                                continue;
                            }
                            let slope = dd / dr as f64;
                            min_slope = min_slope.min(slope);
                            max_slope = max_slope.max(slope);
                        }
                    }
                }
            }
        }
    }

    let mut max_se = 0.0;
    for (tilec, comp) in tile.comps.iter().zip(&image.comps) {
        let peak = ((1u64 << comp.prec) - 1) as f64;
        max_se += peak * peak * tilec.numpix as f64;
    }

    let mut cumdisto = 0.0;
    let mut scratch = Vec::new();
    for layno in 0..num_layers {
        let target = match cp.rate_control {
            RateControl::DistoAlloc => cp.layer_bytes[layno],
            RateControl::FixedQuality => cp.layer_ratios[layno],
        };
        if target <= 0.0 {
            // "Everything left" layer: no search needed.
            cumdisto += make_layer(tile, layno, min_slope, true);
            continue;
        }
        let maxlen = match cp.rate_control {
            RateControl::DistoAlloc => target.ceil() as usize,
            RateControl::FixedQuality => usize::MAX,
        };
        let distotarget = tile.distortion - max_se / 10f64.powf(target / 10.0);

        let mut lo = min_slope;
        let mut hi = max_slope;
        let mut good = None;
        let mut thresh = 0.0;
        for _ in 0..32 {
            thresh = (lo + hi) / 2.0;
            let distolayer = make_layer(tile, layno, thresh, false);
            match cp.rate_control {
                RateControl::DistoAlloc => {
                    scratch.clear();
                    match t2::encode_packets(tile, layno + 1, &mut scratch, maxlen) {
                        Ok(()) => {
                            hi = thresh;
                            good = Some(thresh);
                        }
                        Err(J2kError::PacketBudget) => lo = thresh,
                        Err(err) => return Err(err),
                    }
                }
                RateControl::FixedQuality => {
                    if cumdisto + distolayer < distotarget {
                        hi = thresh;
                    } else {
                        lo = thresh;
                        good = Some(thresh);
                    }
                }
            }
        }
        let goodthresh = match (good, cp.rate_control) {
            (Some(t), _) => t,
            // No selection fits the byte budget, not even the empty one.
            (None, RateControl::DistoAlloc) => return Err(J2kError::RateBudget { tile: tileno }),
            // Quality target out of reach; keep the most inclusive attempt.
            (None, RateControl::FixedQuality) => thresh,
        };
        debug!("tile {tileno} layer {layno}: slope threshold {goodthresh:.4e}");
        cumdisto += make_layer(tile, layno, goodthresh, true);
    }

    let final_budget = match cp.rate_control {
        RateControl::DistoAlloc => {
            let last = cp.layer_bytes[num_layers - 1];
            if last > 0.0 {
                last.ceil() as usize
            } else {
                usize::MAX
            }
        }
        RateControl::FixedQuality => usize::MAX,
    };
    match t2::encode_packets(tile, num_layers, dest, final_budget) {
        Ok(()) => Ok(()),
        Err(J2kError::PacketBudget) => Err(J2kError::RateBudget { tile: tileno }),
        Err(err) => Err(err),
    }
}

/// Assigns to layer `layno` every not-yet-assigned pass whose slope is at
/// least `thresh`, as a prefix extension per code-block. Returns the
/// distortion the layer removes; `fin` commits the assignment.
fn make_layer(tile: &mut EncTile, layno: usize, thresh: f64, fin: bool) -> f64 {
    let mut distolayer = 0.0;
    for tilec in &mut tile.comps {
        for res in &mut tilec.resolutions {
            for band in &mut res.bands {
                for prc in &mut band.precincts {
                    for cblk in &mut prc.cblks {
                        if layno == 0 {
                            cblk.numpassesinlayers = 0;
                        }
                        let first = cblk.numpassesinlayers as usize;
                        let mut n = first;
                        for passno in first..cblk.passes.len() {
                            let pass = cblk.passes[passno];
                            let (dr, dd) = if n == 0 {
                                (pass.rate, pass.distortion)
                            } else {
                                (
                                    pass.rate - cblk.passes[n - 1].rate,
                                    pass.distortion - cblk.passes[n - 1].distortion,
                                )
                            };
                            if dr == 0 {
                                // A free pass rides along with any later
                                // paying one; taken alone only if it still
                                // removes distortion.
                                if dd != 0.0 {
                                    n = passno + 1;
                                }
                                continue;
                            }
                            if thresh - dd / (dr as f64) < f64::EPSILON {
                                n = passno + 1;
                            }
                        }
                        let layer = &mut cblk.layers[layno];
                        layer.numpasses = (n - first) as u32;
                        if n == first {
                            layer.distortion = 0.0;
                            continue;
                        }
                        if first == 0 {
                            layer.start = 0;
                            layer.len = cblk.passes[n - 1].rate;
                            layer.distortion = cblk.passes[n - 1].distortion;
                        } else {
                            let prev = cblk.passes[first - 1];
                            layer.start = prev.rate;
                            layer.len = cblk.passes[n - 1].rate - prev.rate;
                            layer.distortion = cblk.passes[n - 1].distortion - prev.distortion;
                        }
                        distolayer += layer.distortion;
                        if fin {
                            cblk.numpassesinlayers = n as u32;
                        }
                    }
                }
            }
        }
    }
    distolayer
}

fn decode_tile(
    out: &mut Image,
    template: &Image,
    cp: &CodingParameters,
    opts: DecoderOptions,
    tileno: u32,
    src: &[u8],
) -> Result<DecodeStatus, J2kError> {
    let mut tile: DecTile = Tile::build(template, cp, tileno);
    for tilec in &tile.comps {
        if opts.reduce >= tilec.num_resolutions {
            return Err(J2kError::ReduceTooLarge {
                tile: tileno,
                reduce: opts.reduce,
                available: tilec.num_resolutions,
            });
        }
    }

    let mut status = DecodeStatus::default();
    match t2::decode_packets(&mut tile, cp, tileno, src, opts.max_layers) {
        Ok(consumed) => status.consumed = consumed,
        Err(err @ (J2kError::TruncatedStream { .. } | J2kError::MalformedPacket(_))) => {
            if let J2kError::TruncatedStream { offset, .. } = err {
                status.consumed = offset;
            }
            warn!("{err}; decoding what arrived");
            status.warning = Some(err);
        }
        Err(err) => return Err(err),
    }

    decode_blocks(&mut tile, cp);

    for (tilec, tccp) in tile.comps.iter_mut().zip(&cp.comps) {
        let numres = tccp.num_resolutions;
        let (x0, y0, x1, y1) = (tilec.x0, tilec.y0, tilec.x1, tilec.y1);
        match &mut tilec.data {
            TileData::Int(data) => {
                Dwt53::inverse(data, x0, y0, x1, y1, numres, numres - opts.reduce)
            }
            TileData::Real(data) => {
                Dwt97::inverse(data, x0, y0, x1, y1, numres, numres - opts.reduce)
            }
        }
    }

    if cp.mct {
        // Outside the synthesized rectangle the buffers still hold
        // coefficients; the transform runs over them too, and assembly
        // below reads only the synthesized part.
        inverse_mct(&mut tile);
    }

    store_tile(out, &tile, cp, opts.reduce);
    Ok(status)
}

/// Context-decodes every code-block and scatters the dequantized
/// coefficients into the wavelet buffer.
fn decode_blocks(tile: &mut DecTile, cp: &CodingParameters) {
    for (compno, tilec) in tile.comps.iter_mut().enumerate() {
        let tccp = &cp.comps[compno];
        let style = tccp.cblk_style;
        let reversible = tccp.filter == WaveletFilter::Reversible53;
        let tile_w = tilec.width();
        let res_dims: Vec<(i32, i32)> = tilec
            .resolutions
            .iter()
            .map(|r| (r.width(), r.height()))
            .collect();
        let data = &mut tilec.data;
        for (resno, res) in tilec.resolutions.iter().enumerate() {
            for band in &res.bands {
                let (ox, oy) = band_offset(&res_dims, resno, band.orient);
                let half_step = band.stepsize * 0.5;
                for prc in &band.precincts {
                    let decoded: Vec<Vec<i32>> = prc
                        .cblks
                        .par_iter()
                        .map_init(T1Decoder::new, |t1, cblk| {
                            t1.decode_cblk(cblk, band.orient, style);
                            t1.data().to_vec()
                        })
                        .collect();
                    for (cblk, vals) in prc.cblks.iter().zip(&decoded) {
                        let w = cblk.width();
                        let x = (cblk.x0 - band.x0 + ox) as usize;
                        let y = (cblk.y0 - band.y0 + oy) as usize;
                        match data {
                            TileData::Int(dst) => {
                                for (j, row) in vals.chunks_exact(w).enumerate() {
                                    let at = (y + j) * tile_w + x;
                                    for (i, &v) in row.iter().enumerate() {
                                        // Decoded values carry the doubled
                                        // scale; truncation recovers the
                                        // magnitude exactly.
                                        dst[at + i] = v / 2;
                                    }
                                }
                            }
                            TileData::Real(dst) => {
                                for (j, row) in vals.chunks_exact(w).enumerate() {
                                    let at = (y + j) * tile_w + x;
                                    for (i, &v) in row.iter().enumerate() {
                                        dst[at + i] = v as f32 * half_step;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Copies the synthesized rectangle of each tile component into the output
/// image, restoring the DC offset and clamping to the sample range.
fn store_tile(out: &mut Image, tile: &DecTile, cp: &CodingParameters, reduce: u32) {
    for ((tilec, comp), tccp) in tile.comps.iter().zip(out.comps.iter_mut()).zip(&cp.comps) {
        let res = &tilec.resolutions[(tccp.num_resolutions - 1 - reduce) as usize];
        let tile_w = tilec.width();
        let ox0 = ceil_div(out.x0, comp.dx) as i32;
        let oy0 = ceil_div(out.y0, comp.dy) as i32;
        let dst_w = comp.w as usize;
        let (min, max) = comp.sample_range();
        let shift = comp.dc_offset();
        match &tilec.data {
            TileData::Int(data) => {
                for y in res.y0..res.y1 {
                    let src_row = (y - res.y0) as usize * tile_w;
                    let dst_row = (y - oy0) as usize * dst_w;
                    for x in res.x0..res.x1 {
                        let v = data[src_row + (x - res.x0) as usize];
                        comp.data[dst_row + (x - ox0) as usize] = (v + shift).clamp(min, max);
                    }
                }
            }
            TileData::Real(data) => {
                for y in res.y0..res.y1 {
                    let src_row = (y - res.y0) as usize * tile_w;
                    let dst_row = (y - oy0) as usize * dst_w;
                    for x in res.x0..res.x1 {
                        let v = data[src_row + (x - res.x0) as usize].round() as i32;
                        comp.data[dst_row + (x - ox0) as usize] = (v + shift).clamp(min, max);
                    }
                }
            }
        }
    }
}

/// An empty image holding the template's geometry divided by `2^reduce`.
fn reduced_image(template: &Image, reduce: u32) -> Image {
    let r = reduce as i32;
    let mut out = Image {
        x0: ceil_div_pow2(template.x0 as i32, r) as u32,
        y0: ceil_div_pow2(template.y0 as i32, r) as u32,
        x1: ceil_div_pow2(template.x1 as i32, r) as u32,
        y1: ceil_div_pow2(template.y1 as i32, r) as u32,
        comps: Vec::with_capacity(template.comps.len()),
    };
    for c in &template.comps {
        let mut comp = ImageComponent {
            dx: c.dx,
            dy: c.dy,
            prec: c.prec,
            sgnd: c.sgnd,
            w: 0,
            h: 0,
            data: Vec::new(),
        };
        let (w, h) = comp.expected_size(&out);
        comp.w = w;
        comp.h = h;
        comp.data = vec![0; (w as usize) * (h as usize)];
        out.comps.push(comp);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ComponentParameters, QuantizationStyle};

    fn lcg(state: &mut u64) -> i32 {
        *state = state.wrapping_mul(1103515245).wrapping_add(12345);
        ((*state >> 16) & 0xFF) as i32 - 128
    }

    fn noise_image(w: u32, h: u32, numcomps: usize, seed: u64) -> Image {
        let mut image = Image::new(w, h, numcomps, 8, false);
        let mut state = seed;
        for comp in &mut image.comps {
            for v in &mut comp.data {
                *v = lcg(&mut state) + 128;
            }
        }
        image
    }

    fn small_cp() -> CodingParameters {
        CodingParameters {
            comps: vec![ComponentParameters {
                num_resolutions: 3,
                cblk_w_exp: 4,
                cblk_h_exp: 4,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    /// The full-resolution geometry with blank sample buffers, as a
    /// decoder-side caller would reconstruct it from stored metadata.
    fn geometry_of(image: &Image) -> Image {
        let mut template = image.clone();
        for comp in &mut template.comps {
            comp.data = vec![0; comp.data.len()];
        }
        template
    }

    fn roundtrip(
        image: &Image,
        cp: CodingParameters,
        opts: DecoderOptions,
    ) -> (Image, Vec<DecodeStatus>) {
        let encoder = Encoder::new(image, cp).unwrap();
        let streams = encoder.encode().unwrap();
        let decoder =
            Decoder::new(geometry_of(image), encoder.coding_parameters().clone(), opts).unwrap();
        decoder.decode(&streams).unwrap()
    }

    fn mean_abs_error(a: &[i32], b: &[i32]) -> f64 {
        let total: i64 = a
            .iter()
            .zip(b)
            .map(|(x, y)| ((x - y).abs()) as i64)
            .sum();
        total as f64 / a.len() as f64
    }

    #[test]
    fn lossless_round_trip_single_component() {
        let image = noise_image(37, 29, 1, 7);
        let (out, statuses) = roundtrip(&image, small_cp(), DecoderOptions::default());
        assert!(statuses[0].warning.is_none());
        assert_eq!(out.comps[0].data, image.comps[0].data);
    }

    #[test]
    fn flat_image_round_trips() {
        let image = Image::new(24, 24, 1, 8, false);
        let (out, _) = roundtrip(&image, small_cp(), DecoderOptions::default());
        assert_eq!(out.comps[0].data, image.comps[0].data);
    }

    #[test]
    fn all_zero_tile_codes_to_empty_packets() {
        // Signed zeros carry no DC offset, so every code-block stays
        // empty and the stream is one byte per packet.
        let image = Image::new(64, 64, 1, 8, true);
        let encoder = Encoder::new(&image, small_cp()).unwrap();
        let streams = encoder.encode().unwrap();
        assert_eq!(streams[0].len(), 3);
        let decoder = Decoder::new(
            geometry_of(&image),
            encoder.coding_parameters().clone(),
            DecoderOptions::default(),
        )
        .unwrap();
        let (out, statuses) = decoder.decode(&streams).unwrap();
        assert!(statuses[0].warning.is_none());
        assert!(out.comps[0].data.iter().all(|&v| v == 0));
    }

    #[test]
    fn single_sample_image_reconstructs_exactly() {
        let mut image = Image::new(1, 1, 1, 8, true);
        image.comps[0].data[0] = 100;
        let (out, statuses) = roundtrip(&image, small_cp(), DecoderOptions::default());
        assert!(statuses[0].warning.is_none());
        assert_eq!(out.comps[0].data, vec![100]);
    }

    #[test]
    fn lossless_round_trip_with_colour_transform() {
        let image = noise_image(32, 32, 3, 11);
        let mut cp = small_cp();
        cp.mct = true;
        let (out, statuses) = roundtrip(&image, cp, DecoderOptions::default());
        assert!(statuses[0].warning.is_none());
        for (a, b) in out.comps.iter().zip(&image.comps) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn subsampled_component_round_trips() {
        let mut image = Image::new(40, 40, 2, 8, false);
        image.comps[1].dx = 2;
        image.comps[1].dy = 2;
        image.comps[1].w = 20;
        image.comps[1].h = 20;
        image.comps[1].data = vec![0; 400];
        let mut state = 29;
        for comp in &mut image.comps {
            for v in &mut comp.data {
                *v = lcg(&mut state) + 128;
            }
        }
        let (out, _) = roundtrip(&image, small_cp(), DecoderOptions::default());
        for (a, b) in out.comps.iter().zip(&image.comps) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn tiled_image_reassembles_exactly() {
        let image = noise_image(50, 40, 1, 3);
        let mut cp = small_cp();
        cp.tdx = 32;
        cp.tdy = 32;
        let encoder = Encoder::new(&image, cp).unwrap();
        let streams = encoder.encode().unwrap();
        assert_eq!(streams.len(), 4);
        let decoder = Decoder::new(
            geometry_of(&image),
            encoder.coding_parameters().clone(),
            DecoderOptions::default(),
        )
        .unwrap();
        let (out, statuses) = decoder.decode(&streams).unwrap();
        assert_eq!(statuses.len(), 4);
        assert_eq!(out.comps[0].data, image.comps[0].data);
    }

    #[test]
    fn irreversible_path_stays_close() {
        let image = noise_image(32, 32, 1, 19);
        let mut cp = small_cp();
        cp.comps[0].filter = WaveletFilter::Irreversible97;
        cp.comps[0].quant_style = QuantizationStyle::ScalarExpounded;
        let (out, statuses) = roundtrip(&image, cp, DecoderOptions::default());
        assert!(statuses[0].warning.is_none());
        let worst = out.comps[0]
            .data
            .iter()
            .zip(&image.comps[0].data)
            .map(|(a, b)| (a - b).abs())
            .max()
            .unwrap();
        let mean = mean_abs_error(&out.comps[0].data, &image.comps[0].data);
        assert!(worst <= 12, "worst-case sample error {worst}");
        assert!(mean <= 2.0, "mean sample error {mean}");
    }

    #[test]
    fn rate_budget_caps_the_stream() {
        let image = noise_image(64, 64, 1, 5);
        let mut cp = small_cp();
        cp.layer_bytes = vec![512.0];
        let encoder = Encoder::new(&image, cp).unwrap();
        let streams = encoder.encode().unwrap();
        assert!(streams[0].len() <= 512, "stream is {} bytes", streams[0].len());
        let decoder = Decoder::new(
            geometry_of(&image),
            encoder.coding_parameters().clone(),
            DecoderOptions::default(),
        )
        .unwrap();
        let (out, statuses) = decoder.decode(&streams).unwrap();
        assert!(statuses[0].warning.is_none());
        // Heavy loss on noise, but far better than guessing mid-range.
        let mean = mean_abs_error(&out.comps[0].data, &image.comps[0].data);
        assert!(mean < 64.0, "mean sample error {mean}");
    }

    #[test]
    fn later_layers_refine_the_image() {
        let image = noise_image(48, 48, 1, 23);
        let mut cp = small_cp();
        cp.num_layers = 2;
        cp.layer_bytes = vec![256.0, 0.0];
        let encoder = Encoder::new(&image, cp).unwrap();
        let streams = encoder.encode().unwrap();
        let cp = encoder.coding_parameters().clone();

        let first_only = DecoderOptions {
            max_layers: 1,
            ..Default::default()
        };
        let decoder = Decoder::new(geometry_of(&image), cp.clone(), first_only).unwrap();
        let (coarse, _) = decoder.decode(&streams).unwrap();
        let coarse_err = mean_abs_error(&coarse.comps[0].data, &image.comps[0].data);
        assert!(coarse_err > 0.0);

        let decoder =
            Decoder::new(geometry_of(&image), cp, DecoderOptions::default()).unwrap();
        let (full, _) = decoder.decode(&streams).unwrap();
        // The trailing unconstrained layer completes the lossless stream.
        assert_eq!(full.comps[0].data, image.comps[0].data);
    }

    #[test]
    fn quality_mode_meets_targets_in_order() {
        let image = noise_image(48, 48, 1, 31);
        let mut cp = small_cp();
        cp.rate_control = RateControl::FixedQuality;
        cp.num_layers = 2;
        cp.layer_ratios = vec![20.0, 0.0];
        let encoder = Encoder::new(&image, cp).unwrap();
        let streams = encoder.encode().unwrap();
        let cp = encoder.coding_parameters().clone();

        let first_only = DecoderOptions {
            max_layers: 1,
            ..Default::default()
        };
        let decoder = Decoder::new(geometry_of(&image), cp.clone(), first_only).unwrap();
        let (coarse, _) = decoder.decode(&streams).unwrap();
        assert!(mean_abs_error(&coarse.comps[0].data, &image.comps[0].data) > 0.0);

        let decoder =
            Decoder::new(geometry_of(&image), cp, DecoderOptions::default()).unwrap();
        let (full, _) = decoder.decode(&streams).unwrap();
        assert_eq!(full.comps[0].data, image.comps[0].data);
    }

    #[test]
    fn reduced_decode_shrinks_the_grid() {
        let image = noise_image(45, 33, 1, 13);
        let opts = DecoderOptions {
            reduce: 1,
            ..Default::default()
        };
        let (out, statuses) = roundtrip(&image, small_cp(), opts);
        assert!(statuses[0].warning.is_none());
        assert_eq!((out.x1, out.y1), (23, 17));
        assert_eq!((out.comps[0].w, out.comps[0].h), (23, 17));
        assert!(out.validate().is_ok());
    }

    #[test]
    fn oversized_reduce_is_rejected() {
        let image = noise_image(16, 16, 1, 1);
        let encoder = Encoder::new(&image, small_cp()).unwrap();
        let streams = encoder.encode().unwrap();
        let opts = DecoderOptions {
            reduce: 3,
            ..Default::default()
        };
        let decoder =
            Decoder::new(geometry_of(&image), encoder.coding_parameters().clone(), opts).unwrap();
        assert!(matches!(
            decoder.decode(&streams),
            Err(J2kError::ReduceTooLarge {
                tile: 0,
                reduce: 3,
                available: 3
            })
        ));
    }

    #[test]
    fn truncated_stream_decodes_with_warning() {
        let image = noise_image(32, 32, 1, 17);
        let encoder = Encoder::new(&image, small_cp()).unwrap();
        let mut streams = encoder.encode().unwrap();
        let full = streams[0].len();
        streams[0].truncate(full - 40);
        let decoder = Decoder::new(
            geometry_of(&image),
            encoder.coding_parameters().clone(),
            DecoderOptions::default(),
        )
        .unwrap();
        let (out, statuses) = decoder.decode(&streams).unwrap();
        assert!(statuses[0].warning.is_some());
        assert!(statuses[0].consumed <= full - 40);
        // The coarse content survives; only late fine detail is lost.
        let mean = mean_abs_error(&out.comps[0].data, &image.comps[0].data);
        assert!(mean < 16.0, "mean sample error {mean}");
    }
}
