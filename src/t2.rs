//! Tier-2 coding: packet headers and packet bodies (ISO/IEC 15444-1 B.9).
//!
//! A packet is the intersection of one quality layer with one precinct of
//! one resolution of one component. Its header codes, per code-block:
//! inclusion (through a tag tree until the block first contributes, a
//! single bit afterwards), the missing bit-plane count on first inclusion,
//! the number of added passes, and the byte length of every codeword
//! segment those passes touch. The body is the raw codeword bytes in the
//! same order.
//!
//! Both sides walk packets in layer-resolution-component-position
//! progression. Emission restarts cleanly from layer zero, which is what
//! lets rate allocation replay the encoder over candidate layer
//! assignments until one fits the byte budget.

use crate::bio::{BitReader, BitWriter};
use crate::error::J2kError;
use crate::floor_log2;
use crate::params::{CodingParameters, CBLKSTY_LAZY, CBLKSTY_TERMALL};
use crate::tile::{DecTile, EncTile, Segment};

/// Coordinates of one packet in the progression.
#[derive(Clone, Copy)]
struct PacketPos {
    compno: usize,
    resno: usize,
    precno: usize,
    layno: usize,
}

/// Codes a pass count (ISO/IEC 15444-1 B.10.6).
fn put_numpasses(bio: &mut BitWriter, n: u32) {
    if n == 1 {
        bio.write(0, 1);
    } else if n == 2 {
        bio.write(2, 2);
    } else if n <= 5 {
        bio.write(0xC | (n - 3), 4);
    } else if n <= 36 {
        bio.write(0x1E0 | (n - 6), 9);
    } else {
        bio.write(0xFF80 | (n - 37), 16);
    }
}

fn get_numpasses(bio: &mut BitReader) -> Result<u32, ()> {
    if bio.get_bit()? == 0 {
        return Ok(1);
    }
    if bio.get_bit()? == 0 {
        return Ok(2);
    }
    let n = bio.read(2)?;
    if n != 3 {
        return Ok(3 + n);
    }
    let n = bio.read(5)?;
    if n != 31 {
        return Ok(6 + n);
    }
    Ok(37 + bio.read(7)?)
}

/// Codes a length-indicator increment as a run of ones closed by a zero.
fn put_commacode(bio: &mut BitWriter, n: u32) {
    for _ in 0..n {
        bio.put_bit(1);
    }
    bio.put_bit(0);
}

fn get_commacode(bio: &mut BitReader) -> Result<u32, ()> {
    let mut n = 0;
    while bio.get_bit()? == 1 {
        n += 1;
    }
    Ok(n)
}

/// Appends a fresh codeword segment, sized by the code-block style: one
/// pass under per-pass termination, the 10/2/1 alternation under selective
/// bypass, otherwise unbounded in practice.
fn push_seg(segs: &mut Vec<Segment>, style: u8) {
    let maxpasses = if style & CBLKSTY_TERMALL != 0 {
        1
    } else if style & CBLKSTY_LAZY != 0 {
        match segs.last().map(|s| s.maxpasses) {
            None => 10,
            Some(1) | Some(10) => 2,
            Some(_) => 1,
        }
    } else {
        // More passes than any code-block can produce.
        109
    };
    segs.push(Segment {
        maxpasses,
        ..Segment::default()
    });
}

/// Emits one packet, header then body, appended to `dest`.
///
/// Tag trees, committed pass counts and length-field widths live on the
/// tile between calls; entering layer zero resets them.
fn encode_packet(
    tile: &mut EncTile,
    pos: PacketPos,
    dest: &mut Vec<u8>,
    max_len: usize,
) -> Result<(), J2kError> {
    let res = &mut tile.comps[pos.compno].resolutions[pos.resno];
    let precno = pos.precno;
    let layno = pos.layno;

    if layno == 0 {
        for band in &mut res.bands {
            let numbps = band.numbps;
            let prc = &mut band.precincts[precno];
            prc.incltree.reset();
            prc.imsbtree.reset();
            for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
                cblk.numpasses = 0;
                prc.imsbtree.set_value(cblkno, numbps - cblk.numbps);
            }
        }
    }

    let mut bio = BitWriter::new();

    let present = res.bands.iter().any(|band| {
        band.precincts[precno]
            .cblks
            .iter()
            .any(|cblk| cblk.layers[layno].numpasses != 0)
    });
    bio.put_bit(present as u32);
    if !present {
        let header = bio.finish();
        if dest.len() + header.len() > max_len {
            return Err(J2kError::PacketBudget);
        }
        dest.extend_from_slice(&header);
        return Ok(());
    }

    for band in &mut res.bands {
        let prc = &mut band.precincts[precno];

        // Tag-tree values must all be in place before any of them are
        // coded, or the running minima shift under the coder.
        for (cblkno, cblk) in prc.cblks.iter().enumerate() {
            if cblk.numpasses == 0 && cblk.layers[layno].numpasses != 0 {
                prc.incltree.set_value(cblkno, layno as i32);
            }
        }

        for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
            let layer = cblk.layers[layno];

            if cblk.numpasses == 0 {
                prc.incltree.encode(&mut bio, cblkno, layno as i32 + 1);
            } else {
                bio.put_bit((layer.numpasses != 0) as u32);
            }
            if layer.numpasses == 0 {
                continue;
            }
            if cblk.numpasses == 0 {
                cblk.numlenbits = 3;
                prc.imsbtree.encode(&mut bio, cblkno, 999);
            }
            put_numpasses(&mut bio, layer.numpasses);

            // Passes up to each termination share one length field. Work
            // out the widest field first, then emit the lengths.
            let first = cblk.numpasses as usize;
            let last = first + layer.numpasses as usize;
            let mut groups: Vec<(u32, usize)> = Vec::new();
            let mut nump = 0;
            let mut len = 0;
            for (i, pass) in cblk.passes[first..last].iter().enumerate() {
                nump += 1;
                len += pass.len;
                if pass.term || first + i == last - 1 {
                    groups.push((nump, len));
                    nump = 0;
                    len = 0;
                }
            }

            let mut increment = 0;
            for &(nump, len) in &groups {
                let need = floor_log2(len.max(1) as i32) + 1;
                increment =
                    increment.max(need - (cblk.numlenbits as i32 + floor_log2(nump as i32)));
            }
            put_commacode(&mut bio, increment as u32);
            cblk.numlenbits = (cblk.numlenbits as i32 + increment) as u32;

            for &(nump, len) in &groups {
                bio.write(len as u32, cblk.numlenbits + floor_log2(nump as i32) as u32);
            }
        }
    }

    let header = bio.finish();
    if dest.len() + header.len() > max_len {
        return Err(J2kError::PacketBudget);
    }
    dest.extend_from_slice(&header);

    for band in &mut res.bands {
        let prc = &mut band.precincts[precno];
        for cblk in &mut prc.cblks {
            let layer = cblk.layers[layno];
            if layer.numpasses == 0 {
                continue;
            }
            if dest.len() + layer.len > max_len {
                return Err(J2kError::PacketBudget);
            }
            dest.extend_from_slice(&cblk.data[layer.start..layer.start + layer.len]);
            cblk.numpasses += layer.numpasses;
        }
    }
    Ok(())
}

/// Emits every packet of the tile, appending to `dest`.
///
/// `max_len` bounds the total size; [`J2kError::PacketBudget`] reports the
/// first packet that does not fit. Rate allocation probes candidate layer
/// assignments by calling this with trial budgets and treating the error
/// as "too big".
pub fn encode_packets(
    tile: &mut EncTile,
    num_layers: usize,
    dest: &mut Vec<u8>,
    max_len: usize,
) -> Result<(), J2kError> {
    let max_res = tile.max_resolutions() as usize;
    for layno in 0..num_layers {
        for resno in 0..max_res {
            for compno in 0..tile.comps.len() {
                if resno >= tile.comps[compno].num_resolutions as usize {
                    continue;
                }
                let res = &tile.comps[compno].resolutions[resno];
                let num_prcs = (res.pw * res.ph) as usize;
                for precno in 0..num_prcs {
                    let pos = PacketPos {
                        compno,
                        resno,
                        precno,
                        layno,
                    };
                    encode_packet(tile, pos, dest, max_len)?;
                }
            }
        }
    }
    Ok(())
}

/// Packet headers are parsed from a bounded slice; running out of bits
/// means the header lies about its own contents, not that the stream was
/// merely cut short.
fn hdr<T>(read: Result<T, ()>) -> Result<T, J2kError> {
    read.map_err(|_| J2kError::MalformedPacket("header ends mid-field"))
}

/// Reads one packet starting at `start`; returns the position after it.
///
/// Header damage fails the packet. A body cut short by the end of the
/// slice keeps whatever bytes arrived (the block coder synthesizes the
/// rest) and reports the truncation with the position reached.
fn decode_packet(
    tile: &mut DecTile,
    style: u8,
    tileno: u32,
    pos: PacketPos,
    src: &[u8],
    start: usize,
) -> Result<usize, J2kError> {
    let res = &mut tile.comps[pos.compno].resolutions[pos.resno];
    let precno = pos.precno;
    let layno = pos.layno;

    if layno == 0 {
        for band in &mut res.bands {
            if band.x0 == band.x1 || band.y0 == band.y1 {
                continue;
            }
            let prc = &mut band.precincts[precno];
            prc.incltree.reset();
            prc.imsbtree.reset();
            for cblk in &mut prc.cblks {
                cblk.segs.clear();
                cblk.data.clear();
            }
        }
    }

    let mut bio = BitReader::new(&src[start..]);

    if hdr(bio.get_bit())? == 0 {
        hdr(bio.align())?;
        return Ok(start + bio.position());
    }

    for band in &mut res.bands {
        if band.x0 == band.x1 || band.y0 == band.y1 {
            continue;
        }
        let numbps = band.numbps;
        let prc = &mut band.precincts[precno];
        for (cblkno, cblk) in prc.cblks.iter_mut().enumerate() {
            let included = if cblk.segs.is_empty() {
                hdr(prc.incltree.decode(&mut bio, cblkno, layno as i32 + 1))?
            } else {
                hdr(bio.get_bit())? == 1
            };
            if !included {
                continue;
            }

            if cblk.segs.is_empty() {
                let mut missing = 0;
                while !hdr(prc.imsbtree.decode(&mut bio, cblkno, missing + 1))? {
                    missing += 1;
                }
                cblk.numbps = numbps - missing;
                cblk.numlenbits = 3;
                push_seg(&mut cblk.segs, style);
            }

            let mut numnewpasses = hdr(get_numpasses(&mut bio))?;
            cblk.numlenbits += hdr(get_commacode(&mut bio))?;

            let mut segno = cblk.segs.len() - 1;
            if cblk.segs[segno].numpasses == cblk.segs[segno].maxpasses {
                push_seg(&mut cblk.segs, style);
                segno += 1;
            }
            loop {
                let seg = &mut cblk.segs[segno];
                seg.numnewpasses = (seg.maxpasses - seg.numpasses).min(numnewpasses);
                let bits = cblk.numlenbits + floor_log2(seg.numnewpasses as i32) as u32;
                seg.newlen = hdr(bio.read(bits))? as usize;
                numnewpasses -= seg.numnewpasses;
                if numnewpasses == 0 {
                    break;
                }
                push_seg(&mut cblk.segs, style);
                segno += 1;
            }
        }
    }
    hdr(bio.align())?;
    let mut at = start + bio.position();

    // Drain every announced segment, short ones included, so a truncated
    // stream still leaves consistent per-segment state behind.
    let mut truncated = false;
    for band in &mut res.bands {
        if band.x0 == band.x1 || band.y0 == band.y1 {
            continue;
        }
        let prc = &mut band.precincts[precno];
        for cblk in &mut prc.cblks {
            for seg in &mut cblk.segs {
                if seg.numnewpasses == 0 {
                    continue;
                }
                let take = seg.newlen.min(src.len() - at);
                truncated |= take < seg.newlen;
                if seg.len == 0 {
                    seg.start = cblk.data.len();
                }
                cblk.data.extend_from_slice(&src[at..at + take]);
                at += take;
                seg.len += take;
                seg.numpasses += seg.numnewpasses;
                seg.numnewpasses = 0;
                seg.newlen = 0;
            }
        }
    }
    if truncated {
        return Err(J2kError::TruncatedStream {
            tile: tileno,
            offset: at,
        });
    }
    Ok(at)
}

/// Reads every packet of the tile from `src`, in the progression the
/// encoder wrote them. `max_layers` of zero means all coded layers.
/// Returns the bytes consumed.
pub fn decode_packets(
    tile: &mut DecTile,
    cp: &CodingParameters,
    tileno: u32,
    src: &[u8],
    max_layers: u32,
) -> Result<usize, J2kError> {
    let num_layers = if max_layers == 0 {
        cp.num_layers
    } else {
        cp.num_layers.min(max_layers)
    } as usize;
    let max_res = tile.max_resolutions() as usize;
    let mut at = 0;
    for layno in 0..num_layers {
        for resno in 0..max_res {
            for compno in 0..tile.comps.len() {
                if resno >= tile.comps[compno].num_resolutions as usize {
                    continue;
                }
                let res = &tile.comps[compno].resolutions[resno];
                let num_prcs = (res.pw * res.ph) as usize;
                let style = cp.comps[compno].cblk_style;
                for precno in 0..num_prcs {
                    let pos = PacketPos {
                        compno,
                        resno,
                        precno,
                        layno,
                    };
                    at = decode_packet(tile, style, tileno, pos, src, at)?;
                }
            }
        }
    }
    Ok(at)
}
