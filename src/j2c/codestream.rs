//! Resolution-layered codestream used by the built-in J2C engines.
//!
//! ```text
//! SOC FF4F
//! SIZ FF51 Lsiz:u16 width:u32 height:u32 components:u8 decompositions:u8 reversible:u8
//! COM FF64 Lcom:u16 text            (optional, repeatable)
//! SOT FF90 Psot:u32 payload         (one per resolution level, coarsest first)
//! EOC FFD9
//! ```
//!
//! All integers are big endian and marker lengths include their own two bytes. The first payload
//! holds the coarsest level verbatim. Every later payload holds one residual byte per sample
//! against a nearest-neighbour upsample of the reconstructed coarser level: wrapping differences
//! in reversible mode, differences quantized by [`QUANT_STEP`] otherwise.

use std::ops::Range;

use rayon::prelude::*;

use super::MAX_DISCARD_LEVEL;
use crate::foundation::error::{TexError, TexResult};

pub(crate) const SOC: u16 = 0xFF4F;
pub(crate) const SIZ: u16 = 0xFF51;
pub(crate) const COM: u16 = 0xFF64;
pub(crate) const SOT: u16 = 0xFF90;
pub(crate) const EOC: u16 = 0xFFD9;

const SIZ_LEN: u16 = 2 + 4 + 4 + 1 + 1 + 1;

/// Residual quantizer step in irreversible mode.
pub const QUANT_STEP: i32 = 4;

/// Header fields of a codestream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct J2cMetadata {
    /// Full-resolution width.
    pub width: u32,
    /// Full-resolution height.
    pub height: u32,
    /// Samples per pixel.
    pub components: u8,
    /// Number of halvings between the full image and the coarsest stored level.
    pub decompositions: u8,
    /// Residuals are exact.
    pub reversible: bool,
    /// Comment segments.
    pub comments: Vec<String>,
    /// Byte offset of the first SOT marker.
    pub header_len: usize,
}

impl J2cMetadata {
    /// Dimensions at `discard` halvings, rounded up.
    pub fn dims(&self, discard: u8) -> (u32, u32) {
        level_dims(self.width, self.height, discard)
    }

    /// Payload bytes of the level at `discard`.
    pub fn level_bytes(&self, discard: u8) -> usize {
        let (w, h) = self.dims(discard);
        w as usize * h as usize * self.components as usize
    }
}

/// `(ceil(w / 2^d), ceil(h / 2^d))`.
pub fn level_dims(width: u32, height: u32, discard: u8) -> (u32, u32) {
    let d = discard as u32;
    (
        width.div_ceil(1 << d).max(1),
        height.div_ceil(1 << d).max(1),
    )
}

/// Deepest decomposition that keeps the coarsest level at least one pixel on each side.
pub fn default_decompositions(width: u32, height: u32) -> u8 {
    let min_edge = width.min(height).max(1);
    (31 - min_edge.leading_zeros()).min(MAX_DISCARD_LEVEL as u32) as u8
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes([*data.get(at)?, *data.get(at + 1)?]))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    let b = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Parse the main header.
pub fn parse_header(data: &[u8]) -> TexResult<J2cMetadata> {
    let bad = |what: &str| TexError::uninitialized(format!("j2c header: {what}"));

    if be_u16(data, 0) != Some(SOC) {
        return Err(bad("missing SOC marker"));
    }
    if be_u16(data, 2) != Some(SIZ) || be_u16(data, 4) != Some(SIZ_LEN) {
        return Err(bad("missing SIZ segment"));
    }
    let width = be_u32(data, 6).ok_or_else(|| bad("truncated SIZ"))?;
    let height = be_u32(data, 10).ok_or_else(|| bad("truncated SIZ"))?;
    let fields = data.get(14..17).ok_or_else(|| bad("truncated SIZ"))?;
    let (components, decompositions, reversible) = (fields[0], fields[1], fields[2] != 0);

    if width == 0 || height == 0 {
        return Err(bad("zero-sized image"));
    }
    if !(1..=4).contains(&components) {
        return Err(bad("unsupported component count"));
    }
    if decompositions > MAX_DISCARD_LEVEL {
        return Err(bad("too many decompositions"));
    }

    let mut at = 17;
    let mut comments = Vec::new();
    loop {
        match be_u16(data, at) {
            Some(COM) => {
                let len = be_u16(data, at + 2).ok_or_else(|| bad("truncated COM"))? as usize;
                if len < 2 {
                    return Err(bad("bad COM length"));
                }
                let text = data
                    .get(at + 4..at + 2 + len)
                    .ok_or_else(|| bad("truncated COM"))?;
                comments.push(String::from_utf8_lossy(text).into_owned());
                at += 2 + len;
            }
            Some(SOT) | Some(EOC) | None => break,
            Some(m) => return Err(bad(&format!("unexpected marker {m:04X}"))),
        }
    }

    Ok(J2cMetadata {
        width,
        height,
        components,
        decompositions,
        reversible,
        comments,
        header_len: at,
    })
}

/// Byte ranges of the complete level payloads present in `data`, coarsest first.
pub fn level_spans(data: &[u8], meta: &J2cMetadata) -> TexResult<Vec<Range<usize>>> {
    let mut spans = Vec::new();
    let mut at = meta.header_len;
    let levels = meta.decompositions as usize + 1;

    while spans.len() < levels {
        match be_u16(data, at) {
            Some(SOT) => {}
            Some(EOC) | None => break,
            Some(m) => {
                return Err(TexError::decode(format!(
                    "unexpected marker {m:04X} at byte {at}"
                )));
            }
        }
        let Some(len) = be_u32(data, at + 2) else {
            break;
        };
        let start = at + 6;
        let end = start + len as usize;
        if end > data.len() {
            break;
        }
        let discard = meta.decompositions - spans.len() as u8;
        if len as usize != meta.level_bytes(discard) {
            return Err(TexError::decode(format!(
                "level {discard} payload holds {len} bytes, expected {}",
                meta.level_bytes(discard)
            )));
        }
        spans.push(start..end);
        at = end;
    }
    Ok(spans)
}

/// Row-parallel work distribution.
#[derive(Clone, Debug)]
pub enum Executor {
    /// Rows run on the calling thread.
    Serial,
    /// Rows are spread over a rayon pool.
    Pool(std::sync::Arc<rayon::ThreadPool>),
}

impl Executor {
    /// Run `f(row_index, row)` for every `row_bytes`-sized row of `out`.
    pub fn rows<F>(&self, out: &mut [u8], row_bytes: usize, f: F)
    where
        F: Fn(usize, &mut [u8]) + Send + Sync,
    {
        match self {
            Self::Serial => out
                .chunks_mut(row_bytes)
                .enumerate()
                .for_each(|(y, row)| f(y, row)),
            Self::Pool(pool) => pool.install(|| {
                out.par_chunks_mut(row_bytes)
                    .enumerate()
                    .for_each(|(y, row)| f(y, row))
            }),
        }
    }
}

/// Geometry of one refinement step.
#[derive(Clone, Copy, Debug)]
pub struct Refinement {
    /// Coarser level dimensions.
    pub coarse: (u32, u32),
    /// Finer level dimensions.
    pub fine: (u32, u32),
    /// Samples per pixel.
    pub components: usize,
    /// Exact residuals.
    pub reversible: bool,
}

impl Refinement {
    fn row_bytes(&self) -> usize {
        self.fine.0 as usize * self.components
    }

    #[inline]
    fn predict(&self, coarse: &[u8], x: usize, y: usize, c: usize) -> u8 {
        let (cw, ch) = (self.coarse.0 as usize, self.coarse.1 as usize);
        let (fw, fh) = (self.fine.0 as usize, self.fine.1 as usize);
        let sx = (x * cw / fw).min(cw - 1);
        let sy = (y * ch / fh).min(ch - 1);
        coarse[(sy * cw + sx) * self.components + c]
    }

    /// Rebuild fine rows `rows` from `coarse` and the level payload into `out` (which holds
    /// exactly those rows).
    pub fn reconstruct(
        &self,
        exec: &Executor,
        coarse: &[u8],
        payload: &[u8],
        rows: Range<usize>,
        out: &mut [u8],
    ) {
        let row_bytes = self.row_bytes();
        let first = rows.start;
        exec.rows(out, row_bytes, |i, row| {
            let y = first + i;
            let res_row = &payload[y * row_bytes..(y + 1) * row_bytes];
            for (k, (dst, &res)) in row.iter_mut().zip(res_row).enumerate() {
                let (x, c) = (k / self.components, k % self.components);
                let pred = self.predict(coarse, x, y, c);
                *dst = if self.reversible {
                    pred.wrapping_add(res)
                } else {
                    (pred as i32 + (res as i8) as i32 * QUANT_STEP).clamp(0, 255) as u8
                };
            }
        });
    }

    /// Residuals of `fine` against the upsampled `coarse`, plus the decoder-side reconstruction
    /// used to predict the next level.
    pub fn residuals(&self, exec: &Executor, coarse: &[u8], fine: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let row_bytes = self.row_bytes();
        let mut residual = vec![0u8; fine.len()];
        exec.rows(&mut residual, row_bytes, |y, row| {
            let src = &fine[y * row_bytes..(y + 1) * row_bytes];
            for (k, (dst, &v)) in row.iter_mut().zip(src).enumerate() {
                let (x, c) = (k / self.components, k % self.components);
                let pred = self.predict(coarse, x, y, c);
                *dst = if self.reversible {
                    v.wrapping_sub(pred)
                } else {
                    let diff = v as i32 - pred as i32;
                    let q = (diff as f32 / QUANT_STEP as f32).round() as i32;
                    (q.clamp(-128, 127) as i8) as u8
                };
            }
        });

        if self.reversible {
            return (residual, fine.to_vec());
        }
        let mut recon = vec![0u8; fine.len()];
        let rows = 0..self.fine.1 as usize;
        self.reconstruct(exec, coarse, &residual, rows, &mut recon);
        (residual, recon)
    }
}

/// Append a marker segment header.
pub(crate) fn put_marker(out: &mut Vec<u8>, marker: u16) {
    out.extend_from_slice(&marker.to_be_bytes());
}

/// Write SOC, SIZ and any COM segments.
pub(crate) fn write_header(out: &mut Vec<u8>, meta: &J2cMetadata) {
    put_marker(out, SOC);
    put_marker(out, SIZ);
    out.extend_from_slice(&SIZ_LEN.to_be_bytes());
    out.extend_from_slice(&meta.width.to_be_bytes());
    out.extend_from_slice(&meta.height.to_be_bytes());
    out.extend_from_slice(&[meta.components, meta.decompositions, meta.reversible as u8]);
    for comment in &meta.comments {
        let bytes = comment.as_bytes();
        let len = bytes.len().min(u16::MAX as usize - 2);
        put_marker(out, COM);
        out.extend_from_slice(&((len + 2) as u16).to_be_bytes());
        out.extend_from_slice(&bytes[..len]);
    }
}

/// Write one SOT segment.
pub(crate) fn write_level(out: &mut Vec<u8>, payload: &[u8]) {
    put_marker(out, SOT);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

#[cfg(test)]
#[path = "../../tests/unit/j2c/codestream.rs"]
mod tests;
