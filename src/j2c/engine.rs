use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use super::codestream::{
    EOC, Executor, J2cMetadata, Refinement, default_decompositions, level_spans, parse_header,
    put_marker, write_header, write_level,
};
use crate::foundation::clock::Deadline;
use crate::foundation::error::{TexError, TexResult};
use crate::raw::PixelBuffer;

/// Rows reconstructed between deadline checks.
const BAND_ROWS: usize = 32;

/// Which engine to resolve at first use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnginePreference {
    /// Row-parallel engine on a dedicated rayon pool, falling back to the built-in engine.
    #[default]
    Accelerated,
    /// Single-threaded built-in engine.
    Builtin,
}

/// A fully decoded resolution level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLevel {
    /// Interleaved samples.
    pub pixels: Vec<u8>,
    /// Level width.
    pub width: u32,
    /// Level height.
    pub height: u32,
    /// Samples per pixel.
    pub components: u8,
    /// Discard level actually reached.
    pub discard_level: u8,
}

/// Outcome of one [`J2cImpl::decode_impl`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeProgress {
    /// The deadline expired; state is kept for the next call.
    Pending,
    /// Decoding finished.
    Done(DecodedLevel),
}

/// One codec instance. Owned by a single image; holds the resumable decode cursor.
pub trait J2cImpl: Send + std::fmt::Debug {
    /// Parse the main header.
    fn get_metadata(&mut self, data: &[u8]) -> TexResult<J2cMetadata>;

    /// Decode toward `discard_level`, stopping early at the finest complete level in `data`.
    /// Returns [`DecodeProgress::Pending`] only when `deadline` expired with work left.
    fn decode_impl(
        &mut self,
        data: &[u8],
        discard_level: u8,
        deadline: &Deadline,
    ) -> TexResult<DecodeProgress>;

    /// Encode `raw` into a new codestream.
    fn encode_impl(
        &mut self,
        raw: &PixelBuffer,
        comment: Option<&str>,
        reversible: bool,
        decompositions: Option<u8>,
    ) -> TexResult<Vec<u8>>;

    /// Drop any suspended decode.
    fn reset(&mut self);
}

/// Factory for codec instances. Dropping a returned instance destroys it.
pub trait J2cEngine: Send + Sync + std::fmt::Debug {
    /// A fresh codec instance.
    fn create(&self) -> Box<dyn J2cImpl>;

    /// Human-readable engine name and version.
    fn engine_info(&self) -> String;
}

/// The single-threaded engine every build can fall back to.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEngine;

impl J2cEngine for BuiltinEngine {
    fn create(&self) -> Box<dyn J2cImpl> {
        Box::new(LayeredJ2c::new(Executor::Serial))
    }

    fn engine_info(&self) -> String {
        format!("texstream built-in layered codec {}", env!("CARGO_PKG_VERSION"))
    }
}

/// Engine that spreads row reconstruction over a rayon pool.
#[derive(Debug, Clone)]
pub struct ParallelEngine {
    pool: Arc<rayon::ThreadPool>,
}

impl ParallelEngine {
    /// Build the engine's thread pool.
    pub fn new(threads: Option<usize>) -> TexResult<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|i| format!("texstream-j2c-{i}"));
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build().map_err(|e| {
            TexError::codec_unavailable(format!("failed to build j2c thread pool: {e}"))
        })?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

impl J2cEngine for ParallelEngine {
    fn create(&self) -> Box<dyn J2cImpl> {
        Box::new(LayeredJ2c::new(Executor::Pool(Arc::clone(&self.pool))))
    }

    fn engine_info(&self) -> String {
        format!(
            "texstream parallel layered codec {} ({} threads)",
            env!("CARGO_PKG_VERSION"),
            self.pool.current_num_threads()
        )
    }
}

static ENGINE: OnceLock<Box<dyn J2cEngine>> = OnceLock::new();

fn resolve(preference: EnginePreference, threads: Option<usize>) -> Box<dyn J2cEngine> {
    let engine: Box<dyn J2cEngine> = match preference {
        EnginePreference::Builtin => Box::new(BuiltinEngine),
        EnginePreference::Accelerated => match ParallelEngine::new(threads) {
            Ok(e) => Box::new(e),
            Err(e) => {
                tracing::warn!(error = %e, "accelerated j2c engine unavailable, using built-in");
                Box::new(BuiltinEngine)
            }
        },
    };
    tracing::info!(engine = %engine.engine_info(), "j2c engine resolved");
    engine
}

/// Resolve the process-wide engine. Only the first call's arguments take effect.
pub fn init_engine(preference: EnginePreference, threads: Option<usize>) -> &'static dyn J2cEngine {
    if ENGINE.get().is_some() {
        tracing::debug!(?preference, "j2c engine already resolved");
    }
    ENGINE.get_or_init(|| resolve(preference, threads)).as_ref()
}

/// The process-wide engine, resolving it with defaults if nothing has yet.
pub fn engine() -> &'static dyn J2cEngine {
    init_engine(EnginePreference::default(), None)
}

#[derive(Debug)]
struct PartialLevel {
    out: Vec<u8>,
    next_row: usize,
}

#[derive(Debug)]
struct DecodeCursor {
    meta: J2cMetadata,
    levels_done: usize,
    recon: Vec<u8>,
    recon_dims: (u32, u32),
    partial: Option<PartialLevel>,
}

/// Codec instance for the layered codestream.
#[derive(Debug)]
struct LayeredJ2c {
    exec: Executor,
    cursor: Option<DecodeCursor>,
}

impl LayeredJ2c {
    fn new(exec: Executor) -> Self {
        Self { exec, cursor: None }
    }
}

impl J2cImpl for LayeredJ2c {
    fn get_metadata(&mut self, data: &[u8]) -> TexResult<J2cMetadata> {
        parse_header(data)
    }

    fn decode_impl(
        &mut self,
        data: &[u8],
        discard_level: u8,
        deadline: &Deadline,
    ) -> TexResult<DecodeProgress> {
        if self.cursor.is_none() {
            self.cursor = Some(DecodeCursor {
                meta: parse_header(data)?,
                levels_done: 0,
                recon: Vec::new(),
                recon_dims: (0, 0),
                partial: None,
            });
        }
        let Self { exec, cursor } = self;
        let Some(cur) = cursor.as_mut() else {
            return Err(TexError::decode("decode cursor missing"));
        };

        let spans = level_spans(data, &cur.meta)?;
        if spans.is_empty() {
            *cursor = None;
            return Err(TexError::decode("no complete resolution level in stream"));
        }
        let coarsest = cur.meta.decompositions;
        let wanted = discard_level.min(coarsest);
        let stop = ((coarsest - wanted) as usize + 1).min(spans.len());
        let comps = cur.meta.components as usize;

        let mut worked = false;
        while cur.levels_done < stop {
            if worked && deadline.expired() {
                return Ok(DecodeProgress::Pending);
            }
            worked = true;

            let payload = &data[spans[cur.levels_done].clone()];
            if cur.levels_done == 0 {
                cur.recon = payload.to_vec();
                cur.recon_dims = cur.meta.dims(coarsest);
                cur.levels_done = 1;
                continue;
            }

            let fine = cur.meta.dims(coarsest - cur.levels_done as u8);
            let step = Refinement {
                coarse: cur.recon_dims,
                fine,
                components: comps,
                reversible: cur.meta.reversible,
            };
            let row_bytes = fine.0 as usize * comps;
            let level_len = row_bytes * fine.1 as usize;
            let partial = cur.partial.get_or_insert_with(|| PartialLevel {
                out: vec![0u8; level_len],
                next_row: 0,
            });
            let start = partial.next_row;
            let end = (start + BAND_ROWS).min(fine.1 as usize);
            step.reconstruct(
                exec,
                &cur.recon,
                payload,
                start..end,
                &mut partial.out[start * row_bytes..end * row_bytes],
            );
            partial.next_row = end;

            if end == fine.1 as usize {
                if let Some(done) = cur.partial.take() {
                    cur.recon = done.out;
                }
                cur.recon_dims = fine;
                cur.levels_done += 1;
            }
        }

        let Some(done) = cursor.take() else {
            return Err(TexError::decode("decode cursor missing"));
        };
        let (width, height) = done.recon_dims;
        Ok(DecodeProgress::Done(DecodedLevel {
            pixels: done.recon,
            width,
            height,
            components: done.meta.components,
            discard_level: coarsest - (done.levels_done - 1) as u8,
        }))
    }

    fn encode_impl(
        &mut self,
        raw: &PixelBuffer,
        comment: Option<&str>,
        reversible: bool,
        decompositions: Option<u8>,
    ) -> TexResult<Vec<u8>> {
        if !matches!(raw.components(), 1 | 3 | 4) || raw.is_buffer_invalid() {
            return Err(TexError::encode(format!(
                "cannot encode {}x{}x{} buffer",
                raw.width(),
                raw.height(),
                raw.components()
            )));
        }
        let (w, h) = (raw.width(), raw.height());
        let fits = default_decompositions(w, h);
        let depth = decompositions.unwrap_or(fits).min(fits);
        let meta = J2cMetadata {
            width: w,
            height: h,
            components: raw.components(),
            decompositions: depth,
            reversible,
            comments: comment.map(|c| vec![c.to_owned()]).unwrap_or_default(),
            header_len: 0,
        };

        let mut pyramid = Vec::with_capacity(depth as usize + 1);
        pyramid.push(raw.clone());
        for d in 1..=depth {
            let (lw, lh) = meta.dims(d);
            let mut next = pyramid[d as usize - 1].clone();
            next.scale(lw, lh, true)?;
            pyramid.push(next);
        }

        let mut out = Vec::with_capacity(raw.data_size() * 4 / 3 + 64);
        write_header(&mut out, &meta);

        let coarsest = &pyramid[depth as usize];
        write_level(&mut out, coarsest.data());
        let mut recon = coarsest.data().to_vec();
        for d in (0..depth).rev() {
            let step = Refinement {
                coarse: meta.dims(d + 1),
                fine: meta.dims(d),
                components: meta.components as usize,
                reversible,
            };
            let (residual, next) = step.residuals(&self.exec, &recon, pyramid[d as usize].data());
            write_level(&mut out, &residual);
            recon = next;
        }
        put_marker(&mut out, EOC);

        tracing::debug!(
            width = w,
            height = h,
            levels = depth + 1,
            bytes = out.len(),
            "encoded j2c codestream"
        );
        Ok(out)
    }

    fn reset(&mut self) {
        self.cursor = None;
    }
}

#[cfg(test)]
#[path = "../../tests/unit/j2c/engine.rs"]
mod tests;
