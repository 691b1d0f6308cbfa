//! JPEG2000-style progressive codec and its engine indirection.
//!
//! The engine is resolved once per process ([`init_engine`]); every [`J2cCodec`] asks the resolved
//! engine for a fresh [`J2cImpl`] instance.

mod codec;
pub mod codestream;
mod engine;

use serde::{Deserialize, Serialize};

use crate::foundation::error::{TexError, TexResult};

pub use codec::J2cCodec;
pub use codestream::J2cMetadata;
pub use engine::{
    BuiltinEngine, DecodeProgress, DecodedLevel, EnginePreference, J2cEngine, J2cImpl,
    ParallelEngine, engine, init_engine,
};

/// Coarsest discard level a J2C image reports.
pub const MAX_DISCARD_LEVEL: u8 = 5;
/// Lower bound for any size estimate: the main header plus the first packet.
pub const FIRST_PACKET_SIZE: usize = 600;
/// Compression rate assumed when none is configured.
pub const DEFAULT_COMPRESSION_RATE: f32 = 1.0 / 8.0;
/// Fraction of a level's estimated size accepted as "enough" to decode it.
pub const DEFAULT_LENIENCY: f32 = 0.75;

/// J2C codec and engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct J2cConfig {
    /// Compressed bytes per uncompressed byte used by size estimates. `0` selects
    /// [`DEFAULT_COMPRESSION_RATE`].
    pub rate: f32,
    /// Fraction of a level's estimated size that counts as enough to decode it.
    pub leniency: f32,
    /// Encode with exact residuals.
    pub reversible: bool,
    /// Encoder decomposition depth, `None` picks the deepest that fits.
    pub decompositions: Option<u8>,
    /// Engine to resolve at first use.
    pub engine: EnginePreference,
    /// Worker threads for the accelerated engine, `None` for rayon's default.
    pub engine_threads: Option<usize>,
}

impl Default for J2cConfig {
    fn default() -> Self {
        Self {
            rate: 0.0,
            leniency: DEFAULT_LENIENCY,
            reversible: false,
            decompositions: None,
            engine: EnginePreference::default(),
            engine_threads: None,
        }
    }
}

impl J2cConfig {
    /// Reject values the size math cannot use.
    pub fn validate(&self) -> TexResult<()> {
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(TexError::config("j2c rate must be finite and >= 0"));
        }
        if !self.leniency.is_finite() || self.leniency <= 0.0 || self.leniency > 1.0 {
            return Err(TexError::config("j2c leniency must be in (0, 1]"));
        }
        if self.decompositions.is_some_and(|d| d > MAX_DISCARD_LEVEL) {
            return Err(TexError::config(format!(
                "j2c decompositions must be <= {MAX_DISCARD_LEVEL}"
            )));
        }
        if self.engine_threads == Some(0) {
            return Err(TexError::config("engine_threads must be > 0 when set"));
        }
        Ok(())
    }

    /// Rate used by the size math.
    pub fn effective_rate(&self) -> f32 {
        if self.rate > 0.0 {
            self.rate
        } else {
            DEFAULT_COMPRESSION_RATE
        }
    }
}

/// Estimated bytes needed to decode a `width × height × components` image at `discard_level`.
pub fn calc_data_size_j2c(
    width: u32,
    height: u32,
    components: u8,
    discard_level: u8,
    rate: f32,
) -> usize {
    let rate = if rate > 0.0 {
        rate
    } else {
        DEFAULT_COMPRESSION_RATE
    };
    let (mut w, mut h) = (width, height);
    for _ in 0..discard_level {
        if w < 1 || h < 1 {
            break;
        }
        w >>= 1;
        h >>= 1;
    }
    let bytes = (w as f64 * h as f64 * components as f64 * rate as f64) as usize;
    bytes.max(FIRST_PACKET_SIZE)
}

#[cfg(test)]
#[path = "../../tests/unit/j2c/size.rs"]
mod tests;
