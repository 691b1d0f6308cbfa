use std::time::Duration;

use super::engine::{DecodeProgress, J2cEngine, J2cImpl, init_engine};
use super::{J2cConfig, MAX_DISCARD_LEVEL, calc_data_size_j2c};
use crate::foundation::clock::Deadline;
use crate::foundation::error::TexResult;
use crate::formatted::{
    DecodeStatus, FormattedCodec, FormattedData, ImageCodec, select_channels,
};
use crate::raw::PixelBuffer;

const LEVELS: usize = MAX_DISCARD_LEVEL as usize + 1;

/// Progressive J2C codec: rate-based size estimates plus a resumable decode through the engine.
#[derive(Debug)]
pub struct J2cCodec {
    config: J2cConfig,
    imp: Box<dyn J2cImpl>,
    data_sizes: [usize; LEVELS],
    area_used: Option<(u32, u32, u8)>,
}

impl J2cCodec {
    /// Codec backed by the process-wide engine.
    pub fn new(config: J2cConfig) -> Self {
        Self::with_engine(config, init_engine(config.engine, config.engine_threads))
    }

    /// Codec backed by a specific engine.
    pub fn with_engine(config: J2cConfig, engine: &dyn J2cEngine) -> Self {
        Self {
            config,
            imp: engine.create(),
            data_sizes: [0; LEVELS],
            area_used: None,
        }
    }

    /// Active settings.
    pub fn config(&self) -> &J2cConfig {
        &self.config
    }

    /// Change the compression rate used by size estimates.
    pub fn set_rate(&mut self, rate: f32) {
        self.config.rate = rate;
        self.area_used = None;
    }

    fn refresh_header(&mut self, img: &mut FormattedData) -> TexResult<()> {
        let meta = self.imp.get_metadata(&img.data)?;
        img.set_header(meta.width, meta.height, meta.components);
        Ok(())
    }
}

impl FormattedCodec for J2cCodec {
    fn codec(&self) -> ImageCodec {
        ImageCodec::J2c
    }

    fn max_discard_level(&self) -> u8 {
        MAX_DISCARD_LEVEL
    }

    fn update_data(&mut self, img: &mut FormattedData) -> TexResult<()> {
        self.refresh_header(img)?;
        let bytes = img.data.len();
        img.discard_level = self.calc_discard_level_bytes(img, bytes);
        Ok(())
    }

    fn calc_data_size(&mut self, img: &FormattedData, level: u8) -> usize {
        let level = level.min(MAX_DISCARD_LEVEL) as usize;
        let area = (img.width, img.height, img.components);
        if self.area_used != Some(area) {
            let rate = self.config.effective_rate();
            for (l, size) in self.data_sizes.iter_mut().enumerate() {
                *size = calc_data_size_j2c(area.0, area.1, area.2, l as u8, rate);
            }
            self.area_used = Some(area);
        }
        self.data_sizes[level]
    }

    fn calc_discard_level_bytes(&mut self, img: &FormattedData, bytes: usize) -> Option<u8> {
        if bytes == 0 {
            return Some(MAX_DISCARD_LEVEL);
        }
        let leniency = self.config.leniency as f64;
        let mut level = 0;
        loop {
            let needed = self.calc_data_size(img, level);
            if bytes as f64 >= needed as f64 * leniency {
                break;
            }
            level += 1;
            if level >= MAX_DISCARD_LEVEL {
                break;
            }
        }
        Some(level)
    }

    fn decode_channels(
        &mut self,
        img: &mut FormattedData,
        raw: &mut PixelBuffer,
        budget: Duration,
        first_channel: u8,
        max_channels: u8,
    ) -> TexResult<DecodeStatus> {
        if img.width == 0 {
            self.refresh_header(img)?;
        }
        let deadline = Deadline::after(budget);
        let target = img.discard_level.unwrap_or(0);
        match self.imp.decode_impl(&img.data, target, &deadline)? {
            DecodeProgress::Pending => Ok(DecodeStatus::Pending),
            DecodeProgress::Done(level) => {
                img.discard_level = Some(level.discard_level);
                select_channels(
                    raw,
                    level.pixels,
                    level.width,
                    level.height,
                    level.components,
                    first_channel,
                    max_channels,
                )?;
                Ok(DecodeStatus::Done)
            }
        }
    }

    /// Encoding runs to completion regardless of `budget`.
    fn encode(
        &mut self,
        img: &mut FormattedData,
        raw: &PixelBuffer,
        comment: Option<&str>,
        _budget: Duration,
    ) -> TexResult<()> {
        img.data = self.imp.encode_impl(
            raw,
            comment,
            self.config.reversible,
            self.config.decompositions,
        )?;
        img.set_header(raw.width(), raw.height(), raw.components());
        img.discard_level = Some(0);
        Ok(())
    }

    fn reset_decode(&mut self) {
        self.imp.reset();
    }
}

#[cfg(test)]
#[path = "../../tests/unit/j2c/codec.rs"]
mod tests;
