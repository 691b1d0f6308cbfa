use super::{MAX_IMAGE_SIZE, MIN_IMAGE_SIZE, PixelBuffer, Rgba8, check_pixel_components};
use crate::foundation::error::{TexError, TexResult};

/// Resample one line of `in_len` pixels into `out_len` pixels by fractional coverage.
///
/// Pixel `i` of the input lives at byte `i * in_step * components`, and likewise for the output,
/// so the same routine walks rows (`step == 1`) and columns (`step == width`). Each output pixel
/// averages the input span `[x * ratio, (x + 1) * ratio)`, weighting the partially covered pixels
/// at both ends by their covered fraction.
pub(crate) fn copy_line_scaled(
    input: &[u8],
    output: &mut [u8],
    in_len: usize,
    out_len: usize,
    in_step: usize,
    out_step: usize,
    components: usize,
) {
    let ratio = in_len as f32 / out_len as f32;
    let norm = 1.0 / ratio;
    let in_stride = in_step * components;
    let out_stride = out_step * components;

    for x in 0..out_len {
        let sample0 = x as f32 * ratio;
        let sample1 = (x + 1) as f32 * ratio;
        let index0 = (sample0.floor() as usize).min(in_len - 1);
        let index1 = sample1.floor() as usize;
        let fract0 = 1.0 - (sample0 - index0 as f32);
        let fract1 = sample1 - index1 as f32;

        let out = &mut output[x * out_stride..x * out_stride + components];

        if index0 == index1 {
            let t = index0 * in_stride;
            out.copy_from_slice(&input[t..t + components]);
            continue;
        }

        let mut acc = [0.0f32; 4];
        let t0 = index0 * in_stride;
        for (c, a) in acc.iter_mut().enumerate().take(components) {
            *a = fract0 * input[t0 + c] as f32;
        }
        for u in index0 + 1..index1 {
            let t = u * in_stride;
            for (c, a) in acc.iter_mut().enumerate().take(components) {
                *a += input[t + c] as f32;
            }
        }
        if fract1 > 0.0 && index1 < in_len {
            let t1 = index1 * in_stride;
            for (c, a) in acc.iter_mut().enumerate().take(components) {
                *a += fract1 * input[t1 + c] as f32;
            }
        }
        for (c, a) in acc.iter().enumerate().take(components) {
            out[c] = round_to_byte(*a * norm);
        }
    }
}

fn round_to_byte(v: f32) -> u8 {
    (v + 0.5).clamp(0.0, 255.0) as u8
}

/// Scale `src` (`src_w × src_h`) into `dst` (`dst_w × dst_h`), vertical pass first.
pub(crate) fn scale_into(
    src: &[u8],
    src_w: u32,
    src_h: u32,
    dst: &mut [u8],
    dst_w: u32,
    dst_h: u32,
    components: u8,
) {
    let c = components as usize;
    let (src_w, src_h, dst_w, dst_h) = (
        src_w as usize,
        src_h as usize,
        dst_w as usize,
        dst_h as usize,
    );

    let mut temp = vec![0u8; src_w * dst_h * c];
    for col in 0..src_w {
        copy_line_scaled(
            &src[col * c..],
            &mut temp[col * c..],
            src_h,
            dst_h,
            src_w,
            src_w,
            c,
        );
    }
    for row in 0..dst_h {
        copy_line_scaled(
            &temp[row * src_w * c..],
            &mut dst[row * dst_w * c..],
            src_w,
            dst_w,
            1,
            1,
            c,
        );
    }
}

/// Largest power of two `<= v`, floored at [`MIN_IMAGE_SIZE`].
fn floor_pow2(v: u32) -> u32 {
    let mut p = MIN_IMAGE_SIZE;
    while p * 2 <= v {
        p *= 2;
    }
    p
}

impl PixelBuffer {
    /// Rescale to `new_width × new_height`.
    ///
    /// With `resample`, both axes are resampled by fractional coverage. Without it the old pixels
    /// keep their positions: growth pads with zeros and shrinking crops from the right and bottom.
    pub fn scale(&mut self, new_width: u32, new_height: u32, resample: bool) -> TexResult<()> {
        check_pixel_components(self.components)?;
        if new_width == 0 || new_height == 0 {
            return Err(TexError::invariant(format!(
                "scale to zero-sized target {new_width}x{new_height}"
            )));
        }
        if self.width == new_width && self.height == new_height {
            return Ok(());
        }
        if self.data.is_empty() {
            return Err(TexError::invariant("scale on unallocated buffer"));
        }

        let c = self.components as usize;
        let new_size = new_width as usize * new_height as usize * c;
        if resample {
            let mut out = vec![0u8; new_size];
            scale_into(
                &self.data,
                self.width,
                self.height,
                &mut out,
                new_width,
                new_height,
                self.components,
            );
            self.replace_data(out);
        } else if self.width == new_width {
            // Rows are contiguous: keep the prefix, zero the tail.
            self.reallocate(new_size)?;
        } else {
            let old_row = self.width as usize * c;
            let new_row = new_width as usize * c;
            let row_bytes = old_row.min(new_row);
            let rows = self.height.min(new_height) as usize;
            let mut out = vec![0u8; new_size];
            for row in 0..rows {
                out[row * new_row..row * new_row + row_bytes]
                    .copy_from_slice(&self.data[row * old_row..row * old_row + row_bytes]);
            }
            self.replace_data(out);
        }

        self.width = new_width;
        self.height = new_height;
        Ok(())
    }

    /// Grow each axis to the next power of two, capped at `max_dim`.
    pub fn expand_to_power_of_two(&mut self, max_dim: u32, resample: bool) -> TexResult<()> {
        let max_dim = max_dim.min(MAX_IMAGE_SIZE);
        let mut w = MIN_IMAGE_SIZE;
        while w < self.width && w < max_dim {
            w <<= 1;
        }
        let mut h = MIN_IMAGE_SIZE;
        while h < self.height && h < max_dim {
            h <<= 1;
        }
        self.scale(w, h, resample)
    }

    /// Shrink each axis to the previous power of two, capped at `max_dim`.
    pub fn contract_to_power_of_two(&mut self, max_dim: u32, resample: bool) -> TexResult<()> {
        let max_dim = max_dim.min(MAX_IMAGE_SIZE).max(MIN_IMAGE_SIZE);
        let w = floor_pow2(self.width).min(floor_pow2(max_dim));
        let h = floor_pow2(self.height).min(floor_pow2(max_dim));
        self.scale(w, h, resample)
    }

    /// Scale each axis to a nearby power of two, preferring the larger one when the edge is at
    /// least 1.75× the smaller candidate.
    pub fn biased_scale_to_power_of_two(&mut self, max_dim: u32) -> TexResult<()> {
        let max_dim = max_dim.min(MAX_IMAGE_SIZE).max(MIN_IMAGE_SIZE);
        let pick = |v: u32| {
            let lower = floor_pow2(v);
            let chosen = if lower < v && v as f32 >= 1.75 * lower as f32 {
                lower * 2
            } else {
                lower
            };
            chosen.min(floor_pow2(max_dim))
        };
        let (w, h) = (pick(self.width), pick(self.height));
        self.scale(w, h, true)
    }

    /// Copy `src` into `self`, converting components and resampling as needed.
    pub fn copy_from(&mut self, src: &PixelBuffer) -> TexResult<()> {
        check_pixel_components(self.components)?;
        check_pixel_components(src.components)?;
        let same_size = self.width == src.width && self.height == src.height;
        match (src.components, self.components, same_size) {
            (a, b, true) if a == b => self.copy_unscaled(src),
            (a, b, false) if a == b => self.copy_scaled(src),
            (3, 4, true) => self.copy_unscaled_3onto4(src),
            (4, 3, true) => self.copy_unscaled_4onto3(src),
            (3, 4, false) | (4, 3, false) => {
                let mut temp = PixelBuffer::with_size(self.width, self.height, src.components)?;
                temp.copy_scaled(src)?;
                self.copy_from(&temp)
            }
            (a, b, _) => Err(TexError::invariant(format!(
                "unsupported copy from {a} to {b} components"
            ))),
        }
    }

    /// Byte-for-byte copy from an identically shaped buffer.
    pub fn copy_unscaled(&mut self, src: &PixelBuffer) -> TexResult<()> {
        if self.width != src.width
            || self.height != src.height
            || self.components != src.components
        {
            return Err(TexError::invariant("copy_unscaled shape mismatch"));
        }
        self.data.copy_from_slice(&src.data);
        Ok(())
    }

    /// Resampled copy from a buffer with the same component count.
    pub fn copy_scaled(&mut self, src: &PixelBuffer) -> TexResult<()> {
        if self.components != src.components {
            return Err(TexError::invariant("copy_scaled component mismatch"));
        }
        if self.width == src.width && self.height == src.height {
            return self.copy_unscaled(src);
        }
        let (w, h, c) = (self.width, self.height, self.components);
        scale_into(&src.data, src.width, src.height, &mut self.data, w, h, c);
        Ok(())
    }

    /// RGB → RGBA copy with alpha forced to 255.
    pub fn copy_unscaled_3onto4(&mut self, src: &PixelBuffer) -> TexResult<()> {
        if self.components != 4 || src.components != 3 {
            return Err(TexError::invariant("copy_unscaled_3onto4 needs 3 -> 4"));
        }
        if self.width != src.width || self.height != src.height {
            return Err(TexError::invariant("copy_unscaled_3onto4 size mismatch"));
        }
        for (d, s) in self.data.chunks_exact_mut(4).zip(src.data.chunks_exact(3)) {
            d[..3].copy_from_slice(s);
            d[3] = 255;
        }
        Ok(())
    }

    /// RGBA → RGB copy dropping alpha.
    pub fn copy_unscaled_4onto3(&mut self, src: &PixelBuffer) -> TexResult<()> {
        if self.components != 3 || src.components != 4 {
            return Err(TexError::invariant("copy_unscaled_4onto3 needs 4 -> 3"));
        }
        if self.width != src.width || self.height != src.height {
            return Err(TexError::invariant("copy_unscaled_4onto3 size mismatch"));
        }
        for (d, s) in self.data.chunks_exact_mut(3).zip(src.data.chunks_exact(4)) {
            d.copy_from_slice(&s[..3]);
        }
        Ok(())
    }

    /// Expand a 1-component mask into a 4-component image: `fill` supplies RGB, the mask
    /// supplies alpha.
    pub fn copy_unscaled_alpha_mask(&mut self, src: &PixelBuffer, fill: Rgba8) -> TexResult<()> {
        if self.components != 4 || src.components != 1 {
            return Err(TexError::invariant("alpha mask copy needs 1 -> 4"));
        }
        if self.width != src.width || self.height != src.height {
            return Err(TexError::invariant("alpha mask copy size mismatch"));
        }
        for (d, &a) in self.data.chunks_exact_mut(4).zip(src.data.iter()) {
            d[0] = fill.r;
            d[1] = fill.g;
            d[2] = fill.b;
            d[3] = a;
        }
        Ok(())
    }
}
