use super::{PixelBuffer, check_pixel_components, copy_line_scaled};
use crate::foundation::error::{TexError, TexResult};

/// `a * b / 255` with rounding, without a division.
#[inline]
pub fn fast_fractional_mult(a: u8, b: u8) -> u8 {
    let i = a as u32 * b as u32 + 128;
    ((i + (i >> 8)) >> 8) as u8
}

#[inline]
fn blend_pixel(dst: &mut [u8], src: &[u8]) {
    let alpha = src[3];
    match alpha {
        0 => {}
        255 => dst.copy_from_slice(&src[..3]),
        a => {
            let inv = 255 - a;
            for c in 0..3 {
                dst[c] = fast_fractional_mult(dst[c], inv)
                    .saturating_add(fast_fractional_mult(src[c], a));
            }
        }
    }
}

impl PixelBuffer {
    /// Alpha-blend `src` over this 3-component buffer, resampling when the sizes differ.
    ///
    /// A 3-component source is copied; a 4-component source blends by its alpha, leaving the
    /// destination untouched where alpha is 0 and copying the source where it is 255.
    pub fn composite(&mut self, src: &PixelBuffer) -> TexResult<()> {
        check_pixel_components(src.components)?;
        if self.components != 3 {
            return Err(TexError::invariant(format!(
                "composite destination must have 3 components, has {}",
                self.components
            )));
        }
        let same_size = self.width == src.width && self.height == src.height;
        match (src.components, same_size) {
            (3, true) => self.copy_unscaled(src),
            (3, false) => self.copy_scaled(src),
            (4, true) => self.composite_unscaled_4onto3(src),
            (4, false) => self.composite_scaled_4onto3(src),
            (c, _) => Err(TexError::invariant(format!(
                "composite source must have 3 or 4 components, has {c}"
            ))),
        }
    }

    fn composite_unscaled_4onto3(&mut self, src: &PixelBuffer) -> TexResult<()> {
        for (d, s) in self.data.chunks_exact_mut(3).zip(src.data.chunks_exact(4)) {
            blend_pixel(d, s);
        }
        Ok(())
    }

    fn composite_scaled_4onto3(&mut self, src: &PixelBuffer) -> TexResult<()> {
        let (src_w, src_h) = (src.width as usize, src.height as usize);
        let (dst_w, dst_h) = (self.width as usize, self.height as usize);

        let mut temp = vec![0u8; src_w * dst_h * 4];
        for col in 0..src_w {
            copy_line_scaled(
                &src.data[col * 4..],
                &mut temp[col * 4..],
                src_h,
                dst_h,
                src_w,
                src_w,
                4,
            );
        }

        let mut row = vec![0u8; dst_w * 4];
        for y in 0..dst_h {
            copy_line_scaled(&temp[y * src_w * 4..], &mut row, src_w, dst_w, 1, 1, 4);
            let out = &mut self.data[y * dst_w * 3..(y + 1) * dst_w * 3];
            for (d, s) in out.chunks_exact_mut(3).zip(row.chunks_exact(4)) {
                blend_pixel(d, s);
            }
        }
        Ok(())
    }
}
