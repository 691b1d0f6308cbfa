use super::*;

fn solid(w: u32, h: u32, c: u8, v: u8) -> PixelBuffer {
    let mut b = PixelBuffer::with_size(w, h, c).unwrap();
    b.data_mut().fill(v);
    b
}

#[test]
fn allocate_rejects_out_of_range_sizes() {
    let mut b = PixelBuffer::new();
    assert!(matches!(b.allocate(0), Err(TexError::Allocation(_))));
    assert!(matches!(
        b.allocate(MAX_BUFFER_SIZE + 1),
        Err(TexError::Allocation(_))
    ));
    b.allocate(1).unwrap();
    assert_eq!(b.data_size(), 1);
    assert!(!b.is_buffer_invalid());
}

#[test]
fn oversize_allowed_degrades_instead_of_failing() {
    let mut b = PixelBuffer::with_size(4, 4, 3).unwrap();
    b.set_allow_oversize(true);
    b.allocate(0).unwrap();
    assert!(b.allocation_failed());
    assert!(b.is_buffer_invalid());
    assert_eq!(b.data_size(), 0);
    assert_eq!((b.width(), b.height()), (0, 0));
}

#[test]
fn allocate_for_sets_exact_size() {
    let b = PixelBuffer::with_size(7, 5, 3).unwrap();
    assert_eq!(b.data_size(), 7 * 5 * 3);
    assert_eq!(b.expected_size(), b.data_size());
    assert!(PixelBuffer::with_size(4, 4, 5).is_err());
    assert!(PixelBuffer::with_size(0, 4, 3).is_err());
}

#[test]
fn reallocate_keeps_prefix() {
    let mut b = PixelBuffer::from_data(&[1, 2, 3, 4, 5, 6], 2, 1, 3).unwrap();
    b.reallocate(9).unwrap();
    assert_eq!(b.data(), &[1, 2, 3, 4, 5, 6, 0, 0, 0]);
    b.reallocate(2).unwrap();
    assert_eq!(b.data(), &[1, 2]);
    assert!(b.reallocate(0).is_err());
}

#[test]
fn copy_same_shape_is_identity() {
    let src = PixelBuffer::from_data(&(0u8..48).collect::<Vec<_>>(), 4, 4, 3).unwrap();
    let mut dst = PixelBuffer::with_size(4, 4, 3).unwrap();
    dst.copy_from(&src).unwrap();
    assert_eq!(dst.data(), src.data());
}

#[test]
fn copy_converts_components() {
    let rgb = PixelBuffer::from_data(&[10, 20, 30, 40, 50, 60], 2, 1, 3).unwrap();
    let mut rgba = PixelBuffer::with_size(2, 1, 4).unwrap();
    rgba.copy_from(&rgb).unwrap();
    assert_eq!(rgba.data(), &[10, 20, 30, 255, 40, 50, 60, 255]);

    let mut back = PixelBuffer::with_size(2, 1, 3).unwrap();
    back.copy_from(&rgba).unwrap();
    assert_eq!(back.data(), rgb.data());
}

#[test]
fn copy_scaled_between_sizes_and_components() {
    let src = solid(8, 8, 4, 90);
    let mut dst = PixelBuffer::with_size(3, 5, 3).unwrap();
    dst.copy_from(&src).unwrap();
    assert!(dst.data().iter().all(|&v| v == 90));
}

#[test]
fn alpha_mask_fills_color() {
    let mask = PixelBuffer::from_data(&[0, 128, 255], 3, 1, 1).unwrap();
    let mut out = PixelBuffer::with_size(3, 1, 4).unwrap();
    out.copy_unscaled_alpha_mask(&mask, Rgba8::new(1, 2, 3, 0))
        .unwrap();
    assert_eq!(out.data(), &[1, 2, 3, 0, 1, 2, 3, 128, 1, 2, 3, 255]);
}

#[test]
fn scale_without_resample_pads_then_crops() {
    let original: Vec<u8> = (1u8..=12).collect();
    let mut b = PixelBuffer::from_data(&original, 2, 2, 3).unwrap();

    b.scale(4, 3, false).unwrap();
    assert_eq!((b.width(), b.height()), (4, 3));
    assert_eq!(&b.data()[0..6], &original[0..6]);
    assert!(b.data()[6..12].iter().all(|&v| v == 0));
    assert_eq!(&b.data()[12..18], &original[6..12]);
    assert!(b.data()[18..].iter().all(|&v| v == 0));

    b.scale(2, 2, false).unwrap();
    assert_eq!(b.data(), original.as_slice());
}

#[test]
fn scale_same_width_keeps_rows() {
    let mut b = PixelBuffer::from_data(&[1, 2, 3, 4], 2, 2, 1).unwrap();
    b.scale(2, 3, false).unwrap();
    assert_eq!(b.data(), &[1, 2, 3, 4, 0, 0]);
}

#[test]
fn resample_averages_by_coverage() {
    let mut b = PixelBuffer::from_data(&[0, 255], 2, 1, 1).unwrap();
    b.scale(1, 1, true).unwrap();
    assert_eq!(b.data(), &[128]);

    let mut up = PixelBuffer::from_data(&[200], 1, 1, 1).unwrap();
    up.scale(3, 2, true).unwrap();
    assert!(up.data().iter().all(|&v| v == 200));

    let mut uniform = solid(13, 7, 4, 77);
    uniform.scale(5, 11, true).unwrap();
    assert!(uniform.data().iter().all(|&v| v == 77));
}

#[test]
fn scale_rejects_bad_targets() {
    let mut b = solid(4, 4, 3, 0);
    assert!(matches!(
        b.scale(0, 4, true),
        Err(TexError::InvariantViolation(_))
    ));
    let mut two = solid(4, 4, 2, 0);
    assert!(matches!(
        two.scale(2, 2, true),
        Err(TexError::InvariantViolation(_))
    ));
}

#[test]
fn fast_fractional_mult_tracks_exact_product() {
    for a in 0..=255u32 {
        for b in 0..=255u32 {
            let exact = (a * b) as f32 / 255.0;
            let got = fast_fractional_mult(a as u8, b as u8) as f32;
            assert!((got - exact.round()).abs() <= 1.0, "{a} * {b}");
        }
    }
    assert_eq!(fast_fractional_mult(255, 255), 255);
    assert_eq!(fast_fractional_mult(0, 255), 0);
}

#[test]
fn composite_alpha_extremes() {
    let mut dst = PixelBuffer::from_data(&[10, 20, 30, 40, 50, 60], 2, 1, 3).unwrap();
    let src = PixelBuffer::from_data(&[200, 201, 202, 0, 90, 91, 92, 255], 2, 1, 4).unwrap();
    dst.composite(&src).unwrap();
    assert_eq!(dst.data(), &[10, 20, 30, 90, 91, 92]);
}

#[test]
fn composite_half_alpha_blends() {
    let mut dst = PixelBuffer::from_data(&[0, 0, 0], 1, 1, 3).unwrap();
    let src = PixelBuffer::from_data(&[255, 255, 255, 128], 1, 1, 4).unwrap();
    dst.composite(&src).unwrap();
    assert_eq!(dst.data(), &[128, 128, 128]);
}

#[test]
fn composite_scaled_opaque_copies() {
    let mut dst = solid(3, 3, 3, 5);
    let src = PixelBuffer::from_data(&[40, 50, 60, 255].repeat(16), 4, 4, 4).unwrap();
    dst.composite(&src).unwrap();
    assert_eq!(dst.data(), [40, 50, 60].repeat(9).as_slice());
}

#[test]
fn composite_needs_rgb_destination() {
    let mut dst = solid(2, 2, 4, 0);
    let src = solid(2, 2, 4, 0);
    assert!(matches!(
        dst.composite(&src),
        Err(TexError::InvariantViolation(_))
    ));
}

#[test]
fn fill_and_clear_honor_components() {
    let mut rgb = PixelBuffer::with_size(2, 1, 3).unwrap();
    rgb.fill(Rgba8::new(1, 2, 3, 4)).unwrap();
    assert_eq!(rgb.data(), &[1, 2, 3, 1, 2, 3]);

    let mut lum = PixelBuffer::with_size(3, 1, 1).unwrap();
    lum.fill(Rgba8::new(9, 2, 3, 4)).unwrap();
    assert_eq!(lum.data(), &[9, 9, 9]);

    let mut rgba = PixelBuffer::with_size(1, 2, 4).unwrap();
    rgba.clear(5, 6, 7, 8);
    assert_eq!(rgba.data(), &[5, 6, 7, 8, 5, 6, 7, 8]);

    let mut la = PixelBuffer::with_size(1, 1, 2).unwrap();
    assert!(la.fill(Rgba8::default()).is_err());
}

#[test]
fn vertical_flip_reverses_rows() {
    let mut b = PixelBuffer::from_data(&[1, 1, 2, 2, 3, 3], 2, 3, 1).unwrap();
    b.vertical_flip().unwrap();
    assert_eq!(b.data(), &[3, 3, 2, 2, 1, 1]);
}

#[test]
fn set_region_with_stride_and_reverse() {
    let mut b = PixelBuffer::with_size(3, 3, 1).unwrap();
    let patch = [1, 2, 99, 3, 4, 99];
    b.set_region(1, 1, 2, 2, &patch, 3, true).unwrap();
    assert_eq!(b.data(), &[0, 0, 0, 0, 3, 4, 0, 1, 2]);
}

#[test]
fn crop_each_axis() {
    let src = PixelBuffer::from_data(&(0u8..12).collect::<Vec<_>>(), 4, 3, 1).unwrap();
    let rows = PixelBuffer::crop(&src, 4, 2, 1, true).unwrap();
    assert_eq!(rows.data(), &[4, 5, 6, 7, 8, 9, 10, 11]);
    let cols = PixelBuffer::crop(&src, 2, 3, 2, false).unwrap();
    assert_eq!(cols.data(), &[2, 3, 6, 7, 10, 11]);
    assert!(PixelBuffer::crop(&src, 4, 3, 1, true).is_err());
}

#[test]
fn crop_rejects_offsets_past_u32() {
    let src = PixelBuffer::from_data(&[0u8; 12], 4, 3, 1).unwrap();
    assert!(matches!(
        PixelBuffer::crop(&src, 4, 2, u32::MAX, true),
        Err(TexError::InvariantViolation(_))
    ));
    assert!(matches!(
        PixelBuffer::crop(&src, 2, 3, u32::MAX - 1, false),
        Err(TexError::InvariantViolation(_))
    ));
}

#[test]
fn mip_is_box_average() {
    let src = [0u8, 10, 20, 30, 4, 14, 24, 34];
    let mut dst = [0u8; 2];
    generate_mip(&src, &mut dst, 1, 1, 2).unwrap();
    assert_eq!(dst, [12, 22]);
    assert!(generate_mip(&src, &mut dst, 1, 1, 5).is_err());
}

#[test]
fn power_of_two_fitting() {
    let mut e = solid(100, 60, 3, 1);
    e.expand_to_power_of_two(2048, false).unwrap();
    assert_eq!((e.width(), e.height()), (128, 64));

    let mut c = solid(100, 60, 3, 1);
    c.contract_to_power_of_two(2048, true).unwrap();
    assert_eq!((c.width(), c.height()), (64, 32));

    let mut b = solid(100, 60, 3, 1);
    b.biased_scale_to_power_of_two(2048).unwrap();
    assert_eq!((b.width(), b.height()), (64, 64));

    let mut capped = solid(300, 300, 3, 1);
    capped.expand_to_power_of_two(128, true).unwrap();
    assert_eq!((capped.width(), capped.height()), (128, 128));
}

#[test]
fn duplicate_shares_only_when_unique() {
    let a = Arc::new(solid(2, 2, 3, 7));
    let same = PixelBuffer::duplicate(&a);
    assert!(Arc::ptr_eq(&a, &same));

    let copy = PixelBuffer::duplicate(&a);
    assert!(!Arc::ptr_eq(&a, &copy));
    assert_eq!(copy.data(), a.data());
}
