use std::path::PathBuf;

use super::*;
use crate::j2c::BuiltinEngine;

fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let data: Vec<u8> = (0..w * h * 3).map(|i| (i % 200) as u8).collect();
    let src = PixelBuffer::from_data(&data, w, h, 3).unwrap();
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.encode(&src, None, Duration::ZERO).unwrap();
    img.take_data()
}

fn out_dir(name: &str) -> PathBuf {
    let dir = PathBuf::from("target").join("unit-formatted").join(name);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn factory_picks_codec_from_name() {
    let png = FormattedImage::create_from_extension("tex/a.PNG").unwrap();
    assert_eq!(png.codec(), ImageCodec::Png);
    let j2c = FormattedImage::create_from_extension("texture").unwrap();
    assert_eq!(j2c.codec(), ImageCodec::J2c);
    assert_eq!(j2c.extension(), "j2c");
    assert!(FormattedImage::create_from_extension("anim.gif").is_none());
}

#[test]
fn short_buffer_is_uninitialized_and_recorded() {
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.copy_data(&[1, 2, 3]);
    let err = img.update_data().unwrap_err();
    assert!(err.is_terminal_for_attempt());
    assert!(matches!(err, TexError::Uninitialized(_)));
    assert!(img.last_error().is_some_and(|m| m.contains("3 bytes")));

    let mut raw = PixelBuffer::new();
    assert!(img.decode(&mut raw, Duration::ZERO).is_err());
    assert!(!img.is_decoded());
}

#[test]
fn failed_decode_empties_raw_and_finishes() {
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.set_data(vec![0xAB; 64]);
    let mut raw = PixelBuffer::with_size(4, 4, 3).unwrap();
    assert!(img.decode(&mut raw, Duration::ZERO).is_err());
    assert!(raw.data().is_empty());
    assert!(!img.is_decoding());
    assert!(!img.is_decoded());
    assert!(!crate::formatted::last_error().is_empty());
}

#[test]
fn append_invalidates_previous_decode() {
    let bytes = png_bytes(8, 8);
    let (head, tail) = bytes.split_at(20);
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.copy_data(head);
    img.append_data(tail);
    assert_eq!(img.data(), bytes.as_slice());

    let mut raw = PixelBuffer::new();
    img.decode(&mut raw, Duration::ZERO).unwrap();
    assert!(img.is_decoded());
    img.append_data(&[]);
    assert!(img.is_decoded());
    img.append_data(&[0]);
    assert!(!img.is_decoded());
}

#[test]
fn discard_level_is_clamped_to_codec_max() {
    let mut img = FormattedImage::new(Box::new(J2cCodec::with_engine(
        J2cConfig::default(),
        &BuiltinEngine,
    )));
    img.set_discard_level(Some(9));
    assert_eq!(img.discard_level(), Some(img.max_discard_level()));
    img.set_discard_level(None);
    assert_eq!(img.discard_level(), None);
}

#[test]
fn save_then_load_round_trips_bytes() {
    let dir = out_dir("save_load");
    let path = dir.join("tile.png");
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    img.set_data(png_bytes(6, 5));
    img.save(&path).unwrap();

    let mut loaded = FormattedImage::create_from_extension("tile.png").unwrap();
    loaded.load(&path, None).unwrap();
    assert_eq!(loaded.data(), img.data());
    assert_eq!((loaded.width(), loaded.height()), (6, 5));

    let mut prefix = FormattedImage::create_from_type(ImageCodec::Png);
    assert!(prefix.load(&path, Some(8)).is_err());
    assert_eq!(prefix.data_size(), 8);
}

#[test]
fn missing_file_is_an_io_error() {
    let mut img = FormattedImage::create_from_type(ImageCodec::Png);
    let err = img
        .load(&out_dir("missing").join("nope.png"), None)
        .unwrap_err();
    assert!(matches!(err, TexError::Io(_)));
    assert!(img.last_error().is_some());
}
