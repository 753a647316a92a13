//! Encode/decode round trips through libjxl.

use zenjxl::{
    probe, ColorSpace, DecodeError, DetectedFormat, Image, ImageHandler, ImageOption, JxlHandler,
    OptionValue, PixelFormat, META_KEY_XMP,
};

/// A deterministic RGBA gradient.
fn gradient_rgba8(width: u32, height: u32) -> Image {
    let mut image = Image::alloc(width, height, PixelFormat::Rgba8).unwrap();
    for y in 0..height {
        let row = image.row_mut(y);
        for x in 0..width as usize {
            row[x * 4] = (x * 7) as u8;
            row[x * 4 + 1] = (y * 11) as u8;
            row[x * 4 + 2] = ((x + y as usize) * 13) as u8;
            row[x * 4 + 3] = 255 - (x as u8).wrapping_mul(3);
        }
    }
    image
}

/// Writes `image` at the given quality and returns the compressed stream.
fn encode(image: &Image, quality: i32) -> Vec<u8> {
    let mut handler = JxlHandler::for_writing();
    handler.set_option(ImageOption::Quality, OptionValue::Int(quality));
    let mut out = Vec::new();
    handler.write(image, &mut out).unwrap();
    out
}

#[test]
fn lossless_rgba8_round_trip() {
    let original = gradient_rgba8(16, 16);
    let compressed = encode(&original, 100);

    assert!(JxlHandler::detect(&compressed));
    assert_eq!(probe(&compressed), DetectedFormat::JxlContainer);

    let mut handler = JxlHandler::new(compressed);
    assert!(handler.can_read());
    assert_eq!(handler.image_count(), 1);
    assert_eq!(handler.next_image_delay(), 0);

    let image = handler.read().unwrap();
    assert_eq!(image.width(), 16);
    assert_eq!(image.height(), 16);
    assert_eq!(image.format(), PixelFormat::Rgba8);
    assert_eq!(image.data(), original.data());
    assert_eq!(image.colorspace(), Some(&ColorSpace::srgb()));
}

#[test]
fn static_image_read_is_cached() {
    let original = gradient_rgba8(8, 8);
    let mut handler = JxlHandler::new(encode(&original, 100));

    let first = handler.read().unwrap();
    // The static image has been fully read.
    assert!(!handler.can_read());
    assert_eq!(handler.current_image_number(), 0);

    // A second read serves the cached frame without decoding.
    let second = handler.read().unwrap();
    assert_eq!(first.data(), second.data());
    assert_eq!(first.data(), original.data());
}

#[test]
fn rgb_without_alpha_presents_padded() {
    let mut original = Image::alloc(9, 5, PixelFormat::Rgb8).unwrap();
    for y in 0..5 {
        let row = original.row_mut(y);
        for x in 0..9 {
            row[x * 3] = (x * 20) as u8;
            row[x * 3 + 1] = (y * 40) as u8;
            row[x * 3 + 2] = 200;
        }
    }
    let mut handler = JxlHandler::new(encode(&original, 100));
    let image = handler.read().unwrap();

    assert_eq!(image.format(), PixelFormat::Rgbx8);
    for y in 0..5 {
        let src = original.row(y);
        let out = image.row(y);
        for x in 0..9 {
            assert_eq!(&out[x * 4..x * 4 + 3], &src[x * 3..x * 3 + 3]);
            assert_eq!(out[x * 4 + 3], 255);
        }
    }
}

#[test]
fn gray8_round_trip() {
    let mut original = Image::alloc(12, 7, PixelFormat::Gray8).unwrap();
    for y in 0..7 {
        let row = original.row_mut(y);
        for (x, sample) in row.iter_mut().enumerate() {
            *sample = (x * 21 + y as usize) as u8;
        }
    }
    let mut handler = JxlHandler::new(encode(&original, 100));
    let image = handler.read().unwrap();
    assert_eq!(image.format(), PixelFormat::Gray8);
    assert_eq!(image.data(), original.data());
}

#[test]
fn hdr_float_lossless_round_trip() {
    let mut original = Image::alloc(2, 1, PixelFormat::Rgba32F).unwrap();
    let samples: [f32; 8] = [1.5, 0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.5];
    let bytes: Vec<u8> = samples.iter().flat_map(|v| v.to_ne_bytes()).collect();
    original.data_mut().copy_from_slice(&bytes);

    let mut handler = JxlHandler::new(encode(&original, 100));
    let image = handler.read().unwrap();

    assert_eq!(image.format(), PixelFormat::Rgba32F);
    for (i, expected) in samples.iter().enumerate() {
        let got = f32::from_ne_bytes(image.data()[i * 4..i * 4 + 4].try_into().unwrap());
        assert_eq!(got, *expected, "sample {i}");
    }
}

#[test]
fn lossy_static_image_decodes_as_srgb() {
    let original = gradient_rgba8(16, 16);
    let mut handler = JxlHandler::new(encode(&original, 90));

    assert_eq!(
        handler.option(ImageOption::Size),
        Some(OptionValue::Size {
            width: 16,
            height: 16
        })
    );
    assert_eq!(
        handler.option(ImageOption::Animation),
        Some(OptionValue::Bool(false))
    );

    let image = handler.read().unwrap();
    assert_eq!(image.width(), 16);
    assert_eq!(image.colorspace(), Some(&ColorSpace::srgb()));
}

#[test]
fn exif_metadata_round_trip() {
    let mut original = gradient_rgba8(4, 4);
    original.set_dots_per_meter(11811, 11811); // 300 dpi
    original.set_text("Software", "zenjxl test");
    original.set_exif_orientation(6);

    let mut handler = JxlHandler::new(encode(&original, 100));
    let image = handler.read().unwrap();

    assert_eq!(image.text("Software"), Some("zenjxl test"));
    assert_eq!(image.exif_orientation(), Some(6));
    assert_eq!(image.dots_per_meter_x(), Some(11811));
    // No XMP was written.
    assert_eq!(image.text(META_KEY_XMP), None);
}

#[test]
fn xmp_round_trip() {
    let xmp = "<x:xmpmeta xmlns:x=\"adobe:ns:meta/\"></x:xmpmeta>";
    let mut original = gradient_rgba8(4, 4);
    original.set_text(META_KEY_XMP, xmp);

    let mut handler = JxlHandler::new(encode(&original, 100));
    let image = handler.read().unwrap();
    assert_eq!(image.text(META_KEY_XMP), Some(xmp));
}

#[test]
fn seeking_a_static_image() {
    let original = gradient_rgba8(6, 6);
    let mut handler = JxlHandler::new(encode(&original, 100));

    handler.jump_to_image(0).unwrap();
    assert!(matches!(
        handler.jump_to_image(1),
        Err(DecodeError::FrameOutOfBounds { index: 1, total: 1 })
    ));

    let image = handler.read().unwrap();
    assert_eq!(image.data(), original.data());
}

#[test]
fn garbage_input_is_rejected() {
    let mut handler = JxlHandler::new(b"definitely not a jxl stream".to_vec());
    assert!(!handler.can_read());
    assert!(handler.read().is_err());
    assert_eq!(handler.image_count(), 0);
}

#[test]
fn empty_input_is_rejected() {
    let mut handler = JxlHandler::new(Vec::new());
    assert!(!handler.can_read());
    assert!(matches!(handler.read(), Err(DecodeError::DecoderInit(_))));
}

#[test]
fn transformation_is_stored_as_orientation() {
    use zenjxl::Transformation;

    let original = gradient_rgba8(5, 3);
    let mut writer = JxlHandler::for_writing();
    writer.set_option(ImageOption::Quality, OptionValue::Int(100));
    writer.set_option(
        ImageOption::ImageTransformation,
        OptionValue::Int(Transformation::Rotate90.index()),
    );
    let mut out = Vec::new();
    writer.write(&original, &mut out).unwrap();

    let mut handler = JxlHandler::new(out);
    assert_eq!(
        handler.option(ImageOption::ImageTransformation),
        Some(OptionValue::Int(Transformation::Rotate90.index()))
    );
    // The decoder was told to keep the orientation, so pixel data is
    // untransformed and the host applies the rotation downstream.
    let image = handler.read().unwrap();
    assert_eq!(image.width(), 5);
    assert_eq!(image.height(), 3);
}
