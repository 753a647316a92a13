//! The JPEG XL write path.
//!
//! Single-frame writing: plan the output depth from the source format,
//! reconcile the colorspace, emit basic info plus either a structured color
//! encoding or an ICC profile, attach Exif/XMP boxes, submit the (possibly
//! repacked) pixels, and stream the compressed output to the device.

use std::io::Write;

use log::warn;

use super::ffi::{
    self, jxl_bool, BasicInfo, ExtraChannelType, JxlDataType, JxlEndianness, JxlPrimaries,
    JxlTransferFunction, JxlWhitePoint, PixelLayout,
};
use super::{transformation_to_orientation, JxlHandler};
use crate::color::{ColorModel, ColorSpace, Primaries, TransferFunction, WHITE_POINT_D65};
use crate::error::EncodeError;
use crate::exif::MicroExif;
use crate::image::{
    Image, PixelFormat, MAX_IMAGE_HEIGHT, MAX_IMAGE_PIXELS, MAX_IMAGE_WIDTH, META_KEY_XMP,
};

/// ProPhoto RGB is defined against D50.
const WHITE_POINT_D50: (f32, f32) = (0.3457, 0.3585);

impl JxlHandler {
    pub(crate) fn write_image(
        &mut self,
        image: &Image,
        device: &mut dyn Write,
    ) -> Result<(), EncodeError> {
        if image.format() == PixelFormat::Invalid {
            return Err(EncodeError::Config("no image data to save".into()));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(EncodeError::Config("image has zero dimension".into()));
        }
        if image.width() > MAX_IMAGE_WIDTH
            || image.height() > MAX_IMAGE_HEIGHT
            || u64::from(image.width()) * u64::from(image.height()) > MAX_IMAGE_PIXELS
        {
            return Err(EncodeError::TooLarge {
                width: image.width(),
                height: image.height(),
            });
        }

        let mut encoder = ffi::Encoder::new()?;

        // Runner declared after the encoder so it is dropped first.
        let runner;
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .clamp(1, 64);
        if workers > 1 {
            runner = ffi::ThreadRunner::new(workers);
            if let Some(runner) = &runner {
                if !encoder.set_parallel_runner(runner) {
                    return Err(EncodeError::Encoder("attaching the parallel runner failed"));
                }
            }
        }

        if self.quality > 100 {
            self.quality = 100;
        } else if self.quality < 0 {
            self.quality = 90;
        }

        // Container and boxes are always on so Exif/XMP can be attached.
        let _ = encoder.use_container(true);
        let _ = encoder.use_boxes();

        let mut info = ffi::basic_info_default();
        info.have_container = jxl_bool(true);
        info.animation.tps_numerator = 10;
        info.animation.tps_denominator = 1;
        info.orientation = transformation_to_orientation(self.transformation);

        let save_cmyk = image.format() == PixelFormat::Cmyk8
            && image
                .colorspace()
                .is_some_and(|cs| cs.model() == ColorModel::Cmyk);

        let exif_data = MicroExif::from_image(image).to_bytes();
        let xmp_data = image
            .text(META_KEY_XMP)
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default();

        if save_cmyk {
            write_cmyk(&mut encoder, image, &mut info, &exif_data, &xmp_data)?;
        } else {
            write_plain(
                &mut encoder,
                image,
                &mut info,
                &exif_data,
                &xmp_data,
                self.quality,
                self.options.preserve_hdr,
            )?;
        }

        encoder.close_frames();
        let compressed = encoder.collect_output()?;
        if compressed.is_empty() {
            return Err(EncodeError::Encoder("no compressed output"));
        }
        device.write_all(&compressed)?;
        Ok(())
    }
}

/// Attaches the metadata boxes and seals the box section.
fn add_metadata_boxes(
    encoder: &mut ffi::Encoder,
    exif: &[u8],
    xmp: &[u8],
) -> Result<(), EncodeError> {
    if !exif.is_empty() {
        // 4-byte TIFF offset header, zero on write.
        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(exif);
        if !encoder.add_box(b"Exif", &payload, false) {
            return Err(EncodeError::Encoder("adding a metadata box failed"));
        }
    }
    if !xmp.is_empty() && !encoder.add_box(b"xml ", xmp, false) {
        return Err(EncodeError::Encoder("adding a metadata box failed"));
    }
    encoder.close_boxes(); // no more metadata
    Ok(())
}

/// CMYK output: always lossless, 3 color channels plus a BLACK extra
/// channel, ink-inverted planes.
fn write_cmyk(
    encoder: &mut ffi::Encoder,
    image: &Image,
    info: &mut BasicInfo,
    exif: &[u8],
    xmp: &[u8],
) -> Result<(), EncodeError> {
    info.uses_original_profile = jxl_bool(true);
    info.xsize = image.width();
    info.ysize = image.height();
    info.num_color_channels = 3;
    info.bits_per_sample = 8;
    info.alpha_bits = 0;
    info.num_extra_channels = 1;

    let pixel_format = PixelLayout {
        num_channels: 3,
        data_type: JxlDataType::Uint8,
        endianness: JxlEndianness::Native,
        align: 0,
    };
    let format_extra = PixelLayout {
        num_channels: 1,
        data_type: JxlDataType::Uint8,
        endianness: JxlEndianness::Native,
        align: 0,
    };

    let mut black_channel = ffi::extra_channel_info_default(ExtraChannelType::Black);
    black_channel.bits_per_sample = info.bits_per_sample;
    black_channel.exponent_bits_per_sample = info.exponent_bits_per_sample;

    let cmyk_profile = image
        .colorspace()
        .and_then(|cs| cs.icc_profile())
        .ok_or_else(|| EncodeError::Config("empty ICC profile for CMYK image".into()))?
        .to_vec();

    if !encoder.set_basic_info(info) {
        return Err(EncodeError::Encoder("setting basic info failed"));
    }
    if !encoder.set_extra_channel_info(0, &black_channel) {
        return Err(EncodeError::Encoder("setting the BLACK channel info failed"));
    }
    if !encoder.set_icc_profile(&cmyk_profile) {
        return Err(EncodeError::Encoder("setting the ICC profile failed"));
    }

    add_metadata_boxes(encoder, exif, xmp)?;

    // Split into inverted CMY and K planes (zero means no ink on the wire).
    let pixel_count = image.width() as usize * image.height() as usize;
    let mut pixels_cmy = vec![0u8; pixel_count * 3];
    let mut pixels_black = vec![0u8; pixel_count];
    for y in 0..image.height() {
        let src = image.row(y);
        let row_start = y as usize * image.width() as usize;
        for x in 0..image.width() as usize {
            pixels_cmy[(row_start + x) * 3] = 255 - src[x * 4];
            pixels_cmy[(row_start + x) * 3 + 1] = 255 - src[x * 4 + 1];
            pixels_cmy[(row_start + x) * 3 + 2] = 255 - src[x * 4 + 2];
            pixels_black[row_start + x] = 255 - src[x * 4 + 3];
        }
    }

    let mut settings = encoder.frame_settings();
    settings.set_distance(0.0);
    settings.set_lossless(true);
    if !settings.add_image_frame(&pixel_format, &pixels_cmy) {
        return Err(EncodeError::Encoder("adding the image frame failed"));
    }
    if !settings.set_extra_channel_buffer(&format_extra, &pixels_black, 0) {
        return Err(EncodeError::Encoder("setting the BLACK channel buffer failed"));
    }
    Ok(())
}

/// Output depth selected from a source pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DepthPlan {
    save_depth: u32,
    save_fp: bool,
    is_gray: bool,
}

fn plan_depth(format: PixelFormat, preserve_hdr: bool) -> DepthPlan {
    let (save_depth, save_fp, is_gray) = match format {
        PixelFormat::Rgba32F | PixelFormat::Rgbx32F => {
            if preserve_hdr {
                (32, true, false)
            } else {
                (16, false, false)
            }
        }
        PixelFormat::Rgba16F | PixelFormat::Rgbx16F => {
            if preserve_hdr {
                (16, true, false)
            } else {
                (16, false, false)
            }
        }
        PixelFormat::Rgba16 | PixelFormat::Rgbx16 => (16, false, false),
        PixelFormat::Rgb8 | PixelFormat::Rgbx8 | PixelFormat::Rgba8 | PixelFormat::Cmyk8 => {
            (8, false, false)
        }
        PixelFormat::Gray16 => (16, false, true),
        PixelFormat::Gray8 => (8, false, true),
        PixelFormat::Invalid => (8, false, false),
    };
    DepthPlan {
        save_depth,
        save_fp,
        is_gray,
    }
}

/// RGB / grayscale output at the planned depth.
fn write_plain(
    encoder: &mut ffi::Encoder,
    image: &Image,
    info: &mut BasicInfo,
    exif: &[u8],
    xmp: &[u8],
    quality: i32,
    preserve_hdr: bool,
) -> Result<(), EncodeError> {
    let depth = plan_depth(image.format(), preserve_hdr);
    let has_alpha = image.has_alpha_channel();

    let mut pixel_format = PixelLayout {
        num_channels: 3,
        data_type: JxlDataType::Uint8,
        endianness: JxlEndianness::Native,
        align: 0,
    };

    let tmpformat;
    if depth.save_depth > 8 && depth.is_gray {
        pixel_format.data_type = JxlDataType::Uint16;
        pixel_format.num_channels = 1;
        info.num_color_channels = 1;
        info.bits_per_sample = 16;
        tmpformat = PixelFormat::Gray16;
    } else if depth.is_gray {
        pixel_format.data_type = JxlDataType::Uint8;
        pixel_format.num_channels = 1;
        info.num_color_channels = 1;
        info.bits_per_sample = 8;
        tmpformat = PixelFormat::Gray8;
    } else if depth.save_depth > 16 {
        pixel_format.data_type = JxlDataType::Float;
        info.exponent_bits_per_sample = 8;
        info.num_color_channels = 3;
        info.bits_per_sample = 32;
        if has_alpha {
            tmpformat = PixelFormat::Rgba32F;
            pixel_format.num_channels = 4;
            info.alpha_bits = 32;
            info.alpha_exponent_bits = 8;
            info.num_extra_channels = 1;
        } else {
            tmpformat = PixelFormat::Rgbx32F;
            pixel_format.num_channels = 3;
            info.alpha_bits = 0;
            info.num_extra_channels = 0;
        }
    } else if depth.save_depth > 8 {
        pixel_format.data_type = if depth.save_fp {
            JxlDataType::Float16
        } else {
            JxlDataType::Uint16
        };
        info.exponent_bits_per_sample = if depth.save_fp { 5 } else { 0 };
        info.num_color_channels = 3;
        info.bits_per_sample = 16;
        if has_alpha {
            tmpformat = if depth.save_fp {
                PixelFormat::Rgba16F
            } else {
                PixelFormat::Rgba16
            };
            pixel_format.num_channels = 4;
            info.alpha_bits = 16;
            info.alpha_exponent_bits = if depth.save_fp { 5 } else { 0 };
            info.num_extra_channels = 1;
        } else {
            tmpformat = if depth.save_fp {
                PixelFormat::Rgbx16F
            } else {
                PixelFormat::Rgbx16
            };
            pixel_format.num_channels = 3;
            info.alpha_bits = 0;
            info.num_extra_channels = 0;
        }
    } else {
        pixel_format.data_type = JxlDataType::Uint8;
        info.num_color_channels = 3;
        info.bits_per_sample = 8;
        if has_alpha {
            tmpformat = PixelFormat::Rgba8;
            pixel_format.num_channels = 4;
            info.alpha_bits = 8;
            info.num_extra_channels = 1;
        } else {
            tmpformat = PixelFormat::Rgb8;
            pixel_format.num_channels = 3;
            info.alpha_bits = 0;
            info.num_extra_channels = 0;
        }
    }

    let tmpimage = reconcile_colorspace(image, tmpformat, depth.is_gray)?;

    info.xsize = tmpimage.width();
    info.ysize = tmpimage.height();

    let (color_profile, iccprofile) = plan_color_encoding(&tmpimage, quality, depth.is_gray, info);

    if !encoder.set_basic_info(info) {
        return Err(EncodeError::Encoder("setting basic info failed"));
    }
    if !iccprofile.is_empty() {
        if !encoder.set_icc_profile(&iccprofile) {
            return Err(EncodeError::Encoder("setting the ICC profile failed"));
        }
    } else if !encoder.set_color_encoding(&color_profile) {
        return Err(EncodeError::Encoder("setting the color encoding failed"));
    }

    add_metadata_boxes(encoder, exif, xmp)?;

    let mut settings = encoder.frame_settings();
    if quality == 100 {
        settings.set_distance(0.0);
        settings.set_lossless(true);
    } else {
        settings.set_distance(ffi::distance_from_quality(quality as f32));
        settings.set_lossless(false);
    }

    let added = match tmpimage.format() {
        // Padded 4-channel layouts are repacked into tight 3-channel
        // buffers before submission.
        PixelFormat::Rgbx32F => {
            let packed = pack_padded(&tmpimage, 16, 12);
            settings.add_image_frame(&pixel_format, &packed)
        }
        PixelFormat::Rgbx16F | PixelFormat::Rgbx16 => {
            let packed = pack_padded(&tmpimage, 8, 6);
            settings.add_image_frame(&pixel_format, &packed)
        }
        _ => {
            pixel_format.align = tmpimage.bytes_per_line();
            let sample_bytes = match pixel_format.data_type {
                JxlDataType::Float => 4usize,
                JxlDataType::Uint8 => 1,
                _ => 2,
            };
            let last_row =
                sample_bytes * pixel_format.num_channels as usize * tmpimage.width() as usize;
            let buffer_size =
                (tmpimage.height() as usize - 1) * tmpimage.bytes_per_line() + last_row;
            settings.add_image_frame(&pixel_format, &tmpimage.data()[..buffer_size])
        }
    };
    if !added {
        return Err(EncodeError::Encoder("adding the image frame failed"));
    }
    Ok(())
}

/// Drops the padding channel, `src_bpp` bytes per pixel in, `dst_bpp` out.
fn pack_padded(image: &Image, src_bpp: usize, dst_bpp: usize) -> Vec<u8> {
    let mut packed = Vec::with_capacity(image.width() as usize * image.height() as usize * dst_bpp);
    for y in 0..image.height() {
        let row = image.row(y);
        for x in 0..image.width() as usize {
            packed.extend_from_slice(&row[x * src_bpp..x * src_bpp + dst_bpp]);
        }
    }
    packed
}

/// Converts the source to the planned format, synthesizing a compatible
/// colorspace when the source's model disagrees with the target layout.
fn reconcile_colorspace(
    image: &Image,
    tmpformat: PixelFormat,
    is_gray: bool,
) -> Result<Image, EncodeError> {
    let Some(cs) = image.colorspace() else {
        return Ok(image.convert_to(tmpformat)?);
    };

    if is_gray && cs.model() != ColorModel::Gray {
        let white_point = cs.white_point().unwrap_or(WHITE_POINT_D65);
        let mut transfer = cs.transfer();
        if transfer == TransferFunction::Custom {
            transfer = TransferFunction::Srgb;
        }
        let mut converted = image.convert_to(tmpformat)?;
        converted.set_colorspace(Some(ColorSpace::gray(white_point, transfer, cs.gamma())));
        Ok(converted)
    } else if !is_gray && cs.model() != ColorModel::Rgb {
        let white_point = cs.white_point().unwrap_or(WHITE_POINT_D65);
        let mut transfer = cs.transfer();
        if transfer == TransferFunction::Custom {
            transfer = TransferFunction::Srgb;
        }
        let mut converted = image.convert_to(tmpformat)?;
        converted.set_colorspace(Some(ColorSpace::rgb(white_point, transfer, cs.gamma())));
        Ok(converted)
    } else {
        Ok(image.convert_to(tmpformat)?)
    }
}

/// Chooses between a structured color encoding and an ICC attachment.
///
/// Lossless output keeps the original profile; lossy output prefers the
/// smaller structured encoding and falls back to ICC for anything it cannot
/// express.
fn plan_color_encoding(
    tmpimage: &Image,
    quality: i32,
    is_gray: bool,
    info: &mut BasicInfo,
) -> (ffi::ColorEncoding, Vec<u8>) {
    let mut color_profile = ffi::color_encoding_srgb(is_gray);
    let mut iccprofile: Vec<u8> = Vec::new();

    if quality == 100 {
        info.uses_original_profile = jxl_bool(true);
        if let Some(icc) = tmpimage.colorspace().and_then(|cs| cs.icc_profile()) {
            iccprofile = icc.to_vec();
        }
        return (color_profile, iccprofile);
    }

    info.uses_original_profile = jxl_bool(false);
    let Some(cs) = tmpimage.colorspace() else {
        return (color_profile, iccprofile);
    };

    let white_point = cs.white_point().unwrap_or(WHITE_POINT_D65);
    match cs.primaries() {
        Primaries::Srgb => {
            color_profile.white_point = JxlWhitePoint::D65;
            color_profile.primaries = JxlPrimaries::SRgb;
        }
        Primaries::AdobeRgb => {
            color_profile.white_point = JxlWhitePoint::D65;
            color_profile.primaries = JxlPrimaries::Custom;
            color_profile.primaries_red_xy = [0.640, 0.330];
            color_profile.primaries_green_xy = [0.210, 0.710];
            color_profile.primaries_blue_xy = [0.150, 0.060];
        }
        Primaries::DciP3D65 => {
            color_profile.white_point = JxlWhitePoint::D65;
            color_profile.primaries = JxlPrimaries::P3;
            color_profile.primaries_red_xy = [0.680, 0.320];
            color_profile.primaries_green_xy = [0.265, 0.690];
            color_profile.primaries_blue_xy = [0.150, 0.060];
        }
        Primaries::ProPhotoRgb => {
            let white_point = cs.white_point().unwrap_or(WHITE_POINT_D50);
            color_profile.white_point = JxlWhitePoint::Custom;
            color_profile.white_point_xy = [white_point.0 as f64, white_point.1 as f64];
            color_profile.primaries = JxlPrimaries::Custom;
            color_profile.primaries_red_xy = [0.7347, 0.2653];
            color_profile.primaries_green_xy = [0.1596, 0.8404];
            color_profile.primaries_blue_xy = [0.0366, 0.0001];
        }
        Primaries::Bt2020 => {
            color_profile.white_point = JxlWhitePoint::D65;
            color_profile.primaries = JxlPrimaries::Rec2100;
            color_profile.primaries_red_xy = [0.708, 0.292];
            color_profile.primaries_green_xy = [0.170, 0.797];
            color_profile.primaries_blue_xy = [0.131, 0.046];
        }
        Primaries::Custom => {
            if is_gray {
                color_profile.white_point = JxlWhitePoint::Custom;
                color_profile.white_point_xy = [white_point.0 as f64, white_point.1 as f64];
            } else if let Some(icc) = cs.icc_profile() {
                iccprofile = icc.to_vec();
            } else {
                warn!("Custom primaries without an ICC profile, writing sRGB");
            }
        }
    }

    if iccprofile.is_empty() {
        match cs.transfer() {
            TransferFunction::Linear => {
                color_profile.transfer_function = JxlTransferFunction::Linear;
            }
            TransferFunction::Gamma => {
                if cs.gamma() > 0.0 {
                    color_profile.transfer_function = JxlTransferFunction::Gamma;
                    color_profile.gamma = 1.0 / cs.gamma() as f64;
                } else if let Some(icc) = cs.icc_profile() {
                    iccprofile = icc.to_vec();
                }
            }
            TransferFunction::Srgb => {
                color_profile.transfer_function = JxlTransferFunction::SRGB;
            }
            TransferFunction::Custom => {
                if let Some(icc) = cs.icc_profile() {
                    iccprofile = icc.to_vec();
                }
            }
        }
    }

    (color_profile, iccprofile)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_plan_follows_source_family() {
        assert_eq!(
            plan_depth(PixelFormat::Rgba32F, true),
            DepthPlan { save_depth: 32, save_fp: true, is_gray: false }
        );
        assert_eq!(
            plan_depth(PixelFormat::Rgba32F, false),
            DepthPlan { save_depth: 16, save_fp: false, is_gray: false }
        );
        assert_eq!(
            plan_depth(PixelFormat::Rgbx16F, true),
            DepthPlan { save_depth: 16, save_fp: true, is_gray: false }
        );
        assert_eq!(
            plan_depth(PixelFormat::Rgba16, true),
            DepthPlan { save_depth: 16, save_fp: false, is_gray: false }
        );
        assert_eq!(
            plan_depth(PixelFormat::Gray16, true),
            DepthPlan { save_depth: 16, save_fp: false, is_gray: true }
        );
        assert_eq!(
            plan_depth(PixelFormat::Gray8, true),
            DepthPlan { save_depth: 8, save_fp: false, is_gray: true }
        );
        assert_eq!(
            plan_depth(PixelFormat::Cmyk8, true),
            DepthPlan { save_depth: 8, save_fp: false, is_gray: false }
        );
    }

    #[test]
    fn pack_drops_padding_channel() {
        let mut img = Image::alloc(2, 1, PixelFormat::Rgbx16).unwrap();
        img.data_mut().copy_from_slice(&[
            1, 2, 3, 4, 5, 6, 7, 8, // pixel 0
            9, 10, 11, 12, 13, 14, 15, 16, // pixel 1
        ]);
        let packed = pack_padded(&img, 8, 6);
        assert_eq!(packed, vec![1, 2, 3, 4, 5, 6, 9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn cmyk_planes_are_split_and_inverted() {
        let mut img = Image::alloc(2, 1, PixelFormat::Cmyk8).unwrap();
        img.data_mut().copy_from_slice(&[255, 0, 128, 255, 0, 255, 64, 0]);

        let pixel_count = 2usize;
        let mut cmy = vec![0u8; pixel_count * 3];
        let mut k = vec![0u8; pixel_count];
        for y in 0..img.height() {
            let src = img.row(y);
            let row_start = y as usize * img.width() as usize;
            for x in 0..img.width() as usize {
                cmy[(row_start + x) * 3] = 255 - src[x * 4];
                cmy[(row_start + x) * 3 + 1] = 255 - src[x * 4 + 1];
                cmy[(row_start + x) * 3 + 2] = 255 - src[x * 4 + 2];
                k[row_start + x] = 255 - src[x * 4 + 3];
            }
        }
        assert_eq!(cmy, vec![0, 255, 127, 255, 0, 191]);
        assert_eq!(k, vec![0, 255]);
    }
}
