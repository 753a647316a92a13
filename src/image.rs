//! The in-memory image model handlers produce and consume.
//!
//! An [`Image`] is an interleaved byte buffer plus a [`PixelFormat`], an
//! optional [`ColorSpace`], and the metadata a host framework expects to
//! travel with pixels (text entries, physical resolution, Exif orientation).
//! Multi-byte samples are stored in native byte order.

use std::collections::BTreeMap;

use half::f16;

use crate::color::{self, ColorSpace};
use crate::error::{DecodeError, EncodeError};

/// Maximum image width accepted by the handlers.
#[cfg(target_pointer_width = "64")]
pub const MAX_IMAGE_WIDTH: u32 = 262_144;
/// Maximum image height accepted by the handlers.
#[cfg(target_pointer_width = "64")]
pub const MAX_IMAGE_HEIGHT: u32 = 262_144;

/// Maximum image width accepted by the handlers.
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_IMAGE_WIDTH: u32 = 32_767;
/// Maximum image height accepted by the handlers.
#[cfg(not(target_pointer_width = "64"))]
pub const MAX_IMAGE_HEIGHT: u32 = 32_767;

/// Maximum pixel count accepted by the handlers (codestream level 5).
pub const MAX_IMAGE_PIXELS: u64 = 268_435_456;

/// Text metadata key under which XMP packets are attached.
pub const META_KEY_XMP: &str = "XML:com.adobe.xmp";

/// Interleaved pixel layouts the handlers work with.
///
/// `Rgbx*` variants carry a padding channel that is kept opaque; they are the
/// storage form of alpha-less images whose decode buffer is four channels
/// wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum PixelFormat {
    /// No pixel data.
    #[default]
    Invalid,
    /// 8-bit grayscale.
    Gray8,
    /// 16-bit grayscale.
    Gray16,
    /// 8-bit RGB, 3 bytes per pixel.
    Rgb8,
    /// 8-bit RGB with a padding byte, 4 bytes per pixel.
    Rgbx8,
    /// 8-bit RGBA.
    Rgba8,
    /// 16-bit RGBA.
    Rgba16,
    /// 16-bit RGB with a padding channel.
    Rgbx16,
    /// Half-float RGBA.
    Rgba16F,
    /// Half-float RGB with a padding channel.
    Rgbx16F,
    /// Single-precision float RGBA.
    Rgba32F,
    /// Single-precision float RGB with a padding channel.
    Rgbx32F,
    /// 8-bit CMYK ink coverage, 4 bytes per pixel.
    Cmyk8,
}

impl PixelFormat {
    /// Bytes each pixel occupies.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Invalid => 0,
            PixelFormat::Gray8 => 1,
            PixelFormat::Gray16 => 2,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgbx8 | PixelFormat::Rgba8 | PixelFormat::Cmyk8 => 4,
            PixelFormat::Rgba16 | PixelFormat::Rgbx16 => 8,
            PixelFormat::Rgba16F | PixelFormat::Rgbx16F => 8,
            PixelFormat::Rgba32F | PixelFormat::Rgbx32F => 16,
        }
    }

    /// Whether pixels carry a real alpha channel (padding does not count).
    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba8 | PixelFormat::Rgba16 | PixelFormat::Rgba16F | PixelFormat::Rgba32F
        )
    }

    /// Whether this is a single-channel format.
    pub fn is_grayscale(self) -> bool {
        matches!(self, PixelFormat::Gray8 | PixelFormat::Gray16)
    }

    /// Whether samples are floating point.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba16F
                | PixelFormat::Rgbx16F
                | PixelFormat::Rgba32F
                | PixelFormat::Rgbx32F
        )
    }

    /// Bits per sample.
    pub fn bit_depth(self) -> u32 {
        match self {
            PixelFormat::Invalid => 0,
            PixelFormat::Gray8 | PixelFormat::Rgb8 | PixelFormat::Rgbx8 | PixelFormat::Rgba8
            | PixelFormat::Cmyk8 => 8,
            PixelFormat::Gray16
            | PixelFormat::Rgba16
            | PixelFormat::Rgbx16
            | PixelFormat::Rgba16F
            | PixelFormat::Rgbx16F => 16,
            PixelFormat::Rgba32F | PixelFormat::Rgbx32F => 32,
        }
    }
}

/// Why an image buffer could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// Width or height is zero.
    #[error("Image has zero dimension")]
    ZeroDimension,
    /// Dimensions exceed [`MAX_IMAGE_WIDTH`] / [`MAX_IMAGE_HEIGHT`] /
    /// [`MAX_IMAGE_PIXELS`].
    #[error("Image ({width}x{height}) exceeds the platform caps")]
    TooLarge {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
    },
    /// The allocator refused the buffer.
    #[error("Memory cannot be allocated")]
    OutOfMemory,
}

impl From<ImageError> for DecodeError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::ZeroDimension => DecodeError::DecoderInit("image has zero dimensions"),
            ImageError::TooLarge { width, height } => DecodeError::TooLarge { width, height },
            ImageError::OutOfMemory => DecodeError::AllocFailure,
        }
    }
}

impl From<ImageError> for EncodeError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::ZeroDimension => EncodeError::Config("image has zero dimensions".into()),
            ImageError::TooLarge { width, height } => EncodeError::TooLarge { width, height },
            ImageError::OutOfMemory => EncodeError::AllocFailure,
        }
    }
}

/// An interleaved raster image with colorspace and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    data: Vec<u8>,
    colorspace: Option<ColorSpace>,
    text: BTreeMap<String, String>,
    dots_per_meter_x: Option<u32>,
    dots_per_meter_y: Option<u32>,
    exif_orientation: Option<u16>,
}

impl Image {
    /// Allocates a zero-filled image, enforcing the platform dimension caps.
    pub fn alloc(width: u32, height: u32, format: PixelFormat) -> Result<Image, ImageError> {
        if width == 0 || height == 0 || format == PixelFormat::Invalid {
            return Err(ImageError::ZeroDimension);
        }
        if width > MAX_IMAGE_WIDTH
            || height > MAX_IMAGE_HEIGHT
            || u64::from(width) * u64::from(height) > MAX_IMAGE_PIXELS
        {
            return Err(ImageError::TooLarge { width, height });
        }
        let stride = width as usize * format.bytes_per_pixel();
        let size = stride
            .checked_mul(height as usize)
            .ok_or(ImageError::TooLarge { width, height })?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| ImageError::OutOfMemory)?;
        data.resize(size, 0);
        Ok(Image {
            format,
            width,
            height,
            stride,
            data,
            colorspace: None,
            text: BTreeMap::new(),
            dots_per_meter_x: None,
            dots_per_meter_y: None,
            exif_orientation: None,
        })
    }

    /// Width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The pixel layout.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per scanline.
    pub fn bytes_per_line(&self) -> usize {
        self.stride
    }

    /// The whole pixel buffer.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The whole pixel buffer, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// One scanline.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.stride]
    }

    /// One scanline, mutably.
    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        &mut self.data[start..start + self.stride]
    }

    /// Whether the pixel format carries an alpha channel.
    pub fn has_alpha_channel(&self) -> bool {
        self.format.has_alpha()
    }

    /// The attached color space.
    pub fn colorspace(&self) -> Option<&ColorSpace> {
        self.colorspace.as_ref()
    }

    /// Attaches a color space.
    pub fn set_colorspace(&mut self, colorspace: Option<ColorSpace>) {
        self.colorspace = colorspace;
    }

    /// Looks up a text metadata entry.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.text.get(key).map(String::as_str)
    }

    /// Sets a text metadata entry.
    pub fn set_text(&mut self, key: &str, value: &str) {
        self.text.insert(key.to_owned(), value.to_owned());
    }

    /// All text metadata entries.
    pub fn text_keys(&self) -> impl Iterator<Item = &str> {
        self.text.keys().map(String::as_str)
    }

    /// Horizontal resolution in dots per meter.
    pub fn dots_per_meter_x(&self) -> Option<u32> {
        self.dots_per_meter_x
    }

    /// Vertical resolution in dots per meter.
    pub fn dots_per_meter_y(&self) -> Option<u32> {
        self.dots_per_meter_y
    }

    /// Sets the physical resolution in dots per meter.
    pub fn set_dots_per_meter(&mut self, x: u32, y: u32) {
        self.dots_per_meter_x = Some(x);
        self.dots_per_meter_y = Some(y);
    }

    /// The Exif orientation value carried by the source, if any.
    pub fn exif_orientation(&self) -> Option<u16> {
        self.exif_orientation
    }

    /// Records the Exif orientation value.
    pub fn set_exif_orientation(&mut self, orientation: u16) {
        self.exif_orientation = Some(orientation);
    }

    /// Converts the pixel data to `target`, preserving metadata and the
    /// attached color space.
    ///
    /// Conversions go through normalized RGBA samples: integer depths are
    /// rescaled, padding channels read as opaque, grayscale targets take
    /// BT.601 luma, and CMYK sources are flattened with the device CMYK
    /// fallback. Float samples pass through unclamped between float formats.
    pub fn convert_to(&self, target: PixelFormat) -> Result<Image, ImageError> {
        if target == self.format {
            return Ok(self.clone());
        }
        let mut out = Image::alloc(self.width, self.height, target)?;
        out.colorspace = self.colorspace.clone();
        out.text = self.text.clone();
        out.dots_per_meter_x = self.dots_per_meter_x;
        out.dots_per_meter_y = self.dots_per_meter_y;
        out.exif_orientation = self.exif_orientation;

        let src_bpp = self.format.bytes_per_pixel();
        let dst_bpp = target.bytes_per_pixel();
        for y in 0..self.height {
            let src_row = self.row(y);
            let dst_start = y as usize * out.stride;
            let dst_row = &mut out.data[dst_start..dst_start + out.stride];
            for x in 0..self.width as usize {
                let px = read_sample(self.format, &src_row[x * src_bpp..(x + 1) * src_bpp]);
                write_sample(target, px, &mut dst_row[x * dst_bpp..(x + 1) * dst_bpp]);
            }
        }
        Ok(out)
    }
}

/// Reads one pixel as unclamped `[r, g, b, a]` in `0.0..=1.0` nominal range.
fn read_sample(format: PixelFormat, bytes: &[u8]) -> [f32; 4] {
    let u8n = |v: u8| v as f32 / 255.0;
    let u16n = |lo: u8, hi: u8| u16::from_ne_bytes([lo, hi]) as f32 / 65535.0;
    let f16n = |lo: u8, hi: u8| f16::from_ne_bytes([lo, hi]).to_f32();
    let f32n = |b: &[u8]| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
    match format {
        PixelFormat::Invalid => [0.0; 4],
        PixelFormat::Gray8 => {
            let v = u8n(bytes[0]);
            [v, v, v, 1.0]
        }
        PixelFormat::Gray16 => {
            let v = u16n(bytes[0], bytes[1]);
            [v, v, v, 1.0]
        }
        PixelFormat::Rgb8 => [u8n(bytes[0]), u8n(bytes[1]), u8n(bytes[2]), 1.0],
        PixelFormat::Rgbx8 => [u8n(bytes[0]), u8n(bytes[1]), u8n(bytes[2]), 1.0],
        PixelFormat::Rgba8 => [u8n(bytes[0]), u8n(bytes[1]), u8n(bytes[2]), u8n(bytes[3])],
        PixelFormat::Rgba16 | PixelFormat::Rgbx16 => {
            let a = if format == PixelFormat::Rgba16 {
                u16n(bytes[6], bytes[7])
            } else {
                1.0
            };
            [
                u16n(bytes[0], bytes[1]),
                u16n(bytes[2], bytes[3]),
                u16n(bytes[4], bytes[5]),
                a,
            ]
        }
        PixelFormat::Rgba16F | PixelFormat::Rgbx16F => {
            let a = if format == PixelFormat::Rgba16F {
                f16n(bytes[6], bytes[7])
            } else {
                1.0
            };
            [
                f16n(bytes[0], bytes[1]),
                f16n(bytes[2], bytes[3]),
                f16n(bytes[4], bytes[5]),
                a,
            ]
        }
        PixelFormat::Rgba32F | PixelFormat::Rgbx32F => {
            let a = if format == PixelFormat::Rgba32F {
                f32n(&bytes[12..16])
            } else {
                1.0
            };
            [f32n(&bytes[0..4]), f32n(&bytes[4..8]), f32n(&bytes[8..12]), a]
        }
        PixelFormat::Cmyk8 => {
            let (r, g, b) = color::cmyk_to_rgb8(bytes[0], bytes[1], bytes[2], bytes[3]);
            [u8n(r), u8n(g), u8n(b), 1.0]
        }
    }
}

/// Writes one `[r, g, b, a]` pixel into `bytes` in `format`.
fn write_sample(format: PixelFormat, px: [f32; 4], bytes: &mut [u8]) {
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u8;
    let to_u16 = |v: f32| (v.clamp(0.0, 1.0) * 65535.0 + 0.5) as u16;
    // BT.601 luma, matching the integer gray conversion hosts use.
    let luma = |px: [f32; 4]| 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2];
    match format {
        PixelFormat::Invalid => {}
        PixelFormat::Gray8 => bytes[0] = to_u8(luma(px)),
        PixelFormat::Gray16 => bytes[0..2].copy_from_slice(&to_u16(luma(px)).to_ne_bytes()),
        PixelFormat::Rgb8 => {
            bytes[0] = to_u8(px[0]);
            bytes[1] = to_u8(px[1]);
            bytes[2] = to_u8(px[2]);
        }
        PixelFormat::Rgbx8 => {
            bytes[0] = to_u8(px[0]);
            bytes[1] = to_u8(px[1]);
            bytes[2] = to_u8(px[2]);
            bytes[3] = 255;
        }
        PixelFormat::Rgba8 => {
            bytes[0] = to_u8(px[0]);
            bytes[1] = to_u8(px[1]);
            bytes[2] = to_u8(px[2]);
            bytes[3] = to_u8(px[3]);
        }
        PixelFormat::Rgba16 | PixelFormat::Rgbx16 => {
            bytes[0..2].copy_from_slice(&to_u16(px[0]).to_ne_bytes());
            bytes[2..4].copy_from_slice(&to_u16(px[1]).to_ne_bytes());
            bytes[4..6].copy_from_slice(&to_u16(px[2]).to_ne_bytes());
            let a = if format == PixelFormat::Rgba16 {
                to_u16(px[3])
            } else {
                65535
            };
            bytes[6..8].copy_from_slice(&a.to_ne_bytes());
        }
        PixelFormat::Rgba16F | PixelFormat::Rgbx16F => {
            bytes[0..2].copy_from_slice(&f16::from_f32(px[0]).to_ne_bytes());
            bytes[2..4].copy_from_slice(&f16::from_f32(px[1]).to_ne_bytes());
            bytes[4..6].copy_from_slice(&f16::from_f32(px[2]).to_ne_bytes());
            let a = if format == PixelFormat::Rgba16F {
                f16::from_f32(px[3])
            } else {
                f16::ONE
            };
            bytes[6..8].copy_from_slice(&a.to_ne_bytes());
        }
        PixelFormat::Rgba32F | PixelFormat::Rgbx32F => {
            bytes[0..4].copy_from_slice(&px[0].to_ne_bytes());
            bytes[4..8].copy_from_slice(&px[1].to_ne_bytes());
            bytes[8..12].copy_from_slice(&px[2].to_ne_bytes());
            let a = if format == PixelFormat::Rgba32F {
                px[3]
            } else {
                1.0
            };
            bytes[12..16].copy_from_slice(&a.to_ne_bytes());
        }
        PixelFormat::Cmyk8 => {
            // Device CMYK from RGB with full black generation.
            let r = to_u8(px[0]) as u32;
            let g = to_u8(px[1]) as u32;
            let b = to_u8(px[2]) as u32;
            let k = 255 - r.max(g).max(b);
            let (c, m, y) = if k == 255 {
                (0, 0, 0)
            } else {
                let denom = 255 - k;
                (
                    (255 - r - k) * 255 / denom,
                    (255 - g - k) * 255 / denom,
                    (255 - b - k) * 255 / denom,
                )
            };
            bytes[0] = c as u8;
            bytes[1] = m as u8;
            bytes[2] = y as u8;
            bytes[3] = k as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rejects_zero_and_oversized() {
        assert_eq!(
            Image::alloc(0, 10, PixelFormat::Rgba8),
            Err(ImageError::ZeroDimension)
        );
        assert!(matches!(
            Image::alloc(MAX_IMAGE_WIDTH + 1, 1, PixelFormat::Gray8),
            Err(ImageError::TooLarge { .. })
        ));
        // Within per-axis caps but over the pixel cap.
        assert!(matches!(
            Image::alloc(32_768, 16_384, PixelFormat::Gray8),
            Err(ImageError::TooLarge { .. })
        ));
    }

    #[test]
    fn stride_is_tight() {
        let img = Image::alloc(3, 2, PixelFormat::Rgb8).unwrap();
        assert_eq!(img.bytes_per_line(), 9);
        assert_eq!(img.data().len(), 18);
    }

    #[test]
    fn rgba_to_rgbx_drops_alpha_storage() {
        let mut img = Image::alloc(1, 1, PixelFormat::Rgba8).unwrap();
        img.data_mut().copy_from_slice(&[10, 20, 30, 77]);
        let out = img.convert_to(PixelFormat::Rgbx8).unwrap();
        assert_eq!(out.data(), &[10, 20, 30, 255]);
        assert!(!out.has_alpha_channel());
    }

    #[test]
    fn rgb8_widens_to_rgba16() {
        let mut img = Image::alloc(1, 1, PixelFormat::Rgb8).unwrap();
        img.data_mut().copy_from_slice(&[255, 0, 128, 0][..3]);
        let out = img.convert_to(PixelFormat::Rgba16).unwrap();
        let r = u16::from_ne_bytes([out.data()[0], out.data()[1]]);
        let a = u16::from_ne_bytes([out.data()[6], out.data()[7]]);
        assert_eq!(r, 65535);
        assert_eq!(a, 65535);
    }

    #[test]
    fn float_samples_survive_unclamped() {
        let mut img = Image::alloc(1, 1, PixelFormat::Rgba32F).unwrap();
        let px: Vec<u8> = [1.5f32, -0.25, 0.0, 1.0]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        img.data_mut().copy_from_slice(&px);
        let out = img.convert_to(PixelFormat::Rgbx32F).unwrap();
        let r = f32::from_ne_bytes(out.data()[0..4].try_into().unwrap());
        let g = f32::from_ne_bytes(out.data()[4..8].try_into().unwrap());
        assert_eq!(r, 1.5);
        assert_eq!(g, -0.25);
    }

    #[test]
    fn cmyk_flattens_via_device_fallback() {
        let mut img = Image::alloc(1, 1, PixelFormat::Cmyk8).unwrap();
        img.data_mut().copy_from_slice(&[0, 0, 0, 0]);
        let out = img.convert_to(PixelFormat::Rgb8).unwrap();
        assert_eq!(out.data(), &[255, 255, 255]);
    }

    #[test]
    fn conversion_preserves_metadata() {
        let mut img = Image::alloc(2, 2, PixelFormat::Rgb8).unwrap();
        img.set_colorspace(Some(ColorSpace::srgb()));
        img.set_text(META_KEY_XMP, "<x/>");
        img.set_dots_per_meter(2835, 2835);
        let out = img.convert_to(PixelFormat::Rgba8).unwrap();
        assert_eq!(out.colorspace(), Some(&ColorSpace::srgb()));
        assert_eq!(out.text(META_KEY_XMP), Some("<x/>"));
        assert_eq!(out.dots_per_meter_x(), Some(2835));
    }

    #[test]
    fn gray_conversion_uses_bt601() {
        let mut img = Image::alloc(1, 1, PixelFormat::Rgb8).unwrap();
        img.data_mut().copy_from_slice(&[255, 0, 0]);
        let out = img.convert_to(PixelFormat::Gray8).unwrap();
        assert_eq!(out.data()[0], 76);
    }
}
