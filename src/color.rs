//! Color space descriptions attached to decoded and encoded images.
//!
//! A [`ColorSpace`] is either structured (named primaries, a transfer
//! function, and a white point) or derived from an embedded ICC profile. Full
//! ICC transforms belong to a color-management collaborator; this module only
//! classifies profiles and provides the device-independent CMYK fallback the
//! decode path needs when no CMS is wired in.

use log::warn;

/// The color model a space describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorModel {
    /// Three color channels.
    Rgb,
    /// A single luminance channel.
    Gray,
    /// Cyan, magenta, yellow and black ink coverage.
    Cmyk,
}

/// Named primary sets recognized for structured encoding on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primaries {
    /// sRGB / BT.709 primaries.
    Srgb,
    /// Adobe RGB (1998) primaries.
    AdobeRgb,
    /// DCI-P3 primaries with a D65 white point.
    DciP3D65,
    /// ProPhoto RGB (ROMM) primaries.
    ProPhotoRgb,
    /// BT.2020 / BT.2100 primaries.
    Bt2020,
    /// Anything else; described only by an ICC profile.
    Custom,
}

/// Transfer functions recognized for structured encoding on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFunction {
    /// The piecewise sRGB curve.
    Srgb,
    /// Linear light.
    Linear,
    /// A pure power curve; the exponent lives in [`ColorSpace::gamma`].
    Gamma,
    /// Anything else; described only by an ICC profile.
    Custom,
}

/// The D65 white point in CIE xy.
pub const WHITE_POINT_D65: (f32, f32) = (0.3127, 0.329);

/// A color space attached to an [`Image`](crate::Image).
#[derive(Debug, Clone, PartialEq)]
pub struct ColorSpace {
    model: ColorModel,
    primaries: Primaries,
    transfer: TransferFunction,
    gamma: f32,
    white_point: Option<(f32, f32)>,
    icc: Option<Vec<u8>>,
}

impl ColorSpace {
    /// The sRGB color space.
    pub fn srgb() -> Self {
        ColorSpace {
            model: ColorModel::Rgb,
            primaries: Primaries::Srgb,
            transfer: TransferFunction::Srgb,
            gamma: 0.0,
            white_point: Some(WHITE_POINT_D65),
            icc: None,
        }
    }

    /// sRGB primaries with a linear transfer function.
    pub fn linear_srgb() -> Self {
        ColorSpace {
            transfer: TransferFunction::Linear,
            ..ColorSpace::srgb()
        }
    }

    /// A grayscale space with the given white point and transfer function.
    pub fn gray(white_point: (f32, f32), transfer: TransferFunction, gamma: f32) -> Self {
        ColorSpace {
            model: ColorModel::Gray,
            primaries: Primaries::Custom,
            transfer,
            gamma,
            white_point: Some(white_point),
            icc: None,
        }
    }

    /// An RGB space with sRGB primaries and the given white point and
    /// transfer function.
    pub fn rgb(white_point: (f32, f32), transfer: TransferFunction, gamma: f32) -> Self {
        ColorSpace {
            model: ColorModel::Rgb,
            primaries: Primaries::Srgb,
            transfer,
            gamma,
            white_point: Some(white_point),
            icc: None,
        }
    }

    /// Classifies an embedded ICC profile.
    ///
    /// Only the header is inspected: the profile's data color space selects
    /// the [`ColorModel`], primaries and transfer stay [`Primaries::Custom`] /
    /// [`TransferFunction::Custom`], and the raw blob is retained for
    /// round-tripping. Returns `None` (with a warning) for blobs that do not
    /// look like ICC profiles.
    pub fn from_icc(data: &[u8]) -> Option<Self> {
        if data.len() < 128 {
            warn!("ICC profile is too short ({} bytes)", data.len());
            return None;
        }
        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared < 128 || declared > data.len() {
            warn!("ICC profile has inconsistent size field");
            return None;
        }
        if &data[36..40] != b"acsp" {
            warn!("ICC profile signature not found");
            return None;
        }
        let model = match &data[16..20] {
            b"RGB " => ColorModel::Rgb,
            b"GRAY" => ColorModel::Gray,
            b"CMYK" => ColorModel::Cmyk,
            other => {
                warn!("Unsupported ICC data color space {:?}", other);
                return None;
            }
        };
        Some(ColorSpace {
            model,
            primaries: Primaries::Custom,
            transfer: TransferFunction::Custom,
            gamma: 0.0,
            white_point: None,
            icc: Some(data.to_vec()),
        })
    }

    /// The color model of this space.
    pub fn model(&self) -> ColorModel {
        self.model
    }

    /// The named primaries, [`Primaries::Custom`] for ICC-derived spaces.
    pub fn primaries(&self) -> Primaries {
        self.primaries
    }

    /// The transfer function.
    pub fn transfer(&self) -> TransferFunction {
        self.transfer
    }

    /// The exponent when [`transfer`](Self::transfer) is
    /// [`TransferFunction::Gamma`].
    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    /// The white point in CIE xy, when known.
    pub fn white_point(&self) -> Option<(f32, f32)> {
        self.white_point
    }

    /// The raw ICC profile this space was derived from, if any.
    pub fn icc_profile(&self) -> Option<&[u8]> {
        self.icc.as_deref()
    }
}

/// Device-independent CMYK to RGB conversion for one pixel.
///
/// Used when no CMS collaborator is available to apply the embedded CMYK
/// profile. Ink coverage is conventional (255 = full ink).
pub(crate) fn cmyk_to_rgb8(c: u8, m: u8, y: u8, k: u8) -> (u8, u8, u8) {
    let k = k as u32;
    let r = (255 - c as u32) * (255 - k) / 255;
    let g = (255 - m as u32) * (255 - k) / 255;
    let b = (255 - y as u32) * (255 - k) / 255;
    (r as u8, g as u8, b as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_icc(space: &[u8; 4]) -> Vec<u8> {
        let mut data = vec![0u8; 144];
        let len = data.len() as u32;
        data[0..4].copy_from_slice(&len.to_be_bytes());
        data[16..20].copy_from_slice(space);
        data[36..40].copy_from_slice(b"acsp");
        data
    }

    #[test]
    fn srgb_is_structured() {
        let cs = ColorSpace::srgb();
        assert_eq!(cs.model(), ColorModel::Rgb);
        assert_eq!(cs.primaries(), Primaries::Srgb);
        assert_eq!(cs.transfer(), TransferFunction::Srgb);
        assert!(cs.icc_profile().is_none());
        assert_eq!(cs, ColorSpace::srgb());
    }

    #[test]
    fn icc_header_classifies_model() {
        let cs = ColorSpace::from_icc(&fake_icc(b"CMYK")).unwrap();
        assert_eq!(cs.model(), ColorModel::Cmyk);
        assert_eq!(cs.primaries(), Primaries::Custom);
        assert!(cs.icc_profile().is_some());

        let cs = ColorSpace::from_icc(&fake_icc(b"GRAY")).unwrap();
        assert_eq!(cs.model(), ColorModel::Gray);
    }

    #[test]
    fn icc_rejects_garbage() {
        assert!(ColorSpace::from_icc(b"not an icc profile").is_none());
        let mut bad = fake_icc(b"RGB ");
        bad[36..40].copy_from_slice(b"nope");
        assert!(ColorSpace::from_icc(&bad).is_none());
    }

    #[test]
    fn cmyk_conversion_extremes() {
        assert_eq!(cmyk_to_rgb8(0, 0, 0, 0), (255, 255, 255));
        assert_eq!(cmyk_to_rgb8(0, 0, 0, 255), (0, 0, 0));
        assert_eq!(cmyk_to_rgb8(255, 0, 0, 0), (0, 255, 255));
    }
}
