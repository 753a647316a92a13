//! The PFM (Portable Float Map) reader.
//!
//! PFM is a trivial HDR container: an ASCII header followed by raw
//! single-precision floats. Two header dialects exist in the wild: the GIMP
//! form puts both dimensions on one line and stores rows bottom-up, the
//! Photoshop form splits the dimensions over two lines and stores rows
//! top-down. The sign of the scale line selects the sample byte order.
//! Writing is not supported.

use std::io::Write;

use byteorder_lite::{BigEndian, LittleEndian, ReadBytesExt};

use crate::color::ColorSpace;
use crate::error::{DecodeError, EncodeError};
use crate::handler::{ByteOrder, ImageHandler, ImageOption, OptionValue};
use crate::image::{Image, PixelFormat};

/// Longest header line the parser accepts.
const MAX_LINE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PfmHeader {
    pub(crate) grayscale: bool,
    pub(crate) photoshop: bool,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) byte_order: ByteOrder,
    pub(crate) data_offset: usize,
}

impl PfmHeader {
    pub(crate) fn parse(data: &[u8]) -> Result<PfmHeader, DecodeError> {
        let grayscale = match data.get(..3) {
            Some(b"PF\n") => false,
            Some(b"Pf\n") => true,
            _ => return Err(DecodeError::NotThisFormat),
        };

        let mut offset = 3;
        let (dims_line, next) = read_line(data, offset)?;
        offset = next;

        let mut tokens: Vec<String> = dims_line.split_whitespace().map(str::to_owned).collect();
        let photoshop = tokens.len() == 1;
        if photoshop {
            let (height_line, next) = read_line(data, offset)?;
            offset = next;
            tokens.extend(height_line.split_whitespace().map(str::to_owned));
        }
        if tokens.len() != 2 {
            return Err(DecodeError::InvalidHeader("malformed dimension line".into()));
        }

        let (scale_line, next) = read_line(data, offset)?;
        offset = next;

        let width: i64 = tokens[0]
            .parse()
            .map_err(|_| DecodeError::InvalidHeader("width is not an integer".into()))?;
        let height: i64 = tokens[1]
            .parse()
            .map_err(|_| DecodeError::InvalidHeader("height is not an integer".into()))?;
        let scale: f64 = scale_line
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidHeader("scale is not a number".into()))?;

        if scale == 0.0 {
            return Err(DecodeError::InvalidHeader("scale must be non-zero".into()));
        }
        if width <= 0 || height <= 0 || width > u32::MAX as i64 || height > u32::MAX as i64 {
            return Err(DecodeError::InvalidHeader("invalid dimensions".into()));
        }

        Ok(PfmHeader {
            grayscale,
            photoshop,
            width: width as u32,
            height: height as u32,
            byte_order: if scale > 0.0 {
                ByteOrder::BigEndian
            } else {
                ByteOrder::LittleEndian
            },
            data_offset: offset,
        })
    }
}

/// Reads one `\n`-terminated line of at most [`MAX_LINE`] bytes starting at
/// `offset`; returns the line and the offset just past the terminator.
fn read_line(data: &[u8], offset: usize) -> Result<(String, usize), DecodeError> {
    let rest = data
        .get(offset..)
        .ok_or_else(|| DecodeError::InvalidHeader("truncated header".into()))?;
    let window = &rest[..rest.len().min(MAX_LINE)];
    let end = window
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| DecodeError::InvalidHeader("unterminated header line".into()))?;
    let line = std::str::from_utf8(&window[..end])
        .map_err(|_| DecodeError::InvalidHeader("header is not ASCII".into()))?;
    Ok((line.to_owned(), offset + end + 1))
}

/// One PFM input stream.
pub struct PfmHandler {
    data: Vec<u8>,
    header: Option<PfmHeader>,
}

impl PfmHandler {
    /// Creates a handler over a complete PFM stream.
    pub fn new(data: Vec<u8>) -> Self {
        PfmHandler { data, header: None }
    }

    /// Whether the leading bytes parse as a PFM header.
    pub fn detect(data: &[u8]) -> bool {
        PfmHeader::parse(data).is_ok()
    }

    fn peek_header(&self) -> Option<PfmHeader> {
        self.header.or_else(|| PfmHeader::parse(&self.data).ok())
    }
}

impl ImageHandler for PfmHandler {
    fn can_read(&self) -> bool {
        self.peek_header().is_some()
    }

    fn read(&mut self) -> Result<Image, DecodeError> {
        let header = PfmHeader::parse(&self.data)?;
        self.header = Some(header);

        let mut image = Image::alloc(header.width, header.height, PixelFormat::Rgbx32F)?;

        let mut payload = self
            .data
            .get(header.data_offset..)
            .ok_or(DecodeError::Truncated)?;
        match header.byte_order {
            ByteOrder::BigEndian => read_samples::<BigEndian>(&mut payload, &mut image, &header)?,
            ByteOrder::LittleEndian => {
                read_samples::<LittleEndian>(&mut payload, &mut image, &header)?
            }
        }

        image.set_colorspace(Some(ColorSpace::linear_srgb()));
        Ok(image)
    }

    fn write(&mut self, _image: &Image, _device: &mut dyn Write) -> Result<(), EncodeError> {
        Err(EncodeError::Config("PFM writing is not supported".into()))
    }

    fn supports_option(&self, option: ImageOption) -> bool {
        matches!(
            option,
            ImageOption::Size | ImageOption::ImageFormat | ImageOption::Endianness
        )
    }

    fn option(&mut self, option: ImageOption) -> Option<OptionValue> {
        let header = self.peek_header()?;
        match option {
            ImageOption::Size => Some(OptionValue::Size {
                width: header.width,
                height: header.height,
            }),
            ImageOption::ImageFormat => Some(OptionValue::Format(PixelFormat::Rgbx32F)),
            ImageOption::Endianness => Some(OptionValue::ByteOrder(header.byte_order)),
            _ => None,
        }
    }

    fn image_count(&mut self) -> usize {
        usize::from(self.can_read())
    }
}

/// Float scanlines in declared endianness; GIMP-variant rows are stored
/// bottom-up.
fn read_samples<E: byteorder_lite::ByteOrder>(
    reader: &mut &[u8],
    image: &mut Image,
    header: &PfmHeader,
) -> Result<(), DecodeError> {
    let height = image.height();
    let width = image.width() as usize;
    for y in 0..height {
        let dest_y = if header.photoshop { y } else { height - 1 - y };
        let row = image.row_mut(dest_y);
        for x in 0..width {
            let base = x * 16;
            let r = reader.read_f32::<E>().map_err(|_| DecodeError::Truncated)?;
            let (g, b) = if header.grayscale {
                (r, r)
            } else {
                (
                    reader.read_f32::<E>().map_err(|_| DecodeError::Truncated)?,
                    reader.read_f32::<E>().map_err(|_| DecodeError::Truncated)?,
                )
            };
            row[base..base + 4].copy_from_slice(&r.to_ne_bytes());
            row[base + 4..base + 8].copy_from_slice(&g.to_ne_bytes());
            row[base + 8..base + 12].copy_from_slice(&b.to_ne_bytes());
            row[base + 12..base + 16].copy_from_slice(&1.0f32.to_ne_bytes());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn pixel(image: &Image, x: u32, y: u32) -> [f32; 4] {
        let row = image.row(y);
        let base = x as usize * 16;
        [
            f32::from_ne_bytes(row[base..base + 4].try_into().unwrap()),
            f32::from_ne_bytes(row[base + 4..base + 8].try_into().unwrap()),
            f32::from_ne_bytes(row[base + 8..base + 12].try_into().unwrap()),
            f32::from_ne_bytes(row[base + 12..base + 16].try_into().unwrap()),
        ]
    }

    #[test]
    fn gimp_variant_flips_rows() {
        let mut data = b"PF\n2 1\n-1.0\n".to_vec();
        data.extend(le_floats(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]));

        let mut handler = PfmHandler::new(data);
        assert!(handler.can_read());
        let image = handler.read().unwrap();
        assert_eq!(image.width(), 2);
        assert_eq!(image.height(), 1);
        assert_eq!(image.format(), PixelFormat::Rgbx32F);
        assert_eq!(image.colorspace(), Some(&ColorSpace::linear_srgb()));
        assert_eq!(pixel(&image, 0, 0), [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(pixel(&image, 1, 0), [0.4, 0.5, 0.6, 1.0]);
    }

    #[test]
    fn gimp_bottom_up_row_order() {
        let mut data = b"PF\n1 2\n-1.0\n".to_vec();
        // First stored triple is the bottom row.
        data.extend(le_floats(&[0.1, 0.1, 0.1, 0.9, 0.9, 0.9]));
        let image = PfmHandler::new(data).read().unwrap();
        assert_eq!(pixel(&image, 0, 0)[0], 0.9);
        assert_eq!(pixel(&image, 0, 1)[0], 0.1);
    }

    #[test]
    fn photoshop_variant_is_top_down() {
        let mut data = b"Pf\n1\n2\n-1.0\n".to_vec();
        data.extend(le_floats(&[0.25, 0.75]));
        let image = PfmHandler::new(data).read().unwrap();
        // Grayscale broadcast, no flip.
        assert_eq!(pixel(&image, 0, 0), [0.25, 0.25, 0.25, 1.0]);
        assert_eq!(pixel(&image, 0, 1), [0.75, 0.75, 0.75, 1.0]);
    }

    #[test]
    fn big_endian_scale_sign() {
        let mut data = b"Pf\n1 1\n1.0\n".to_vec();
        data.extend(0.5f32.to_be_bytes());
        let mut handler = PfmHandler::new(data);
        assert_eq!(
            handler.option(ImageOption::Endianness),
            Some(OptionValue::ByteOrder(ByteOrder::BigEndian))
        );
        let image = handler.read().unwrap();
        assert_eq!(pixel(&image, 0, 0)[0], 0.5);
    }

    #[test]
    fn zero_scale_is_rejected() {
        let data = b"PF\n2 1\n0.0\n".to_vec();
        assert!(matches!(
            PfmHeader::parse(&data),
            Err(DecodeError::InvalidHeader(_))
        ));
        assert!(!PfmHandler::detect(&data));
    }

    #[test]
    fn non_integer_dimensions_are_rejected() {
        let data = b"PF\n2.5 1\n-1.0\n".to_vec();
        assert!(matches!(
            PfmHeader::parse(&data),
            Err(DecodeError::InvalidHeader(_))
        ));
    }

    #[test]
    fn wrong_magic_is_not_this_format() {
        assert!(matches!(
            PfmHeader::parse(b"P6\n2 1\n255\n"),
            Err(DecodeError::NotThisFormat)
        ));
    }

    #[test]
    fn truncated_payload_is_fatal() {
        let mut data = b"PF\n2 1\n-1.0\n".to_vec();
        data.extend(le_floats(&[0.1, 0.2])); // 2 of 6 samples
        let mut handler = PfmHandler::new(data);
        assert!(matches!(handler.read(), Err(DecodeError::Truncated)));
    }

    #[test]
    fn size_option_peeks_without_consuming() {
        let mut data = b"PF\n3 2\n-1.0\n".to_vec();
        data.extend(le_floats(&[0.0; 18]));
        let mut handler = PfmHandler::new(data);
        assert_eq!(
            handler.option(ImageOption::Size),
            Some(OptionValue::Size { width: 3, height: 2 })
        );
        assert!(handler.read().is_ok());
    }
}
