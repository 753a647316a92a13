//! Minimal Exif support.
//!
//! The handlers only need a small slice of Exif: locating the TIFF stream
//! inside a metadata box, reading orientation / resolution / a few text tags
//! into image metadata, and serializing the same subset when writing. Full
//! Exif handling is a host concern.

use log::warn;

use crate::image::Image;

const TIFF_HEADER_BE: [u8; 4] = [b'M', b'M', 0, 42];
const TIFF_HEADER_LE: [u8; 4] = [b'I', b'I', 42, 0];

const TAG_DESCRIPTION: u16 = 0x010E;
const TAG_ORIENTATION: u16 = 0x0112;
const TAG_X_RESOLUTION: u16 = 0x011A;
const TAG_Y_RESOLUTION: u16 = 0x011B;
const TAG_RESOLUTION_UNIT: u16 = 0x0128;
const TAG_SOFTWARE: u16 = 0x0131;
const TAG_DATE_TIME: u16 = 0x0132;
const TAG_ARTIST: u16 = 0x013B;

const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_RATIONAL: u16 = 5;

/// Text metadata keys the Exif tags map to.
const KEY_DESCRIPTION: &str = "Description";
const KEY_SOFTWARE: &str = "Software";
const KEY_ARTIST: &str = "Artist";
const KEY_DATE_TIME: &str = "CreationDate";

/// Finds the earliest TIFF header (either endianness) in `data`.
pub(crate) fn locate_tiff_header(data: &[u8]) -> Option<usize> {
    let be = data.windows(4).position(|w| w == TIFF_HEADER_BE);
    let le = data.windows(4).position(|w| w == TIFF_HEADER_LE);
    match (be, le) {
        (Some(b), Some(l)) => Some(b.min(l)),
        (Some(b), None) => Some(b),
        (None, Some(l)) => Some(l),
        (None, None) => None,
    }
}

/// The Exif subset the handlers read and write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MicroExif {
    /// Orientation tag value, 1..=8.
    pub orientation: Option<u16>,
    /// Horizontal resolution in dots per inch.
    pub horizontal_resolution: Option<f32>,
    /// Vertical resolution in dots per inch.
    pub vertical_resolution: Option<f32>,
    /// ImageDescription tag.
    pub description: Option<String>,
    /// Software tag.
    pub software: Option<String>,
    /// Artist tag.
    pub artist: Option<String>,
    /// DateTime tag.
    pub date_time: Option<String>,
}

impl MicroExif {
    /// Whether no field is set.
    pub fn is_empty(&self) -> bool {
        *self == MicroExif::default()
    }

    /// Parses a TIFF stream (as extracted from an Exif box).
    ///
    /// Returns `None` when the data is not a readable TIFF; unknown tags are
    /// skipped.
    pub fn from_bytes(data: &[u8]) -> Option<MicroExif> {
        let reader = TiffReader::new(data)?;
        let ifd_offset = reader.u32(4)? as usize;
        let count = reader.u16(ifd_offset)? as usize;

        let mut exif = MicroExif::default();
        let mut unit_is_cm = false;
        let mut res_x = None;
        let mut res_y = None;

        for i in 0..count {
            let entry = ifd_offset + 2 + i * 12;
            let tag = reader.u16(entry)?;
            let field_type = reader.u16(entry + 2)?;
            match (tag, field_type) {
                (TAG_ORIENTATION, TYPE_SHORT) => exif.orientation = reader.u16(entry + 8),
                (TAG_RESOLUTION_UNIT, TYPE_SHORT) => {
                    unit_is_cm = reader.u16(entry + 8) == Some(3);
                }
                (TAG_X_RESOLUTION, TYPE_RATIONAL) => res_x = reader.rational(entry + 8),
                (TAG_Y_RESOLUTION, TYPE_RATIONAL) => res_y = reader.rational(entry + 8),
                (TAG_DESCRIPTION, TYPE_ASCII) => exif.description = reader.ascii(entry),
                (TAG_SOFTWARE, TYPE_ASCII) => exif.software = reader.ascii(entry),
                (TAG_ARTIST, TYPE_ASCII) => exif.artist = reader.ascii(entry),
                (TAG_DATE_TIME, TYPE_ASCII) => exif.date_time = reader.ascii(entry),
                _ => {}
            }
        }

        let to_dpi = |r: f32| if unit_is_cm { r * 2.54 } else { r };
        exif.horizontal_resolution = res_x.map(to_dpi);
        exif.vertical_resolution = res_y.map(to_dpi);
        Some(exif)
    }

    /// Collects the Exif subset carried by an image.
    pub fn from_image(image: &Image) -> MicroExif {
        let dpi = |dpm: Option<u32>| dpm.map(|v| v as f32 * 0.0254);
        MicroExif {
            orientation: image.exif_orientation(),
            horizontal_resolution: dpi(image.dots_per_meter_x()),
            vertical_resolution: dpi(image.dots_per_meter_y()),
            description: image.text(KEY_DESCRIPTION).map(str::to_owned),
            software: image.text(KEY_SOFTWARE).map(str::to_owned),
            artist: image.text(KEY_ARTIST).map(str::to_owned),
            date_time: image.text(KEY_DATE_TIME).map(str::to_owned),
        }
    }

    /// Applies the physical resolution to an image.
    pub fn apply_resolution(&self, image: &mut Image) {
        if let (Some(x), Some(y)) = (self.horizontal_resolution, self.vertical_resolution) {
            if x > 0.0 && y > 0.0 {
                image.set_dots_per_meter((x / 0.0254).round() as u32, (y / 0.0254).round() as u32);
            }
        }
    }

    /// Applies orientation and text tags to an image.
    pub fn apply_metadata(&self, image: &mut Image) {
        if let Some(o) = self.orientation {
            image.set_exif_orientation(o);
        }
        if let Some(v) = &self.description {
            image.set_text(KEY_DESCRIPTION, v);
        }
        if let Some(v) = &self.software {
            image.set_text(KEY_SOFTWARE, v);
        }
        if let Some(v) = &self.artist {
            image.set_text(KEY_ARTIST, v);
        }
        if let Some(v) = &self.date_time {
            image.set_text(KEY_DATE_TIME, v);
        }
    }

    /// Serializes as a little-endian TIFF stream; empty when nothing is set.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }

        // tag, type, count, inline value or placeholder for the offset
        struct Entry {
            tag: u16,
            field_type: u16,
            count: u32,
            inline: Option<u32>,
            payload: Vec<u8>,
        }

        let mut entries: Vec<Entry> = Vec::new();
        let push_ascii = |entries: &mut Vec<Entry>, tag: u16, value: &Option<String>| {
            if let Some(v) = value {
                let mut payload = v.as_bytes().to_vec();
                payload.push(0);
                let count = payload.len() as u32;
                let inline = if payload.len() <= 4 {
                    let mut word = [0u8; 4];
                    word[..payload.len()].copy_from_slice(&payload);
                    Some(u32::from_le_bytes(word))
                } else {
                    None
                };
                entries.push(Entry {
                    tag,
                    field_type: TYPE_ASCII,
                    count,
                    inline,
                    payload,
                });
            }
        };
        let rational_bytes = |v: f32| {
            let num = (v * 100.0).round() as u32;
            let mut payload = num.to_le_bytes().to_vec();
            payload.extend_from_slice(&100u32.to_le_bytes());
            payload
        };

        push_ascii(&mut entries, TAG_DESCRIPTION, &self.description);
        if let Some(o) = self.orientation {
            entries.push(Entry {
                tag: TAG_ORIENTATION,
                field_type: TYPE_SHORT,
                count: 1,
                inline: Some(o as u32),
                payload: Vec::new(),
            });
        }
        if let Some(x) = self.horizontal_resolution {
            entries.push(Entry {
                tag: TAG_X_RESOLUTION,
                field_type: TYPE_RATIONAL,
                count: 1,
                inline: None,
                payload: rational_bytes(x),
            });
        }
        if let Some(y) = self.vertical_resolution {
            entries.push(Entry {
                tag: TAG_Y_RESOLUTION,
                field_type: TYPE_RATIONAL,
                count: 1,
                inline: None,
                payload: rational_bytes(y),
            });
        }
        if self.horizontal_resolution.is_some() || self.vertical_resolution.is_some() {
            entries.push(Entry {
                tag: TAG_RESOLUTION_UNIT,
                field_type: TYPE_SHORT,
                count: 1,
                inline: Some(2), // inches
                payload: Vec::new(),
            });
        }
        push_ascii(&mut entries, TAG_SOFTWARE, &self.software);
        push_ascii(&mut entries, TAG_DATE_TIME, &self.date_time);
        push_ascii(&mut entries, TAG_ARTIST, &self.artist);

        entries.sort_by_key(|e| e.tag);

        let ifd_offset = 8usize;
        let value_area = ifd_offset + 2 + entries.len() * 12 + 4;

        let mut out = Vec::new();
        out.extend_from_slice(&TIFF_HEADER_LE);
        out.extend_from_slice(&(ifd_offset as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());

        let mut payloads = Vec::new();
        let mut next_offset = value_area;
        for e in &entries {
            out.extend_from_slice(&e.tag.to_le_bytes());
            out.extend_from_slice(&e.field_type.to_le_bytes());
            out.extend_from_slice(&e.count.to_le_bytes());
            match e.inline {
                Some(word) => out.extend_from_slice(&word.to_le_bytes()),
                None => {
                    out.extend_from_slice(&(next_offset as u32).to_le_bytes());
                    next_offset += e.payload.len();
                    payloads.extend_from_slice(&e.payload);
                }
            }
        }
        out.extend_from_slice(&0u32.to_le_bytes()); // no next IFD
        out.extend_from_slice(&payloads);
        out
    }
}

/// Bounds-checked, endian-aware TIFF field access.
struct TiffReader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl<'a> TiffReader<'a> {
    fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < 8 {
            return None;
        }
        let big_endian = match &data[0..4] {
            h if h == TIFF_HEADER_BE => true,
            h if h == TIFF_HEADER_LE => false,
            _ => {
                warn!("Exif payload does not start with a TIFF header");
                return None;
            }
        };
        Some(TiffReader { data, big_endian })
    }

    fn u16(&self, offset: usize) -> Option<u16> {
        let b = self.data.get(offset..offset + 2)?;
        Some(if self.big_endian {
            u16::from_be_bytes([b[0], b[1]])
        } else {
            u16::from_le_bytes([b[0], b[1]])
        })
    }

    fn u32(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(if self.big_endian {
            u32::from_be_bytes([b[0], b[1], b[2], b[3]])
        } else {
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        })
    }

    /// Reads the RATIONAL a value field at `entry_value` points at.
    fn rational(&self, entry_value: usize) -> Option<f32> {
        let offset = self.u32(entry_value)? as usize;
        let num = self.u32(offset)?;
        let den = self.u32(offset + 4)?;
        if den == 0 {
            return None;
        }
        Some(num as f32 / den as f32)
    }

    /// Reads the ASCII value of the entry starting at `entry`.
    fn ascii(&self, entry: usize) -> Option<String> {
        let count = self.u32(entry + 4)? as usize;
        if count == 0 {
            return None;
        }
        let bytes = if count <= 4 {
            self.data.get(entry + 8..entry + 8 + count)?
        } else {
            let offset = self.u32(entry + 8)? as usize;
            self.data.get(offset..offset + count)?
        };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        std::str::from_utf8(&bytes[..end]).ok().map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelFormat;

    #[test]
    fn locates_earliest_tiff_header() {
        let mut data = vec![0u8; 16];
        data[6..10].copy_from_slice(&TIFF_HEADER_LE);
        data[10..14].copy_from_slice(&TIFF_HEADER_BE);
        assert_eq!(locate_tiff_header(&data), Some(6));
        assert_eq!(locate_tiff_header(&[0u8; 16]), None);
    }

    #[test]
    fn serialized_fields_parse_back() {
        let exif = MicroExif {
            orientation: Some(6),
            horizontal_resolution: Some(300.0),
            vertical_resolution: Some(300.0),
            software: Some("zenjxl".into()),
            ..MicroExif::default()
        };
        let bytes = exif.to_bytes();
        assert!(!bytes.is_empty());
        let parsed = MicroExif::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.orientation, Some(6));
        assert_eq!(parsed.horizontal_resolution, Some(300.0));
        assert_eq!(parsed.software.as_deref(), Some("zenjxl"));
    }

    #[test]
    fn empty_exif_serializes_to_nothing() {
        assert!(MicroExif::default().to_bytes().is_empty());
    }

    #[test]
    fn image_round_trip() {
        let mut img = Image::alloc(1, 1, PixelFormat::Rgb8).unwrap();
        img.set_dots_per_meter(11811, 11811); // 300 dpi
        img.set_text("Artist", "nobody");
        let exif = MicroExif::from_image(&img);
        assert!((exif.horizontal_resolution.unwrap() - 300.0).abs() < 0.01);

        let mut out = Image::alloc(1, 1, PixelFormat::Rgb8).unwrap();
        exif.apply_resolution(&mut out);
        exif.apply_metadata(&mut out);
        assert_eq!(out.dots_per_meter_x(), Some(11811));
        assert_eq!(out.text("Artist"), Some("nobody"));
    }

    #[test]
    fn big_endian_tiff_parses() {
        // MM header, IFD at 8, one SHORT orientation entry.
        let mut data = Vec::new();
        data.extend_from_slice(&TIFF_HEADER_BE);
        data.extend_from_slice(&8u32.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&TAG_ORIENTATION.to_be_bytes());
        data.extend_from_slice(&TYPE_SHORT.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        let parsed = MicroExif::from_bytes(&data).unwrap();
        assert_eq!(parsed.orientation, Some(3));
    }

    #[test]
    fn malformed_tiff_is_rejected_quietly() {
        assert!(MicroExif::from_bytes(&[]).is_none());
        assert!(MicroExif::from_bytes(b"IIII").is_none());
        // Valid header but truncated IFD must not panic.
        let mut data = Vec::new();
        data.extend_from_slice(&TIFF_HEADER_LE);
        data.extend_from_slice(&8u32.to_le_bytes());
        data.extend_from_slice(&5u16.to_le_bytes());
        let parsed = MicroExif::from_bytes(&data);
        assert!(parsed.is_none() || parsed == Some(MicroExif::default()));
    }
}
