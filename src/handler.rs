//! The host-facing handler interface.
//!
//! A host image I/O framework talks to each codec through [`ImageHandler`]:
//! one handler instance per input stream, created lazily, queried for options
//! and frames, torn down when the host is done. The trait is object-safe so
//! hosts can keep `Box<dyn ImageHandler>` per stream.

use std::io::Write;

use crate::error::{DecodeError, EncodeError};
use crate::image::{Image, PixelFormat};

/// Options a host can query or set on a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ImageOption {
    /// Encode quality, `0..=100`; 100 selects lossless (read/write).
    Quality,
    /// Image dimensions in pixels (read).
    Size,
    /// Whether the stream contains an animation (read).
    Animation,
    /// Orientation to apply, one of the eight [`Transformation`] codes
    /// (read/write).
    ImageTransformation,
    /// The pixel format the handler will produce (read).
    ImageFormat,
    /// Byte order of the stored samples (read).
    Endianness,
}

/// Sample byte order, as reported through [`ImageOption::Endianness`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first.
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Value of an [`ImageOption`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum OptionValue {
    /// An integer value (quality, transformation index).
    Int(i32),
    /// A boolean value (animation flag).
    Bool(bool),
    /// Image dimensions.
    Size {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
    /// A pixel format.
    Format(PixelFormat),
    /// A sample byte order.
    ByteOrder(ByteOrder),
}

impl OptionValue {
    /// The contained integer, if this is an [`OptionValue::Int`].
    pub fn as_int(&self) -> Option<i32> {
        match self {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// The eight orientation transformations an image stream can request.
///
/// The discriminants match the host framework's transformation codes, so a
/// host integer maps through [`Transformation::from_index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Transformation {
    /// No transformation.
    #[default]
    None = 0,
    /// Mirror horizontally.
    Mirror = 1,
    /// Flip vertically.
    Flip = 2,
    /// Rotate 180 degrees.
    Rotate180 = 3,
    /// Rotate 90 degrees clockwise.
    Rotate90 = 4,
    /// Mirror horizontally, then rotate 90 degrees clockwise.
    MirrorAndRotate90 = 5,
    /// Flip vertically, then rotate 90 degrees clockwise.
    FlipAndRotate90 = 6,
    /// Rotate 270 degrees clockwise.
    Rotate270 = 7,
}

impl Transformation {
    /// Maps a host integer in `0..=7` to a transformation.
    pub fn from_index(index: i32) -> Option<Self> {
        Some(match index {
            0 => Transformation::None,
            1 => Transformation::Mirror,
            2 => Transformation::Flip,
            3 => Transformation::Rotate180,
            4 => Transformation::Rotate90,
            5 => Transformation::MirrorAndRotate90,
            6 => Transformation::FlipAndRotate90,
            7 => Transformation::Rotate270,
            _ => return None,
        })
    }

    /// The host integer for this transformation.
    pub fn index(self) -> i32 {
        self as i32
    }
}

/// A pluggable image codec handler.
///
/// Reading is stateful: `read` returns the next frame and advances the
/// cursor, `jump_to_image` / `jump_to_next_image` reposition it, and
/// `image_count` / `next_image_delay` describe the animation. Handlers parse
/// lazily, so any of these may trigger header parsing on first use.
pub trait ImageHandler {
    /// Whether the stream looks readable by this handler in its current
    /// state. Never consumes input.
    fn can_read(&self) -> bool;

    /// Decodes the next frame.
    fn read(&mut self) -> Result<Image, DecodeError>;

    /// Encodes `image` and writes the complete stream to `device`.
    fn write(&mut self, image: &Image, device: &mut dyn Write) -> Result<(), EncodeError> {
        let _ = (image, device);
        Err(EncodeError::Config("writing is not supported".into()))
    }

    /// Whether this handler understands `option` at all.
    fn supports_option(&self, option: ImageOption) -> bool;

    /// Queries an option. Returns `None` for unsupported options or when the
    /// value is not (yet) available.
    fn option(&mut self, option: ImageOption) -> Option<OptionValue>;

    /// Sets an option. Unsupported options are ignored.
    fn set_option(&mut self, option: ImageOption, value: OptionValue) {
        let _ = (option, value);
    }

    /// Number of frames in the stream; 0 when the stream cannot be parsed.
    fn image_count(&mut self) -> usize;

    /// Number of times an animation loops; -1 means forever, 0 means no
    /// animation.
    fn loop_count(&mut self) -> i32 {
        0
    }

    /// Index of the frame the cursor points at; -1 before parsing.
    fn current_image_number(&self) -> i32 {
        0
    }

    /// Repositions the cursor on frame `index`.
    fn jump_to_image(&mut self, index: usize) -> Result<(), DecodeError> {
        if index == 0 {
            Ok(())
        } else {
            Err(DecodeError::FrameOutOfBounds { index, total: 1 })
        }
    }

    /// Advances the cursor to the next frame.
    fn jump_to_next_image(&mut self) -> Result<(), DecodeError> {
        Err(DecodeError::FrameOutOfBounds { index: 1, total: 1 })
    }

    /// Delay in milliseconds before the frame after the one last read should
    /// be shown; 0 for static images.
    fn next_image_delay(&mut self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transformation_round_trips_through_index() {
        for i in 0..8 {
            let t = Transformation::from_index(i).unwrap();
            assert_eq!(t.index(), i);
        }
        assert_eq!(Transformation::from_index(8), None);
        assert_eq!(Transformation::from_index(-1), None);
    }

    #[test]
    fn option_value_int_accessor() {
        assert_eq!(OptionValue::Int(90).as_int(), Some(90));
        assert_eq!(OptionValue::Bool(true).as_int(), None);
    }
}
