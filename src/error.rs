//! Error types for the JPEG XL and PFM handlers.

use thiserror::Error;

/// Errors that can occur while reading an image.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The stream does not carry this handler's format signature.
    #[error("Stream is not in a recognized format")]
    NotThisFormat,

    /// The external decoder rejected input, subscription, or setup.
    #[error("Decoder initialization failed: {0}")]
    DecoderInit(&'static str),

    /// The stream ended before the decoder had enough data.
    #[error("Input data is incomplete")]
    Truncated,

    /// The external decoder signalled an error mid-stream.
    #[error("Decoding failed: {0}")]
    Decoder(String),

    /// The decoder produced an event other than the one the state machine
    /// was driving towards.
    #[error("Unexpected decoder event, expected {expected}")]
    UnexpectedEvent {
        /// The event the state machine was waiting for.
        expected: &'static str,
    },

    /// The file may be valid, but this handler does not support decoding it.
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// Image dimensions exceed the platform caps.
    #[error("Image ({width}x{height}) is too large")]
    TooLarge {
        /// Declared width in pixels.
        width: u32,
        /// Declared height in pixels.
        height: u32,
    },

    /// A frame index is out of bounds.
    #[error("Frame {index} out of bounds (total: {total})")]
    FrameOutOfBounds {
        /// The requested frame index.
        index: usize,
        /// The total number of frames.
        total: usize,
    },

    /// A metadata box exceeds the container length or the decompression cap.
    #[error("Metadata box of {size} bytes exceeds limit of {limit} bytes")]
    BoxTooLarge {
        /// Declared or accumulated box size in bytes.
        size: u64,
        /// The limit that was exceeded.
        limit: u64,
    },

    /// A buffer allocation failed.
    #[error("Memory cannot be allocated")]
    AllocFailure,

    /// The header could not be parsed.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

/// Errors that can occur while writing an image.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncodeError {
    /// The source image or encoder configuration is unusable.
    #[error("Encoder configuration error: {0}")]
    Config(String),

    /// Image dimensions exceed the platform caps.
    #[error("Image ({width}x{height}) is too large to save")]
    TooLarge {
        /// Source width in pixels.
        width: u32,
        /// Source height in pixels.
        height: u32,
    },

    /// The external encoder rejected a call.
    #[error("Encoder error: {0}")]
    Encoder(&'static str),

    /// A buffer allocation failed.
    #[error("Memory cannot be allocated")]
    AllocFailure,

    /// Writing the compressed stream to the device failed.
    #[error("Write error: {0}")]
    Io(#[from] std::io::Error),
}
