//! JPEG XL and PFM image handlers.
//!
//! Copyright (C) 2025 Imazen LLC
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published
//! by the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! For commercial licensing inquiries: support@imazen.io
//!
//! This crate plugs two codecs into a host image I/O framework: a
//! full-featured JPEG XL reader/writer (animation, HDR float formats, CMYK
//! with a black-ink extra channel, embedded Exif/XMP, orientation) built on
//! the `jpegxl-sys` bindings to libjxl, and a reader for PFM (Portable Float
//! Map) linear HDR images.
//!
//! # Reading
//!
//! Probe the stream, then drive a handler through the [`ImageHandler`]
//! trait:
//!
//! ```rust,no_run
//! use zenjxl::{probe, DetectedFormat, ImageHandler, JxlHandler};
//!
//! let data = std::fs::read("photo.jxl")?;
//! assert_ne!(probe(&data), DetectedFormat::Unknown);
//!
//! let mut handler = JxlHandler::new(data);
//! let frames = handler.image_count();
//! let image = handler.read()?;
//! println!("{}x{}, {} frame(s)", image.width(), image.height(), frames);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Handlers parse lazily: probing and option queries touch only as much of
//! the stream as they need, and animations decode one frame per `read` with
//! the cursor advanced by `jump_to_image` / `jump_to_next_image`.
//!
//! # Writing
//!
//! ```rust,no_run
//! use zenjxl::{Image, ImageHandler, ImageOption, JxlHandler, OptionValue, PixelFormat};
//!
//! let image = Image::alloc(640, 480, PixelFormat::Rgba8)?;
//! let mut handler = JxlHandler::for_writing();
//! handler.set_option(ImageOption::Quality, OptionValue::Int(100)); // lossless
//! let mut out = Vec::new();
//! handler.write(&image, &mut out)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Collaborators
//!
//! The JPEG XL bitstream itself is decoded and encoded by libjxl through
//! [`jpegxl-sys`]; this crate drives its event loop and owns its handles.
//! Color management beyond profile classification is likewise a host
//! concern: embedded ICC profiles are carried through verbatim, and CMYK
//! flattening falls back to a device conversion when no CMS is wired in.
//!
//! [`jpegxl-sys`]: https://docs.rs/jpegxl-sys

#![deny(missing_docs)]

pub mod color;
pub mod error;
pub mod exif;
pub mod handler;
pub mod image;
pub mod jxl;
pub mod pfm;
mod probe;

pub use color::{ColorModel, ColorSpace, Primaries, TransferFunction};
pub use error::{DecodeError, EncodeError};
pub use exif::MicroExif;
pub use handler::{ByteOrder, ImageHandler, ImageOption, OptionValue, Transformation};
pub use image::{
    Image, ImageError, PixelFormat, MAX_IMAGE_HEIGHT, MAX_IMAGE_PIXELS, MAX_IMAGE_WIDTH,
    META_KEY_XMP,
};
pub use jxl::{JxlHandler, JxlOptions};
pub use pfm::PfmHandler;
pub use probe::{probe, DetectedFormat};
