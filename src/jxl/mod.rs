//! The JPEG XL handler.
//!
//! Reading is a lazy, two-phase walk over the external decoder: the first
//! pass stops at basic info (`ensure_parsed`), the second extracts the color
//! encoding, counts animation frames, scans container boxes, and rewinds for
//! pixel decoding (`ensure_all_counted`). Each `read` then decodes exactly
//! one frame. Writing is single-shot and covered by [`encode`].

mod encode;
pub(crate) mod ffi;

use std::ffi::c_int;
use std::io::Write;

use log::warn;

use crate::color::{ColorModel, ColorSpace};
use crate::error::{DecodeError, EncodeError};
use crate::exif::{self, MicroExif};
use crate::handler::{ImageHandler, ImageOption, OptionValue, Transformation};
use crate::image::{
    Image, PixelFormat, MAX_IMAGE_HEIGHT, MAX_IMAGE_PIXELS, MAX_IMAGE_WIDTH, META_KEY_XMP,
};

use ffi::{
    is_true, jxl_bool, AnimationHeader, BasicInfo, DecStatus, ExtraChannelType, JxlColorSpace,
    JxlDataType, JxlEndianness, JxlOrientation, JxlPrimaries, JxlTransferFunction, JxlWhitePoint,
    PixelLayout, Signature,
};

const EVENTS_FIRST_PASS: c_int =
    DecStatus::BasicInfo as c_int | DecStatus::ColorEncoding as c_int | DecStatus::Frame as c_int;
const EVENTS_SIMPLE_REWIND: c_int =
    DecStatus::ColorEncoding as c_int | DecStatus::FullImage as c_int;
const EVENTS_FULL_IMAGE: c_int = DecStatus::FullImage as c_int;
const EVENTS_BOXES: c_int = DecStatus::Box as c_int | DecStatus::BoxComplete as c_int;

/// Growth increment while decompressing a metadata box.
const BOX_GROWTH: usize = 16 * 1024;
/// Hard cap for a decompressed metadata box.
const BOX_SIZE_LIMIT: u64 = 4 * 1024 * 1024;

/// Runtime knobs for the JPEG XL handler.
#[derive(Debug, Clone, Copy)]
pub struct JxlOptions {
    /// Keep the embedded orientation and let the host apply it downstream.
    /// When false, the decoder applies the transform itself.
    pub keep_orientation: bool,
    /// Decode HDR images to float formats instead of forcing 16-bit
    /// integers.
    pub preserve_hdr: bool,
    /// Scan container boxes for Exif and XMP metadata.
    pub decode_boxes: bool,
}

impl Default for JxlOptions {
    fn default() -> Self {
        JxlOptions {
            keep_orientation: true,
            preserve_hdr: true,
            decode_boxes: true,
        }
    }
}

impl JxlOptions {
    /// Sets the orientation policy.
    #[must_use]
    pub fn with_keep_orientation(mut self, keep: bool) -> Self {
        self.keep_orientation = keep;
        self
    }

    /// Enables or disables float output for HDR images.
    #[must_use]
    pub fn with_preserve_hdr(mut self, preserve: bool) -> Self {
        self.preserve_hdr = preserve;
        self
    }

    /// Enables or disables the container box scan.
    #[must_use]
    pub fn with_decode_boxes(mut self, decode: bool) -> Self {
        self.decode_boxes = decode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    NotParsed,
    BasicInfoParsed,
    Success,
    Finished,
    Error,
}

/// Validity of the cached frame. The cache serves a `read` only when it is
/// `Fresh` for the cursor's current index; a `Fresh` entry for any other
/// index is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameCache {
    Empty,
    Fresh(usize),
}

/// One JPEG XL input (or output) stream.
///
/// Handlers are created per stream over the fully materialized source bytes
/// and parse lazily on first use.
pub struct JxlHandler {
    data: Vec<u8>,
    options: JxlOptions,
    state: ParseState,
    // Runner before decoder: the pool is torn down first, matching the
    // library's teardown requirements.
    runner: Option<ffi::ThreadRunner>,
    decoder: Option<ffi::Decoder>,
    basic_info: Option<BasicInfo>,
    colorspace: Option<ColorSpace>,
    input_pixel_format: PixelLayout,
    input_format: PixelFormat,
    target_format: PixelFormat,
    is_cmyk: bool,
    cmyk_channel_id: u32,
    alpha_channel_id: u32,
    frame_delays: Vec<u32>,
    current_index: usize,
    cache: FrameCache,
    current_image: Option<Image>,
    next_image_delay: u32,
    exif: Vec<u8>,
    xmp: Vec<u8>,
    quality: i32,
    transformation: Transformation,
}

impl JxlHandler {
    /// Creates a handler over a complete JPEG XL stream.
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_options(data, JxlOptions::default())
    }

    /// Creates a handler with explicit options.
    pub fn with_options(data: Vec<u8>, options: JxlOptions) -> Self {
        JxlHandler {
            data,
            options,
            state: ParseState::NotParsed,
            runner: None,
            decoder: None,
            basic_info: None,
            colorspace: None,
            input_pixel_format: PixelLayout {
                num_channels: 4,
                data_type: JxlDataType::Uint8,
                endianness: JxlEndianness::Native,
                align: 0,
            },
            input_format: PixelFormat::Invalid,
            target_format: PixelFormat::Invalid,
            is_cmyk: false,
            cmyk_channel_id: 0,
            alpha_channel_id: 0,
            frame_delays: Vec::new(),
            current_index: 0,
            cache: FrameCache::Empty,
            current_image: None,
            next_image_delay: 0,
            exif: Vec::new(),
            xmp: Vec::new(),
            quality: 90,
            transformation: Transformation::None,
        }
    }

    /// Creates a write-only handler (no input stream).
    pub fn for_writing() -> Self {
        Self::new(Vec::new())
    }

    /// Whether the leading bytes carry a JPEG XL signature. Needs at least
    /// 12 bytes to decide.
    pub fn detect(data: &[u8]) -> bool {
        if data.len() < 12 {
            return false;
        }
        let head = &data[..data.len().min(32)];
        matches!(
            ffi::signature_check(head),
            Signature::Codestream | Signature::Container
        )
    }

    /// The handler options.
    pub fn options(&self) -> JxlOptions {
        self.options
    }

    // -- state machine ------------------------------------------------------

    fn fail<T>(&mut self, err: DecodeError) -> Result<T, DecodeError> {
        self.state = ParseState::Error;
        // The pool goes down before the decoder handle it serves.
        self.runner = None;
        self.decoder = None;
        Err(err)
    }

    fn dec(&mut self) -> Result<&mut ffi::Decoder, DecodeError> {
        self.decoder
            .as_mut()
            .ok_or(DecodeError::DecoderInit("decoder not initialized"))
    }

    fn info(&mut self) -> Result<BasicInfo, DecodeError> {
        match &self.basic_info {
            Some(info) => Ok(info.clone()),
            None => self.fail(DecodeError::DecoderInit("basic info not available")),
        }
    }

    fn ensure_parsed(&mut self) -> Result<(), DecodeError> {
        match self.state {
            ParseState::Success | ParseState::BasicInfoParsed | ParseState::Finished => Ok(()),
            ParseState::Error => Err(DecodeError::Decoder("handler is in the error state".into())),
            ParseState::NotParsed => self.ensure_decoder(),
        }
    }

    fn ensure_all_counted(&mut self) -> Result<(), DecodeError> {
        self.ensure_parsed()?;
        if matches!(self.state, ParseState::Success | ParseState::Finished) {
            return Ok(());
        }
        self.count_all_frames()
    }

    fn ensure_decoder(&mut self) -> Result<(), DecodeError> {
        if self.decoder.is_some() {
            return Ok(());
        }

        if self.data.is_empty() {
            return Err(DecodeError::DecoderInit("empty input"));
        }

        if !matches!(
            ffi::signature_check(&self.data),
            Signature::Codestream | Signature::Container
        ) {
            return self.fail(DecodeError::DecoderInit("stream is not JPEG XL"));
        }

        let mut decoder = match ffi::Decoder::new() {
            Ok(decoder) => decoder,
            Err(e) => return self.fail(e),
        };

        if self.options.keep_orientation {
            // The host applies the transform downstream.
            decoder.set_keep_orientation(true);
        }

        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if cores >= 4 {
            // Half the cores: the handler usually shares the host with other
            // decode work.
            let workers = (cores / 2).clamp(2, 64);
            if let Some(runner) = ffi::ThreadRunner::new(workers) {
                if !decoder.set_parallel_runner(&runner) {
                    return self.fail(DecodeError::DecoderInit(
                        "attaching the parallel runner failed",
                    ));
                }
                self.runner = Some(runner);
            }
        }

        // Safety: the handler owns `data` for the decoder's whole lifetime.
        if !unsafe { decoder.set_input(&self.data) } {
            return self.fail(DecodeError::DecoderInit("feeding input failed"));
        }
        decoder.close_input();

        if !decoder.subscribe_events(EVENTS_FIRST_PASS) {
            return self.fail(DecodeError::DecoderInit("event subscription rejected"));
        }

        match decoder.process() {
            DecStatus::BasicInfo => {}
            DecStatus::Error => return self.fail(DecodeError::DecoderInit("decoding failed")),
            DecStatus::NeedMoreInput => return self.fail(DecodeError::Truncated),
            _ => {
                return self.fail(DecodeError::UnexpectedEvent {
                    expected: "basic info",
                })
            }
        }

        let info = match decoder.basic_info() {
            Some(info) => info,
            None => return self.fail(DecodeError::DecoderInit("basic info not available")),
        };

        if info.xsize == 0 || info.ysize == 0 {
            return self.fail(DecodeError::DecoderInit("image has zero dimensions"));
        }
        if info.xsize > MAX_IMAGE_WIDTH
            || info.ysize > MAX_IMAGE_HEIGHT
            || u64::from(info.xsize) * u64::from(info.ysize) > MAX_IMAGE_PIXELS
        {
            return self.fail(DecodeError::TooLarge {
                width: info.xsize,
                height: info.ysize,
            });
        }

        self.decoder = Some(decoder);
        self.basic_info = Some(info);
        self.state = ParseState::BasicInfoParsed;
        Ok(())
    }

    fn count_all_frames(&mut self) -> Result<(), DecodeError> {
        if self.state != ParseState::BasicInfoParsed {
            return Err(DecodeError::Decoder("frame counting out of order".into()));
        }

        let info = self.info()?;
        match self.dec()?.process() {
            DecStatus::ColorEncoding => {}
            other => return self.fail(unexpected("color encoding", other)),
        }

        let is_gray = info.num_color_channels == 1 && info.alpha_bits == 0;
        let uses_original = is_true(info.uses_original_profile);
        let animated = is_true(info.have_animation);

        if !uses_original && !animated {
            // Present simple images in the host's default space without a
            // round-trip through ICC.
            self.install_default_cms();
            let srgb = ffi::color_encoding_srgb(is_gray);
            let _ = self.dec()?.set_preferred_color_profile(&srgb);
        }

        let plan = plan_decode_format(
            info.bits_per_sample,
            info.exponent_bits_per_sample,
            info.num_color_channels,
            info.alpha_bits,
            self.options.preserve_hdr,
        );
        self.input_pixel_format = PixelLayout {
            num_channels: plan.num_channels,
            data_type: plan.data_type,
            endianness: JxlEndianness::Native,
            align: 4,
        };
        self.input_format = plan.input;
        self.target_format = plan.target;

        self.colorspace = self.extract_colorspace()?;

        self.frame_delays.clear();
        let mut have_animation = animated;
        if animated {
            loop {
                match self.dec()?.process() {
                    DecStatus::Success => break,
                    DecStatus::Frame => {
                        let header = match self.dec()?.frame_header() {
                            Some(header) => header,
                            None => {
                                return self
                                    .fail(DecodeError::Decoder("reading a frame header failed".into()))
                            }
                        };
                        self.frame_delays.push(frame_delay_ms(
                            header.duration,
                            &info.animation,
                        ));
                        if is_true(header.is_last) {
                            break;
                        }
                    }
                    other => return self.fail(unexpected("frame", other)),
                }
            }

            if self.frame_delays.is_empty() {
                return self.fail(DecodeError::Decoder("no frames in animation".into()));
            }
            if self.frame_delays.len() == 1 {
                warn!("JXL file was marked as animation but it has only one frame");
                have_animation = false;
            }
        } else {
            self.frame_delays = vec![0];
        }
        if let Some(basic_info) = &mut self.basic_info {
            basic_info.have_animation = jxl_bool(have_animation);
        }

        self.detect_cmyk(&info, uses_original)?;

        if self.options.decode_boxes {
            self.decode_container()?;
        }

        self.rewind_decoder()?;

        self.next_image_delay = self.frame_delays[0];
        self.state = ParseState::Success;
        Ok(())
    }

    fn install_default_cms(&mut self) {
        match ffi::default_cms() {
            Some(cms) => {
                let installed = self.decoder.as_mut().map(|d| d.set_cms(cms));
                if installed != Some(true) {
                    warn!("Installing the default CMS failed");
                }
            }
            None => warn!("No JPEG XL CMS interface"),
        }
    }

    /// Structured sRGB when the target profile matches it exactly, the ICC
    /// blob otherwise.
    fn extract_colorspace(&mut self) -> Result<Option<ColorSpace>, DecodeError> {
        if let Some(encoding) = self.dec()?.color_as_encoded_profile() {
            let is_srgb = matches!(encoding.color_space, JxlColorSpace::Rgb)
                && matches!(encoding.white_point, JxlWhitePoint::D65)
                && matches!(encoding.primaries, JxlPrimaries::SRgb)
                && matches!(encoding.transfer_function, JxlTransferFunction::SRGB);
            if is_srgb {
                return Ok(Some(ColorSpace::srgb()));
            }
        }

        match self.dec()?.icc_profile() {
            Some(icc) => {
                let colorspace = ColorSpace::from_icc(&icc);
                if colorspace.is_none() {
                    warn!("JXL image has an unsupported or invalid ICC profile");
                }
                Ok(colorspace)
            }
            None => {
                warn!("No ICC, other color profile");
                Ok(None)
            }
        }
    }

    fn detect_cmyk(&mut self, info: &BasicInfo, uses_original: bool) -> Result<(), DecodeError> {
        let cmyk_space = self
            .colorspace
            .as_ref()
            .is_some_and(|cs| cs.model() == ColorModel::Cmyk);
        if !uses_original || info.num_color_channels != 3 || self.colorspace.is_none() {
            return Ok(());
        }

        let mut alpha_found = false;
        for index in 0..info.num_extra_channels {
            let channel = match self.dec()?.extra_channel_info(index as usize) {
                Some(channel) => channel,
                None => {
                    return self.fail(DecodeError::Decoder(format!(
                        "reading extra channel {index} failed"
                    )))
                }
            };

            match channel.r#type {
                ExtraChannelType::Black => {
                    if cmyk_space {
                        self.is_cmyk = true;
                        self.cmyk_channel_id = index;

                        if info.alpha_bits > 0 && !alpha_found {
                            for alpha_index in index + 1..info.num_extra_channels {
                                let channel =
                                    match self.dec()?.extra_channel_info(alpha_index as usize) {
                                        Some(channel) => channel,
                                        None => {
                                            return self.fail(DecodeError::Decoder(format!(
                                                "reading extra channel {alpha_index} failed"
                                            )))
                                        }
                                    };
                                if matches!(channel.r#type, ExtraChannelType::Alpha) {
                                    alpha_found = true;
                                    self.alpha_channel_id = alpha_index;
                                    break;
                                }
                            }
                            if !alpha_found {
                                return self.fail(DecodeError::Decoder(
                                    "alpha channel declared but not found".into(),
                                ));
                            }
                        }
                    } else {
                        warn!("JXL has a BLACK channel but the colorspace is not CMYK");
                    }
                    break;
                }
                ExtraChannelType::Alpha if !alpha_found => {
                    alpha_found = true;
                    self.alpha_channel_id = index;
                }
                _ => {}
            }
        }

        if !self.is_cmyk && cmyk_space {
            warn!("JXL has a CMYK colorspace but no BLACK channel was found");
        }
        Ok(())
    }

    // -- container boxes ----------------------------------------------------

    fn decode_container(&mut self) -> Result<(), DecodeError> {
        let info = self.info()?;
        if !is_true(info.have_container) {
            return Ok(());
        }

        let container_len = self.data.len();
        if container_len == 0 {
            return self.fail(DecodeError::Decoder("no input".into()));
        }
        if ffi::signature_check(&self.data) != Signature::Container {
            return Ok(());
        }

        {
            let dec = self.dec()?;
            dec.release_input();
            dec.rewind();
        }
        let fed = match self.decoder.as_mut() {
            // Safety: the handler owns `data` for the decoder's whole lifetime.
            Some(dec) => unsafe { dec.set_input(&self.data) },
            None => false,
        };
        if !fed {
            return self.fail(DecodeError::DecoderInit("feeding input failed"));
        }
        self.dec()?.close_input();

        if !self.dec()?.set_decompress_boxes(true) {
            warn!("Enabling box decompression failed");
        }
        if !self.dec()?.subscribe_events(EVENTS_BOXES) {
            return self.fail(DecodeError::DecoderInit("event subscription rejected"));
        }

        let mut search_exif = true;
        let mut search_xmp = true;
        let mut exif_box = Vec::new();
        let mut xmp_box = Vec::new();

        while search_exif || search_xmp {
            match self.dec()?.process() {
                DecStatus::Success => {
                    search_exif = false;
                    search_xmp = false;
                }
                DecStatus::Box => {
                    let tag = match self.dec()?.box_type(true) {
                        Some(tag) => tag,
                        None => {
                            return self
                                .fail(DecodeError::Decoder("reading the box type failed".into()))
                        }
                    };
                    if &tag == b"Exif" && search_exif {
                        search_exif = false;
                        exif_box = self.extract_box(container_len)?;
                    } else if &tag == b"xml " && search_xmp {
                        search_xmp = false;
                        xmp_box = self.extract_box(container_len)?;
                    }
                }
                DecStatus::Error => {
                    return self.fail(DecodeError::Decoder("metadata decoding failed".into()))
                }
                DecStatus::NeedMoreInput => return self.fail(DecodeError::Truncated),
                other => return self.fail(unexpected("box", other)),
            }
        }

        if !xmp_box.is_empty() {
            self.xmp = xmp_box;
        }
        if exif_box.len() > 4 {
            match exif::locate_tiff_header(&exif_box) {
                Some(offset) => self.exif = exif_box[offset..].to_vec(),
                None => warn!("Exif box in JXL file doesn't have a TIFF header"),
            }
        }
        Ok(())
    }

    /// Reads the current box into a growing buffer.
    fn extract_box(&mut self, container_len: usize) -> Result<Vec<u8>, DecodeError> {
        let raw_size = match self.dec()?.box_size_raw() {
            Some(size) => size,
            None => return self.fail(DecodeError::Decoder("querying the box size failed".into())),
        };
        if raw_size > container_len as u64 {
            return self.fail(DecodeError::BoxTooLarge {
                size: raw_size,
                limit: container_len as u64,
            });
        }

        let mut output = match try_vec(raw_size as usize) {
            Ok(output) => output,
            Err(e) => return self.fail(e),
        };
        // Safety: `output` is released before every resize and outlives the
        // window.
        if !unsafe { self.dec()?.set_box_buffer(&mut output) } {
            return self.fail(DecodeError::Decoder("registering the box buffer failed".into()));
        }

        loop {
            match self.dec()?.process() {
                DecStatus::BoxNeedMoreOutput => {
                    let remaining = self.dec()?.release_box_buffer();
                    if output.len() as u64 > BOX_SIZE_LIMIT {
                        return self.fail(DecodeError::BoxTooLarge {
                            size: output.len() as u64,
                            limit: BOX_SIZE_LIMIT,
                        });
                    }
                    let old_len = output.len();
                    output.resize(old_len + BOX_GROWTH, 0);
                    let window = old_len - remaining;
                    // Safety: see above.
                    if !unsafe { self.dec()?.set_box_buffer(&mut output[window..]) } {
                        return self.fail(DecodeError::Decoder(
                            "registering the box buffer failed".into(),
                        ));
                    }
                }
                DecStatus::BoxComplete => break,
                other => return self.fail(unexpected("box complete", other)),
            }
        }

        let unused = self.dec()?.release_box_buffer();
        output.truncate(output.len() - unused);
        Ok(output)
    }

    // -- pixel decoding -----------------------------------------------------

    fn rewind_decoder(&mut self) -> Result<(), DecodeError> {
        self.current_index = 0;

        {
            let dec = self.dec()?;
            dec.release_input();
            dec.rewind();
        }

        if self.runner.is_some() {
            let attached = match (self.decoder.as_mut(), self.runner.as_ref()) {
                (Some(dec), Some(runner)) => dec.set_parallel_runner(runner),
                _ => false,
            };
            if !attached {
                return self.fail(DecodeError::DecoderInit(
                    "attaching the parallel runner failed",
                ));
            }
        }

        let fed = match self.decoder.as_mut() {
            // Safety: the handler owns `data` for the decoder's whole lifetime.
            Some(dec) => unsafe { dec.set_input(&self.data) },
            None => false,
        };
        if !fed {
            return self.fail(DecodeError::DecoderInit("feeding input failed"));
        }
        self.dec()?.close_input();

        let info = self.info()?;
        if !is_true(info.uses_original_profile) && !is_true(info.have_animation) {
            if !self.dec()?.subscribe_events(EVENTS_SIMPLE_REWIND) {
                return self.fail(DecodeError::DecoderInit("event subscription rejected"));
            }
            match self.dec()?.process() {
                DecStatus::ColorEncoding => {}
                other => return self.fail(unexpected("color encoding", other)),
            }
            self.install_default_cms();
            let is_gray = info.num_color_channels == 1 && info.alpha_bits == 0;
            let srgb = ffi::color_encoding_srgb(is_gray);
            let _ = self.dec()?.set_preferred_color_profile(&srgb);
        } else if !self.dec()?.subscribe_events(EVENTS_FULL_IMAGE) {
            return self.fail(DecodeError::DecoderInit("event subscription rejected"));
        }

        Ok(())
    }

    fn decode_one_frame(&mut self) -> Result<(), DecodeError> {
        match self.dec()?.process() {
            DecStatus::NeedImageOutBuffer => {}
            other => return self.fail(unexpected("image out buffer request", other)),
        }

        let info = self.info()?;
        let mut image = if self.is_cmyk {
            self.decode_cmyk_frame(&info)?
        } else {
            self.decode_plain_frame(&info)?
        };

        if !self.xmp.is_empty() {
            image.set_text(META_KEY_XMP, &String::from_utf8_lossy(&self.xmp));
        }
        if !self.exif.is_empty() {
            if let Some(parsed) = MicroExif::from_bytes(&self.exif) {
                parsed.apply_resolution(&mut image);
                parsed.apply_metadata(&mut image);
            }
        }

        self.next_image_delay = self.frame_delays.get(self.current_index).copied().unwrap_or(0);
        self.cache = FrameCache::Fresh(self.current_index);
        self.current_image = Some(image);

        if self.frame_delays.len() > 1 {
            self.current_index += 1;
            if self.current_index >= self.frame_delays.len() {
                // All frames in the animation have been read.
                self.rewind_decoder()?;
                self.state = ParseState::Finished;
            } else {
                self.state = ParseState::Success;
            }
        } else {
            // The static image has been read.
            self.state = ParseState::Finished;
        }
        Ok(())
    }

    fn decode_plain_frame(&mut self, info: &BasicInfo) -> Result<Image, DecodeError> {
        let mut image = match Image::alloc(info.xsize, info.ysize, self.input_format) {
            Ok(image) => image,
            Err(e) => return self.fail(e.into()),
        };
        image.set_colorspace(self.colorspace.clone());

        let mut format = self.input_pixel_format;
        format.align = image.bytes_per_line();
        self.input_pixel_format = format;

        let sample_bytes = match format.data_type {
            JxlDataType::Float => 4usize,
            JxlDataType::Uint8 => 1,
            JxlDataType::Uint16 | JxlDataType::Float16 => 2,
            _ => {
                return self.fail(DecodeError::Unsupported("unsupported data type".into()));
            }
        };
        let last_row = sample_bytes * format.num_channels as usize * info.xsize as usize;
        let buffer_size = (info.ysize as usize - 1) * image.bytes_per_line() + last_row;

        let registered = {
            let buffer = &mut image.data_mut()[..buffer_size];
            match self.decoder.as_mut() {
                // Safety: `image` outlives the decode of this frame.
                Some(dec) => unsafe { dec.set_image_out_buffer(&format, buffer) },
                None => false,
            }
        };
        if !registered {
            return self.fail(DecodeError::Decoder(
                "registering the image out buffer failed".into(),
            ));
        }

        match self.dec()?.process() {
            DecStatus::FullImage => {}
            other => return self.fail(unexpected("full image", other)),
        }

        if self.target_format != self.input_format {
            image = match image.convert_to(self.target_format) {
                Ok(image) => image,
                Err(e) => return self.fail(e.into()),
            };
        }
        Ok(image)
    }

    fn decode_cmyk_frame(&mut self, info: &BasicInfo) -> Result<Image, DecodeError> {
        let extra_len = info.xsize as usize * info.ysize as usize;
        let cmy_len = extra_len * 3;
        let has_alpha = info.alpha_bits > 0;
        let cmyk_id = self.cmyk_channel_id;
        let alpha_id = self.alpha_channel_id;

        let format = PixelLayout {
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
        self.input_pixel_format = format;

        let mut pixels_cmy = match try_vec(cmy_len) {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(e),
        };
        let mut pixels_black = match try_vec(extra_len) {
            Ok(buffer) => buffer,
            Err(e) => return self.fail(e),
        };
        let mut pixels_alpha = if has_alpha {
            match try_vec(extra_len) {
                Ok(buffer) => Some(buffer),
                Err(e) => return self.fail(e),
            }
        } else {
            None
        };

        let registered = {
            match self.decoder.as_mut() {
                Some(dec) => {
                    // Safety: the plane buffers outlive the decode of this
                    // frame.
                    let mut ok = unsafe { dec.set_image_out_buffer(&format, &mut pixels_cmy) };
                    ok = ok
                        && unsafe {
                            dec.set_extra_channel_buffer(&format_extra, &mut pixels_black, cmyk_id)
                        };
                    if let Some(alpha) = &mut pixels_alpha {
                        ok = ok
                            && unsafe {
                                dec.set_extra_channel_buffer(&format_extra, alpha, alpha_id)
                            };
                    }
                    ok
                }
                None => false,
            }
        };
        if !registered {
            return self.fail(DecodeError::Decoder(
                "registering the CMYK out buffers failed".into(),
            ));
        }

        match self.dec()?.process() {
            DecStatus::FullImage => {}
            other => return self.fail(unexpected("full image", other)),
        }

        let mut cmyk_image = match Image::alloc(info.xsize, info.ysize, PixelFormat::Cmyk8) {
            Ok(image) => image,
            Err(e) => return self.fail(e.into()),
        };
        cmyk_image.set_colorspace(self.colorspace.clone());

        // The library delivers inverted ink (zero means no ink); restore the
        // conventional encoding while interleaving K.
        for y in 0..info.ysize {
            let row_start = y as usize * info.xsize as usize;
            let cmy_row = &pixels_cmy[row_start * 3..(row_start + info.xsize as usize) * 3];
            let k_row = &pixels_black[row_start..row_start + info.xsize as usize];
            let out_row = cmyk_image.row_mut(y);
            for x in 0..info.xsize as usize {
                out_row[x * 4] = 255 - cmy_row[x * 3];
                out_row[x * 4 + 1] = 255 - cmy_row[x * 3 + 1];
                out_row[x * 4 + 2] = 255 - cmy_row[x * 3 + 2];
                out_row[x * 4 + 3] = 255 - k_row[x];
            }
        }

        if let Some(pixels_alpha) = pixels_alpha {
            // CMYK + alpha is presented as RGBA in the host's default space.
            let mut rgba = match cmyk_image.convert_to(PixelFormat::Rgba8) {
                Ok(image) => image,
                Err(e) => return self.fail(e.into()),
            };
            rgba.set_colorspace(Some(ColorSpace::srgb()));
            for y in 0..info.ysize {
                let alpha_row =
                    &pixels_alpha[y as usize * info.xsize as usize..][..info.xsize as usize];
                let out_row = rgba.row_mut(y);
                for x in 0..info.xsize as usize {
                    out_row[x * 4 + 3] = alpha_row[x];
                }
            }
            Ok(rgba)
        } else {
            Ok(cmyk_image)
        }
    }
}

impl ImageHandler for JxlHandler {
    fn can_read(&self) -> bool {
        match self.state {
            ParseState::NotParsed => Self::detect(&self.data),
            ParseState::Error | ParseState::Finished => false,
            _ => true,
        }
    }

    fn read(&mut self) -> Result<Image, DecodeError> {
        self.ensure_all_counted()?;

        if self.cache == FrameCache::Fresh(self.current_index) {
            let image = self
                .current_image
                .clone()
                .ok_or_else(|| DecodeError::Decoder("frame cache is empty".into()))?;
            self.jump_to_next_image()?;
            return Ok(image);
        }

        self.decode_one_frame()?;
        self.current_image
            .clone()
            .ok_or_else(|| DecodeError::Decoder("no frame decoded".into()))
    }

    fn write(&mut self, image: &Image, device: &mut dyn Write) -> Result<(), EncodeError> {
        self.write_image(image, device)
    }

    fn supports_option(&self, option: ImageOption) -> bool {
        match option {
            ImageOption::Quality | ImageOption::Size | ImageOption::Animation => true,
            ImageOption::ImageTransformation => self.options.keep_orientation,
            _ => false,
        }
    }

    fn option(&mut self, option: ImageOption) -> Option<OptionValue> {
        if !self.supports_option(option) {
            return None;
        }

        if option == ImageOption::Quality {
            return Some(OptionValue::Int(self.quality));
        }

        if self.ensure_parsed().is_err() {
            if option == ImageOption::ImageTransformation {
                return Some(OptionValue::Int(self.transformation.index()));
            }
            return None;
        }

        let info = self.basic_info.as_ref()?;
        match option {
            ImageOption::Size => Some(OptionValue::Size {
                width: info.xsize,
                height: info.ysize,
            }),
            ImageOption::Animation => Some(OptionValue::Bool(is_true(info.have_animation))),
            ImageOption::ImageTransformation => Some(OptionValue::Int(
                orientation_to_transformation(info.orientation).index(),
            )),
            _ => None,
        }
    }

    fn set_option(&mut self, option: ImageOption, value: OptionValue) {
        match option {
            ImageOption::Quality => {
                if let Some(quality) = value.as_int() {
                    self.quality = if quality > 100 {
                        100
                    } else if quality < 0 {
                        90
                    } else {
                        quality
                    };
                }
            }
            ImageOption::ImageTransformation if self.options.keep_orientation => {
                if let Some(t) = value.as_int().and_then(Transformation::from_index) {
                    self.transformation = t;
                }
            }
            _ => {}
        }
    }

    fn image_count(&mut self) -> usize {
        if self.ensure_parsed().is_err() {
            return 0;
        }

        if self.state == ParseState::BasicInfoParsed {
            let animated = self
                .basic_info
                .as_ref()
                .is_some_and(|info| is_true(info.have_animation));
            if !animated {
                return 1;
            }
            if self.ensure_all_counted().is_err() {
                return 0;
            }
        }

        self.frame_delays.len()
    }

    fn loop_count(&mut self) -> i32 {
        if self.ensure_parsed().is_err() {
            return 0;
        }
        match &self.basic_info {
            Some(info) if is_true(info.have_animation) => {
                if info.animation.num_loops > 0 {
                    info.animation.num_loops as i32 - 1
                } else {
                    -1
                }
            }
            _ => 0,
        }
    }

    fn current_image_number(&self) -> i32 {
        match self.state {
            ParseState::NotParsed => -1,
            ParseState::Error | ParseState::BasicInfoParsed => 0,
            _ if self.decoder.is_none() => 0,
            _ => self.current_index as i32,
        }
    }

    fn jump_to_image(&mut self, index: usize) -> Result<(), DecodeError> {
        self.ensure_all_counted()?;

        if index >= self.frame_delays.len() {
            return Err(DecodeError::FrameOutOfBounds {
                index,
                total: self.frame_delays.len(),
            });
        }

        if index == self.current_index {
            self.state = ParseState::Success;
            return Ok(());
        }

        if index > self.current_index {
            let skip = index - self.current_index;
            self.dec()?.skip_frames(skip);
            self.current_index = index;
            self.state = ParseState::Success;
            return Ok(());
        }

        self.rewind_decoder()?;
        if index > 0 {
            self.dec()?.skip_frames(index);
        }
        self.current_index = index;
        self.state = ParseState::Success;
        Ok(())
    }

    fn jump_to_next_image(&mut self) -> Result<(), DecodeError> {
        self.ensure_all_counted()?;

        if self.frame_delays.len() > 1 {
            self.current_index += 1;
            if self.current_index >= self.frame_delays.len() {
                self.rewind_decoder()?;
            } else {
                self.dec()?.skip_frames(1);
            }
        }

        self.state = ParseState::Success;
        Ok(())
    }

    fn next_image_delay(&mut self) -> u32 {
        if self.ensure_all_counted().is_err() {
            return 0;
        }
        if self.frame_delays.len() < 2 {
            return 0;
        }
        self.next_image_delay
    }
}

fn unexpected(expected: &'static str, status: DecStatus) -> DecodeError {
    match status {
        DecStatus::Error => DecodeError::Decoder("decoding failed".into()),
        DecStatus::NeedMoreInput => DecodeError::Truncated,
        _ => DecodeError::UnexpectedEvent { expected },
    }
}

fn try_vec(len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| DecodeError::AllocFailure)?;
    buffer.resize(len, 0);
    Ok(buffer)
}

/// The decode-side pixel plan for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FormatPlan {
    data_type: JxlDataType,
    num_channels: u32,
    input: PixelFormat,
    target: PixelFormat,
}

/// Maps stream depth and channel layout to the decode buffer layout and the
/// final presentation format.
fn plan_decode_format(
    bits_per_sample: u32,
    exponent_bits: u32,
    num_color_channels: u32,
    alpha_bits: u32,
    preserve_hdr: bool,
) -> FormatPlan {
    let is_gray = num_color_channels == 1 && alpha_bits == 0;
    let load_alpha = alpha_bits > 0;

    if bits_per_sample > 8 {
        let is_fp = preserve_hdr && exponent_bits > 0 && num_color_channels == 3;

        if is_gray {
            FormatPlan {
                data_type: JxlDataType::Uint16,
                num_channels: 1,
                input: PixelFormat::Gray16,
                target: PixelFormat::Gray16,
            }
        } else if bits_per_sample > 16 && is_fp {
            FormatPlan {
                data_type: JxlDataType::Float,
                num_channels: 4,
                input: PixelFormat::Rgba32F,
                target: if load_alpha {
                    PixelFormat::Rgba32F
                } else {
                    PixelFormat::Rgbx32F
                },
            }
        } else if is_fp {
            FormatPlan {
                data_type: JxlDataType::Float16,
                num_channels: 4,
                input: PixelFormat::Rgba16F,
                target: if load_alpha {
                    PixelFormat::Rgba16F
                } else {
                    PixelFormat::Rgbx16F
                },
            }
        } else {
            FormatPlan {
                data_type: JxlDataType::Uint16,
                num_channels: 4,
                input: PixelFormat::Rgba16,
                target: if load_alpha {
                    PixelFormat::Rgba16
                } else {
                    PixelFormat::Rgbx16
                },
            }
        }
    } else if is_gray {
        FormatPlan {
            data_type: JxlDataType::Uint8,
            num_channels: 1,
            input: PixelFormat::Gray8,
            target: PixelFormat::Gray8,
        }
    } else if load_alpha {
        FormatPlan {
            data_type: JxlDataType::Uint8,
            num_channels: 4,
            input: PixelFormat::Rgba8,
            target: PixelFormat::Rgba8,
        }
    } else {
        FormatPlan {
            data_type: JxlDataType::Uint8,
            num_channels: 3,
            input: PixelFormat::Rgb8,
            target: PixelFormat::Rgbx8,
        }
    }
}

/// Delay of one frame in milliseconds from its duration and the stream time
/// base.
fn frame_delay_ms(duration: u32, animation: &AnimationHeader) -> u32 {
    if animation.tps_numerator > 0 && animation.tps_denominator > 0 {
        (0.5 + 1000.0 * duration as f64 * animation.tps_denominator as f64
            / animation.tps_numerator as f64) as u32
    } else {
        0
    }
}

pub(crate) fn transformation_to_orientation(t: Transformation) -> JxlOrientation {
    match t {
        Transformation::None => JxlOrientation::Identity,
        Transformation::Mirror => JxlOrientation::FlipHorizontal,
        Transformation::Rotate180 => JxlOrientation::Rotate180,
        Transformation::Flip => JxlOrientation::FlipVertical,
        Transformation::FlipAndRotate90 => JxlOrientation::Transpose,
        Transformation::Rotate90 => JxlOrientation::Rotate90Cw,
        Transformation::MirrorAndRotate90 => JxlOrientation::AntiTranspose,
        Transformation::Rotate270 => JxlOrientation::Rotate90Ccw,
    }
}

pub(crate) fn orientation_to_transformation(o: JxlOrientation) -> Transformation {
    match o {
        JxlOrientation::Identity => Transformation::None,
        JxlOrientation::FlipHorizontal => Transformation::Mirror,
        JxlOrientation::Rotate180 => Transformation::Rotate180,
        JxlOrientation::FlipVertical => Transformation::Flip,
        JxlOrientation::Transpose => Transformation::FlipAndRotate90,
        JxlOrientation::Rotate90Cw => Transformation::Rotate90,
        JxlOrientation::AntiTranspose => Transformation::MirrorAndRotate90,
        JxlOrientation::Rotate90Ccw => Transformation::Rotate270,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animation(num: u32, den: u32) -> AnimationHeader {
        AnimationHeader {
            tps_numerator: num,
            tps_denominator: den,
            num_loops: 0,
            have_timecodes: jxl_bool(false),
        }
    }

    #[test]
    fn plan_gray_depths() {
        let plan = plan_decode_format(8, 0, 1, 0, true);
        assert_eq!(plan.input, PixelFormat::Gray8);
        assert_eq!(plan.num_channels, 1);

        let plan = plan_decode_format(16, 0, 1, 0, true);
        assert_eq!(plan.input, PixelFormat::Gray16);
        assert_eq!(plan.data_type, JxlDataType::Uint16);
    }

    #[test]
    fn plan_8bit_color() {
        let plan = plan_decode_format(8, 0, 3, 8, true);
        assert_eq!(plan.input, PixelFormat::Rgba8);
        assert_eq!(plan.target, PixelFormat::Rgba8);
        assert_eq!(plan.num_channels, 4);

        let plan = plan_decode_format(8, 0, 3, 0, true);
        assert_eq!(plan.input, PixelFormat::Rgb8);
        assert_eq!(plan.target, PixelFormat::Rgbx8);
        assert_eq!(plan.num_channels, 3);
    }

    #[test]
    fn plan_high_depth_integer() {
        let plan = plan_decode_format(16, 0, 3, 16, true);
        assert_eq!(plan.input, PixelFormat::Rgba16);
        assert_eq!(plan.target, PixelFormat::Rgba16);

        let plan = plan_decode_format(12, 0, 3, 0, true);
        assert_eq!(plan.input, PixelFormat::Rgba16);
        assert_eq!(plan.target, PixelFormat::Rgbx16);
    }

    #[test]
    fn plan_float_branches() {
        let plan = plan_decode_format(16, 5, 3, 0, true);
        assert_eq!(plan.input, PixelFormat::Rgba16F);
        assert_eq!(plan.target, PixelFormat::Rgbx16F);
        assert_eq!(plan.data_type, JxlDataType::Float16);

        let plan = plan_decode_format(32, 8, 3, 32, true);
        assert_eq!(plan.input, PixelFormat::Rgba32F);
        assert_eq!(plan.target, PixelFormat::Rgba32F);
        assert_eq!(plan.data_type, JxlDataType::Float);
    }

    #[test]
    fn plan_hdr_disabled_forces_integer() {
        let plan = plan_decode_format(32, 8, 3, 0, false);
        assert_eq!(plan.input, PixelFormat::Rgba16);
        assert_eq!(plan.data_type, JxlDataType::Uint16);
    }

    #[test]
    fn plan_gray_with_alpha_is_color() {
        // Gray plus alpha goes through the color path.
        let plan = plan_decode_format(8, 0, 1, 8, true);
        assert_eq!(plan.input, PixelFormat::Rgba8);
    }

    #[test]
    fn delay_rounds_to_milliseconds() {
        assert_eq!(frame_delay_ms(100, &animation(1000, 1)), 100);
        assert_eq!(frame_delay_ms(1, &animation(10, 1)), 100);
        assert_eq!(frame_delay_ms(1, &animation(3, 1)), 333);
        assert_eq!(frame_delay_ms(7, &animation(0, 1)), 0);
        assert_eq!(frame_delay_ms(7, &animation(10, 0)), 0);
    }

    #[test]
    fn orientation_mapping_round_trips() {
        for i in 0..8 {
            let t = Transformation::from_index(i).unwrap();
            assert_eq!(orientation_to_transformation(transformation_to_orientation(t)), t);
        }
    }

    #[test]
    fn quality_clamping() {
        let mut handler = JxlHandler::for_writing();
        handler.set_option(ImageOption::Quality, OptionValue::Int(150));
        assert_eq!(
            handler.option(ImageOption::Quality),
            Some(OptionValue::Int(100))
        );
        handler.set_option(ImageOption::Quality, OptionValue::Int(-3));
        assert_eq!(
            handler.option(ImageOption::Quality),
            Some(OptionValue::Int(90))
        );
        handler.set_option(ImageOption::Quality, OptionValue::Int(55));
        assert_eq!(
            handler.option(ImageOption::Quality),
            Some(OptionValue::Int(55))
        );
    }

    #[test]
    fn short_input_is_not_detected() {
        assert!(!JxlHandler::detect(&[]));
        assert!(!JxlHandler::detect(&[0xFF, 0x0A]));
        // Only 8 of the 12 container signature bytes.
        assert!(!JxlHandler::detect(&[0, 0, 0, 0x0C, b'J', b'X', b'L', b' ']));
    }
}
