//! Owned wrappers around the libjxl handles.
//!
//! [`Decoder`], [`Encoder`], and [`ThreadRunner`] each own one raw handle
//! from `jpegxl-sys` and release it on drop, so every error path in the
//! handlers frees external resources by simply dropping the value. Methods
//! that hand the library a long-lived pointer (input, output buffers) are
//! `unsafe fn`s whose contract is that the backing storage outlives the
//! borrow the library keeps.

use std::ffi::{c_char, c_int, c_void};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

use jpegxl_sys::color::cms::JxlGetDefaultCms;
use jpegxl_sys::color::cms_interface::JxlCmsInterface;
use jpegxl_sys::color::color_encoding::JxlColorEncoding;
use jpegxl_sys::common::types::{JxlBool, JxlBoxType, JxlPixelFormat};
use jpegxl_sys::decode::{
    JxlColorProfileTarget, JxlDecoder, JxlDecoderCloseInput, JxlDecoderCreate, JxlDecoderDestroy,
    JxlDecoderGetBasicInfo, JxlDecoderGetBoxSizeRaw, JxlDecoderGetBoxType,
    JxlDecoderGetColorAsEncodedProfile, JxlDecoderGetColorAsICCProfile,
    JxlDecoderGetExtraChannelInfo, JxlDecoderGetFrameHeader, JxlDecoderGetICCProfileSize,
    JxlDecoderProcessInput, JxlDecoderReleaseBoxBuffer, JxlDecoderReleaseInput, JxlDecoderRewind,
    JxlDecoderSetBoxBuffer, JxlDecoderSetCms, JxlDecoderSetDecompressBoxes,
    JxlDecoderSetExtraChannelBuffer, JxlDecoderSetImageOutBuffer, JxlDecoderSetInput,
    JxlDecoderSetKeepOrientation, JxlDecoderSetParallelRunner, JxlDecoderSetPreferredColorProfile,
    JxlDecoderSkipFrames, JxlDecoderStatus, JxlDecoderSubscribeEvents, JxlSignature,
    JxlSignatureCheck,
};
use jpegxl_sys::encoder::encode::{
    JxlColorEncodingSetToSRGB, JxlEncoder, JxlEncoderAddBox, JxlEncoderAddImageFrame,
    JxlEncoderCloseBoxes, JxlEncoderCloseFrames, JxlEncoderCreate, JxlEncoderDestroy,
    JxlEncoderDistanceFromQuality, JxlEncoderFrameSettings, JxlEncoderFrameSettingsCreate,
    JxlEncoderInitBasicInfo, JxlEncoderInitExtraChannelInfo, JxlEncoderProcessOutput,
    JxlEncoderSetBasicInfo, JxlEncoderSetColorEncoding, JxlEncoderSetExtraChannelBuffer,
    JxlEncoderSetExtraChannelInfo, JxlEncoderSetFrameDistance, JxlEncoderSetFrameLossless,
    JxlEncoderSetICCProfile, JxlEncoderSetParallelRunner, JxlEncoderStatus,
    JxlEncoderUseBoxes, JxlEncoderUseContainer,
};
use jpegxl_sys::metadata::codestream_header::{
    JxlBasicInfo, JxlExtraChannelInfo, JxlExtraChannelType, JxlFrameHeader,
};
use jpegxl_sys::threads::thread_parallel_runner::{
    JxlThreadParallelRunner, JxlThreadParallelRunnerCreate, JxlThreadParallelRunnerDestroy,
};

use crate::error::{DecodeError, EncodeError};

pub(crate) use jpegxl_sys::color::color_encoding::{
    JxlColorEncoding as ColorEncoding, JxlColorSpace, JxlPrimaries, JxlTransferFunction,
    JxlWhitePoint,
};
pub(crate) use jpegxl_sys::common::types::{JxlDataType, JxlEndianness};
pub(crate) use jpegxl_sys::decode::JxlSignature as Signature;
pub(crate) use jpegxl_sys::decode::JxlDecoderStatus as DecStatus;
pub(crate) use jpegxl_sys::metadata::codestream_header::JxlOrientation;

pub(crate) use jpegxl_sys::common::types::JxlPixelFormat as PixelLayout;
pub(crate) use jpegxl_sys::metadata::codestream_header::JxlAnimationHeader as AnimationHeader;
pub(crate) use jpegxl_sys::metadata::codestream_header::JxlBasicInfo as BasicInfo;
pub(crate) use jpegxl_sys::metadata::codestream_header::JxlExtraChannelInfo as ExtraChannelInfo;
pub(crate) use jpegxl_sys::metadata::codestream_header::JxlExtraChannelType as ExtraChannelType;
pub(crate) use jpegxl_sys::metadata::codestream_header::JxlFrameHeader as FrameHeader;

pub(crate) fn jxl_bool(v: bool) -> JxlBool {
    if v {
        JxlBool::True
    } else {
        JxlBool::False
    }
}

pub(crate) fn is_true(v: JxlBool) -> bool {
    matches!(v, JxlBool::True)
}

fn box_tag(tag: &[u8; 4]) -> JxlBoxType {
    JxlBoxType([
        tag[0] as c_char,
        tag[1] as c_char,
        tag[2] as c_char,
        tag[3] as c_char,
    ])
}

/// Runs the library signature check over the leading bytes of a stream.
pub(crate) fn signature_check(data: &[u8]) -> JxlSignature {
    unsafe { JxlSignatureCheck(data.as_ptr(), data.len()) }
}

/// Maps a host quality (0..=100) to a perceptual distance.
pub(crate) fn distance_from_quality(quality: f32) -> f32 {
    unsafe { JxlEncoderDistanceFromQuality(quality) }
}

/// A structured sRGB color encoding, gray or RGB flavored.
pub(crate) fn color_encoding_srgb(is_gray: bool) -> JxlColorEncoding {
    let mut encoding = MaybeUninit::<JxlColorEncoding>::uninit();
    unsafe {
        JxlColorEncodingSetToSRGB(encoding.as_mut_ptr(), is_gray);
        encoding.assume_init()
    }
}

/// A default-initialized basic info record for encoding.
pub(crate) fn basic_info_default() -> JxlBasicInfo {
    let mut info = MaybeUninit::<JxlBasicInfo>::uninit();
    unsafe {
        JxlEncoderInitBasicInfo(info.as_mut_ptr());
        info.assume_init()
    }
}

/// A default-initialized extra channel record of the given type.
pub(crate) fn extra_channel_info_default(ec_type: JxlExtraChannelType) -> JxlExtraChannelInfo {
    let mut info = MaybeUninit::<JxlExtraChannelInfo>::uninit();
    unsafe {
        JxlEncoderInitExtraChannelInfo(ec_type, info.as_mut_ptr());
        info.assume_init()
    }
}

/// The library's process-wide default CMS, when one is compiled in.
pub(crate) fn default_cms() -> Option<JxlCmsInterface> {
    let cms = unsafe { JxlGetDefaultCms() };
    if cms.is_null() {
        None
    } else {
        Some(unsafe { (*cms).clone() })
    }
}

// ---------------------------------------------------------------------------
// Thread pool
// ---------------------------------------------------------------------------

/// An owned libjxl thread-parallel runner.
pub(crate) struct ThreadRunner {
    ptr: NonNull<c_void>,
}

impl ThreadRunner {
    /// Creates a pool with `num_threads` workers; `None` on allocation
    /// failure.
    pub(crate) fn new(num_threads: usize) -> Option<Self> {
        let ptr = unsafe { JxlThreadParallelRunnerCreate(ptr::null(), num_threads) };
        NonNull::new(ptr).map(|ptr| ThreadRunner { ptr })
    }

    fn opaque(&self) -> *mut c_void {
        self.ptr.as_ptr()
    }
}

impl Drop for ThreadRunner {
    fn drop(&mut self) {
        unsafe { JxlThreadParallelRunnerDestroy(self.ptr.as_ptr()) };
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// An owned libjxl decoder handle.
pub(crate) struct Decoder {
    ptr: NonNull<JxlDecoder>,
}

impl Decoder {
    pub(crate) fn new() -> Result<Self, DecodeError> {
        let ptr = unsafe { JxlDecoderCreate(ptr::null()) };
        NonNull::new(ptr)
            .map(|ptr| Decoder { ptr })
            .ok_or(DecodeError::DecoderInit("decoder allocation failed"))
    }

    fn raw(&self) -> *mut JxlDecoder {
        self.ptr.as_ptr()
    }

    pub(crate) fn set_keep_orientation(&mut self, keep: bool) {
        let _ = unsafe { JxlDecoderSetKeepOrientation(self.raw(), jxl_bool(keep)) };
    }

    pub(crate) fn set_parallel_runner(&mut self, runner: &ThreadRunner) -> bool {
        let status = unsafe {
            JxlDecoderSetParallelRunner(self.raw(), JxlThreadParallelRunner, runner.opaque())
        };
        status == JxlDecoderStatus::Success
    }

    /// Feeds the whole stream to the decoder.
    ///
    /// # Safety
    /// The library keeps the pointer until [`release_input`](Self::release_input)
    /// or [`rewind`](Self::rewind); `data`'s backing storage must stay alive
    /// and unmoved until then.
    pub(crate) unsafe fn set_input(&mut self, data: &[u8]) -> bool {
        let status = unsafe { JxlDecoderSetInput(self.raw(), data.as_ptr(), data.len()) };
        status == JxlDecoderStatus::Success
    }

    pub(crate) fn close_input(&mut self) {
        unsafe { JxlDecoderCloseInput(self.raw()) };
    }

    pub(crate) fn release_input(&mut self) {
        let _ = unsafe { JxlDecoderReleaseInput(self.raw()) };
    }

    pub(crate) fn rewind(&mut self) {
        unsafe { JxlDecoderRewind(self.raw()) };
    }

    pub(crate) fn skip_frames(&mut self, amount: usize) {
        unsafe { JxlDecoderSkipFrames(self.raw(), amount) };
    }

    pub(crate) fn subscribe_events(&mut self, events: c_int) -> bool {
        let status = unsafe { JxlDecoderSubscribeEvents(self.raw(), events) };
        status != JxlDecoderStatus::Error
    }

    pub(crate) fn process(&mut self) -> JxlDecoderStatus {
        unsafe { JxlDecoderProcessInput(self.raw()) }
    }

    pub(crate) fn basic_info(&mut self) -> Option<JxlBasicInfo> {
        let mut info = MaybeUninit::<JxlBasicInfo>::uninit();
        let status = unsafe { JxlDecoderGetBasicInfo(self.raw(), info.as_mut_ptr()) };
        (status == JxlDecoderStatus::Success).then(|| unsafe { info.assume_init() })
    }

    pub(crate) fn frame_header(&mut self) -> Option<JxlFrameHeader> {
        let mut header = MaybeUninit::<JxlFrameHeader>::uninit();
        let status = unsafe { JxlDecoderGetFrameHeader(self.raw(), header.as_mut_ptr()) };
        (status == JxlDecoderStatus::Success).then(|| unsafe { header.assume_init() })
    }

    pub(crate) fn extra_channel_info(&mut self, index: usize) -> Option<JxlExtraChannelInfo> {
        let mut info = MaybeUninit::<JxlExtraChannelInfo>::uninit();
        let status =
            unsafe { JxlDecoderGetExtraChannelInfo(self.raw(), index, info.as_mut_ptr()) };
        (status == JxlDecoderStatus::Success).then(|| unsafe { info.assume_init() })
    }

    pub(crate) fn set_cms(&mut self, cms: JxlCmsInterface) -> bool {
        let status = unsafe { JxlDecoderSetCms(self.raw(), cms) };
        status == JxlDecoderStatus::Success
    }

    pub(crate) fn set_preferred_color_profile(&mut self, encoding: &JxlColorEncoding) -> bool {
        let status = unsafe { JxlDecoderSetPreferredColorProfile(self.raw(), encoding) };
        status == JxlDecoderStatus::Success
    }

    /// The target-data color encoding, when the library can express it
    /// structurally.
    pub(crate) fn color_as_encoded_profile(&mut self) -> Option<JxlColorEncoding> {
        let mut encoding = MaybeUninit::<JxlColorEncoding>::uninit();
        let status = unsafe {
            JxlDecoderGetColorAsEncodedProfile(
                self.raw(),
                JxlColorProfileTarget::Data,
                encoding.as_mut_ptr(),
            )
        };
        (status == JxlDecoderStatus::Success).then(|| unsafe { encoding.assume_init() })
    }

    /// The target-data ICC profile: size query first, then fill.
    pub(crate) fn icc_profile(&mut self) -> Option<Vec<u8>> {
        let mut size = 0usize;
        let status = unsafe {
            JxlDecoderGetICCProfileSize(self.raw(), JxlColorProfileTarget::Data, &mut size)
        };
        if status != JxlDecoderStatus::Success || size == 0 {
            return None;
        }
        let mut icc = vec![0u8; size];
        let status = unsafe {
            JxlDecoderGetColorAsICCProfile(
                self.raw(),
                JxlColorProfileTarget::Data,
                icc.as_mut_ptr(),
                icc.len(),
            )
        };
        (status == JxlDecoderStatus::Success).then_some(icc)
    }

    /// Registers the main pixel out-buffer for the current frame.
    ///
    /// # Safety
    /// The library writes through the pointer until the frame completes;
    /// `buffer` must stay alive and unmoved until then.
    pub(crate) unsafe fn set_image_out_buffer(
        &mut self,
        format: &JxlPixelFormat,
        buffer: &mut [u8],
    ) -> bool {
        let status = unsafe {
            JxlDecoderSetImageOutBuffer(
                self.raw(),
                format,
                buffer.as_mut_ptr().cast::<c_void>(),
                buffer.len(),
            )
        };
        status == JxlDecoderStatus::Success
    }

    /// Registers an extra-channel out-buffer for the current frame.
    ///
    /// # Safety
    /// Same contract as [`set_image_out_buffer`](Self::set_image_out_buffer).
    pub(crate) unsafe fn set_extra_channel_buffer(
        &mut self,
        format: &JxlPixelFormat,
        buffer: &mut [u8],
        index: u32,
    ) -> bool {
        let status = unsafe {
            JxlDecoderSetExtraChannelBuffer(
                self.raw(),
                format,
                buffer.as_mut_ptr().cast::<c_void>(),
                buffer.len(),
                index,
            )
        };
        status == JxlDecoderStatus::Success
    }

    pub(crate) fn set_decompress_boxes(&mut self, decompress: bool) -> bool {
        let status = unsafe { JxlDecoderSetDecompressBoxes(self.raw(), jxl_bool(decompress)) };
        status == JxlDecoderStatus::Success
    }

    /// The 4-byte tag of the box the decoder stopped at.
    pub(crate) fn box_type(&mut self, decompressed: bool) -> Option<[u8; 4]> {
        let mut tag = JxlBoxType([0; 4]);
        let status =
            unsafe { JxlDecoderGetBoxType(self.raw(), &mut tag, jxl_bool(decompressed)) };
        (status == JxlDecoderStatus::Success)
            .then(|| [tag.0[0] as u8, tag.0[1] as u8, tag.0[2] as u8, tag.0[3] as u8])
    }

    pub(crate) fn box_size_raw(&mut self) -> Option<u64> {
        let mut size = 0u64;
        let status = unsafe { JxlDecoderGetBoxSizeRaw(self.raw(), &mut size) };
        (status == JxlDecoderStatus::Success).then_some(size)
    }

    /// Hands the decoder a window to decompress box contents into.
    ///
    /// # Safety
    /// The library writes through the pointer until
    /// [`release_box_buffer`](Self::release_box_buffer); `buffer` must stay
    /// alive and unmoved until then.
    pub(crate) unsafe fn set_box_buffer(&mut self, buffer: &mut [u8]) -> bool {
        let status =
            unsafe { JxlDecoderSetBoxBuffer(self.raw(), buffer.as_mut_ptr(), buffer.len()) };
        status == JxlDecoderStatus::Success
    }

    /// Releases the current box window, returning the unused byte count.
    pub(crate) fn release_box_buffer(&mut self) -> usize {
        unsafe { JxlDecoderReleaseBoxBuffer(self.raw()) }
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        unsafe { JxlDecoderDestroy(self.ptr.as_ptr()) };
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// An owned libjxl encoder handle.
pub(crate) struct Encoder {
    ptr: NonNull<JxlEncoder>,
}

impl Encoder {
    pub(crate) fn new() -> Result<Self, EncodeError> {
        let ptr = unsafe { JxlEncoderCreate(ptr::null()) };
        NonNull::new(ptr)
            .map(|ptr| Encoder { ptr })
            .ok_or(EncodeError::Encoder("encoder allocation failed"))
    }

    fn raw(&self) -> *mut JxlEncoder {
        self.ptr.as_ptr()
    }

    pub(crate) fn set_parallel_runner(&mut self, runner: &ThreadRunner) -> bool {
        let status = unsafe {
            JxlEncoderSetParallelRunner(self.raw(), JxlThreadParallelRunner, runner.opaque())
        };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn use_container(&mut self, use_container: bool) -> bool {
        let status = unsafe { JxlEncoderUseContainer(self.raw(), use_container) };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn use_boxes(&mut self) -> bool {
        let status = unsafe { JxlEncoderUseBoxes(self.raw()) };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn close_boxes(&mut self) {
        unsafe { JxlEncoderCloseBoxes(self.raw()) };
    }

    pub(crate) fn close_frames(&mut self) {
        unsafe { JxlEncoderCloseFrames(self.raw()) };
    }

    pub(crate) fn add_box(&mut self, tag: &[u8; 4], contents: &[u8], compress: bool) -> bool {
        let tag = box_tag(tag);
        let status = unsafe {
            JxlEncoderAddBox(
                self.raw(),
                &tag,
                contents.as_ptr(),
                contents.len(),
                jxl_bool(compress),
            )
        };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn set_basic_info(&mut self, info: &JxlBasicInfo) -> bool {
        let status = unsafe { JxlEncoderSetBasicInfo(self.raw(), info) };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn set_extra_channel_info(
        &mut self,
        index: usize,
        info: &JxlExtraChannelInfo,
    ) -> bool {
        let status = unsafe { JxlEncoderSetExtraChannelInfo(self.raw(), index, info) };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn set_icc_profile(&mut self, icc: &[u8]) -> bool {
        let status = unsafe { JxlEncoderSetICCProfile(self.raw(), icc.as_ptr(), icc.len()) };
        status == JxlEncoderStatus::Success
    }

    pub(crate) fn set_color_encoding(&mut self, encoding: &JxlColorEncoding) -> bool {
        let status = unsafe { JxlEncoderSetColorEncoding(self.raw(), encoding) };
        status == JxlEncoderStatus::Success
    }

    /// Creates default frame settings owned by this encoder.
    pub(crate) fn frame_settings(&mut self) -> FrameSettings<'_> {
        let ptr = unsafe { JxlEncoderFrameSettingsCreate(self.raw(), ptr::null()) };
        FrameSettings {
            ptr,
            _encoder: PhantomData,
        }
    }

    /// Drains the compressed stream: 4 KiB initial buffer, doubled on demand,
    /// truncated to the written length.
    pub(crate) fn collect_output(&mut self) -> Result<Vec<u8>, EncodeError> {
        let mut compressed = vec![0u8; 4096];
        let mut offset = 0usize;
        loop {
            let mut next_out = unsafe { compressed.as_mut_ptr().add(offset) };
            let mut avail_out = compressed.len() - offset;
            let status =
                unsafe { JxlEncoderProcessOutput(self.raw(), &mut next_out, &mut avail_out) };
            offset = unsafe { next_out.offset_from(compressed.as_ptr()) } as usize;
            match status {
                JxlEncoderStatus::NeedMoreOutput => {
                    let doubled = compressed.len() * 2;
                    compressed.resize(doubled, 0);
                }
                JxlEncoderStatus::Success => {
                    compressed.truncate(offset);
                    return Ok(compressed);
                }
                _ => return Err(EncodeError::Encoder("processing compressed output failed")),
            }
        }
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        unsafe { JxlEncoderDestroy(self.ptr.as_ptr()) };
    }
}

/// Frame settings borrowed from an [`Encoder`]; freed with it.
pub(crate) struct FrameSettings<'a> {
    ptr: *mut JxlEncoderFrameSettings,
    _encoder: PhantomData<&'a Encoder>,
}

impl FrameSettings<'_> {
    pub(crate) fn set_distance(&mut self, distance: f32) {
        let _ = unsafe { JxlEncoderSetFrameDistance(self.ptr, distance) };
    }

    pub(crate) fn set_lossless(&mut self, lossless: bool) {
        let _ = unsafe { JxlEncoderSetFrameLossless(self.ptr, lossless) };
    }

    pub(crate) fn add_image_frame(&mut self, format: &JxlPixelFormat, data: &[u8]) -> bool {
        let status = unsafe {
            JxlEncoderAddImageFrame(self.ptr, format, data.as_ptr().cast::<c_void>(), data.len())
        };
        status != JxlEncoderStatus::Error
    }

    pub(crate) fn set_extra_channel_buffer(
        &mut self,
        format: &JxlPixelFormat,
        data: &[u8],
        index: u32,
    ) -> bool {
        let status = unsafe {
            JxlEncoderSetExtraChannelBuffer(
                self.ptr,
                format,
                data.as_ptr().cast::<c_void>(),
                data.len(),
                index,
            )
        };
        status != JxlEncoderStatus::Error
    }
}
