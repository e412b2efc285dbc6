//! [`Codec`] implementation over the OpenJPEG library.

use std::cell::Cell;
use std::ffi::CStr;
use std::ptr;
use std::slice;

use libc::{c_char, c_void};
use openjpeg_sys as opj;

use super::{
    Codec, CodecFailure, CodecFormat, CodecMessages, CodecResult, CodecSession, CodecStream,
    CodestreamInfo, ColorSpace, DecodedImage, ImageComponent,
};

/// Size of the internal read buffer of the OpenJPEG stream.
const STREAM_BUFFER_SIZE: usize = 1024;

/// Decoder backed by OpenJPEG, one `opj_codec_t` per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenJpegCodec;

impl Codec for OpenJpegCodec {
    fn create_session(
        &self,
        format: CodecFormat,
        messages: CodecMessages,
    ) -> CodecResult<Box<dyn CodecSession>> {
        let codec_format = match format {
            CodecFormat::J2k => opj::CODEC_FORMAT::OPJ_CODEC_J2K,
            CodecFormat::Jp2 => opj::CODEC_FORMAT::OPJ_CODEC_JP2,
        };
        let codec = unsafe { opj::opj_create_decompress(codec_format) };
        if codec.is_null() {
            return Err(CodecFailure::new("opj_create_decompress() failed"));
        }

        let session = OpenJpegSession {
            codec,
            stream: ptr::null_mut(),
            slot: Box::new(StreamSlot {
                current: Cell::new(ptr::null_mut()),
            }),
            image: ptr::null_mut(),
            messages: Box::new(messages),
        };
        let client_data = session.messages.as_ref() as *const CodecMessages as *mut c_void;
        unsafe {
            opj::opj_set_info_handler(codec, Some(info_handler), client_data);
            opj::opj_set_warning_handler(codec, Some(warning_handler), client_data);
            opj::opj_set_error_handler(codec, Some(error_handler), client_data);
        }
        Ok(Box::new(session))
    }
}

fn message(msg: *const c_char) -> String {
    if msg.is_null() {
        return String::new();
    }
    let c_str = unsafe { CStr::from_ptr(msg) };
    c_str.to_string_lossy().into_owned()
}

unsafe extern "C" fn info_handler(msg: *const c_char, client_data: *mut c_void) {
    if let Some(messages) = (client_data as *const CodecMessages).as_ref() {
        messages.info(&message(msg));
    }
}

unsafe extern "C" fn warning_handler(msg: *const c_char, client_data: *mut c_void) {
    if let Some(messages) = (client_data as *const CodecMessages).as_ref() {
        messages.warning(&message(msg));
    }
}

unsafe extern "C" fn error_handler(msg: *const c_char, client_data: *mut c_void) {
    if let Some(messages) = (client_data as *const CodecMessages).as_ref() {
        messages.error(&message(msg));
    }
}

/// User data of the OpenJPEG stream.
///
/// Holds the [`CodecStream`] passed to the session call in progress, null
/// between calls.
struct StreamSlot {
    current: Cell<*mut c_void>,
}

unsafe fn bound_stream<'a>(user_data: *mut c_void) -> Option<&'a mut CodecStream<'static>> {
    let slot = (user_data as *const StreamSlot).as_ref()?;
    (slot.current.get() as *mut CodecStream<'static>).as_mut()
}

unsafe extern "C" fn stream_read(
    buffer: *mut c_void,
    nb_bytes: opj::OPJ_SIZE_T,
    user_data: *mut c_void,
) -> opj::OPJ_SIZE_T {
    let Some(stream) = bound_stream(user_data) else {
        return opj::OPJ_SIZE_T::MAX;
    };
    if buffer.is_null() || nb_bytes == 0 {
        return opj::OPJ_SIZE_T::MAX;
    }
    let buf = slice::from_raw_parts_mut(buffer as *mut u8, nb_bytes as usize);
    match stream.read(buf) {
        Some(n) => n as opj::OPJ_SIZE_T,
        None => opj::OPJ_SIZE_T::MAX,
    }
}

unsafe extern "C" fn stream_skip(
    nb_bytes: opj::OPJ_OFF_T,
    user_data: *mut c_void,
) -> opj::OPJ_OFF_T {
    match bound_stream(user_data) {
        Some(stream) => stream.skip(nb_bytes),
        None => -1,
    }
}

unsafe extern "C" fn stream_seek(
    offset: opj::OPJ_OFF_T,
    user_data: *mut c_void,
) -> opj::OPJ_BOOL {
    match bound_stream(user_data) {
        Some(stream) if offset >= 0 && stream.seek(offset as u64) => 1,
        _ => 0,
    }
}

fn color_space(space: opj::OPJ_COLOR_SPACE) -> ColorSpace {
    match space {
        opj::COLOR_SPACE::OPJ_CLRSPC_UNSPECIFIED => ColorSpace::Unspecified,
        opj::COLOR_SPACE::OPJ_CLRSPC_SRGB => ColorSpace::Srgb,
        opj::COLOR_SPACE::OPJ_CLRSPC_GRAY => ColorSpace::Gray,
        opj::COLOR_SPACE::OPJ_CLRSPC_SYCC => ColorSpace::Sycc,
        _ => ColorSpace::Unknown,
    }
}

/// Copy geometry and, when decoded, the samples of an OpenJPEG image.
unsafe fn describe(image: &opj::opj_image_t) -> DecodedImage {
    let comps = if image.comps.is_null() {
        &[][..]
    } else {
        slice::from_raw_parts(image.comps, image.numcomps as usize)
    };
    let components = comps
        .iter()
        .map(|comp| {
            let (width, height) = (comp.w as usize, comp.h as usize);
            let data = if comp.data.is_null() {
                Vec::new()
            } else {
                slice::from_raw_parts(comp.data, width * height).to_vec()
            };
            ImageComponent {
                dx: comp.dx as usize,
                dy: comp.dy as usize,
                width,
                height,
                precision: comp.prec as u8,
                signed: comp.sgnd != 0,
                data,
            }
        })
        .collect();
    DecodedImage {
        x0: image.x0 as usize,
        y0: image.y0 as usize,
        x1: image.x1 as usize,
        y1: image.y1 as usize,
        color_space: color_space(image.color_space),
        components,
    }
}

fn checked(ok: opj::OPJ_BOOL, function: &str) -> CodecResult<()> {
    if ok == 0 {
        return Err(CodecFailure::new(format!("{}() failed", function)));
    }
    Ok(())
}

fn reference_coordinate(value: usize) -> CodecResult<opj::OPJ_INT32> {
    opj::OPJ_INT32::try_from(value)
        .map_err(|_| CodecFailure::new(format!("coordinate {} out of range", value)))
}

pub struct OpenJpegSession {
    codec: *mut opj::opj_codec_t,
    stream: *mut opj::opj_stream_t,
    slot: Box<StreamSlot>,
    image: *mut opj::opj_image_t,
    messages: Box<CodecMessages>,
}

// The OpenJPEG handles belong to this session alone, and a session is used by
// one thread at a time.
unsafe impl Send for OpenJpegSession {}

impl OpenJpegSession {
    /// Bind `stream` to the OpenJPEG stream, creating the latter on first use.
    fn attach(&mut self, stream: &mut CodecStream<'_>) -> CodecResult<*mut opj::opj_stream_t> {
        if self.stream.is_null() {
            let raw =
                unsafe { opj::opj_stream_create(STREAM_BUFFER_SIZE as opj::OPJ_SIZE_T, 1) };
            if raw.is_null() {
                return Err(CodecFailure::new("opj_stream_create() failed"));
            }
            unsafe {
                opj::opj_stream_set_read_function(raw, Some(stream_read));
                opj::opj_stream_set_skip_function(raw, Some(stream_skip));
                opj::opj_stream_set_seek_function(raw, Some(stream_seek));
                opj::opj_stream_set_user_data(
                    raw,
                    self.slot.as_ref() as *const StreamSlot as *mut c_void,
                    None,
                );
                opj::opj_stream_set_user_data_length(raw, stream.length());
            }
            self.stream = raw;
        }
        self.slot
            .current
            .set(stream as *mut CodecStream<'_> as *mut c_void);
        Ok(self.stream)
    }

    fn detach(&self) {
        self.slot.current.set(ptr::null_mut());
    }

    fn image(&self) -> CodecResult<DecodedImage> {
        if self.image.is_null() {
            return Err(CodecFailure::new("no image header"));
        }
        Ok(unsafe { describe(&*self.image) })
    }
}

impl CodecSession for OpenJpegSession {
    fn setup(&mut self) -> CodecResult<()> {
        let mut parameters: opj::opj_dparameters_t = unsafe { std::mem::zeroed() };
        unsafe { opj::opj_set_default_decoder_parameters(&mut parameters) };
        checked(
            unsafe { opj::opj_setup_decoder(self.codec, &mut parameters) },
            "opj_setup_decoder",
        )
    }

    fn read_header(&mut self, stream: &mut CodecStream<'_>) -> CodecResult<DecodedImage> {
        let raw = self.attach(stream)?;
        let ok = unsafe { opj::opj_read_header(raw, self.codec, &mut self.image) };
        self.detach();
        checked(ok, "opj_read_header")?;
        self.image()
    }

    fn codestream_info(&self) -> CodecResult<CodestreamInfo> {
        let mut info = unsafe { opj::opj_get_cstr_info(self.codec) };
        if info.is_null() {
            return Err(CodecFailure::new("opj_get_cstr_info() failed"));
        }
        let result = unsafe {
            let cstr = &*info;
            let tile = &cstr.m_default_tile_info;
            let num_resolutions = match tile.tccp_info.as_ref() {
                Some(tccp) => tccp.numresolutions as usize,
                None => 1,
            };
            CodestreamInfo {
                tile_x0: cstr.tx0 as usize,
                tile_y0: cstr.ty0 as usize,
                tile_width: cstr.tdx as usize,
                tile_height: cstr.tdy as usize,
                tiles_across: cstr.tw as usize,
                tiles_down: cstr.th as usize,
                num_resolutions,
                mct: tile.mct != 0,
            }
        };
        unsafe { opj::opj_destroy_cstr_info(&mut info) };
        Ok(result)
    }

    fn set_decoded_resolution_factor(&mut self, level: usize) -> CodecResult<()> {
        let level = opj::OPJ_UINT32::try_from(level)
            .map_err(|_| CodecFailure::new(format!("resolution factor {} out of range", level)))?;
        checked(
            unsafe { opj::opj_set_decoded_resolution_factor(self.codec, level) },
            "opj_set_decoded_resolution_factor",
        )
    }

    fn set_decode_area(
        &mut self,
        image: &mut DecodedImage,
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
    ) -> CodecResult<()> {
        if self.image.is_null() {
            return Err(CodecFailure::new("no image header"));
        }
        let ok = unsafe {
            opj::opj_set_decode_area(
                self.codec,
                self.image,
                reference_coordinate(x0)?,
                reference_coordinate(y0)?,
                reference_coordinate(x1)?,
                reference_coordinate(y1)?,
            )
        };
        checked(ok, "opj_set_decode_area")?;
        *image = self.image()?;
        Ok(())
    }

    fn decode(
        &mut self,
        stream: &mut CodecStream<'_>,
        image: &mut DecodedImage,
    ) -> CodecResult<()> {
        if self.image.is_null() {
            return Err(CodecFailure::new("no image header"));
        }
        let raw = self.attach(stream)?;
        let ok = unsafe { opj::opj_decode(self.codec, raw, self.image) };
        self.detach();
        checked(ok, "opj_decode")?;
        *image = self.image()?;
        Ok(())
    }

    fn get_decoded_tile(
        &mut self,
        stream: &mut CodecStream<'_>,
        image: &mut DecodedImage,
        tile_index: usize,
    ) -> CodecResult<()> {
        if self.image.is_null() {
            return Err(CodecFailure::new("no image header"));
        }
        let index = opj::OPJ_UINT32::try_from(tile_index)
            .map_err(|_| CodecFailure::new(format!("tile index {} out of range", tile_index)))?;
        let raw = self.attach(stream)?;
        let ok = unsafe { opj::opj_get_decoded_tile(self.codec, raw, self.image, index) };
        self.detach();
        checked(ok, "opj_get_decoded_tile")?;
        *image = self.image()?;
        Ok(())
    }

    fn end_decompress(&mut self, stream: &mut CodecStream<'_>) -> CodecResult<()> {
        let raw = self.attach(stream)?;
        let ok = unsafe { opj::opj_end_decompress(self.codec, raw) };
        self.detach();
        checked(ok, "opj_end_decompress")
    }
}

impl Drop for OpenJpegSession {
    fn drop(&mut self) {
        unsafe {
            opj::opj_destroy_codec(self.codec);
            if !self.stream.is_null() {
                opj::opj_stream_destroy(self.stream);
            }
            if !self.image.is_null() {
                opj::opj_image_destroy(self.image);
            }
        }
    }
}

impl std::fmt::Debug for OpenJpegSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenJpegSession")
            .field("messages", &self.messages)
            .field("header_read", &!self.image.is_null())
            .finish()
    }
}
