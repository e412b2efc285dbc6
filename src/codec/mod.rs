//! Interface to the JPEG2000 decoder library.
//!
//! Codestream parsing is delegated to an implementation of [`Codec`]. The
//! types here describe what such an implementation receives (a
//! [`CodecStream`] and decode parameters) and what it hands back (a
//! [`DecodedImage`] of 32-bit samples per component).
//!
//! With the `openjpeg` feature, `OpenJpegCodec` decodes through the OpenJPEG
//! library.

mod messages;
#[cfg(feature = "openjpeg")]
mod openjpeg;
mod stream;

use thiserror::Error;

pub use messages::{
    remove_message_handler, reset_warning_state, set_message_handler, CodecMessages, MessageLevel,
};
#[cfg(feature = "openjpeg")]
pub use openjpeg::{OpenJpegCodec, OpenJpegSession};
pub use stream::CodecStream;

/// Failure reported by a codec implementation.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CodecFailure(pub String);

impl CodecFailure {
    pub fn new(msg: impl Into<String>) -> Self {
        CodecFailure(msg.into())
    }
}

pub type CodecResult<T> = std::result::Result<T, CodecFailure>;

/// Container flavour of the compressed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFormat {
    /// Raw codestream, starting with the SOC marker.
    J2k,
    /// JP2 box container.
    Jp2,
}

impl CodecFormat {
    const SOC: [u8; 2] = [0xff, 0x4f];

    /// Guess the format from the first bytes of the resource.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&Self::SOC) {
            CodecFormat::J2k
        } else {
            CodecFormat::Jp2
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    Unknown,
    Unspecified,
    Srgb,
    Gray,
    Sycc,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageComponent {
    /// Horizontal subsampling factor relative to the reference grid.
    pub dx: usize,
    /// Vertical subsampling factor relative to the reference grid.
    pub dy: usize,
    pub width: usize,
    pub height: usize,
    /// Bits per sample.
    pub precision: u8,
    pub signed: bool,
    /// Row-major samples, `width * height` once decoded, empty after a header read.
    pub data: Vec<i32>,
}

impl ImageComponent {
    pub fn sample(&self, x: usize, y: usize) -> i32 {
        self.data[y * self.width + x]
    }
}

/// Image geometry and, after a decode, pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
    pub color_space: ColorSpace,
    pub components: Vec<ImageComponent>,
}

impl DecodedImage {
    pub fn width(&self) -> usize {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> usize {
        self.y1.saturating_sub(self.y0)
    }
}

/// Tiling and coding parameters from the main header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodestreamInfo {
    pub tile_x0: usize,
    pub tile_y0: usize,
    pub tile_width: usize,
    pub tile_height: usize,
    pub tiles_across: usize,
    pub tiles_down: usize,
    /// Number of resolutions of the first component's default coding style.
    pub num_resolutions: usize,
    /// Multiple component transform flag.
    pub mct: bool,
}

/// Factory for decode sessions, shared by every thread of a dataset.
pub trait Codec: Send + Sync {
    fn create_session(
        &self,
        format: CodecFormat,
        messages: CodecMessages,
    ) -> CodecResult<Box<dyn CodecSession>>;
}

/// One decompression session.
///
/// Calls happen in order: `setup`, `read_header`, then optionally
/// `codestream_info`, `set_decoded_resolution_factor` and `set_decode_area`,
/// then either `decode` or `get_decoded_tile`, and finally `end_decompress`.
pub trait CodecSession: Send {
    fn setup(&mut self) -> CodecResult<()>;

    fn read_header(&mut self, stream: &mut CodecStream<'_>) -> CodecResult<DecodedImage>;

    fn codestream_info(&self) -> CodecResult<CodestreamInfo>;

    fn set_decoded_resolution_factor(&mut self, level: usize) -> CodecResult<()>;

    /// Restrict decoding to a window of the reference grid.
    fn set_decode_area(
        &mut self,
        image: &mut DecodedImage,
        x0: usize,
        y0: usize,
        x1: usize,
        y1: usize,
    ) -> CodecResult<()>;

    fn decode(&mut self, stream: &mut CodecStream<'_>, image: &mut DecodedImage)
        -> CodecResult<()>;

    fn get_decoded_tile(
        &mut self,
        stream: &mut CodecStream<'_>,
        image: &mut DecodedImage,
        tile_index: usize,
    ) -> CodecResult<()>;

    fn end_decompress(&mut self, stream: &mut CodecStream<'_>) -> CodecResult<()>;
}
