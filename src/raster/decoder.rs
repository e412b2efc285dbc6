//! One-tile decoding through a codec session.

use std::io::{Read, Seek, SeekFrom};

use tracing::{debug, trace};

use crate::codec::{Codec, CodecFormat, CodecMessages, CodecSession, CodecStream, DecodedImage};
use crate::errors::{Jp2Error, Result};
use crate::raster::{RasterDescriptor, TileCoordinate};
use crate::vsi::VsiFile;

/// How blocks are requested from the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// Decode a window of one large codestream tile.
    Window,
    /// Decode a whole codestream tile by its index.
    TileIndex,
}

impl DecodeStrategy {
    /// Choose the strategy for a raster stored with `tile_size` tiles, and the
    /// block size it implies.
    ///
    /// Images made of a single tile larger than `cap` in either direction are
    /// read window by window, with blocks of at most `cap` pixels.
    pub fn select(
        raster_size: (usize, usize),
        tile_size: (usize, usize),
        cap: usize,
    ) -> (Self, (usize, usize)) {
        let single_tile = raster_size == tile_size;
        if single_tile && (raster_size.0 > cap || raster_size.1 > cap) {
            (
                DecodeStrategy::Window,
                (tile_size.0.min(cap), tile_size.1.min(cap)),
            )
        } else {
            (DecodeStrategy::TileIndex, tile_size)
        }
    }
}

/// Read the first bytes of `file` to tell a raw codestream from a JP2 file.
pub(crate) fn detect_format(file: &mut VsiFile) -> Result<CodecFormat> {
    let mut magic = [0_u8; 2];
    file.seek(SeekFrom::Start(0))?;
    let n = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(CodecFormat::detect(&magic[..n]))
}

/// A codec session bound to its stream.
///
/// Once the header was read, dropping the session ends the decompression,
/// whichever way the decode went.
pub(crate) struct Session<'f> {
    codec: Box<dyn CodecSession>,
    stream: CodecStream<'f>,
    header_read: bool,
}

impl<'f> Session<'f> {
    /// Create and set up a session, then read the main header.
    pub(crate) fn start(
        codec: &dyn Codec,
        format: CodecFormat,
        file: &'f mut VsiFile,
    ) -> Result<(Self, DecodedImage)> {
        let mut session = codec
            .create_session(format, CodecMessages)
            .map_err(|e| Jp2Error::CodecSetup(e.0))?;
        session.setup().map_err(|e| Jp2Error::CodecSetup(e.0))?;

        let stream = CodecStream::new(file)?;
        let mut session = Session {
            codec: session,
            stream,
            header_read: false,
        };
        let image = session
            .codec
            .read_header(&mut session.stream)
            .map_err(|e| Jp2Error::HeaderUnreadable(e.0))?;
        session.header_read = true;
        Ok((session, image))
    }

    pub(crate) fn codec(&self) -> &dyn CodecSession {
        self.codec.as_ref()
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.header_read {
            if let Err(e) = self.codec.end_decompress(&mut self.stream) {
                debug!(target: "openjpeg", "end of decompression failed: {}", e);
            }
        }
    }
}

/// Decodes the blocks of one resolution level.
pub struct TileDecoder<'a> {
    codec: &'a dyn Codec,
    format: CodecFormat,
    descriptor: &'a RasterDescriptor,
}

impl<'a> TileDecoder<'a> {
    pub fn new(codec: &'a dyn Codec, format: CodecFormat, descriptor: &'a RasterDescriptor) -> Self {
        TileDecoder {
            codec,
            format,
            descriptor,
        }
    }

    /// Decode the data of block `tile` for all components.
    ///
    /// Component planes may extend past the raster edge; only the part given
    /// by [`RasterDescriptor::valid_block_size`] holds image data.
    pub fn decode(&self, file: &mut VsiFile, tile: TileCoordinate) -> Result<DecodedImage> {
        let descriptor = self.descriptor;
        let (mut session, mut image) = Session::start(self.codec, self.format, file)?;

        let level = descriptor.level;
        session
            .codec
            .set_decoded_resolution_factor(level)
            .map_err(|e| Jp2Error::ResolutionRejected { level, msg: e.0 })?;

        match descriptor.strategy {
            DecodeStrategy::Window => {
                let (x0, y0, x1, y1) = self.reference_window(&image, tile);
                trace!(?tile, x0, y0, x1, y1, "decoding window");
                session
                    .codec
                    .set_decode_area(&mut image, x0, y0, x1, y1)
                    .map_err(|e| Jp2Error::DecodeWindowRejected {
                        x0,
                        y0,
                        x1,
                        y1,
                        msg: e.0,
                    })?;
                session
                    .codec
                    .decode(&mut session.stream, &mut image)
                    .map_err(|e| Jp2Error::DecodeFailed(e.0))?;
            }
            DecodeStrategy::TileIndex => {
                let index = tile.row * descriptor.tiles_across + tile.col;
                trace!(?tile, index, "decoding tile");
                session
                    .codec
                    .get_decoded_tile(&mut session.stream, &mut image, index)
                    .map_err(|e| Jp2Error::DecodeFailed(e.0))?;
            }
        }
        Ok(image)
    }

    /// Bounds of block `tile` on the full resolution reference grid.
    fn reference_window(
        &self,
        header: &DecodedImage,
        tile: TileCoordinate,
    ) -> (usize, usize, usize, usize) {
        let descriptor = self.descriptor;
        let (tile_width, tile_height) = descriptor.block_size;
        let (width, height) = descriptor.valid_block_size(tile);
        let level = descriptor.level;
        let x0 = tile.col * tile_width;
        let y0 = tile.row * tile_height;
        (
            (header.x0 + (x0 << level)).min(header.x1),
            (header.y0 + (y0 << level)).min(header.y1),
            (header.x0 + ((x0 + width) << level)).min(header.x1),
            (header.y0 + ((y0 + height) << level)).min(header.y1),
        )
    }
}
