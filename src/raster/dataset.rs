use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::block_cache::{global_block_cache, BlockCache, BlockKey, DatasetId, LockedBlock};
use crate::codec::{Codec, CodecFormat, ColorSpace, DecodedImage};
use crate::config;
use crate::errors::*;
use crate::raster::admission::{admit, Admission, AdmissionRequest};
use crate::raster::color::{BlockLayout, ColorReconstructor};
use crate::raster::decoder::{detect_format, Session};
use crate::raster::overview::{best_overview, build_ladder};
use crate::raster::prefetch::{self, PrefetchJob, PrefetchTarget, Preload};
use crate::raster::rasterband::{checked_window, read_window};
use crate::raster::{
    BandSubset, Buffer, ColorInterpretation, DataType, DecodeStrategy, GdalType, PixelWindow,
    RasterBand, TileCoordinate, TileDecoder, TileSource,
};
use crate::vsi::{self, VsiFile};

/// Geometry and sample layout of one resolution level.
///
/// Probed from the codestream header when the dataset is opened; overview
/// levels derive theirs from the full resolution one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterDescriptor {
    pub raster_size: (usize, usize),
    pub band_count: usize,
    pub data_type: DataType,
    /// Significant bits of each band, after promotion.
    pub band_bits: Vec<u8>,
    /// Bands whose 1-bit samples are stored as 0/255.
    pub promoted: Vec<bool>,
    pub block_size: (usize, usize),
    pub color_space: ColorSpace,
    /// Three components with chroma planes at half resolution.
    pub is_420: bool,
    /// Resolution factor, 0 for full resolution.
    pub level: usize,
    pub strategy: DecodeStrategy,
    /// Codestream tiles per row, used to number tiles.
    pub tiles_across: usize,
}

impl RasterDescriptor {
    /// Number of block columns and rows.
    pub fn block_grid(&self) -> (usize, usize) {
        (
            self.raster_size.0.div_ceil(self.block_size.0),
            self.raster_size.1.div_ceil(self.block_size.1),
        )
    }

    /// Part of block `tile` inside the raster.
    pub fn valid_block_size(&self, tile: TileCoordinate) -> (usize, usize) {
        let (block_width, block_height) = self.block_size;
        (
            block_width.min(self.raster_size.0.saturating_sub(tile.col * block_width)),
            block_height.min(self.raster_size.1.saturating_sub(tile.row * block_height)),
        )
    }

    pub fn block_bytes(&self) -> usize {
        self.block_size.0 * self.block_size.1 * self.data_type.size_bytes()
    }

    pub fn layout(&self, tile: TileCoordinate) -> BlockLayout {
        BlockLayout {
            data_type: self.data_type,
            block_size: self.block_size,
            valid_size: self.valid_block_size(tile),
        }
    }

    pub fn color_interpretation(&self, band: usize) -> ColorInterpretation {
        if self.color_space == ColorSpace::Gray {
            return ColorInterpretation::GrayIndex;
        }
        if self.band_count == 3 || self.band_count == 4 {
            return match band {
                1 => ColorInterpretation::RedBand,
                2 => ColorInterpretation::GreenBand,
                3 => ColorInterpretation::BlueBand,
                4 => ColorInterpretation::AlphaBand,
                _ => ColorInterpretation::Undefined,
            };
        }
        ColorInterpretation::Undefined
    }

    fn contains_tile(&self, tile: TileCoordinate) -> bool {
        let (cols, rows) = self.block_grid();
        tile.col < cols && tile.row < rows
    }

    /// Descriptor of overview `level` of this full resolution descriptor.
    fn overview(
        &self,
        level: usize,
        raster_size: (usize, usize),
        block_size: (usize, usize),
        strategy: DecodeStrategy,
    ) -> Self {
        let tiles_across = if strategy == self.strategy {
            self.tiles_across
        } else {
            // a window read image is a single codestream tile
            1
        };
        RasterDescriptor {
            raster_size,
            block_size,
            level,
            strategy,
            tiles_across,
            ..self.clone()
        }
    }
}

/// Open options of a [`Dataset`].
#[derive(Clone, Default)]
pub struct DatasetOptions {
    /// Maximum number of prefetch workers, instead of `GDAL_NUM_THREADS`.
    pub num_threads: Option<usize>,
    /// Promote a 1-bit alpha band to 0/255, instead of
    /// `JP2OPENJPEG_PROMOTE_1BIT_ALPHA_AS_8BIT`.
    pub promote_1bit_alpha: Option<bool>,
    /// Cache for the decoded blocks, instead of the global one.
    pub block_cache: Option<Arc<dyn BlockCache>>,
}

/// Wrapper around a JPEG2000 image opened for reading.
///
/// Blocks are decoded on demand through the [`Codec`] and kept in a
/// [`BlockCache`]. Windowed reads spanning several blocks decode them in
/// parallel first.
pub struct Dataset {
    name: String,
    id: DatasetId,
    codec: Arc<dyn Codec>,
    format: CodecFormat,
    descriptor: RasterDescriptor,
    file: Mutex<VsiFile>,
    cache: Arc<dyn BlockCache>,
    max_threads: Option<usize>,
    num_threads: OnceCell<usize>,
    overviews: Vec<Dataset>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("format", &self.format)
            .field("descriptor", &self.descriptor)
            .field("overviews", &self.overviews.len())
            .finish()
    }
}

impl Dataset {
    /// Open a dataset with default options.
    pub fn open<P: AsRef<Path>>(path: P, codec: Arc<dyn Codec>) -> Result<Dataset> {
        Self::open_ex(path, codec, DatasetOptions::default())
    }

    /// Open a dataset, probing the codestream header.
    ///
    /// `path` is a disk path or a `/vsimem/` name.
    pub fn open_ex<P: AsRef<Path>>(
        path: P,
        codec: Arc<dyn Codec>,
        options: DatasetOptions,
    ) -> Result<Dataset> {
        let name = path.as_ref().to_string_lossy().into_owned();
        let mut file = vsi::open(&name)?;
        let format = detect_format(&mut file)?;
        let promote = options
            .promote_1bit_alpha
            .unwrap_or_else(|| config::get_config_bool(config::PROMOTE_1BIT_ALPHA, true));
        let (descriptor, num_resolutions) = probe(codec.as_ref(), format, &mut file, promote)?;
        let cache: Arc<dyn BlockCache> = match options.block_cache {
            Some(cache) => cache,
            None => global_block_cache(),
        };

        let mut overviews = Vec::new();
        for step in build_ladder(
            descriptor.raster_size,
            descriptor.block_size,
            descriptor.strategy,
            num_resolutions,
        ) {
            let file = match vsi::open(&name) {
                Ok(file) => file,
                Err(e) => {
                    debug!(target: "openjpeg", "no more overviews: {}", e);
                    break;
                }
            };
            overviews.push(Dataset {
                name: name.clone(),
                id: DatasetId::next(),
                codec: codec.clone(),
                format,
                descriptor: descriptor.overview(
                    step.level,
                    step.raster_size,
                    step.block_size,
                    step.strategy,
                ),
                file: Mutex::new(file),
                cache: cache.clone(),
                max_threads: options.num_threads,
                num_threads: OnceCell::new(),
                overviews: Vec::new(),
            });
        }
        debug!(target: "openjpeg", "{}: {} overviews", name, overviews.len());

        Ok(Dataset {
            name,
            id: DatasetId::next(),
            codec,
            format,
            descriptor,
            file: Mutex::new(file),
            cache,
            max_threads: options.num_threads,
            num_threads: OnceCell::new(),
            overviews,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec_format(&self) -> CodecFormat {
        self.format
    }

    pub fn descriptor(&self) -> &RasterDescriptor {
        &self.descriptor
    }

    pub fn raster_size(&self) -> (usize, usize) {
        self.descriptor.raster_size
    }

    pub fn raster_count(&self) -> usize {
        self.descriptor.band_count
    }

    pub fn block_size(&self) -> (usize, usize) {
        self.descriptor.block_size
    }

    pub fn strategy(&self) -> DecodeStrategy {
        self.descriptor.strategy
    }

    /// Prefetch worker limit, resolved on first use.
    pub fn num_threads(&self) -> usize {
        *self.num_threads.get_or_init(|| {
            let threads = self
                .max_threads
                .unwrap_or_else(config::num_threads)
                .clamp(1, config::MAX_THREADS);
            debug!(target: "openjpeg", "{}: up to {} prefetch threads", self.name, threads);
            threads
        })
    }

    pub fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    pub fn overview(&self, index: usize) -> Result<&Dataset> {
        self.overviews.get(index).ok_or_else(|| {
            Jp2Error::BadArgument(format!(
                "overview index {} out of range, {} overviews",
                index,
                self.overviews.len()
            ))
        })
    }

    /// Fetch a band object for a dataset.
    ///
    /// Applies to raster datasets, and fetches the
    /// rasterband at the given _1-based_ index.
    pub fn rasterband(&self, band_index: usize) -> Result<RasterBand<'_>> {
        self.check_band(band_index)?;
        Ok(RasterBand::new(self, band_index))
    }

    fn check_band(&self, band: usize) -> Result<()> {
        if band == 0 || band > self.descriptor.band_count {
            return Err(Jp2Error::BadArgument(format!(
                "band {} out of range 1..={}",
                band, self.descriptor.band_count
            )));
        }
        Ok(())
    }

    /// Get the filled block of `band` at `tile`, decoding it on a cache miss.
    pub fn read_block(
        &self,
        band: usize,
        tile: TileCoordinate,
        bands: &BandSubset,
    ) -> Result<LockedBlock> {
        self.check_band(band)?;
        if !self.descriptor.contains_tile(tile) {
            return Err(Jp2Error::BadArgument(format!(
                "block {:?} outside of the block grid",
                tile
            )));
        }
        let mut block = self
            .cache
            .lock_or_create(self.block_key(band, tile), self.descriptor.block_bytes())?;
        if block.is_filled() {
            trace!(band, ?tile, "block cache hit");
            return Ok(block);
        }
        let mut file = self.file.lock();
        self.fill_block(&mut file, band, tile, &mut block, bands)?;
        Ok(block)
    }

    /// Decode the blocks of `window` on `band` in parallel, when the cache
    /// can hold them.
    ///
    /// `bands` are the bands about to be read, empty to let the memory
    /// budget decide. The result tells whether reads may fill the blocks of
    /// other bands with the tiles they decode.
    pub fn preload_blocks(
        &self,
        band: usize,
        window: PixelWindow,
        bands: &[usize],
    ) -> Result<Preload> {
        self.check_band(band)?;
        let descriptor = &self.descriptor;
        let request = AdmissionRequest {
            window,
            block_size: descriptor.block_size,
            pixel_bytes: descriptor.data_type.size_bytes(),
            band,
            requested_bands: bands,
            band_count: descriptor.band_count,
            strategy: descriptor.strategy,
            max_threads: self.num_threads(),
        };
        let admission = admit(&request, self.cache.budget());
        let other_bands_safe = admission.other_bands_safe();
        let Admission::Prefetch { bands: subset, .. } = admission else {
            return Ok(Preload {
                other_bands_safe,
                queued: 0,
                workers: 0,
            });
        };

        let tiles = prefetch::uncached_tiles(self, band, window.tiles(descriptor.block_size));
        if tiles.len() < 2 {
            return Ok(Preload {
                other_bands_safe: true,
                queued: tiles.len(),
                workers: 0,
            });
        }
        let job = PrefetchJob::new(band, subset, tiles);
        let workers = prefetch::run(self, &job, self.num_threads());
        Ok(Preload {
            other_bands_safe,
            queued: job.len(),
            workers,
        })
    }

    /// Read a window of several bands, one 'Buffer<T>' per band.
    ///
    /// # Arguments
    /// * window - the window position from top left
    /// * window_size - the window size (nearest neighbour resampling if window_size != size)
    /// * size - the desired size of each 'Buffer'
    /// * bands - 1-based band indices
    pub fn read_as<T: Copy + GdalType>(
        &self,
        window: (isize, isize),
        window_size: (usize, usize),
        size: (usize, usize),
        bands: &[usize],
    ) -> Result<Vec<Buffer<T>>> {
        let Some(&first) = bands.first() else {
            return Err(Jp2Error::BadArgument("no band requested".to_string()));
        };
        for &band in bands {
            self.check_band(band)?;
        }
        let window = checked_window(&self.descriptor, window, window_size)?;

        if (size.0 < window.width || size.1 < window.height) && !self.overviews.is_empty() {
            let overview_sizes: Vec<_> = self
                .overviews
                .iter()
                .map(|overview| overview.raster_size())
                .collect();
            if let Some((index, ovr_window)) =
                best_overview(self.raster_size(), &overview_sizes, window, size)
            {
                return self.overviews[index].read_as(
                    (ovr_window.x as isize, ovr_window.y as isize),
                    (ovr_window.width, ovr_window.height),
                    size,
                    bands,
                );
            }
        }

        let preload = self.preload_blocks(first, window, bands)?;
        bands
            .iter()
            .map(|&band| {
                let mut data = vec![T::default(); size.0 * size.1];
                read_window(
                    self,
                    band,
                    window,
                    size,
                    &mut data,
                    preload.other_bands_safe,
                )?;
                Ok(Buffer::new(size, data))
            })
            .collect()
    }

    fn block_key(&self, band: usize, tile: TileCoordinate) -> BlockKey {
        BlockKey {
            dataset: self.id,
            band,
            col: tile.col,
            row: tile.row,
        }
    }

    fn fill_block(
        &self,
        file: &mut VsiFile,
        band: usize,
        tile: TileCoordinate,
        block: &mut LockedBlock,
        bands: &BandSubset,
    ) -> Result<()> {
        let descriptor = &self.descriptor;
        let mut image =
            TileDecoder::new(self.codec.as_ref(), self.format, descriptor).decode(file, tile)?;
        let layout = descriptor.layout(tile);
        check_decoded(&image, descriptor, &layout)?;

        let reconstructor = ColorReconstructor {
            is_420: descriptor.is_420,
        };
        reconstructor.reconstruct_band(
            &mut image,
            band,
            descriptor.promoted[band - 1],
            &layout,
            block.data_mut(),
        );
        block.mark_filled();

        for sibling in bands.indices(descriptor.band_count) {
            if sibling == band || sibling == 0 || sibling > descriptor.band_count {
                continue;
            }
            // never wait here: the holder may be waiting for our block
            let mut other = match self
                .cache
                .try_lock_or_create(self.block_key(sibling, tile), layout.byte_len())
            {
                Ok(Some(other)) if !other.is_filled() => other,
                Ok(_) => continue,
                Err(e) => {
                    debug!(target: "openjpeg", "skipping band {}: {}", sibling, e);
                    continue;
                }
            };
            reconstructor.reconstruct_band(
                &mut image,
                sibling,
                descriptor.promoted[sibling - 1],
                &layout,
                other.data_mut(),
            );
            other.mark_filled();
        }
        Ok(())
    }
}

/// Reject decoded tiles that do not cover the block.
fn check_decoded(
    image: &DecodedImage,
    descriptor: &RasterDescriptor,
    layout: &BlockLayout,
) -> Result<()> {
    let (width, height) = layout.valid_size;
    if image.components.len() != descriptor.band_count {
        return Err(Jp2Error::DecodeFailed(format!(
            "{} components decoded, {} expected",
            image.components.len(),
            descriptor.band_count
        )));
    }
    let luma = &image.components[0];
    let malformed = image.components.iter().enumerate().any(|(index, component)| {
        let planar_ok = if descriptor.is_420 && index > 0 {
            component.width == (luma.width + 1) / 2 && component.height == (luma.height + 1) / 2
        } else {
            component.width >= width && component.height >= height
        };
        !planar_ok || component.data.len() < component.width * component.height
    });
    if malformed {
        return Err(Jp2Error::DecodeFailed(format!(
            "decoded tile does not cover the {}x{} block",
            width, height
        )));
    }
    Ok(())
}

/// Read the main header and derive the full resolution descriptor, along
/// with the number of resolutions of the codestream.
fn probe(
    codec: &dyn Codec,
    format: CodecFormat,
    file: &mut VsiFile,
    promote_1bit_alpha: bool,
) -> Result<(RasterDescriptor, usize)> {
    let (session, image) = Session::start(codec, format, file)?;
    let info = session
        .codec()
        .codestream_info()
        .map_err(|e| Jp2Error::HeaderUnreadable(e.0))?;
    drop(session);

    debug!(
        target: "openjpeg",
        x0 = image.x0,
        y0 = image.y0,
        x1 = image.x1,
        y1 = image.y1,
        components = image.components.len(),
        color_space = ?image.color_space,
        tile_width = info.tile_width,
        tile_height = info.tile_height,
        tiles_across = info.tiles_across,
        tiles_down = info.tiles_down,
        num_resolutions = info.num_resolutions,
        mct = info.mct,
        "codestream header"
    );

    let width = image.width();
    let height = image.height();
    let Some(first) = image.components.first() else {
        return Err(Jp2Error::UnsupportedLayout("no component".to_string()));
    };
    if width == 0 || height == 0 || first.width != width || first.height != height {
        return Err(Jp2Error::UnsupportedLayout(format!(
            "{}x{} image with a {}x{} first component",
            width, height, first.width, first.height
        )));
    }
    if info.tile_width == 0 || info.tile_height == 0 || info.tiles_across == 0 {
        return Err(Jp2Error::UnsupportedLayout("empty tile grid".to_string()));
    }

    let components = &image.components;
    let data_type = DataType::for_precision(first.precision, first.signed);
    let is_420 = image.color_space != ColorSpace::Srgb
        && data_type == DataType::Byte
        && components.len() == 3
        && components[1..]
            .iter()
            .all(|c| c.width == first.width / 2 && c.height == first.height / 2);
    if is_420 {
        debug!(target: "openjpeg", "420 format");
    } else if components
        .iter()
        .any(|c| c.width != first.width || c.height != first.height)
    {
        return Err(Jp2Error::UnsupportedLayout(
            "components of different sizes".to_string(),
        ));
    }

    let mut cap = config::tile_size_cap();
    if is_420 {
        // windows of subsampled chroma must start on an even pixel
        cap = (cap & !1).max(2);
    }
    let (strategy, block_size) =
        DecodeStrategy::select((width, height), (info.tile_width, info.tile_height), cap);

    let precisions: Vec<u8> = components.iter().map(|c| c.precision).collect();
    let promote_alpha = promote_1bit_alpha && precisions == [8, 8, 8, 1];
    if promote_alpha {
        debug!(target: "openjpeg", "Fourth (alpha) band is promoted from 1 bit to 8 bit");
    }
    let promoted: Vec<bool> = (1..=components.len())
        .map(|band| promote_alpha && band == 4)
        .collect();
    let band_bits = precisions
        .iter()
        .zip(&promoted)
        .map(|(&bits, &promoted)| if promoted { 8 } else { bits })
        .collect();

    let descriptor = RasterDescriptor {
        raster_size: (width, height),
        band_count: components.len(),
        data_type,
        band_bits,
        promoted,
        block_size,
        color_space: image.color_space,
        is_420,
        level: 0,
        strategy,
        tiles_across: info.tiles_across,
    };
    Ok((descriptor, info.num_resolutions))
}

impl PrefetchTarget for Dataset {
    fn resource_name(&self) -> &str {
        &self.name
    }

    fn cache(&self) -> &dyn BlockCache {
        self.cache.as_ref()
    }

    fn block_key(&self, band: usize, tile: TileCoordinate) -> BlockKey {
        Dataset::block_key(self, band, tile)
    }

    fn block_bytes(&self) -> usize {
        self.descriptor.block_bytes()
    }

    fn fill_block(
        &self,
        file: &mut VsiFile,
        band: usize,
        tile: TileCoordinate,
        block: &mut LockedBlock,
        bands: &BandSubset,
    ) -> Result<()> {
        Dataset::fill_block(self, file, band, tile, block, bands)
    }
}

impl TileSource for Dataset {
    fn descriptor(&self) -> &RasterDescriptor {
        &self.descriptor
    }

    fn read_block(
        &self,
        band: usize,
        tile: TileCoordinate,
        bands: &BandSubset,
    ) -> Result<LockedBlock> {
        Dataset::read_block(self, band, tile, bands)
    }

    fn preload_blocks(&self, band: usize, window: PixelWindow, bands: &[usize]) -> Result<Preload> {
        Dataset::preload_blocks(self, band, window, bands)
    }

    fn overview_count(&self) -> usize {
        self.overviews.len()
    }

    fn overview(&self, index: usize) -> Option<&dyn TileSource> {
        self.overviews
            .get(index)
            .map(|overview| overview as &dyn TileSource)
    }
}
