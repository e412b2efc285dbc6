use crate::block_cache::LockedBlock;
use crate::errors::*;
use crate::raster::overview::best_overview;
use crate::raster::prefetch::Preload;
use crate::raster::{
    BandSubset, Buffer, DataType, GdalType, PixelWindow, RasterDescriptor, TileCoordinate,
};

#[cfg(feature = "ndarray")]
use ndarray::Array2;

/// What a band needs from the dataset it belongs to.
pub trait TileSource: Sync {
    fn descriptor(&self) -> &RasterDescriptor;

    /// Get the filled block of `band` at `tile`, decoding it on a cache miss.
    ///
    /// The decoded tile also fills the blocks of the other bands in `bands`
    /// that are free.
    fn read_block(&self, band: usize, tile: TileCoordinate, bands: &BandSubset)
        -> Result<LockedBlock>;

    /// Warm the cache for a read of `window` on `band`.
    ///
    /// `bands` lists the bands the caller is about to read, empty to let the
    /// source decide.
    fn preload_blocks(&self, band: usize, window: PixelWindow, bands: &[usize])
        -> Result<Preload>;

    fn overview_count(&self) -> usize;

    fn overview(&self, index: usize) -> Option<&dyn TileSource>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorInterpretation {
    Undefined,
    GrayIndex,
    RedBand,
    GreenBand,
    BlueBand,
    AlphaBand,
}

impl ColorInterpretation {
    pub fn name(&self) -> &'static str {
        match self {
            ColorInterpretation::Undefined => "Undefined",
            ColorInterpretation::GrayIndex => "Gray",
            ColorInterpretation::RedBand => "Red",
            ColorInterpretation::GreenBand => "Green",
            ColorInterpretation::BlueBand => "Blue",
            ColorInterpretation::AlphaBand => "Alpha",
        }
    }
}

/// Represents a single band of a dataset.
///
/// This object carries the lifetime of the dataset that
/// contains it. This is necessary to prevent the dataset
/// from being dropped before the band.
pub struct RasterBand<'a> {
    source: &'a dyn TileSource,
    band: usize,
}

impl<'a> RasterBand<'a> {
    pub(crate) fn new(source: &'a dyn TileSource, band: usize) -> Self {
        RasterBand { source, band }
    }

    /// 1-based index of the band in its dataset.
    pub fn index(&self) -> usize {
        self.band
    }

    fn descriptor(&self) -> &'a RasterDescriptor {
        self.source.descriptor()
    }

    /// Get block size from a 'Dataset'.
    pub fn block_size(&self) -> (usize, usize) {
        self.descriptor().block_size
    }

    /// Get x-size of the band
    pub fn x_size(&self) -> usize {
        self.descriptor().raster_size.0
    }

    /// Get y-size of the band
    pub fn y_size(&self) -> usize {
        self.descriptor().raster_size.1
    }

    /// Get dimensions of the band.
    /// Note that this may not be the same as `size` on the
    /// `owning_dataset` due to scale.
    pub fn size(&self) -> (usize, usize) {
        (self.x_size(), self.y_size())
    }

    pub fn band_type(&self) -> DataType {
        self.descriptor().data_type
    }

    /// Significant bits of the samples.
    pub fn nbits(&self) -> u8 {
        self.descriptor().band_bits[self.band - 1]
    }

    pub fn color_interpretation(&self) -> ColorInterpretation {
        self.descriptor().color_interpretation(self.band)
    }

    pub fn overview_count(&self) -> usize {
        self.source.overview_count()
    }

    /// The same band on overview level `index`.
    pub fn overview(&self, index: usize) -> Result<RasterBand<'a>> {
        let source = self.source.overview(index).ok_or_else(|| {
            Jp2Error::BadArgument(format!(
                "overview index {} out of range, {} overviews",
                index,
                self.overview_count()
            ))
        })?;
        Ok(RasterBand::new(source, self.band))
    }

    /// Get actual block size (at the edges) when block size
    /// does not divide band size.
    pub fn actual_block_size(&self, offset: (isize, isize)) -> Result<(usize, usize)> {
        let tile = self.tile(offset)?;
        Ok(self.descriptor().valid_block_size(tile))
    }

    fn tile(&self, offset: (isize, isize)) -> Result<TileCoordinate> {
        let descriptor = self.descriptor();
        let (cols, rows) = descriptor.block_grid();
        match (usize::try_from(offset.0), usize::try_from(offset.1)) {
            (Ok(col), Ok(row)) if col < cols && row < rows => Ok(TileCoordinate { col, row }),
            _ => Err(Jp2Error::BadArgument(format!(
                "block ({}, {}) outside of the {}x{} block grid",
                offset.0, offset.1, cols, rows
            ))),
        }
    }

    /// Read a 'Buffer<T>' holding a whole block. T implements 'GdalType'
    ///
    /// Edge blocks keep the full block size; only their
    /// [`actual_block_size`](Self::actual_block_size) part is image data.
    pub fn read_block<T: Copy + GdalType>(&self, block_index: (usize, usize)) -> Result<Buffer<T>> {
        let tile = self.tile((block_index.0 as isize, block_index.1 as isize))?;
        let size = self.block_size();
        let data_type = self.band_type();
        let block = self.source.read_block(self.band, tile, &BandSubset::All)?;
        let data = (0..size.0 * size.1)
            .map(|index| T::from_sample(data_type.read_sample(block.data(), index)))
            .collect();
        Ok(Buffer::new(size, data))
    }

    /// Read data from this band into a slice. T implements 'GdalType'
    ///
    /// # Arguments
    /// * window - the window position from top left
    /// * window_size - the window size (nearest neighbour resampling if window_size != buffer_size)
    /// * size - the desired size to read
    /// * buffer - a slice to hold the data (length must equal product of size parameter)
    pub fn read_into_slice<T: Copy + GdalType>(
        &self,
        window: (isize, isize),
        window_size: (usize, usize),
        size: (usize, usize),
        buffer: &mut [T],
    ) -> Result<()> {
        let pixels = size.0 * size.1;
        assert_eq!(buffer.len(), pixels);
        let window = checked_window(self.descriptor(), window, window_size)?;

        if (size.0 < window.width || size.1 < window.height) && self.overview_count() > 0 {
            let overview_sizes: Vec<_> = (0..self.overview_count())
                .filter_map(|index| self.source.overview(index))
                .map(|overview| overview.descriptor().raster_size)
                .collect();
            if let Some((index, ovr_window)) =
                best_overview(self.size(), &overview_sizes, window, size)
            {
                return self.overview(index)?.read_into_slice(
                    (ovr_window.x as isize, ovr_window.y as isize),
                    (ovr_window.width, ovr_window.height),
                    size,
                    buffer,
                );
            }
        }

        let preload = self.source.preload_blocks(self.band, window, &[])?;
        read_window(
            self.source,
            self.band,
            window,
            size,
            buffer,
            preload.other_bands_safe,
        )
    }

    /// Read a 'Buffer<T>' from this band. T implements 'GdalType'
    ///
    /// # Arguments
    /// * window - the window position from top left
    /// * window_size - the window size (nearest neighbour resampling if window_size != buffer_size)
    /// * buffer_size - the desired size of the 'Buffer'
    pub fn read_as<T: Copy + GdalType>(
        &self,
        window: (isize, isize),
        window_size: (usize, usize),
        size: (usize, usize),
    ) -> Result<Buffer<T>> {
        let mut data = vec![T::default(); size.0 * size.1];
        self.read_into_slice(window, window_size, size, &mut data)?;
        Ok(Buffer::new(size, data))
    }

    #[cfg(feature = "ndarray")]
    /// Read a 'Array2<T>' from this band. T implements 'GdalType'.
    ///
    /// # Arguments
    /// * window - the window position from top left
    /// * window_size - the window size (nearest neighbour resampling if window_size != array_size)
    /// * array_size - the desired size of the 'Array'
    /// # Docs
    /// The Matrix shape is (rows, cols) and raster shape is (cols in x-axis, rows in y-axis).
    pub fn read_as_array<T: Copy + GdalType>(
        &self,
        window: (isize, isize),
        window_size: (usize, usize),
        array_size: (usize, usize),
    ) -> Result<Array2<T>> {
        self.read_as::<T>(window, window_size, array_size)?.to_array()
    }

    /// Read the full band as a 'Buffer<T>'.
    pub fn read_band_as<T: Copy + GdalType>(&self) -> Result<Buffer<T>> {
        let size = self.size();
        self.read_as::<T>((0, 0), size, size)
    }
}

/// Validate a window against the raster of `descriptor`.
pub(crate) fn checked_window(
    descriptor: &RasterDescriptor,
    offset: (isize, isize),
    size: (usize, usize),
) -> Result<PixelWindow> {
    let window = match (usize::try_from(offset.0), usize::try_from(offset.1)) {
        (Ok(x), Ok(y)) => PixelWindow::new((x, y), size),
        _ => {
            return Err(Jp2Error::BadArgument(format!(
                "negative window offset ({}, {})",
                offset.0, offset.1
            )))
        }
    };
    if !window.fits(descriptor.raster_size) {
        return Err(Jp2Error::BadArgument(format!(
            "window {:?} outside of the {}x{} raster",
            window, descriptor.raster_size.0, descriptor.raster_size.1
        )));
    }
    Ok(window)
}

/// Source position of buffer pixel `index` when `window_len` pixels are
/// resampled to `buffer_len`, nearest neighbour.
fn nearest(index: usize, window_len: usize, buffer_len: usize) -> usize {
    ((2 * index + 1) * window_len / (2 * buffer_len)).min(window_len - 1)
}

/// Copy `window` of `band` into `buffer`, block by block.
pub(crate) fn read_window<T: GdalType>(
    source: &dyn TileSource,
    band: usize,
    window: PixelWindow,
    size: (usize, usize),
    buffer: &mut [T],
    other_bands_safe: bool,
) -> Result<()> {
    let descriptor = source.descriptor();
    let (block_width, block_height) = descriptor.block_size;
    let data_type = descriptor.data_type;
    let Some((cols, rows)) = window.tile_span(descriptor.block_size) else {
        return Ok(());
    };
    if size.0 == 0 || size.1 == 0 {
        return Ok(());
    }
    let bands = if other_bands_safe {
        BandSubset::All
    } else {
        BandSubset::single(band)
    };

    let src_x: Vec<usize> = (0..size.0)
        .map(|i| window.x + nearest(i, window.width, size.0))
        .collect();
    let src_y: Vec<usize> = (0..size.1)
        .map(|j| window.y + nearest(j, window.height, size.1))
        .collect();
    // source positions grow with the buffer position, so every block maps to
    // a contiguous run of buffer rows and columns
    let run = |positions: &[usize], start: usize, end: usize| {
        positions.partition_point(|&p| p < start)..positions.partition_point(|&p| p < end)
    };

    for row in rows {
        let y_run = run(&src_y, row * block_height, (row + 1) * block_height);
        if y_run.is_empty() {
            continue;
        }
        for col in cols.clone() {
            let x_run = run(&src_x, col * block_width, (col + 1) * block_width);
            if x_run.is_empty() {
                continue;
            }
            let block = source.read_block(band, TileCoordinate { col, row }, &bands)?;
            let data = block.data();
            for j in y_run.clone() {
                let block_row = (src_y[j] - row * block_height) * block_width;
                for i in x_run.clone() {
                    let index = block_row + src_x[i] - col * block_width;
                    buffer[j * size.0 + i] = T::from_sample(data_type.read_sample(data, index));
                }
            }
        }
    }
    Ok(())
}
