use std::ops::RangeInclusive;

/// Position of a block in the tile grid of one resolution level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub col: usize,
    pub row: usize,
}

impl TileCoordinate {
    pub fn new(col: usize, row: usize) -> Self {
        TileCoordinate { col, row }
    }
}

impl From<(usize, usize)> for TileCoordinate {
    fn from((col, row): (usize, usize)) -> Self {
        TileCoordinate { col, row }
    }
}

/// Bands a decoded tile is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandSubset {
    /// Every band of the dataset.
    All,
    /// The listed 1-based band indices, in order.
    Only(Vec<usize>),
}

impl BandSubset {
    pub fn single(band: usize) -> Self {
        BandSubset::Only(vec![band])
    }

    /// Resolve to band indices for a dataset of `band_count` bands.
    pub fn indices(&self, band_count: usize) -> Vec<usize> {
        match self {
            BandSubset::All => (1..=band_count).collect(),
            BandSubset::Only(bands) => bands.clone(),
        }
    }
}

/// Rectangle of pixels, offset and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    pub fn new(offset: (usize, usize), size: (usize, usize)) -> Self {
        PixelWindow {
            x: offset.0,
            y: offset.1,
            width: size.0,
            height: size.1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the window lies completely inside a raster of `size`.
    pub fn fits(&self, size: (usize, usize)) -> bool {
        self.x
            .checked_add(self.width)
            .is_some_and(|right| right <= size.0)
            && self
                .y
                .checked_add(self.height)
                .is_some_and(|bottom| bottom <= size.1)
    }

    /// Column and row ranges of the tiles touched by the window.
    ///
    /// Returns `None` for an empty window.
    pub fn tile_span(
        &self,
        tile_size: (usize, usize),
    ) -> Option<(RangeInclusive<usize>, RangeInclusive<usize>)> {
        if self.is_empty() {
            return None;
        }
        let (tile_width, tile_height) = tile_size;
        let cols = self.x / tile_width..=(self.x + self.width - 1) / tile_width;
        let rows = self.y / tile_height..=(self.y + self.height - 1) / tile_height;
        Some((cols, rows))
    }

    /// Number of tiles touched by the window.
    pub fn tile_count(&self, tile_size: (usize, usize)) -> usize {
        self.tile_span(tile_size)
            .map(|(cols, rows)| cols.count() * rows.count())
            .unwrap_or(0)
    }

    /// Every tile touched by the window, column by column.
    pub fn tiles(&self, tile_size: (usize, usize)) -> Vec<TileCoordinate> {
        let Some((cols, rows)) = self.tile_span(tile_size) else {
            return Vec::new();
        };
        cols.flat_map(|col| rows.clone().map(move |row| TileCoordinate { col, row }))
            .collect()
    }
}
