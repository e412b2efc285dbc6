//! Tiled JPEG2000 raster data

mod admission;
mod buffer;
mod color;
mod dataset;
mod decoder;
mod overview;
mod prefetch;
mod rasterband;
mod tile;
mod types;

pub use admission::{admit, Admission, AdmissionRequest};
pub use buffer::{Buffer, ByteBuffer};
pub use color::{
    clamp_0_255, copy_words, promote_1bit, ycbcr420_band, ycbcr_to_rgb, BlockLayout,
    ColorReconstructor,
};
pub use dataset::{Dataset, DatasetOptions, RasterDescriptor};
pub use decoder::{DecodeStrategy, TileDecoder};
pub use overview::{best_overview, build_ladder, LadderLevel, OVERVIEW_FLOOR};
pub use prefetch::{PrefetchJob, Preload};
pub use rasterband::{ColorInterpretation, RasterBand, TileSource};
pub use tile::{BandSubset, PixelWindow, TileCoordinate};
pub use types::{DataType, GdalType};
