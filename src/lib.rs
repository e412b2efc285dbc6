//! Block-parallel reading of tiled JPEG2000 rasters.
//!
//! A [`Dataset`] exposes a JPEG2000 codestream (raw or in a JP2 container) as
//! a raster of fixed-size blocks, one per codestream tile, or one per window
//! of a single large tile. Decoding is delegated to an implementation of
//! [`codec::Codec`]; decoded blocks are kept in a [`block_cache::BlockCache`]
//! and windowed reads spanning several blocks decode them on worker threads
//! first. Reduced resolution levels are exposed as overviews.
//!
//! ## Use
//!
//! ```no_run
//! use std::sync::Arc;
//! use jp2_tiles::codec::Codec;
//! use jp2_tiles::Dataset;
//!
//! fn mean(codec: Arc<dyn Codec>) -> jp2_tiles::errors::Result<f64> {
//!     let dataset = Dataset::open("/data/scene.jp2", codec)?;
//!     let band = dataset.rasterband(1)?;
//!     let buffer = band.read_band_as::<u8>()?;
//!     let sum: f64 = buffer.data.iter().map(|&v| v as f64).sum();
//!     Ok(sum / buffer.data.len() as f64)
//! }
//! ```
//!
//! Behavior can be tuned with the options of the [`config`] module, e.g.
//! `GDAL_NUM_THREADS` and `GDAL_CACHEMAX`. Diagnostics are emitted through
//! [`tracing`] under the `openjpeg` target.

#![crate_name = "jp2_tiles"]
#![crate_type = "lib"]

pub mod block_cache;
pub mod codec;
pub mod config;
pub mod errors;
pub mod raster;
pub mod vsi;

#[cfg(test)]
mod test_utils;

pub use block_cache::{BlockCache, LruBlockCache};
pub use raster::{Dataset, DatasetOptions, RasterBand};
