//! Memory admission for parallel prefetching.

use crate::raster::{BandSubset, DecodeStrategy, PixelWindow};

/// Everything the admission decision depends on, apart from the cache budget.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'b> {
    pub window: PixelWindow,
    pub block_size: (usize, usize),
    pub pixel_bytes: usize,
    /// 1-based band the read was issued for.
    pub band: usize,
    /// Bands requested by the caller, empty to let the controller decide.
    pub requested_bands: &'b [usize],
    pub band_count: usize,
    pub strategy: DecodeStrategy,
    pub max_threads: usize,
}

impl AdmissionRequest<'_> {
    /// Bytes needed to cache one band of every block touched by the window.
    pub fn required_bytes(&self) -> u128 {
        self.window.tile_count(self.block_size) as u128
            * self.block_size.0 as u128
            * self.block_size.1 as u128
            * self.pixel_bytes as u128
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Prefetching does not apply; reads decode blocks on demand.
    NoPrefetch,
    /// The requested bands would not fit in the cache.
    OverBudget,
    /// Prefetch the window for `bands`.
    Prefetch {
        bands: BandSubset,
        /// Whether the bands that were not asked for fit in the cache too.
        siblings_fit: bool,
    },
}

impl Admission {
    /// Whether decoded tiles may fill the blocks of every band, not only the
    /// requested one.
    pub fn other_bands_safe(&self) -> bool {
        match self {
            Admission::NoPrefetch => true,
            Admission::OverBudget => false,
            Admission::Prefetch { siblings_fit, .. } => *siblings_fit,
        }
    }

    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::OverBudget)
    }
}

/// Decide whether the window of `request` may be prefetched with a cache of
/// `budget` bytes, and for which bands.
///
/// When the caller leaves the band choice open, all bands are prefetched if
/// they fit, otherwise only the requested band and sibling bands are left
/// alone.
pub fn admit(request: &AdmissionRequest<'_>, budget: usize) -> Admission {
    if request.strategy == DecodeStrategy::Window || request.max_threads <= 1 {
        return Admission::NoPrefetch;
    }

    let required = request.required_bytes();
    let budget = budget as u128;
    let requested = request.requested_bands.len();
    if required > budget / requested.max(1) as u128 {
        return Admission::OverBudget;
    }

    if requested > 0 {
        return Admission::Prefetch {
            bands: BandSubset::Only(request.requested_bands.to_vec()),
            siblings_fit: true,
        };
    }
    if required <= budget / request.band_count.max(1) as u128 {
        Admission::Prefetch {
            bands: BandSubset::All,
            siblings_fit: true,
        }
    } else {
        Admission::Prefetch {
            bands: BandSubset::single(request.band),
            siblings_fit: false,
        }
    }
}
