//! Reduced resolution levels of a dataset.

use crate::raster::{DecodeStrategy, PixelWindow};

/// Levels stop once both dimensions are at most this many pixels.
pub const OVERVIEW_FLOOR: usize = 256;

/// Geometry of one overview level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderLevel {
    /// Resolution factor handed to the codec, 1 for the first overview.
    pub level: usize,
    pub raster_size: (usize, usize),
    pub block_size: (usize, usize),
    pub strategy: DecodeStrategy,
}

/// Derive the overview levels of a full resolution raster.
///
/// Each level halves the previous one, down to [`OVERVIEW_FLOOR`] or until
/// the codestream runs out of resolutions. In tile index mode the blocks are
/// halved with the raster, so odd block sizes end the ladder. In window mode
/// the block size is kept until a level becomes smaller than one block; that
/// level and the following ones are read as one whole tile.
pub fn build_ladder(
    raster_size: (usize, usize),
    block_size: (usize, usize),
    strategy: DecodeStrategy,
    num_resolutions: usize,
) -> Vec<LadderLevel> {
    let mut levels = Vec::new();
    let (mut width, mut height) = raster_size;
    let (mut block_width, mut block_height) = block_size;

    while levels.len() + 1 < num_resolutions
        && (width > OVERVIEW_FLOOR || height > OVERVIEW_FLOOR)
        && (strategy == DecodeStrategy::Window || (block_width % 2 == 0 && block_height % 2 == 0))
    {
        width /= 2;
        height /= 2;
        let mut level_strategy = strategy;
        match strategy {
            DecodeStrategy::TileIndex => {
                block_width /= 2;
                block_height /= 2;
            }
            DecodeStrategy::Window => {
                if width < block_width || height < block_height {
                    block_width = width;
                    block_height = height;
                    level_strategy = DecodeStrategy::TileIndex;
                }
            }
        }
        levels.push(LadderLevel {
            level: levels.len() + 1,
            raster_size: (width, height),
            block_size: (block_width, block_height),
            strategy: level_strategy,
        });
    }
    levels
}

/// Pick the overview best suited to read `window` into a buffer of
/// `buffer_size`.
///
/// An overview qualifies when its reduction is below 1.2 times the
/// requested one; the most reduced qualifying overview wins. Returns its
/// index into `overview_sizes` and the window in its pixel space.
pub fn best_overview(
    raster_size: (usize, usize),
    overview_sizes: &[(usize, usize)],
    window: PixelWindow,
    buffer_size: (usize, usize),
) -> Option<(usize, PixelWindow)> {
    if buffer_size.0 == 0 || buffer_size.1 == 0 || window.is_empty() {
        return None;
    }
    let x_ratio = window.width as f64 / buffer_size.0 as f64;
    let y_ratio = window.height as f64 / buffer_size.1 as f64;
    let desired = if x_ratio < y_ratio || buffer_size.1 == 1 {
        x_ratio
    } else {
        y_ratio
    };

    let mut best: Option<(usize, f64)> = None;
    for (index, &(width, height)) in overview_sizes.iter().enumerate() {
        if width == 0 || height == 0 {
            continue;
        }
        let reduction = (raster_size.0 as f64 / width as f64)
            .min(raster_size.1 as f64 / height as f64);
        if reduction < desired * 1.2 && best.map_or(true, |(_, found)| reduction > found) {
            best = Some((index, reduction));
        }
    }

    let (index, _) = best?;
    let (width, height) = overview_sizes[index];
    let x_res = raster_size.0 as f64 / width as f64;
    let y_res = raster_size.1 as f64 / height as f64;
    let x = ((window.x as f64 / x_res + 0.5) as usize).min(width - 1);
    let y = ((window.y as f64 / y_res + 0.5) as usize).min(height - 1);
    let w = ((window.width as f64 / x_res + 0.5) as usize).clamp(1, width - x);
    let h = ((window.height as f64 / y_res + 0.5) as usize).clamp(1, height - y);
    Some((index, PixelWindow::new((x, y), (w, h))))
}
