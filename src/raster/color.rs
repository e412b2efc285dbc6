//! Conversion of decoded components into band blocks.
//!
//! The codec hands back one plane of `i32` samples per component. A band
//! block is produced from it in one of three ways: YCbCr 4:2:0 upsampling
//! to RGB, 0/1 to 0/255 promotion of a 1-bit alpha plane followed by a
//! plain copy, or a plain copy narrowing the samples to the band type.

use crate::codec::{DecodedImage, ImageComponent};
use crate::raster::DataType;

pub fn clamp_0_255(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// BT.601 YCbCr to RGB for one pixel, saturating to `[0, 255]`.
pub fn ycbcr_to_rgb(y: i32, cb: i32, cr: i32) -> [u8; 3] {
    let (y, cb, cr) = (y as f64, (cb - 128) as f64, (cr - 128) as f64);
    [
        clamp_0_255((y + 1.402 * cr) as i32),
        clamp_0_255((y - 0.34414 * cb - 0.71414 * cr) as i32),
        clamp_0_255((y + 1.772 * cb) as i32),
    ]
}

/// Layout of the destination block and how much of it holds image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub data_type: DataType,
    /// Full block size, `(cols, rows)`.
    pub block_size: (usize, usize),
    /// Part of the block inside the raster, `(cols, rows)`.
    pub valid_size: (usize, usize),
}

impl BlockLayout {
    pub fn byte_len(&self) -> usize {
        self.block_size.0 * self.block_size.1 * self.data_type.size_bytes()
    }
}

/// Fill `dst` with the red, green or blue plane (`band` 1, 2 or 3) of a
/// YCbCr 4:2:0 image.
///
/// # Panics
/// If the chroma planes are not half the size of the luma plane, or the
/// luma plane does not cover the valid part of the block.
pub fn ycbcr420_band(image: &DecodedImage, band: usize, layout: &BlockLayout, dst: &mut [u8]) {
    assert!((1..=3).contains(&band), "4:2:0 images only have 3 bands");
    assert_eq!(layout.data_type, DataType::Byte);
    let [luma, cb, cr] = match &image.components[..] {
        [luma, cb, cr] => [luma, cb, cr],
        _ => panic!("4:2:0 image with {} components", image.components.len()),
    };
    let (width, height) = layout.valid_size;
    assert!(luma.width >= width && luma.height >= height);
    for chroma in [cb, cr] {
        assert_eq!(chroma.width, (luma.width + 1) / 2);
        assert_eq!(chroma.height, (luma.height + 1) / 2);
    }

    let stride = layout.block_size.0;
    for j in 0..height {
        for i in 0..width {
            let rgb = ycbcr_to_rgb(
                luma.sample(i, j),
                cb.sample(i / 2, j / 2),
                cr.sample(i / 2, j / 2),
            );
            dst[j * stride + i] = rgb[band - 1];
        }
    }
}

/// Turn the 0/1 samples of a 1-bit plane into 0/255, in place.
pub fn promote_1bit(component: &mut ImageComponent, valid_size: (usize, usize)) {
    let (width, height) = valid_size;
    let stride = component.width;
    if stride == 0 {
        return;
    }
    for row in component.data.chunks_mut(stride).take(height) {
        for sample in &mut row[..width] {
            *sample *= 255;
        }
    }
}

/// Copy the valid samples of `component` into `dst`, converted to the block
/// data type.
///
/// A plane with exactly the block dimensions is copied in one run, anything
/// else row by row since the plane stride then differs from the block stride.
pub fn copy_words(component: &ImageComponent, layout: &BlockLayout, dst: &mut [u8]) {
    let (width, height) = layout.valid_size;
    assert!(
        component.width >= width && component.height >= height,
        "decoded plane {}x{} smaller than {}x{}",
        component.width,
        component.height,
        width,
        height
    );
    let data_type = layout.data_type;
    let (block_width, block_height) = layout.block_size;
    if width == 0 || height == 0 {
        return;
    }

    if component.width == block_width && component.height == block_height {
        for (index, &value) in component.data[..block_width * block_height]
            .iter()
            .enumerate()
        {
            data_type.write_sample(dst, index, value);
        }
    } else {
        for (j, row) in component.data.chunks(component.width).take(height).enumerate() {
            for (i, &value) in row[..width].iter().enumerate() {
                data_type.write_sample(dst, j * block_width + i, value);
            }
        }
    }
}

/// Produces band blocks from decoded images of one dataset.
#[derive(Debug, Clone, Copy)]
pub struct ColorReconstructor {
    pub is_420: bool,
}

impl ColorReconstructor {
    /// Write band `band` (1-based) of `image` into `dst`.
    ///
    /// `promote` is the band's 1-bit alpha promotion flag; the sample values
    /// themselves never trigger it.
    pub fn reconstruct_band(
        &self,
        image: &mut DecodedImage,
        band: usize,
        promote: bool,
        layout: &BlockLayout,
        dst: &mut [u8],
    ) {
        assert!(dst.len() >= layout.byte_len());
        if self.is_420 {
            ycbcr420_band(image, band, layout, dst);
            return;
        }
        let component = &mut image.components[band - 1];
        if promote {
            promote_1bit(component, layout.valid_size);
        }
        copy_words(component, layout, dst);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::codec::ColorSpace;

    fn plane(
        width: usize,
        height: usize,
        precision: u8,
        f: impl Fn(usize, usize) -> i32,
    ) -> ImageComponent {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        ImageComponent {
            dx: 1,
            dy: 1,
            width,
            height,
            precision,
            signed: false,
            data,
        }
    }

    fn image(components: Vec<ImageComponent>) -> DecodedImage {
        DecodedImage {
            x0: 0,
            y0: 0,
            x1: components[0].width,
            y1: components[0].height,
            color_space: ColorSpace::Sycc,
            components,
        }
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_0_255(-1), 0);
        assert_eq!(clamp_0_255(128), 128);
        assert_eq!(clamp_0_255(1000), 255);
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        assert_eq!(ycbcr_to_rgb(90, 128, 128), [90, 90, 90]);
        assert_eq!(ycbcr_to_rgb(255, 0, 255), [255, 208, 28]);
    }

    #[test]
    fn test_ycbcr420_samples_half_resolution_chroma() {
        let luma = plane(16, 16, 8, |x, y| (x * 16 + y) as i32);
        let mut cb = plane(8, 8, 8, |_, _| 128);
        let mut cr = plane(8, 8, 8, |_, _| 128);
        cb.dx = 2;
        cb.dy = 2;
        cr.dx = 2;
        cr.dy = 2;
        // only the chroma sample at (7, 7) shifts the colours of pixel (15, 15)
        let at = 7 * 8 + 7;
        cb.data[at] = 200;
        cr.data[at] = 60;
        let image = image(vec![luma, cb, cr]);
        let layout = BlockLayout {
            data_type: DataType::Byte,
            block_size: (16, 16),
            valid_size: (16, 16),
        };

        let expected = ycbcr_to_rgb(255, 200, 60);
        for band in 1..=3 {
            let mut dst = vec![0_u8; 256];
            ycbcr420_band(&image, band, &layout, &mut dst);
            assert_eq!(dst[15 * 16 + 15], expected[band - 1]);
            let shifted = ycbcr_to_rgb(14 * 16 + 14, 200, 60);
            assert_eq!(dst[14 * 16 + 14], shifted[band - 1]);
            // (13, 13) reads chroma (6, 6), which is neutral
            assert_eq!(dst[13 * 16 + 13], (13 * 16 + 13) as u8);
        }
    }

    #[test]
    fn test_ycbcr420_partial_block() {
        let luma = plane(6, 6, 8, |_, _| 50);
        let cb = plane(3, 3, 8, |_, _| 128);
        let cr = plane(3, 3, 8, |_, _| 128);
        let image = image(vec![luma, cb, cr]);
        let layout = BlockLayout {
            data_type: DataType::Byte,
            block_size: (8, 8),
            valid_size: (5, 4),
        };
        let mut dst = vec![0_u8; 64];
        ycbcr420_band(&image, 2, &layout, &mut dst);
        assert_eq!(dst[3 * 8 + 4], 50);
        assert_eq!(dst[3 * 8 + 5], 0);
        assert_eq!(dst[4 * 8], 0);
    }

    #[test]
    fn test_promotion_is_driven_by_flag() {
        let layout = BlockLayout {
            data_type: DataType::Byte,
            block_size: (4, 2),
            valid_size: (4, 2),
        };
        let reconstructor = ColorReconstructor { is_420: false };
        let bits = |x: usize, _| (x % 2) as i32;

        let mut promoted = image(vec![plane(4, 2, 1, bits)]);
        let mut dst = vec![0_u8; 8];
        reconstructor.reconstruct_band(&mut promoted, 1, true, &layout, &mut dst);
        assert_eq!(dst, [0, 255, 0, 255, 0, 255, 0, 255]);

        // same data, flag off: untouched
        let mut plain = image(vec![plane(4, 2, 1, bits)]);
        reconstructor.reconstruct_band(&mut plain, 1, false, &layout, &mut dst);
        assert_eq!(dst, [0, 1, 0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn test_copy_words_bulk() {
        let component = plane(3, 2, 16, |x, y| (x + 10 * y) as i32 * 1000);
        let layout = BlockLayout {
            data_type: DataType::UInt16,
            block_size: (3, 2),
            valid_size: (3, 2),
        };
        let mut dst = vec![0_u8; layout.byte_len()];
        copy_words(&component, &layout, &mut dst);
        let values: Vec<i64> = (0..6).map(|i| DataType::UInt16.read_sample(&dst, i)).collect();
        assert_eq!(values, [0, 1000, 2000, 10000, 11000, 12000]);
    }

    #[test]
    fn test_copy_words_respects_strides() {
        // decoded plane padded past the image edge
        let component = plane(4, 4, 8, |x, y| (x + 4 * y) as i32);
        let layout = BlockLayout {
            data_type: DataType::Int16,
            block_size: (8, 8),
            valid_size: (3, 2),
        };
        let mut dst = vec![0_u8; layout.byte_len()];
        copy_words(&component, &layout, &mut dst);
        let at = |x: usize, y: usize| DataType::Int16.read_sample(&dst, y * 8 + x);
        assert_eq!(at(2, 0), 2);
        assert_eq!(at(0, 1), 4);
        assert_eq!(at(2, 1), 6);
        assert_eq!(at(3, 0), 0);
        assert_eq!(at(0, 2), 0);
    }

    #[test]
    fn test_copy_words_saturates() {
        let component = plane(2, 1, 12, |x, _| if x == 0 { -20 } else { 4095 });
        let layout = BlockLayout {
            data_type: DataType::Byte,
            block_size: (2, 1),
            valid_size: (2, 1),
        };
        let mut dst = vec![0_u8; 2];
        copy_words(&component, &layout, &mut dst);
        assert_eq!(dst, [0, 255]);
    }

    #[test]
    #[should_panic(expected = "smaller than")]
    fn test_copy_words_rejects_short_plane() {
        let component = plane(2, 2, 8, |_, _| 0);
        let layout = BlockLayout {
            data_type: DataType::Byte,
            block_size: (4, 4),
            valid_size: (3, 3),
        };
        let mut dst = vec![0_u8; 16];
        copy_words(&component, &layout, &mut dst);
    }

    proptest! {
        #[test]
        fn ycbcr_never_escapes_byte_range(y in 0..=255_i32, cb in 0..=255_i32, cr in 0..=255_i32) {
            let direct = [
                (y as f64 + 1.402 * (cr - 128) as f64) as i32,
                (y as f64 - 0.34414 * (cb - 128) as f64 - 0.71414 * (cr - 128) as f64) as i32,
                (y as f64 + 1.772 * (cb - 128) as f64) as i32,
            ];
            let rgb = ycbcr_to_rgb(y, cb, cr);
            for (channel, raw) in rgb.iter().zip(direct) {
                prop_assert_eq!(*channel as i32, raw.clamp(0, 255));
            }
        }

        #[test]
        fn one_bit_promotion(bits in proptest::collection::vec(0..=1_i32, 12)) {
            let mut component = plane(4, 3, 1, |x, y| bits[y * 4 + x]);
            promote_1bit(&mut component, (4, 3));
            for (promoted, bit) in component.data.iter().zip(&bits) {
                prop_assert_eq!(*promoted, if *bit == 1 { 255 } else { 0 });
            }
        }
    }
}
