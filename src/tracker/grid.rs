use burn::tensor::{backend::Backend, Tensor};
use image::{GenericImage, Rgb, RgbImage};

use crate::error::{DdpmError, Result};

/// Convert a `[N, C, H, W]` batch in `[0, 1]` to 8-bit RGB images.
///
/// Single-channel batches are replicated to gray RGB.
pub fn to_rgb8<B: Backend>(images: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [n, c, h, w] = images.dims();
    if c != 1 && c != 3 {
        return Err(DdpmError::Tensor(format!("cannot render {c}-channel images")));
    }
    let values = images
        .clamp(0.0, 1.0)
        .into_data()
        .convert::<f32>()
        .into_vec::<f32>()
        .map_err(|err| DdpmError::Tensor(format!("{err:?}")))?;
    let plane = h * w;
    let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    let out = (0..n)
        .map(|i| {
            let base = i * c * plane;
            RgbImage::from_fn(w as u32, h as u32, |x, y| {
                let p = y as usize * w + x as usize;
                let px = |ch: usize| to_u8(values[base + ch.min(c - 1) * plane + p]);
                Rgb([px(0), px(1), px(2)])
            })
        })
        .collect();
    Ok(out)
}

/// Tile images row-major into a near-square grid.
pub fn make_grid(images: &[RgbImage]) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| DdpmError::Tensor("cannot build a grid from zero images".into()))?;
    let (w, h) = first.dimensions();
    let cols = (images.len() as f64).sqrt().ceil() as u32;
    let rows = (images.len() as u32).div_ceil(cols);
    let mut grid = RgbImage::new(cols * w, rows * h);
    for (i, img) in images.iter().enumerate() {
        let (x, y) = ((i as u32 % cols) * w, (i as u32 / cols) * h);
        grid.copy_from(img, x, y)
            .map_err(|err| DdpmError::Tensor(format!("grid tile {i}: {err}")))?;
    }
    Ok(grid)
}
