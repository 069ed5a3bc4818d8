use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{DdpmError, Result};

/// Random-access source of square CHW images normalized to `[-1, 1]`.
pub trait ImageDataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn channels(&self) -> usize;

    fn resolution(&self) -> usize;

    /// Pixel values of item `index`, flattened CHW. `rng` drives random augmentation.
    fn image(&self, index: usize, rng: &mut StdRng) -> Result<Vec<f32>>;
}

/// Resize, crop and flip applied to every decoded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    pub resolution: usize,
    /// Center crop when set, otherwise a random crop.
    pub center_crop: bool,
    pub random_flip: bool,
}

impl ImageTransform {
    /// Shorter side resized to `resolution` (bilinear), then cropped square.
    pub fn apply(&self, img: &DynamicImage, rng: &mut StdRng) -> RgbImage {
        let rgb = img.to_rgb8();
        let res = self.resolution as u32;
        let (w, h) = rgb.dimensions();
        let scale = res as f64 / w.min(h) as f64;
        let nw = ((w as f64 * scale).round() as u32).max(res);
        let nh = ((h as f64 * scale).round() as u32).max(res);
        let resized = imageops::resize(&rgb, nw, nh, FilterType::Triangle);

        let (x, y) = if self.center_crop {
            ((nw - res) / 2, (nh - res) / 2)
        } else {
            (rng.gen_range(0..=nw - res), rng.gen_range(0..=nh - res))
        };
        let cropped = imageops::crop_imm(&resized, x, y, res, res).to_image();
        if self.random_flip && rng.gen_bool(0.5) {
            imageops::flip_horizontal(&cropped)
        } else {
            cropped
        }
    }
}

/// Interleaved RGB pixels to planar CHW in `[-1, 1]`.
pub fn rgb_to_chw(img: &RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut data = vec![0.0f32; plane * 3];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (pixel[c] as f32 / 255.0) * 2.0 - 1.0;
        }
    }
    data
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

/// Every image file found directly inside a directory, in sorted order.
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    paths: Vec<PathBuf>,
    transform: ImageTransform,
}

impl ImageFolderDataset {
    pub fn open(root: impl AsRef<Path>, transform: ImageTransform) -> Result<Self> {
        let root = root.as_ref();
        let mut paths = Vec::new();
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if path.is_file() && is_image {
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return Err(DdpmError::Dataset(format!("no images found in {}", root.display())));
        }
        paths.sort();
        tracing::info!("found {} images in {}", paths.len(), root.display());
        Ok(Self { paths, transform })
    }

    pub fn paths(&self) -> &[PathBuf] { &self.paths }
}

impl ImageDataset for ImageFolderDataset {
    fn len(&self) -> usize { self.paths.len() }
    fn channels(&self) -> usize { 3 }
    fn resolution(&self) -> usize { self.transform.resolution }

    fn image(&self, index: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
        let path = self
            .paths
            .get(index)
            .ok_or_else(|| DdpmError::Dataset(format!("index {index} out of bounds ({})", self.paths.len())))?;
        let img = image::open(path)?;
        Ok(rgb_to_chw(&self.transform.apply(&img, rng)))
    }
}

/// Preloaded CHW images, mostly useful for tests and synthetic data.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    images: Vec<Vec<f32>>,
    channels: usize,
    resolution: usize,
}

impl InMemoryDataset {
    pub fn new(images: Vec<Vec<f32>>, channels: usize, resolution: usize) -> Result<Self> {
        let expected = channels * resolution * resolution;
        if let Some((i, img)) = images.iter().enumerate().find(|(_, img)| img.len() != expected) {
            return Err(DdpmError::Dataset(format!(
                "image {i} has {} values, expected {expected}",
                img.len()
            )));
        }
        Ok(Self { images, channels, resolution })
    }
}

impl ImageDataset for InMemoryDataset {
    fn len(&self) -> usize { self.images.len() }
    fn channels(&self) -> usize { self.channels }
    fn resolution(&self) -> usize { self.resolution }

    fn image(&self, index: usize, _rng: &mut StdRng) -> Result<Vec<f32>> {
        self.images
            .get(index)
            .cloned()
            .ok_or_else(|| DdpmError::Dataset(format!("index {index} out of bounds ({})", self.images.len())))
    }
}
