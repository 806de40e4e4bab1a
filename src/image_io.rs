//! Decoding images into `[C, H, W]` tensors in `[0, 1]` and writing tensors back out.

use std::path::Path;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};

use crate::error::{Error, Result};

/// Pixel layout matching a channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageMode {
    L,
    Rgb,
    Rgba,
}

impl ImageMode {
    pub fn from_channels(channels: usize) -> Result<Self> {
        match channels {
            1 => Ok(ImageMode::L),
            3 => Ok(ImageMode::Rgb),
            4 => Ok(ImageMode::Rgba),
            other => Err(Error::UnsupportedImage(format!(
                "{other} channels (expected 1, 3 or 4)"
            ))),
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            ImageMode::L => 1,
            ImageMode::Rgb => 3,
            ImageMode::Rgba => 4,
        }
    }
}

/// Planar `[C, H, W]` pixels scaled to `[0, 1]`.
pub fn to_chw(img: &DynamicImage, mode: ImageMode) -> Vec<f32> {
    let (raw, channels) = match mode {
        ImageMode::L => (img.to_luma8().into_raw(), 1),
        ImageMode::Rgb => (img.to_rgb8().into_raw(), 3),
        ImageMode::Rgba => (img.to_rgba8().into_raw(), 4),
    };
    let pixels = raw.len() / channels;

    let mut data = vec![Vec::with_capacity(pixels); channels];
    for pixel in raw.chunks_exact(channels) {
        for (plane, &value) in data.iter_mut().zip(pixel) {
            plane.push(value as f32 / 255.0);
        }
    }
    data.into_iter().flatten().collect()
}

pub fn image_to_tensor<B: Backend>(
    img: &DynamicImage,
    mode: ImageMode,
    device: &B::Device,
) -> Tensor<B, 3> {
    let shape = [mode.channels(), img.height() as usize, img.width() as usize];
    Tensor::from_data(TensorData::new(to_chw(img, mode), shape), device)
}

/// Scale so the shorter edge equals `size`, keeping the aspect ratio.
pub fn resize_shorter_edge(img: &DynamicImage, size: u32) -> DynamicImage {
    let (width, height) = (img.width(), img.height());
    let (new_width, new_height) = if width <= height {
        (size, (size as u64 * height as u64 / width as u64) as u32)
    } else {
        ((size as u64 * width as u64 / height as u64) as u32, size)
    };
    if (new_width, new_height) == (width, height) {
        return img.clone();
    }
    img.resize_exact(new_width, new_height, FilterType::Triangle)
}

/// Central `size × size` window.
pub fn center_crop(img: &DynamicImage, size: u32) -> DynamicImage {
    let left = ((img.width().saturating_sub(size)) as f32 / 2.0).round() as u32;
    let top = ((img.height().saturating_sub(size)) as f32 / 2.0).round() as u32;
    img.crop_imm(left, top, size.min(img.width()), size.min(img.height()))
}

/// Resize the shorter edge to `size`, then take the central square.
pub fn resize_and_center_crop(img: &DynamicImage, size: u32) -> DynamicImage {
    center_crop(&resize_shorter_edge(img, size), size)
}

/// Trim so both sides are multiples of `multiple`, keeping the centre.
pub fn crop_to_multiple(img: &DynamicImage, multiple: u32) -> DynamicImage {
    if multiple <= 1 {
        return img.clone();
    }
    let (width, height) = (img.width(), img.height());
    let new_width = width - width % multiple;
    let new_height = height - height % multiple;
    img.crop_imm(
        (width - new_width) / 2,
        (height - new_height) / 2,
        new_width,
        new_height,
    )
}

/// Convert a `[C, H, W]` tensor in `[0, 1]` back to an image, clamping out-of-range values.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 3>) -> Result<DynamicImage> {
    let [channels, height, width] = tensor.dims();
    let mode = ImageMode::from_channels(channels)?;
    let values: Vec<f32> = tensor.into_data().to_vec()?;

    let plane = height * width;
    let mut raw = Vec::with_capacity(values.len());
    for idx in 0..plane {
        for c in 0..channels {
            raw.push((values[c * plane + idx] * 255.0 + 0.5).clamp(0.0, 255.0) as u8);
        }
    }

    let (w, h) = (width as u32, height as u32);
    let mismatch = || Error::UnsupportedImage(format!("buffer does not fit {w}x{h}"));
    let img = match mode {
        ImageMode::L => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, raw).ok_or_else(mismatch)?),
        ImageMode::Rgb => DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, raw).ok_or_else(mismatch)?),
        ImageMode::Rgba => DynamicImage::ImageRgba8(RgbaImage::from_raw(w, h, raw).ok_or_else(mismatch)?),
    };
    Ok(img)
}

pub fn save_image<B: Backend>(tensor: Tensor<B, 3>, path: impl AsRef<Path>) -> Result<()> {
    tensor_to_image(tensor)?.save(path)?;
    Ok(())
}

/// Tile a `[N, C, H, W]` batch into rows of `nrow` images separated by 2 black pixels.
pub fn make_grid<B: Backend>(images: Tensor<B, 4>, nrow: usize) -> Tensor<B, 3> {
    const PADDING: usize = 2;

    let [n, channels, height, width] = images.dims();
    let device = images.device();
    let xmaps = nrow.clamp(1, n.max(1));
    let ymaps = n.div_ceil(xmaps);
    let cell_h = height + PADDING;
    let cell_w = width + PADDING;

    let mut grid = Tensor::<B, 3>::zeros(
        [channels, PADDING + ymaps * cell_h, PADDING + xmaps * cell_w],
        &device,
    );
    for k in 0..n {
        let (y, x) = (k / xmaps, k % xmaps);
        let top = y * cell_h + PADDING;
        let left = x * cell_w + PADDING;
        let tile = images.clone().slice([k..k + 1]).reshape([channels, height, width]);
        grid = grid.slice_assign([0..channels, top..top + height, left..left + width], tile);
    }
    grid
}

pub fn save_image_grid<B: Backend>(
    images: Tensor<B, 4>,
    nrow: usize,
    path: impl AsRef<Path>,
) -> Result<()> {
    save_image(make_grid(images, nrow), path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::Rgb;

    type TestBackend = NdArray;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 10) as u8, (y * 10) as u8, 128])
        }))
    }

    #[test]
    fn test_to_chw_is_planar() {
        let img = gradient(2, 1);
        let data = to_chw(&img, ImageMode::Rgb);
        assert_eq!(data.len(), 6);
        assert_eq!(data[0], 0.0);
        assert_eq!(data[1], 10.0 / 255.0);
        assert_eq!(data[4], 128.0 / 255.0);
    }

    #[test]
    fn test_resize_and_center_crop() {
        let img = gradient(20, 10);
        let resized = resize_shorter_edge(&img, 8);
        assert_eq!((resized.width(), resized.height()), (16, 8));
        let cropped = center_crop(&resized, 8);
        assert_eq!((cropped.width(), cropped.height()), (8, 8));
    }

    #[test]
    fn test_crop_to_multiple_keeps_centre() {
        let cropped = crop_to_multiple(&gradient(37, 35), 16);
        assert_eq!((cropped.width(), cropped.height()), (32, 32));
        // left offset (37 - 32) / 2 = 2
        assert_eq!(cropped.to_rgb8().get_pixel(0, 0)[0], 20);
    }

    #[test]
    fn test_unsupported_channel_count() {
        assert!(matches!(ImageMode::from_channels(2), Err(Error::UnsupportedImage(_))));
    }

    #[test]
    fn test_tensor_image_round_trip() {
        let device = Default::default();
        let img = gradient(4, 3);
        let tensor = image_to_tensor::<TestBackend>(&img, ImageMode::Rgb, &device);
        assert_eq!(tensor.dims(), [3, 3, 4]);
        let back = tensor_to_image(tensor).unwrap();
        assert_eq!(back.to_rgb8(), img.to_rgb8());
    }

    #[test]
    fn test_grid_layout() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::ones([4, 1, 3, 3], &device);
        let grid = make_grid(images, 2);
        assert_eq!(grid.dims(), [1, 2 + 2 * 5, 2 + 2 * 5]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let images = Tensor::<TestBackend, 4>::zeros([9, 3, 4, 4], &device);
        save_image_grid(images, 3, &path).unwrap();
        let saved = image::open(&path).unwrap();
        assert_eq!((saved.width(), saved.height()), (20, 20));
    }
}
