use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Build an index tensor (for `select`, `one_hot`) from host indices.
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let values: Vec<i64> = indices.iter().map(|&idx| idx as i64).collect();
    Tensor::from_data(TensorData::new(values, [indices.len()]), device)
}

/// Read an index tensor back to host indices.
pub fn tensor_to_indices<B: Backend>(indices: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    let values = indices
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|err| anyhow::anyhow!("failed to read index tensor: {err:?}"))?;
    values
        .into_iter()
        .map(|idx| usize::try_from(idx).context("negative sample index"))
        .collect()
}

/// Map [-1, 1] normalized values back to [0, 255].
fn to_pixel(value: f32) -> u8 {
    (((value + 1.0) * 0.5).clamp(0.0, 1.0) * 255.0) as u8
}

/// Convert a BCHW tensor in [-1, 1] to RGB images. Single-channel tensors
/// (structure maps) are rendered as grayscale.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 1 && channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 1 or 3 channels for images, got {channels}"
        ));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read tensor data as f32: {err:?}"))?;
    let hw = height * width;
    let plane = |b: usize, c: usize| b * channels * hw + c.min(channels - 1) * hw;

    let images = (0..batch)
        .map(|b| {
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = y as usize * width + x as usize;
                Rgb([
                    to_pixel(values[plane(b, 0) + idx]),
                    to_pixel(values[plane(b, 1) + idx]),
                    to_pixel(values[plane(b, 2) + idx]),
                ])
            })
        })
        .collect();

    Ok(images)
}

/// Stack equally sized images vertically into one column.
pub fn stack_images_vert(images: &[RgbImage]) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| anyhow::anyhow!("no images to stack"))?;
    let (width, height) = first.dimensions();
    let mut out = RgbImage::new(width, height * images.len() as u32);
    for (row, img) in images.iter().enumerate() {
        out.copy_from(img, 0, row as u32 * height)
            .context("failed to copy image into column")?;
    }
    Ok(out)
}

/// Concatenate images horizontally.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| anyhow::anyhow!("no images to concatenate"))?;
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, first.height());

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)
            .context("failed to concatenate image")?;
        offset_x += img.width();
    }

    Ok(out)
}

/// Save a grid with one column per image kind and one row per sample.
///
/// Every tensor in `columns` must share the batch size and spatial size.
pub fn save_sample_grid<B: Backend>(columns: Vec<Tensor<B, 4>>, path: &Path) -> Result<()> {
    let strips = columns
        .into_iter()
        .map(|tensor| tensor_to_images(tensor).and_then(|images| stack_images_vert(&images)))
        .collect::<Result<Vec<_>>>()?;
    let grid = concat_images_horiz(&strips)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    grid.save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn grayscale_tensor_renders_to_gray_pixels() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::from_floats([[[[-1.0, 1.0]]]], &device);

        let images = tensor_to_images(tensor).unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(images[0].get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(images[0].get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn sample_grid_has_one_column_per_tensor() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.png");
        let a = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 5], &device);
        let b = Tensor::<TestBackend, 4>::zeros([2, 1, 4, 5], &device);

        save_sample_grid(vec![a, b], &path).unwrap();

        let grid = image::open(&path).unwrap().to_rgb8();
        assert_eq!(grid.dimensions(), (10, 8));
    }

    #[test]
    fn index_tensor_round_trips_through_host() {
        let device = Default::default();
        let indices = index_tensor::<TestBackend>(&[3, 0, 7], &device);

        assert_eq!(tensor_to_indices(indices).unwrap(), vec![3, 0, 7]);
    }
}
