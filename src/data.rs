use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{GrayImage, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// One appearance image, its structure image and its identity.
#[derive(Debug, Clone)]
pub struct ReidSample {
    /// Position in the dataset; also the memory bank row.
    pub index: usize,
    /// Contiguous class label.
    pub label: usize,
    pub image_path: PathBuf,
    pub structure_path: PathBuf,
}

/// Person images named `<pid>_<rest>` with structure images of the same
/// name in a parallel directory.
#[derive(Debug, Clone)]
pub struct ReidDataset {
    samples: Vec<ReidSample>,
    num_classes: usize,
}

/// Identity prefix of a file name: `0002_c1s1_000451_03.jpg` -> `2`.
pub fn parse_pid(file_name: &str) -> Option<i64> {
    file_name.split('_').next()?.parse().ok()
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

impl ReidDataset {
    /// Scan `image_dir`. Files without a pid and junk images (negative
    /// pids) are skipped.
    pub fn open(image_dir: &Path, structure_dir: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(image_dir)
            .with_context(|| format!("failed to read {}", image_dir.display()))?
        {
            let path = entry?.path();
            if !is_image(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            match parse_pid(file_name) {
                Some(pid) if pid >= 0 => entries.push((pid, file_name.to_string())),
                _ => continue,
            }
        }
        entries.sort_by(|a, b| a.1.cmp(&b.1));

        let mut label_of = BTreeMap::new();
        for (pid, _) in &entries {
            label_of.entry(*pid).or_insert(0);
        }
        for (label, slot) in label_of.values_mut().enumerate() {
            *slot = label;
        }

        let samples = entries
            .into_iter()
            .enumerate()
            .map(|(index, (pid, file_name))| {
                let structure_path = structure_dir.join(&file_name);
                if !structure_path.exists() {
                    return Err(anyhow::anyhow!(
                        "missing structure image {}",
                        structure_path.display()
                    ));
                }
                Ok(ReidSample {
                    index,
                    label: label_of[&pid],
                    image_path: image_dir.join(&file_name),
                    structure_path,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            samples,
            num_classes: label_of.len(),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn samples(&self) -> &[ReidSample] {
        &self.samples
    }

    pub fn structure_paths(&self) -> Vec<PathBuf> {
        self.samples
            .iter()
            .map(|sample| sample.structure_path.clone())
            .collect()
    }
}

impl Dataset<ReidSample> for ReidDataset {
    fn get(&self, index: usize) -> Option<ReidSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Target size of decoded images.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub height: u32,
    pub width: u32,
}

/// Appearance images, their structures, borrowed novel structures,
/// labels and dataset indices.
#[derive(Clone, Debug)]
pub struct ReidBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub structures: Tensor<B, 4>,
    pub novel_structures: Tensor<B, 4>,
    pub labels: Tensor<B, 1, Int>,
    pub indices: Vec<usize>,
}

/// Build a normalized batch. Each sample gets the structure of a random
/// other entry of `structure_pool` as its novel structure.
pub fn build_batch<B: Backend>(
    samples: &[ReidSample],
    structure_pool: &[PathBuf],
    config: &ImageConfig,
    rng: &mut impl Rng,
    device: &B::Device,
) -> Result<ReidBatch<B>> {
    let batch_size = samples.len();
    let (height, width) = (config.height as usize, config.width as usize);
    let mut images = Vec::with_capacity(batch_size * 3 * height * width);
    let mut structures = Vec::with_capacity(batch_size * height * width);
    let mut novel_structures = Vec::with_capacity(batch_size * height * width);
    let mut labels = Vec::with_capacity(batch_size);
    let mut indices = Vec::with_capacity(batch_size);

    for sample in samples {
        let image = resize_rgb(&load_rgb(&sample.image_path)?, config);
        images.extend(image_to_chw(&image));

        let structure = resize_gray(&load_gray(&sample.structure_path)?, config);
        structures.extend(gray_to_plane(&structure));

        let novel_path = pick_novel(structure_pool, &sample.structure_path, rng)
            .unwrap_or(&sample.structure_path);
        let novel = resize_gray(&load_gray(novel_path)?, config);
        novel_structures.extend(gray_to_plane(&novel));

        labels.push(sample.label as i64);
        indices.push(sample.index);
    }

    let images = Tensor::<B, 4>::from_data(
        TensorData::new(images, [batch_size, 3, height, width]),
        device,
    );
    let structures = Tensor::<B, 4>::from_data(
        TensorData::new(structures, [batch_size, 1, height, width]),
        device,
    );
    let novel_structures = Tensor::<B, 4>::from_data(
        TensorData::new(novel_structures, [batch_size, 1, height, width]),
        device,
    );
    let labels = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

    Ok(ReidBatch {
        images,
        structures,
        novel_structures,
        labels,
        indices,
    })
}

fn pick_novel<'a>(pool: &'a [PathBuf], own: &Path, rng: &mut impl Rng) -> Option<&'a PathBuf> {
    let others: Vec<&PathBuf> = pool.iter().filter(|path| path.as_path() != own).collect();
    if others.is_empty() {
        return None;
    }
    Some(others[rng.gen_range(0..others.len())])
}

#[derive(Clone)]
pub struct ReidBatcher {
    config: ImageConfig,
    structure_pool: Arc<Vec<PathBuf>>,
    rng: Arc<Mutex<StdRng>>,
}

impl ReidBatcher {
    pub fn new(config: ImageConfig, structure_pool: Vec<PathBuf>, seed: u64) -> Self {
        Self {
            config,
            structure_pool: Arc::new(structure_pool),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl<B: Backend> Batcher<B, ReidSample, ReidBatch<B>> for ReidBatcher {
    fn batch(&self, items: Vec<ReidSample>, device: &B::Device) -> ReidBatch<B> {
        let mut rng = self.rng.lock().expect("rng lock poisoned");
        build_batch::<B>(&items, &self.structure_pool, &self.config, &mut *rng, device)
            .expect("failed to build batch")
    }
}

pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8())
}

pub fn load_gray(path: &Path) -> Result<GrayImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_luma8())
}

fn resize_rgb(img: &RgbImage, config: &ImageConfig) -> RgbImage {
    if img.dimensions() == (config.width, config.height) {
        return img.clone();
    }
    image::imageops::resize(img, config.width, config.height, image::imageops::FilterType::CatmullRom)
}

fn resize_gray(img: &GrayImage, config: &ImageConfig) -> GrayImage {
    if img.dimensions() == (config.width, config.height) {
        return img.clone();
    }
    image::imageops::resize(img, config.width, config.height, image::imageops::FilterType::CatmullRom)
}

fn normalize(value: u8) -> f32 {
    (value as f32 / 127.5) - 1.0
}

/// RGB to CHW floats in [-1, 1].
pub fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * width + x) as usize;
        out[idx] = normalize(pixel[0]);
        out[hw + idx] = normalize(pixel[1]);
        out[2 * hw + idx] = normalize(pixel[2]);
    }

    out
}

/// Grayscale to a single [-1, 1] plane.
pub fn gray_to_plane(img: &GrayImage) -> Vec<f32> {
    img.pixels().map(|pixel| normalize(pixel[0])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use image::{Luma, Rgb};

    type TestBackend = NdArray<f32>;

    fn write_fixture(dir: &Path, names: &[&str]) -> (PathBuf, PathBuf) {
        let images = dir.join("images");
        let structures = dir.join("structures");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&structures).unwrap();
        for (idx, name) in names.iter().enumerate() {
            RgbImage::from_pixel(8, 16, Rgb([idx as u8 * 40, 0, 255]))
                .save(images.join(name))
                .unwrap();
            GrayImage::from_pixel(8, 16, Luma([idx as u8 * 60]))
                .save(structures.join(name))
                .unwrap();
        }
        std::fs::write(images.join("notes.txt"), b"skip me").unwrap();
        (images, structures)
    }

    #[test]
    fn pid_is_the_prefix_before_underscore() {
        assert_eq!(parse_pid("0002_c1s1_000451_03.jpg"), Some(2));
        assert_eq!(parse_pid("-1_c3s2_000001_01.jpg"), Some(-1));
        assert_eq!(parse_pid("readme.png"), None);
    }

    #[test]
    fn dataset_remaps_pids_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let (images, structures) = write_fixture(
            dir.path(),
            &["0007_c1.png", "0002_c1.png", "0002_c2.png", "-1_c3.png"],
        );

        let dataset = ReidDataset::open(&images, &structures).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.num_classes(), 2);
        let labels: Vec<usize> = dataset.samples().iter().map(|s| s.label).collect();
        let indices: Vec<usize> = dataset.samples().iter().map(|s| s.index).collect();
        assert_eq!(labels, vec![0, 0, 1]);
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn missing_structure_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (images, structures) = write_fixture(dir.path(), &["0001_c1.png"]);
        std::fs::remove_file(structures.join("0001_c1.png")).unwrap();

        assert!(ReidDataset::open(&images, &structures).is_err());
    }

    #[test]
    fn batcher_emits_normalized_tensors_and_indices() {
        let dir = tempfile::tempdir().unwrap();
        let (images, structures) =
            write_fixture(dir.path(), &["0001_a.png", "0001_b.png", "0004_a.png"]);
        let dataset = ReidDataset::open(&images, &structures).unwrap();
        let batcher = ReidBatcher::new(
            ImageConfig {
                height: 16,
                width: 8,
            },
            dataset.structure_paths(),
            5,
        );

        let batch: ReidBatch<TestBackend> =
            batcher.batch(dataset.samples().to_vec(), &Default::default());

        assert_eq!(batch.images.dims(), [3, 3, 16, 8]);
        assert_eq!(batch.structures.dims(), [3, 1, 16, 8]);
        assert_eq!(batch.novel_structures.dims(), [3, 1, 16, 8]);
        assert_eq!(batch.indices, vec![0, 1, 2]);
        let max = batch.images.clone().max().into_scalar();
        let min = batch.images.min().into_scalar();
        assert!(max <= 1.0 && min >= -1.0);
        let own = batch.structures.into_data().to_vec::<f32>().unwrap();
        let novel = batch.novel_structures.into_data().to_vec::<f32>().unwrap();
        for sample in 0..3 {
            let plane = sample * 16 * 8;
            assert_ne!(own[plane], novel[plane]);
        }
    }
}
